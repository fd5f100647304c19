// crates/osiris_cli/src/args.rs
//
// Deterministic, offline CLI argument surface.
// - stdout carries only contractual output (paths, hashes, listings);
//   diagnostics go to stderr/tracing
// - every path resolves against an explicit --base-path (default: cwd)
// - the `worker` subcommand is the hidden sandbox side of remote execution

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "osiris", about = "Deterministic pipeline compiler and runtime", version)]
pub struct Cli {
    /// Engine root for build/, .osiris/, aiop/, logs/ (default: cwd).
    #[arg(long, global = true)]
    pub base_path: Option<PathBuf>,

    /// Component spec directory (default: <base>/components).
    #[arg(long, global = true)]
    pub components: Option<PathBuf>,

    /// Connections file (default: <base>/connections.yaml).
    #[arg(long, global = true)]
    pub connections: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Compile an OML document into a fingerprinted manifest.
    Compile {
        oml: PathBuf,
        /// Overrides the document's profile.
        #[arg(long)]
        profile: Option<String>,
    },

    /// Execute a compiled manifest (locally, or remotely with --remote).
    Run {
        /// Run the most recently compiled manifest.
        #[arg(long, conflicts_with = "manifest")]
        last_compile: bool,
        /// Manifest file to execute.
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Pipeline slug for --last-compile when more than one pipeline has
        /// been compiled under this base path.
        #[arg(long)]
        pipeline: Option<String>,
        /// Execute inside a sandboxed worker via the transparent proxy.
        #[arg(long)]
        remote: bool,
        /// KEY=VALUE lines consulted before the process environment when
        /// resolving ${ENV} connection placeholders.
        #[arg(long)]
        env_file: Option<PathBuf>,
        /// Skip the post-run AIOP export.
        #[arg(long)]
        no_aiop: bool,
    },

    /// Validate an OML document (exit 0 iff ok).
    Validate { oml: PathBuf },

    /// Read the run index.
    Index {
        #[command(subcommand)]
        cmd: IndexCmd,
    },

    /// AI Operation Package operations.
    Aiop {
        #[command(subcommand)]
        cmd: AiopCmd,
    },

    /// Sandbox-side worker (spawned by the remote proxy; speaks the framed
    /// RPC protocol on stdin/stdout).
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        package: PathBuf,
        #[arg(long, default_value_t = 5000)]
        heartbeat_ms: u64,
    },
}

#[derive(Debug, Subcommand)]
pub enum IndexCmd {
    /// List all runs, oldest first.
    List,
    /// Show one run record as JSON.
    Show {
        #[arg(long)]
        run: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum AiopCmd {
    /// Export the AIOP for a run; prints the path of the chosen artifact.
    Export {
        /// Export the most recent run.
        #[arg(long, conflicts_with = "run")]
        last: bool,
        /// Export a specific run id.
        #[arg(long)]
        run: Option<String>,
        /// Which artifact path to print: the JSON summary or the markdown card.
        #[arg(long, value_parser = ["json", "md"], default_value = "json")]
        format: String,
        /// Annex policy: bound the core only, or always write annex shards.
        #[arg(long, value_parser = ["core", "annex"])]
        policy: Option<String>,
        #[arg(long)]
        max_core_bytes: Option<usize>,
        #[arg(long, value_parser = ["minimal", "medium", "verbose"])]
        timeline_density: Option<String>,
        #[arg(long)]
        metrics_topk: Option<usize>,
        #[arg(long, value_parser = ["compact", "full"])]
        schema_mode: Option<String>,
        /// Gzip annex shards.
        #[arg(long)]
        gzip_annex: bool,
    },
}
