// crates/osiris_cli/src/main.rs
//
// Osiris CLI entrypoint. Thin command surface over the compiler, runtime,
// index, and AIOP crates; strictly offline apart from what drivers do.
//
// Exit codes: 0 success; 2 usage error (clap); 3 validation error;
// 4 AIOP truncation warning (run completed); 5 remote transport/timeout;
// 1 generic internal error.

mod args;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;

use args::{AiopCmd, Cli, Command, IndexCmd};
use osiris_aiop::policy::{PolicyOverrides, SchemaMode, TimelineDensity};
use osiris_aiop::{AiopPolicy, ExportInputs, ExportPolicy};
use osiris_compiler::{compile, validate_oml, CompileError, CompileOptions, ValidationReport};
use osiris_io::connections::{ConnectionResolver, ConnectionsFile, EnvSource, ProcessEnv};
use osiris_io::fs_contract::FilesystemContract;
use osiris_io::registry::Registry;
use osiris_io::run_index::{RunIndexReader, RunRecord, RunStatus};
use osiris_runtime::remote::proxy::RemoteConfig;
use osiris_runtime::remote::sandbox::SubprocessLauncher;
use osiris_runtime::remote::worker;
use osiris_runtime::{ExecError, ExecutionAdapter, ExecutionContext, RemoteError};

const EXIT_OK: u8 = 0;
const EXIT_INTERNAL: u8 = 1;
const EXIT_USAGE: u8 = 2;
const EXIT_VALIDATION: u8 = 3;
const EXIT_TRUNCATION: u8 = 4;
const EXIT_REMOTE: u8 = 5;

fn main() -> ExitCode {
    // Diagnostics go to stderr; stdout stays contractual (paths, hashes,
    // listings, and, for the worker, RPC frames).
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("osiris: error: {e}");
            ExitCode::from(EXIT_INTERNAL)
        }
    }
}

fn dispatch(cli: Cli) -> Result<u8, String> {
    match &cli.command {
        Command::Compile { oml, profile } => cmd_compile(&cli, oml, profile.clone()),
        Command::Run { last_compile, manifest, pipeline, remote, env_file, no_aiop } => cmd_run(
            &cli,
            *last_compile,
            manifest.as_deref(),
            pipeline.as_deref(),
            *remote,
            env_file.as_deref(),
            *no_aiop,
        ),
        Command::Validate { oml } => cmd_validate(&cli, oml),
        Command::Index { cmd } => cmd_index(&cli, cmd),
        Command::Aiop { cmd } => cmd_aiop(&cli, cmd),
        Command::Worker { package, heartbeat_ms } => cmd_worker(package, *heartbeat_ms),
    }
}

/* ---------------- shared wiring ---------------- */

/// Env layered as --env-file entries over the process environment.
struct LayeredEnv {
    file: BTreeMap<String, String>,
}

impl EnvSource for LayeredEnv {
    fn get(&self, name: &str) -> Option<String> {
        self.file.get(name).cloned().or_else(|| ProcessEnv.get(name))
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")).join(path)
    }
}

struct Engine {
    fsc: FilesystemContract,
    registry: Arc<Registry>,
    resolver: Arc<ConnectionResolver>,
}

fn build_engine(cli: &Cli) -> Result<Engine, String> {
    let base = absolute(cli.base_path.as_deref().unwrap_or(Path::new(".")));
    let fsc = FilesystemContract::from_std_path(&base).map_err(|e| e.to_string())?;

    let components = cli
        .components
        .clone()
        .unwrap_or_else(|| base.join("components"));
    let registry = if components.is_dir() {
        Registry::load(&components).map_err(|e| e.to_string())?
    } else {
        Registry::empty(&components)
    };

    let connections = cli
        .connections
        .clone()
        .unwrap_or_else(|| base.join("connections.yaml"));
    let file = if connections.is_file() {
        ConnectionsFile::load(&connections).map_err(|e| e.to_string())?
    } else {
        ConnectionsFile::default()
    };

    let engine = Engine {
        fsc,
        registry: Arc::new(registry),
        resolver: Arc::new(ConnectionResolver::new(file)),
    };
    tracing::debug!(
        base = %engine.fsc.base(),
        components = engine.registry.names().len(),
        "engine root resolved"
    );
    Ok(engine)
}

fn execution_context(engine: &Engine, env_file: Option<&Path>) -> Result<ExecutionContext, String> {
    let file = match env_file {
        None => BTreeMap::new(),
        Some(path) => parse_env_file(path)?,
    };
    Ok(ExecutionContext {
        fsc: engine.fsc.clone(),
        registry: Arc::clone(&engine.registry),
        drivers: Arc::new(osiris_drivers::builtin_registry()),
        resolver: Arc::clone(&engine.resolver),
        env: Arc::new(LayeredEnv { file }),
    })
}

fn parse_env_file(path: &Path) -> Result<BTreeMap<String, String>, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read env file {}: {e}", path.display()))?;
    let mut out = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(format!("bad env file line (expect KEY=VALUE): {line}"));
        };
        out.insert(key.trim().to_owned(), value.trim().to_owned());
    }
    Ok(out)
}

fn load_oml(path: &Path) -> Result<serde_json::Value, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read OML {}: {e}", path.display()))?;
    // YAML is a superset of JSON; one parser covers both input forms.
    serde_yaml::from_str(&text).map_err(|e| format!("cannot parse OML {}: {e}", path.display()))
}

fn print_report(report: &ValidationReport) {
    for issue in &report.errors {
        eprintln!("osiris: error[{}] {}: {}", issue.code, issue.location, issue.message);
    }
    for issue in &report.warnings {
        eprintln!("osiris: warning[{}] {}: {}", issue.code, issue.location, issue.message);
    }
}

/* ---------------- commands ---------------- */

fn cmd_compile(cli: &Cli, oml: &Path, profile: Option<String>) -> Result<u8, String> {
    let engine = build_engine(cli)?;
    let raw = load_oml(oml)?;
    let opts = CompileOptions { profile, ..CompileOptions::now() };

    match compile(&raw, &engine.registry, &engine.resolver, &engine.fsc, &opts) {
        Ok(compiled) => {
            println!("osiris: manifest {}", compiled.manifest_path);
            println!("osiris: manifest_hash {}", compiled.hash);
            Ok(EXIT_OK)
        }
        Err(CompileError::ValidationFailed(report)) => {
            print_report(&report);
            Ok(EXIT_VALIDATION)
        }
        Err(e) => Err(e.to_string()),
    }
}

fn cmd_validate(cli: &Cli, oml: &Path) -> Result<u8, String> {
    let engine = build_engine(cli)?;
    let raw = load_oml(oml)?;
    let report = validate_oml(&raw, &engine.registry, &engine.resolver);
    print_report(&report);
    if report.ok {
        println!("osiris: ok");
        Ok(EXIT_OK)
    } else {
        Ok(EXIT_VALIDATION)
    }
}

fn resolve_manifest_path(
    engine: &Engine,
    last_compile: bool,
    manifest: Option<&Path>,
    pipeline: Option<&str>,
) -> Result<Utf8PathBuf, String> {
    if let Some(path) = manifest {
        let abs = absolute(path);
        return Utf8PathBuf::from_path_buf(abs).map_err(|p| format!("non-UTF-8 path: {}", p.display()));
    }
    if !last_compile {
        return Err("one of --manifest or --last-compile is required".into());
    }

    let latest_dir = engine.fsc.index_dir().join("latest");
    let pointer = match pipeline {
        Some(slug) => {
            let slug = slug.parse().map_err(|e| format!("bad pipeline slug: {e}"))?;
            engine.fsc.latest_pointer_path(&slug)
        }
        None => {
            let mut pointers: Vec<PathBuf> = match std::fs::read_dir(latest_dir.as_std_path()) {
                Ok(entries) => entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("txt"))
                    .collect(),
                Err(_) => Vec::new(),
            };
            pointers.sort();
            match pointers.len() {
                0 => return Err("nothing compiled yet under this base path".into()),
                1 => Utf8PathBuf::from_path_buf(pointers.remove(0))
                    .map_err(|p| format!("non-UTF-8 path: {}", p.display()))?,
                _ => {
                    return Err(
                        "several pipelines compiled here; disambiguate with --pipeline <slug>".into(),
                    )
                }
            }
        }
    };
    let text = std::fs::read_to_string(pointer.as_std_path())
        .map_err(|e| format!("cannot read latest pointer {pointer}: {e}"))?;
    Ok(Utf8PathBuf::from(text.trim().to_owned()))
}

#[allow(clippy::too_many_arguments)]
fn cmd_run(
    cli: &Cli,
    last_compile: bool,
    manifest: Option<&Path>,
    pipeline: Option<&str>,
    remote: bool,
    env_file: Option<&Path>,
    no_aiop: bool,
) -> Result<u8, String> {
    let engine = build_engine(cli)?;
    let manifest_path = match resolve_manifest_path(&engine, last_compile, manifest, pipeline) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("osiris: error: {e}");
            return Ok(EXIT_USAGE);
        }
    };
    let ctx = execution_context(&engine, env_file)?;

    let adapter = if remote {
        let launcher = SubprocessLauncher::current_exe().map_err(|e| e.to_string())?;
        ExecutionAdapter::Remote(RemoteConfig::new(Arc::new(launcher)))
    } else {
        ExecutionAdapter::Local
    };
    tracing::info!(manifest = %manifest_path, remote, "starting run");

    let collected = match adapter.run(&manifest_path, &ctx) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("osiris: error: {e}");
            return Ok(run_error_code(&e));
        }
    };

    let record = &collected.record;
    println!("osiris: run {}", record.run_id);
    println!("osiris: status {}", record.status.as_str());
    println!("osiris: total_rows {}", record.total_rows);
    println!("osiris: events {}", collected.events_path);

    let mut truncated = false;
    if !no_aiop {
        let policy = AiopPolicy::from_process_env(&PolicyOverrides::default(), config_file(&engine).as_deref());
        let inputs = ExportInputs { fsc: &engine.fsc, record, registry: Some(&engine.registry) };
        match osiris_aiop::export(&inputs, &policy) {
            Ok(outcome) => {
                println!("osiris: aiop {}", outcome.summary_path);
                truncated = !outcome.truncated.is_empty();
            }
            Err(e) => eprintln!("osiris: warning: aiop export failed: {e}"),
        }
    }

    Ok(match record.status {
        RunStatus::Completed if truncated => EXIT_TRUNCATION,
        RunStatus::Completed => EXIT_OK,
        RunStatus::Failed | RunStatus::Cancelled => {
            match collected.fatal.as_ref().map(|f| f.kind.as_str()) {
                Some("remote_timeout" | "remote_transport_lost" | "sandbox_create_failed") => EXIT_REMOTE,
                _ => EXIT_INTERNAL,
            }
        }
    })
}

fn run_error_code(e: &ExecError) -> u8 {
    match e {
        ExecError::Remote(RemoteError::RemoteTimeout(_))
        | ExecError::Remote(RemoteError::RemoteTransportLost(_))
        | ExecError::Remote(RemoteError::SandboxCreateFailed(_)) => EXIT_REMOTE,
        _ => EXIT_INTERNAL,
    }
}

fn config_file(engine: &Engine) -> Option<PathBuf> {
    let path = engine.fsc.base().as_std_path().join("osiris.yaml");
    path.is_file().then_some(path)
}

fn cmd_index(cli: &Cli, cmd: &IndexCmd) -> Result<u8, String> {
    let engine = build_engine(cli)?;
    let reader = RunIndexReader::new(&engine.fsc);
    match cmd {
        IndexCmd::List => {
            for record in reader.list_all().map_err(|e| e.to_string())? {
                println!(
                    "{} {} {} {} rows={} {}ms",
                    record.run_id,
                    record.status.as_str(),
                    record.pipeline_slug,
                    record.manifest_short,
                    record.total_rows,
                    record.duration_ms,
                );
            }
            Ok(EXIT_OK)
        }
        IndexCmd::Show { run } => {
            let run_id = run.parse().map_err(|e| format!("bad run id: {e}"))?;
            match reader.find_by_run_id(&run_id).map_err(|e| e.to_string())? {
                Some(record) => {
                    let pretty = serde_json::to_string_pretty(&record).map_err(|e| e.to_string())?;
                    println!("{pretty}");
                    Ok(EXIT_OK)
                }
                None => {
                    eprintln!("osiris: error: no such run: {run}");
                    Ok(EXIT_USAGE)
                }
            }
        }
    }
}

fn cmd_aiop(cli: &Cli, cmd: &AiopCmd) -> Result<u8, String> {
    let engine = build_engine(cli)?;
    let reader = RunIndexReader::new(&engine.fsc);
    let AiopCmd::Export {
        last,
        run,
        format,
        policy,
        max_core_bytes,
        timeline_density,
        metrics_topk,
        schema_mode,
        gzip_annex,
    } = cmd;

    let record: RunRecord = if *last {
        match reader.last_run().map_err(|e| e.to_string())? {
            Some(r) => r,
            None => {
                eprintln!("osiris: error: no runs recorded yet");
                return Ok(EXIT_USAGE);
            }
        }
    } else if let Some(run) = run {
        let run_id = run.parse().map_err(|e| format!("bad run id: {e}"))?;
        match reader.find_by_run_id(&run_id).map_err(|e| e.to_string())? {
            Some(r) => r,
            None => {
                eprintln!("osiris: error: no such run: {run}");
                return Ok(EXIT_USAGE);
            }
        }
    } else {
        eprintln!("osiris: error: one of --last or --run is required");
        return Ok(EXIT_USAGE);
    };

    let overrides = PolicyOverrides {
        max_core_bytes: *max_core_bytes,
        timeline_density: timeline_density.as_deref().and_then(TimelineDensity::parse),
        metrics_topk: *metrics_topk,
        schema_mode: schema_mode.as_deref().and_then(SchemaMode::parse),
        policy: policy.as_deref().and_then(ExportPolicy::parse),
        annex_gzip: gzip_annex.then_some(true),
    };
    let resolved = AiopPolicy::from_process_env(&overrides, config_file(&engine).as_deref());
    let inputs = ExportInputs { fsc: &engine.fsc, record: &record, registry: Some(&engine.registry) };
    let outcome = osiris_aiop::export(&inputs, &resolved).map_err(|e| e.to_string())?;

    match format.as_str() {
        "md" => println!("{}", outcome.run_card_path),
        _ => println!("{}", outcome.summary_path),
    }
    Ok(if outcome.truncated.is_empty() { EXIT_OK } else { EXIT_TRUNCATION })
}

fn cmd_worker(package: &Path, heartbeat_ms: u64) -> Result<u8, String> {
    let drivers = Arc::new(osiris_drivers::builtin_registry());
    tracing::debug!(package = %package.display(), heartbeat_ms, "worker serving on stdio");
    worker::serve(
        package,
        drivers,
        std::io::stdin(),
        std::io::stdout(),
        std::time::Duration::from_millis(heartbeat_ms),
    )
    .map_err(|e| e.to_string())?;
    Ok(EXIT_OK)
}
