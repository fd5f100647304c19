//! Canonical byte forms (osiris_io)
//! - Objects: keys sorted lexicographically (UTF-8 codepoint order)
//! - Arrays: order preserved (caller is responsible for stable ordering)
//! - Canonical JSON: compact, no trailing newline
//! - Canonical YAML: rendered from the key-sorted value, LF endings
//! - Atomic write: temp file in same dir + fsync(temp) + rename; fsync(dir)
//!   on Unix. Fallback: if rename fails (e.g., cross-device), write directly
//!   to target, fsync(target), then remove temp, fsync(dir).

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;

use crate::IoError;

/// Recursively sort object keys to guarantee deterministic serialization.
/// Arrays retain order; numbers/strings/booleans are passed through.
pub fn canonicalize_value(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize_value(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(a) => Value::Array(a.iter().map(canonicalize_value).collect()),
        _ => v.clone(),
    }
}

/// Convert a serde_json `Value` to canonical JSON bytes (compact, sorted
/// keys, no trailing newline).
pub fn to_canonical_json_bytes(v: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(1024);
    write_canonical_value(v, &mut out);
    out
}

/// Convert any `Serialize` into canonical JSON bytes.
pub fn to_canonical_bytes<T: Serialize>(t: &T) -> Result<Vec<u8>, IoError> {
    let v = serde_json::to_value(t)?;
    Ok(to_canonical_json_bytes(&v))
}

/// Render a value as canonical YAML: key-sorted, LF line endings, trailing
/// newline (serde_yaml's own convention). Deterministic for a given value.
pub fn to_canonical_yaml_string(v: &Value) -> Result<String, IoError> {
    let canon = canonicalize_value(v);
    let s = serde_yaml::to_string(&canon)?;
    debug_assert!(!s.contains('\r'), "canonical YAML must use LF endings");
    Ok(s)
}

/// Render any `Serialize` as canonical YAML.
pub fn to_canonical_yaml<T: Serialize>(t: &T) -> Result<String, IoError> {
    let v = serde_json::to_value(t)?;
    to_canonical_yaml_string(&v)
}

/// Write canonical JSON to `path` atomically, with a trailing LF.
pub fn write_canonical_json_file(path: &Path, v: &Value) -> io::Result<()> {
    let mut bytes = to_canonical_json_bytes(v);
    bytes.push(b'\n');
    write_atomic(path, &bytes)
}

/// Write `bytes` to `path` atomically (with safe cross-device fallback).
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    // Ensure parent directory exists.
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(parent)?;

    // Create a unique temp next to the destination (same directory).
    let tmp = make_unique_tmp_path(path);
    let mut tf = OpenOptions::new()
        .write(true)
        .create_new(true) // avoid clobbering another writer's temp
        .open(&tmp)?;

    // Write and fsync the temp file.
    tf.write_all(bytes)?;
    tf.sync_all()?;
    drop(tf);

    // Try atomic rename first.
    match fs::rename(&tmp, path) {
        Ok(()) => {
            // On Unix, also fsync the directory to persist the rename.
            let _ = fsync_dir(parent);
            Ok(())
        }
        Err(_e) => {
            // Fallback: write directly to the target (handles cross-device cases).
            let res: io::Result<()> = (|| {
                let mut f = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)?;
                f.write_all(bytes)?;
                f.sync_all()?;
                Ok(())
            })();

            if let Err(err) = res {
                let _ = fs::remove_file(&tmp); // best-effort cleanup on error
                return Err(err);
            }

            // Best-effort cleanup of the temp file on success.
            let _ = fs::remove_file(&tmp);

            // On Unix, fsync the directory as well.
            let _ = fsync_dir(parent);
            Ok(())
        }
    }
}

fn write_canonical_value(v: &Value, out: &mut Vec<u8>) {
    match v {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(b) => {
            if *b {
                out.extend_from_slice(b"true");
            } else {
                out.extend_from_slice(b"false");
            }
        }
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => {
            // serde_json produces a correctly escaped JSON string literal.
            let quoted = serde_json::to_string(s).expect("string serialization cannot fail");
            out.extend_from_slice(quoted.as_bytes());
        }
        Value::Array(arr) => {
            out.push(b'[');
            let mut first = true;
            for elem in arr {
                if !first {
                    out.push(b',');
                }
                first = false;
                write_canonical_value(elem, out);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            out.push(b'{');
            let mut keys: Vec<&str> = map.keys().map(|k| k.as_str()).collect();
            keys.sort_unstable();
            let mut first = true;
            for k in keys {
                if !first {
                    out.push(b',');
                }
                first = false;
                let quoted_key = serde_json::to_string(k).expect("key serialization cannot fail");
                out.extend_from_slice(quoted_key.as_bytes());
                out.push(b':');
                write_canonical_value(&map[k], out);
            }
            out.push(b'}');
        }
    }
}

/// Create a unique temp path next to `target`: "<filename>.<pid>.<counter>.tmp"
fn make_unique_tmp_path(target: &Path) -> PathBuf {
    use std::ffi::OsString;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let pid = std::process::id();
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);

    let fname = target
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("file");

    let tmp_name: OsString = OsString::from(format!("{fname}.{pid}.{n}.tmp"));

    match target.parent() {
        Some(dir) => dir.join(tmp_name),
        None => PathBuf::from(tmp_name),
    }
}

/// Fsync the directory containing the file (Unix only). No-op on other platforms.
#[cfg(unix)]
fn fsync_dir(dir: &Path) -> io::Result<()> {
    let df = OpenOptions::new().read(true).open(dir)?;
    df.sync_all()
}

#[cfg(not(unix))]
#[inline]
fn fsync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
