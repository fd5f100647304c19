//! SHA-256 hashing utilities over **canonical bytes**, plus the manifest
//! hash normalization contract.
//!
//! Deterministic: same canonical structure ⇒ same lowercase 64-hex across
//! OS/arch. Manifest hashes are **pure hex** everywhere in this engine -
//! `normalize_manifest_hash` exists to tolerate legacy inputs on read; no
//! algorithm prefix ever reaches a filename or an index record.

#![forbid(unsafe_code)]

use digest::Digest;
use serde::Serialize;
use sha2::Sha256;

use crate::canonical::to_canonical_bytes;
use crate::IoError;

pub use osiris_core::ids::is_hex64;

/// Compute lowercase 64-hex SHA-256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let out = hasher.finalize();
    hex::encode(out) // lowercase
}

/// Streaming SHA-256 for any reader; returns lowercase 64-hex.
pub fn sha256_stream<R: std::io::Read>(reader: &mut R) -> Result<String, IoError> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024]; // 64 KiB
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of the canonical JSON representation (sorted keys); lowercase 64-hex.
pub fn sha256_canonical<T: Serialize>(value: &T) -> Result<String, IoError> {
    let bytes = to_canonical_bytes(value)?;
    Ok(sha256_hex(&bytes))
}

/// Convenience: hash a file from disk; returns lowercase 64-hex.
pub fn sha256_file<P: AsRef<std::path::Path>>(path: P) -> Result<String, IoError> {
    let mut f = std::fs::File::open(path)?;
    sha256_stream(&mut f)
}

/// Return a short prefix of a 64-hex string (1..=64). Errors if non-hex or
/// out of range.
pub fn short_hex(full_hex: &str, len: usize) -> Result<String, IoError> {
    if !(1..=64).contains(&len) {
        return Err(IoError::Hash("short_hex length out of range".into()));
    }
    if !is_hex64(full_hex) {
        return Err(IoError::Hash("short_hex expects lowercase 64-hex".into()));
    }
    Ok(full_hex[..len].to_string())
}

/// Normalize a manifest hash to pure lowercase 64-hex.
///
/// Tolerated legacy shapes on input:
/// - `sha256:<hex64>` (algorithm prefix)
/// - `sha256<hex64>`  (algorithm concatenation)
/// - uppercase hex
///
/// Idempotent; anything else is `IoError::Hash`. Writers must never rely on
/// this to launder bad data: they reject non-pure input outright.
pub fn normalize_manifest_hash(s: &str) -> Result<String, IoError> {
    let trimmed = s.trim();
    let stripped = if let Some((algo, rest)) = trimmed.split_once(':') {
        if !algo.eq_ignore_ascii_case("sha256") {
            return Err(IoError::Hash(format!("unknown hash algorithm prefix: {algo}")));
        }
        rest
    } else if trimmed.len() == "sha256".len() + 64 {
        match trimmed.get(.."sha256".len()) {
            Some(p) if p.eq_ignore_ascii_case("sha256") => &trimmed["sha256".len()..],
            _ => trimmed,
        }
    } else {
        trimmed
    };
    let lower = stripped.to_ascii_lowercase();
    if !is_hex64(&lower) {
        return Err(IoError::Hash(format!("not a 64-hex manifest hash: {stripped}")));
    }
    Ok(lower)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HEX: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn sha256_known_vector() {
        // sha256("test")
        assert_eq!(sha256_hex(b"test"), HEX);
    }

    #[test]
    fn canonical_hash_ignores_key_order() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(sha256_canonical(&a).unwrap(), sha256_canonical(&b).unwrap());
    }

    #[test]
    fn normalize_tolerates_legacy_and_is_idempotent() {
        let prefixed = format!("sha256:{HEX}");
        let concatenated = format!("sha256{HEX}");
        assert_eq!(normalize_manifest_hash(&prefixed).unwrap(), HEX);
        assert_eq!(normalize_manifest_hash(&concatenated).unwrap(), HEX);
        assert_eq!(normalize_manifest_hash(&HEX.to_uppercase()).unwrap(), HEX);
        let once = normalize_manifest_hash(HEX).unwrap();
        assert_eq!(normalize_manifest_hash(&once).unwrap(), once);
    }

    #[test]
    fn normalize_rejects_garbage() {
        assert!(normalize_manifest_hash("md5:abcd").is_err());
        assert!(normalize_manifest_hash("deadbeef").is_err());
        assert!(normalize_manifest_hash(&format!("sha256:{}", &HEX[..10])).is_err());
    }

    #[test]
    fn short_hex_bounds() {
        assert_eq!(short_hex(HEX, 7).unwrap(), &HEX[..7]);
        assert!(short_hex(HEX, 0).is_err());
        assert!(short_hex("nothex", 7).is_err());
    }

}
