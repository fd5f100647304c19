//! crates/osiris_core/src/ids.rs
//! Canonical engine ids and hash newtypes. Deterministic, ASCII-only,
//! strict shapes; no I/O.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

/// Errors returned when validating or parsing ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdError {
    NonAscii,
    TooLong,
    BadShape,
}

impl fmt::Display for IdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdError::NonAscii => f.write_str("id must be ASCII"),
            IdError::TooLong => f.write_str("id too long"),
            IdError::BadShape => f.write_str("id has invalid shape"),
        }
    }
}
impl std::error::Error for IdError {}

const MAX_ID_LEN: usize = 256;
const HEX64_LEN: usize = 64;
const SHORT_LEN: usize = 7;
const TOKEN_MAX_LEN: usize = 64;

/// Quickly verify ASCII (no NUL).
#[inline]
fn is_ascii_no_nul(s: &str) -> bool {
    !s.as_bytes().iter().any(|&b| b == 0 || b > 0x7F)
}

/// Lowercase 64-hex (manifest hashes, digests).
#[inline]
pub fn is_hex64(s: &str) -> bool {
    s.len() == HEX64_LEN && s.as_bytes().iter().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

/// Token for step ids and component names: ^[A-Za-z0-9_.-]{1,64}$ (ASCII only).
/// Colons are deliberately excluded; they are reserved for algorithm prefixes,
/// which must never leak into ids, hashes, or filenames.
#[inline]
pub fn is_valid_token(s: &str) -> bool {
    let bs = s.as_bytes();
    let len = bs.len();
    if len == 0 || len > TOKEN_MAX_LEN || !is_ascii_no_nul(s) {
        return false;
    }
    bs.iter().all(|&b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-')
}

/// Slug token: ^[a-z0-9_-]{1,64}$ (pipeline directory names).
#[inline]
pub fn is_valid_slug(s: &str) -> bool {
    let bs = s.as_bytes();
    let len = bs.len();
    if len == 0 || len > TOKEN_MAX_LEN {
        return false;
    }
    bs.iter().all(|&b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}

macro_rules! simple_string_newtype {
    ($(#[$m:meta])* $name:ident) => {
        $(#[$m])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            #[inline] pub fn as_str(&self) -> &str { &self.0 }
        }

        impl fmt::Display for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
        }

        impl TryFrom<&str> for $name {
            type Error = IdError;
            #[inline]
            fn try_from(value: &str) -> Result<Self, Self::Error> { value.parse() }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;
            #[inline]
            fn try_from(value: String) -> Result<Self, Self::Error> { value.parse() }
        }

        impl From<$name> for String {
            #[inline]
            fn from(value: $name) -> String { value.0 }
        }
    }
}

// === Token ids: StepId, PipelineSlug ===

simple_string_newtype!(
    /// Step id token: ^[A-Za-z0-9_.-]{1,64}$
    StepId
);
simple_string_newtype!(
    /// Pipeline slug: ^[a-z0-9_-]{1,64}$, derived from the OML `name`.
    PipelineSlug
);

impl FromStr for StepId {
    type Err = IdError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !is_ascii_no_nul(s) { return Err(IdError::NonAscii); }
        if s.len() > MAX_ID_LEN { return Err(IdError::TooLong); }
        if !is_valid_token(s) { return Err(IdError::BadShape); }
        Ok(StepId(s.to_owned()))
    }
}

impl FromStr for PipelineSlug {
    type Err = IdError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !is_ascii_no_nul(s) { return Err(IdError::NonAscii); }
        if s.len() > MAX_ID_LEN { return Err(IdError::TooLong); }
        if !is_valid_slug(s) { return Err(IdError::BadShape); }
        Ok(PipelineSlug(s.to_owned()))
    }
}

impl PipelineSlug {
    /// Derive a slug from a free-form pipeline name: lowercase ASCII
    /// alphanumerics kept, every other run of characters collapsed to a
    /// single `-`, trimmed, capped at 64 chars. Deterministic.
    pub fn from_name(name: &str) -> Result<Self, IdError> {
        let mut out = String::with_capacity(name.len());
        let mut pending_dash = false;
        for ch in name.chars() {
            let mapped = if ch.is_ascii_alphanumeric() {
                Some(ch.to_ascii_lowercase())
            } else if ch == '_' {
                Some('_')
            } else {
                None
            };
            match mapped {
                Some(c) => {
                    if pending_dash && !out.is_empty() {
                        out.push('-');
                    }
                    pending_dash = false;
                    out.push(c);
                }
                None => pending_dash = true,
            }
        }
        out.truncate(TOKEN_MAX_LEN);
        out.parse()
    }
}

// === Hash newtypes: ManifestHash, ManifestShort ===

simple_string_newtype!(
    /// Pure lowercase 64-hex SHA-256 of the canonical manifest bytes.
    /// No algorithm prefix, ever.
    ManifestHash
);
simple_string_newtype!(
    /// First 7 hex chars of a `ManifestHash`.
    ManifestShort
);

impl FromStr for ManifestHash {
    type Err = IdError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !is_ascii_no_nul(s) { return Err(IdError::NonAscii); }
        if s.len() > MAX_ID_LEN { return Err(IdError::TooLong); }
        if !is_hex64(s) { return Err(IdError::BadShape); }
        Ok(ManifestHash(s.to_owned()))
    }
}

impl ManifestHash {
    #[inline] pub fn as_hex(&self) -> &str { &self.0 }

    /// First 7 hex chars.
    pub fn short(&self) -> ManifestShort {
        ManifestShort(self.0[..SHORT_LEN].to_owned())
    }
}

impl FromStr for ManifestShort {
    type Err = IdError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !is_ascii_no_nul(s) { return Err(IdError::NonAscii); }
        if s.len() != SHORT_LEN { return Err(IdError::BadShape); }
        if !s.as_bytes().iter().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            return Err(IdError::BadShape);
        }
        Ok(ManifestShort(s.to_owned()))
    }
}

// === RunId ===

simple_string_newtype!(
    /// "run_" + compact UTC timestamp "YYYYMMDDTHHMMSSZ" + "_" + 6-hex nonce.
    /// Lexicographic order is chronological for ids minted by one host.
    RunId
);

/// Strict compact UTC timestamp "YYYYMMDDTHHMMSSZ".
#[inline]
fn is_compact_utc_16(ts: &str) -> bool {
    let b = ts.as_bytes();
    if b.len() != 16 { return false; }
    let digits = |r: core::ops::Range<usize>| b[r].iter().all(|c| c.is_ascii_digit());
    digits(0..8) && b[8] == b'T' && digits(9..15) && b[15] == b'Z'
}

#[inline]
fn is_run_shape(s: &str) -> bool {
    // "run_" + ts(16) + "_" + hex6
    if s.len() != 4 + 16 + 1 + 6 { return false; }
    let b = s.as_bytes();
    if &b[0..4] != b"run_" { return false; }
    if !is_compact_utc_16(&s[4..20]) { return false; }
    if b[20] != b'_' { return false; }
    s.as_bytes()[21..].iter().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

impl FromStr for RunId {
    type Err = IdError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !is_ascii_no_nul(s) { return Err(IdError::NonAscii); }
        if s.len() > MAX_ID_LEN { return Err(IdError::TooLong); }
        if !is_run_shape(s) { return Err(IdError::BadShape); }
        Ok(RunId(s.to_owned()))
    }
}

impl RunId {
    /// Assemble a run id from a compact UTC timestamp and a 6-hex nonce.
    pub fn assemble(compact_ts_utc: &str, nonce6: &str) -> Result<Self, IdError> {
        format!("run_{compact_ts_utc}_{nonce6}").parse()
    }

    /// The embedded compact timestamp ("YYYYMMDDTHHMMSSZ").
    #[inline]
    pub fn timestamp_compact(&self) -> &str {
        &self.0[4..20]
    }
}

// === ConnectionRef: "@family.alias" ===

/// Symbolic connection reference. Stays symbolic through compilation;
/// the resolver is invoked only at execution time.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConnectionRef {
    family: String,
    alias: String,
}

impl ConnectionRef {
    #[inline] pub fn family(&self) -> &str { &self.family }
    #[inline] pub fn alias(&self) -> &str { &self.alias }
}

impl fmt::Display for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}.{}", self.family, self.alias)
    }
}

impl FromStr for ConnectionRef {
    type Err = IdError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !is_ascii_no_nul(s) { return Err(IdError::NonAscii); }
        if s.len() > MAX_ID_LEN { return Err(IdError::TooLong); }
        let rest = s.strip_prefix('@').ok_or(IdError::BadShape)?;
        let (family, alias) = rest.split_once('.').ok_or(IdError::BadShape)?;
        if !is_valid_slug(family) || !is_valid_token(alias) || alias.contains('.') {
            return Err(IdError::BadShape);
        }
        Ok(ConnectionRef { family: family.to_owned(), alias: alias.to_owned() })
    }
}

impl TryFrom<String> for ConnectionRef {
    type Error = IdError;
    fn try_from(value: String) -> Result<Self, Self::Error> { value.parse() }
}

impl TryFrom<&str> for ConnectionRef {
    type Error = IdError;
    fn try_from(value: &str) -> Result<Self, Self::Error> { value.parse() }
}

impl From<ConnectionRef> for String {
    fn from(value: ConnectionRef) -> String { value.to_string() }
}

// === Tests ===

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn hash_and_short() {
        assert!(is_hex64(HEX));
        let h: ManifestHash = HEX.parse().unwrap();
        assert_eq!(h.as_hex(), HEX);
        assert_eq!(h.short().as_str(), "0123456");
        assert!("sha256:0123".parse::<ManifestHash>().is_err());
        assert!(HEX.to_uppercase().parse::<ManifestHash>().is_err());
    }

    #[test]
    fn tokens() {
        for ok in ["A", "a", "9", "_", ".", "-", "extract-orders", "db.extractor"] {
            assert!(is_valid_token(ok), "{ok}");
            let _s: StepId = ok.parse().unwrap();
        }
        for bad in ["", " ", "a:b", "é", "a b"] {
            assert!(bad.parse::<StepId>().is_err(), "{bad}");
        }
    }

    #[test]
    fn slug_from_name() {
        assert_eq!(PipelineSlug::from_name("Orders To CSV").unwrap().as_str(), "orders-to-csv");
        assert_eq!(PipelineSlug::from_name("orders_to_csv").unwrap().as_str(), "orders_to_csv");
        assert_eq!(PipelineSlug::from_name("  x  ").unwrap().as_str(), "x");
        assert!(PipelineSlug::from_name("!!!").is_err());
    }

    #[test]
    fn run_id_shape() {
        let id: RunId = "run_20250801T120000Z_0a1b2c".parse().unwrap();
        assert_eq!(id.timestamp_compact(), "20250801T120000Z");
        assert_eq!(RunId::assemble("20250801T120000Z", "0a1b2c").unwrap(), id);
        assert!("run_2025-08-01T12:00:00Z_0a1b2c".parse::<RunId>().is_err());
        assert!("run_20250801T120000Z_0A1B2C".parse::<RunId>().is_err());
    }

    #[test]
    fn connection_refs() {
        let r: ConnectionRef = "@mysql.main".parse().unwrap();
        assert_eq!(r.family(), "mysql");
        assert_eq!(r.alias(), "main");
        assert_eq!(r.to_string(), "@mysql.main");
        for bad in ["mysql.main", "@mysql", "@.main", "@mysql.", "@My SQL.main"] {
            assert!(bad.parse::<ConnectionRef>().is_err(), "{bad}");
        }
    }
}
