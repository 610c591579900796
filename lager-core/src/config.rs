//! Config loader (C7): parses `lager.cfg`'s JSON object into a
//! [`RuntimeConfig`], using the token scanner in [`crate::json`].
//!
//! Keys are matched case-insensitively against the enumerated set in §4.7;
//! a type mismatch on a recognised key, or an object at the top level
//! missing entirely, is reported as an error for the caller to turn into a
//! panic (§7, §8) — this module never panics itself, so it stays
//! host-testable against every scenario in §8 without an indicator or a
//! filesystem in scope.

use crate::json::{self, Token, TokenKind};
use crate::{Error, Result};
use heapless::String;

/// The populated form of the recognised config keys (§4.7), with defaults
/// filled in before parsing so a config file that omits a key leaves the
/// default untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub startup_morse: String<64>,
    pub use_spi: bool,
    pub baud_rate: u32,
    pub prealloc_bytes: u32,
    pub prealloc_grow: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            startup_morse: String::new(),
            use_spi: false,
            baud_rate: 230_400,
            prealloc_bytes: 0,
            prealloc_grow: true,
        }
    }
}

/// The compiled-in default `lager.cfg` contents, written verbatim when no
/// config file exists yet (§4.7, §8: "Missing `lager.cfg` → default
/// contents written; subsequent boot parses them without panic").
pub const DEFAULT_CONFIG: &[u8] =
    br#"{"startupMorse":"","useSPI":false,"baudRate":230400,"preallocBytes":0,"preallocGrow":true}"#;

/// Counts how many flat tokens `tokens[idx]`'s subtree occupies (itself
/// plus every descendant), so a caller can skip an unrecognised value
/// without interpreting its contents — the flat-array analogue of
/// `child_count`-guided traversal described in §4.7.
fn subtree_len(tokens: &[Token], idx: usize) -> usize {
    let tok = tokens[idx];
    match tok.kind {
        TokenKind::Object | TokenKind::Array => {
            let mut total = 1;
            let mut child = idx + 1;
            for _ in 0..tok.child_count {
                let sz = subtree_len(tokens, child);
                total += sz;
                child += sz;
            }
            total
        }
        TokenKind::String | TokenKind::Primitive => 1,
    }
}

/// `baudRate`/`preallocBytes` are unsigned in `RuntimeConfig`; `parse_int`
/// returns a signed value, so negative and overflowing results are rejected
/// here rather than silently wrapped into an unrelated `u32` by `as u32`.
fn as_u32(v: i64) -> Result<u32> {
    u32::try_from(v).map_err(|_| Error::ConfigKeyTypeMismatch)
}

fn key_eq(src: &[u8], tok: &Token, name: &str) -> bool {
    let text = tok.text(src);
    text.len() == name.len() && text.iter().zip(name.as_bytes()).all(|(a, b)| a.eq_ignore_ascii_case(b))
}

/// Parses `src` (the raw bytes of `lager.cfg`) into a [`RuntimeConfig`],
/// starting from [`RuntimeConfig::default`].
pub fn parse(src: &[u8]) -> Result<RuntimeConfig> {
    let mut tokens: heapless::Vec<Token, 256> = heapless::Vec::new();
    json::scan(src, &mut tokens)?;
    if tokens.is_empty() || tokens[0].kind != TokenKind::Object {
        return Err(Error::ConfigMalformed);
    }

    let mut cfg = RuntimeConfig::default();
    let pairs = tokens[0].child_count / 2;
    let mut idx = 1usize;
    for _ in 0..pairs {
        let key_tok = tokens[idx];
        if key_tok.kind != TokenKind::String {
            return Err(Error::ConfigMalformed);
        }
        let value_idx = idx + 1;
        let value_tok = tokens[value_idx];

        if key_eq(src, &key_tok, "startupMorse") {
            if value_tok.kind != TokenKind::String {
                return Err(Error::ConfigKeyTypeMismatch);
            }
            let text = core::str::from_utf8(value_tok.text(src)).map_err(|_| Error::ConfigMalformed)?;
            let mut s: String<64> = String::new();
            s.push_str(text).map_err(|_| Error::ConfigMalformed)?;
            cfg.startup_morse = s;
        } else if key_eq(src, &key_tok, "useSPI") {
            if value_tok.kind != TokenKind::Primitive {
                return Err(Error::ConfigKeyTypeMismatch);
            }
            let v = json::parse_bool(value_tok.text(src))
                .map_err(|_| Error::ConfigKeyTypeMismatch)?;
            if v {
                return Err(Error::ConfigUnsupported);
            }
            cfg.use_spi = v;
        } else if key_eq(src, &key_tok, "baudRate") {
            if value_tok.kind != TokenKind::Primitive {
                return Err(Error::ConfigKeyTypeMismatch);
            }
            let v = json::parse_int(value_tok.text(src))
                .map_err(|_| Error::ConfigKeyTypeMismatch)?;
            cfg.baud_rate = as_u32(v)?;
        } else if key_eq(src, &key_tok, "preallocBytes") {
            if value_tok.kind != TokenKind::Primitive {
                return Err(Error::ConfigKeyTypeMismatch);
            }
            let v = json::parse_int(value_tok.text(src))
                .map_err(|_| Error::ConfigKeyTypeMismatch)?;
            cfg.prealloc_bytes = as_u32(v)?;
        } else if key_eq(src, &key_tok, "preallocGrow") {
            if value_tok.kind != TokenKind::Primitive {
                return Err(Error::ConfigKeyTypeMismatch);
            }
            cfg.prealloc_grow = json::parse_bool(value_tok.text(src))
                .map_err(|_| Error::ConfigKeyTypeMismatch)?;
        }
        // unrecognised keys: fall through and skip the value below.

        idx = value_idx + subtree_len(&tokens, value_idx);
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_contents_parse_without_error() {
        parse(DEFAULT_CONFIG).unwrap();
    }

    #[test]
    fn recognised_keys_populate_runtime_config() {
        let cfg = parse(br#"{"baudRate":115200,"preallocBytes":65536,"preallocGrow":true}"#).unwrap();
        assert_eq!(cfg.baud_rate, 115200);
        assert_eq!(cfg.prealloc_bytes, 65536);
        assert!(cfg.prealloc_grow);
    }

    #[test]
    fn use_spi_true_is_rejected() {
        let err = parse(br#"{"useSPI":true}"#).unwrap_err();
        assert_eq!(err, Error::ConfigUnsupported);
    }

    #[test]
    fn type_mismatch_on_baud_rate_errors() {
        let err = parse(br#"{"baudRate":"fast"}"#).unwrap_err();
        assert_eq!(err, Error::ConfigKeyTypeMismatch);
    }

    #[test]
    fn negative_baud_rate_is_rejected() {
        let err = parse(br#"{"baudRate":-9600}"#).unwrap_err();
        assert_eq!(err, Error::ConfigKeyTypeMismatch);
    }

    #[test]
    fn startup_morse_is_captured() {
        let cfg = parse(br#"{"startupMorse":"HI "}"#).unwrap();
        assert_eq!(cfg.startup_morse.as_str(), "HI ");
    }

    #[test]
    fn unrecognised_keys_are_skipped_even_when_nested() {
        let cfg = parse(br#"{"future":{"a":1,"b":[1,2,3]},"baudRate":9600}"#).unwrap();
        assert_eq!(cfg.baud_rate, 9600);
    }

    #[test]
    fn keys_are_matched_case_insensitively() {
        let cfg = parse(br#"{"BAUDRATE":4800}"#).unwrap();
        assert_eq!(cfg.baud_rate, 4800);
    }
}
