//! Content-addressed identity and timestamp normalization.
//!
//! Identity is derived from `content` alone. Earlier revisions of this kind of
//! store folded a sorted metadata digest into the hash; that behavior is
//! deprecated and deliberately not reproduced here, since it made retagging a
//! record change its identity.

use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};

use crate::error::{EngramError, Result};

/// Compute the content_hash of a Memory: lowercase hex SHA-256 of the exact
/// content bytes. Metadata never participates in this computation.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Current time as seconds since the epoch, UTC, with sub-second resolution.
pub fn now() -> f64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    now.as_secs_f64()
}

/// Render epoch seconds as an RFC 3339 string with a `Z` suffix.
pub fn to_rfc3339(epoch_secs: f64) -> String {
    let secs = epoch_secs.trunc() as i64;
    let nanos = ((epoch_secs.fract()) * 1_000_000_000.0).round() as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap())
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Parse a wire timestamp: RFC 3339, or epoch seconds/milliseconds
/// (auto-detected by magnitude: values above 10^12 are treated as
/// milliseconds).
pub fn parse_timestamp(raw: &str) -> Result<f64> {
    let trimmed = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc).timestamp_millis() as f64 / 1000.0);
    }

    if let Ok(n) = trimmed.parse::<f64>() {
        return Ok(if n.abs() > 1.0e12 { n / 1000.0 } else { n });
    }

    Err(EngramError::InvalidInput(format!(
        "unrecognized timestamp: {trimmed}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_depends_only_on_content() {
        let h1 = content_hash("hello world");
        let h2 = content_hash("hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
    }

    #[test]
    fn hash_differs_for_different_content() {
        assert_ne!(content_hash("a"), content_hash("b"));
    }

    #[test]
    fn rfc3339_round_trips_through_parse() {
        let t = now();
        let iso = to_rfc3339(t);
        let parsed = parse_timestamp(&iso).unwrap();
        assert!((parsed - t).abs() < 0.001);
    }

    #[test]
    fn epoch_millis_detected_by_magnitude() {
        let secs = parse_timestamp("1700000000000").unwrap();
        assert!((secs - 1_700_000_000.0).abs() < 0.001);
        let secs2 = parse_timestamp("1700000000").unwrap();
        assert!((secs2 - 1_700_000_000.0).abs() < 0.001);
    }

    #[test]
    fn unparseable_timestamp_is_invalid_input() {
        assert!(parse_timestamp("not a time").is_err());
    }
}
