//! The query engine (spec §4.10): natural-language time parsing, similarity
//! rescaling, and the tie-break order shared by every backend's semantic and
//! similarity searches.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};

use crate::error::{EngramError, Result};
use crate::types::{Memory, MemoryQueryResult};

/// An inclusive `[start, end]` range in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

/// Rescale raw cosine similarity (`[-1, 1]`) to the wire-facing `[0, 1]`
/// `similarity_score` (spec §4.10).
pub fn rescale_similarity(cosine: f32) -> f32 {
    ((cosine + 1.0) / 2.0).clamp(0.0, 1.0)
}

/// Sort `MemoryQueryResult`s per I7: `similarity_score` descending, ties
/// broken by `created_at` descending, then `content_hash` ascending.
pub fn sort_query_results(results: &mut [MemoryQueryResult]) {
    results.sort_by(|a, b| {
        b.similarity_score
            .partial_cmp(&a.similarity_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.memory
                    .created_at
                    .partial_cmp(&a.memory.created_at)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.memory.content_hash.cmp(&b.memory.content_hash))
    });
}

/// Sort plain `Memory` lists by `created_at` descending (used by tag/time
/// search and `list_memories`, none of which carry a similarity score).
pub fn sort_memories_by_recency(memories: &mut [Memory]) {
    memories.sort_by(|a, b| {
        b.created_at
            .partial_cmp(&a.created_at)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.content_hash.cmp(&b.content_hash))
    });
}

/// Drop results below `min_similarity`; if fewer than `n` survive, the
/// shorter list is returned as-is (spec §4.10).
pub fn apply_min_similarity(results: Vec<MemoryQueryResult>, min_similarity: f32) -> Vec<MemoryQueryResult> {
    results
        .into_iter()
        .filter(|r| r.similarity_score >= min_similarity)
        .collect()
}

fn start_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(0, 0, 0).expect("valid midnight")
}

fn end_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(23, 59, 59).expect("valid end of day")
}

fn to_epoch(dt: NaiveDateTime) -> f64 {
    Utc.from_utc_datetime(&dt).timestamp() as f64
}

/// Parse a single absolute time expression: RFC 3339, `YYYY-MM-DD`, or
/// `YYYY-MM-DD HH:MM[:SS]` (local-naive, treated as UTC unless the RFC 3339
/// form carries its own offset).
fn parse_absolute(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc).timestamp() as f64);
    }

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(to_epoch(start_of_day(date)));
    }

    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(to_epoch(dt));
        }
    }

    None
}

fn now_naive() -> NaiveDateTime {
    Utc::now().naive_utc()
}

fn week_start(dt: NaiveDateTime) -> NaiveDate {
    let date = dt.date();
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

fn month_start(dt: NaiveDateTime) -> NaiveDate {
    NaiveDate::from_ymd_opt(dt.year(), dt.month(), 1).expect("valid month start")
}

fn year_start(dt: NaiveDateTime) -> NaiveDate {
    NaiveDate::from_ymd_opt(dt.year(), 1, 1).expect("valid year start")
}

/// Parse the restricted relative/range grammar from spec §4.10 into an
/// inclusive `[start, end]` range. Returns `None` if `query` matches none of
/// the known forms, so the caller can fall back to treating it as a bare
/// absolute timestamp or report `InvalidInput`.
fn parse_relative(query: &str) -> Option<TimeRange> {
    let q = query.trim().to_lowercase();
    let now = now_naive();

    if q == "today" {
        let d = now.date();
        return Some(TimeRange { start: to_epoch(start_of_day(d)), end: to_epoch(end_of_day(d)) });
    }
    if q == "yesterday" {
        let d = now.date() - Duration::days(1);
        return Some(TimeRange { start: to_epoch(start_of_day(d)), end: to_epoch(end_of_day(d)) });
    }
    if q == "this week" {
        let d = week_start(now);
        return Some(TimeRange { start: to_epoch(start_of_day(d)), end: to_epoch(now) });
    }
    if q == "last week" {
        let this_start = week_start(now);
        let last_start = this_start - Duration::days(7);
        let last_end = this_start - Duration::days(1);
        return Some(TimeRange { start: to_epoch(start_of_day(last_start)), end: to_epoch(end_of_day(last_end)) });
    }
    if q == "this month" {
        let d = month_start(now);
        return Some(TimeRange { start: to_epoch(start_of_day(d)), end: to_epoch(now) });
    }
    if q == "last month" {
        let this_start = month_start(now);
        let last_end = this_start - Duration::days(1);
        let last_start = month_start(NaiveDateTime::new(last_end, Default::default()));
        return Some(TimeRange { start: to_epoch(start_of_day(last_start)), end: to_epoch(end_of_day(last_end)) });
    }
    if q == "this year" {
        let d = year_start(now);
        return Some(TimeRange { start: to_epoch(start_of_day(d)), end: to_epoch(now) });
    }
    if q == "last year" {
        let this_start = year_start(now);
        let last_end = this_start - Duration::days(1);
        let last_start = NaiveDate::from_ymd_opt(last_end.year(), 1, 1).expect("valid year start");
        return Some(TimeRange { start: to_epoch(start_of_day(last_start)), end: to_epoch(end_of_day(last_end)) });
    }

    // "N <unit>(s)? ago"
    if let Some(rest) = q.strip_suffix(" ago") {
        if let Some((n, unit)) = parse_duration_amount(rest) {
            let delta = duration_for_unit(unit, n);
            let at = now - delta;
            return Some(TimeRange { start: to_epoch(start_of_day(at.date())), end: to_epoch(end_of_day(at.date())) });
        }
    }

    if let Some(rest) = q.strip_prefix("since ") {
        let start = parse_absolute(rest.trim()).or_else(|| parse_relative(rest.trim()).map(|r| r.start))?;
        return Some(TimeRange { start, end: to_epoch(now) });
    }

    if let Some(rest) = q.strip_prefix("before ") {
        let end = parse_absolute(rest.trim()).or_else(|| parse_relative(rest.trim()).map(|r| r.start))?;
        return Some(TimeRange { start: 0.0, end });
    }

    if let Some(rest) = q.strip_prefix("between ") {
        let (left, right) = rest.split_once(" and ")?;
        let start = parse_absolute(left.trim())?;
        let end = parse_absolute(right.trim())?;
        return Some(TimeRange { start, end });
    }

    None
}

fn parse_duration_amount(text: &str) -> Option<(i64, &str)> {
    let mut parts = text.split_whitespace();
    let n: i64 = parts.next()?.parse().ok()?;
    let unit = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some((n, unit))
}

fn duration_for_unit(unit: &str, n: i64) -> Duration {
    let unit = unit.trim_end_matches('s');
    match unit {
        "second" => Duration::seconds(n),
        "minute" => Duration::minutes(n),
        "hour" => Duration::hours(n),
        "day" => Duration::days(n),
        "week" => Duration::weeks(n),
        "month" => Duration::days(n * 30),
        "year" => Duration::days(n * 365),
        _ => Duration::zero(),
    }
}

/// Parse a `search_by_time` query string into an inclusive time range (spec
/// §4.10). Tries the relative/range grammar first, then falls back to
/// treating the whole string as a single absolute timestamp (day-level
/// tokens expand to the full day).
pub fn parse_time_query(query: &str) -> Result<TimeRange> {
    if let Some(range) = parse_relative(query) {
        return Ok(range);
    }

    if let Some(epoch) = parse_absolute(query) {
        // A bare YYYY-MM-DD should cover the whole day; re-derive from the
        // date component so both start and end are day-aligned.
        if let Ok(date) = NaiveDate::parse_from_str(query.trim(), "%Y-%m-%d") {
            return Ok(TimeRange { start: to_epoch(start_of_day(date)), end: to_epoch(end_of_day(date)) });
        }
        return Ok(TimeRange { start: epoch, end: epoch });
    }

    if let Ok(n) = query.trim().parse::<f64>() {
        let secs = if n.abs() > 1.0e12 { n / 1000.0 } else { n };
        return Ok(TimeRange { start: secs, end: secs });
    }

    Err(EngramError::InvalidInput(format!(
        "unrecognized time expression: {query:?}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescales_cosine_to_unit_interval() {
        assert!((rescale_similarity(1.0) - 1.0).abs() < 1e-6);
        assert!((rescale_similarity(-1.0) - 0.0).abs() < 1e-6);
        assert!((rescale_similarity(0.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn sorts_by_score_then_recency_then_hash() {
        let mk = |hash: &str, score: f32, created: f64| MemoryQueryResult::new(
            Memory::new(format!("content-{hash}"), vec![], None, Default::default()).map(|mut m| {
                m.content_hash = hash.to_string();
                m.created_at = created;
                m
            }).unwrap(),
            score,
            "test",
        );

        let mut results = vec![mk("b", 0.5, 100.0), mk("a", 0.9, 50.0), mk("c", 0.9, 50.0)];
        sort_query_results(&mut results);
        assert_eq!(results[0].memory.content_hash, "a");
        assert_eq!(results[1].memory.content_hash, "c");
        assert_eq!(results[2].memory.content_hash, "b");
    }

    #[test]
    fn parses_absolute_date() {
        let range = parse_time_query("2024-01-15").unwrap();
        assert!(range.end > range.start);
    }

    #[test]
    fn parses_relative_yesterday() {
        let range = parse_time_query("yesterday").unwrap();
        assert!(range.start < range.end);
    }

    #[test]
    fn parses_n_days_ago() {
        assert!(parse_time_query("3 days ago").is_ok());
    }

    #[test]
    fn parses_between_range() {
        let range = parse_time_query("between 2024-01-01 and 2024-01-31").unwrap();
        assert!(range.end > range.start);
    }

    #[test]
    fn unparseable_query_is_invalid_input() {
        let err = parse_time_query("whenever, I guess").unwrap_err();
        assert!(matches!(err, EngramError::InvalidInput(_)));
    }

    #[test]
    fn min_similarity_filters_below_threshold() {
        let mk = |score: f32| MemoryQueryResult::new(
            Memory::new("x".into(), vec![], None, Default::default()).unwrap(),
            score,
            "test",
        );
        let results = vec![mk(0.9), mk(0.3)];
        let filtered = apply_min_similarity(results, 0.5);
        assert_eq!(filtered.len(), 1);
    }
}
