//! Report acceptance policy: freshness, dedup, normalization glue.
//!
//! `evaluate_report` is the single entry point the orchestrator calls for
//! every `#osmnote` payload. It never writes; the caller persists on
//! [`Decision::Accept`].

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

use crate::command;
use crate::position::PositionCache;
use crate::store::Store;

pub const POS_GOOD_DEFAULT: Duration = Duration::from_secs(15);
pub const POS_MAX_DEFAULT: Duration = Duration::from_secs(60);
pub const DEDUP_BUCKET_SECS: i64 = 120;

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Fix age at or below which the position is considered good.
    pub pos_good: Duration,
    /// Fix age beyond which the report is rejected outright.
    pub pos_max: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self { pos_good: POS_GOOD_DEFAULT, pos_max: POS_MAX_DEFAULT }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    MissingText,
    NoGps,
    StaleGps,
    Duplicate { existing: Option<String> },
    Accept {
        lat: f64,
        lon: f64,
        /// Fix age fell in (pos_good, pos_max]; surfaced in the ack.
        approximate: bool,
        text_final: String,
    },
}

pub fn evaluate_report(
    cfg: &PolicyConfig,
    positions: &PositionCache,
    store: &Store,
    origin: &str,
    text_remaining: &str,
    now_mono: Instant,
    now_utc: DateTime<Utc>,
) -> Result<Decision> {
    let text_normalized = command::normalize(text_remaining);
    if text_normalized.is_empty() {
        return Ok(Decision::MissingText);
    }

    let fix = match positions.get(origin) {
        Some(fix) => fix,
        None => return Ok(Decision::NoGps),
    };

    // A fix stamped "in the future" (monotonic race with the reader) ages to zero.
    let age = now_mono.saturating_duration_since(fix.received_at);
    if age > cfg.pos_max {
        return Ok(Decision::StaleGps);
    }
    let approximate = age > cfg.pos_good;

    let existing = store.find_duplicate(
        origin,
        &text_normalized,
        round4(fix.lat),
        round4(fix.lon),
        dedup_bucket(now_utc),
    )?;
    if let Some(queue_id) = existing {
        return Ok(Decision::Duplicate { existing: Some(queue_id) });
    }

    Ok(Decision::Accept {
        lat: fix.lat,
        lon: fix.lon,
        approximate,
        text_final: text_remaining.trim().to_string(),
    })
}

/// Round half away from zero to 4 decimal digits (about 11 m).
pub fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

/// 120 s tumbling dedup window.
pub fn dedup_bucket(ts: DateTime<Utc>) -> i64 {
    ts.timestamp().div_euclid(DEDUP_BUCKET_SECS)
}
