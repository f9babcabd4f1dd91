//! Wall-clock and monotonic time, plus the NTP-sync predicate.
//!
//! Every other component asks this type for time instead of calling the OS
//! directly. The sync predicate consults `timedatectl` (systemd-timesyncd);
//! on hosts without it the gateway is considered synced once the first
//! upstream HTTPS round-trip has completed.

use chrono::{DateTime, Utc};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::time::{Duration, Instant};

pub struct GatewayClock {
    started: Instant,
    boot_wallclock: DateTime<Utc>,
    upstream_roundtrip_seen: AtomicBool,
}

impl GatewayClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            boot_wallclock: Utc::now(),
            upstream_roundtrip_seen: AtomicBool::new(false),
        }
    }

    pub fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    pub fn now_monotonic(&self) -> Instant {
        Instant::now()
    }

    /// Wall-clock reading captured at construction. The flush worker compares
    /// it against `boot_wallclock + uptime` to detect an NTP step.
    pub fn boot_wallclock(&self) -> DateTime<Utc> {
        self.boot_wallclock
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// True once the host clock is trustworthy. Prefers the time-sync daemon's
    /// answer; falls back to "we completed an HTTPS round-trip" on hosts
    /// without `timedatectl`.
    pub fn is_time_synced(&self) -> bool {
        match timedatectl_synced() {
            Some(synced) => synced,
            None => self.upstream_roundtrip_seen.load(Relaxed),
        }
    }

    /// Called by the publisher after the first successful upstream response.
    pub fn note_upstream_roundtrip(&self) {
        self.upstream_roundtrip_seen.store(true, Relaxed);
    }
}

impl Default for GatewayClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Ask systemd-timesyncd whether the clock is NTP-synchronized.
/// Returns `None` when `timedatectl` is unavailable or answers garbage.
fn timedatectl_synced() -> Option<bool> {
    let output = Command::new("timedatectl")
        .args(["show", "--property=NTPSynchronized", "--value"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    match String::from_utf8_lossy(&output.stdout).trim() {
        "yes" => Some(true),
        "no" => Some(false),
        _ => None,
    }
}
