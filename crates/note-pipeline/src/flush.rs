//! Periodic drain of PENDING reports, plus the one-shot clock-skew pass.
//!
//! Ticks every `WORKER_INTERVAL` seconds. Each tick publishes up to one
//! page of pending rows oldest-first, stopping early on the first transient
//! failure so a dead uplink does not burn the whole page. The skew pass
//! runs at most once per process: SBCs without an RTC boot with a wrong
//! wall clock, and rows stamped before NTP sync need their `created_at`
//! shifted by the step once sync lands.

use anyhow::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::clock::GatewayClock;
use crate::notifier::Notifier;
use crate::publisher::{NotePublisher, PublishOutcome};
use crate::store::{Store, SystemState};

pub const FLUSH_INTERVAL_DEFAULT: Duration = Duration::from_secs(30);
pub const FLUSH_PAGE_LIMIT: usize = 10;
/// Clock steps at or below this are noise, not a boot-without-RTC skew.
const SKEW_MIN_SECS: i64 = 60;

pub struct FlushWorker {
    store: Arc<Store>,
    publisher: Arc<NotePublisher>,
    notifier: Arc<Notifier>,
    clock: Arc<GatewayClock>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl FlushWorker {
    pub fn new(
        store: Arc<Store>,
        publisher: Arc<NotePublisher>,
        notifier: Arc<Notifier>,
        clock: Arc<GatewayClock>,
        interval: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self { store, publisher, notifier, clock, interval, shutdown }
    }

    /// Run the tick loop on its own thread until the shutdown channel fires
    /// or drops. An in-flight publish always completes before exit.
    pub fn spawn(self, shutdown_rx: Receiver<()>) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("flush-worker".into())
            .spawn(move || {
                tracing::info!("flush worker started ({}s interval)", self.interval.as_secs());
                loop {
                    match shutdown_rx.recv_timeout(self.interval) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    if let Err(e) = self.tick() {
                        tracing::warn!("flush tick failed: {:#}", e);
                    }
                }
                tracing::info!("flush worker stopped");
            })
            .expect("failed to spawn flush worker")
    }

    /// One flush iteration. Public so the daemon can run a final drain on
    /// shutdown and tests can drive it directly.
    pub fn tick(&self) -> Result<()> {
        self.correct_clock_once()?;

        let page = self.store.pending_page(FLUSH_PAGE_LIMIT)?;
        for report in page {
            if self.shutdown.load(Relaxed) {
                break;
            }
            match self.publisher.publish(report.lat, report.lon, &report.text_original) {
                PublishOutcome::Ok { id, url } => {
                    self.store.mark_sent(&report.queue_id, id, &url, self.clock.now_utc())?;
                    tracing::info!("{} promoted to note #{}", report.queue_id, id);
                }
                PublishOutcome::Transient { tag } => {
                    self.store.record_error(&report.queue_id, &tag)?;
                    tracing::debug!("{} deferred ({}); stopping page", report.queue_id, tag);
                    break;
                }
                PublishOutcome::Permanent { tag } => {
                    self.store.record_error(&report.queue_id, &tag)?;
                    tracing::warn!("{} refused permanently ({})", report.queue_id, tag);
                }
            }
        }

        self.notifier.announce_sent();
        Ok(())
    }

    fn correct_clock_once(&self) -> Result<()> {
        let state = self.store.system_state()?;
        if state.time_correction_applied || !self.clock.is_time_synced() {
            return Ok(());
        }
        self.apply_skew_correction(&state)
    }

    /// The clock step is the difference between the synced wall clock and
    /// what the boot-time clock would read now (`boot_wallclock + uptime`).
    /// Only PENDING rows move; SENT rows already carry upstream timestamps.
    fn apply_skew_correction(&self, state: &SystemState) -> Result<()> {
        let uptime = chrono::Duration::from_std(self.clock.uptime())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let uncorrected_now = state.boot_wallclock + uptime;
        let delta = self.clock.now_utc() - uncorrected_now;

        if delta.num_seconds().abs() > SKEW_MIN_SECS {
            let cutoff = uncorrected_now + chrono::Duration::seconds(1);
            let ids = self.store.pending_ids_created_before(cutoff)?;
            if !ids.is_empty() {
                let shifted = self.store.shift_created_at(&ids, delta)?;
                tracing::info!(
                    "clock stepped {}s; corrected {} pending rows",
                    delta.num_seconds(),
                    shifted
                );
            }
        }
        self.store.set_time_correction_applied()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::PublisherConfig;
    use crate::radio::AckTransport;
    use crate::templates::Lang;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    struct FakeTransport {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl AckTransport for FakeTransport {
        fn send_direct(&self, origin: &str, text: &str) -> bool {
            self.sent.lock().unwrap().push((origin.to_string(), text.to_string()));
            true
        }

        fn send_broadcast(&self, _text: &str) -> bool {
            true
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    fn ts(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_750_000_000 + secs, 0).unwrap()
    }

    struct Rig {
        worker: FlushWorker,
        store: Arc<Store>,
        transport: Arc<FakeTransport>,
    }

    fn rig(api_base: &str, dry_run: bool) -> Rig {
        let clock = Arc::new(GatewayClock::new());
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.init_boot_state(clock.boot_wallclock()).unwrap();
        let transport = Arc::new(FakeTransport { sent: Mutex::new(Vec::new()) });
        let publisher = Arc::new(
            NotePublisher::new(
                PublisherConfig {
                    api_base: api_base.into(),
                    rate_limit: Duration::ZERO,
                    dry_run,
                    lang: Lang::En,
                },
                clock.clone(),
            )
            .unwrap(),
        );
        let notifier = Arc::new(Notifier::new(
            transport.clone(),
            store.clone(),
            Lang::En,
            false,
        ));
        let worker = FlushWorker::new(
            store.clone(),
            publisher,
            notifier,
            clock,
            FLUSH_INTERVAL_DEFAULT,
            Arc::new(AtomicBool::new(false)),
        );
        Rig { worker, store, transport }
    }

    #[test]
    fn test_tick_drains_and_announces() {
        let r = rig("https://api.openstreetmap.org", true);
        r.store.append("!a", 4.6, -74.0, "tree down", "tree down", ts(0)).unwrap();
        r.store.append("!a", 4.6, -74.0, "second", "second", ts(1)).unwrap();

        r.worker.tick().unwrap();

        assert_eq!(r.store.pending_depth().unwrap().0, 0);
        assert!(r.store.unannounced_sent().unwrap().is_empty());
        // One promotion ack per drained row.
        let sent = r.transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].1.contains("Q-0001"));
        assert!(sent[1].1.contains("Q-0002"));
    }

    #[test]
    fn test_transient_failure_stops_the_page() {
        // Nothing listens on this port; connects are refused immediately.
        let r = rig("http://127.0.0.1:9", false);
        r.store.append("!a", 4.6, -74.0, "first", "first", ts(0)).unwrap();
        r.store.append("!a", 4.6, -74.0, "second", "second", ts(1)).unwrap();

        r.worker.tick().unwrap();

        let page = r.store.pending_page(10).unwrap();
        assert_eq!(page.len(), 2);
        // Only the first row was attempted.
        assert!(page[0].last_error.is_some());
        assert!(page[1].last_error.is_none());
        assert!(r.transport.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_skew_correction_shifts_pending_only() {
        let r = rig("https://api.openstreetmap.org", true);

        // Boot clock was two hours behind: rows stamped before sync carry
        // stale timestamps at or before the uncorrected present.
        let boot_wallclock = GatewayClock::new().boot_wallclock() - chrono::Duration::hours(2);
        let stale_stamp = boot_wallclock - chrono::Duration::seconds(30);
        r.store.init_boot_state(boot_wallclock).unwrap();

        let q1 = r.store.append("!a", 1.0, 2.0, "pending", "pending", stale_stamp).unwrap();
        let q2 = r.store.append("!a", 1.0, 2.0, "sent", "sent", stale_stamp).unwrap();
        r.store.mark_sent(&q2, 7, "u", stale_stamp).unwrap();

        let state = r.store.system_state().unwrap();
        r.worker.apply_skew_correction(&state).unwrap();

        let rows = r.store.recent(10).unwrap();
        let pending = rows.iter().find(|r| r.queue_id == q1).unwrap();
        let sent = rows.iter().find(|r| r.queue_id == q2).unwrap();

        // The pending row moved forward by roughly the two-hour step.
        let moved = pending.created_at - stale_stamp;
        assert!(moved > chrono::Duration::minutes(115), "moved {moved}");
        assert!(moved < chrono::Duration::minutes(125), "moved {moved}");
        // The sent row kept its stamp.
        assert_eq!(sent.created_at, stale_stamp);
        assert!(r.store.system_state().unwrap().time_correction_applied);
    }

    #[test]
    fn test_skew_correction_latches_without_step() {
        let r = rig("https://api.openstreetmap.org", true);
        let stamp = ts(0);
        r.store.append("!a", 1.0, 2.0, "row", "row", stamp).unwrap();

        let state = r.store.system_state().unwrap();
        r.worker.apply_skew_correction(&state).unwrap();

        // Boot clock and wall clock agree: nothing moves, latch is set.
        assert_eq!(r.store.recent(1).unwrap()[0].created_at, stamp);
        assert!(r.store.system_state().unwrap().time_correction_applied);

        // Latched: a later tick never re-enters the pass.
        let state = r.store.system_state().unwrap();
        assert!(state.time_correction_applied);
    }
}
