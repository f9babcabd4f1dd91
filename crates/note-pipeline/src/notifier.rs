//! Directed acknowledgements back through the radio, under an anti-spam
//! budget.
//!
//! Per origin, at most 3 directed acks per rolling 60 s window. Once the
//! budget is gone, further messages collapse into a single summary per
//! window and everything beyond that is dropped. Sends are best-effort:
//! a `false` from the transport is logged and forgotten, never retried.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::radio::AckTransport;
use crate::store::Store;
use crate::templates::{self, Lang};

pub const ACK_BUDGET_MAX: usize = 3;
pub const ACK_BUDGET_WINDOW: Duration = Duration::from_secs(60);

/// Success acks carry the privacy reminder only on every Nth sent report.
const PRIVACY_EVERY_NTH_SUCCESS: u64 = 5;

#[derive(Default)]
struct OriginBudget {
    sends: VecDeque<Instant>,
    summary_sent_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BudgetVerdict {
    Allowed,
    /// Budget exhausted; the caller may send one summary for this window.
    Collapse,
    /// Budget and summary both spent; drop the message.
    Suppressed,
}

pub struct Notifier {
    transport: Arc<dyn AckTransport>,
    store: Arc<Store>,
    lang: Lang,
    dry_run: bool,
    budgets: Mutex<HashMap<String, OriginBudget>>,
}

impl Notifier {
    pub fn new(
        transport: Arc<dyn AckTransport>,
        store: Arc<Store>,
        lang: Lang,
        dry_run: bool,
    ) -> Self {
        Self { transport, store, lang, dry_run, budgets: Mutex::new(HashMap::new()) }
    }

    /// Immediate-success ack: replaces the queued ack, one message total.
    pub fn ack_success(&self, origin: &str, upstream_id: i64, url: &str, approximate: bool) {
        let mut text = templates::ack_success(self.lang, upstream_id, url);
        if approximate {
            text.push_str(templates::approximate_hint(self.lang));
        }
        if self.success_wants_privacy_suffix(origin) {
            text.push_str(templates::privacy_suffix(self.lang));
        }
        self.send_budgeted(origin, &text, 1);
    }

    pub fn ack_queued(&self, origin: &str, queue_id: &str, approximate: bool) {
        let mut text = templates::ack_queued(self.lang, queue_id);
        if approximate {
            text.push_str(templates::approximate_hint(self.lang));
        }
        text.push_str(templates::privacy_suffix(self.lang));
        self.send_budgeted(origin, &text, 1);
    }

    pub fn ack_duplicate(&self, origin: &str) {
        self.send_with_suffix(origin, templates::duplicate(self.lang));
    }

    pub fn reject_missing_text(&self, origin: &str) {
        self.send_with_suffix(origin, templates::missing_text(self.lang));
    }

    pub fn reject_no_gps(&self, origin: &str) {
        self.send_with_suffix(origin, templates::no_gps(self.lang));
    }

    pub fn reject_stale_gps(&self, origin: &str) {
        self.send_with_suffix(origin, templates::stale_gps(self.lang));
    }

    /// Reply to an informational command (`#osmhelp`, `#osmstatus`, ...).
    pub fn reply(&self, origin: &str, text: &str) {
        let mut text = text.to_string();
        text.push_str(templates::privacy_suffix(self.lang));
        self.send_budgeted(origin, &text, 1);
    }

    /// Announce queue promotions: one `ACK_PROMOTED` per unannounced SENT row
    /// while the origin's budget lasts, then one summary for the rest. Rows
    /// are latched as announced regardless of transmit success so they are
    /// never announced twice.
    pub fn announce_sent(&self) {
        let rows = match self.store.unannounced_sent() {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!("cannot read unannounced reports: {:#}", e);
                return;
            }
        };
        if rows.is_empty() {
            return;
        }

        let mut by_origin: HashMap<String, Vec<&crate::store::Report>> = HashMap::new();
        for row in &rows {
            by_origin.entry(row.origin.clone()).or_default().push(row);
        }

        for (origin, rows) in by_origin {
            let mut remaining = rows.len();
            for row in rows {
                match self.try_reserve(&origin, Instant::now()) {
                    BudgetVerdict::Allowed => {
                        // mark_sent guarantees both fields; a violating row is
                        // latched below without an ack rather than retried forever.
                        if let (Some(id), Some(url)) = (row.upstream_id, row.upstream_url.as_deref())
                        {
                            let text = templates::ack_promoted(self.lang, &row.queue_id, id, url);
                            self.transmit(&origin, &text);
                        } else {
                            tracing::error!("SENT row {} missing upstream fields", row.queue_id);
                        }
                    }
                    BudgetVerdict::Collapse => {
                        let text = templates::flush_summary(self.lang, remaining);
                        self.transmit(&origin, &text);
                    }
                    BudgetVerdict::Suppressed => {}
                }
                remaining -= 1;
                if let Err(e) = self.store.mark_announced(&row.queue_id) {
                    tracing::error!("cannot latch announcement for {}: {:#}", row.queue_id, e);
                }
            }
        }
    }

    /// Once-a-day gateway advertisement; broadcasts skip the budget.
    pub fn broadcast_daily(&self) {
        let text = templates::daily_broadcast(self.lang);
        if self.dry_run {
            tracing::info!("dry-run broadcast: {}", text);
            return;
        }
        if !self.transport.send_broadcast(&text) {
            tracing::debug!("daily broadcast dropped; radio not connected");
        }
    }

    fn send_with_suffix(&self, origin: &str, mut text: String) {
        text.push_str(templates::privacy_suffix(self.lang));
        self.send_budgeted(origin, &text, 1);
    }

    fn send_budgeted(&self, origin: &str, text: &str, collapsed_count: usize) {
        match self.try_reserve(origin, Instant::now()) {
            BudgetVerdict::Allowed => {
                self.transmit(origin, text);
            }
            BudgetVerdict::Collapse => {
                let summary = templates::flush_summary(self.lang, collapsed_count);
                self.transmit(origin, &summary);
            }
            BudgetVerdict::Suppressed => {
                tracing::debug!("ack budget exhausted for {}; dropping message", origin);
            }
        }
    }

    fn transmit(&self, origin: &str, text: &str) -> bool {
        if self.dry_run {
            tracing::info!("dry-run ack to {}: {}", origin, text.replace('\n', " / "));
            return true;
        }
        let ok = self.transport.send_direct(origin, text);
        if !ok {
            tracing::debug!("ack to {} dropped; radio not connected", origin);
        }
        ok
    }

    /// Every 5th successful report per origin gets the privacy reminder.
    /// The counter is the origin's SENT-count, read after the row at hand
    /// was marked sent.
    fn success_wants_privacy_suffix(&self, origin: &str) -> bool {
        match self.store.sent_count(origin) {
            Ok(n) => n > 0 && n % PRIVACY_EVERY_NTH_SUCCESS == 0,
            Err(e) => {
                tracing::warn!("cannot read sent count for {}: {:#}", origin, e);
                false
            }
        }
    }

    fn try_reserve(&self, origin: &str, now: Instant) -> BudgetVerdict {
        let mut budgets = self.budgets.lock().expect("notifier lock poisoned");
        let budget = budgets.entry(origin.to_string()).or_default();

        while let Some(&front) = budget.sends.front() {
            if now.saturating_duration_since(front) > ACK_BUDGET_WINDOW {
                budget.sends.pop_front();
            } else {
                break;
            }
        }
        if let Some(at) = budget.summary_sent_at {
            if now.saturating_duration_since(at) > ACK_BUDGET_WINDOW {
                budget.summary_sent_at = None;
            }
        }

        if budget.sends.len() < ACK_BUDGET_MAX {
            budget.sends.push_back(now);
            BudgetVerdict::Allowed
        } else if budget.summary_sent_at.is_none() {
            budget.summary_sent_at = Some(now);
            BudgetVerdict::Collapse
        } else {
            BudgetVerdict::Suppressed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use chrono::{TimeZone, Utc};

    struct FakeTransport {
        sent: Mutex<Vec<(String, String)>>,
        accept: bool,
    }

    impl FakeTransport {
        fn new(accept: bool) -> Arc<Self> {
            Arc::new(Self { sent: Mutex::new(Vec::new()), accept })
        }

        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl AckTransport for FakeTransport {
        fn send_direct(&self, origin: &str, text: &str) -> bool {
            self.sent.lock().unwrap().push((origin.to_string(), text.to_string()));
            self.accept
        }

        fn send_broadcast(&self, text: &str) -> bool {
            self.sent.lock().unwrap().push((crate::radio::BROADCAST_ADDR.into(), text.into()));
            self.accept
        }

        fn is_connected(&self) -> bool {
            self.accept
        }
    }

    fn ts(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_750_000_000 + secs, 0).unwrap()
    }

    fn notifier(transport: Arc<FakeTransport>, store: Arc<Store>) -> Notifier {
        Notifier::new(transport, store, Lang::En, false)
    }

    #[test]
    fn test_budget_three_then_collapse_then_suppress() {
        let transport = FakeTransport::new(true);
        let n = notifier(transport, Arc::new(Store::open_in_memory().unwrap()));

        let t0 = Instant::now();
        assert_eq!(n.try_reserve("!a", t0), BudgetVerdict::Allowed);
        assert_eq!(n.try_reserve("!a", t0), BudgetVerdict::Allowed);
        assert_eq!(n.try_reserve("!a", t0), BudgetVerdict::Allowed);
        assert_eq!(n.try_reserve("!a", t0), BudgetVerdict::Collapse);
        assert_eq!(n.try_reserve("!a", t0), BudgetVerdict::Suppressed);

        // Another origin has its own budget.
        assert_eq!(n.try_reserve("!b", t0), BudgetVerdict::Allowed);
    }

    #[test]
    fn test_budget_window_slides() {
        let transport = FakeTransport::new(true);
        let n = notifier(transport, Arc::new(Store::open_in_memory().unwrap()));

        let t0 = Instant::now();
        for _ in 0..3 {
            assert_eq!(n.try_reserve("!a", t0), BudgetVerdict::Allowed);
        }
        assert_eq!(n.try_reserve("!a", t0), BudgetVerdict::Collapse);

        let later = t0 + ACK_BUDGET_WINDOW + Duration::from_secs(1);
        assert_eq!(n.try_reserve("!a", later), BudgetVerdict::Allowed);
    }

    #[test]
    fn test_queued_ack_carries_queue_id_and_suffix() {
        let transport = FakeTransport::new(true);
        let n = notifier(transport.clone(), Arc::new(Store::open_in_memory().unwrap()));

        n.ack_queued("!a", "Q-0001", false);
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "!a");
        assert!(sent[0].1.contains("Q-0001"));
        assert!(sent[0].1.contains(templates::privacy_suffix(Lang::En)));
    }

    #[test]
    fn test_success_suffix_every_fifth() {
        let transport = FakeTransport::new(true);
        let store = Arc::new(Store::open_in_memory().unwrap());
        let n = notifier(transport.clone(), store.clone());

        // 4 sent reports: no suffix yet.
        for i in 0..4 {
            let q = store.append("!a", 1.0, 2.0, "t", "t", ts(i)).unwrap();
            store.mark_sent(&q, i, "u", ts(i)).unwrap();
        }
        n.ack_success("!a", 1, "https://www.openstreetmap.org/note/1", false);
        assert!(!transport.sent()[0].1.contains(templates::privacy_suffix(Lang::En)));

        // Fifth sent report: suffix appears.
        let q = store.append("!a", 1.0, 2.0, "t5", "t5", ts(10)).unwrap();
        store.mark_sent(&q, 5, "u", ts(10)).unwrap();
        n.ack_success("!a", 5, "https://www.openstreetmap.org/note/5", false);
        assert!(transport.sent()[1].1.contains(templates::privacy_suffix(Lang::En)));
    }

    #[test]
    fn test_approximate_hint_on_acks() {
        let transport = FakeTransport::new(true);
        let n = notifier(transport.clone(), Arc::new(Store::open_in_memory().unwrap()));

        n.ack_queued("!a", "Q-0001", true);
        assert!(transport.sent()[0].1.contains(templates::approximate_hint(Lang::En)));
    }

    #[test]
    fn test_announce_sent_acks_and_latches() {
        let transport = FakeTransport::new(true);
        let store = Arc::new(Store::open_in_memory().unwrap());
        let n = notifier(transport.clone(), store.clone());

        let q = store.append("!a", 1.0, 2.0, "t", "t", ts(0)).unwrap();
        store.mark_sent(&q, 42, "https://www.openstreetmap.org/note/42", ts(5)).unwrap();

        n.announce_sent();
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("Q-0001"));
        assert!(sent[0].1.contains("#42"));

        // Latched: a second pass stays silent.
        n.announce_sent();
        assert_eq!(transport.sent().len(), 1);
    }

    #[test]
    fn test_announce_sent_latches_even_when_radio_down() {
        let transport = FakeTransport::new(false);
        let store = Arc::new(Store::open_in_memory().unwrap());
        let n = notifier(transport.clone(), store.clone());

        let q = store.append("!a", 1.0, 2.0, "t", "t", ts(0)).unwrap();
        store.mark_sent(&q, 42, "u", ts(5)).unwrap();

        n.announce_sent();
        assert_eq!(transport.sent().len(), 1); // attempted, refused
        assert!(store.unannounced_sent().unwrap().is_empty());
    }

    #[test]
    fn test_announce_sent_collapses_past_budget() {
        let transport = FakeTransport::new(true);
        let store = Arc::new(Store::open_in_memory().unwrap());
        let n = notifier(transport.clone(), store.clone());

        for i in 0..5 {
            let q = store.append("!a", 1.0, 2.0, &format!("t{i}"), &format!("t{i}"), ts(i)).unwrap();
            store.mark_sent(&q, i, "u", ts(i)).unwrap();
        }

        n.announce_sent();
        let sent = transport.sent();
        // 3 per-row acks, then one summary covering the remaining 2.
        assert_eq!(sent.len(), 4);
        assert!(sent[3].1.contains('2'));
        assert!(store.unannounced_sent().unwrap().is_empty());
    }

    #[test]
    fn test_dry_run_transmits_nothing() {
        let transport = FakeTransport::new(true);
        let store = Arc::new(Store::open_in_memory().unwrap());
        let n = Notifier::new(transport.clone(), store, Lang::En, true);

        n.ack_duplicate("!a");
        n.broadcast_daily();
        assert!(transport.sent().is_empty());
    }
}
