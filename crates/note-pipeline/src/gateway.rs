//! Component wiring and inbound dispatch.
//!
//! One `Gateway` owns the accept path: position upkeep, command
//! classification, policy evaluation, persistence, the best-effort
//! immediate publish, and exactly one acknowledgement per inbound packet.
//! The ack is only emitted after the store write for the packet commits.

use chrono::{DateTime, FixedOffset, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::clock::GatewayClock;
use crate::command::{self, Command};
use crate::notifier::Notifier;
use crate::policy::{self, Decision, PolicyConfig};
use crate::position::PositionCache;
use crate::publisher::{NotePublisher, PublishOutcome};
use crate::radio::{AckTransport, RadioPacket};
use crate::store::{ReportStatus, Store};
use crate::templates::{self, Lang};

pub const DAILY_BROADCAST_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
/// First advertisement goes out shortly after boot, then daily.
const DAILY_BROADCAST_WARMUP: Duration = Duration::from_secs(60);

const LIST_TEXT_WIDTH: usize = 40;

pub struct Gateway {
    clock: Arc<GatewayClock>,
    positions: Arc<PositionCache>,
    store: Arc<Store>,
    policy: PolicyConfig,
    publisher: Arc<NotePublisher>,
    notifier: Arc<Notifier>,
    transport: Arc<dyn AckTransport>,
    lang: Lang,
    display_tz: FixedOffset,
}

impl Gateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Arc<GatewayClock>,
        positions: Arc<PositionCache>,
        store: Arc<Store>,
        policy: PolicyConfig,
        publisher: Arc<NotePublisher>,
        notifier: Arc<Notifier>,
        transport: Arc<dyn AckTransport>,
        lang: Lang,
        display_tz: FixedOffset,
    ) -> Self {
        Self { clock, positions, store, policy, publisher, notifier, transport, lang, display_tz }
    }

    pub fn handle_packet(&self, packet: RadioPacket) {
        match packet {
            RadioPacket::Position { origin, lat, lon, .. } => {
                self.positions.update(&origin, lat, lon);
            }
            RadioPacket::Text { origin, text, lat, lon, received_at } => {
                // A text packet may carry an embedded position; cache it first
                // so the freshness check sees it.
                if let (Some(lat), Some(lon)) = (lat, lon) {
                    self.positions.update(&origin, lat, lon);
                }
                self.dispatch_text(&origin, &text, received_at);
            }
        }
    }

    fn dispatch_text(&self, origin: &str, text: &str, received_at: Instant) {
        match command::parse(text) {
            Command::None => {}
            Command::Report { text: remaining } => {
                self.handle_report(origin, &remaining, received_at)
            }
            Command::Help => self.notifier.reply(origin, &templates::help(self.lang)),
            Command::Status => self.handle_status(origin),
            Command::Count => self.handle_count(origin),
            Command::List { limit } => self.handle_list(origin, limit),
            Command::Queue => self.handle_queue(origin),
            Command::Nodes => self.handle_nodes(origin),
        }
    }

    // -----------------------------------------------------------------------
    // Report path
    // -----------------------------------------------------------------------

    fn handle_report(&self, origin: &str, remaining: &str, received_at: Instant) {
        let now_utc = self.clock.now_utc();
        let decision = match policy::evaluate_report(
            &self.policy,
            &self.positions,
            &self.store,
            origin,
            remaining,
            received_at,
            now_utc,
        ) {
            Ok(d) => d,
            Err(e) => {
                tracing::error!("policy evaluation failed for {}: {:#}", origin, e);
                return;
            }
        };

        match decision {
            Decision::MissingText => self.notifier.reject_missing_text(origin),
            Decision::NoGps => self.notifier.reject_no_gps(origin),
            Decision::StaleGps => self.notifier.reject_stale_gps(origin),
            Decision::Duplicate { existing } => {
                tracing::debug!("duplicate report from {} (matches {:?})", origin, existing);
                self.notifier.ack_duplicate(origin);
            }
            Decision::Accept { lat, lon, approximate, text_final } => {
                self.accept_report(origin, lat, lon, approximate, &text_final, now_utc);
            }
        }
    }

    fn accept_report(
        &self,
        origin: &str,
        lat: f64,
        lon: f64,
        approximate: bool,
        text_final: &str,
        now_utc: DateTime<Utc>,
    ) {
        let normalized = command::normalize(text_final);
        let queue_id =
            match self.store.append(origin, lat, lon, text_final, &normalized, now_utc) {
                Ok(q) => q,
                Err(e) => {
                    tracing::error!("cannot persist report from {}: {:#}", origin, e);
                    return;
                }
            };
        tracing::info!("{} accepted from {} at {:.4},{:.4}", queue_id, origin, lat, lon);

        // Best-effort immediate publish. A failure leaves the row PENDING
        // for the flush worker; the origin still gets exactly one ack.
        match self.publisher.publish(lat, lon, text_final) {
            PublishOutcome::Ok { id, url } => {
                match self.store.mark_sent(&queue_id, id, &url, self.clock.now_utc()) {
                    Ok(()) => {
                        // The success ack covers the promotion; latch it so the
                        // flush worker never announces this row again.
                        if let Err(e) = self.store.mark_announced(&queue_id) {
                            tracing::error!("cannot latch announcement for {}: {:#}", queue_id, e);
                        }
                        self.notifier.ack_success(origin, id, &url, approximate);
                    }
                    Err(e) => {
                        tracing::error!(
                            "{} published as note #{} but not recorded: {:#}",
                            queue_id,
                            id,
                            e
                        );
                        self.notifier.ack_queued(origin, &queue_id, approximate);
                    }
                }
            }
            PublishOutcome::Transient { tag } | PublishOutcome::Permanent { tag } => {
                if let Err(e) = self.store.record_error(&queue_id, &tag) {
                    tracing::error!("cannot record error for {}: {:#}", queue_id, e);
                }
                self.notifier.ack_queued(origin, &queue_id, approximate);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Informational commands
    // -----------------------------------------------------------------------

    fn handle_status(&self, origin: &str) {
        let pending = self.store.pending_depth().map(|(n, _)| n).unwrap_or(0);
        let upstream = self.publisher.last_outcome();
        let pos_age = self.positions.age(origin).map(|d| d.as_secs());
        let text = templates::status(
            self.lang,
            self.clock.uptime().as_secs(),
            self.transport.is_connected(),
            pending,
            upstream.as_deref().unwrap_or("-"),
            pos_age,
        );
        self.notifier.reply(origin, &text);
    }

    fn handle_count(&self, origin: &str) {
        let total = self.store.count_total().unwrap_or(0);
        let today = self
            .store
            .count_since(self.today_start_utc())
            .unwrap_or(0);
        self.notifier.reply(origin, &templates::count(self.lang, total, today));
    }

    fn handle_list(&self, origin: &str, limit: usize) {
        let rows = match self.store.recent(limit) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!("cannot list reports: {:#}", e);
                return;
            }
        };
        if rows.is_empty() {
            self.notifier.reply(origin, &templates::list_empty(self.lang));
            return;
        }
        let lines: Vec<String> = rows
            .iter()
            .map(|r| {
                let mark = match r.status {
                    ReportStatus::Sent => "✅",
                    ReportStatus::Pending => "⏳",
                };
                let local = r.created_at.with_timezone(&self.display_tz);
                format!(
                    "{} {} {} {}",
                    r.queue_id,
                    mark,
                    local.format("%m-%d %H:%M"),
                    truncate_chars(&r.text_original, LIST_TEXT_WIDTH)
                )
            })
            .collect();
        self.notifier.reply(origin, &lines.join("\n"));
    }

    fn handle_queue(&self, origin: &str) {
        let (pending, oldest) = match self.store.pending_depth() {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("cannot read queue depth: {:#}", e);
                return;
            }
        };
        let oldest_age = oldest.map(|ts| {
            (self.clock.now_utc() - ts).num_seconds().max(0) as u64
        });
        self.notifier.reply(origin, &templates::queue_status(self.lang, pending, oldest_age));
    }

    fn handle_nodes(&self, origin: &str) {
        let nodes = self.positions.snapshot();
        if nodes.is_empty() {
            self.notifier.reply(origin, &templates::nodes_empty(self.lang));
            return;
        }
        let mut lines = vec![templates::nodes_header(self.lang, nodes.len())];
        for (node, fix) in &nodes {
            let age = Instant::now().saturating_duration_since(fix.received_at).as_secs();
            lines.push(format!(
                "{}: {} ({} pkt)",
                node,
                templates::humanize_secs(age),
                fix.seen_count
            ));
        }
        self.notifier.reply(origin, &lines.join("\n"));
    }

    /// Midnight of "today" in the display timezone, as a UTC instant.
    fn today_start_utc(&self) -> DateTime<Utc> {
        let local_now = self.clock.now_utc().with_timezone(&self.display_tz);
        local_now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .and_then(|midnight| midnight.and_local_timezone(self.display_tz).single())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| self.clock.now_utc())
    }
}

/// Advertise the gateway once shortly after boot, then every 24 h.
pub fn spawn_daily_broadcast(
    notifier: Arc<Notifier>,
    shutdown_rx: Receiver<()>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("daily-broadcast".into())
        .spawn(move || {
            let mut wait = DAILY_BROADCAST_WARMUP;
            loop {
                match shutdown_rx.recv_timeout(wait) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        notifier.broadcast_daily();
                        wait = DAILY_BROADCAST_INTERVAL;
                    }
                }
            }
        })
        .expect("failed to spawn daily broadcast")
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}
