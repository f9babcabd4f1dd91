//! Rate-limited HTTPS client for the OSM notes API.
//!
//! One `publish` call per note. Calls are serialized behind the last-send
//! guard so successive requests are spaced by at least the configured rate
//! limit regardless of which thread publishes. Dry-run mode synthesises a
//! deterministic result without touching the network.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::clock::GatewayClock;
use crate::templates::{self, Lang};

pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
pub const RATE_LIMIT_DEFAULT: Duration = Duration::from_secs(3);
pub const NOTE_URL_BASE: &str = "https://www.openstreetmap.org/note";

#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    Ok { id: i64, url: String },
    /// Worth retrying on a later flush tick (timeouts, refused connections,
    /// DNS failures, HTTP 429/5xx).
    Transient { tag: String },
    /// HTTP 4xx other than 429; retrying will not help.
    Permanent { tag: String },
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// API base, e.g. "https://api.openstreetmap.org".
    pub api_base: String,
    pub rate_limit: Duration,
    pub dry_run: bool,
    pub lang: Lang,
}

pub struct NotePublisher {
    client: reqwest::blocking::Client,
    cfg: PublisherConfig,
    clock: Arc<GatewayClock>,
    last_send: Mutex<Option<Instant>>,
    last_outcome: Mutex<Option<String>>,
}

/// Note-creation response: `{"properties": {"id": 123, ...}, ...}`.
#[derive(Deserialize)]
struct NoteResponse {
    properties: NoteProperties,
}

#[derive(Deserialize)]
struct NoteProperties {
    id: i64,
}

impl NotePublisher {
    pub fn new(cfg: PublisherConfig, clock: Arc<GatewayClock>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("notegate/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTPS client")?;
        Ok(Self {
            client,
            cfg,
            clock,
            last_send: Mutex::new(None),
            last_outcome: Mutex::new(None),
        })
    }

    /// Create one note. Sleeps as needed to honour the global rate limit;
    /// the guard is held across the request so publishes are serialized.
    pub fn publish(&self, lat: f64, lon: f64, text: &str) -> PublishOutcome {
        let mut last_send = self.last_send.lock().expect("publisher lock poisoned");
        if let Some(prev) = *last_send {
            let since = prev.elapsed();
            if since < self.cfg.rate_limit {
                std::thread::sleep(self.cfg.rate_limit - since);
            }
        }

        let outcome = if self.cfg.dry_run {
            self.publish_dry_run(text)
        } else {
            self.post_note(lat, lon, text)
        };
        *last_send = Some(Instant::now());

        let tag = match &outcome {
            PublishOutcome::Ok { id, .. } => format!("ok #{id}"),
            PublishOutcome::Transient { tag } | PublishOutcome::Permanent { tag } => tag.clone(),
        };
        *self.last_outcome.lock().expect("publisher lock poisoned") = Some(tag);
        outcome
    }

    /// Tag of the most recent publish attempt, for `#osmstatus`.
    pub fn last_outcome(&self) -> Option<String> {
        self.last_outcome.lock().expect("publisher lock poisoned").clone()
    }

    fn post_note(&self, lat: f64, lon: f64, text: &str) -> PublishOutcome {
        let body = format!("{}\n\n{}", text, templates::attribution(self.cfg.lang));
        let url = format!("{}/api/0.6/notes.json", self.cfg.api_base.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .query(&[
                ("lat", lat.to_string()),
                ("lon", lon.to_string()),
                ("text", body),
            ])
            .send();

        let response = match response {
            Ok(r) => r,
            Err(e) => return PublishOutcome::Transient { tag: request_error_tag(&e) },
        };

        let status = response.status();
        if status.is_success() {
            match response.json::<NoteResponse>() {
                Ok(note) => {
                    self.clock.note_upstream_roundtrip();
                    let id = note.properties.id;
                    tracing::info!("note #{} created at {},{}", id, lat, lon);
                    PublishOutcome::Ok { id, url: format!("{NOTE_URL_BASE}/{id}") }
                }
                Err(e) => {
                    tracing::warn!("note created but response unparseable: {}", e);
                    PublishOutcome::Transient { tag: "bad-response".into() }
                }
            }
        } else if status.as_u16() == 429 || status.is_server_error() {
            tracing::warn!("upstream rejected note: HTTP {}", status.as_u16());
            PublishOutcome::Transient { tag: format!("http-{}", status.as_u16()) }
        } else {
            tracing::warn!("upstream refused note permanently: HTTP {}", status.as_u16());
            PublishOutcome::Permanent { tag: format!("http-{}", status.as_u16()) }
        }
    }

    fn publish_dry_run(&self, text: &str) -> PublishOutcome {
        let id = synthetic_note_id(text);
        tracing::info!("dry-run publish: synthetic note #{}", id);
        self.clock.note_upstream_roundtrip();
        PublishOutcome::Ok { id, url: format!("{NOTE_URL_BASE}/{id}") }
    }
}

fn request_error_tag(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "timeout".into()
    } else if e.is_connect() {
        "connect".into()
    } else {
        "network".into()
    }
}

/// Deterministic positive id for dry-run mode, derived from the note text.
fn synthetic_note_id(text: &str) -> i64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    (hasher.finish() & 0x7fff_ffff) as i64
}
