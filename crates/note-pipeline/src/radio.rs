//! Serial modem boundary: decoded packets in, directed messages out.
//!
//! The modem firmware surfaces mesh traffic as newline-delimited JSON frames
//! over the serial link; the raw LoRa framing never reaches this process.
//! A supervisor thread owns the port: it opens the endpoint, runs the reader
//! until the link faults, then re-opens with exponential backoff capped at
//! 30 s. Transmits while disconnected return `false` and the caller drops
//! the message; acks are best-effort by design.

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use serialport::SerialPort;
use std::io::{BufRead, BufReader, Write};
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Destination address understood by the modem as "everyone".
pub const BROADCAST_ADDR: &str = "^all";

/// Serial read timeout; doubles as the shutdown poll tick.
const READ_POLL: Duration = Duration::from_millis(500);
/// A frame the modem has not accepted within this window counts as failed.
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
/// Spacing between the frames of one split message, against mesh collisions.
const FRAME_GAP: Duration = Duration::from_secs(2);
const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// One line on the serial link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ModemFrame {
    Text {
        from: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lat: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lon: Option<f64>,
    },
    Position {
        from: String,
        lat: f64,
        lon: f64,
    },
    Send {
        to: String,
        text: String,
    },
}

/// Inbound packet as handed to the orchestrator.
#[derive(Debug, Clone)]
pub enum RadioPacket {
    Text {
        origin: String,
        text: String,
        lat: Option<f64>,
        lon: Option<f64>,
        received_at: Instant,
    },
    Position {
        origin: String,
        lat: f64,
        lon: f64,
        received_at: Instant,
    },
}

/// Outbound seam between the notifier/orchestrator and the radio. Tests
/// substitute a recording fake; production wires in [`RadioAdapter`].
pub trait AckTransport: Send + Sync {
    /// Transmit a direct message. `false` means the frame never left
    /// (disconnected, modem refused, timeout); callers drop it silently.
    fn send_direct(&self, origin: &str, text: &str) -> bool;
    fn send_broadcast(&self, text: &str) -> bool;
    fn is_connected(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct RadioConfig {
    pub port: String,
    pub baud: u32,
    /// Max text bytes per outbound frame; longer payloads are split.
    pub mtu: usize,
}

pub struct RadioAdapter {
    cfg: RadioConfig,
    packet_tx: Sender<RadioPacket>,
    writer: Mutex<Option<Box<dyn SerialPort>>>,
    connected: AtomicBool,
    shutdown: Arc<AtomicBool>,
}

enum ReadExit {
    Shutdown,
    Disconnected(std::io::Error),
}

impl RadioAdapter {
    pub fn new(cfg: RadioConfig, packet_tx: Sender<RadioPacket>, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            cfg,
            packet_tx,
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Spawn the supervisor thread. It keeps the port open for the lifetime
    /// of the process, re-opening on fault.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let adapter = Arc::clone(self);
        std::thread::Builder::new()
            .name("radio-supervisor".into())
            .spawn(move || adapter.supervise())
            .expect("failed to spawn radio supervisor")
    }

    fn supervise(&self) {
        let mut backoff = RECONNECT_INITIAL;
        while !self.shutdown.load(Relaxed) {
            match self.open_port() {
                Ok(port) => {
                    tracing::info!("radio connected on {}", self.cfg.port);
                    backoff = RECONNECT_INITIAL;
                    self.connected.store(true, Relaxed);
                    let exit = self.read_loop(port);
                    self.connected.store(false, Relaxed);
                    *self.writer.lock().expect("radio writer lock poisoned") = None;
                    match exit {
                        ReadExit::Shutdown => break,
                        ReadExit::Disconnected(e) => {
                            tracing::warn!(
                                "radio link lost: {}  reconnecting in {:?}",
                                e,
                                backoff
                            );
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "cannot open {}: {:#}  retrying in {:?}",
                        self.cfg.port,
                        e,
                        backoff
                    );
                }
            }
            self.interruptible_sleep(backoff);
            backoff = next_backoff(backoff);
        }
        tracing::info!("radio supervisor stopped");
    }

    fn open_port(&self) -> Result<Box<dyn SerialPort>> {
        let port = serialport::new(&self.cfg.port, self.cfg.baud)
            .timeout(READ_POLL)
            .open()
            .with_context(|| format!("failed to open serial port {}", self.cfg.port))?;
        let mut writer = port.try_clone().context("failed to clone serial handle")?;
        writer.set_timeout(WRITE_TIMEOUT).ok();
        *self.writer.lock().expect("radio writer lock poisoned") = Some(writer);
        Ok(port)
    }

    fn read_loop(&self, port: Box<dyn SerialPort>) -> ReadExit {
        let mut reader = BufReader::new(port);
        let mut line = String::new();
        loop {
            if self.shutdown.load(Relaxed) {
                return ReadExit::Shutdown;
            }
            match reader.read_line(&mut line) {
                Ok(0) => {
                    return ReadExit::Disconnected(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "modem closed the link",
                    ))
                }
                Ok(_) => {
                    self.handle_line(line.trim());
                    line.clear();
                }
                // Poll tick; a partial line stays buffered for the next read.
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => return ReadExit::Disconnected(e),
            }
        }
    }

    fn handle_line(&self, line: &str) {
        if line.is_empty() {
            return;
        }
        let frame: ModemFrame = match serde_json::from_str(line) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!("unparseable modem line ({}): {}", e, line);
                return;
            }
        };
        if let Some(packet) = packet_from_frame(frame) {
            if self.packet_tx.send(packet).is_err() {
                tracing::debug!("packet channel closed; dropping inbound packet");
            }
        }
    }

    /// Serialize and write the message as one or more `send` frames.
    /// Holds the writer for the whole message so split frames stay contiguous.
    fn transmit(&self, to: &str, text: &str) -> bool {
        let parts = split_text(text, self.cfg.mtu);
        let mut slot = self.writer.lock().expect("radio writer lock poisoned");
        let Some(writer) = slot.as_mut() else {
            return false;
        };
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                std::thread::sleep(FRAME_GAP);
            }
            let frame = ModemFrame::Send { to: to.to_string(), text: part.clone() };
            let mut wire = match serde_json::to_string(&frame) {
                Ok(w) => w,
                Err(e) => {
                    tracing::warn!("failed to encode outbound frame: {}", e);
                    return false;
                }
            };
            wire.push('\n');
            if let Err(e) = writer.write_all(wire.as_bytes()).and_then(|_| writer.flush()) {
                tracing::warn!("radio transmit to {} failed: {}", to, e);
                return false;
            }
        }
        true
    }

    fn interruptible_sleep(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while Instant::now() < deadline && !self.shutdown.load(Relaxed) {
            std::thread::sleep(Duration::from_millis(250));
        }
    }
}

impl AckTransport for RadioAdapter {
    fn send_direct(&self, origin: &str, text: &str) -> bool {
        self.transmit(origin, text)
    }

    fn send_broadcast(&self, text: &str) -> bool {
        self.transmit(BROADCAST_ADDR, text)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Relaxed)
    }
}

fn packet_from_frame(frame: ModemFrame) -> Option<RadioPacket> {
    let received_at = Instant::now();
    match frame {
        ModemFrame::Text { from, text, lat, lon } => {
            Some(RadioPacket::Text { origin: from, text, lat, lon, received_at })
        }
        ModemFrame::Position { from, lat, lon } => {
            Some(RadioPacket::Position { origin: from, lat, lon, received_at })
        }
        // Our own transmissions echoed back; nothing to dispatch.
        ModemFrame::Send { .. } => None,
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(RECONNECT_MAX)
}

/// Split on char boundaries so every piece fits the modem MTU.
fn split_text(text: &str, mtu: usize) -> Vec<String> {
    let mtu = mtu.max(4);
    let mut parts = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if current.len() + ch.len_utf8() > mtu && !current.is_empty() {
            parts.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() || parts.is_empty() {
        parts.push(current);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip_text() {
        let frame = ModemFrame::Text {
            from: "!a3f01c2e".into(),
            text: "#osmnote tree down".into(),
            lat: Some(4.6097),
            lon: Some(-74.0817),
        };
        let wire = serde_json::to_string(&frame).unwrap();
        assert!(!wire.contains('\n'));
        assert_eq!(serde_json::from_str::<ModemFrame>(&wire).unwrap(), frame);
    }

    #[test]
    fn test_frame_text_without_position() {
        let wire = r#"{"type":"text","from":"!a1","text":"hola"}"#;
        let frame: ModemFrame = serde_json::from_str(wire).unwrap();
        assert_eq!(
            frame,
            ModemFrame::Text { from: "!a1".into(), text: "hola".into(), lat: None, lon: None }
        );
        // None fields stay off the wire.
        assert!(!serde_json::to_string(&frame).unwrap().contains("lat"));
    }

    #[test]
    fn test_frame_roundtrip_position_and_send() {
        let pos = ModemFrame::Position { from: "!a1".into(), lat: 4.61, lon: -74.08 };
        let wire = serde_json::to_string(&pos).unwrap();
        assert_eq!(serde_json::from_str::<ModemFrame>(&wire).unwrap(), pos);

        let send = ModemFrame::Send { to: BROADCAST_ADDR.into(), text: "hi".into() };
        let wire = serde_json::to_string(&send).unwrap();
        assert_eq!(serde_json::from_str::<ModemFrame>(&wire).unwrap(), send);
    }

    #[test]
    fn test_unknown_frame_type_is_an_error() {
        assert!(serde_json::from_str::<ModemFrame>(r#"{"type":"telemetry","from":"!a1"}"#).is_err());
        assert!(serde_json::from_str::<ModemFrame>("not json at all").is_err());
    }

    #[test]
    fn test_packet_from_frame() {
        let pkt = packet_from_frame(ModemFrame::Position {
            from: "!a1".into(),
            lat: 1.0,
            lon: 2.0,
        });
        assert!(matches!(pkt, Some(RadioPacket::Position { .. })));

        let pkt = packet_from_frame(ModemFrame::Send { to: "!a1".into(), text: "x".into() });
        assert!(pkt.is_none());
    }

    #[test]
    fn test_split_text_short_payload() {
        assert_eq!(split_text("hola", 200), vec!["hola"]);
        assert_eq!(split_text("", 200), vec![""]);
    }

    #[test]
    fn test_split_text_reassembles() {
        let text = "a".repeat(450);
        let parts = split_text(&text, 200);
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|p| p.len() <= 200));
        assert_eq!(parts.concat(), text);
    }

    #[test]
    fn test_split_text_multibyte_boundaries() {
        // 3-byte chars with an MTU that is not a multiple of 3.
        let text = "árbol caído en la vía ñ".repeat(20);
        let parts = split_text(&text, 10);
        assert!(parts.iter().all(|p| p.len() <= 10));
        assert_eq!(parts.concat(), text);
        for p in &parts {
            assert!(std::str::from_utf8(p.as_bytes()).is_ok());
        }
    }

    #[test]
    fn test_next_backoff_caps_at_30s() {
        let mut b = RECONNECT_INITIAL;
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(b.as_secs());
            b = next_backoff(b);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }
}
