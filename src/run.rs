//! `notegate run` — the gateway daemon.
//!
//! Wires the pipeline together and drives inbound dispatch: the radio
//! supervisor feeds decoded packets into a bounded channel, this thread
//! dispatches them through the gateway, and the flush worker drains the
//! pending queue in the background. SIGINT/SIGTERM raise a shared flag
//! that every loop observes at its next suspension point.

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, RecvTimeoutError};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

use note_pipeline::{
    gateway, AckTransport, FlushWorker, Gateway, GatewayClock, Notifier, NotePublisher,
    PositionCache, PublisherConfig, RadioAdapter, RadioConfig, RadioPacket, Store,
};

use crate::config::GatewayConfig;

/// Dispatch poll tick; bounds how long shutdown takes to observe.
const DISPATCH_POLL: Duration = Duration::from_millis(250);

pub fn run(config: &GatewayConfig) -> Result<()> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;

    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGINT, shutdown.clone()).context("failed to register SIGINT handler")?;
    flag::register(SIGTERM, shutdown.clone()).context("failed to register SIGTERM handler")?;

    let clock = Arc::new(GatewayClock::new());
    let store = Arc::new(Store::open(&config.db_path())?);
    store.init_boot_state(clock.boot_wallclock())?;
    let positions = Arc::new(PositionCache::new());

    let (packet_tx, packet_rx) = bounded::<RadioPacket>(256);
    let radio = Arc::new(RadioAdapter::new(
        RadioConfig {
            port: config.serial_port.clone(),
            baud: config.serial_baud,
            mtu: config.modem_mtu,
        },
        packet_tx,
        shutdown.clone(),
    ));
    let radio_handle = radio.start();
    let transport: Arc<dyn AckTransport> = radio.clone();

    let publisher = Arc::new(NotePublisher::new(
        PublisherConfig {
            api_base: config.api_base.clone(),
            rate_limit: config.rate_limit,
            dry_run: config.dry_run,
            lang: config.lang,
        },
        clock.clone(),
    )?);
    let notifier = Arc::new(Notifier::new(
        transport.clone(),
        store.clone(),
        config.lang,
        config.dry_run,
    ));

    let (flush_stop_tx, flush_stop_rx) = bounded::<()>(1);
    let flush_handle = FlushWorker::new(
        store.clone(),
        publisher.clone(),
        notifier.clone(),
        clock.clone(),
        config.worker_interval,
        shutdown.clone(),
    )
    .spawn(flush_stop_rx);

    let broadcast = if config.daily_broadcast {
        let (tx, rx) = bounded::<()>(1);
        Some((gateway::spawn_daily_broadcast(notifier.clone(), rx), tx))
    } else {
        None
    };

    let gateway = Gateway::new(
        clock,
        positions,
        store,
        config.policy(),
        publisher,
        notifier,
        transport,
        config.lang,
        config.display_tz,
    );

    tracing::info!(
        "notegate up: serial={} db={} dry_run={}",
        config.serial_port,
        config.db_path().display(),
        config.dry_run
    );

    while !shutdown.load(Relaxed) {
        match packet_rx.recv_timeout(DISPATCH_POLL) {
            Ok(packet) => gateway.handle_packet(packet),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    tracing::info!("shutting down");
    let _ = flush_stop_tx.send(());
    if let Some((handle, tx)) = broadcast {
        let _ = tx.send(());
        let _ = handle.join();
    }
    let _ = flush_handle.join();

    // Dispatch whatever the reader buffered before it stopped; acks sent
    // after the port closes return false and are dropped.
    while let Ok(packet) = packet_rx.try_recv() {
        gateway.handle_packet(packet);
    }
    let _ = radio_handle.join();

    tracing::info!("notegate stopped");
    Ok(())
}
