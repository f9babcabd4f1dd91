//! `notegate status` / `notegate queue` — read-only store inspection.
//!
//! Both commands open the database read-only and never touch the radio,
//! so they are safe to run next to a live daemon.

use anyhow::Result;
use note_pipeline::{ReportStatus, Store};

use crate::config::GatewayConfig;

pub fn run(config: &GatewayConfig, limit: usize) -> Result<()> {
    let Some(store) = open(config)? else {
        return Ok(());
    };

    let total = store.count_total()?;
    let (pending, oldest) = store.pending_depth()?;
    println!("reports: {total} total, {pending} pending");
    if let Some(oldest) = oldest {
        println!(
            "oldest pending: {}",
            oldest.with_timezone(&config.display_tz).format("%Y-%m-%d %H:%M:%S")
        );
    }

    let rows = store.recent(limit)?;
    if rows.is_empty() {
        return Ok(());
    }
    println!();
    println!("{:<8} {:<8} {:<17} {:<10} text", "queue", "status", "created", "origin");
    for r in rows {
        let created = r.created_at.with_timezone(&config.display_tz).format("%m-%d %H:%M:%S");
        let status = match r.status {
            ReportStatus::Sent => format!("#{}", r.upstream_id.unwrap_or(0)),
            ReportStatus::Pending => "pending".to_string(),
        };
        println!(
            "{:<8} {:<8} {:<17} {:<10} {}",
            r.queue_id, status, created, r.origin, r.text_original
        );
    }
    Ok(())
}

pub fn queue(config: &GatewayConfig, limit: usize) -> Result<()> {
    let Some(store) = open(config)? else {
        return Ok(());
    };

    let rows = store.pending_page(limit)?;
    if rows.is_empty() {
        println!("queue is empty");
        return Ok(());
    }
    println!("{:<8} {:<17} {:<10} {:<12} text", "queue", "created", "origin", "last_error");
    for r in rows {
        let created = r.created_at.with_timezone(&config.display_tz).format("%m-%d %H:%M:%S");
        println!(
            "{:<8} {:<17} {:<10} {:<12} {}",
            r.queue_id,
            created,
            r.origin,
            r.last_error.as_deref().unwrap_or("-"),
            r.text_original
        );
    }
    Ok(())
}

fn open(config: &GatewayConfig) -> Result<Option<Store>> {
    let db = config.db_path();
    if !db.exists() {
        eprintln!("No database at {}.", db.display());
        eprintln!("Start the gateway first:  notegate run");
        return Ok(None);
    }
    Store::open_read_only(&db).map(Some)
}
