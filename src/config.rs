//! Environment-sourced gateway configuration.
//!
//! Keys are read from the process environment, backfilled from
//! `{DATA_DIR}/notegate.env` when that file exists (process env wins).
//! Malformed numeric overrides warn and fall back to their defaults so a
//! typo in the env file never keeps the daemon down.

use anyhow::{Context, Result};
use chrono::FixedOffset;
use note_pipeline::{Lang, PolicyConfig};
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_FILE: &str = "notegate.env";
pub const DB_FILE: &str = "notegate.db";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub serial_port: String,
    pub serial_baud: u32,
    pub data_dir: PathBuf,
    pub dry_run: bool,
    pub log_level: String,
    pub display_tz: FixedOffset,
    pub lang: Lang,
    pub daily_broadcast: bool,
    pub pos_good: Duration,
    pub pos_max: Duration,
    pub rate_limit: Duration,
    pub worker_interval: Duration,
    pub api_base: String,
    pub modem_mtu: usize,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let data_dir = PathBuf::from(env_or("DATA_DIR", "/var/lib/notegate"));

        let env_file = data_dir.join(ENV_FILE);
        if env_file.exists() {
            dotenvy::from_path(&env_file)
                .with_context(|| format!("failed to load {}", env_file.display()))?;
        }

        let tz_name = std::env::var("DISPLAY_TZ")
            .or_else(|_| std::env::var("TZ"))
            .unwrap_or_else(|_| "America/Bogota".to_string());
        let display_tz = parse_tz(&tz_name).unwrap_or_else(|| {
            tracing::warn!("unknown timezone {tz_name}; falling back to UTC");
            FixedOffset::east_opt(0).unwrap()
        });

        Ok(Self {
            serial_port: env_or("SERIAL_PORT", "/dev/ttyUSB0"),
            serial_baud: env_parse("SERIAL_BAUD", 115_200u32),
            dry_run: env_flag("DRY_RUN"),
            log_level: env_or("LOG_LEVEL", "info"),
            display_tz,
            lang: Lang::from_code(&env_or("GATEWAY_LANG", "es")),
            daily_broadcast: env_flag("DAILY_BROADCAST_ENABLED"),
            pos_good: Duration::from_secs(env_parse("POS_GOOD", 15u64)),
            pos_max: Duration::from_secs(env_parse("POS_MAX", 60u64)),
            rate_limit: Duration::from_secs(env_parse("OSM_RATE_LIMIT_SECONDS", 3u64)),
            worker_interval: Duration::from_secs(env_parse("WORKER_INTERVAL", 30u64)),
            api_base: env_or("OSM_API_URL", "https://api.openstreetmap.org"),
            modem_mtu: env_parse("MODEM_MTU", 200usize),
            data_dir,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }

    pub fn policy(&self) -> PolicyConfig {
        PolicyConfig { pos_good: self.pos_good, pos_max: self.pos_max }
    }
}

pub fn example_env() -> &'static str {
    "# notegate environment — place as {DATA_DIR}/notegate.env or export directly.\n\
     SERIAL_PORT=/dev/ttyUSB0\n\
     SERIAL_BAUD=115200\n\
     DATA_DIR=/var/lib/notegate\n\
     # DRY_RUN=true            # log instead of hitting OSM and the radio\n\
     LOG_LEVEL=info\n\
     DISPLAY_TZ=America/Bogota\n\
     GATEWAY_LANG=es\n\
     # DAILY_BROADCAST_ENABLED=true\n\
     # POS_GOOD=15             # seconds; fresher fixes are exact\n\
     # POS_MAX=60              # seconds; older fixes reject the report\n\
     # OSM_RATE_LIMIT_SECONDS=3\n\
     # WORKER_INTERVAL=30\n\
     # OSM_API_URL=https://api.openstreetmap.org\n\
     # MODEM_MTU=200\n"
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_flag(key: &str) -> bool {
    std::env::var(key).map(|v| parse_bool(&v)).unwrap_or(false)
}

fn env_parse<T: FromStr + Display + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("invalid {key}={raw}; using default {default}");
            default
        }),
        Err(_) => default,
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Display timezone as a fixed UTC offset. Accepts `±HH:MM` / `±HHMM` or one
/// of the common IANA names the gateway is deployed under. DST shifts are
/// ignored; the offset only drives `#osmlist` stamps and the "today" boundary.
fn parse_tz(name: &str) -> Option<FixedOffset> {
    let name = name.trim();
    if let Some(offset) = parse_offset(name) {
        return Some(offset);
    }
    let hours = match name {
        "UTC" | "Etc/UTC" => 0,
        "America/Bogota" | "America/Lima" | "America/Panama" => -5,
        "America/Mexico_City" | "America/Guatemala" | "America/Costa_Rica" => -6,
        "America/Caracas" => -4,
        "America/La_Paz" | "America/Santiago" | "America/Santo_Domingo" => -4,
        "America/Argentina/Buenos_Aires" | "America/Sao_Paulo" | "America/Montevideo" => -3,
        "America/New_York" => -5,
        "America/Chicago" => -6,
        "America/Denver" => -7,
        "America/Los_Angeles" => -8,
        "Europe/London" => 0,
        "Europe/Madrid" | "Europe/Paris" | "Europe/Berlin" => 1,
        _ => return None,
    };
    FixedOffset::east_opt(hours * 3600)
}

fn parse_offset(s: &str) -> Option<FixedOffset> {
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1i32, &s[1..]),
        b'-' => (-1i32, &s[1..]),
        _ => return None,
    };
    let (hh, mm) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None if rest.len() == 4 => rest.split_at(2),
        _ => return None,
    };
    let hours: i32 = hh.parse().ok()?;
    let minutes: i32 = mm.parse().ok()?;
    if hours > 14 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        for v in ["1", "true", "TRUE", " yes ", "on"] {
            assert!(parse_bool(v), "{v}");
        }
        for v in ["0", "false", "no", "off", "", "si"] {
            assert!(!parse_bool(v), "{v}");
        }
    }

    #[test]
    fn test_parse_tz_names() {
        assert_eq!(parse_tz("America/Bogota").unwrap().local_minus_utc(), -5 * 3600);
        assert_eq!(parse_tz("UTC").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_tz("Europe/Madrid").unwrap().local_minus_utc(), 3600);
        assert!(parse_tz("Mars/Olympus_Mons").is_none());
    }

    #[test]
    fn test_parse_tz_offsets() {
        assert_eq!(parse_tz("-05:00").unwrap().local_minus_utc(), -5 * 3600);
        assert_eq!(parse_tz("+05:30").unwrap().local_minus_utc(), 5 * 3600 + 30 * 60);
        assert_eq!(parse_tz("+0100").unwrap().local_minus_utc(), 3600);
        assert!(parse_tz("+99:00").is_none());
        assert!(parse_tz("05:00").is_none());
    }

    #[test]
    fn test_example_env_lists_every_key() {
        let example = example_env();
        for key in [
            "SERIAL_PORT", "SERIAL_BAUD", "DATA_DIR", "DRY_RUN", "LOG_LEVEL",
            "DISPLAY_TZ", "GATEWAY_LANG", "DAILY_BROADCAST_ENABLED", "POS_GOOD",
            "POS_MAX", "OSM_RATE_LIMIT_SECONDS", "WORKER_INTERVAL", "OSM_API_URL",
            "MODEM_MTU",
        ] {
            assert!(example.contains(key), "missing {key}");
        }
    }
}
