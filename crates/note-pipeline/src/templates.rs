//! User-facing reply texts, Spanish and English.
//!
//! Every string the gateway transmits over the radio lives here so the
//! wording stays consistent between the immediate ack path and the queue
//! announcements. The deployment language is picked once at startup via
//! `GATEWAY_LANG`.

/// Reply language for radio acknowledgements and the upstream attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lang {
    Es,
    En,
}

impl Lang {
    /// Parse a `GATEWAY_LANG` value. Anything other than "en" selects Spanish,
    /// the language of the original deployment.
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_ascii_lowercase().as_str() {
            "en" => Lang::En,
            _ => Lang::Es,
        }
    }
}

pub fn ack_success(lang: Lang, upstream_id: i64, url: &str) -> String {
    match lang {
        Lang::Es => format!("✅ Nota creada: #{upstream_id}\n{url}"),
        Lang::En => format!("✅ Note created: #{upstream_id}\n{url}"),
    }
}

pub fn ack_queued(lang: Lang, queue_id: &str) -> String {
    match lang {
        Lang::Es => format!(
            "📥 Sin conexión con OSM: reporte encolado como {queue_id}. Se enviará automáticamente."
        ),
        Lang::En => format!(
            "📥 OSM unreachable: report queued as {queue_id}. It will be sent automatically."
        ),
    }
}

pub fn ack_promoted(lang: Lang, queue_id: &str, upstream_id: i64, url: &str) -> String {
    match lang {
        Lang::Es => format!("📤 Enviado desde la cola: {queue_id} → nota #{upstream_id}\n{url}"),
        Lang::En => format!("📤 Sent from queue: {queue_id} → note #{upstream_id}\n{url}"),
    }
}

pub fn missing_text(lang: Lang) -> String {
    match lang {
        Lang::Es => "⚠️ Falta el texto del reporte. Uso: #osmnote <descripción>".to_string(),
        Lang::En => "⚠️ Missing report text. Use: #osmnote <description>".to_string(),
    }
}

pub fn no_gps(lang: Lang) -> String {
    match lang {
        Lang::Es => {
            "📡 Sin posición GPS reciente. Deja el equipo al aire libre 30-60 s y reintenta."
                .to_string()
        }
        Lang::En => {
            "📡 No recent GPS position. Keep the device outdoors for 30-60 s and retry."
                .to_string()
        }
    }
}

pub fn stale_gps(lang: Lang) -> String {
    match lang {
        Lang::Es => {
            "⏳ La última posición tiene más de 60 s. Espera una posición GPS fresca y reintenta."
                .to_string()
        }
        Lang::En => {
            "⏳ Last position is older than 60 s. Wait for a fresh GPS fix and retry.".to_string()
        }
    }
}

pub fn duplicate(lang: Lang) -> String {
    match lang {
        Lang::Es => "🔁 Reporte ya registrado.".to_string(),
        Lang::En => "🔁 Report already registered.".to_string(),
    }
}

/// Summary emitted once per exhausted ack-budget window instead of per-row
/// promotion acks.
pub fn flush_summary(lang: Lang, count: usize) -> String {
    match lang {
        Lang::Es => format!("📤 {count} reportes enviados desde la cola. Usa #osmlist para detalles."),
        Lang::En => format!("📤 {count} reports flushed from the queue. Use #osmlist for details."),
    }
}

/// Appended to a queued/success ack when the cached fix was past the
/// good-age threshold at acceptance.
pub fn approximate_hint(lang: Lang) -> &'static str {
    match lang {
        Lang::Es => " (posición aproximada)",
        Lang::En => " (approximate position)",
    }
}

pub fn privacy_suffix(lang: Lang) -> &'static str {
    match lang {
        Lang::Es => "\nℹ️ Los reportes se publican en OpenStreetMap y son visibles para cualquiera.",
        Lang::En => "\nℹ️ Reports are published on OpenStreetMap and visible to anyone.",
    }
}

/// Attribution line appended to the note text sent upstream.
pub fn attribution(lang: Lang) -> &'static str {
    match lang {
        Lang::Es => "Reportado vía pasarela de radio LoRa (Meshtastic)",
        Lang::En => "Reported via LoRa mesh radio gateway (Meshtastic)",
    }
}

pub fn help(lang: Lang) -> String {
    match lang {
        Lang::Es => "📖 Comandos:\n\
             #osmnote <texto> - crear nota OSM en tu posición\n\
             #osmstatus - estado de la pasarela\n\
             #osmcount - reportes registrados\n\
             #osmlist [n] - últimos reportes\n\
             #osmqueue - cola pendiente\n\
             #osmnodes - nodos con posición conocida"
            .to_string(),
        Lang::En => "📖 Commands:\n\
             #osmnote <text> - create an OSM note at your position\n\
             #osmstatus - gateway status\n\
             #osmcount - registered reports\n\
             #osmlist [n] - latest reports\n\
             #osmqueue - pending queue\n\
             #osmnodes - nodes with a known position"
            .to_string(),
    }
}

pub fn status(
    lang: Lang,
    uptime_secs: u64,
    radio_connected: bool,
    pending: u64,
    upstream: &str,
    pos_age_secs: Option<u64>,
) -> String {
    let up = humanize_secs(uptime_secs);
    match lang {
        Lang::Es => {
            let radio = if radio_connected { "conectada" } else { "desconectada" };
            let pos = match pos_age_secs {
                Some(s) => format!("hace {}", humanize_secs(s)),
                None => "desconocida".to_string(),
            };
            format!(
                "📟 Pasarela activa {up}\nRadio: {radio}\nOSM: {upstream}\nPendientes: {pending}\nTu posición: {pos}"
            )
        }
        Lang::En => {
            let radio = if radio_connected { "connected" } else { "disconnected" };
            let pos = match pos_age_secs {
                Some(s) => format!("{} ago", humanize_secs(s)),
                None => "unknown".to_string(),
            };
            format!(
                "📟 Gateway up {up}\nRadio: {radio}\nOSM: {upstream}\nPending: {pending}\nYour position: {pos}"
            )
        }
    }
}

pub fn count(lang: Lang, total: u64, today: u64) -> String {
    match lang {
        Lang::Es => format!("📊 Reportes: {total} en total, {today} hoy."),
        Lang::En => format!("📊 Reports: {total} total, {today} today."),
    }
}

pub fn list_empty(lang: Lang) -> String {
    match lang {
        Lang::Es => "📭 Sin reportes todavía.".to_string(),
        Lang::En => "📭 No reports yet.".to_string(),
    }
}

pub fn queue_status(lang: Lang, pending: u64, oldest_age_secs: Option<u64>) -> String {
    match (lang, oldest_age_secs) {
        (Lang::Es, Some(s)) => format!(
            "🗂 {pending} pendientes, el más antiguo hace {}.",
            humanize_secs(s)
        ),
        (Lang::Es, None) => "🗂 Cola vacía.".to_string(),
        (Lang::En, Some(s)) => format!(
            "🗂 {pending} pending, oldest {} ago.",
            humanize_secs(s)
        ),
        (Lang::En, None) => "🗂 Queue is empty.".to_string(),
    }
}

pub fn nodes_empty(lang: Lang) -> String {
    match lang {
        Lang::Es => "🛰 Ningún nodo con posición conocida.".to_string(),
        Lang::En => "🛰 No nodes with a known position.".to_string(),
    }
}

pub fn nodes_header(lang: Lang, count: usize) -> String {
    match lang {
        Lang::Es => format!("🛰 {count} nodos con posición:"),
        Lang::En => format!("🛰 {count} nodes with a position:"),
    }
}

pub fn daily_broadcast(lang: Lang) -> String {
    match lang {
        Lang::Es => "📢 Pasarela OSM activa en esta malla. Envía #osmnote <texto> para crear una \
             nota en OpenStreetMap desde tu posición. #osmhelp para ver los comandos."
            .to_string(),
        Lang::En => "📢 OSM gateway active on this mesh. Send #osmnote <text> to create an \
             OpenStreetMap note at your position. #osmhelp lists the commands."
            .to_string(),
    }
}

pub fn humanize_secs(secs: u64) -> String {
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{}h {}m", h, m)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}
