//! Inbound text classification: hashtag grammar → tagged command.
//!
//! Tags are word-bounded, so `#osmnote` never matches inside `#osmnotetest`.
//! The report tag accepts `#osmnote`, `#osm-note` and `#osm_note`, all
//! case-insensitive. Text without a recognized tag maps to [`Command::None`]
//! and the pipeline stays silent.

use regex::Regex;
use std::sync::OnceLock;

pub const LIST_DEFAULT: usize = 5;
pub const LIST_MIN: usize = 1;
pub const LIST_MAX: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Report text with the tag stripped; may be empty, which the policy
    /// engine turns into the missing-text rejection.
    Report { text: String },
    Help,
    Status,
    Count,
    List { limit: usize },
    Queue,
    Nodes,
    None,
}

fn report_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(?:^|\s)#osm[-_]?note\b").unwrap())
}

fn info_re(cell: &'static OnceLock<Regex>, tag: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(&format!(r"(?i)(?:^|\s)#osm{tag}\b")).unwrap())
}

static HELP_RE: OnceLock<Regex> = OnceLock::new();
static STATUS_RE: OnceLock<Regex> = OnceLock::new();
static COUNT_RE: OnceLock<Regex> = OnceLock::new();
static LIST_RE: OnceLock<Regex> = OnceLock::new();
static QUEUE_RE: OnceLock<Regex> = OnceLock::new();
static NODES_RE: OnceLock<Regex> = OnceLock::new();

/// Classify one inbound text payload.
pub fn parse(text: &str) -> Command {
    if let Some(m) = report_re().find(text) {
        let mut remaining = String::with_capacity(text.len());
        remaining.push_str(&text[..m.start()]);
        remaining.push(' ');
        remaining.push_str(&text[m.end()..]);
        return Command::Report { text: remaining.trim().to_string() };
    }
    if info_re(&HELP_RE, "help").is_match(text) {
        return Command::Help;
    }
    if info_re(&STATUS_RE, "status").is_match(text) {
        return Command::Status;
    }
    if info_re(&COUNT_RE, "count").is_match(text) {
        return Command::Count;
    }
    if let Some(m) = info_re(&LIST_RE, "list").find(text) {
        return Command::List { limit: parse_list_limit(&text[m.end()..]) };
    }
    if info_re(&QUEUE_RE, "queue").is_match(text) {
        return Command::Queue;
    }
    if info_re(&NODES_RE, "nodes").is_match(text) {
        return Command::Nodes;
    }
    Command::None
}

/// Optional decimal argument after `#osmlist`; default 5, clamped to [1, 20],
/// anything unparseable falls back to the default.
fn parse_list_limit(rest: &str) -> usize {
    match rest.split_ascii_whitespace().next() {
        Some(tok) => match tok.parse::<i64>() {
            Ok(n) => (n.clamp(LIST_MIN as i64, LIST_MAX as i64)) as usize,
            Err(_) => LIST_DEFAULT,
        },
        None => LIST_DEFAULT,
    }
}

/// Trim and collapse every run of ASCII whitespace to a single space.
/// Unicode case and diacritics are left untouched.
pub fn normalize(text: &str) -> String {
    text.split(|c: char| c.is_ascii_whitespace())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_spellings() {
        for tag in ["#osmnote", "#osm-note", "#osm_note", "#OSMNOTE", "#Osm-Note"] {
            let cmd = parse(&format!("{tag} tree down"));
            assert_eq!(cmd, Command::Report { text: "tree down".into() }, "tag {tag}");
        }
    }

    #[test]
    fn test_report_word_bounded() {
        assert_eq!(parse("#osmnotetest hello"), Command::None);
        assert_eq!(parse("x#osmnote hello"), Command::None);
        assert_eq!(
            parse("hello #osmnote: tree"),
            Command::Report { text: "hello : tree".into() }
        );
    }

    #[test]
    fn test_report_empty_remainder() {
        assert_eq!(parse("#osmnote"), Command::Report { text: String::new() });
        assert_eq!(parse("  #osmnote   "), Command::Report { text: String::new() });
    }

    #[test]
    fn test_report_tag_mid_text() {
        assert_eq!(
            parse("puente caído #osmnote en la calle 45"),
            Command::Report { text: "puente caído en la calle 45".into() }
        );
    }

    #[test]
    fn test_info_commands() {
        assert_eq!(parse("#osmhelp"), Command::Help);
        assert_eq!(parse("#OSMSTATUS"), Command::Status);
        assert_eq!(parse("#osmcount"), Command::Count);
        assert_eq!(parse("#osmqueue"), Command::Queue);
        assert_eq!(parse("#osmnodes"), Command::Nodes);
    }

    #[test]
    fn test_list_argument() {
        assert_eq!(parse("#osmlist"), Command::List { limit: 5 });
        assert_eq!(parse("#osmlist 10"), Command::List { limit: 10 });
        assert_eq!(parse("#osmlist 99"), Command::List { limit: 20 });
        assert_eq!(parse("#osmlist 0"), Command::List { limit: 1 });
        assert_eq!(parse("#osmlist -3"), Command::List { limit: 1 });
        assert_eq!(parse("#osmlist abc"), Command::List { limit: 5 });
    }

    #[test]
    fn test_no_tag_is_none() {
        assert_eq!(parse("just chatting on the mesh"), Command::None);
        assert_eq!(parse(""), Command::None);
        assert_eq!(parse("#othertag hello"), Command::None);
    }

    #[test]
    fn test_report_wins_over_info() {
        // A payload carrying both tags is a report; the info tag stays in the text.
        let cmd = parse("#osmnote broken light #osmhelp");
        assert_eq!(cmd, Command::Report { text: "broken light #osmhelp".into() });
    }

    #[test]
    fn test_normalize_collapses_ascii_whitespace() {
        assert_eq!(normalize("  tree \t down \r\n here "), "tree down here");
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("   "), "");
    }

    #[test]
    fn test_normalize_idempotent_and_preserves_case() {
        let once = normalize("  Árbol   CAÍDO  ");
        assert_eq!(once, "Árbol CAÍDO");
        assert_eq!(normalize(&once), once);
    }
}
