use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use tailscope_types::LogLevel;

/// Structure recovered from one raw line of text
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedLine {
    pub timestamp: Option<DateTime<Utc>>,
    pub level: LogLevel,
    /// Text to show; the extracted message for JSON lines
    pub message: String,
    pub is_json: bool,
}

/// JSON keys that carry the level, most common first
const LEVEL_KEYS: [&str; 8] = [
    "level", "lvl", "severity", "log.level", "loglevel", "log_level", "Level", "LEVEL",
];

const MESSAGE_KEYS: [&str; 5] = ["msg", "message", "Message", "log", "text"];

const TIME_KEYS: [&str; 5] = ["time", "timestamp", "ts", "@timestamp", "Timestamp"];

/// Level keywords tried in order within each text pattern style
const TEXT_LEVELS: [(&str, LogLevel); 11] = [
    ("FATAL", LogLevel::Fatal),
    ("PANIC", LogLevel::Fatal),
    ("CRITICAL", LogLevel::Fatal),
    ("ERROR", LogLevel::Error),
    ("ERR", LogLevel::Error),
    ("WARNING", LogLevel::Warn),
    ("WARN", LogLevel::Warn),
    ("INFO", LogLevel::Info),
    ("DEBUG", LogLevel::Debug),
    ("TRACE", LogLevel::Trace),
    ("VERBOSE", LogLevel::Trace),
];

/// Log parser for extracting structure from raw log lines
pub struct LogParser;

impl LogParser {
    pub fn parse(raw: &str) -> ParsedLine {
        let (timestamp, content) = Self::extract_timestamp(raw);

        if let Some(object) = Self::try_parse_json(content) {
            return ParsedLine {
                timestamp: timestamp.or_else(|| Self::timestamp_from_json(&object)),
                level: Self::level_from_json(&object),
                message: Self::message_from_json(&object).unwrap_or_else(|| content.trim().to_string()),
                is_json: true,
            };
        }

        ParsedLine {
            timestamp,
            level: Self::level_from_text(content),
            message: content.to_string(),
            is_json: false,
        }
    }

    /// Whether a raw line continues the previous entry (stack frames,
    /// wrapped output) rather than starting a new one
    pub fn is_continuation(raw: &str) -> bool {
        if raw.is_empty() {
            return false;
        }
        if raw.starts_with([' ', '\t']) {
            return true;
        }
        raw.starts_with("Caused by:") || raw.starts_with("at ") || raw.starts_with("...")
    }

    /// Split an RFC 3339 timestamp (e.g. `2024-01-15T10:30:00.123Z`) off the
    /// start of the line
    fn extract_timestamp(raw: &str) -> (Option<DateTime<Utc>>, &str) {
        if raw.len() < 20 {
            return (None, raw);
        }

        // The timestamp ends at the first space within the first ~40 bytes
        let search_end = Self::floor_char_boundary(raw, 40.min(raw.len()));
        let head = raw.get(..search_end).unwrap_or_default();
        let end = head.find(' ').unwrap_or(head.len());

        match DateTime::parse_from_rfc3339(&raw[..end]) {
            Ok(ts) => (Some(ts.with_timezone(&Utc)), raw[end..].trim_start()),
            Err(_) => (None, raw),
        }
    }

    /// Find the largest valid char boundary <= the given byte index
    fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
        if idx >= s.len() {
            return s.len();
        }
        while idx > 0 && !s.is_char_boundary(idx) {
            idx -= 1;
        }
        idx
    }

    fn try_parse_json(content: &str) -> Option<Map<String, Value>> {
        let trimmed = content.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        match serde_json::from_str::<Value>(trimmed).ok()? {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }

    fn level_from_json(object: &Map<String, Value>) -> LogLevel {
        for key in LEVEL_KEYS {
            match object.get(key) {
                Some(Value::String(s)) => return LogLevel::from_str(s),
                // bunyan/pino style numeric levels
                Some(Value::Number(n)) => {
                    if let Some(num) = n.as_u64() {
                        return match num {
                            0..=10 => LogLevel::Trace,
                            11..=20 => LogLevel::Debug,
                            21..=30 => LogLevel::Info,
                            31..=40 => LogLevel::Warn,
                            41..=50 => LogLevel::Error,
                            _ => LogLevel::Fatal,
                        };
                    }
                }
                _ => {}
            }
        }
        LogLevel::Unknown
    }

    fn message_from_json(object: &Map<String, Value>) -> Option<String> {
        MESSAGE_KEYS.iter().find_map(|key| match object.get(*key)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        })
    }

    fn timestamp_from_json(object: &Map<String, Value>) -> Option<DateTime<Utc>> {
        TIME_KEYS.iter().find_map(|key| {
            let text = object.get(*key)?.as_str()?;
            DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|ts| ts.with_timezone(&Utc))
        })
    }

    /// Level from plain text: `[ERROR]`, then `ERROR:`, then ` ERROR `,
    /// then a keyword at the start of the line
    fn level_from_text(content: &str) -> LogLevel {
        let upper = content.to_uppercase();

        let styles: [fn(&str, &str) -> bool; 3] = [
            |text, keyword| text.contains(&format!("[{keyword}]")),
            |text, keyword| text.contains(&format!("{keyword}:")),
            |text, keyword| text.contains(&format!(" {keyword} ")),
        ];
        for matches in styles {
            if let Some((_, level)) = TEXT_LEVELS.iter().find(|(k, _)| matches(&upper, k)) {
                return *level;
            }
        }

        let trimmed = upper.trim_start();
        TEXT_LEVELS
            .iter()
            .find(|(keyword, _)| trimmed.starts_with(keyword))
            .map_or(LogLevel::Unknown, |(_, level)| *level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp_prefix() {
        let parsed = LogParser::parse("2024-01-15T10:30:00.123456789Z some log message");
        assert_eq!(
            parsed.timestamp,
            DateTime::parse_from_rfc3339("2024-01-15T10:30:00.123456789Z")
                .ok()
                .map(|ts| ts.with_timezone(&Utc))
        );
        assert_eq!(parsed.message, "some log message");
        assert!(!parsed.is_json);
    }

    #[test]
    fn test_parse_offset_timestamp() {
        let parsed = LogParser::parse("2024-01-15T12:30:00+02:00 WARN disk almost full");
        assert_eq!(
            parsed.timestamp.map(|ts| ts.to_rfc3339()),
            Some("2024-01-15T10:30:00+00:00".to_string())
        );
        assert_eq!(parsed.level, LogLevel::Warn);
    }

    #[test]
    fn test_parse_json_log() {
        let line = r#"{"level":"error","msg":"something failed","time":"2024-01-15T10:30:00Z"}"#;
        let parsed = LogParser::parse(line);
        assert!(parsed.is_json);
        assert_eq!(parsed.level, LogLevel::Error);
        assert_eq!(parsed.message, "something failed");
        assert!(parsed.timestamp.is_some());
    }

    #[test]
    fn test_parse_json_numeric_level() {
        let parsed = LogParser::parse(r#"{"level":40,"message":"slow request"}"#);
        assert_eq!(parsed.level, LogLevel::Warn);
        assert_eq!(parsed.message, "slow request");
        assert!(parsed.timestamp.is_none());
    }

    #[test]
    fn test_parse_json_without_message_keeps_content() {
        let parsed = LogParser::parse(r#"{"status":200}"#);
        assert!(parsed.is_json);
        assert_eq!(parsed.level, LogLevel::Unknown);
        assert_eq!(parsed.message, r#"{"status":200}"#);
    }

    #[test]
    fn test_parse_text_level() {
        assert_eq!(LogParser::parse("[ERROR] something went wrong").level, LogLevel::Error);
        assert_eq!(LogParser::parse("warning: low memory").level, LogLevel::Warn);
        assert_eq!(LogParser::parse("main INFO started").level, LogLevel::Info);
        assert_eq!(LogParser::parse("DEBUG cache miss").level, LogLevel::Debug);
        assert_eq!(LogParser::parse("nothing here").level, LogLevel::Unknown);
    }

    #[test]
    fn test_continuation_lines() {
        assert!(LogParser::is_continuation("    at com.example.Main.run(Main.java:12)"));
        assert!(LogParser::is_continuation("\tat main"));
        assert!(LogParser::is_continuation("Caused by: java.io.IOException"));
        assert!(!LogParser::is_continuation("2024-01-15T10:30:00Z started"));
        assert!(!LogParser::is_continuation(""));
    }

    #[test]
    fn test_parse_multibyte_utf8_no_panic() {
        // Box-drawing characters are 3 bytes each
        let parsed = LogParser::parse("─────────────────────────────────────────");
        assert!(parsed.timestamp.is_none());

        let parsed = LogParser::parse("2024-01-15T10:30:00Z ╭────────────────────────────╮");
        assert!(parsed.timestamp.is_some());
        assert_eq!(parsed.message, "╭────────────────────────────╮");
    }
}
