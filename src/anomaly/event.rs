//! Structured log events and the raw-line parser.

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::anomaly::template::{TemplateExtractor, TemplateId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, LogLevel::Error | LogLevel::Critical)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" | "TRACE" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" | "FATAL" => Ok(LogLevel::Critical),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

/// One parsed log line. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub raw_text: String,
    pub template_id: TemplateId,
    pub template: String,
    pub timestamp: DateTime<Utc>,
    pub source_component: String,
    pub level: LogLevel,
}

/// Turns raw log lines into [`LogEvent`]s.
///
/// Recognises an ISO-8601 timestamp, a level keyword and a `[component]` or
/// `(component)` source tag anywhere in the line. Missing parts fall back to
/// the ingestion time, `INFO`, and the caller's default source.
#[derive(Debug, Clone)]
pub struct LogParser {
    timestamp: Regex,
    level: Regex,
    source: Regex,
    extractor: Arc<dyn TemplateExtractor>,
}

impl LogParser {
    pub fn new(extractor: Arc<dyn TemplateExtractor>) -> Result<Self, regex::Error> {
        Ok(Self {
            timestamp: Regex::new(
                r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
            )?,
            level: Regex::new(r"\b(DEBUG|TRACE|INFO|WARN|WARNING|ERROR|CRITICAL|FATAL)\b")?,
            source: Regex::new(r"\[([\w.-]+)\]|\(([\w.-]+)\)")?,
            extractor,
        })
    }

    pub fn extractor(&self) -> &Arc<dyn TemplateExtractor> {
        &self.extractor
    }

    pub fn parse(&self, line: &str, default_source: &str, received_at: DateTime<Utc>) -> LogEvent {
        let line = line.trim_end();

        let timestamp_match = self.timestamp.find(line);
        let timestamp = timestamp_match
            .and_then(|m| parse_timestamp(m.as_str()))
            .unwrap_or(received_at);
        let rest = match timestamp_match {
            Some(m) => &line[m.end()..],
            None => line,
        };

        let level_match = self.level.captures(rest).and_then(|caps| caps.get(1));
        let level = level_match
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(LogLevel::Info);

        let source_component = self
            .source
            .captures(rest)
            .and_then(|caps| caps.get(1).or_else(|| caps.get(2)))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| default_source.to_string());

        let message = match level_match {
            Some(m) => rest[m.end()..].trim(),
            None => rest.trim(),
        };

        self.build(line.to_string(), message, source_component, timestamp, level)
    }

    /// Build an event from already-structured fields
    pub fn event(
        &self,
        raw_text: &str,
        source_component: &str,
        timestamp: DateTime<Utc>,
        level: LogLevel,
    ) -> LogEvent {
        self.build(
            raw_text.to_string(),
            raw_text,
            source_component.to_string(),
            timestamp,
            level,
        )
    }

    fn build(
        &self,
        raw_text: String,
        message: &str,
        source_component: String,
        timestamp: DateTime<Utc>,
        level: LogLevel,
    ) -> LogEvent {
        let (template_id, template) = self.extractor.extract(message);
        LogEvent {
            raw_text,
            template_id,
            template,
            timestamp,
            source_component,
            level,
        }
    }
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let normalized = text.replacen(' ', "T", 1);
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::template::MaskingTemplateExtractor;
    use chrono::TimeZone;

    fn parser() -> LogParser {
        LogParser::new(Arc::new(MaskingTemplateExtractor::new().unwrap())).unwrap()
    }

    #[test]
    fn test_parse_full_line() {
        let parser = parser();
        let received = Utc::now();
        let event = parser.parse(
            "2024-03-01T10:15:30Z ERROR [scraper] Fetch of https://rival.io failed after 3 retries",
            "app",
            received,
        );

        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 30).unwrap()
        );
        assert_eq!(event.level, LogLevel::Error);
        assert_eq!(event.source_component, "scraper");
        assert_eq!(event.template, "[scraper] Fetch of <URL> failed after <NUM> retries");
    }

    #[test]
    fn test_parse_defaults() {
        let parser = parser();
        let received = Utc::now();
        let event = parser.parse("cache warmed", "worker", received);

        assert_eq!(event.timestamp, received);
        assert_eq!(event.level, LogLevel::Info);
        assert_eq!(event.source_component, "worker");
    }

    #[test]
    fn test_naive_timestamp_and_fatal_level() {
        let parser = parser();
        let event = parser.parse("2024-03-01 08:00:00.250 FATAL (ai_processor) out of memory", "app", Utc::now());

        assert_eq!(event.level, LogLevel::Critical);
        assert_eq!(event.source_component, "ai_processor");
        assert_eq!(event.timestamp.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!("warn".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert!(LogLevel::Critical.is_error());
        assert!(!LogLevel::Warning.is_error());
    }
}
