/// Line filtering, numeric extraction, and threshold classification.
///
/// A line qualifies when it contains the configured filter substring. The
/// value of a qualifying line is its last run of ASCII digits.
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

/// Maximal runs of ASCII digits. No sign, decimal point, or exponent.
static DIGIT_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9]+").unwrap());

/// A qualifying line and the value extracted from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub value: u64,
    pub line: String,
}

/// Applies the filter + last-digit-run rule to raw output lines.
#[derive(Debug, Clone)]
pub struct Extractor {
    filter: String,
}

impl Extractor {
    pub fn new(filter: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
        }
    }

    /// Value of the last digit run on a qualifying line, or `None`.
    pub fn extract(&self, line: &str) -> Option<u64> {
        if !line.contains(&self.filter) {
            return None;
        }
        let last = DIGIT_RUN.find_iter(line).last()?;
        match last.as_str().parse::<u64>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!(run = last.as_str(), error = %e, "digit run out of range, ignoring line");
                None
            }
        }
    }

    /// Extract and keep the source line alongside the value.
    pub fn observe(&self, line: &str) -> Option<Observation> {
        self.extract(line).map(|value| Observation {
            value,
            line: line.trim_end().to_string(),
        })
    }
}

/// Tracks the most recently observed qualifying line in a window.
///
/// Recency governs, not magnitude: every new observation replaces the last.
#[derive(Debug, Default)]
pub struct LastValue {
    last: Option<Observation>,
    lines_seen: u64,
}

impl LastValue {
    pub fn offer(&mut self, extractor: &Extractor, line: &str) {
        self.lines_seen += 1;
        if let Some(obs) = extractor.observe(line) {
            tracing::trace!(value = obs.value, "qualifying line");
            self.last = Some(obs);
        }
    }

    pub fn lines_seen(&self) -> u64 {
        self.lines_seen
    }

    pub fn into_inner(self) -> Option<Observation> {
        self.last
    }
}

/// Outcome of comparing a window's value against the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Greater,
    Lesser,
    Equal,
    /// No qualifying line arrived during the window.
    NoMatch,
}

impl Classification {
    pub fn of(value: Option<u64>, threshold: u64) -> Self {
        match value {
            None => Classification::NoMatch,
            Some(v) => match v.cmp(&threshold) {
                std::cmp::Ordering::Greater => Classification::Greater,
                std::cmp::Ordering::Less => Classification::Lesser,
                std::cmp::Ordering::Equal => Classification::Equal,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Greater => "greater",
            Classification::Lesser => "lesser",
            Classification::Equal => "equal",
            Classification::NoMatch => "no_match",
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
