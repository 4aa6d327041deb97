/// Per-cycle result reporting: one line per cycle on stdout.
use crate::config::{ReportConfig, ReportFormat};
use crate::extract::Classification;
use crate::window::WindowEnd;
use chrono::{DateTime, Local};
use serde::Serialize;

/// Everything reported about one finished cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub finished_at: DateTime<Local>,
    pub value: Option<u64>,
    pub classification: Classification,
    pub threshold: u64,
    pub greater: u64,
    pub lesser: u64,
    pub ended_by: WindowEnd,
    pub window_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,
}

/// Receives each cycle's report.
pub trait ReportSink {
    fn emit(&mut self, report: &CycleReport);
}

/// Human-readable single-line rendering.
pub fn render_text(report: &CycleReport, include_line: bool) -> String {
    let stamp = report.finished_at.format("%H:%M:%S");
    let counters = format!("gt={} lt={}", report.greater, report.lesser);
    match report.value {
        None => format!(
            "{stamp} [result] cycle={} no match within {}ms window | {counters}",
            report.cycle, report.window_ms
        ),
        Some(value) => {
            let relation = match report.classification {
                Classification::Greater => ">",
                Classification::Lesser => "<",
                Classification::Equal | Classification::NoMatch => "=",
            };
            let mut out = format!(
                "{stamp} [result] cycle={} value={value} ({} {relation} {}, {}) | {counters}",
                report.cycle, value, report.threshold, report.classification
            );
            if include_line {
                if let Some(line) = &report.line {
                    out.push_str(" | line: ");
                    out.push_str(line);
                }
            }
            out
        }
    }
}

/// JSON-lines rendering. The source line is dropped unless `include_line`.
pub fn render_json(report: &CycleReport, include_line: bool) -> serde_json::Result<String> {
    if include_line || report.line.is_none() {
        return serde_json::to_string(report);
    }
    let trimmed = CycleReport {
        line: None,
        ..report.clone()
    };
    serde_json::to_string(&trimmed)
}

/// Writes reports to stdout in the configured format.
pub struct ConsoleSink {
    format: ReportFormat,
    include_line: bool,
}

impl ConsoleSink {
    pub fn new(config: &ReportConfig) -> Self {
        Self {
            format: config.format,
            include_line: config.include_line,
        }
    }
}

impl ReportSink for ConsoleSink {
    fn emit(&mut self, report: &CycleReport) {
        match self.format {
            ReportFormat::Text => println!("{}", render_text(report, self.include_line)),
            ReportFormat::Json => match render_json(report, self.include_line) {
                Ok(json) => println!("{json}"),
                Err(e) => tracing::warn!(error = %e, cycle = report.cycle, "failed to serialize report"),
            },
        }
    }
}
