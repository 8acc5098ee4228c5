//! Export Module
//!
//! Writes dissected records for consumers outside the process: plain text for
//! operators, a JSON document or JSON Lines for other security tooling.

use std::io::Write;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::classifier::AnalysisRecord;
use crate::dissector::AnalysisSink;

/// Output format for exports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    JsonLines, // One JSON object per line (JSONL)
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "jsonl" | "jsonlines" => Ok(Self::JsonLines),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
            Self::JsonLines => write!(f, "jsonl"),
        }
    }
}

/// JSON document written when the run completes.
#[derive(Serialize)]
pub struct JsonReport<'a> {
    pub version: &'static str,
    pub timestamp: String,
    pub record_count: usize,
    pub strobe_count: usize,
    pub records: &'a [AnalysisRecord],
}

impl<'a> JsonReport<'a> {
    pub fn new(records: &'a [AnalysisRecord]) -> Self {
        Self {
            version: "1.0",
            timestamp: Utc::now().to_rfc3339(),
            record_count: records.len(),
            strobe_count: records.iter().filter(|r| r.is_strobe()).count(),
            records,
        }
    }
}

/// Formats a single record as one line of text.
pub fn format_record_text(record: &AnalysisRecord) -> String {
    format!(
        "[{}] {} <- {} | Conns: {} | Bytes: {} | Timestamps: {} | Invalid cert: {} | Resolved: [{}]",
        record.kind,
        record.fqdn,
        record.src,
        record.connection_count,
        record.total_bytes,
        record.timestamps.len(),
        if record.invalid_cert { "yes" } else { "no" },
        format_addrs(&record.resolved_addrs()),
    )
}

fn format_addrs(addrs: &[IpAddr]) -> String {
    addrs
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

struct WriterState<W> {
    out: W,
    /// Held back until completion when writing a single JSON document.
    pending: Vec<AnalysisRecord>,
    written: usize,
    strobes: usize,
}

/// [`AnalysisSink`] that writes records to any `Write` in the chosen format.
///
/// Text and JSON Lines are written as records arrive. JSON is buffered and
/// written as one document on `closed`.
pub struct RecordWriter<W: Write + Send> {
    format: OutputFormat,
    state: Mutex<WriterState<W>>,
}

impl<W: Write + Send> RecordWriter<W> {
    pub fn new(out: W, format: OutputFormat) -> Self {
        Self {
            format,
            state: Mutex::new(WriterState {
                out,
                pending: Vec::new(),
                written: 0,
                strobes: 0,
            }),
        }
    }

    pub fn into_inner(self) -> W {
        self.state
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .out
    }

    fn lock(&self) -> MutexGuard<'_, WriterState<W>> {
        // A panic while writing leaves the buffer usable.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_record(
        state: &mut WriterState<W>,
        format: OutputFormat,
        record: AnalysisRecord,
    ) -> std::io::Result<()> {
        match format {
            OutputFormat::Text => writeln!(state.out, "{}", format_record_text(&record))?,
            OutputFormat::JsonLines => {
                serde_json::to_writer(&mut state.out, &record)?;
                state.out.write_all(b"\n")?;
            }
            OutputFormat::Json => {
                state.pending.push(record);
                return Ok(());
            }
        }
        Ok(())
    }

    fn finish(state: &mut WriterState<W>, format: OutputFormat) -> std::io::Result<()> {
        match format {
            OutputFormat::Json => {
                let report = JsonReport::new(&state.pending);
                serde_json::to_writer_pretty(&mut state.out, &report)?;
                state.out.write_all(b"\n")?;
            }
            OutputFormat::Text => {
                writeln!(
                    state.out,
                    "--- {} records ({} strobes) ---",
                    state.written, state.strobes
                )?;
            }
            OutputFormat::JsonLines => {}
        }
        state.out.flush()
    }
}

impl<W: Write + Send> AnalysisSink for RecordWriter<W> {
    fn dissected(&self, record: AnalysisRecord) {
        let mut state = self.lock();
        let strobe = record.is_strobe();
        let fqdn = record.fqdn.clone();

        match Self::write_record(&mut state, self.format, record) {
            Ok(()) => {
                state.written += 1;
                if strobe {
                    state.strobes += 1;
                }
            }
            Err(e) => warn!(fqdn = %fqdn, error = %e, "failed to write analysis record"),
        }
    }

    fn closed(&self) {
        let mut state = self.lock();
        if let Err(e) = Self::finish(&mut state, self.format) {
            warn!(error = %e, "failed to finalize {} output", self.format);
            return;
        }
        debug!("Output closed after {} records", state.written);
    }
}
