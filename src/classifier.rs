//! Triage of aggregated per-source evidence.
//!
//! Each [`SourceSummary`] coming back from the store either becomes a strobe
//! record, a beacon candidate for the scoring stage, or is dropped.
//!
//! ## Rules (first match wins)
//! - `connection_count > strobe_limit`: strobe. Interval analysis is skipped
//!   at that volume and the source is flagged regardless of pattern.
//! - more than [`MIN_UNIQUE_TIMESTAMPS`] distinct timestamps: beacon candidate.
//!   Interval statistics need at least three gaps.
//! - anything else: not enough evidence either way.

use std::net::IpAddr;

use serde::Serialize;

use crate::resolution::{ResolutionUnit, ResolvedIp};
use crate::store::{SourceIdentity, SourceSummary};

/// A summary needs strictly more distinct timestamps than this to be scored.
pub const MIN_UNIQUE_TIMESTAMPS: usize = 3;

/// Outcome of classifying one summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Strobe,
    BeaconCandidate,
    Insufficient,
}

impl Verdict {
    pub fn record_kind(&self) -> Option<RecordKind> {
        match self {
            Self::Strobe => Some(RecordKind::Strobe),
            Self::BeaconCandidate => Some(RecordKind::BeaconCandidate),
            Self::Insufficient => None,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strobe => write!(f, "strobe"),
            Self::BeaconCandidate => write!(f, "beacon candidate"),
            Self::Insufficient => write!(f, "insufficient evidence"),
        }
    }
}

/// Classifies one summary against the strobe limit.
pub fn classify(summary: &SourceSummary, strobe_limit: i64) -> Verdict {
    if summary.connection_count > strobe_limit {
        Verdict::Strobe
    } else if summary.timestamps.len() > MIN_UNIQUE_TIMESTAMPS {
        Verdict::BeaconCandidate
    } else {
        Verdict::Insufficient
    }
}

/// Which path an emitted record took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Strobe,
    BeaconCandidate,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strobe => write!(f, "STROBE"),
            Self::BeaconCandidate => write!(f, "BEACON"),
        }
    }
}

/// What the scoring stage receives for one (FQDN, source) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalysisRecord {
    pub fqdn: String,
    pub src: SourceIdentity,
    pub kind: RecordKind,
    pub connection_count: i64,
    pub total_bytes: i64,
    pub invalid_cert: bool,
    pub resolved_ips: Vec<ResolvedIp>,
    /// Empty for strobes.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub timestamps: Vec<i64>,
    /// Empty for strobes.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub orig_bytes: Vec<i64>,
}

impl AnalysisRecord {
    /// Builds the record for `summary`, or `None` when it should be dropped.
    pub fn from_summary(
        unit: &ResolutionUnit,
        summary: SourceSummary,
        strobe_limit: i64,
    ) -> Option<Self> {
        let kind = classify(&summary, strobe_limit).record_kind()?;
        Some(Self::with_kind(unit, summary, kind))
    }

    /// Builds the record for an already classified summary. Strobes drop
    /// their timestamp and byte payloads.
    pub fn with_kind(unit: &ResolutionUnit, summary: SourceSummary, kind: RecordKind) -> Self {
        let (timestamps, orig_bytes) = match kind {
            RecordKind::Strobe => (Vec::new(), Vec::new()),
            RecordKind::BeaconCandidate => (summary.timestamps, summary.orig_bytes),
        };

        Self {
            fqdn: unit.fqdn().to_string(),
            src: summary.src,
            kind,
            connection_count: summary.connection_count,
            total_bytes: summary.total_bytes,
            invalid_cert: summary.invalid_cert,
            resolved_ips: unit.resolved_ips().to_vec(),
            timestamps,
            orig_bytes,
        }
    }

    pub fn is_strobe(&self) -> bool {
        self.kind == RecordKind::Strobe
    }

    /// Bare addresses the FQDN resolved to.
    pub fn resolved_addrs(&self) -> Vec<IpAddr> {
        self.resolved_ips.iter().map(|r| r.ip).collect()
    }
}
