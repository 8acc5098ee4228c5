//! Aggregation query builder.
//!
//! Turns the destination filters of one resolution unit into the ordered,
//! declarative plan the store runs against its unique-connection documents.
//!
//! # Stage order
//!
//! ```text
//! MatchDestinations ─> FlattenDays ─> GroupBySource ─> MinConnections
//!                                                         │
//!            Project <─ FlattenBytes <─ UniqueTimestamps <┘
//! ```
//!
//! Grouping happens before the connection threshold because volume is judged
//! per source across *all* resolved addresses. Timestamps are deduplicated
//! only after the count and byte sums are fixed, so the sums report real
//! traffic volume while the timestamp set holds distinct events.

use std::fmt;

use crate::resolution::DestinationFilter;

/// Noise floor applied inside the query when no threshold is configured.
pub const DEFAULT_MIN_CONNECTIONS: i64 = 20;

/// One step of an aggregation plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    /// Keep documents whose destination matches any filter term.
    MatchDestinations(Vec<DestinationFilter>),
    /// Concatenate per-day arrays and sum per-day totals within each document.
    FlattenDays,
    /// Collapse documents by source identity, nesting per-destination arrays.
    GroupBySource,
    /// Drop groups whose summed connection count is not above the threshold.
    MinConnections(i64),
    /// Flatten nested timestamps into one set of distinct values.
    UniqueTimestamps,
    /// Flatten nested byte lists, keeping duplicates.
    FlattenBytes,
    /// Emit one summary row per remaining group.
    Project,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MatchDestinations(_) => "match_destinations",
            Self::FlattenDays => "flatten_days",
            Self::GroupBySource => "group_by_source",
            Self::MinConnections(_) => "min_connections",
            Self::UniqueTimestamps => "unique_timestamps",
            Self::FlattenBytes => "flatten_bytes",
            Self::Project => "project",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MatchDestinations(filters) => write!(f, "{}[{}]", self.name(), filters.len()),
            Self::MinConnections(n) => write!(f, "{}(>{})", self.name(), n),
            _ => write!(f, "{}", self.name()),
        }
    }
}

/// An ordered list of stages for the store to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    stages: Vec<Stage>,
}

impl QueryPlan {
    /// Builds the per-FQDN evidence query.
    pub fn build(filters: &[DestinationFilter], min_connections: i64) -> Self {
        Self {
            stages: vec![
                Stage::MatchDestinations(filters.to_vec()),
                Stage::FlattenDays,
                Stage::GroupBySource,
                Stage::MinConnections(min_connections),
                Stage::UniqueTimestamps,
                Stage::FlattenBytes,
                Stage::Project,
            ],
        }
    }

    /// Wraps an arbitrary stage list. The store rejects lists that do not
    /// reduce documents to summaries.
    pub fn from_stages(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Filter terms of the leading match stage, if the plan starts with one.
    pub fn destination_filters(&self) -> Option<&[DestinationFilter]> {
        match self.stages.first() {
            Some(Stage::MatchDestinations(filters)) => Some(filters),
            _ => None,
        }
    }
}

impl fmt::Display for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.stages.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", names.join(" -> "))
    }
}
