//! Connection-graph store: documents, result rows and the session seam.
//!
//! The store keeps one [`UniqueConnection`] per (source, destination) pair,
//! each holding per-day buckets of connection evidence. Workers never touch
//! documents directly; they hand a [`QueryPlan`] to their own
//! [`StoreSession`] and get [`SourceSummary`] rows back.

pub mod engine;
pub mod memory;
pub mod sqlite;

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QueryError, StoreError};
use crate::query::QueryPlan;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// The internal host a summary is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceIdentity {
    pub ip: IpAddr,
    #[serde(default)]
    pub network_uuid: Uuid,
    #[serde(default)]
    pub network_name: String,
}

impl SourceIdentity {
    pub fn new(ip: IpAddr, network_uuid: Uuid, network_name: impl Into<String>) -> Self {
        Self {
            ip,
            network_uuid,
            network_name: network_name.into(),
        }
    }
}

impl fmt::Display for SourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.network_name.is_empty() {
            write!(f, "{}", self.ip)
        } else {
            write!(f, "{} ({})", self.ip, self.network_name)
        }
    }
}

/// One day bucket of a unique connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyConnections {
    /// Connection start times, unix seconds.
    #[serde(default)]
    pub ts: Vec<i64>,
    /// Originator byte count per connection.
    #[serde(default)]
    pub bytes: Vec<i64>,
    pub count: i64,
    pub tbytes: i64,
    #[serde(default)]
    pub icerts: bool,
}

/// A (source, destination) pair and its daily connection buckets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConnection {
    pub src: SourceIdentity,
    pub dst: IpAddr,
    #[serde(default)]
    pub dst_network_uuid: Uuid,
    #[serde(default)]
    pub dat: Vec<DailyConnections>,
}

/// Aggregated evidence for one source across every resolved destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSummary {
    pub src: SourceIdentity,
    pub connection_count: i64,
    pub total_bytes: i64,
    /// Distinct connection start times, ascending.
    pub timestamps: Vec<i64>,
    /// Originator bytes per connection; duplicates are kept.
    pub orig_bytes: Vec<i64>,
    pub invalid_cert: bool,
}

/// A dedicated connection to the store, owned by exactly one worker.
pub trait StoreSession: Send {
    /// Runs an aggregation plan and returns one row per qualifying source.
    fn aggregate(&mut self, plan: &QueryPlan) -> Result<Vec<SourceSummary>, QueryError>;
}

/// Opens sessions against a store. Shared by the dissector across workers.
pub trait StoreConnector: Send + Sync {
    fn open_session(&self) -> Result<Box<dyn StoreSession>, StoreError>;

    /// Human-readable location, used in logs.
    fn describe(&self) -> String;
}
