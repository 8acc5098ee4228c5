//! Beacon dissector: per-FQDN connection evidence for C2 beacon analysis.
//!
//! For each hostname the resolver hands over, the dissector asks the
//! connection-graph store which internal sources talked to any of the
//! hostname's addresses, folds that evidence into one summary per source,
//! and triages each summary before it reaches the scoring stage.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Resolver   │────>│  Dissector  │────>│   Store     │     │   Scoring   │
//! │ (upstream)  │ cap │  (workers)  │plan │ (sessions)  │     │ (downstream)│
//! └─────────────┘  0  └──────┬──────┘     └─────────────┘     └──────▲──────┘
//!                            │ classify                               │
//!                            └──────────── AnalysisSink ──────────────┘
//!     Caller thread          OS threads
//! ```
//!
//! - **query**: builds the seven-stage aggregation plan for one hostname
//! - **store**: connection documents, plan evaluation, SQLite and memory backends
//! - **classifier**: strobe / beacon candidate / insufficient evidence
//! - **dissector**: rendezvous intake, worker pool, lifecycle
//! - **metrics**: observer hooks and a Prometheus endpoint
//! - **export**: text / JSON / JSONL record sinks

pub mod classifier;
pub mod config;
pub mod dissector;
pub mod error;
pub mod export;
pub mod metrics;
pub mod query;
pub mod resolution;
pub mod store;

pub use classifier::{AnalysisRecord, RecordKind};
pub use dissector::{AnalysisSink, DissectionReport, Dissector, DissectorSettings};
pub use resolution::{ResolutionUnit, ResolvedIp};
