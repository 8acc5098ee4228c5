//! In-process store backend.
//!
//! Holds documents behind an `Arc` so every worker session reads the same
//! snapshot without copying it.

use std::sync::Arc;

use crate::error::{QueryError, StoreError};
use crate::query::QueryPlan;
use crate::store::{engine, SourceSummary, StoreConnector, StoreSession, UniqueConnection};

/// A read-only store over a fixed set of unique connections.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    documents: Arc<Vec<UniqueConnection>>,
}

impl MemoryStore {
    pub fn new(documents: Vec<UniqueConnection>) -> Self {
        Self {
            documents: Arc::new(documents),
        }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl StoreConnector for MemoryStore {
    fn open_session(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        Ok(Box::new(MemorySession {
            documents: Arc::clone(&self.documents),
        }))
    }

    fn describe(&self) -> String {
        format!("memory ({} documents)", self.documents.len())
    }
}

struct MemorySession {
    documents: Arc<Vec<UniqueConnection>>,
}

impl StoreSession for MemorySession {
    fn aggregate(&mut self, plan: &QueryPlan) -> Result<Vec<SourceSummary>, QueryError> {
        engine::evaluate(plan, self.documents.iter())
    }
}
