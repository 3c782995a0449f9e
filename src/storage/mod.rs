pub mod memory;
pub mod timer;

use anyhow::Result;
use async_trait::async_trait;

use crate::record::Record;

pub use memory::MemoryDao;
pub use timer::{PersistenceEntry, PersistenceTimer};

/// Whether a prepared write creates a new row or replaces an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOp {
    Insert,
    Update,
}

/// One pending write in a persistence batch.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistRequest {
    pub op: PersistOp,
    pub record: Record,
}

/// Per-entity-shape storage contract used by the persistence cycle.
///
/// Implementations are external collaborators (Elasticsearch, SQL, ...)
/// and are treated as thread-safe; the core only serializes access through
/// the single-threaded persistence tick.
#[async_trait]
pub trait MetricsDao: Send + Sync {
    /// Fetches the stored record for an id, if any.
    async fn get(&self, id: &str) -> Result<Option<Record>>;

    fn prepare_insert(&self, record: Record) -> PersistRequest {
        PersistRequest {
            op: PersistOp::Insert,
            record,
        }
    }

    fn prepare_update(&self, record: Record) -> PersistRequest {
        PersistRequest {
            op: PersistOp::Update,
            record,
        }
    }
}

/// Batched write contract, invoked once per persistence tick with the union
/// of all workers' pending writes.
#[async_trait]
pub trait BatchDao: Send + Sync {
    async fn batch_write(&self, requests: Vec<PersistRequest>) -> Result<()>;
}
