use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;

use crate::record::Record;

use super::{BatchDao, MetricsDao, PersistRequest};

/// In-memory storage backend keyed by record id.
///
/// Serves local runs and tests; real deployments inject DAO implementations
/// for their storage engine through the same traits.
#[derive(Debug, Default)]
pub struct MemoryDao {
    rows: DashMap<String, Record>,
}

impl MemoryDao {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get_record(&self, id: &str) -> Option<Record> {
        self.rows.get(id).map(|r| r.value().clone())
    }

    /// Copies out every stored record.
    pub fn snapshot(&self) -> Vec<Record> {
        self.rows.iter().map(|r| r.value().clone()).collect()
    }

    /// Seeds a stored record directly, bypassing the batch path.
    pub fn put_record(&self, record: Record) {
        if let Some(id) = record.id() {
            self.rows.insert(id.to_string(), record);
        }
    }
}

#[async_trait]
impl MetricsDao for MemoryDao {
    async fn get(&self, id: &str) -> Result<Option<Record>> {
        Ok(self.rows.get(id).map(|r| r.value().clone()))
    }
}

#[async_trait]
impl BatchDao for MemoryDao {
    async fn batch_write(&self, requests: Vec<PersistRequest>) -> Result<()> {
        for request in requests {
            let Some(id) = request.record.id() else {
                continue;
            };
            self.rows.insert(id.to_string(), request.record);
        }
        Ok(())
    }
}
