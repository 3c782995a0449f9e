use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::export::health::CollectorMetrics;
use crate::stream::worker::{Role, WorkerGroup};

use super::{BatchDao, MetricsDao, PersistRequest};

/// One persistence-capable worker group and the DAO that stores its records.
pub struct PersistenceEntry {
    pub role: Role,
    pub group: Arc<WorkerGroup>,
    pub dao: Arc<dyn MetricsDao>,
    /// Merge drained records with the stored row before writing. Roles
    /// whose buckets can already exist in storage (restarts, cluster
    /// rebalance) need this; append-only roles skip the read.
    pub needs_db_merge: bool,
}

/// Process-wide periodic flush of every persistence-capable worker.
///
/// Each tick drains every registered group, merges the snapshots against
/// storage where required, and submits one combined batch. The drain has
/// already swapped the in-memory maps, so a failed batch write loses that
/// tick's aggregates: at-most-once persistence, traded deliberately for
/// throughput. The loss is logged and counted, never retried.
pub struct PersistenceTimer {
    inner: Arc<TimerInner>,
}

struct TimerInner {
    entries: Vec<PersistenceEntry>,
    batch_dao: Arc<dyn BatchDao>,
    interval: Duration,
    dao_timeout: Duration,
    metrics: Option<Arc<CollectorMetrics>>,
    /// Serializes cycles: the scheduled tick and explicit `run_once`
    /// callers must never interleave their read-merge-write sequences.
    run_gate: tokio::sync::Mutex<()>,
}

impl PersistenceTimer {
    pub fn new(
        entries: Vec<PersistenceEntry>,
        batch_dao: Arc<dyn BatchDao>,
        interval: Duration,
        dao_timeout: Duration,
        metrics: Option<Arc<CollectorMetrics>>,
    ) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                entries,
                batch_dao,
                interval,
                dao_timeout,
                metrics,
                run_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Starts the tick loop. Ticks never overlap: the scheduler skips a
    /// tick while the previous one is still running, and cancellation
    /// triggers one final flush before the task exits.
    pub fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            info!(
                interval = ?inner.interval,
                workers = inner.entries.len(),
                "persistence timer started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        inner.run_once().await;
                        debug!("persistence timer stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        inner.run_once().await;
                    }
                }
            }
        })
    }

    /// Runs a single drain-merge-write cycle immediately.
    pub async fn run_once(&self) {
        self.inner.run_once().await;
    }
}

impl TimerInner {
    async fn run_once(&self) {
        let _gate = self.run_gate.lock().await;

        let started = Instant::now();
        if let Some(m) = &self.metrics {
            m.persistence_ticks.inc();
        }

        let mut batch: Vec<PersistRequest> = Vec::new();
        for entry in &self.entries {
            if let Err(e) = self.prepare(entry, &mut batch).await {
                // Isolated per worker so the remaining groups still flush
                // this tick.
                error!(role = %entry.role, error = %e, "persistence prepare failed");
                if let Some(m) = &self.metrics {
                    m.persistence_errors.inc();
                }
            }
        }

        if batch.is_empty() {
            return;
        }

        let size = batch.len();
        match self.batch_dao.batch_write(batch).await {
            Ok(()) => {
                debug!(requests = size, elapsed = ?started.elapsed(), "persistence batch written");
            }
            Err(e) => {
                // The maps were already swapped; these aggregates are gone.
                error!(
                    requests = size,
                    error = %e,
                    "batch write failed, dropping this tick's aggregates"
                );
                if let Some(m) = &self.metrics {
                    m.persistence_errors.inc();
                }
            }
        }

        if let Some(m) = &self.metrics {
            m.batch_size.observe(size as f64);
            m.batch_write_duration
                .observe(started.elapsed().as_secs_f64());
        }
    }

    async fn prepare(&self, entry: &PersistenceEntry, batch: &mut Vec<PersistRequest>) -> Result<()> {
        let drained = entry.group.drain_all().await?;

        for record in drained {
            let Some(id) = record.id() else {
                debug!(role = %entry.role, kind = %record.kind(), "skipping record without id");
                continue;
            };

            if !entry.needs_db_merge {
                batch.push(entry.dao.prepare_insert(record));
                continue;
            }

            let existing = tokio::time::timeout(self.dao_timeout, entry.dao.get(id))
                .await
                .context("dao get timed out")??;

            match existing {
                Some(mut stored) => {
                    stored.merge(&record)?;
                    batch.push(entry.dao.prepare_update(stored));
                }
                None => batch.push(entry.dao.prepare_insert(record)),
            }
        }

        Ok(())
    }
}
