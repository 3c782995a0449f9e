use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::BackpressurePolicy;
use crate::export::health::CollectorMetrics;
use crate::record::{Record, RecordKind};
use crate::remote::envelope::WireError;
use crate::remote::registry::StreamTypeRegistry;
use crate::remote::RemoteMessage;

use super::selector::{hash_select, RollingSelector, SelectStrategy};

/// Upper bound on records pulled per wakeup before the consumer loop yields
/// back to select.
const BATCH_DRAIN: usize = 256;

/// Logical worker type: routing name, shard selection strategy, and the
/// record kind its queue accepts.
///
/// Roles are const values declared at boot and never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Role {
    pub name: &'static str,
    pub strategy: SelectStrategy,
    pub accepts: RecordKind,
}

impl Role {
    pub const fn hashed(name: &'static str, accepts: RecordKind) -> Self {
        Self {
            name,
            strategy: SelectStrategy::HashCode,
            accepts,
        }
    }

    pub const fn rolling(name: &'static str, accepts: RecordKind) -> Self {
        Self {
            name,
            strategy: SelectStrategy::Rolling,
            accepts,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

/// Error returned when a record cannot be enqueued.
#[derive(Debug, Error)]
pub enum TellError {
    #[error("inbound queue full for role {role} shard {shard}")]
    QueueFull { role: &'static str, shard: usize },
    #[error("worker stopped for role {role} shard {shard}")]
    Closed { role: &'static str, shard: usize },
    #[error("remote outbound queue full for role {role}")]
    RemoteQueueFull { role: &'static str },
    #[error("remote outbound closed for role {role}")]
    RemoteClosed { role: &'static str },
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Lookup of a role nobody registered. Fatal at boot per the fail-fast
/// registration contract.
#[derive(Debug, Error)]
#[error("no worker registered for role {0}")]
pub struct UnregisteredRole(pub &'static str);

#[derive(Debug, Error)]
pub enum DrainError {
    #[error("worker stopped for role {role} shard {shard}")]
    Closed { role: &'static str, shard: usize },
}

/// Per-shard processing logic driven by the shard's consumer loop.
///
/// `process` runs on the single consumer task that owns the shard, so
/// implementations hold plain mutable state with no locking.
pub trait WorkerLogic: Send + 'static {
    /// Handles one record, pushing any derived records into `out` for
    /// forwarding to downstream graph nodes.
    fn process(&mut self, record: Record, out: &mut Vec<Record>);

    /// Swaps out accumulated state for the persistence cycle. Stateless
    /// workers keep the default empty implementation.
    fn drain(&mut self) -> Vec<Record> {
        Vec::new()
    }
}

enum WorkerControl {
    Drain(oneshot::Sender<Vec<Record>>),
}

/// Handle to a worker shard hosted in this process.
#[derive(Debug)]
pub struct LocalRef {
    role: Role,
    shard: usize,
    tx: mpsc::Sender<Record>,
    ctl: mpsc::Sender<WorkerControl>,
}

/// Handle to a worker shard hosted on another node.
///
/// Tell serializes the record through the stream type registry and enqueues
/// a routed envelope onto the outbound channel the cluster transport
/// consumes. Fire-and-forget, matching local tell semantics, so producers
/// never special-case remote targets.
#[derive(Debug)]
pub struct RemoteRef {
    role: Role,
    graph_id: u32,
    node_id: u32,
    outbound: mpsc::Sender<RemoteMessage>,
    types: Arc<StreamTypeRegistry>,
}

impl RemoteRef {
    pub fn new(
        role: Role,
        graph_id: u32,
        node_id: u32,
        outbound: mpsc::Sender<RemoteMessage>,
        types: Arc<StreamTypeRegistry>,
    ) -> Self {
        Self {
            role,
            graph_id,
            node_id,
            outbound,
            types,
        }
    }
}

#[derive(Debug)]
pub enum WorkerRef {
    Local(LocalRef),
    Remote(RemoteRef),
}

impl WorkerRef {
    async fn tell(&self, record: Record, policy: BackpressurePolicy) -> Result<(), TellError> {
        match self {
            Self::Local(r) => match policy {
                BackpressurePolicy::Drop => r.tx.try_send(record).map_err(|e| match e {
                    TrySendError::Full(_) => TellError::QueueFull {
                        role: r.role.name,
                        shard: r.shard,
                    },
                    TrySendError::Closed(_) => TellError::Closed {
                        role: r.role.name,
                        shard: r.shard,
                    },
                }),
                BackpressurePolicy::Wait => {
                    r.tx.send(record).await.map_err(|_| TellError::Closed {
                        role: r.role.name,
                        shard: r.shard,
                    })
                }
            },
            Self::Remote(r) => {
                let envelope = record.to_envelope(&r.types)?;
                let msg = RemoteMessage {
                    graph_id: r.graph_id,
                    node_id: r.node_id,
                    envelope,
                };
                match policy {
                    BackpressurePolicy::Drop => r.outbound.try_send(msg).map_err(|e| match e {
                        TrySendError::Full(_) => TellError::RemoteQueueFull { role: r.role.name },
                        TrySendError::Closed(_) => TellError::RemoteClosed { role: r.role.name },
                    }),
                    BackpressurePolicy::Wait => r
                        .outbound
                        .send(msg)
                        .await
                        .map_err(|_| TellError::RemoteClosed { role: r.role.name }),
                }
            }
        }
    }
}

/// Shard set serving one role.
#[derive(Debug)]
pub struct WorkerGroup {
    role: Role,
    refs: Vec<WorkerRef>,
    rolling: RollingSelector,
    policy: BackpressurePolicy,
    metrics: Option<Arc<CollectorMetrics>>,
}

impl WorkerGroup {
    pub fn new(
        role: Role,
        refs: Vec<WorkerRef>,
        policy: BackpressurePolicy,
        metrics: Option<Arc<CollectorMetrics>>,
    ) -> Self {
        Self {
            role,
            refs,
            rolling: RollingSelector::new(),
            policy,
            metrics,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn shard_count(&self) -> usize {
        self.refs.len()
    }

    /// Picks the shard index for a routing key using the role's strategy.
    pub fn select(&self, key: &str) -> usize {
        match self.role.strategy {
            SelectStrategy::HashCode => hash_select(self.refs.len(), key),
            SelectStrategy::Rolling => self.rolling.select(self.refs.len()),
        }
    }

    /// Fire-and-forget enqueue.
    ///
    /// Backpressure follows the configured policy: `drop` fails fast with
    /// `QueueFull` on a saturated shard, `wait` suspends the caller until
    /// the queue has room.
    pub async fn tell(&self, record: Record) -> Result<(), TellError> {
        if let Some(m) = &self.metrics {
            m.records_received
                .with_label_values(&[self.role.name])
                .inc();
        }

        let shard = self.select(record.routing_key());
        let result = self.refs[shard].tell(record, self.policy).await;
        if result.is_err() {
            if let Some(m) = &self.metrics {
                m.records_dropped
                    .with_label_values(&[self.role.name])
                    .inc();
            }
        }
        result
    }

    /// Drains one local shard's aggregation state.
    ///
    /// The swap happens inside the shard's own consumer loop, so the
    /// returned snapshot can never contain a record processed after this
    /// call returns, and the worker keeps receiving while the snapshot is
    /// persisted.
    pub async fn drain_shard(&self, shard: usize) -> Result<Vec<Record>, DrainError> {
        let WorkerRef::Local(r) = &self.refs[shard] else {
            return Ok(Vec::new());
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        r.ctl
            .send(WorkerControl::Drain(reply_tx))
            .await
            .map_err(|_| DrainError::Closed {
                role: self.role.name,
                shard,
            })?;

        reply_rx.await.map_err(|_| DrainError::Closed {
            role: self.role.name,
            shard,
        })
    }

    /// Drains every local shard, concatenating the snapshots.
    pub async fn drain_all(&self) -> Result<Vec<Record>, DrainError> {
        let mut drained = Vec::new();
        for shard in 0..self.refs.len() {
            drained.extend(self.drain_shard(shard).await?);
        }
        Ok(drained)
    }
}

/// Fan-out targets wired to one graph node.
///
/// A derived record goes to every downstream role that accepts its kind,
/// exactly once each.
#[derive(Clone, Default)]
pub struct Downstream {
    targets: Vec<Arc<WorkerGroup>>,
}

impl Downstream {
    pub fn new(targets: Vec<Arc<WorkerGroup>>) -> Self {
        Self { targets }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Forwards a derived record to accepting downstream groups.
    ///
    /// Tell failures are logged and do not stop the emitting worker: a
    /// crashed consumer loop would stall its shard for every key hashed to
    /// it.
    pub async fn emit(&self, record: Record) {
        let kind = record.kind();
        let matched: Vec<&Arc<WorkerGroup>> = self
            .targets
            .iter()
            .filter(|t| t.role().accepts == kind)
            .collect();

        let Some((last, rest)) = matched.split_last() else {
            debug!(kind = %kind, "derived record has no downstream target");
            return;
        };

        for target in rest {
            if let Err(e) = target.tell(record.clone()).await {
                warn!(role = %target.role(), error = %e, "downstream tell failed");
            }
        }
        if let Err(e) = last.tell(record).await {
            warn!(role = %last.role(), error = %e, "downstream tell failed");
        }
    }
}

/// Maps each registered role to its worker group and owns the shard tasks.
///
/// Shutdown is two-phase: `quiesce` stops intake processing of new work and
/// waits for already-queued records to be applied, leaving drains
/// serviceable so a final persistence flush can still collect every shard's
/// state; `terminate` then stops the shard tasks for good.
pub struct WorkerRegistry {
    groups: DashMap<&'static str, Arc<WorkerGroup>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    quiesced: parking_lot::Mutex<Vec<oneshot::Receiver<()>>>,
    cancel: CancellationToken,
    term: CancellationToken,
    policy: BackpressurePolicy,
    metrics: Option<Arc<CollectorMetrics>>,
}

impl WorkerRegistry {
    pub fn new(policy: BackpressurePolicy, metrics: Option<Arc<CollectorMetrics>>) -> Self {
        Self {
            groups: DashMap::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
            quiesced: parking_lot::Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            term: CancellationToken::new(),
            policy,
            metrics,
        }
    }

    /// Creates `shard_count` worker shards for `role`, each with its own
    /// bounded queue of `queue_capacity` records.
    ///
    /// Registration is create-if-absent: the first registration wins and
    /// later calls for the same role return the existing group untouched.
    /// Must run inside a tokio runtime.
    pub fn register<F>(
        &self,
        role: Role,
        factory: F,
        downstream: Downstream,
        shard_count: usize,
        queue_capacity: usize,
    ) -> Arc<WorkerGroup>
    where
        F: Fn(usize) -> Box<dyn WorkerLogic>,
    {
        let entry = self.groups.entry(role.name).or_insert_with(|| {
            let shard_count = shard_count.max(1);
            let mut refs = Vec::with_capacity(shard_count);
            let mut handles = Vec::with_capacity(shard_count);
            let mut quiesced = Vec::with_capacity(shard_count);

            for shard in 0..shard_count {
                let (tx, rx) = mpsc::channel(queue_capacity.max(1));
                let (ctl_tx, ctl_rx) = mpsc::channel(4);
                let (quiesced_tx, quiesced_rx) = oneshot::channel();
                let logic = factory(shard);

                handles.push(tokio::spawn(shard_loop(
                    role,
                    shard,
                    logic,
                    rx,
                    ctl_rx,
                    downstream.clone(),
                    self.cancel.child_token(),
                    self.term.child_token(),
                    quiesced_tx,
                )));

                refs.push(WorkerRef::Local(LocalRef {
                    role,
                    shard,
                    tx,
                    ctl: ctl_tx,
                }));
                quiesced.push(quiesced_rx);
            }

            self.tasks.lock().extend(handles);
            self.quiesced.lock().extend(quiesced);
            debug!(role = %role, shards = shard_count, "worker role registered");

            Arc::new(WorkerGroup::new(
                role,
                refs,
                self.policy,
                self.metrics.clone(),
            ))
        });

        Arc::clone(&entry)
    }

    /// Returns the shard set for a role, or fails fast if it was never
    /// registered.
    pub fn lookup(&self, role: Role) -> Result<Arc<WorkerGroup>, UnregisteredRole> {
        self.groups
            .get(role.name)
            .map(|g| Arc::clone(&g))
            .ok_or(UnregisteredRole(role.name))
    }

    /// Stops steady-state processing and waits until every shard has
    /// applied its queued backlog. Drain requests keep working afterwards.
    pub async fn quiesce(&self) {
        self.cancel.cancel();
        let receivers: Vec<oneshot::Receiver<()>> = std::mem::take(&mut *self.quiesced.lock());
        for rx in receivers {
            let _ = rx.await;
        }
    }

    /// Stops every shard task. Call after the final flush has drained them.
    pub async fn terminate(&self) {
        self.term.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker shard join failed");
            }
        }
    }

    /// Full shutdown for callers that do not need a flush in between.
    pub async fn shutdown(&self) {
        self.quiesce().await;
        self.terminate().await;
    }
}

fn answer(logic: &mut Box<dyn WorkerLogic>, ctl: WorkerControl) {
    match ctl {
        WorkerControl::Drain(reply) => {
            let snapshot = logic.drain();
            // Caller may have given up on a slow drain.
            let _ = reply.send(snapshot);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn shard_loop(
    role: Role,
    shard: usize,
    mut logic: Box<dyn WorkerLogic>,
    mut rx: mpsc::Receiver<Record>,
    mut ctl_rx: mpsc::Receiver<WorkerControl>,
    downstream: Downstream,
    cancel: CancellationToken,
    term: CancellationToken,
    quiesced: oneshot::Sender<()>,
) {
    let mut derived = Vec::new();

    // Steady state. Drain requests are polled ahead of data so the
    // persistence cycle is never starved by a busy queue.
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            Some(ctl) = ctl_rx.recv() => answer(&mut logic, ctl),

            Some(record) = rx.recv() => {
                logic.process(record, &mut derived);

                // Opportunistically take more queued records before the
                // next select round trip.
                for _ in 0..BATCH_DRAIN - 1 {
                    match rx.try_recv() {
                        Ok(record) => logic.process(record, &mut derived),
                        Err(_) => break,
                    }
                }

                forward(&downstream, &mut derived).await;
            }
        }
    }

    // Quiescing: apply everything accepted before cancellation, then tell
    // the registry this shard's backlog is settled.
    while let Ok(record) = rx.try_recv() {
        logic.process(record, &mut derived);
    }
    forward(&downstream, &mut derived).await;
    let _ = quiesced.send(());

    // Post-quiesce: records forwarded by upstream shards that settled later
    // are still applied, and data is polled ahead of drains so the final
    // flush sees a complete map.
    loop {
        tokio::select! {
            biased;

            _ = term.cancelled() => {
                debug!(role = %role, shard, "worker shard stopped");
                return;
            }

            Some(record) = rx.recv() => {
                logic.process(record, &mut derived);
                for _ in 0..BATCH_DRAIN - 1 {
                    match rx.try_recv() {
                        Ok(record) => logic.process(record, &mut derived),
                        Err(_) => break,
                    }
                }
                forward(&downstream, &mut derived).await;
            }

            Some(ctl) = ctl_rx.recv() => answer(&mut logic, ctl),
        }
    }
}

async fn forward(downstream: &Downstream, derived: &mut Vec<Record>) {
    if downstream.is_empty() {
        derived.clear();
        return;
    }
    for record in derived.drain(..) {
        downstream.emit(record).await;
    }
}
