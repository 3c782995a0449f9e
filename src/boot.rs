use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::export::health::CollectorMetrics;
use crate::record::{Record, RecordKind, SpanFact};
use crate::remote::{RemoteMessage, RemoteReceiver, StreamTypeRegistry, StreamTypeRegistryBuilder};
use crate::storage::{BatchDao, MetricsDao, PersistenceEntry, PersistenceTimer};
use crate::stream::aggregate::AggregateLogic;
use crate::stream::analysis::SpanAnalysisLogic;
use crate::stream::graph::{Graph, GraphBuilder, GraphManager};
use crate::stream::worker::{Role, TellError, WorkerRegistry};

pub const TRACE_GRAPH_ID: u32 = 300;

pub const SPAN_ANALYSIS_NODE: u32 = 1;
pub const SERVICE_METRIC_NODE: u32 = 2;
pub const INSTANCE_METRIC_NODE: u32 = 3;
pub const ENDPOINT_METRIC_NODE: u32 = 4;
pub const SERVICE_RELATION_NODE: u32 = 5;

/// Roles of the trace analysis pipeline.
pub mod roles {
    use super::{RecordKind, Role};

    pub const SPAN_ANALYSIS: Role = Role::rolling("span_analysis", RecordKind::SpanFact);
    pub const SERVICE_METRIC: Role =
        Role::hashed("service_metric_aggregate", RecordKind::ServiceMetric);
    pub const INSTANCE_METRIC: Role =
        Role::hashed("instance_metric_aggregate", RecordKind::InstanceMetric);
    pub const ENDPOINT_METRIC: Role =
        Role::hashed("endpoint_metric_aggregate", RecordKind::EndpointMetric);
    pub const SERVICE_RELATION: Role =
        Role::hashed("service_relation_aggregate", RecordKind::ServiceRelation);
}

/// Storage collaborators injected at boot.
pub struct StorageSeam {
    pub metrics: Arc<dyn MetricsDao>,
    pub batch: Arc<dyn BatchDao>,
}

/// The assembled collector: worker registry, graphs, type registry,
/// persistence cycle, and the remote dispatch seams.
pub struct CollectorCore {
    pub registry: Arc<WorkerRegistry>,
    pub graphs: Arc<GraphManager>,
    pub types: Arc<StreamTypeRegistry>,
    pub receiver: Arc<RemoteReceiver>,

    outbound_tx: mpsc::Sender<RemoteMessage>,
    outbound_rx: parking_lot::Mutex<Option<mpsc::Receiver<RemoteMessage>>>,

    persistence: PersistenceTimer,
    persist_cancel: CancellationToken,
    persist_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl CollectorCore {
    pub fn trace_graph(&self) -> Arc<Graph> {
        self.graphs
            .find(TRACE_GRAPH_ID)
            .expect("trace graph registered at boot")
    }

    /// Feeds one decoded span fact into the trace graph.
    pub async fn ingest(&self, fact: SpanFact) -> Result<(), TellError> {
        self.trace_graph().start(Record::Span(fact)).await
    }

    /// Runs one persistence cycle immediately, outside the timer cadence.
    pub async fn flush_now(&self) {
        self.persistence.run_once().await;
    }

    /// Sender side of the outbound remote channel, for wiring remote
    /// worker refs.
    pub fn remote_outbound_sender(&self) -> mpsc::Sender<RemoteMessage> {
        self.outbound_tx.clone()
    }

    /// Hands the outbound remote channel to the cluster transport. Yields
    /// `None` after the first call.
    pub fn take_remote_outbound(&self) -> Option<mpsc::Receiver<RemoteMessage>> {
        self.outbound_rx.lock().take()
    }

    /// Graceful shutdown: settle the worker queues, run a final
    /// persistence flush over the settled state, then stop every task.
    pub async fn stop(&self) {
        self.registry.quiesce().await;

        self.persist_cancel.cancel();
        if let Some(handle) = self.persist_task.lock().take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "persistence task join failed");
            }
        }

        self.registry.terminate().await;
        info!("collector core stopped");
    }
}

/// Builds the collector in dependency order: the stream type registry is
/// finalized before anything can touch an envelope, storage seams come in
/// from the caller, and graphs register their workers before the
/// persistence timer starts. Must run inside a tokio runtime.
pub fn assemble(
    cfg: &Config,
    storage: StorageSeam,
    metrics: Option<Arc<CollectorMetrics>>,
) -> Result<CollectorCore> {
    let mut types = StreamTypeRegistryBuilder::default();
    for kind in RecordKind::ALL {
        types.register(*kind);
    }
    let types = Arc::new(types.finalize());

    let registry = Arc::new(WorkerRegistry::new(
        cfg.stream.backpressure,
        metrics.clone(),
    ));

    let shards = cfg.stream.shard_count;
    let capacity = cfg.stream.queue_capacity;

    let graph = GraphBuilder::new(TRACE_GRAPH_ID)
        .node(
            SPAN_ANALYSIS_NODE,
            roles::SPAN_ANALYSIS,
            shards,
            capacity,
            &[
                SERVICE_METRIC_NODE,
                INSTANCE_METRIC_NODE,
                ENDPOINT_METRIC_NODE,
                SERVICE_RELATION_NODE,
            ],
            |_| Box::new(SpanAnalysisLogic),
        )
        .node(
            SERVICE_METRIC_NODE,
            roles::SERVICE_METRIC,
            shards,
            capacity,
            &[],
            |_| Box::new(AggregateLogic::new(roles::SERVICE_METRIC)),
        )
        .node(
            INSTANCE_METRIC_NODE,
            roles::INSTANCE_METRIC,
            shards,
            capacity,
            &[],
            |_| Box::new(AggregateLogic::new(roles::INSTANCE_METRIC)),
        )
        .node(
            ENDPOINT_METRIC_NODE,
            roles::ENDPOINT_METRIC,
            shards,
            capacity,
            &[],
            |_| Box::new(AggregateLogic::new(roles::ENDPOINT_METRIC)),
        )
        .node(
            SERVICE_RELATION_NODE,
            roles::SERVICE_RELATION,
            shards,
            capacity,
            &[],
            |_| Box::new(AggregateLogic::new(roles::SERVICE_RELATION)),
        )
        .build(&registry)?;

    let graphs = Arc::new(GraphManager::new());
    let graph = graphs.create_if_absent(graph);

    // Terminal nodes hold aggregation state nothing else reads, so each
    // one is registered with the persistence cycle.
    let mut entries = Vec::new();
    for node_id in [
        SERVICE_METRIC_NODE,
        INSTANCE_METRIC_NODE,
        ENDPOINT_METRIC_NODE,
        SERVICE_RELATION_NODE,
    ] {
        let node = graph.node(node_id)?;
        entries.push(PersistenceEntry {
            role: node.role,
            group: Arc::clone(node.group()),
            dao: Arc::clone(&storage.metrics),
            needs_db_merge: true,
        });
    }

    let persistence = PersistenceTimer::new(
        entries,
        storage.batch,
        cfg.persistence.interval,
        cfg.persistence.dao_timeout,
        metrics.clone(),
    );
    let persist_cancel = CancellationToken::new();
    let persist_task = persistence.spawn(persist_cancel.clone());

    let receiver = Arc::new(RemoteReceiver::new(
        Arc::clone(&graphs),
        Arc::clone(&types),
        metrics,
    ));

    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);

    info!(
        node = %cfg.node_name,
        shards,
        queue_capacity = capacity,
        stream_types = types.len(),
        "collector core assembled"
    );

    Ok(CollectorCore {
        registry,
        graphs,
        types,
        receiver,
        outbound_tx,
        outbound_rx: parking_lot::Mutex::new(Some(outbound_rx)),
        persistence,
        persist_cancel,
        persist_task: parking_lot::Mutex::new(Some(persist_task)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryDao;

    fn seam(dao: &Arc<MemoryDao>) -> StorageSeam {
        StorageSeam {
            metrics: Arc::clone(dao) as Arc<dyn MetricsDao>,
            batch: Arc::clone(dao) as Arc<dyn BatchDao>,
        }
    }

    #[tokio::test]
    async fn test_assemble_registers_all_roles() {
        let dao = Arc::new(MemoryDao::new());
        let core = assemble(&Config::default(), seam(&dao), None).expect("assemble");

        for role in [
            roles::SPAN_ANALYSIS,
            roles::SERVICE_METRIC,
            roles::INSTANCE_METRIC,
            roles::ENDPOINT_METRIC,
            roles::SERVICE_RELATION,
        ] {
            core.registry.lookup(role).expect("role registered");
        }

        let graph = core.trace_graph();
        assert_eq!(graph.entry_node_id(), SPAN_ANALYSIS_NODE);
        assert_eq!(graph.node_ids().count(), 5);

        core.stop().await;
    }

    #[tokio::test]
    async fn test_take_remote_outbound_is_single_shot() {
        let dao = Arc::new(MemoryDao::new());
        let core = assemble(&Config::default(), seam(&dao), None).expect("assemble");

        assert!(core.take_remote_outbound().is_some());
        assert!(core.take_remote_outbound().is_none());

        core.stop().await;
    }
}
