pub mod envelope;
pub mod registry;

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::export::health::CollectorMetrics;
use crate::record::Record;
use crate::stream::graph::{GraphError, GraphManager};
use crate::stream::worker::TellError;

pub use envelope::{WireEnvelope, WireError};
pub use registry::{StreamTypeRegistry, StreamTypeRegistryBuilder};

/// One record in flight between nodes: the envelope plus the graph/node
/// address it re-enters the pipeline at on the receiving side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    pub graph_id: u32,
    pub node_id: u32,
    pub envelope: WireEnvelope,
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("tell to graph {graph_id} node {node_id} failed")]
    Tell {
        graph_id: u32,
        node_id: u32,
        #[source]
        source: TellError,
    },
}

/// Inbound half of remote dispatch.
///
/// The cluster transport (an external collaborator) hands each received
/// message to `dispatch`, which decodes the envelope through the stream
/// type registry and tells the addressed graph node locally. A malformed
/// message is fatal for that message only: it is dropped with a logged
/// error and the receiver keeps running.
pub struct RemoteReceiver {
    graphs: Arc<GraphManager>,
    types: Arc<StreamTypeRegistry>,
    metrics: Option<Arc<CollectorMetrics>>,
}

impl RemoteReceiver {
    pub fn new(
        graphs: Arc<GraphManager>,
        types: Arc<StreamTypeRegistry>,
        metrics: Option<Arc<CollectorMetrics>>,
    ) -> Self {
        Self {
            graphs,
            types,
            metrics,
        }
    }

    pub async fn dispatch(&self, msg: RemoteMessage) -> Result<(), RemoteError> {
        let record = Record::from_envelope(&msg.envelope, &self.types)?;
        let graph = self.graphs.find(msg.graph_id)?;
        let node = graph.node(msg.node_id)?;

        node.group()
            .tell(record)
            .await
            .map_err(|source| RemoteError::Tell {
                graph_id: msg.graph_id,
                node_id: msg.node_id,
                source,
            })
    }

    /// Consumes an inbound message channel until cancellation.
    pub fn start(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<RemoteMessage>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("remote receiver stopped");
                        return;
                    }
                    msg = rx.recv() => {
                        let Some(msg) = msg else {
                            debug!("remote inbound channel closed");
                            return;
                        };
                        if let Err(e) = self.dispatch(msg).await {
                            if let Some(m) = &self.metrics {
                                m.remote_dropped.inc();
                            }
                            error!(error = %e, "remote message dropped");
                        }
                    }
                }
            }
        })
    }
}
