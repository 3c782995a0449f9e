use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Result};
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use crate::record::Record;

use super::worker::{Downstream, Role, TellError, WorkerGroup, WorkerLogic, WorkerRegistry};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("no graph registered with id {0}")]
    UnknownGraph(u32),
    #[error("graph {graph} has no node {node}")]
    UnknownNode { graph: u32, node: u32 },
}

/// One pipeline stage: a role plus the node ids its derived records feed.
#[derive(Debug)]
pub struct GraphNode {
    pub id: u32,
    pub role: Role,
    pub next: Vec<u32>,
    group: Arc<WorkerGroup>,
}

impl GraphNode {
    pub fn group(&self) -> &Arc<WorkerGroup> {
        &self.group
    }

    /// A node with no downstream entries holds terminal aggregation state,
    /// so it must be registered with the persistence cycle.
    pub fn is_terminal(&self) -> bool {
        self.next.is_empty()
    }
}

/// Immutable DAG of worker stages, assembled once at boot.
#[derive(Debug)]
pub struct Graph {
    id: u32,
    entry: u32,
    nodes: HashMap<u32, GraphNode>,
}

impl Graph {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn entry_node_id(&self) -> u32 {
        self.entry
    }

    pub fn node(&self, id: u32) -> Result<&GraphNode, GraphError> {
        self.nodes.get(&id).ok_or(GraphError::UnknownNode {
            graph: self.id,
            node: id,
        })
    }

    pub fn node_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.nodes.keys().copied()
    }

    /// Sole entry point by which decoded facts enter the pipeline.
    pub async fn start(&self, record: Record) -> Result<(), TellError> {
        let entry = self
            .nodes
            .get(&self.entry)
            .expect("entry node exists by construction");
        entry.group.tell(record).await
    }
}

type NodeFactory = Box<dyn Fn(usize) -> Box<dyn WorkerLogic> + Send + Sync>;

struct NodeSpec {
    id: u32,
    role: Role,
    next: Vec<u32>,
    shard_count: usize,
    queue_capacity: usize,
    factory: NodeFactory,
}

/// Declarative graph assembly: list the nodes, then `build` registers the
/// workers bottom-up so every node's downstream groups exist before its own
/// shards spawn.
pub struct GraphBuilder {
    id: u32,
    entry: Option<u32>,
    specs: Vec<NodeSpec>,
}

impl GraphBuilder {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            entry: None,
            specs: Vec::new(),
        }
    }

    /// Adds a node. The first node added is the graph's entry node.
    pub fn node<F>(
        mut self,
        id: u32,
        role: Role,
        shard_count: usize,
        queue_capacity: usize,
        next: &[u32],
        factory: F,
    ) -> Self
    where
        F: Fn(usize) -> Box<dyn WorkerLogic> + Send + Sync + 'static,
    {
        if self.entry.is_none() {
            self.entry = Some(id);
        }
        self.specs.push(NodeSpec {
            id,
            role,
            next: next.to_vec(),
            shard_count,
            queue_capacity,
            factory: Box::new(factory),
        });
        self
    }

    pub fn build(self, registry: &WorkerRegistry) -> Result<Graph> {
        let Some(entry) = self.entry else {
            bail!("graph {} has no nodes", self.id);
        };

        let ids: HashSet<u32> = self.specs.iter().map(|s| s.id).collect();
        if ids.len() != self.specs.len() {
            bail!("graph {} declares a node id twice", self.id);
        }
        for spec in &self.specs {
            for next in &spec.next {
                if !ids.contains(next) {
                    bail!(
                        "graph {} node {} references unknown node {}",
                        self.id,
                        spec.id,
                        next
                    );
                }
            }
        }

        // Register leaves first so each node's Downstream holds live
        // groups; failure to make progress means the listing has a cycle.
        let mut remaining = self.specs;
        let mut built: HashMap<u32, Arc<WorkerGroup>> = HashMap::new();
        let mut nodes: HashMap<u32, GraphNode> = HashMap::new();

        while !remaining.is_empty() {
            let Some(idx) = remaining
                .iter()
                .position(|s| s.next.iter().all(|n| built.contains_key(n)))
            else {
                bail!("graph {} contains a cycle", self.id);
            };

            let spec = remaining.swap_remove(idx);
            let targets = spec.next.iter().map(|n| Arc::clone(&built[n])).collect();
            let group = registry.register(
                spec.role,
                |shard| (spec.factory)(shard),
                Downstream::new(targets),
                spec.shard_count,
                spec.queue_capacity,
            );

            built.insert(spec.id, Arc::clone(&group));
            nodes.insert(
                spec.id,
                GraphNode {
                    id: spec.id,
                    role: spec.role,
                    next: spec.next,
                    group,
                },
            );
        }

        debug!(graph = self.id, nodes = nodes.len(), "graph assembled");

        Ok(Graph {
            id: self.id,
            entry,
            nodes,
        })
    }
}

/// Process-wide registry of assembled graphs.
///
/// Registration is append-only and create-if-absent, because several boot
/// paths may lazily reference the same graph.
#[derive(Default)]
pub struct GraphManager {
    graphs: DashMap<u32, Arc<Graph>>,
}

impl GraphManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a graph unless one with the same id already exists; the
    /// first registration wins.
    pub fn create_if_absent(&self, graph: Graph) -> Arc<Graph> {
        let entry = self
            .graphs
            .entry(graph.id)
            .or_insert_with(|| Arc::new(graph));
        Arc::clone(&entry)
    }

    pub fn find(&self, id: u32) -> Result<Arc<Graph>, GraphError> {
        self.graphs
            .get(&id)
            .map(|g| Arc::clone(&g))
            .ok_or(GraphError::UnknownGraph(id))
    }
}
