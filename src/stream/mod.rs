pub mod aggregate;
pub mod analysis;
pub mod graph;
pub mod selector;
pub mod worker;

pub use graph::{Graph, GraphBuilder, GraphError, GraphManager, GraphNode};
pub use selector::SelectStrategy;
pub use worker::{
    Downstream, DrainError, Role, TellError, UnregisteredRole, WorkerGroup, WorkerLogic,
    WorkerRef, WorkerRegistry,
};
