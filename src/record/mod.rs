pub mod metric;
pub mod span;
pub mod topology;

use thiserror::Error;

pub use metric::{EndpointMetric, InstanceMetric, ServiceMetric};
pub use span::SpanFact;
pub use topology::ServiceRelation;

/// Closed set of record shapes that flow through the stream pipeline.
///
/// Dispatch is always an explicit match on this enum; there is no
/// reflection-style lookup anywhere in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    SpanFact,
    ServiceMetric,
    InstanceMetric,
    EndpointMetric,
    ServiceRelation,
}

impl RecordKind {
    /// Every record kind known to this build.
    pub const ALL: &'static [RecordKind] = &[
        RecordKind::SpanFact,
        RecordKind::ServiceMetric,
        RecordKind::InstanceMetric,
        RecordKind::EndpointMetric,
        RecordKind::ServiceRelation,
    ];

    /// Stable name used for wire type-id assignment and logging.
    ///
    /// Cluster-wide type ids are derived from the sorted set of these
    /// names, so renaming one is a wire-format break.
    pub const fn stream_name(self) -> &'static str {
        match self {
            Self::SpanFact => "span_fact",
            Self::ServiceMetric => "service_metric",
            Self::InstanceMetric => "instance_metric",
            Self::EndpointMetric => "endpoint_metric",
            Self::ServiceRelation => "service_relation",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.stream_name())
    }
}

/// Error raised when two records cannot be combined.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("cannot merge {left} into {right}")]
    KindMismatch { left: RecordKind, right: RecordKind },
    #[error("cannot merge record {other} into record {own}")]
    IdMismatch { own: String, other: String },
    #[error("{0} records are not mergeable")]
    NotMergeable(RecordKind),
}

/// A single message travelling through the worker graph.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Span(SpanFact),
    Service(ServiceMetric),
    Instance(InstanceMetric),
    Endpoint(EndpointMetric),
    Relation(ServiceRelation),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Span(_) => RecordKind::SpanFact,
            Self::Service(_) => RecordKind::ServiceMetric,
            Self::Instance(_) => RecordKind::InstanceMetric,
            Self::Endpoint(_) => RecordKind::EndpointMetric,
            Self::Relation(_) => RecordKind::ServiceRelation,
        }
    }

    /// Aggregation identity. Span facts are not mergeable and carry none.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Span(_) => None,
            Self::Service(m) => Some(&m.id),
            Self::Instance(m) => Some(&m.id),
            Self::Endpoint(m) => Some(&m.id),
            Self::Relation(m) => Some(&m.id),
        }
    }

    /// Key the selector hashes to pick a shard.
    ///
    /// Mergeable records route by id so every record with the same id lands
    /// on the same shard; span facts route by service name.
    pub fn routing_key(&self) -> &str {
        match self {
            Self::Span(f) => &f.service,
            other => other.id().unwrap_or_default(),
        }
    }

    pub fn time_bucket(&self) -> i64 {
        match self {
            Self::Span(f) => f.time_bucket,
            Self::Service(m) => m.time_bucket,
            Self::Instance(m) => m.time_bucket,
            Self::Endpoint(m) => m.time_bucket,
            Self::Relation(m) => m.time_bucket,
        }
    }

    /// Combines `other` into `self`.
    ///
    /// Counters add, extrema take min/max, empty name fields are filled
    /// once. The operation is commutative and associative over the measure
    /// fields, so arrival order never changes the aggregate.
    pub fn merge(&mut self, other: &Record) -> Result<(), MergeError> {
        if self.kind() != other.kind() {
            return Err(MergeError::KindMismatch {
                left: other.kind(),
                right: self.kind(),
            });
        }

        match (self.id(), other.id()) {
            (Some(own), Some(theirs)) if own != theirs => {
                return Err(MergeError::IdMismatch {
                    own: own.to_string(),
                    other: theirs.to_string(),
                });
            }
            _ => {}
        }

        match (self, other) {
            (Self::Service(a), Self::Service(b)) => a.merge(b),
            (Self::Instance(a), Self::Instance(b)) => a.merge(b),
            (Self::Endpoint(a), Self::Endpoint(b)) => a.merge(b),
            (Self::Relation(a), Self::Relation(b)) => a.merge(b),
            (Self::Span(_), _) => return Err(MergeError::NotMergeable(RecordKind::SpanFact)),
            _ => unreachable!("kind equality checked above"),
        }

        Ok(())
    }
}
