use thiserror::Error;

use crate::record::{
    EndpointMetric, InstanceMetric, Record, RecordKind, ServiceMetric, ServiceRelation, SpanFact,
};

use super::registry::StreamTypeRegistry;

/// Cross-node transport shape: a registered type id plus positional lists
/// of primitives. The layout per type id is fixed at compile time and must
/// match on both ends; there is no schema negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WireEnvelope {
    pub type_id: u32,
    pub strings: Vec<String>,
    pub ints: Vec<i32>,
    pub longs: Vec<i64>,
}

/// Decode failure for one envelope. Always fatal for that single message;
/// a mis-positioned field is a programmer error surfaced loudly, never
/// silently miscoded data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unknown stream type id {0}")]
    UnknownTypeId(u32),
    #[error("stream type {0} is not registered")]
    UnregisteredType(&'static str),
    #[error("{kind} envelope missing string field {index}")]
    MissingString { kind: &'static str, index: usize },
    #[error("{kind} envelope missing int field {index}")]
    MissingInt { kind: &'static str, index: usize },
    #[error("{kind} envelope missing long field {index}")]
    MissingLong { kind: &'static str, index: usize },
}

/// Accumulates positional fields for one record.
#[derive(Default)]
pub struct WireBuilder {
    strings: Vec<String>,
    ints: Vec<i32>,
    longs: Vec<i64>,
}

impl WireBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_string(&mut self, value: impl Into<String>) {
        self.strings.push(value.into());
    }

    pub fn push_int(&mut self, value: i32) {
        self.ints.push(value);
    }

    pub fn push_long(&mut self, value: i64) {
        self.longs.push(value);
    }

    pub fn finish(self, type_id: u32) -> WireEnvelope {
        WireEnvelope {
            type_id,
            strings: self.strings,
            ints: self.ints,
            longs: self.longs,
        }
    }
}

/// Bounds-checked positional access over an envelope.
pub struct WireReader<'a> {
    kind: &'static str,
    envelope: &'a WireEnvelope,
}

impl<'a> WireReader<'a> {
    pub fn new(kind: &'static str, envelope: &'a WireEnvelope) -> Self {
        Self { kind, envelope }
    }

    pub fn string(&self, index: usize) -> Result<String, WireError> {
        self.envelope
            .strings
            .get(index)
            .cloned()
            .ok_or(WireError::MissingString {
                kind: self.kind,
                index,
            })
    }

    pub fn int(&self, index: usize) -> Result<i32, WireError> {
        self.envelope
            .ints
            .get(index)
            .copied()
            .ok_or(WireError::MissingInt {
                kind: self.kind,
                index,
            })
    }

    pub fn long(&self, index: usize) -> Result<i64, WireError> {
        self.envelope
            .longs
            .get(index)
            .copied()
            .ok_or(WireError::MissingLong {
                kind: self.kind,
                index,
            })
    }
}

// --- Positional layouts, one block per record kind ---

impl SpanFact {
    // strings: [service, instance, endpoint, peer]; ints: [is_error,
    // has_peer]; longs: [time_bucket, duration_ms].
    fn encode(&self, out: &mut WireBuilder) {
        out.push_string(&self.service);
        out.push_string(&self.instance);
        out.push_string(&self.endpoint);
        out.push_string(self.peer_service.as_deref().unwrap_or(""));
        out.push_int(i32::from(self.is_error));
        out.push_int(i32::from(self.peer_service.is_some()));
        out.push_long(self.time_bucket);
        out.push_long(self.duration_ms);
    }

    fn decode(r: &WireReader<'_>) -> Result<Self, WireError> {
        let peer = r.string(3)?;
        let has_peer = r.int(1)? != 0;
        Ok(Self {
            service: r.string(0)?,
            instance: r.string(1)?,
            endpoint: r.string(2)?,
            peer_service: has_peer.then_some(peer),
            is_error: r.int(0)? != 0,
            time_bucket: r.long(0)?,
            duration_ms: r.long(1)?,
        })
    }
}

impl ServiceMetric {
    // strings: [id, service]; longs: [time_bucket, calls, error_calls,
    // duration_sum, duration_max, duration_min].
    fn encode(&self, out: &mut WireBuilder) {
        out.push_string(&self.id);
        out.push_string(&self.service);
        out.push_long(self.time_bucket);
        out.push_long(self.calls);
        out.push_long(self.error_calls);
        out.push_long(self.duration_sum);
        out.push_long(self.duration_max);
        out.push_long(self.duration_min);
    }

    fn decode(r: &WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            id: r.string(0)?,
            service: r.string(1)?,
            time_bucket: r.long(0)?,
            calls: r.long(1)?,
            error_calls: r.long(2)?,
            duration_sum: r.long(3)?,
            duration_max: r.long(4)?,
            duration_min: r.long(5)?,
        })
    }
}

impl InstanceMetric {
    // strings: [id, service, instance]; longs as ServiceMetric.
    fn encode(&self, out: &mut WireBuilder) {
        out.push_string(&self.id);
        out.push_string(&self.service);
        out.push_string(&self.instance);
        out.push_long(self.time_bucket);
        out.push_long(self.calls);
        out.push_long(self.error_calls);
        out.push_long(self.duration_sum);
        out.push_long(self.duration_max);
        out.push_long(self.duration_min);
    }

    fn decode(r: &WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            id: r.string(0)?,
            service: r.string(1)?,
            instance: r.string(2)?,
            time_bucket: r.long(0)?,
            calls: r.long(1)?,
            error_calls: r.long(2)?,
            duration_sum: r.long(3)?,
            duration_max: r.long(4)?,
            duration_min: r.long(5)?,
        })
    }
}

impl EndpointMetric {
    // strings: [id, service, endpoint]; longs as ServiceMetric.
    fn encode(&self, out: &mut WireBuilder) {
        out.push_string(&self.id);
        out.push_string(&self.service);
        out.push_string(&self.endpoint);
        out.push_long(self.time_bucket);
        out.push_long(self.calls);
        out.push_long(self.error_calls);
        out.push_long(self.duration_sum);
        out.push_long(self.duration_max);
        out.push_long(self.duration_min);
    }

    fn decode(r: &WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            id: r.string(0)?,
            service: r.string(1)?,
            endpoint: r.string(2)?,
            time_bucket: r.long(0)?,
            calls: r.long(1)?,
            error_calls: r.long(2)?,
            duration_sum: r.long(3)?,
            duration_max: r.long(4)?,
            duration_min: r.long(5)?,
        })
    }
}

impl ServiceRelation {
    // strings: [id, source, dest]; longs: [time_bucket, calls, error_calls,
    // duration_sum].
    fn encode(&self, out: &mut WireBuilder) {
        out.push_string(&self.id);
        out.push_string(&self.source_service);
        out.push_string(&self.dest_service);
        out.push_long(self.time_bucket);
        out.push_long(self.calls);
        out.push_long(self.error_calls);
        out.push_long(self.duration_sum);
    }

    fn decode(r: &WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            id: r.string(0)?,
            source_service: r.string(1)?,
            dest_service: r.string(2)?,
            time_bucket: r.long(0)?,
            calls: r.long(1)?,
            error_calls: r.long(2)?,
            duration_sum: r.long(3)?,
        })
    }
}

impl Record {
    /// Serializes a record for a cross-node hop.
    ///
    /// The registry must be finalized before the first call, otherwise the
    /// record's kind has no id and the send fails.
    pub fn to_envelope(&self, types: &StreamTypeRegistry) -> Result<WireEnvelope, WireError> {
        let type_id = types
            .id_for(self.kind())
            .ok_or(WireError::UnregisteredType(self.kind().stream_name()))?;

        let mut out = WireBuilder::new();
        match self {
            Self::Span(f) => f.encode(&mut out),
            Self::Service(m) => m.encode(&mut out),
            Self::Instance(m) => m.encode(&mut out),
            Self::Endpoint(m) => m.encode(&mut out),
            Self::Relation(m) => m.encode(&mut out),
        }
        Ok(out.finish(type_id))
    }

    /// Decodes an envelope received from another node.
    pub fn from_envelope(
        envelope: &WireEnvelope,
        types: &StreamTypeRegistry,
    ) -> Result<Record, WireError> {
        let kind = types
            .kind_for(envelope.type_id)
            .ok_or(WireError::UnknownTypeId(envelope.type_id))?;

        let r = WireReader::new(kind.stream_name(), envelope);
        Ok(match kind {
            RecordKind::SpanFact => Record::Span(SpanFact::decode(&r)?),
            RecordKind::ServiceMetric => Record::Service(ServiceMetric::decode(&r)?),
            RecordKind::InstanceMetric => Record::Instance(InstanceMetric::decode(&r)?),
            RecordKind::EndpointMetric => Record::Endpoint(EndpointMetric::decode(&r)?),
            RecordKind::ServiceRelation => Record::Relation(ServiceRelation::decode(&r)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::registry::StreamTypeRegistryBuilder;

    fn full_registry() -> StreamTypeRegistry {
        let mut builder = StreamTypeRegistryBuilder::default();
        for kind in RecordKind::ALL {
            builder.register(*kind);
        }
        builder.finalize()
    }

    #[test]
    fn test_relation_round_trip() {
        let types = full_registry();
        let original = Record::Relation(ServiceRelation {
            id: "202401010000_gateway_checkout".to_string(),
            time_bucket: 202401010000,
            source_service: "gateway".to_string(),
            dest_service: "checkout".to_string(),
            calls: 12,
            error_calls: 2,
            duration_sum: 340,
        });

        let envelope = original.to_envelope(&types).unwrap();
        assert_eq!(envelope.strings.len(), 3);
        assert_eq!(envelope.longs.len(), 4);

        let decoded = Record::from_envelope(&envelope, &types).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_span_fact_round_trip_with_and_without_peer() {
        let types = full_registry();
        for peer in [None, Some("gateway".to_string())] {
            let original = Record::Span(SpanFact {
                service: "checkout".to_string(),
                instance: "checkout-1".to_string(),
                endpoint: "/pay".to_string(),
                peer_service: peer,
                time_bucket: 202401010000,
                duration_ms: 18,
                is_error: true,
            });

            let envelope = original.to_envelope(&types).unwrap();
            let decoded = Record::from_envelope(&envelope, &types).unwrap();
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn test_unknown_type_id_is_fatal() {
        let types = full_registry();
        let envelope = WireEnvelope {
            type_id: 999,
            ..Default::default()
        };

        assert_eq!(
            Record::from_envelope(&envelope, &types),
            Err(WireError::UnknownTypeId(999))
        );
    }

    #[test]
    fn test_truncated_envelope_is_a_bounds_error() {
        let types = full_registry();
        let metric = Record::Service(ServiceMetric {
            id: "202401010000_checkout".to_string(),
            time_bucket: 202401010000,
            service: "checkout".to_string(),
            calls: 1,
            error_calls: 0,
            duration_sum: 5,
            duration_max: 5,
            duration_min: 5,
        });

        let mut envelope = metric.to_envelope(&types).unwrap();
        envelope.longs.truncate(2);

        let err = Record::from_envelope(&envelope, &types).unwrap_err();
        assert_eq!(
            err,
            WireError::MissingLong {
                kind: "service_metric",
                index: 2
            }
        );
    }

    #[test]
    fn test_wrong_layout_never_decodes_silently() {
        let types = full_registry();

        // A relation-shaped payload stamped with the service-metric id has
        // too few longs for that layout.
        let relation = Record::Relation(ServiceRelation {
            id: "202401010000_a_b".to_string(),
            time_bucket: 202401010000,
            source_service: "a".to_string(),
            dest_service: "b".to_string(),
            calls: 1,
            error_calls: 0,
            duration_sum: 1,
        });
        let mut envelope = relation.to_envelope(&types).unwrap();
        envelope.type_id = types.id_for(RecordKind::ServiceMetric).unwrap();

        assert!(Record::from_envelope(&envelope, &types).is_err());
    }

    #[test]
    fn test_unfinalized_registry_rejects_encode() {
        let mut builder = StreamTypeRegistryBuilder::default();
        builder.register(RecordKind::ServiceMetric);
        let types = builder.finalize();

        let relation = Record::Relation(ServiceRelation {
            id: "x".to_string(),
            time_bucket: 0,
            source_service: String::new(),
            dest_service: String::new(),
            calls: 0,
            error_calls: 0,
            duration_sum: 0,
        });

        assert_eq!(
            relation.to_envelope(&types),
            Err(WireError::UnregisteredType("service_relation"))
        );
    }
}
