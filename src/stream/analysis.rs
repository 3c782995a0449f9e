use tracing::warn;

use crate::record::{
    EndpointMetric, InstanceMetric, Record, ServiceMetric, ServiceRelation, SpanFact,
};

use super::worker::WorkerLogic;

/// Entry-node logic of the trace graph.
///
/// Stateless: each span fact is expanded into the per-dimension metric
/// records its downstream aggregators maintain. The producer of the fact
/// never sees this fan-out shape.
pub struct SpanAnalysisLogic;

impl SpanAnalysisLogic {
    fn error_count(fact: &SpanFact) -> i64 {
        i64::from(fact.is_error)
    }

    fn service_metric(fact: &SpanFact) -> ServiceMetric {
        ServiceMetric {
            id: ServiceMetric::record_id(&fact.service, fact.time_bucket),
            time_bucket: fact.time_bucket,
            service: fact.service.clone(),
            calls: 1,
            error_calls: Self::error_count(fact),
            duration_sum: fact.duration_ms,
            duration_max: fact.duration_ms,
            duration_min: fact.duration_ms,
        }
    }

    fn instance_metric(fact: &SpanFact) -> InstanceMetric {
        InstanceMetric {
            id: InstanceMetric::record_id(&fact.service, &fact.instance, fact.time_bucket),
            time_bucket: fact.time_bucket,
            service: fact.service.clone(),
            instance: fact.instance.clone(),
            calls: 1,
            error_calls: Self::error_count(fact),
            duration_sum: fact.duration_ms,
            duration_max: fact.duration_ms,
            duration_min: fact.duration_ms,
        }
    }

    fn endpoint_metric(fact: &SpanFact) -> EndpointMetric {
        EndpointMetric {
            id: EndpointMetric::record_id(&fact.service, &fact.endpoint, fact.time_bucket),
            time_bucket: fact.time_bucket,
            service: fact.service.clone(),
            endpoint: fact.endpoint.clone(),
            calls: 1,
            error_calls: Self::error_count(fact),
            duration_sum: fact.duration_ms,
            duration_max: fact.duration_ms,
            duration_min: fact.duration_ms,
        }
    }

    fn relation(fact: &SpanFact, peer: &str) -> ServiceRelation {
        ServiceRelation {
            id: ServiceRelation::record_id(peer, &fact.service, fact.time_bucket),
            time_bucket: fact.time_bucket,
            source_service: peer.to_string(),
            dest_service: fact.service.clone(),
            calls: 1,
            error_calls: Self::error_count(fact),
            duration_sum: fact.duration_ms,
        }
    }
}

impl WorkerLogic for SpanAnalysisLogic {
    fn process(&mut self, record: Record, out: &mut Vec<Record>) {
        let fact = match record {
            Record::Span(fact) => fact,
            other => {
                warn!(kind = %other.kind(), "span analysis received non-span record, dropping");
                return;
            }
        };

        out.push(Record::Service(Self::service_metric(&fact)));
        out.push(Record::Instance(Self::instance_metric(&fact)));
        out.push(Record::Endpoint(Self::endpoint_metric(&fact)));

        // Topology edges exist only for spans that crossed a service
        // boundary.
        if let Some(peer) = &fact.peer_service {
            out.push(Record::Relation(Self::relation(&fact, peer)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordKind;

    fn fact(peer: Option<&str>, is_error: bool) -> SpanFact {
        SpanFact {
            service: "checkout".to_string(),
            instance: "checkout-1".to_string(),
            endpoint: "/pay".to_string(),
            peer_service: peer.map(str::to_string),
            time_bucket: 202401010000,
            duration_ms: 25,
            is_error,
        }
    }

    #[test]
    fn test_entry_span_derives_three_metrics() {
        let mut logic = SpanAnalysisLogic;
        let mut out = Vec::new();

        logic.process(Record::Span(fact(None, false)), &mut out);

        let kinds: Vec<RecordKind> = out.iter().map(Record::kind).collect();
        assert_eq!(
            kinds,
            vec![
                RecordKind::ServiceMetric,
                RecordKind::InstanceMetric,
                RecordKind::EndpointMetric,
            ]
        );
    }

    #[test]
    fn test_cross_service_span_also_derives_edge() {
        let mut logic = SpanAnalysisLogic;
        let mut out = Vec::new();

        logic.process(Record::Span(fact(Some("gateway"), true)), &mut out);

        assert_eq!(out.len(), 4);
        let Record::Relation(edge) = &out[3] else { panic!("expected relation") };
        assert_eq!(edge.source_service, "gateway");
        assert_eq!(edge.dest_service, "checkout");
        assert_eq!(edge.error_calls, 1);
        assert_eq!(edge.id, "202401010000_gateway_checkout");
    }

    #[test]
    fn test_derived_measures_seed_from_duration() {
        let mut logic = SpanAnalysisLogic;
        let mut out = Vec::new();

        logic.process(Record::Span(fact(None, false)), &mut out);

        let Record::Service(m) = &out[0] else { panic!("expected service metric") };
        assert_eq!(m.calls, 1);
        assert_eq!(m.error_calls, 0);
        assert_eq!(m.duration_sum, 25);
        assert_eq!(m.duration_max, 25);
        assert_eq!(m.duration_min, 25);
    }
}
