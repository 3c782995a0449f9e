use std::collections::HashMap;

use tracing::{error, warn};

use crate::record::Record;

use super::worker::{Role, WorkerLogic};

/// In-memory additive aggregation keyed by record id.
///
/// Owned by exactly one shard consumer loop; incoming records merge into the
/// map and the whole map is swapped out by `drain` when the persistence
/// cycle fires, so producers are never blocked by a flush.
pub struct AggregateLogic {
    role: Role,
    map: HashMap<String, Record>,
}

impl AggregateLogic {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            map: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl WorkerLogic for AggregateLogic {
    fn process(&mut self, record: Record, _out: &mut Vec<Record>) {
        if record.kind() != self.role.accepts {
            warn!(
                role = %self.role,
                kind = %record.kind(),
                "record kind does not match role, dropping"
            );
            return;
        }

        let Some(id) = record.id().map(str::to_string) else {
            warn!(role = %self.role, kind = %record.kind(), "record without id, dropping");
            return;
        };

        if let Some(existing) = self.map.get_mut(&id) {
            if let Err(e) = existing.merge(&record) {
                error!(role = %self.role, id = %id, error = %e, "aggregation merge failed");
            }
        } else {
            self.map.insert(id, record);
        }
    }

    fn drain(&mut self) -> Vec<Record> {
        std::mem::take(&mut self.map).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RecordKind, ServiceMetric, SpanFact};

    const ROLE: Role = Role::hashed("service_metric_aggregate", RecordKind::ServiceMetric);

    fn service_record(service: &str, calls: i64, max: i64) -> Record {
        Record::Service(ServiceMetric {
            id: ServiceMetric::record_id(service, 202401010000),
            time_bucket: 202401010000,
            service: service.to_string(),
            calls,
            error_calls: 0,
            duration_sum: calls * 2,
            duration_max: max,
            duration_min: max,
        })
    }

    #[test]
    fn test_insert_then_merge() {
        let mut logic = AggregateLogic::new(ROLE);
        let mut out = Vec::new();

        logic.process(service_record("checkout", 1, 30), &mut out);
        logic.process(service_record("checkout", 2, 70), &mut out);
        logic.process(service_record("inventory", 5, 10), &mut out);

        assert!(out.is_empty());
        assert_eq!(logic.len(), 2);

        let drained = logic.drain();
        let checkout = drained
            .iter()
            .find_map(|r| match r {
                Record::Service(m) if m.service == "checkout" => Some(m),
                _ => None,
            })
            .expect("checkout entry");
        assert_eq!(checkout.calls, 3);
        assert_eq!(checkout.duration_max, 70);
        assert_eq!(checkout.duration_min, 30);
    }

    #[test]
    fn test_drain_leaves_empty_map() {
        let mut logic = AggregateLogic::new(ROLE);
        let mut out = Vec::new();

        logic.process(service_record("checkout", 1, 5), &mut out);
        assert_eq!(logic.drain().len(), 1);
        assert!(logic.is_empty());
        assert!(logic.drain().is_empty());

        // Records after a drain go into the fresh map.
        logic.process(service_record("checkout", 9, 5), &mut out);
        let drained = logic.drain();
        assert_eq!(drained.len(), 1);
        let Record::Service(m) = &drained[0] else { panic!("wrong kind") };
        assert_eq!(m.calls, 9);
    }

    #[test]
    fn test_mismatched_kind_is_dropped() {
        let mut logic = AggregateLogic::new(ROLE);
        let mut out = Vec::new();

        logic.process(
            Record::Span(SpanFact {
                service: "checkout".to_string(),
                instance: "checkout-1".to_string(),
                endpoint: "/pay".to_string(),
                peer_service: None,
                time_bucket: 202401010000,
                duration_ms: 3,
                is_error: false,
            }),
            &mut out,
        );

        assert!(logic.is_empty());
        assert!(out.is_empty());
    }
}
