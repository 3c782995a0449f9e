use std::sync::Arc;
use std::time::Duration;

use traceloom::boot::{self, StorageSeam};
use traceloom::config::Config;
use traceloom::record::{Record, SpanFact};
use traceloom::storage::{BatchDao, MemoryDao, MetricsDao};

fn seam(dao: &Arc<MemoryDao>) -> StorageSeam {
    StorageSeam {
        metrics: Arc::clone(dao) as Arc<dyn MetricsDao>,
        batch: Arc::clone(dao) as Arc<dyn BatchDao>,
    }
}

fn fact(
    service: &str,
    instance: &str,
    endpoint: &str,
    peer: Option<&str>,
    duration_ms: i64,
    is_error: bool,
) -> SpanFact {
    SpanFact {
        service: service.to_string(),
        instance: instance.to_string(),
        endpoint: endpoint.to_string(),
        peer_service: peer.map(str::to_string),
        time_bucket: 202401010000,
        duration_ms,
        is_error,
    }
}

fn service_metric<'a>(records: &'a [Record], id: &str) -> &'a traceloom::record::ServiceMetric {
    records
        .iter()
        .find_map(|r| match r {
            Record::Service(m) if m.id == id => Some(m),
            _ => None,
        })
        .unwrap_or_else(|| panic!("service metric {id} not stored"))
}

/// Drives facts through the full graph into storage: analysis fan-out,
/// sharded aggregation, merge-on-read persistence.
#[tokio::test]
async fn test_span_facts_flow_into_stored_metrics() {
    let dao = Arc::new(MemoryDao::new());
    let core = boot::assemble(&Config::default(), seam(&dao), None).expect("assemble");

    core.ingest(fact("checkout", "checkout-1", "/pay", None, 10, false))
        .await
        .unwrap();
    core.ingest(fact("checkout", "checkout-1", "/pay", Some("gateway"), 30, true))
        .await
        .unwrap();
    core.ingest(fact("inventory", "inventory-2", "/stock", Some("checkout"), 20, false))
        .await
        .unwrap();

    // 2 services + 2 instances + 2 endpoints + 2 topology edges.
    for _ in 0..400 {
        core.flush_now().await;
        if dao.len() == 8 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(dao.len(), 8, "stored: {:?}", dao.snapshot());

    let stored = dao.snapshot();

    let checkout = service_metric(&stored, "202401010000_checkout");
    assert_eq!(checkout.calls, 2);
    assert_eq!(checkout.error_calls, 1);
    assert_eq!(checkout.duration_sum, 40);
    assert_eq!(checkout.duration_max, 30);
    assert_eq!(checkout.duration_min, 10);

    let inventory = service_metric(&stored, "202401010000_inventory");
    assert_eq!(inventory.calls, 1);
    assert_eq!(inventory.error_calls, 0);

    let instance = stored
        .iter()
        .find_map(|r| match r {
            Record::Instance(m) if m.id == "202401010000_checkout_checkout-1" => Some(m),
            _ => None,
        })
        .expect("instance metric stored");
    assert_eq!(instance.calls, 2);
    assert_eq!(instance.service, "checkout");

    let endpoint = stored
        .iter()
        .find_map(|r| match r {
            Record::Endpoint(m) if m.id == "202401010000_checkout_/pay" => Some(m),
            _ => None,
        })
        .expect("endpoint metric stored");
    assert_eq!(endpoint.calls, 2);
    assert_eq!(endpoint.duration_sum, 40);

    let edge = stored
        .iter()
        .find_map(|r| match r {
            Record::Relation(m) if m.id == "202401010000_gateway_checkout" => Some(m),
            _ => None,
        })
        .expect("gateway->checkout edge stored");
    assert_eq!(edge.calls, 1);
    assert_eq!(edge.error_calls, 1);

    assert!(stored
        .iter()
        .any(|r| matches!(r, Record::Relation(m) if m.id == "202401010000_checkout_inventory")));

    core.stop().await;
}

/// Aggregates drained at flush time merge into rows already in storage
/// rather than overwriting them.
#[tokio::test]
async fn test_flush_merges_with_preexisting_storage() {
    let dao = Arc::new(MemoryDao::new());
    dao.put_record(Record::Service(traceloom::record::ServiceMetric {
        id: "202401010000_checkout".to_string(),
        time_bucket: 202401010000,
        service: "checkout".to_string(),
        calls: 5,
        error_calls: 2,
        duration_sum: 100,
        duration_max: 50,
        duration_min: 3,
    }));

    let core = boot::assemble(&Config::default(), seam(&dao), None).expect("assemble");

    core.ingest(fact("checkout", "checkout-1", "/pay", None, 80, false))
        .await
        .unwrap();

    for _ in 0..400 {
        core.flush_now().await;
        let Some(Record::Service(m)) = dao.get_record("202401010000_checkout") else {
            panic!("seeded record vanished");
        };
        if m.calls == 6 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let Some(Record::Service(m)) = dao.get_record("202401010000_checkout") else {
        panic!("wrong kind stored");
    };
    assert_eq!(m.calls, 6);
    assert_eq!(m.error_calls, 2);
    assert_eq!(m.duration_sum, 180);
    assert_eq!(m.duration_max, 80);
    assert_eq!(m.duration_min, 3);

    core.stop().await;
}

/// A clean shutdown flushes accepted-but-unflushed aggregates before the
/// workers stop.
#[tokio::test]
async fn test_stop_flushes_pending_aggregates() {
    let dao = Arc::new(MemoryDao::new());
    let core = boot::assemble(&Config::default(), seam(&dao), None).expect("assemble");

    for i in 0..20 {
        core.ingest(fact(
            "checkout",
            "checkout-1",
            "/pay",
            None,
            i + 1,
            false,
        ))
        .await
        .unwrap();
    }

    // No explicit flush: stop itself must not lose the records.
    core.stop().await;

    let Some(Record::Service(m)) = dao.get_record("202401010000_checkout") else {
        panic!("service metric not stored on shutdown");
    };
    assert_eq!(m.calls, 20);
    assert_eq!(m.duration_min, 1);
    assert_eq!(m.duration_max, 20);
}
