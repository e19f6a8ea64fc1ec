//! End-to-end flows over the in-memory transport and an in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::Row;
use tokio_util::sync::CancellationToken;

use weft_dispatch::{PublishConfig, ReceptorFn, ReceptorOutput};
use weft_lifecycle::Stage;
use weft_runtime::{
    CheckpointMode, InboundRoute, Perspective, RuntimeConfig, WeftRuntime,
};
use weft_store::WeftStore;
use weft_transport::{MemoryTransport, Transport};
use weft_types::{Envelope, StatusFlags, StreamId};

//──────────────────────────────────────────────────────────────────────────────
//  Helpers
//──────────────────────────────────────────────────────────────────────────────

fn test_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::for_service("orders-svc");
    config.coordinator.partition_count = 16;
    config.partitions.partition_count = 16;
    config.poll_interval = Duration::from_millis(50);
    config.heartbeat_interval = Duration::from_millis(100);
    config.perspective_interval = Duration::from_millis(50);
    config
}

fn recording_receptor(seen: Arc<Mutex<Vec<Vec<u8>>>>) -> ReceptorFn {
    Arc::new(move |payload, _ctx| {
        let seen = seen.clone();
        Box::pin(async move {
            seen.lock().unwrap().push(payload);
            Ok(ReceptorOutput::Void)
        })
    })
}

async fn outbox_status(store: &WeftStore, message_id: &str) -> String {
    sqlx::query("SELECT status FROM outbox WHERE message_id = ?")
        .bind(message_id)
        .fetch_one(store.pool())
        .await
        .unwrap()
        .get(0)
}

//──────────────────────────────────────────────────────────────────────────────
//  Deterministic cycle stepping
//──────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn message_round_trip_through_the_transport() {
    let store = WeftStore::in_memory().await.unwrap();
    let transport = Arc::new(MemoryTransport::default());
    let runtime = WeftRuntime::new(test_config(), store.clone(), transport.clone())
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    runtime
        .receptors()
        .register("orders.placed", recording_receptor(seen.clone()));
    runtime.policies().add_rule(
        "orders",
        |ctx| ctx.type_tag == "orders.placed",
        PublishConfig::to_destination("orders-topic").as_event(),
    );
    runtime.listen("orders-topic", InboundRoute::default()).unwrap();

    let stream = StreamId::generate();
    let receipt = runtime
        .send_with_policy("orders.placed", br#"{"qty":3}"#.to_vec(), Some(stream), None)
        .unwrap();

    // Cycle 1: store + claim + publish; the subscription pump feeds the inbox.
    runtime.run_cycle_once().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Cycle 2: publish completion lands (event appended), inbox row stored
    // and dispatched to the receptor.
    runtime.run_cycle_once().await.unwrap();

    // Cycle 3: receptor completion lands.
    runtime.run_cycle_once().await.unwrap();

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(seen.lock().unwrap()[0], br#"{"qty":3}"#.to_vec());

    let id = receipt.message_id.to_string();
    assert_eq!(outbox_status(&store, &id).await, "Published");

    let inbox = sqlx::query("SELECT status, status_flags FROM inbox WHERE message_id = ?")
        .bind(&id)
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(inbox.get::<String, _>("status"), "Completed");
    assert!(StatusFlags(inbox.get::<i64, _>("status_flags") as u32)
        .contains(StatusFlags::RECEPTOR_PROCESSED));

    let event = sqlx::query("SELECT stream_id, version FROM event_store")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(event.get::<String, _>("stream_id"), stream.to_string());
    assert_eq!(event.get::<i64, _>("version"), 1);
}

#[tokio::test]
async fn redelivered_envelopes_are_acknowledged_once() {
    let store = WeftStore::in_memory().await.unwrap();
    let transport = Arc::new(MemoryTransport::default());
    let runtime = WeftRuntime::new(test_config(), store.clone(), transport.clone())
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    runtime
        .receptors()
        .register("orders.placed", recording_receptor(seen.clone()));
    runtime.listen("orders-topic", InboundRoute::default()).unwrap();

    let envelope = Envelope::new(
        weft_types::MessageId::generate(),
        "orders.placed",
        vec![0x01],
    );

    // The broker delivers the same envelope twice.
    for _ in 0..2 {
        transport
            .publish(envelope.clone(), "orders-topic", CancellationToken::new())
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    runtime.run_cycle_once().await.unwrap();
    runtime.run_cycle_once().await.unwrap();

    // One row, one dispatch, despite two deliveries.
    assert_eq!(seen.lock().unwrap().len(), 1);
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM inbox")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(count.0, 1);
}

#[tokio::test]
async fn failing_pre_distribute_hook_fails_the_message() {
    let store = WeftStore::in_memory().await.unwrap();
    let transport = Arc::new(MemoryTransport::default());
    let runtime = WeftRuntime::new(test_config(), store.clone(), transport)
        .await
        .unwrap();

    runtime.lifecycle().register(
        "orders.placed",
        Stage::PreDistributeInline,
        Arc::new(|_ctx| Box::pin(async { anyhow::bail!("audit hook vetoed the publish") })),
    );
    runtime.policies().add_rule(
        "orders",
        |_ctx| true,
        PublishConfig::to_destination("orders-topic"),
    );

    let receipt = runtime
        .send_with_policy("orders.placed", vec![0x02], None, None)
        .unwrap();

    // Cycle 1 claims and hits the inline veto; cycle 2 records the failure.
    runtime.run_cycle_once().await.unwrap();
    runtime.run_cycle_once().await.unwrap();

    let row = sqlx::query(
        "SELECT status, attempts, error, scheduled_for FROM outbox WHERE message_id = ?",
    )
    .bind(receipt.message_id.to_string())
    .fetch_one(store.pool())
    .await
    .unwrap();
    // Unknown failures are transient: the row backs off as Pending.
    assert_eq!(row.get::<String, _>("status"), "Pending");
    assert_eq!(row.get::<i64, _>("attempts"), 1);
    assert!(row.get::<String, _>("error").contains("vetoed"));
    assert!(row.get::<Option<chrono::DateTime<chrono::Utc>>, _>("scheduled_for").is_some());
}

#[tokio::test]
async fn typed_payloads_round_trip_through_the_codec() {
    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct OrderPlaced {
        order: String,
        quantity: u32,
    }

    let store = WeftStore::in_memory().await.unwrap();
    let transport = Arc::new(MemoryTransport::default());
    let runtime = WeftRuntime::new(test_config(), store, transport)
        .await
        .unwrap();
    runtime.codecs().register::<OrderPlaced>("orders.placed");

    let decoded = Arc::new(Mutex::new(Vec::new()));
    let sink = decoded.clone();
    runtime.receptors().register(
        "orders.placed",
        Arc::new(move |payload, _ctx| {
            let sink = sink.clone();
            Box::pin(async move {
                let order: OrderPlaced =
                    weft_codec::decode_value(&payload, weft_codec::WireFormat::Binary)?;
                sink.lock().unwrap().push(order);
                Ok(weft_dispatch::ReceptorOutput::Void)
            })
        }),
    );
    runtime.policies().add_rule(
        "orders",
        |_ctx| true,
        PublishConfig::to_destination("orders-topic"),
    );
    runtime.listen("orders-topic", InboundRoute::default()).unwrap();

    let placed = OrderPlaced {
        order: "A-100".into(),
        quantity: 3,
    };
    let payload =
        weft_codec::encode_value(&placed, weft_codec::WireFormat::Binary).unwrap();
    runtime
        .send_with_policy("orders.placed", payload, None, None)
        .unwrap();

    runtime.run_cycle_once().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    runtime.run_cycle_once().await.unwrap();

    assert_eq!(decoded.lock().unwrap().as_slice(), &[placed]);
}

//──────────────────────────────────────────────────────────────────────────────
//  Background loops
//──────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn started_runtime_processes_and_stops_cleanly() {
    let store = WeftStore::in_memory().await.unwrap();
    let transport = Arc::new(MemoryTransport::default());
    let runtime = WeftRuntime::new(test_config(), store.clone(), transport)
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    runtime
        .receptors()
        .register("orders.placed", recording_receptor(seen.clone()));
    runtime.policies().add_rule(
        "orders",
        |_ctx| true,
        PublishConfig::to_destination("orders-topic").as_event(),
    );
    runtime.listen("orders-topic", InboundRoute::default()).unwrap();

    let applied = Arc::new(AtomicUsize::new(0));
    let counter = applied.clone();
    runtime.perspectives().register(Perspective {
        name: "order-count".into(),
        event_types: vec!["orders.placed".into()],
        apply: Arc::new(move |_record| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }),
        mode: CheckpointMode::Instant,
    });

    runtime.start().await.unwrap();
    runtime
        .send_with_policy("orders.placed", vec![0x03], Some(StreamId::generate()), None)
        .unwrap();

    // Give the polling loops a few cycles to push the message all the way
    // through publish, receive, dispatch, and perspective replay.
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert!(applied.load(Ordering::SeqCst) >= 1);
    assert!(store.checkpoints().load("order-count").await.unwrap() >= 1);

    runtime.stop().await.unwrap();

    // Graceful shutdown releases shared rows.
    let instances: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM service_instances")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(instances.0, 0);
    let partitions: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM partition_assignments")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(partitions.0, 0);
}
