//! End-to-end batch-protocol scenarios against an in-memory database.

use chrono::{DateTime, Duration, Utc};
use sqlx::Row;

use weft_store::{CoordinatorConfig, WeftStore, WorkCoordinator};
use weft_types::{
    FailureReason, InstanceDescriptor, InstanceId, MessageId, NewInboxMessage, NewOutboxMessage,
    StatusFlags, StreamId, WorkBatchRequest, WorkCompletion, WorkFailure, WorkItemFlags,
};

//──────────────────────────────────────────────────────────────────────────────
//  Helpers
//──────────────────────────────────────────────────────────────────────────────

fn descriptor(instance_id: InstanceId) -> InstanceDescriptor {
    InstanceDescriptor {
        instance_id,
        service_name: "orders-svc".into(),
        host_name: "host-a".into(),
        process_id: 42,
        metadata: None,
    }
}

fn request(instance_id: InstanceId) -> WorkBatchRequest {
    WorkBatchRequest::empty(descriptor(instance_id))
}

fn new_outbox(stream_id: Option<StreamId>, is_event: bool) -> NewOutboxMessage {
    NewOutboxMessage {
        message_id: MessageId::generate(),
        destination: "t".into(),
        type_tag: "E".into(),
        payload: vec![0xAA],
        metadata: None,
        scope: None,
        stream_id,
        is_event,
        scheduled_for: None,
    }
}

fn new_inbox(stream_id: Option<StreamId>, is_event: bool) -> NewInboxMessage {
    NewInboxMessage {
        message_id: MessageId::generate(),
        handler_name: "orders-handler".into(),
        type_tag: "E".into(),
        payload: vec![0xBB],
        metadata: None,
        scope: None,
        stream_id,
        is_event,
    }
}

async fn setup() -> (WeftStore, WorkCoordinator) {
    let store = WeftStore::in_memory().await.unwrap();
    let coordinator = store.coordinator(CoordinatorConfig::default());
    (store, coordinator)
}

async fn outbox_column<T>(store: &WeftStore, message_id: MessageId, column: &str) -> T
where
    T: for<'r> sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite> + Send + Unpin,
{
    let row = sqlx::query(&format!("SELECT {column} FROM outbox WHERE message_id = ?"))
        .bind(message_id.to_string())
        .fetch_one(store.pool())
        .await
        .unwrap();
    row.get::<T, _>(0)
}

//──────────────────────────────────────────────────────────────────────────────
//  Scenario 1: empty cycle
//──────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn empty_cycle_heartbeats_and_returns_nothing() {
    let (store, coordinator) = setup().await;
    let instance = InstanceId::generate();

    let result = coordinator.process_work_batch(&request(instance)).await.unwrap();
    assert!(result.outbox_work.is_empty());
    assert!(result.inbox_work.is_empty());

    let row = sqlx::query("SELECT last_heartbeat_at FROM service_instances WHERE instance_id = ?")
        .bind(instance.to_string())
        .fetch_one(store.pool())
        .await
        .unwrap();
    let heartbeat: DateTime<Utc> = row.get(0);
    assert!(Utc::now().signed_duration_since(heartbeat).num_seconds() < 5);
}

//──────────────────────────────────────────────────────────────────────────────
//  Scenario 2: publish and complete
//──────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn publish_and_complete_appends_the_event() {
    let (store, coordinator) = setup().await;
    let instance = InstanceId::generate();
    let stream = StreamId::generate();

    let message = new_outbox(Some(stream), true);
    let message_id = message.message_id;
    let mut first = request(instance);
    first.new_outbox.push(message);

    let result = coordinator.process_work_batch(&first).await.unwrap();
    assert_eq!(result.outbox_work.len(), 1);
    assert!(result.outbox_work[0].flags.contains(WorkItemFlags::NEWLY_STORED));
    assert_eq!(result.outbox_work[0].message_id, message_id);

    let mut second = request(instance);
    second.outbox_completions.push(WorkCompletion {
        message_id,
        flags: StatusFlags::PUBLISHED,
    });
    coordinator.process_work_batch(&second).await.unwrap();

    let status: String = outbox_column(&store, message_id, "status").await;
    assert_eq!(status, "Published");
    let flags: i64 = outbox_column(&store, message_id, "status_flags").await;
    let flags = StatusFlags(flags as u32);
    assert!(flags.contains(StatusFlags::PUBLISHED));
    assert!(flags.contains(StatusFlags::EVENT_STORED));

    let event = sqlx::query("SELECT stream_id, version, event_id FROM event_store")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(event.get::<String, _>("stream_id"), stream.to_string());
    assert_eq!(event.get::<i64, _>("version"), 1);
    assert_eq!(event.get::<String, _>("event_id"), message_id.to_string());
}

//──────────────────────────────────────────────────────────────────────────────
//  Scenario 3: orphan recovery
//──────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn expired_leases_are_reclaimed() {
    let (store, coordinator) = setup().await;
    let dead = InstanceId::generate();
    let alive = InstanceId::generate();
    let expired = Utc::now() - Duration::minutes(10);

    for _ in 0..2 {
        sqlx::query(
            "INSERT INTO outbox (message_id, destination, type, payload, status, status_flags, \
             created_at, instance_id, lease_expiry) \
             VALUES (?, 't', 'E', x'00', 'Publishing', 1, ?, ?, ?)",
        )
        .bind(MessageId::generate().to_string())
        .bind(expired)
        .bind(dead.to_string())
        .bind(expired)
        .execute(store.pool())
        .await
        .unwrap();
    }

    let result = coordinator.process_work_batch(&request(alive)).await.unwrap();
    assert_eq!(result.outbox_work.len(), 2);
    for item in &result.outbox_work {
        assert!(item.flags.contains(WorkItemFlags::ORPHANED));
        let owner: String = outbox_column(&store, item.message_id, "instance_id").await;
        assert_eq!(owner, alive.to_string());
        let lease: DateTime<Utc> = outbox_column(&store, item.message_id, "lease_expiry").await;
        assert!(lease > Utc::now() + Duration::minutes(4));
    }
}

//──────────────────────────────────────────────────────────────────────────────
//  Scenario 4: version conflict handling
//──────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn completion_appends_after_an_existing_version() {
    let (store, coordinator) = setup().await;
    let instance = InstanceId::generate();
    let stream = StreamId::generate();

    // Stream already has version 1 from an earlier writer.
    sqlx::query(
        "INSERT INTO event_store (event_id, stream_id, version, type, payload, created_at) \
         VALUES (?, ?, 1, 'E', x'00', ?)",
    )
    .bind(MessageId::generate().to_string())
    .bind(stream.to_string())
    .bind(Utc::now())
    .execute(store.pool())
    .await
    .unwrap();

    let message = new_inbox(Some(stream), true);
    let message_id = message.message_id;
    let mut first = request(instance);
    first.new_inbox.push(message);
    let result = coordinator.process_work_batch(&first).await.unwrap();
    assert_eq!(result.inbox_work.len(), 1);

    let mut second = request(instance);
    second.inbox_completions.push(WorkCompletion {
        message_id,
        flags: StatusFlags::RECEPTOR_PROCESSED,
    });
    coordinator.process_work_batch(&second).await.unwrap();

    let row = sqlx::query("SELECT version FROM event_store WHERE event_id = ?")
        .bind(message_id.to_string())
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(row.get::<i64, _>("version"), 2);
}

//──────────────────────────────────────────────────────────────────────────────
//  Scenario 5: dedup
//──────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_inbox_stores_yield_no_new_work() {
    let (store, coordinator) = setup().await;
    let instance = InstanceId::generate();

    let message = new_inbox(None, false);
    let message_id = message.message_id;
    let mut call = request(instance);
    call.new_inbox.push(message);

    let first = coordinator.process_work_batch(&call).await.unwrap();
    assert_eq!(first.inbox_work.len(), 1);
    assert_eq!(first.inbox_work[0].message_id, message_id);

    let second = coordinator.process_work_batch(&call).await.unwrap();
    assert!(second.inbox_work.is_empty());

    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM inbox WHERE message_id = ?")
        .bind(message_id.to_string())
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(count.0, 1);
}

//──────────────────────────────────────────────────────────────────────────────
//  Scenario 6: stream ordering
//──────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn event_versions_follow_sequence_order_not_completion_order() {
    let (store, coordinator) = setup().await;
    let instance = InstanceId::generate();
    let stream = StreamId::generate();

    let mut ids = Vec::new();
    let mut first = request(instance);
    for _ in 0..3 {
        let message = new_outbox(Some(stream), true);
        ids.push(message.message_id);
        first.new_outbox.push(message);
    }
    coordinator.process_work_batch(&first).await.unwrap();

    // Complete all three in one batch, reported in reverse order.
    let mut second = request(instance);
    for id in ids.iter().rev() {
        second.outbox_completions.push(WorkCompletion {
            message_id: *id,
            flags: StatusFlags::PUBLISHED,
        });
    }
    coordinator.process_work_batch(&second).await.unwrap();

    // Versions 1..3 must follow the stored sequence order.
    for (index, id) in ids.iter().enumerate() {
        let row = sqlx::query("SELECT version FROM event_store WHERE event_id = ?")
            .bind(id.to_string())
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(row.get::<i64, _>("version"), index as i64 + 1);
    }
}

//──────────────────────────────────────────────────────────────────────────────
//  Universal invariants
//──────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn no_lease_overlap_between_instances() {
    let (_store, coordinator) = setup().await;
    let producer = InstanceId::generate();

    let mut seed = request(producer);
    for _ in 0..10 {
        seed.new_outbox.push(new_outbox(None, false));
    }
    let seeded = coordinator.process_work_batch(&seed).await.unwrap();
    assert_eq!(seeded.outbox_work.len(), 10);

    // Everything is leased to the producer; another instance gets nothing.
    let rival = InstanceId::generate();
    let result = coordinator.process_work_batch(&request(rival)).await.unwrap();
    assert!(result.outbox_work.is_empty());
}

#[tokio::test]
async fn partition_affinity_is_stable_per_stream() {
    let (_store, coordinator) = setup().await;
    let instance = InstanceId::generate();
    let stream = StreamId::generate();

    let mut call = request(instance);
    for _ in 0..3 {
        call.new_outbox.push(new_outbox(Some(stream), false));
    }
    let result = coordinator.process_work_batch(&call).await.unwrap();

    let partitions: Vec<Option<i64>> =
        result.outbox_work.iter().map(|i| i.partition_number).collect();
    assert_eq!(partitions.len(), 3);
    assert!(partitions[0].is_some());
    assert!(partitions.iter().all(|p| *p == partitions[0]));
}

#[tokio::test]
async fn transient_failure_backs_off_then_retries() {
    let (store, coordinator) = setup().await;
    let instance = InstanceId::generate();

    let message = new_outbox(None, false);
    let message_id = message.message_id;
    let mut first = request(instance);
    first.new_outbox.push(message);
    coordinator.process_work_batch(&first).await.unwrap();

    let mut second = request(instance);
    second.outbox_failures.push(WorkFailure {
        message_id,
        reached: StatusFlags::STORED,
        reason: FailureReason::Timeout,
        error: "publish timed out".into(),
    });
    let result = coordinator.process_work_batch(&second).await.unwrap();
    // The row is backing off; it must not come straight back.
    assert!(result.outbox_work.is_empty());

    let status: String = outbox_column(&store, message_id, "status").await;
    assert_eq!(status, "Pending");
    let attempts: i64 = outbox_column(&store, message_id, "attempts").await;
    assert_eq!(attempts, 1);
    let reason: i64 = outbox_column(&store, message_id, "failure_reason").await;
    assert_eq!(reason, FailureReason::Timeout.as_i32() as i64);
    let scheduled: DateTime<Utc> = outbox_column(&store, message_id, "scheduled_for").await;
    assert!(scheduled > Utc::now());
}

#[tokio::test]
async fn permanent_failure_stays_failed() {
    let (store, coordinator) = setup().await;
    let instance = InstanceId::generate();

    let message = new_inbox(None, false);
    let message_id = message.message_id;
    let mut first = request(instance);
    first.new_inbox.push(message);
    coordinator.process_work_batch(&first).await.unwrap();

    let mut second = request(instance);
    second.inbox_failures.push(WorkFailure {
        message_id,
        reached: StatusFlags::STORED,
        reason: FailureReason::ValidationFailed,
        error: "payload rejected".into(),
    });
    coordinator.process_work_batch(&second).await.unwrap();

    let row = sqlx::query("SELECT status, error, failure_reason FROM inbox WHERE message_id = ?")
        .bind(message_id.to_string())
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(row.get::<String, _>("status"), "Failed");
    assert_eq!(row.get::<String, _>("error"), "payload rejected");
    assert_eq!(
        row.get::<i64, _>("failure_reason"),
        FailureReason::ValidationFailed.as_i32() as i64
    );

    // Failed rows wait for an operator; they are not claimable.
    let result = coordinator.process_work_batch(&request(instance)).await.unwrap();
    assert!(result.inbox_work.is_empty());
}

#[tokio::test]
async fn unknown_completion_is_a_silent_noop() {
    let (_store, coordinator) = setup().await;
    let instance = InstanceId::generate();

    let mut call = request(instance);
    call.outbox_completions.push(WorkCompletion {
        message_id: MessageId::generate(),
        flags: StatusFlags::PUBLISHED,
    });
    call.inbox_failures.push(WorkFailure {
        message_id: MessageId::generate(),
        reached: StatusFlags::NONE,
        reason: FailureReason::Unknown,
        error: "never stored".into(),
    });

    let result = coordinator.process_work_batch(&call).await.unwrap();
    assert!(result.outbox_work.is_empty());
    assert!(result.inbox_work.is_empty());
}

#[tokio::test]
async fn completion_reported_twice_appends_once() {
    let (store, coordinator) = setup().await;
    let instance = InstanceId::generate();
    let stream = StreamId::generate();

    let message = new_outbox(Some(stream), true);
    let message_id = message.message_id;
    let mut first = request(instance);
    first.new_outbox.push(message);
    coordinator.process_work_batch(&first).await.unwrap();

    for _ in 0..2 {
        let mut call = request(instance);
        call.outbox_completions.push(WorkCompletion {
            message_id,
            flags: StatusFlags::PUBLISHED,
        });
        coordinator.process_work_batch(&call).await.unwrap();
    }

    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM event_store WHERE stream_id = ?")
        .bind(stream.to_string())
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(count.0, 1);
}

#[tokio::test]
async fn scheduled_messages_wait_for_their_time() {
    let (store, coordinator) = setup().await;
    let instance = InstanceId::generate();

    let mut message = new_outbox(None, false);
    message.scheduled_for = Some(Utc::now() + Duration::hours(1));
    let message_id = message.message_id;
    let mut call = request(instance);
    call.new_outbox.push(message);

    let result = coordinator.process_work_batch(&call).await.unwrap();
    // Stored, but not claimable until its time arrives.
    assert!(result.outbox_work.is_empty());
    let status: String = outbox_column(&store, message_id, "status").await;
    assert_eq!(status, "Pending");

    let result = coordinator.process_work_batch(&request(instance)).await.unwrap();
    assert!(result.outbox_work.is_empty());
}

#[tokio::test]
async fn batch_size_bounds_the_claim() {
    let (_store, coordinator) = setup().await;
    let instance = InstanceId::generate();

    let mut seed = request(instance);
    for _ in 0..120 {
        seed.new_outbox.push(new_outbox(None, false));
    }
    let result = coordinator.process_work_batch(&seed).await.unwrap();
    // Newly stored rows are all returned in the storing call...
    assert_eq!(result.outbox_work.len(), 120);

    // ...but a claim sweep over pending rows respects the batch size.
    let (_store2, coordinator2) = setup().await;
    let mut seed2 = request(instance);
    for _ in 0..120 {
        let mut m = new_outbox(None, false);
        // Scheduled in the past: stored-but-unclaimed on the first call.
        m.scheduled_for = Some(Utc::now() + Duration::hours(1));
        seed2.new_outbox.push(m);
    }
    coordinator2.process_work_batch(&seed2).await.unwrap();
    sqlx::query("UPDATE outbox SET scheduled_for = NULL")
        .execute(_store2.pool())
        .await
        .unwrap();
    let swept = coordinator2.process_work_batch(&request(instance)).await.unwrap();
    assert_eq!(swept.outbox_work.len(), 100);
}
