//! End-to-end scenarios over the in-memory backend, exercising the public API
//! the way a consuming application would.

use std::sync::Arc;
use std::time::Duration;

use relay_streams::{
    InMemoryLog, MessageId, StartPosition, StreamConfig, StreamEngine, StreamRole,
};

fn order(n: u32) -> Vec<(String, String)> {
    vec![
        ("kind".to_string(), "order".to_string()),
        ("n".to_string(), n.to_string()),
    ]
}

fn engine() -> StreamEngine {
    StreamEngine::new(Arc::new(InMemoryLog::new()))
}

fn group_config(stream: &str, app: &str) -> StreamConfig {
    StreamConfig::new(stream, app).with_role(StreamRole::ProducerAndConsumerGroup)
}

/// Open a group member and drain the bootstrap entry the engine appended when
/// it created the stream key, so tests can count their own messages.
async fn drained_member(
    engine: &StreamEngine,
    config: StreamConfig,
) -> relay_streams::StreamHandle {
    let mut handle = engine.open(config).await.unwrap();
    for entry in handle.read_group(16).await.unwrap() {
        handle.acknowledge(entry.id).await.unwrap();
    }
    handle
}

#[tokio::test]
async fn produce_consume_acknowledge_lifecycle() {
    let engine = engine();
    let mut handle = drained_member(&engine, group_config("orders", "billing")).await;

    for n in 0..8 {
        handle.send(&order(n)).await.unwrap();
    }
    assert_eq!(handle.messages_sent(), 8);

    let delivered = handle.read_group(20).await.unwrap();
    assert_eq!(delivered.len(), 8);
    assert_eq!(handle.pending_count().await.unwrap(), 8);

    for entry in &delivered {
        handle.add_pending_ack(entry.id).await.unwrap();
    }
    // Default threshold is 20, so nothing flushed on its own.
    assert_eq!(handle.pending_ack_count(), 8);

    let acknowledged = handle.flush_pending_acks().await.unwrap();
    assert_eq!(acknowledged, 8);
    assert_eq!(handle.pending_ack_count(), 0);
    assert_eq!(handle.pending_count().await.unwrap(), 0);

    let page = handle.claim_pending(20).await.unwrap();
    assert!(page.entries.is_empty());

    handle.close(false).await.unwrap();
}

#[tokio::test]
async fn acknowledgments_flush_automatically_at_the_threshold() {
    let engine = engine();
    let mut handle = drained_member(
        &engine,
        group_config("orders", "billing").with_max_pending_acks(3),
    )
    .await;

    for n in 0..3 {
        handle.send(&order(n)).await.unwrap();
    }
    let delivered = handle.read_group(10).await.unwrap();
    for entry in &delivered {
        handle.add_pending_ack(entry.id).await.unwrap();
    }

    assert_eq!(handle.pending_ack_count(), 0);
    assert_eq!(handle.ack_flush_count(), 1);
    assert_eq!(handle.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn crashed_consumer_messages_are_claimed_by_a_peer() {
    let engine = engine();
    let mut victim = drained_member(
        &engine,
        group_config("orders", "billing").with_claim_older_than(Duration::ZERO),
    )
    .await;
    for n in 0..5 {
        victim.send(&order(n)).await.unwrap();
    }
    // The victim reads but never acknowledges.
    assert_eq!(victim.read_group(10).await.unwrap().len(), 5);

    let mut rescuer = engine
        .open(group_config("orders", "billing").with_claim_older_than(Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(rescuer.application_id(), 2);

    // Claiming moves ownership without changing the group-wide pending count.
    let page = rescuer.claim_pending(10).await.unwrap();
    assert_eq!(page.entries.len(), 5);
    assert!(!page.has_more());
    assert_eq!(rescuer.pending_count().await.unwrap(), 5);

    for entry in &page.entries {
        rescuer.acknowledge(entry.id).await.unwrap();
    }
    assert_eq!(rescuer.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn claiming_pages_through_a_large_pending_list() {
    let engine = engine();
    let mut victim = drained_member(
        &engine,
        group_config("orders", "billing").with_claim_older_than(Duration::ZERO),
    )
    .await;
    for n in 0..9 {
        victim.send(&order(n)).await.unwrap();
    }
    victim.read_group(20).await.unwrap();

    let mut rescuer = engine
        .open(group_config("orders", "billing").with_claim_older_than(Duration::ZERO))
        .await
        .unwrap();

    let mut claimed = Vec::new();
    let mut cursor = MessageId::BEGINNING;
    loop {
        let page = rescuer.claim_page(4, cursor).await.unwrap();
        claimed.extend(page.entries.iter().map(|e| e.id));
        if !page.has_more() {
            break;
        }
        cursor = page.next_cursor;
    }
    assert_eq!(claimed.len(), 9);
    let mut sorted = claimed.clone();
    sorted.sort();
    assert_eq!(claimed, sorted, "claims arrive in id order");
}

#[tokio::test]
async fn own_pending_entries_survive_a_simulated_restart() {
    let engine = engine();
    let mut member = drained_member(&engine, group_config("orders", "billing")).await;
    for n in 0..4 {
        member.send(&order(n)).await.unwrap();
    }
    let first_delivery: Vec<MessageId> = member
        .read_group(10)
        .await
        .unwrap()
        .iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(first_delivery.len(), 4);

    // The "restarted" consumer replays its own pending list instead of
    // receiving new deliveries.
    let replayed: Vec<MessageId> = member
        .read_own_pending(10)
        .await
        .unwrap()
        .iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(replayed, first_delivery);
}

#[tokio::test]
async fn trim_respects_the_slowest_group() {
    let engine = engine();
    let mut fast = drained_member(&engine, group_config("orders", "billing")).await;
    // A second group that never reads pins the watermark at the start.
    let _slow = engine
        .open(
            StreamConfig::new("orders", "audit").with_role(StreamRole::ConsumerGroupOnly),
        )
        .await
        .unwrap();

    for n in 0..3 {
        fast.send(&order(n)).await.unwrap();
    }
    for entry in fast.read_group(10).await.unwrap() {
        fast.acknowledge(entry.id).await.unwrap();
    }

    let removed = fast.trim_fully_processed(false).await.unwrap();
    assert_eq!(removed, 0, "silent group blocks trimming");

    let vitals = fast.vitals().await.unwrap();
    assert_eq!(vitals.first_fully_unprocessed_id, MessageId::BEGINNING);
    assert_eq!(vitals.group_count(), 2);
}

#[tokio::test]
async fn trim_removes_messages_every_group_has_seen() {
    let engine = engine();
    let mut member = drained_member(&engine, group_config("orders", "billing")).await;
    for n in 0..3 {
        member.send(&order(n)).await.unwrap();
    }
    for entry in member.read_group(10).await.unwrap() {
        member.acknowledge(entry.id).await.unwrap();
    }

    let before = member.vitals().await.unwrap();
    // Bootstrap entry plus three messages.
    assert_eq!(before.message_count, 4);

    // Everything strictly below the last delivered id goes.
    let removed = member.trim_fully_processed(false).await.unwrap();
    assert_eq!(removed, 3);

    let after = member.vitals().await.unwrap();
    assert_eq!(after.message_count, 1);
    assert_eq!(after.oldest_message_id, after.first_fully_unprocessed_id);
}

#[tokio::test]
async fn consumer_ids_are_reused_after_a_close() {
    let engine = engine();
    let first = engine.open(group_config("orders", "billing")).await.unwrap();
    let mut second = engine.open(group_config("orders", "billing")).await.unwrap();
    let third = engine.open(group_config("orders", "billing")).await.unwrap();

    assert_eq!(first.application_id(), 1);
    assert_eq!(second.application_id(), 2);
    assert_eq!(third.application_id(), 3);

    second.close(false).await.unwrap();
    let replacement = engine.open(group_config("orders", "billing")).await.unwrap();
    assert_eq!(replacement.application_id(), 2);

    let active = engine.active_streams().await;
    assert_eq!(active.len(), 3);
    assert!(active.iter().all(|i| i.stream_name == "orders"));
}

#[tokio::test]
async fn simple_consumers_do_not_touch_group_state() {
    let engine = engine();
    let mut producer = engine
        .open(StreamConfig::new("orders", "producer").with_role(StreamRole::ProducerOnly))
        .await
        .unwrap();
    for n in 0..3 {
        producer.send(&order(n)).await.unwrap();
    }

    let mut reader = engine
        .open(
            StreamConfig::new("orders", "reader")
                .with_role(StreamRole::SimpleConsumerOnly)
                .with_start(StartPosition::Beginning),
        )
        .await
        .unwrap();

    // Bootstrap entry plus three messages, read in two batches through the
    // session cursor.
    let first = reader.read(2).await.unwrap();
    assert_eq!(first.len(), 2);
    let rest = reader.read(10).await.unwrap();
    assert_eq!(rest.len(), 2);
    assert!(reader.read(10).await.unwrap().is_empty());

    let vitals = reader.vitals().await.unwrap();
    assert_eq!(vitals.group_count(), 0, "simple reads register no group");
}

#[tokio::test]
async fn vitals_reflect_group_progress() {
    let engine = engine();
    let mut member = drained_member(&engine, group_config("orders", "billing")).await;
    for n in 0..6 {
        member.send(&order(n)).await.unwrap();
    }
    member.read_group(3).await.unwrap();

    let vitals = member.vitals().await.unwrap();
    assert!(vitals.exists);
    assert_eq!(vitals.message_count, 7);
    let group = vitals.group("billing").unwrap();
    assert_eq!(group.pending_count, 3);
    assert!(vitals.size_bytes > 0);
    assert!(vitals.first_fully_unprocessed_id > MessageId::BEGINNING);
}
