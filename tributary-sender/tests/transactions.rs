mod common;

use common::*;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use tributary_core::prelude::*;
use tributary_sender::{KafkaSender, TransactionState};
use tributary_testkit::{MockCluster, MockProducerFactory, RecordStatus};

const TRANSACTIONAL_ID: &str = "orders-tx";

fn transactional(factory: &MockProducerFactory) -> KafkaSender<i32, String> {
    sender(factory, options().with_transactional_id(TRANSACTIONAL_ID))
}

fn notifications() -> (Arc<Mutex<Vec<bool>>>, impl Fn(bool) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |committed| sink.lock().push(committed))
}

#[tokio::test]
async fn test_transactional_round_trip() {
    let cluster = cluster();
    let factory = MockProducerFactory::new(cluster.clone());
    let sender = transactional(&factory);
    let transactions = sender.transaction_manager().unwrap();
    let (seen, observer) = notifications();
    transactions.transaction_complete(observer);

    assert_ok!(transactions.begin().await);
    assert_eq!(transactions.state(), TransactionState::Active);

    let results: Vec<_> = sender.send_all(records(TOPIC, 3)).collect().await;
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.as_ref().unwrap().is_success()));
    assert!(cluster.committed_records(TOPIC).is_empty());

    let source = TopicPartition::new("source", 0);
    let offsets = TransactionOffsets::from([(source.clone(), OffsetAndMetadata::new(17))]);
    assert_ok!(transactions.send_offsets(offsets, "order-processor").await);
    assert_ok!(transactions.commit().await);

    assert_eq!(*seen.lock(), vec![true]);
    assert_eq!(transactions.state(), TransactionState::None);
    assert_eq!(cluster.committed_records(TOPIC).len(), 3);
    assert_eq!(cluster.committed_offset("order-processor", &source), Some(17));

    let producer = factory.last_producer().unwrap();
    let counters = producer.counters();
    assert_eq!(counters.inits.load(std::sync::atomic::Ordering::Acquire), 1);
    assert_eq!(counters.begins.load(std::sync::atomic::Ordering::Acquire), 1);
    assert_eq!(counters.send_offsets.load(std::sync::atomic::Ordering::Acquire), 1);
    assert_eq!(counters.commits.load(std::sync::atomic::Ordering::Acquire), 1);

    // No transaction is open any more, so further sends are rejected.
    let after: Vec<_> = sender.send_all(records(TOPIC, 1)).collect().await;
    assert!(after[0].as_ref().unwrap_err().is_illegal_state());
    assert_eq!(producer.send_count(), 3);
}

#[tokio::test]
async fn test_begin_twice_fails_and_keeps_state() {
    let factory = MockProducerFactory::new(cluster());
    let sender = transactional(&factory);
    let transactions = sender.transaction_manager().unwrap();

    assert_ok!(transactions.begin().await);
    let error = transactions.begin().await.unwrap_err();
    assert!(error.is_illegal_state());
    assert_eq!(transactions.state(), TransactionState::Active);
    assert_ok!(transactions.commit().await);
}

#[tokio::test]
async fn test_commit_and_abort_without_transaction_fail() {
    let factory = MockProducerFactory::new(cluster());
    let sender = transactional(&factory);
    let transactions = sender.transaction_manager().unwrap();
    let (seen, observer) = notifications();
    transactions.transaction_complete(observer);

    assert!(transactions.commit().await.unwrap_err().is_illegal_state());
    assert!(transactions.abort().await.unwrap_err().is_illegal_state());
    assert_eq!(transactions.state(), TransactionState::None);
    assert!(seen.lock().is_empty());
}

#[tokio::test]
async fn test_send_offsets_requires_active_transaction_unless_empty() {
    let factory = MockProducerFactory::new(cluster());
    let sender = transactional(&factory);
    let transactions = sender.transaction_manager().unwrap();

    assert_ok!(transactions.send_offsets(TransactionOffsets::new(), "group").await);

    let offsets =
        TransactionOffsets::from([(TopicPartition::new("source", 0), OffsetAndMetadata::new(1))]);
    let error = transactions.send_offsets(offsets, "group").await.unwrap_err();
    assert!(error.is_illegal_state());

    let producer = factory.last_producer().unwrap();
    assert_eq!(producer.counters().send_offsets.load(std::sync::atomic::Ordering::Acquire), 0);
}

#[tokio::test]
async fn test_abort_discards_records_and_notifies_failure() {
    let cluster = cluster();
    let factory = MockProducerFactory::new(cluster.clone());
    let sender = transactional(&factory);
    let transactions = sender.transaction_manager().unwrap();
    let (seen, observer) = notifications();
    transactions.transaction_complete(observer);

    assert_ok!(transactions.begin().await);
    let results: Vec<_> = sender.send_all(records(TOPIC, 4)).collect().await;
    assert_eq!(results.len(), 4);
    assert_ok!(transactions.abort().await);

    assert_eq!(*seen.lock(), vec![false]);
    assert!(cluster.committed_records(TOPIC).is_empty());
    assert_eq!(cluster.records_with_status(TOPIC, RecordStatus::Aborted).len(), 4);
}

#[tokio::test]
async fn test_last_registered_observer_wins() {
    let factory = MockProducerFactory::new(cluster());
    let sender = transactional(&factory);
    let transactions = sender.transaction_manager().unwrap();
    let (first, first_observer) = notifications();
    let (second, second_observer) = notifications();
    transactions.transaction_complete(first_observer).transaction_complete(second_observer);

    assert_ok!(transactions.begin().await);
    assert_ok!(transactions.commit().await);
    assert_ok!(transactions.begin().await);
    assert_ok!(transactions.abort().await);

    assert!(first.lock().is_empty());
    assert_eq!(*second.lock(), vec![true, false]);
}

#[tokio::test]
async fn test_failed_commit_leaves_transaction_open_for_abort() {
    let factory = MockProducerFactory::new(cluster());
    let sender = transactional(&factory);
    let transactions = sender.transaction_manager().unwrap();
    let (seen, observer) = notifications();
    transactions.transaction_complete(observer);

    assert_ok!(transactions.begin().await);
    factory.last_producer().unwrap().fail_next_commit(Error::Broker {
        message: "coordinator moved".to_string(),
        retriable: true,
    });

    assert_err!(transactions.commit().await);
    assert_eq!(transactions.state(), TransactionState::Active);
    assert_ok!(transactions.abort().await);
    assert_eq!(*seen.lock(), vec![false]);
}

#[tokio::test]
async fn test_send_transactionally_commits_on_success() {
    let cluster = cluster();
    let factory = MockProducerFactory::new(cluster.clone());
    let sender = transactional(&factory);

    let results = sender
        .send_transactionally(futures::stream::iter(records(TOPIC, 5)))
        .await
        .unwrap();
    assert_eq!(results.len(), 5);
    assert_eq!(cluster.committed_records(TOPIC).len(), 5);
    assert_eq!(sender.transaction_manager().unwrap().state(), TransactionState::None);
}

#[tokio::test]
async fn test_send_transactionally_aborts_on_failure() {
    let cluster = cluster();
    let factory = MockProducerFactory::new(cluster.clone());
    let sender = transactional(&factory);

    let mut input = records(TOPIC, 3);
    input.push(record("missing", 3));
    let error = sender
        .send_transactionally(futures::stream::iter(input))
        .await
        .unwrap_err();

    assert!(matches!(error, Error::InvalidTopic { .. }));
    assert!(cluster.committed_records(TOPIC).is_empty());
    let producer = factory.last_producer().unwrap();
    assert_eq!(producer.counters().aborts.load(std::sync::atomic::Ordering::Acquire), 1);
}

#[tokio::test]
async fn test_non_transactional_sender_has_no_transactions() {
    let factory = MockProducerFactory::new(MockCluster::new());
    let sender = sender(&factory, options());
    assert!(sender.transaction_manager().unwrap_err().is_illegal_state());
    assert!(sender
        .send_transactionally(futures::stream::iter(records(TOPIC, 1)))
        .await
        .unwrap_err()
        .is_illegal_state());
    assert_eq!(factory.created(), 0);
}

#[tokio::test]
async fn test_empty_transactional_id_is_not_transactional() {
    let factory = MockProducerFactory::new(cluster());
    let sender = sender(&factory, options().with_transactional_id(""));
    assert!(!sender.options().is_transactional());
    assert!(sender.transaction_manager().is_err());
}

#[tokio::test]
async fn test_transaction_manager_scheduler_runs_follow_up_work() {
    let factory = MockProducerFactory::new(cluster());
    let sender = transactional(&factory);
    let transactions = sender.transaction_manager().unwrap();

    let follow_up = transactions.scheduler().spawn(async { 40 + 2 });
    assert_eq!(follow_up.await.unwrap(), 42);
    assert_eq!(transactions.transactional_id(), TRANSACTIONAL_ID);
}

async fn dispatched(factory: &MockProducerFactory, count: usize) -> bool {
    eventually(Duration::from_secs(2), || {
        factory.last_producer().is_some_and(|producer| producer.send_count() == count)
    })
    .await
}

#[tokio::test]
async fn test_commit_resolves_unacknowledged_sends_first() {
    let cluster = cluster();
    let factory =
        MockProducerFactory::new(cluster.clone()).with_send_delay(Duration::from_millis(100));
    let sender = transactional(&factory);
    let transactions = sender.transaction_manager().unwrap();
    let (seen, observer) = notifications();
    transactions.transaction_complete(observer);

    assert_ok!(transactions.begin().await);
    let results = sender.send_all(records(TOPIC, 3));
    assert!(dispatched(&factory, 3).await);

    assert_ok!(transactions.commit().await);
    assert_eq!(sender.in_flight(), 0);
    assert_eq!(*seen.lock(), vec![true]);
    assert_eq!(cluster.committed_records(TOPIC).len(), 3);
    assert!(cluster.records_with_status(TOPIC, RecordStatus::Pending).is_empty());

    let results: Vec<_> = results.collect().await;
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.as_ref().unwrap().is_success()));
}

#[tokio::test]
async fn test_abort_resolves_unacknowledged_sends_first() {
    let cluster = cluster();
    let factory =
        MockProducerFactory::new(cluster.clone()).with_send_delay(Duration::from_millis(100));
    let sender = transactional(&factory);
    let transactions = sender.transaction_manager().unwrap();

    assert_ok!(transactions.begin().await);
    let results = sender.send_all(records(TOPIC, 3));
    assert!(dispatched(&factory, 3).await);

    assert_ok!(transactions.abort().await);
    assert_eq!(sender.in_flight(), 0);
    assert!(cluster.committed_records(TOPIC).is_empty());
    assert_eq!(cluster.records_with_status(TOPIC, RecordStatus::Aborted).len(), 3);
    assert!(cluster.records_with_status(TOPIC, RecordStatus::Pending).is_empty());

    let results: Vec<_> = results.collect().await;
    assert_eq!(results.len(), 3);
}

#[tokio::test]
async fn test_fatal_send_error_aborts_open_transaction() {
    let cluster = cluster();
    let factory = MockProducerFactory::new(cluster.clone());
    let sender = transactional(&factory);
    let transactions = sender.transaction_manager().unwrap();
    let (seen, observer) = notifications();
    transactions.transaction_complete(observer);

    assert_ok!(transactions.begin().await);
    cluster.fail_authentication(true);
    let results: Vec<_> = sender.send_all(records(TOPIC, 2)).collect().await;

    assert!(results.last().unwrap().as_ref().unwrap_err().is_authentication());
    assert_eq!(transactions.state(), TransactionState::None);
    assert_eq!(*seen.lock(), vec![false]);
    let producer = factory.last_producer().unwrap();
    assert_eq!(producer.counters().aborts.load(std::sync::atomic::Ordering::Acquire), 1);

    // The session stays unusable for new transactions.
    cluster.fail_authentication(false);
    assert!(transactions.begin().await.unwrap_err().is_authentication());
    assert!(transactions.commit().await.unwrap_err().is_illegal_state());
}
