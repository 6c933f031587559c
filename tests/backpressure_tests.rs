//! Requests arriving while a partition region is still starting.
//!
//! Catch-up of the state store slice is slowed down so the region stays in
//! its starting state long enough to fill the pending request buffer.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use shardhold::engine::{Engine, InMemoryLog, OverflowPolicy};
use shardhold::error::{EngineError, TimeoutKind};
use shardhold::types::{AggregateKey, Sequence};

async fn slow_engine(
    prefix: &str,
    capacity: usize,
    policy: OverflowPolicy,
    delay: Duration,
) -> (SlowCatchUpLog, Engine<Account>) {
    let log = SlowCatchUpLog::new(InMemoryLog::new(PARTITIONS), delay);
    let mut config = test_config(&unique_name(prefix));
    config.pending_buffer_capacity = capacity;
    config.overflow_policy = policy;
    let engine = build_engine(Arc::new(log.clone()), config);
    engine.start().await.unwrap();
    (log, engine)
}

/// Wait until the slice for `key` exists, ready or not.
async fn wait_assigned(engine: &Engine<Account>, key: &str) {
    let assigned = wait_until(Duration::from_secs(2), || {
        !matches!(engine.get_state(key), Err(EngineError::NotOwner { .. }))
    })
    .await;
    assert!(assigned, "partition of {} was never assigned", key);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_buffered_requests_run_in_arrival_order() {
    let (_log, engine) = slow_engine(
        "buffered",
        16,
        OverflowPolicy::Reject,
        Duration::from_millis(200),
    )
    .await;
    wait_assigned(&engine, "acct-1").await;
    assert!(matches!(
        engine.get_state("acct-1"),
        Err(EngineError::NotReady { .. })
    ));

    let (a, b, c) = tokio::join!(
        engine.submit("acct-1", AccountCommand::Deposit(10)),
        engine.submit("acct-1", AccountCommand::Withdraw(4)),
        engine.submit("acct-1", AccountCommand::Deposit(1)),
    );
    let a = a.unwrap();
    let b = b.unwrap();
    let c = c.unwrap();
    assert_eq!((a.state, a.sequence), (10, Sequence::new(1)));
    assert_eq!((b.state, b.sequence), (6, Sequence::new(2)));
    assert_eq!((c.state, c.sequence), (7, Sequence::new(3)));

    engine.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_full_buffer_rejects_newest() {
    let (_log, engine) = slow_engine(
        "reject",
        1,
        OverflowPolicy::Reject,
        Duration::from_millis(300),
    )
    .await;
    wait_assigned(&engine, "acct-2").await;
    let partition = engine.partition_of(&AggregateKey::from("acct-2"));

    let (first, second) = tokio::join!(
        engine.submit("acct-2", AccountCommand::Deposit(1)),
        engine.submit("acct-2", AccountCommand::Deposit(2)),
    );
    assert_eq!(first.unwrap().state, 1);
    let error = engine_error(second);
    assert_eq!(
        error,
        EngineError::BufferOverflow {
            partition,
            capacity: 1,
        }
    );
    assert!(error.is_routing_error());

    engine.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_full_buffer_drops_oldest() {
    let (_log, engine) = slow_engine(
        "drop-oldest",
        1,
        OverflowPolicy::DropOldest,
        Duration::from_millis(300),
    )
    .await;
    wait_assigned(&engine, "acct-3").await;

    let (first, second) = tokio::join!(
        engine.submit("acct-3", AccountCommand::Deposit(1)),
        engine.submit("acct-3", AccountCommand::Deposit(2)),
    );
    assert!(matches!(
        engine_error(first),
        EngineError::BufferOverflow { capacity: 1, .. }
    ));
    assert_eq!(second.unwrap().state, 2);

    engine.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_region_start_timeout_fails_pending_requests() {
    let log = SlowCatchUpLog::new(InMemoryLog::new(PARTITIONS), Duration::from_millis(500));
    let mut config = test_config(&unique_name("start-timeout"));
    config.region_start_timeout = Duration::from_millis(100);
    let engine = build_engine(Arc::new(log.clone()), config);
    engine.start().await.unwrap();
    wait_assigned(&engine, "acct-4").await;

    let error = engine_error(engine.submit("acct-4", AccountCommand::Deposit(1)).await);
    assert_eq!(
        error,
        EngineError::Timeout {
            operation: TimeoutKind::RegionStart,
            after: Duration::from_millis(100),
        }
    );

    // The slot was cleared; once the slice has caught up the key is served.
    log.set_catch_up_delay(Duration::ZERO);
    wait_serving(&engine, "acct-4").await;
    assert_eq!(submit_ok(&engine, "acct-4", AccountCommand::Deposit(2)).await, 2);

    engine.stop().await.unwrap();
}
