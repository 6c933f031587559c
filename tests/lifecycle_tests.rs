//! Engine build, start, stop and health reporting.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use shardhold::engine::{
    DurableLog, Engine, EngineStatus, HealthReport, HealthSink, HealthState, InMemoryLog,
    LogResult, Murmur2Partitioner, Subscription,
};
use shardhold::error::EngineError;
use shardhold::server::HealthSource;
use shardhold::types::{Ack, CommittedRecord, EventEnvelope, NodeId, Offset, PartitionId, WriterFence};

fn log() -> Arc<InMemoryLog> {
    Arc::new(InMemoryLog::new(PARTITIONS))
}

// ============================================================================
// Build
// ============================================================================

#[test]
fn test_duplicate_engine_name_is_refused() {
    let name = unique_name("dup");
    let first = build_engine(log(), test_config(&name));

    let second = Engine::builder(Account, log())
        .config(test_config(&name))
        .build();
    match second {
        Err(EngineError::DuplicateEngine { name: taken }) => assert_eq!(taken, name),
        other => panic!("expected DuplicateEngine, got {:?}", other.map(|_| ())),
    }

    // Dropping the first engine frees the name.
    drop(first);
    assert!(
        Engine::builder(Account, log())
            .config(test_config(&name))
            .build()
            .is_ok()
    );
}

#[test]
fn test_invalid_config_is_refused() {
    let mut config = test_config(&unique_name("invalid"));
    config.pending_buffer_capacity = 0;
    config.topic = String::new();

    match Engine::builder(Account, log()).config(config).build() {
        Err(EngineError::Config(message)) => {
            assert!(message.contains("pending_buffer_capacity"));
            assert!(message.contains("topic"));
        }
        other => panic!("expected Config error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_partitioner_must_cover_every_partition() {
    let result = Engine::builder(Account, log())
        .config(test_config(&unique_name("partitioner")))
        .partitioner(Arc::new(Murmur2Partitioner::new(PARTITIONS + 1)))
        .build();
    assert!(matches!(result, Err(EngineError::Config(_))));
}

// ============================================================================
// Start / stop
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_submit_before_start_and_after_stop() {
    let engine = build_engine(log(), test_config(&unique_name("not-running")));
    assert_eq!(engine.status(), EngineStatus::Stopped);
    assert_eq!(
        engine_error(engine.submit("acct-1", AccountCommand::Deposit(1)).await),
        EngineError::NotRunning
    );
    assert!(matches!(engine.get_state("acct-1"), Err(EngineError::NotRunning)));

    engine.start().await.unwrap();
    assert!(engine.is_running());
    wait_serving(&engine, "acct-1").await;
    submit_ok(&engine, "acct-1", AccountCommand::Deposit(1)).await;

    engine.stop().await.unwrap();
    assert_eq!(engine.status(), EngineStatus::Stopped);
    assert_eq!(engine.active_actors(), 0);
    assert!(engine.ready_partitions().is_empty());
    assert_eq!(
        engine_error(engine.submit("acct-1", AccountCommand::Deposit(1)).await),
        EngineError::NotRunning
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_and_stop_are_idempotent() {
    let engine = build_engine(log(), test_config(&unique_name("idempotent")));

    engine.stop().await.unwrap();
    engine.start().await.unwrap();
    engine.start().await.unwrap();
    assert!(engine.is_running());

    engine.stop().await.unwrap();
    engine.stop().await.unwrap();
    assert_eq!(engine.status(), EngineStatus::Stopped);
}

/// In-memory log that takes a while to join a group.
struct SlowJoinLog {
    inner: InMemoryLog,
    join_delay: Duration,
}

#[async_trait]
impl DurableLog for SlowJoinLog {
    fn partition_count(&self) -> u32 {
        self.inner.partition_count()
    }

    async fn append(
        &self,
        partition: PartitionId,
        fence: WriterFence,
        envelope: EventEnvelope,
    ) -> LogResult<Ack> {
        self.inner.append(partition, fence, envelope).await
    }

    async fn read(
        &self,
        partition: PartitionId,
        from: Offset,
        max: usize,
    ) -> LogResult<Vec<CommittedRecord>> {
        self.inner.read(partition, from, max).await
    }

    async fn high_watermark(&self, partition: PartitionId) -> LogResult<Offset> {
        self.inner.high_watermark(partition).await
    }

    async fn subscribe(&self, topic: &str, group_id: &str, node: NodeId) -> LogResult<Subscription> {
        tokio::time::sleep(self.join_delay).await;
        self.inner.subscribe(topic, group_id, node).await
    }

    async fn unsubscribe(&self, group_id: &str, node: NodeId) -> LogResult<()> {
        self.inner.unsubscribe(group_id, node).await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_while_starting_returns_immediately() {
    let log = SlowJoinLog {
        inner: InMemoryLog::new(PARTITIONS),
        join_delay: Duration::from_millis(500),
    };
    let engine = Arc::new(build_engine(Arc::new(log), test_config(&unique_name("starting"))));

    let first = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.start().await })
    };
    assert!(wait_until(Duration::from_secs(1), || engine.status() == EngineStatus::Starting).await);

    let started = tokio::time::Instant::now();
    engine.start().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(engine.status(), EngineStatus::Starting);

    first.await.unwrap().unwrap();
    assert!(engine.is_running());
    engine.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_keeps_committed_state() {
    let engine = build_engine(log(), test_config(&unique_name("restart")));
    engine.start().await.unwrap();
    wait_serving(&engine, "acct-2").await;
    submit_ok(&engine, "acct-2", AccountCommand::Deposit(8)).await;

    engine.restart().await.unwrap();
    assert!(engine.is_running());
    wait_serving(&engine, "acct-2").await;
    assert_eq!(engine.get_state("acct-2").unwrap(), Some(8));
    assert_eq!(submit_ok(&engine, "acct-2", AccountCommand::Withdraw(3)).await, 5);

    engine.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_every_partition_becomes_ready_on_a_single_node() {
    let engine = build_engine(log(), test_config(&unique_name("all-ready")));
    engine.start().await.unwrap();

    // Regions start lazily on first use.
    for p in 0..PARTITIONS {
        let key = key_in(&engine, shardhold::types::PartitionId::new(p), "acct");
        wait_serving(&engine, &key).await;
        submit_ok(&engine, &key, AccountCommand::Deposit(1)).await;
    }
    assert_eq!(engine.ready_partitions().len(), PARTITIONS as usize);

    engine.stop().await.unwrap();
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_health_follows_lifecycle() {
    let engine = build_engine(log(), test_config(&unique_name("health")));

    let stopped = engine.health(Duration::from_secs(1)).await;
    assert_eq!(stopped.state, HealthState::Down);
    assert_eq!(stopped.status, EngineStatus::Stopped);
    assert!(stopped.components.is_empty());

    engine.start().await.unwrap();
    wait_serving(&engine, "acct-3").await;
    let running = engine.health_report().await;
    assert_eq!(running.state, HealthState::Up, "{}", running.to_json());
    let names: Vec<&str> = running
        .components
        .iter()
        .map(|c| c.component.as_str())
        .collect();
    assert_eq!(names, vec!["assignment_tracker", "state_store", "router"]);

    engine.stop().await.unwrap();
    assert_eq!(engine.health(Duration::from_secs(1)).await.state, HealthState::Down);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stale_engine_reports_degraded() {
    let log = InMemoryLog::new(PARTITIONS);
    let name = unique_name("degraded");
    let engine = build_engine(Arc::new(log.clone()), test_config(&name));
    engine.start().await.unwrap();
    wait_serving(&engine, "acct-4").await;

    log.revoke_membership(&format!("{}-group", name), shardhold::types::NodeId::new(0))
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || engine.is_stale()).await);

    let report = engine.health(Duration::from_secs(1)).await;
    assert_eq!(report.state, HealthState::Degraded);
    let tracker = report
        .components
        .iter()
        .find(|c| c.component == "assignment_tracker")
        .unwrap();
    assert_eq!(tracker.state, HealthState::Down);

    engine.stop().await.unwrap();
}

#[derive(Default)]
struct CollectingSink {
    reports: Mutex<Vec<HealthReport>>,
}

#[async_trait]
impl HealthSink for CollectingSink {
    async fn report(&self, report: HealthReport) {
        self.reports.lock().unwrap().push(report);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_health_sink_receives_periodic_reports() {
    let sink = Arc::new(CollectingSink::default());
    let mut config = test_config(&unique_name("sink"));
    config.health_report_interval = Duration::from_millis(50);
    let engine = Engine::builder(Account, log())
        .config(config)
        .health_sink(sink.clone())
        .build()
        .unwrap();

    engine.start().await.unwrap();
    let reported = wait_until(Duration::from_secs(2), || sink.reports.lock().unwrap().len() >= 2).await;
    assert!(reported);
    engine.stop().await.unwrap();

    // The reporter stops with the engine.
    let count = sink.reports.lock().unwrap().len();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.reports.lock().unwrap().len(), count);
    assert!(
        sink.reports
            .lock()
            .unwrap()
            .iter()
            .all(|r| r.engine == engine.name())
    );
}
