//! Shared fixtures for the integration tests.
//!
//! An account aggregate, engine builders over the in-memory log, and a log
//! wrapper whose catch-up can be slowed down or made to fail.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shardhold::engine::{
    Aggregate, DurableLog, Engine, EngineConfig, InMemoryLog, LogError, LogResult, Subscription,
};
use shardhold::error::{EngineError, SubmitError};
use shardhold::types::{
    Ack, AggregateKey, CommittedRecord, EventEnvelope, NodeId, Offset, PartitionId, WriterFence,
};

pub const PARTITIONS: u32 = 4;

// ============================================================================
// Account aggregate
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountEvent {
    Deposited(u64),
    Withdrawn(u64),
}

#[derive(Debug, Clone)]
pub enum AccountCommand {
    Deposit(u64),
    Withdraw(u64),
    Noop,
}

#[derive(Debug, thiserror::Error)]
#[error("insufficient funds: balance {balance}, requested {requested}")]
pub struct InsufficientFunds {
    pub balance: u64,
    pub requested: u64,
}

pub struct Account;

impl Aggregate for Account {
    type State = u64;
    type Command = AccountCommand;
    type Event = AccountEvent;
    type Error = InsufficientFunds;

    fn initial_state(&self) -> u64 {
        0
    }

    fn process_command(
        &self,
        balance: &u64,
        command: AccountCommand,
    ) -> Result<Vec<AccountEvent>, InsufficientFunds> {
        match command {
            AccountCommand::Deposit(amount) => Ok(vec![AccountEvent::Deposited(amount)]),
            AccountCommand::Withdraw(amount) if amount > *balance => Err(InsufficientFunds {
                balance: *balance,
                requested: amount,
            }),
            AccountCommand::Withdraw(amount) => Ok(vec![AccountEvent::Withdrawn(amount)]),
            AccountCommand::Noop => Ok(vec![]),
        }
    }

    fn apply_event(&self, balance: u64, event: &AccountEvent) -> u64 {
        match event {
            AccountEvent::Deposited(amount) => balance + amount,
            AccountEvent::Withdrawn(amount) => balance - amount,
        }
    }
}

// ============================================================================
// Engine helpers
// ============================================================================

static NEXT_ENGINE: AtomicUsize = AtomicUsize::new(0);

/// Engine names are process-wide, so every test engine gets its own.
pub fn unique_name(prefix: &str) -> String {
    format!("{}-{}", prefix, NEXT_ENGINE.fetch_add(1, Ordering::SeqCst))
}

/// Config with short timeouts for a single node `0`.
pub fn test_config(name: &str) -> EngineConfig {
    EngineConfig {
        engine_name: name.to_string(),
        node_id: NodeId::new(0),
        group_id: format!("{}-group", name),
        idle_timeout: Duration::from_secs(60),
        spawn_timeout: Duration::from_secs(2),
        route_timeout: Duration::from_secs(5),
        region_start_timeout: Duration::from_secs(3),
        append_timeout: Duration::from_secs(2),
        catch_up_timeout: Duration::from_secs(3),
        shutdown_timeout: Duration::from_secs(3),
        ..EngineConfig::default()
    }
}

pub fn build_engine(log: Arc<dyn DurableLog>, config: EngineConfig) -> Engine<Account> {
    Engine::builder(Account, log)
        .config(config)
        .build()
        .expect("engine should build")
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the state store slice serving `key` answers lookups.
pub async fn wait_serving(engine: &Engine<Account>, key: &str) {
    let serving = wait_until(Duration::from_secs(5), || engine.get_state(key).is_ok()).await;
    assert!(serving, "partition of {} never became ready", key);
}

/// First key `"{prefix}-{i}"` that lands on `partition`.
pub fn key_in(engine: &Engine<Account>, partition: PartitionId, prefix: &str) -> String {
    (0..10_000)
        .map(|i| format!("{}-{}", prefix, i))
        .find(|key| engine.partition_of(&AggregateKey::from(key.as_str())) == partition)
        .expect("some key maps to every partition")
}

/// Submit and return the resulting balance.
pub async fn submit_ok(engine: &Engine<Account>, key: &str, command: AccountCommand) -> u64 {
    match engine.submit(key, command).await {
        Ok(reply) => reply.state,
        Err(e) => panic!("submit to {} failed: {}", key, e),
    }
}

/// The engine error behind a failed submit.
pub fn engine_error<T>(result: Result<T, SubmitError<InsufficientFunds>>) -> EngineError {
    match result {
        Err(SubmitError::Engine(e)) => e,
        Err(SubmitError::Rejected(e)) => panic!("unexpected rejection: {}", e),
        Ok(_) => panic!("expected an engine error"),
    }
}

// ============================================================================
// Slow catch-up log
// ============================================================================

/// Delegates to an [`InMemoryLog`], sleeping before every catch-up call.
///
/// While `set_catch_up_failing(true)` is in effect, catch-up calls fail with
/// a permanent error instead.
#[derive(Debug, Clone)]
pub struct SlowCatchUpLog {
    pub inner: InMemoryLog,
    catch_up_delay_ms: Arc<AtomicU64>,
    catch_up_failing: Arc<AtomicBool>,
}

impl SlowCatchUpLog {
    pub fn new(inner: InMemoryLog, catch_up_delay: Duration) -> Self {
        Self {
            inner,
            catch_up_delay_ms: Arc::new(AtomicU64::new(catch_up_delay.as_millis() as u64)),
            catch_up_failing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_catch_up_failing(&self, failing: bool) {
        self.catch_up_failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_catch_up_delay(&self, delay: Duration) {
        self.catch_up_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn pause(&self) -> LogResult<()> {
        let delay = self.catch_up_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.catch_up_failing.load(Ordering::SeqCst) {
            return Err(LogError::Unauthorized("catch-up reads disabled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableLog for SlowCatchUpLog {
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
        self.pause().await?;
        self.inner.read(partition, from, max).await
    }

    async fn high_watermark(&self, partition: PartitionId) -> LogResult<Offset> {
        self.pause().await?;
        self.inner.high_watermark(partition).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        node: NodeId,
    ) -> LogResult<Subscription> {
        self.inner.subscribe(topic, group_id, node).await
    }

    async fn unsubscribe(&self, group_id: &str, node: NodeId) -> LogResult<()> {
        self.inner.unsubscribe(group_id, node).await
    }
}
