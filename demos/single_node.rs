//! Single-node bank ledger over the in-memory log.
//!
//! Starts an engine owning every partition, serves `/health`, `/ready` and
//! `/metrics` on port 8080, and drives a few concurrent accounts. Stops on
//! Ctrl-C.
//!
//! **WARNING**: the in-memory log keeps everything in process; state is lost
//! on exit.
//!
//! Run with: cargo run --example single_node
//!
//! Then: curl localhost:8080/health

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shardhold::engine::TracingHealthSink;
use shardhold::prelude::*;
use shardhold::server::{HealthServer, HealthSource};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
enum LedgerEvent {
    Credited(u64),
    Debited(u64),
}

#[derive(Debug)]
enum LedgerCommand {
    Credit(u64),
    Debit(u64),
}

#[derive(Debug, thiserror::Error)]
#[error("overdraft: balance {balance}, debit {amount}")]
struct Overdraft {
    balance: u64,
    amount: u64,
}

struct Ledger;

impl Aggregate for Ledger {
    type State = u64;
    type Command = LedgerCommand;
    type Event = LedgerEvent;
    type Error = Overdraft;

    fn initial_state(&self) -> u64 {
        0
    }

    fn process_command(&self, balance: &u64, command: LedgerCommand) -> Result<Vec<LedgerEvent>, Overdraft> {
        match command {
            LedgerCommand::Credit(amount) => Ok(vec![LedgerEvent::Credited(amount)]),
            LedgerCommand::Debit(amount) if amount > *balance => Err(Overdraft {
                balance: *balance,
                amount,
            }),
            LedgerCommand::Debit(amount) => Ok(vec![LedgerEvent::Debited(amount)]),
        }
    }

    fn apply_event(&self, balance: u64, event: &LedgerEvent) -> u64 {
        match event {
            LedgerEvent::Credited(amount) => balance + amount,
            LedgerEvent::Debited(amount) => balance - amount,
        }
    }
}

/// Retry routing errors while the first assignment and regions come up.
async fn submit(
    engine: &Engine<Ledger>,
    key: &str,
    command: impl Fn() -> LedgerCommand,
) -> Result<u64, SubmitError<Overdraft>> {
    let mut attempts = 0;
    loop {
        match engine.submit(key, command()).await {
            Err(SubmitError::Engine(e)) if e.is_routing_error() && attempts < 50 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            other => return other.map(|reply| reply.state),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = telemetry::init_logging(telemetry::LogFormat::from_env());

    let engine = Arc::new(
        Engine::builder(Ledger, Arc::new(InMemoryLog::new(8)))
            .config(EngineConfig::from_env()?)
            .health_sink(Arc::new(TracingHealthSink))
            .build()?,
    );
    engine.start().await?;

    let health = Arc::new(HealthServer::new("0.0.0.0:8080", engine.clone() as Arc<dyn HealthSource>).await?);
    let serving = health.clone();
    let health_task = tokio::spawn(async move { serving.run().await });

    let mut workers = Vec::new();
    for account in 0..16 {
        let engine = Arc::clone(&engine);
        workers.push(tokio::spawn(async move {
            let key = format!("account-{}", account);
            for round in 0..10u64 {
                let amount = round * 10 + account;
                if let Err(e) = submit(&engine, &key, || LedgerCommand::Credit(amount)).await {
                    warn!(key = %key, error = %e, "Credit failed");
                }
                match submit(&engine, &key, || LedgerCommand::Debit(amount * 2)).await {
                    Ok(balance) => info!(key = %key, balance, "Debited"),
                    Err(SubmitError::Rejected(e)) => info!(key = %key, reason = %e, "Debit refused"),
                    Err(e) => warn!(key = %key, error = %e, "Debit failed"),
                }
            }
        }));
    }
    for worker in workers {
        worker.await?;
    }

    info!(
        actors = engine.active_actors(),
        partitions = ?engine.ready_partitions(),
        "Ledger populated, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c().await?;

    health.shutdown();
    let _ = health_task.await;
    engine.stop().await?;
    Ok(())
}
