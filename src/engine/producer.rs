//! Ordered, fenced writer for one partition.
//!
//! A `ProducerCoordinator` owns a single writer task that drains an `mpsc`
//! queue strictly in submission order, so appends for one partition reach the
//! log in the order they were submitted. Each append resolves only after the
//! log acknowledged it durably, or fails:
//!
//! - Transient log errors are retried with [`append_policy`](super::retry::append_policy).
//! - Fenced, serialization and authorization errors surface immediately.
//!
//! Every write carries the coordinator's [`WriterFence`]. Once another node (or
//! a later incarnation on this node) owns the partition, the log rejects the
//! write instead of interleaving it with the new owner's.
//!
//! Exactly one coordinator exists per partition: the region creates it on
//! startup and [`drain`](ProducerCoordinator::drain)s or
//! [`abort`](ProducerCoordinator::abort)s it on hand-off. Both wait for the
//! writer task to exit.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::log::DurableLog;
use super::metrics;
use super::retry::{append_policy, with_log_retry};
use crate::error::{EngineError, EngineResult};
use crate::types::{Ack, EventEnvelope, PartitionId, WriterFence};

/// Receiver of one append's outcome.
pub(crate) type AckReceiver = oneshot::Receiver<EngineResult<Ack>>;

struct AppendRequest {
    envelope: EventEnvelope,
    reply: oneshot::Sender<EngineResult<Ack>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopMode {
    /// Write everything already queued, then exit.
    Drain,
    /// Fail everything already queued with `NotOwner`, then exit.
    Abort,
}

/// Writer task state.
struct Writer {
    log: Arc<dyn DurableLog>,
    partition: PartitionId,
    fence: WriterFence,
    max_retries: usize,
}

impl Writer {
    async fn write(&self, request: AppendRequest) {
        let started = Instant::now();
        let AppendRequest { envelope, reply } = request;
        let key = envelope.key.clone();
        let sequence = envelope.sequence;

        let result = with_log_retry("append", append_policy(self.max_retries), || {
            self.log.append(self.partition, self.fence, envelope.clone())
        })
        .await
        .map_err(|source| EngineError::Append {
            partition: self.partition,
            source,
        });

        let elapsed = started.elapsed().as_secs_f64();
        match &result {
            Ok(ack) => {
                metrics::record_append("ok", elapsed);
                debug!(
                    partition = %self.partition,
                    key = %key,
                    sequence = %sequence,
                    offset = %ack.offset,
                    "Append acknowledged"
                );
            }
            Err(e) => {
                metrics::record_append(e.as_metric_label(), elapsed);
                warn!(
                    partition = %self.partition,
                    key = %key,
                    sequence = %sequence,
                    error = %e,
                    "Append failed"
                );
            }
        }

        // The submitter may have stopped waiting; the outcome is still final.
        let _ = reply.send(result);
    }

    async fn run(
        self,
        mut rx: mpsc::Receiver<AppendRequest>,
        mut stop_rx: watch::Receiver<Option<StopMode>>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                request = rx.recv() => {
                    match request {
                        Some(request) => self.write(request).await,
                        None => return,
                    }
                }
            }
        }

        rx.close();
        let mode = *stop_rx.borrow();
        let mut remaining = 0usize;
        while let Some(request) = rx.recv().await {
            remaining += 1;
            match mode {
                Some(StopMode::Abort) => {
                    let _ = request.reply.send(Err(EngineError::NotOwner {
                        partition: self.partition,
                    }));
                }
                _ => self.write(request).await,
            }
        }
        info!(
            partition = %self.partition,
            mode = ?mode,
            remaining,
            "Producer coordinator stopped"
        );
    }
}

/// Single ordered writer for one partition.
pub struct ProducerCoordinator {
    partition: PartitionId,
    fence: WriterFence,
    tx: mpsc::Sender<AppendRequest>,
    stop_tx: watch::Sender<Option<StopMode>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ProducerCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerCoordinator")
            .field("partition", &self.partition)
            .field("fence", &self.fence)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl ProducerCoordinator {
    /// Start the writer task for `partition`.
    pub fn start(
        log: Arc<dyn DurableLog>,
        partition: PartitionId,
        fence: WriterFence,
        queue_capacity: usize,
        max_retries: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let (stop_tx, stop_rx) = watch::channel(None);
        let writer = Writer {
            log,
            partition,
            fence,
            max_retries,
        };
        let task = tokio::spawn(writer.run(rx, stop_rx));

        debug!(
            partition = %partition,
            node_id = %fence.node,
            epoch = %fence.epoch,
            "Producer coordinator started"
        );

        Self {
            partition,
            fence,
            tx,
            stop_tx,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn fence(&self) -> WriterFence {
        self.fence
    }

    /// Check if the coordinator still accepts appends.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed() && self.stop_tx.borrow().is_none()
    }

    /// Queue `envelope` and return the receiver of its outcome.
    ///
    /// The position in the partition's write order is fixed when this returns.
    pub(crate) async fn enqueue(&self, envelope: EventEnvelope) -> EngineResult<AckReceiver> {
        let not_owner = EngineError::NotOwner {
            partition: self.partition,
        };
        if self.stop_tx.borrow().is_some() {
            return Err(not_owner);
        }
        let (reply, ack_rx) = oneshot::channel();
        self.tx
            .send(AppendRequest { envelope, reply })
            .await
            .map_err(|_| not_owner)?;
        Ok(ack_rx)
    }

    /// Append `envelope` and wait for the durable acknowledgement.
    pub async fn append(&self, envelope: EventEnvelope) -> EngineResult<Ack> {
        let ack_rx = self.enqueue(envelope).await?;
        Self::await_ack(self.partition, ack_rx).await
    }

    pub(crate) async fn await_ack(partition: PartitionId, ack_rx: AckReceiver) -> EngineResult<Ack> {
        ack_rx
            .await
            .unwrap_or(Err(EngineError::NotOwner { partition }))
    }

    /// Finish every queued write, then stop.
    pub async fn drain(&self) {
        self.stop(StopMode::Drain).await;
    }

    /// Fail every queued write with `NotOwner`, then stop.
    ///
    /// A write already handed to the log completes (or is fenced) first.
    pub async fn abort(&self) {
        self.stop(StopMode::Abort).await;
    }

    async fn stop(&self, mode: StopMode) {
        self.stop_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(mode);
                true
            } else {
                false
            }
        });

        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    warn!(partition = %self.partition, error = %e, "Producer writer task panicked")
                }
            }
        }
    }
}

impl Drop for ProducerCoordinator {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}
