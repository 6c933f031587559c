//! Per-key worker that owns one aggregate's in-memory state.
//!
//! An actor is a tokio task reading an unbounded `mpsc` mailbox and handling
//! one command at a time, to completion, before looking at the next. That
//! makes it the single writer for its key: no two commands for the same key
//! are ever in flight together.
//!
//! # Lifecycle
//!
//! 1. Spawned by [`AggregateActorRegion`](super::AggregateActorRegion) on the
//!    first command for its key.
//! 2. Loads the last committed state from the state store (bounded by the
//!    spawn timeout). On failure it unregisters itself and fails every command
//!    it received; the region keeps running.
//! 3. Handles commands: decide, fold, encode, append, wait for the
//!    acknowledgement, publish to the store, reply.
//! 4. Exits when idle for the idle timeout, or when the region removes its
//!    handle (hand-off). Commands still queued at hand-off fail with `NotOwner`.
//!
//! Idle eviction takes the region's map entry lock and only removes the handle
//! if the mailbox is empty at that instant; routing enqueues under the same
//! lock, so a command can never be sent to an actor that is about to exit.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::Utc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, debug_span, warn};

use super::aggregate::Aggregate;
use super::metrics;
use super::producer::ProducerCoordinator;
use super::region::RegionShared;
use crate::error::{EngineError, EngineResult, SubmitError, TimeoutKind};
use crate::types::{
    AggregateKey, CommandEnvelope, CommittedRecord, EventEnvelope, Offset, Sequence,
};

/// Outcome of one command.
pub type CommandResult<A> =
    Result<CommandReply<A>, SubmitError<<A as Aggregate>::Error>>;

/// Successful command outcome.
pub struct CommandReply<A: Aggregate> {
    /// Events the command produced (empty for a no-op).
    pub events: Vec<A::Event>,
    /// State after the command.
    pub state: A::State,
    /// Sequence marker of the aggregate after the command.
    pub sequence: Sequence,
    /// Log offset of the write, or `None` when nothing was written.
    pub offset: Option<Offset>,
}

impl<A: Aggregate> std::fmt::Debug for CommandReply<A>
where
    A::Event: std::fmt::Debug,
    A::State: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandReply")
            .field("events", &self.events)
            .field("state", &self.state)
            .field("sequence", &self.sequence)
            .field("offset", &self.offset)
            .finish()
    }
}

pub(crate) struct ActorMessage<A: Aggregate> {
    pub envelope: CommandEnvelope<A::Command>,
    pub reply: oneshot::Sender<CommandResult<A>>,
}

/// Registration of a live actor in its region.
pub struct ActorHandle<A: Aggregate> {
    pub(crate) sender: mpsc::UnboundedSender<ActorMessage<A>>,
    pub(crate) generation: u64,
    pub(crate) task: JoinHandle<()>,
}

impl<A: Aggregate> ActorHandle<A> {
    /// Incarnation number, unique within the region.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Check whether the actor is still reading its mailbox.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

impl<A: Aggregate> std::fmt::Debug for ActorHandle<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorHandle")
            .field("generation", &self.generation)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Spawn the actor task for `key` and return its handle.
///
/// Must be called with the region's map entry for `key` locked, and the
/// returned handle inserted before the lock is released.
pub(crate) fn spawn_actor<A: Aggregate>(
    region: &Arc<RegionShared<A>>,
    key: AggregateKey,
) -> ActorHandle<A> {
    let (sender, rx) = mpsc::unbounded_channel();
    let generation = region.next_generation.fetch_add(1, Ordering::SeqCst);
    let actor = Actor {
        key,
        generation,
        region: Arc::clone(region),
    };
    metrics::record_actor_started();
    let task = tokio::spawn(actor.run(rx));
    ActorHandle {
        sender,
        generation,
        task,
    }
}

struct Actor<A: Aggregate> {
    key: AggregateKey,
    generation: u64,
    region: Arc<RegionShared<A>>,
}

/// In-memory aggregate state plus its position in the log.
struct Loaded<S> {
    state: S,
    sequence: Sequence,
}

impl<A: Aggregate> Actor<A> {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<ActorMessage<A>>) {
        let spawn_timeout = self.region.config.spawn_timeout;
        let loaded = match tokio::time::timeout(spawn_timeout, self.load()).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::timeout(TimeoutKind::Spawn, spawn_timeout)),
        };

        let mut loaded = match loaded {
            Ok(loaded) => loaded,
            Err(error) => {
                self.fail_recovery(rx, error);
                return;
            }
        };

        debug!(
            partition = %self.region.partition,
            key = %self.key,
            sequence = %loaded.sequence,
            "Actor started"
        );

        let idle_timeout = self.region.config.idle_timeout;
        let mut next: Option<ActorMessage<A>> = None;
        let reason = loop {
            let message = match next.take() {
                Some(message) => message,
                None => match tokio::time::timeout(idle_timeout, rx.recv()).await {
                    Ok(Some(message)) => message,
                    Ok(None) => break "handoff",
                    Err(_) => {
                        if self.try_evict(&mut rx, &mut next) {
                            break "idle";
                        }
                        continue;
                    }
                },
            };
            let span = debug_span!(
                "command",
                partition = %self.region.partition,
                key = %self.key,
                correlation_id = %message.envelope.correlation_id,
            );
            self.handle(&mut loaded, message).instrument(span).await;
        };

        metrics::record_actor_stopped(reason);
        debug!(
            partition = %self.region.partition,
            key = %self.key,
            reason,
            "Actor stopped"
        );
    }

    /// Remove our handle if the mailbox is empty.
    ///
    /// Returns `true` if evicted. A message that slipped in is moved to `next`.
    fn try_evict(
        &self,
        rx: &mut mpsc::UnboundedReceiver<ActorMessage<A>>,
        next: &mut Option<ActorMessage<A>>,
    ) -> bool {
        let generation = self.generation;
        // Handle gone or replaced: keep reading until the channel closes.
        self.region
            .actors
            .remove_if(&self.key, |_, handle| {
                if handle.generation != generation {
                    return false;
                }
                match rx.try_recv() {
                    Ok(message) => {
                        *next = Some(message);
                        false
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => true,
                }
            })
            .is_some()
    }

    /// Load the last committed state, waiting for the store slice if it is
    /// still catching up.
    async fn load(&self) -> EngineResult<Loaded<A::State>> {
        let region = &self.region;
        let snapshot = loop {
            match region.store.get_in(region.partition, &self.key) {
                Err(EngineError::NotReady { .. }) => {
                    region
                        .store
                        .wait_ready(region.partition, region.config.spawn_timeout)
                        .await?;
                }
                other => break other?,
            }
        };

        match snapshot {
            None => Ok(Loaded {
                state: region.aggregate.initial_state(),
                sequence: Sequence::ZERO,
            }),
            Some(snapshot) => {
                let state = region.codecs.state.decode(&snapshot.state).map_err(|e| {
                    EngineError::StateRecovery {
                        key: self.key.clone(),
                        reason: e.to_string(),
                    }
                })?;
                Ok(Loaded {
                    state,
                    sequence: snapshot.sequence,
                })
            }
        }
    }

    /// Unregister after a failed load and fail everything in the mailbox.
    fn fail_recovery(&self, mut rx: mpsc::UnboundedReceiver<ActorMessage<A>>, error: EngineError) {
        let generation = self.generation;
        self.region
            .actors
            .remove_if(&self.key, |_, handle| handle.generation == generation);
        rx.close();

        let error = match error {
            EngineError::NotReady { .. } | EngineError::Log(_) => EngineError::StateRecovery {
                key: self.key.clone(),
                reason: error.to_string(),
            },
            EngineError::Timeout { .. } => {
                EngineError::timeout(TimeoutKind::Spawn, self.region.config.spawn_timeout)
            }
            other => other,
        };

        warn!(
            partition = %self.region.partition,
            key = %self.key,
            error = %error,
            "Actor state recovery failed"
        );

        while let Ok(message) = rx.try_recv() {
            let _ = message.reply.send(Err(SubmitError::Engine(error.clone())));
        }
        metrics::record_actor_stopped("recovery_failed");
    }

    async fn handle(&self, loaded: &mut Loaded<A::State>, message: ActorMessage<A>) {
        let ActorMessage { envelope, reply } = message;
        let CommandEnvelope {
            command,
            submitted_at,
            ..
        } = envelope;

        if self.region.draining.load(Ordering::SeqCst) {
            let _ = reply.send(Err(SubmitError::Engine(EngineError::NotOwner {
                partition: self.region.partition,
            })));
            return;
        }
        if reply.is_closed() {
            debug!(
                waited_ms = (Utc::now() - submitted_at).num_milliseconds(),
                "Skipping command abandoned by its caller"
            );
            return;
        }

        let region = &self.region;
        let events = match region.aggregate.process_command(&loaded.state, command) {
            Ok(events) => events,
            Err(rejection) => {
                let _ = reply.send(Err(SubmitError::Rejected(rejection)));
                return;
            }
        };

        if events.is_empty() {
            let _ = reply.send(Ok(CommandReply {
                events,
                state: loaded.state.clone(),
                sequence: loaded.sequence,
                offset: None,
            }));
            return;
        }

        let next_state = region.aggregate.fold(loaded.state.clone(), &events);
        let record = match self.envelope(&events, &next_state, loaded.sequence.next()) {
            Ok(record) => record,
            Err(e) => {
                let _ = reply.send(Err(SubmitError::Engine(e)));
                return;
            }
        };

        // One deadline covers waiting for queue space and the acknowledgement.
        let append_timeout = region.config.append_timeout;
        let deadline = tokio::time::Instant::now() + append_timeout;
        let timed_out = || {
            SubmitError::Engine(EngineError::timeout(TimeoutKind::Append, append_timeout))
        };

        // A send abandoned at the deadline never reaches the queue.
        let mut ack_rx =
            match tokio::time::timeout_at(deadline, region.producer.enqueue(record.clone())).await {
                Ok(Ok(ack_rx)) => ack_rx,
                Ok(Err(e)) => {
                    let _ = reply.send(Err(SubmitError::Engine(e)));
                    return;
                }
                Err(_) => {
                    let _ = reply.send(Err(timed_out()));
                    return;
                }
            };

        match tokio::time::timeout_at(deadline, &mut ack_rx).await {
            Ok(outcome) => {
                let outcome = outcome.unwrap_or(Err(EngineError::NotOwner {
                    partition: region.partition,
                }));
                match outcome {
                    Ok(ack) => {
                        let sequence = record.sequence;
                        self.commit(loaded, next_state.clone(), record, ack.offset);
                        debug!(
                            latency_ms = (Utc::now() - submitted_at).num_milliseconds(),
                            "Command committed"
                        );
                        let _ = reply.send(Ok(CommandReply {
                            events,
                            state: next_state,
                            sequence,
                            offset: Some(ack.offset),
                        }));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(SubmitError::Engine(e)));
                    }
                }
            }
            Err(_) => {
                let _ = reply.send(Err(timed_out()));
                // The write is still queued; its outcome decides the state the
                // next command sees.
                let late = ProducerCoordinator::await_ack(region.partition, ack_rx).await;
                if let Ok(ack) = late {
                    warn!(
                        partition = %region.partition,
                        key = %self.key,
                        offset = %ack.offset,
                        "Append acknowledged after the caller timed out"
                    );
                    self.commit(loaded, next_state, record, ack.offset);
                }
            }
        }
    }

    fn envelope(
        &self,
        events: &[A::Event],
        next_state: &A::State,
        sequence: Sequence,
    ) -> EngineResult<EventEnvelope> {
        let codecs = &self.region.codecs;
        Ok(EventEnvelope {
            key: self.key.clone(),
            partition: self.region.partition,
            sequence,
            timestamp_ms: Utc::now().timestamp_millis(),
            events: codecs.encode_events(events)?,
            state: codecs.state.encode(next_state)?,
        })
    }

    /// Publish an acknowledged write to the store and adopt its state.
    fn commit(
        &self,
        loaded: &mut Loaded<A::State>,
        next_state: A::State,
        envelope: EventEnvelope,
        offset: Offset,
    ) {
        let sequence = envelope.sequence;
        self.region
            .store
            .on_commit(&CommittedRecord { offset, envelope });
        loaded.state = next_state;
        loaded.sequence = sequence;
        debug!(
            partition = %self.region.partition,
            key = %self.key,
            sequence = %sequence,
            offset = %offset,
            "Committed"
        );
    }
}
