//! Business logic and serialization seams.
//!
//! The engine is parametrized over one [`Aggregate`] implementation and a pair
//! of [`Codec`]s, all resolved when the engine is built. It never inspects
//! commands, events or state beyond calling these.
//!
//! # Example
//!
//! ```rust
//! use serde::{Deserialize, Serialize};
//! use shardhold::engine::Aggregate;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! enum AccountEvent {
//!     Deposited(u64),
//!     Withdrawn(u64),
//! }
//!
//! enum AccountCommand {
//!     Deposit(u64),
//!     Withdraw(u64),
//! }
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("insufficient funds")]
//! struct InsufficientFunds;
//!
//! struct Account;
//!
//! impl Aggregate for Account {
//!     type State = u64;
//!     type Command = AccountCommand;
//!     type Event = AccountEvent;
//!     type Error = InsufficientFunds;
//!
//!     fn initial_state(&self) -> u64 {
//!         0
//!     }
//!
//!     fn process_command(&self, balance: &u64, command: AccountCommand)
//!         -> Result<Vec<AccountEvent>, InsufficientFunds>
//!     {
//!         match command {
//!             AccountCommand::Deposit(amount) => Ok(vec![AccountEvent::Deposited(amount)]),
//!             AccountCommand::Withdraw(amount) if amount > *balance => Err(InsufficientFunds),
//!             AccountCommand::Withdraw(amount) => Ok(vec![AccountEvent::Withdrawn(amount)]),
//!         }
//!     }
//!
//!     fn apply_event(&self, balance: u64, event: &AccountEvent) -> u64 {
//!         match event {
//!             AccountEvent::Deposited(amount) => balance + amount,
//!             AccountEvent::Withdrawn(amount) => balance - amount,
//!         }
//!     }
//! }
//!
//! let account = Account;
//! let events = account.process_command(&100, AccountCommand::Withdraw(30)).unwrap();
//! assert_eq!(account.fold(100, &events), 70);
//! ```

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{EngineError, EngineResult};

/// Domain logic of one aggregate type.
///
/// # Contract
///
/// - [`process_command`](Aggregate::process_command) decides: it validates a
///   command against the current state and returns zero or more events. No I/O.
/// - [`apply_event`](Aggregate::apply_event) evolves: a pure, total function
///   from state and event to the next state.
///
/// Both run inside the key's worker turn. A slow implementation stalls that one
/// key only.
pub trait Aggregate: Send + Sync + 'static {
    type State: Clone + Send + Sync + 'static;
    type Command: Send + Sync + 'static;
    type Event: Clone + Send + Sync + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// State of an aggregate with no history.
    fn initial_state(&self) -> Self::State;

    /// Validate `command` against `state` and produce events.
    ///
    /// Returns `Ok(vec![])` for a no-op command and `Err` to reject it.
    fn process_command(
        &self,
        state: &Self::State,
        command: Self::Command,
    ) -> Result<Vec<Self::Event>, Self::Error>;

    /// Apply one event to produce the next state.
    fn apply_event(&self, state: Self::State, event: &Self::Event) -> Self::State;

    /// Fold `events` into `state` in order.
    fn fold(&self, state: Self::State, events: &[Self::Event]) -> Self::State {
        events
            .iter()
            .fold(state, |state, event| self.apply_event(state, event))
    }
}

/// Converts values to and from their wire form.
pub trait Codec<T>: Send + Sync + 'static {
    fn encode(&self, value: &T) -> EngineResult<Bytes>;
    fn decode(&self, bytes: &[u8]) -> EngineResult<T>;
}

/// `serde_json` codec.
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        JsonCodec(PhantomData)
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn encode(&self, value: &T) -> EngineResult<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| EngineError::Codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> EngineResult<T> {
        serde_json::from_slice(bytes).map_err(|e| EngineError::Codec(e.to_string()))
    }
}

/// The codecs for an aggregate's state and events.
pub struct AggregateCodecs<A: Aggregate> {
    pub state: Arc<dyn Codec<A::State>>,
    pub event: Arc<dyn Codec<A::Event>>,
}

impl<A: Aggregate> Clone for AggregateCodecs<A> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            event: Arc::clone(&self.event),
        }
    }
}

impl<A: Aggregate> AggregateCodecs<A> {
    pub fn new(state: Arc<dyn Codec<A::State>>, event: Arc<dyn Codec<A::Event>>) -> Self {
        Self { state, event }
    }

    /// JSON for both state and events.
    pub fn json() -> Self
    where
        A::State: Serialize + DeserializeOwned,
        A::Event: Serialize + DeserializeOwned,
    {
        Self {
            state: Arc::new(JsonCodec::<A::State>::new()),
            event: Arc::new(JsonCodec::<A::Event>::new()),
        }
    }

    /// Encode a batch of events.
    pub fn encode_events(&self, events: &[A::Event]) -> EngineResult<Vec<Bytes>> {
        events.iter().map(|event| self.event.encode(event)).collect()
    }

    /// Decode a batch of events.
    pub fn decode_events(&self, encoded: &[Bytes]) -> EngineResult<Vec<A::Event>> {
        encoded.iter().map(|bytes| self.event.decode(bytes)).collect()
    }
}
