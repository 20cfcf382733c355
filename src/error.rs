use alloy::primitives::Address;
use thiserror::Error;

use crate::{abi::EventKind, chain::ClientError, storage::StorageError};

/// Convenience alias used across the crate.
pub type ListenerResult<T> = Result<T, ListenerError>;

/// Errors emitted by the listener.
///
/// Registry-level rejections that are part of normal operation (a contract
/// already registered, an event already tracked) are reported through
/// [`OpStatus`](crate::types::OpStatus) instead; `ListenerError` covers the
/// failures a caller has to handle.
#[derive(Error, Debug, Clone)]
pub enum ListenerError {
    /// The contract address string could not be parsed.
    #[error("invalid contract address `{0}`")]
    InvalidAddress(String),

    /// The requested event is not part of the contract's interface descriptor.
    #[error("event {event} is not declared by the contract interface")]
    UnknownEvent { event: EventKind },

    /// A read-only contract call failed.
    #[error("{method} call on {address} failed: {source}")]
    Call {
        method: &'static str,
        address: Address,
        #[source]
        source: ClientError,
    },

    /// The chain client returned an error.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The persistence layer returned an error.
    #[error(transparent)]
    Storage(#[from] StorageError),
}
