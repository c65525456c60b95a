//! Error types for the bridge
//! Local errors are returned synchronously from commands; transport errors
//! only ever travel inside completion events.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::handle::Handle;
use crate::core::marshal::MarshalError;
use crate::core::pending::OperationKind;
use crate::core::types::{EntityKind, ManagerState};

/// Synchronous failures of a bridge command.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("manager is not powered on (state: {0:?})")]
    NotReady(ManagerState),
    #[error("handle {0} not found")]
    NotFound(Handle),
    #[error("{kind:?} already in progress on {handle}")]
    OperationInProgress { handle: Handle, kind: OperationKind },
    #[error("peripheral {0} is not connected")]
    NotConnected(Handle),
    #[error("handle {handle} refers to a {actual}, expected a {expected}")]
    WrongKind {
        handle: Handle,
        expected: EntityKind,
        actual: EntityKind,
    },
    #[error("{0} manager is disabled in the bridge configuration")]
    Disabled(&'static str),
    #[error("bridge dispatcher has shut down")]
    Shutdown,
    #[error("malformed boundary data: {0}")]
    Malformed(#[from] MarshalError),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Error pair reported by the native stack on a completion event.
///
/// The bridge never interprets `code`; it is forwarded exactly as received.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message} (code {code})")]
pub struct TransportError {
    pub message: String,
    pub code: i64,
}

impl TransportError {
    pub fn new(message: impl Into<String>, code: i64) -> Self {
        Self {
            message: message.into(),
            code,
        }
    }

    /// Builds an error from the optional (message, code) wire pair.
    /// A missing message means success, whatever the code says.
    pub fn from_pair(message: Option<String>, code: i64) -> Option<Self> {
        message.map(|message| Self { message, code })
    }
}
