//! Core functionality for the BLE bridge
//! The handle registry, the central and peripheral state machines, and the
//! dispatcher that serializes commands with native events.

pub mod bridge;
pub mod bt_uuid;
pub mod central;
pub mod constants;
pub mod diagnostics;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod handle;
pub mod marshal;
pub mod native;
pub mod pending;
pub mod peripheral;
mod restore;
pub mod sim;
pub mod types;

// Re-export commonly used types
pub use bridge::BridgeCore;
pub use bt_uuid::BtUuid;
pub use dispatcher::{EventHandler, EventStream, NativeEventSender};
pub use error::{BridgeError, TransportError};
pub use events::BridgeEvent;
pub use handle::Handle;
pub use native::{NativeRef, NativeStack, RawEvent};
pub use sim::SimulatedStack;
