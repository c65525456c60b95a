//! BLE bridge library
//! Wraps a delegate-callback Bluetooth LE stack in a handle-based command API
//! with a single ordered event stream.

// Module declarations
pub mod commands;
pub mod config;
pub mod core;
pub mod logging;
pub mod utils;

pub use commands::Bridge;
pub use config::BridgeConfig;
pub use crate::core::dispatcher::start;
