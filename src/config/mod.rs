pub mod bridge_config;

pub use bridge_config::{BridgeConfig, ManagerOptions, CONFIG_FILE_NAME};
