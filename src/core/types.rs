//! Types shared by the central and peripheral halves of the bridge.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Power and authorization state reported by either manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl ManagerState {
    pub fn is_powered_on(self) -> bool {
        self == ManagerState::PoweredOn
    }
}

/// The kind of object a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    CentralManager,
    PeripheralManager,
    Peripheral,
    Service,
    Characteristic,
    Descriptor,
    LocalService,
    LocalCharacteristic,
    LocalDescriptor,
    Central,
    Request,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::CentralManager => "central manager",
            EntityKind::PeripheralManager => "peripheral manager",
            EntityKind::Peripheral => "peripheral",
            EntityKind::Service => "service",
            EntityKind::Characteristic => "characteristic",
            EntityKind::Descriptor => "descriptor",
            EntityKind::LocalService => "local service",
            EntityKind::LocalCharacteristic => "local characteristic",
            EntityKind::LocalDescriptor => "local descriptor",
            EntityKind::Central => "remote central",
            EntityKind::Request => "attribute request",
        };
        f.write_str(name)
    }
}
