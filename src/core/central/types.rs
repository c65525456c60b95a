//! Defines shared data structures for the central side of the bridge.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::core::bt_uuid::BtUuid;
use crate::core::handle::Handle;

/// Connection state of a remote peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeripheralState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Characteristic property bitmask, bit-compatible with the GATT declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CharacteristicProperties(pub u32);

impl CharacteristicProperties {
    pub const BROADCAST: Self = Self(0x01);
    pub const READ: Self = Self(0x02);
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x04);
    pub const WRITE: Self = Self(0x08);
    pub const NOTIFY: Self = Self(0x10);
    pub const INDICATE: Self = Self(0x20);
    pub const AUTHENTICATED_SIGNED_WRITES: Self = Self(0x40);
    pub const EXTENDED_PROPERTIES: Self = Self(0x80);
    pub const NOTIFY_ENCRYPTION_REQUIRED: Self = Self(0x100);
    pub const INDICATE_ENCRYPTION_REQUIRED: Self = Self(0x200);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

/// What happened to a write-without-response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    /// Handed to the native stack.
    Sent,
    /// Held until the stack reports it is ready to send again.
    Queued,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOptions {
    pub allow_duplicates: bool,
    pub solicited_service_uuids: Vec<BtUuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    pub notify_on_connection: bool,
    pub notify_on_disconnection: bool,
    pub notify_on_notification: bool,
    pub enable_transport_bridging: bool,
    pub requires_ancs: bool,
    /// Seconds to wait before the connection is attempted.
    pub start_delay: u32,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            notify_on_connection: true,
            notify_on_disconnection: true,
            notify_on_notification: true,
            enable_transport_bridging: false,
            requires_ancs: false,
            start_delay: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceData {
    pub uuid: BtUuid,
    pub data: Vec<u8>,
}

/// Parsed contents of a received advertisement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvFields {
    pub local_name: Option<String>,
    pub manufacturer_data: Vec<u8>,
    pub service_uuids: Vec<BtUuid>,
    pub overflow_service_uuids: Vec<BtUuid>,
    pub tx_power_level: Option<i8>,
    pub connectable: Option<bool>,
    pub service_data: Vec<ServiceData>,
}

/// Snapshot of a peripheral for callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralInfo {
    pub handle: Handle,
    pub identifier: Uuid,
    pub name: Option<String>,
    pub state: PeripheralState,
    pub services: Vec<Handle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub handle: Handle,
    pub peripheral: Handle,
    pub uuid: BtUuid,
    pub primary: bool,
    pub characteristics: Vec<Handle>,
    pub included: Vec<Handle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicInfo {
    pub handle: Handle,
    pub service: Handle,
    pub uuid: BtUuid,
    pub properties: CharacteristicProperties,
    pub value: Option<Vec<u8>>,
    pub notifying: bool,
    pub descriptors: Vec<Handle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorInfo {
    pub handle: Handle,
    pub characteristic: Handle,
    pub uuid: BtUuid,
    pub value: Option<Vec<u8>>,
}

pub(crate) struct PeripheralEntity {
    pub identifier: Uuid,
    pub name: Option<String>,
    pub state: PeripheralState,
    pub services: Vec<Handle>,
    /// Writes without response waiting for transmit credit, in issue order.
    pub write_queue: VecDeque<QueuedWrite>,
}

impl PeripheralEntity {
    pub fn new(identifier: Uuid, name: Option<String>, state: PeripheralState) -> Self {
        Self {
            identifier,
            name,
            state,
            services: Vec::new(),
            write_queue: VecDeque::new(),
        }
    }
}

pub(crate) struct QueuedWrite {
    pub characteristic: Handle,
    pub value: Vec<u8>,
}

/// Parent of a remote service: the peripheral for top-level services, or the
/// including service for services first seen through included discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ServiceParent {
    Peripheral,
    Service(Handle),
}

pub(crate) struct ServiceEntity {
    pub peripheral: Handle,
    pub parent: ServiceParent,
    pub uuid: BtUuid,
    pub primary: bool,
    pub characteristics: Vec<Handle>,
    pub included: Vec<Handle>,
}

pub(crate) struct CharacteristicEntity {
    pub peripheral: Handle,
    pub service: Handle,
    pub uuid: BtUuid,
    pub properties: CharacteristicProperties,
    pub value: Option<Vec<u8>>,
    pub notifying: bool,
    pub descriptors: Vec<Handle>,
}

pub(crate) struct DescriptorEntity {
    pub peripheral: Handle,
    pub characteristic: Handle,
    pub uuid: BtUuid,
    pub value: Option<Vec<u8>>,
}
