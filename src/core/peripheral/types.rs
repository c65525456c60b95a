//! Local GATT server types: mutable attribute trees, advertisement data,
//! attribute requests and their responses.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::core::bt_uuid::BtUuid;
use crate::core::central::types::CharacteristicProperties;
use crate::core::handle::Handle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AttributePermissions(pub u32);

impl AttributePermissions {
    pub const READABLE: Self = Self(0x01);
    pub const WRITEABLE: Self = Self(0x02);
    pub const READ_ENCRYPTION_REQUIRED: Self = Self(0x04);
    pub const WRITE_ENCRYPTION_REQUIRED: Self = Self(0x08);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for AttributePermissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// ATT protocol result codes used to answer attribute requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttError {
    Success,
    InvalidHandle,
    ReadNotPermitted,
    WriteNotPermitted,
    InvalidPdu,
    InsufficientAuthentication,
    RequestNotSupported,
    InvalidOffset,
    InsufficientAuthorization,
    PrepareQueueFull,
    AttributeNotFound,
    AttributeNotLong,
    InsufficientEncryptionKeySize,
    InvalidAttributeValueLength,
    UnlikelyError,
    InsufficientEncryption,
    UnsupportedGroupType,
    InsufficientResources,
}

impl AttError {
    pub fn code(self) -> u8 {
        match self {
            AttError::Success => 0x00,
            AttError::InvalidHandle => 0x01,
            AttError::ReadNotPermitted => 0x02,
            AttError::WriteNotPermitted => 0x03,
            AttError::InvalidPdu => 0x04,
            AttError::InsufficientAuthentication => 0x05,
            AttError::RequestNotSupported => 0x06,
            AttError::InvalidOffset => 0x07,
            AttError::InsufficientAuthorization => 0x08,
            AttError::PrepareQueueFull => 0x09,
            AttError::AttributeNotFound => 0x0a,
            AttError::AttributeNotLong => 0x0b,
            AttError::InsufficientEncryptionKeySize => 0x0c,
            AttError::InvalidAttributeValueLength => 0x0d,
            AttError::UnlikelyError => 0x0e,
            AttError::InsufficientEncryption => 0x0f,
            AttError::UnsupportedGroupType => 0x10,
            AttError::InsufficientResources => 0x11,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionLatency {
    Low,
    Medium,
    High,
}

/// Configurable portion of an outgoing advertisement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisementData {
    pub local_name: Option<String>,
    pub service_uuids: Vec<BtUuid>,
    /// Proximity beacon payload; when non-empty it replaces the other fields.
    pub ibeacon_data: Vec<u8>,
}

impl AdvertisementData {
    pub fn is_ibeacon(&self) -> bool {
        !self.ibeacon_data.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutableDescriptor {
    pub uuid: BtUuid,
    pub value: Vec<u8>,
}

impl MutableDescriptor {
    pub fn new(uuid: BtUuid, value: impl Into<Vec<u8>>) -> Self {
        Self {
            uuid,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutableCharacteristic {
    pub uuid: BtUuid,
    pub properties: CharacteristicProperties,
    pub permissions: AttributePermissions,
    /// A static value is cached by the stack and served without a read request.
    pub value: Option<Vec<u8>>,
    pub descriptors: Vec<MutableDescriptor>,
}

impl MutableCharacteristic {
    pub fn new(
        uuid: BtUuid,
        properties: CharacteristicProperties,
        permissions: AttributePermissions,
    ) -> Self {
        Self {
            uuid,
            properties,
            permissions,
            value: None,
            descriptors: Vec::new(),
        }
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_descriptor(mut self, descriptor: MutableDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutableService {
    pub uuid: BtUuid,
    pub primary: bool,
    pub characteristics: Vec<MutableCharacteristic>,
    pub included: Vec<MutableService>,
}

impl MutableService {
    pub fn new(uuid: BtUuid, primary: bool) -> Self {
        Self {
            uuid,
            primary,
            characteristics: Vec::new(),
            included: Vec::new(),
        }
    }

    pub fn with_characteristic(mut self, characteristic: MutableCharacteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    pub fn with_included(mut self, service: MutableService) -> Self {
        self.included.push(service);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Read,
    Write,
}

/// A delivered attribute request, as the caller sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub request: Handle,
    pub kind: RequestKind,
    pub central: Handle,
    pub characteristic: Handle,
    pub offset: usize,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalServiceInfo {
    pub handle: Handle,
    pub uuid: BtUuid,
    pub primary: bool,
    pub published: bool,
    pub characteristics: Vec<Handle>,
    pub included: Vec<Handle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CentralInfo {
    pub handle: Handle,
    pub identifier: Uuid,
    pub maximum_update_length: usize,
    pub subscriptions: Vec<Handle>,
}

pub(crate) struct LocalServiceEntity {
    pub uuid: BtUuid,
    pub primary: bool,
    /// Set once the stack confirms the add.
    pub published: bool,
    /// Included services are owned by the service that included them.
    pub owner: Option<Handle>,
    pub characteristics: Vec<Handle>,
    pub included: Vec<Handle>,
}

pub(crate) struct LocalCharacteristicEntity {
    pub service: Handle,
    pub uuid: BtUuid,
    pub properties: CharacteristicProperties,
    pub permissions: AttributePermissions,
    pub value: Option<Vec<u8>>,
    pub descriptors: Vec<Handle>,
    pub subscribers: HashSet<Handle>,
    /// Most recent request on this attribute still waiting for a response.
    pub open_request: Option<Handle>,
}

pub(crate) struct LocalDescriptorEntity {
    pub characteristic: Handle,
    pub uuid: BtUuid,
    pub value: Vec<u8>,
}

pub(crate) struct RemoteCentral {
    pub identifier: Uuid,
    pub maximum_update_length: usize,
    pub subscriptions: HashSet<Handle>,
    pub open_requests: usize,
}

pub(crate) struct AttRequest {
    pub kind: RequestKind,
    pub central: Handle,
    pub characteristic: Handle,
    pub offset: usize,
    pub value: Vec<u8>,
    pub batch: u64,
}

pub(crate) struct QueuedUpdate {
    pub characteristic: Handle,
    pub value: Vec<u8>,
    /// Empty means every subscriber.
    pub centrals: Vec<Handle>,
}
