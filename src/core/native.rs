//! The seam to the operating system's Bluetooth stack.
//!
//! [`NativeStack`] is the command surface the bridge drives; [`RawEvent`] is
//! everything the stack's delegates report back. Native objects are opaque
//! [`NativeRef`]s. Their attributes travel inside event payloads as the
//! `Native*` descriptions below, so the bridge never has to call back into the
//! stack to learn what an object is.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ManagerOptions;
use crate::core::bt_uuid::BtUuid;
use crate::core::central::types::{
    AdvFields, CharacteristicProperties, ConnectOptions, PeripheralState, ScanOptions, WriteKind,
};
use crate::core::error::TransportError;
use crate::core::peripheral::types::{
    AdvertisementData, AttError, AttributePermissions, ConnectionLatency, MutableService,
};
use crate::core::types::ManagerState;

/// Identity of a native object, as handed out by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NativeRef(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativePeripheral {
    pub object: NativeRef,
    pub identifier: Uuid,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredPeripheral {
    pub peripheral: NativePeripheral,
    pub state: PeripheralState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeService {
    pub object: NativeRef,
    pub uuid: BtUuid,
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCharacteristic {
    pub object: NativeRef,
    pub uuid: BtUuid,
    pub properties: CharacteristicProperties,
    pub notifying: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeDescriptor {
    pub object: NativeRef,
    pub uuid: BtUuid,
}

/// A local service tree as allocated (or restored) by the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeLocalService {
    pub object: NativeRef,
    pub uuid: BtUuid,
    pub primary: bool,
    pub characteristics: Vec<NativeLocalCharacteristic>,
    pub included: Vec<NativeLocalService>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeLocalCharacteristic {
    pub object: NativeRef,
    pub uuid: BtUuid,
    pub properties: CharacteristicProperties,
    pub permissions: AttributePermissions,
    pub value: Option<Vec<u8>>,
    pub descriptors: Vec<NativeLocalDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeLocalDescriptor {
    pub object: NativeRef,
    pub uuid: BtUuid,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCentral {
    pub object: NativeRef,
    pub identifier: Uuid,
    pub maximum_update_length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeAttRequest {
    pub object: NativeRef,
    pub central: NativeCentral,
    pub characteristic: NativeRef,
    pub offset: usize,
    pub value: Vec<u8>,
}

/// One delegate callback from the native stack.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    CentralDidUpdateState {
        manager: NativeRef,
        state: ManagerState,
    },
    CentralWillRestoreState {
        manager: NativeRef,
        peripherals: Vec<RestoredPeripheral>,
        scan_services: Vec<BtUuid>,
        scan_options: Option<ScanOptions>,
    },
    DidDiscoverPeripheral {
        manager: NativeRef,
        peripheral: NativePeripheral,
        advertisement: AdvFields,
        rssi: i16,
    },
    DidConnectPeripheral {
        manager: NativeRef,
        peripheral: NativeRef,
    },
    DidFailToConnectPeripheral {
        manager: NativeRef,
        peripheral: NativeRef,
        error: Option<TransportError>,
    },
    DidDisconnectPeripheral {
        manager: NativeRef,
        peripheral: NativeRef,
        error: Option<TransportError>,
    },
    DidDiscoverServices {
        peripheral: NativeRef,
        services: Vec<NativeService>,
        error: Option<TransportError>,
    },
    DidDiscoverIncludedServices {
        peripheral: NativeRef,
        service: NativeRef,
        included: Vec<NativeService>,
        error: Option<TransportError>,
    },
    DidDiscoverCharacteristics {
        peripheral: NativeRef,
        service: NativeRef,
        characteristics: Vec<NativeCharacteristic>,
        error: Option<TransportError>,
    },
    DidDiscoverDescriptors {
        peripheral: NativeRef,
        characteristic: NativeRef,
        descriptors: Vec<NativeDescriptor>,
        error: Option<TransportError>,
    },
    DidUpdateValueForCharacteristic {
        peripheral: NativeRef,
        characteristic: NativeRef,
        value: Vec<u8>,
        error: Option<TransportError>,
    },
    DidUpdateValueForDescriptor {
        peripheral: NativeRef,
        descriptor: NativeRef,
        value: Vec<u8>,
        error: Option<TransportError>,
    },
    DidWriteValueForCharacteristic {
        peripheral: NativeRef,
        characteristic: NativeRef,
        error: Option<TransportError>,
    },
    DidWriteValueForDescriptor {
        peripheral: NativeRef,
        descriptor: NativeRef,
        error: Option<TransportError>,
    },
    IsReadyToSendWriteWithoutResponse {
        peripheral: NativeRef,
    },
    DidUpdateNotificationState {
        peripheral: NativeRef,
        characteristic: NativeRef,
        notifying: bool,
        error: Option<TransportError>,
    },
    DidReadRssi {
        peripheral: NativeRef,
        rssi: i16,
        error: Option<TransportError>,
    },
    DidUpdateName {
        peripheral: NativeRef,
        name: Option<String>,
    },
    DidModifyServices {
        peripheral: NativeRef,
        invalidated: Vec<NativeRef>,
    },
    PeripheralManagerDidUpdateState {
        manager: NativeRef,
        state: ManagerState,
    },
    PeripheralManagerWillRestoreState {
        manager: NativeRef,
        services: Vec<NativeLocalService>,
        advertisement: Option<AdvertisementData>,
    },
    DidAddService {
        manager: NativeRef,
        service: NativeRef,
        error: Option<TransportError>,
    },
    DidStartAdvertising {
        manager: NativeRef,
        error: Option<TransportError>,
    },
    CentralDidSubscribe {
        manager: NativeRef,
        central: NativeCentral,
        characteristic: NativeRef,
    },
    CentralDidUnsubscribe {
        manager: NativeRef,
        central: NativeCentral,
        characteristic: NativeRef,
    },
    IsReadyToUpdateSubscribers {
        manager: NativeRef,
    },
    DidReceiveReadRequest {
        manager: NativeRef,
        request: NativeAttRequest,
    },
    DidReceiveWriteRequests {
        manager: NativeRef,
        requests: Vec<NativeAttRequest>,
    },
}

/// Commands into the native stack.
///
/// Calls are made from the dispatcher context only. Asynchronous calls return
/// immediately; their completions come back as [`RawEvent`]s.
pub trait NativeStack: Send + Sync {
    fn create_central_manager(&self, options: &ManagerOptions) -> NativeRef;
    fn create_peripheral_manager(&self, options: &ManagerOptions) -> NativeRef;

    /// Takes a strong reference on behalf of the handle registry.
    fn retain(&self, object: NativeRef);
    fn release(&self, object: NativeRef);

    fn scan(&self, manager: NativeRef, services: &[BtUuid], options: &ScanOptions);
    fn stop_scan(&self, manager: NativeRef);
    fn connect(&self, manager: NativeRef, peripheral: NativeRef, options: &ConnectOptions);
    fn cancel_connect(&self, manager: NativeRef, peripheral: NativeRef);
    fn retrieve_connected_peripherals(
        &self,
        manager: NativeRef,
        services: &[BtUuid],
    ) -> Vec<NativePeripheral>;
    fn retrieve_peripherals(&self, manager: NativeRef, identifiers: &[Uuid]) -> Vec<NativePeripheral>;

    fn discover_services(&self, peripheral: NativeRef, filter: &[BtUuid]);
    fn discover_included_services(&self, peripheral: NativeRef, service: NativeRef, filter: &[BtUuid]);
    fn discover_characteristics(&self, peripheral: NativeRef, service: NativeRef, filter: &[BtUuid]);
    fn discover_descriptors(&self, peripheral: NativeRef, characteristic: NativeRef);
    fn read_characteristic(&self, peripheral: NativeRef, characteristic: NativeRef);
    fn read_descriptor(&self, peripheral: NativeRef, descriptor: NativeRef);
    fn write_characteristic(
        &self,
        peripheral: NativeRef,
        characteristic: NativeRef,
        value: &[u8],
        kind: WriteKind,
    );
    fn write_descriptor(&self, peripheral: NativeRef, descriptor: NativeRef, value: &[u8]);
    fn set_notify(&self, peripheral: NativeRef, characteristic: NativeRef, enabled: bool);
    fn read_rssi(&self, peripheral: NativeRef);
    fn max_write_len(&self, peripheral: NativeRef, kind: WriteKind) -> usize;
    fn can_send_write_without_response(&self, peripheral: NativeRef) -> bool;

    /// Builds the native object tree for a local service definition.
    fn alloc_service(&self, service: &MutableService) -> NativeLocalService;
    fn add_service(&self, manager: NativeRef, service: NativeRef);
    fn remove_service(&self, manager: NativeRef, service: NativeRef);
    fn remove_all_services(&self, manager: NativeRef);
    fn start_advertising(&self, manager: NativeRef, data: &AdvertisementData);
    fn stop_advertising(&self, manager: NativeRef);
    /// Returns false when the transmit queue is full.
    fn update_value(
        &self,
        manager: NativeRef,
        value: &[u8],
        characteristic: NativeRef,
        centrals: &[NativeRef],
    ) -> bool;
    /// `value`, when present, is set on the request before it is answered.
    fn respond_to_request(
        &self,
        manager: NativeRef,
        request: NativeRef,
        value: Option<&[u8]>,
        result: AttError,
    );
    fn set_connection_latency(&self, manager: NativeRef, latency: ConnectionLatency, central: NativeRef);
}
