//! Normalized events forwarded to the caller.
//! Every native object in a payload has already been resolved to a handle.

use serde::Serialize;
use uuid::Uuid;

use crate::core::bt_uuid::BtUuid;
use crate::core::central::types::{AdvFields, ScanOptions};
use crate::core::error::TransportError;
use crate::core::handle::Handle;
use crate::core::peripheral::types::{AdvertisementData, RequestInfo};
use crate::core::types::ManagerState;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeEvent {
    CentralStateChanged {
        state: ManagerState,
    },
    CentralRestored {
        peripherals: Vec<Handle>,
        scan_services: Vec<BtUuid>,
        scan_options: Option<ScanOptions>,
    },
    PeripheralDiscovered {
        peripheral: Handle,
        identifier: Uuid,
        advertisement: AdvFields,
        rssi: i16,
    },
    PeripheralConnected {
        peripheral: Handle,
    },
    PeripheralConnectFailed {
        peripheral: Handle,
        error: Option<TransportError>,
    },
    PeripheralDisconnected {
        peripheral: Handle,
        error: Option<TransportError>,
    },
    PeripheralNameUpdated {
        peripheral: Handle,
        name: Option<String>,
    },
    ServicesDiscovered {
        peripheral: Handle,
        services: Vec<Handle>,
        error: Option<TransportError>,
    },
    IncludedServicesDiscovered {
        service: Handle,
        included: Vec<Handle>,
        error: Option<TransportError>,
    },
    CharacteristicsDiscovered {
        service: Handle,
        characteristics: Vec<Handle>,
        error: Option<TransportError>,
    },
    DescriptorsDiscovered {
        characteristic: Handle,
        descriptors: Vec<Handle>,
        error: Option<TransportError>,
    },
    ServicesModified {
        peripheral: Handle,
        invalidated: Vec<Handle>,
    },
    /// Read completion or unsolicited notification; the two share one shape.
    CharacteristicValueUpdated {
        characteristic: Handle,
        value: Vec<u8>,
        error: Option<TransportError>,
    },
    DescriptorValueUpdated {
        descriptor: Handle,
        value: Vec<u8>,
        error: Option<TransportError>,
    },
    CharacteristicWritten {
        characteristic: Handle,
        error: Option<TransportError>,
    },
    DescriptorWritten {
        descriptor: Handle,
        error: Option<TransportError>,
    },
    NotificationStateUpdated {
        characteristic: Handle,
        notifying: bool,
        error: Option<TransportError>,
    },
    RssiRead {
        peripheral: Handle,
        rssi: i16,
        error: Option<TransportError>,
    },
    /// Transmit credit returned; `flushed` queued writes went out.
    ReadyToSendWriteWithoutResponse {
        peripheral: Handle,
        flushed: usize,
        still_queued: usize,
    },
    PeripheralManagerStateChanged {
        state: ManagerState,
    },
    PeripheralRestored {
        services: Vec<Handle>,
        advertisement: Option<AdvertisementData>,
    },
    ServiceAdded {
        service: Handle,
        error: Option<TransportError>,
    },
    AdvertisingStarted {
        error: Option<TransportError>,
    },
    CentralSubscribed {
        central: Handle,
        characteristic: Handle,
    },
    CentralUnsubscribed {
        central: Handle,
        characteristic: Handle,
    },
    ReadyToUpdateSubscribers {
        flushed: usize,
        still_queued: usize,
    },
    ReadRequest {
        request: RequestInfo,
    },
    WriteRequests {
        requests: Vec<RequestInfo>,
    },
}
