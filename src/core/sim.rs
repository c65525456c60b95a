//! In-memory native stack
//! Records every command, counts retains per object and models transmit
//! credit, so the bridge can be driven without a radio. Completions are not
//! generated; whoever drives the simulation feeds `RawEvent`s back in.

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::config::ManagerOptions;
use crate::core::bt_uuid::BtUuid;
use crate::core::central::types::{CharacteristicProperties, ConnectOptions, ScanOptions, WriteKind};
use crate::core::constants::DEFAULT_ATT_PAYLOAD;
use crate::core::native::{
    NativeAttRequest, NativeCentral, NativeCharacteristic, NativeDescriptor, NativeLocalCharacteristic,
    NativeLocalDescriptor, NativeLocalService, NativePeripheral, NativeRef, NativeService, NativeStack,
};
use crate::core::peripheral::types::{AdvertisementData, AttError, ConnectionLatency, MutableService};

/// One recorded command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    CreateCentralManager { options: ManagerOptions },
    CreatePeripheralManager { options: ManagerOptions },
    Scan { services: Vec<BtUuid>, options: ScanOptions },
    StopScan,
    Connect { peripheral: NativeRef, options: ConnectOptions },
    CancelConnect { peripheral: NativeRef },
    DiscoverServices { peripheral: NativeRef, filter: Vec<BtUuid> },
    DiscoverIncludedServices { service: NativeRef, filter: Vec<BtUuid> },
    DiscoverCharacteristics { service: NativeRef, filter: Vec<BtUuid> },
    DiscoverDescriptors { characteristic: NativeRef },
    ReadCharacteristic { characteristic: NativeRef },
    ReadDescriptor { descriptor: NativeRef },
    WriteCharacteristic { characteristic: NativeRef, value: Vec<u8>, kind: WriteKind },
    WriteDescriptor { descriptor: NativeRef, value: Vec<u8> },
    SetNotify { characteristic: NativeRef, enabled: bool },
    ReadRssi { peripheral: NativeRef },
    AddService { service: NativeRef },
    RemoveService { service: NativeRef },
    RemoveAllServices,
    StartAdvertising { data: AdvertisementData },
    StopAdvertising,
    UpdateValue { characteristic: NativeRef, value: Vec<u8>, centrals: Vec<NativeRef>, accepted: bool },
    RespondToRequest { request: NativeRef, value: Option<Vec<u8>>, result: AttError },
    SetConnectionLatency { latency: ConnectionLatency, central: NativeRef },
}

struct KnownPeripheral {
    peripheral: NativePeripheral,
    services: Vec<BtUuid>,
    connected: bool,
}

struct SimState {
    next_ref: u64,
    calls: Vec<SimCall>,
    retained: HashMap<NativeRef, usize>,
    central_manager: Option<NativeRef>,
    peripheral_manager: Option<NativeRef>,
    known: Vec<KnownPeripheral>,
    /// `None` means unlimited.
    write_credit: Option<usize>,
    update_credit: Option<usize>,
    write_overruns: usize,
    max_write_len: usize,
    allocated: Vec<NativeLocalService>,
}

impl SimState {
    fn alloc(&mut self) -> NativeRef {
        self.next_ref += 1;
        NativeRef(self.next_ref)
    }
}

pub struct SimulatedStack {
    state: Mutex<SimState>,
}

impl Default for SimulatedStack {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedStack {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                next_ref: 0x1000,
                calls: Vec::new(),
                retained: HashMap::new(),
                central_manager: None,
                peripheral_manager: None,
                known: Vec::new(),
                write_credit: None,
                update_credit: None,
                write_overruns: 0,
                max_write_len: DEFAULT_ATT_PAYLOAD,
                allocated: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: SimCall) {
        self.lock().calls.push(call);
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.lock().calls.clone()
    }

    pub fn central_manager(&self) -> Option<NativeRef> {
        self.lock().central_manager
    }

    pub fn peripheral_manager(&self) -> Option<NativeRef> {
        self.lock().peripheral_manager
    }

    pub fn retain_count(&self, object: NativeRef) -> usize {
        self.lock().retained.get(&object).copied().unwrap_or(0)
    }

    /// Objects currently retained by the bridge.
    pub fn live_objects(&self) -> usize {
        self.lock().retained.values().filter(|count| **count > 0).count()
    }

    /// Limits writes without response; `None` lifts the limit.
    pub fn set_write_credit(&self, credit: Option<usize>) {
        self.lock().write_credit = credit;
    }

    pub fn add_write_credit(&self, credit: usize) {
        let mut state = self.lock();
        if let Some(current) = state.write_credit.as_mut() {
            *current += credit;
        }
    }

    /// Limits accepted value updates; `None` lifts the limit.
    pub fn set_update_credit(&self, credit: Option<usize>) {
        self.lock().update_credit = credit;
    }

    /// Writes without response issued while the stack had no credit.
    pub fn write_overruns(&self) -> usize {
        self.lock().write_overruns
    }

    pub fn set_max_write_len(&self, len: usize) {
        self.lock().max_write_len = len;
    }

    /// Values written to `characteristic`, in order.
    pub fn written_values(&self, characteristic: NativeRef) -> Vec<Vec<u8>> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                SimCall::WriteCharacteristic {
                    characteristic: target,
                    value,
                    ..
                } if *target == characteristic => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    /// Values the stack accepted for `characteristic`, in order.
    pub fn updated_values(&self, characteristic: NativeRef) -> Vec<Vec<u8>> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                SimCall::UpdateValue {
                    characteristic: target,
                    value,
                    accepted: true,
                    ..
                } if *target == characteristic => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    /// Local service trees built so far, in allocation order.
    pub fn allocated_services(&self) -> Vec<NativeLocalService> {
        self.lock().allocated.clone()
    }

    pub fn new_peripheral(&self, name: Option<&str>) -> NativePeripheral {
        let mut state = self.lock();
        let object = state.alloc();
        NativePeripheral {
            object,
            identifier: Uuid::from_u128(0x5eed_0000_0000_0000_0000_0000_0000_0000 | object.0 as u128),
            name: name.map(str::to_string),
        }
    }

    /// Makes `peripheral` retrievable, exposing `services`.
    pub fn add_known_peripheral(&self, peripheral: NativePeripheral, services: &[BtUuid]) {
        self.lock().known.push(KnownPeripheral {
            peripheral,
            services: services.to_vec(),
            connected: false,
        });
    }

    pub fn set_connected(&self, peripheral: NativeRef, connected: bool) {
        let mut state = self.lock();
        for known in state
            .known
            .iter_mut()
            .filter(|known| known.peripheral.object == peripheral)
        {
            known.connected = connected;
        }
    }

    pub fn new_service(&self, uuid: BtUuid, primary: bool) -> NativeService {
        NativeService {
            object: self.lock().alloc(),
            uuid,
            primary,
        }
    }

    pub fn new_characteristic(&self, uuid: BtUuid, properties: CharacteristicProperties) -> NativeCharacteristic {
        NativeCharacteristic {
            object: self.lock().alloc(),
            uuid,
            properties,
            notifying: false,
        }
    }

    pub fn new_descriptor(&self, uuid: BtUuid) -> NativeDescriptor {
        NativeDescriptor {
            object: self.lock().alloc(),
            uuid,
        }
    }

    pub fn new_central(&self, maximum_update_length: usize) -> NativeCentral {
        let object = self.lock().alloc();
        NativeCentral {
            object,
            identifier: Uuid::from_u128(0xce27_0000_0000_0000_0000_0000_0000_0000 | object.0 as u128),
            maximum_update_length,
        }
    }

    pub fn new_request(
        &self,
        central: NativeCentral,
        characteristic: NativeRef,
        offset: usize,
        value: Vec<u8>,
    ) -> NativeAttRequest {
        NativeAttRequest {
            object: self.lock().alloc(),
            central,
            characteristic,
            offset,
            value,
        }
    }

    fn alloc_tree(state: &mut SimState, service: &MutableService) -> NativeLocalService {
        let object = state.alloc();
        let characteristics = service
            .characteristics
            .iter()
            .map(|chr| NativeLocalCharacteristic {
                object: state.alloc(),
                uuid: chr.uuid,
                properties: chr.properties,
                permissions: chr.permissions,
                value: chr.value.clone(),
                descriptors: chr
                    .descriptors
                    .iter()
                    .map(|dsc| NativeLocalDescriptor {
                        object: state.alloc(),
                        uuid: dsc.uuid,
                        value: dsc.value.clone(),
                    })
                    .collect(),
            })
            .collect();
        let included = service
            .included
            .iter()
            .map(|inner| Self::alloc_tree(state, inner))
            .collect();
        NativeLocalService {
            object,
            uuid: service.uuid,
            primary: service.primary,
            characteristics,
            included,
        }
    }
}

impl NativeStack for SimulatedStack {
    fn create_central_manager(&self, options: &ManagerOptions) -> NativeRef {
        let mut state = self.lock();
        let manager = state.alloc();
        state.central_manager = Some(manager);
        state.calls.push(SimCall::CreateCentralManager {
            options: options.clone(),
        });
        manager
    }

    fn create_peripheral_manager(&self, options: &ManagerOptions) -> NativeRef {
        let mut state = self.lock();
        let manager = state.alloc();
        state.peripheral_manager = Some(manager);
        state.calls.push(SimCall::CreatePeripheralManager {
            options: options.clone(),
        });
        manager
    }

    fn retain(&self, object: NativeRef) {
        *self.lock().retained.entry(object).or_insert(0) += 1;
    }

    fn release(&self, object: NativeRef) {
        let mut state = self.lock();
        match state.retained.get_mut(&object) {
            Some(count) if *count > 0 => *count -= 1,
            _ => warn!("Release of unretained object {:?}", object),
        }
    }

    fn scan(&self, _manager: NativeRef, services: &[BtUuid], options: &ScanOptions) {
        self.record(SimCall::Scan {
            services: services.to_vec(),
            options: options.clone(),
        });
    }

    fn stop_scan(&self, _manager: NativeRef) {
        self.record(SimCall::StopScan);
    }

    fn connect(&self, _manager: NativeRef, peripheral: NativeRef, options: &ConnectOptions) {
        self.record(SimCall::Connect {
            peripheral,
            options: options.clone(),
        });
    }

    fn cancel_connect(&self, _manager: NativeRef, peripheral: NativeRef) {
        self.record(SimCall::CancelConnect { peripheral });
    }

    fn retrieve_connected_peripherals(&self, _manager: NativeRef, services: &[BtUuid]) -> Vec<NativePeripheral> {
        self.lock()
            .known
            .iter()
            .filter(|known| known.connected)
            .filter(|known| services.is_empty() || known.services.iter().any(|s| services.contains(s)))
            .map(|known| known.peripheral.clone())
            .collect()
    }

    fn retrieve_peripherals(&self, _manager: NativeRef, identifiers: &[Uuid]) -> Vec<NativePeripheral> {
        let state = self.lock();
        identifiers
            .iter()
            .filter_map(|id| {
                state
                    .known
                    .iter()
                    .find(|known| known.peripheral.identifier == *id)
                    .map(|known| known.peripheral.clone())
            })
            .collect()
    }

    fn discover_services(&self, peripheral: NativeRef, filter: &[BtUuid]) {
        self.record(SimCall::DiscoverServices {
            peripheral,
            filter: filter.to_vec(),
        });
    }

    fn discover_included_services(&self, _peripheral: NativeRef, service: NativeRef, filter: &[BtUuid]) {
        self.record(SimCall::DiscoverIncludedServices {
            service,
            filter: filter.to_vec(),
        });
    }

    fn discover_characteristics(&self, _peripheral: NativeRef, service: NativeRef, filter: &[BtUuid]) {
        self.record(SimCall::DiscoverCharacteristics {
            service,
            filter: filter.to_vec(),
        });
    }

    fn discover_descriptors(&self, _peripheral: NativeRef, characteristic: NativeRef) {
        self.record(SimCall::DiscoverDescriptors { characteristic });
    }

    fn read_characteristic(&self, _peripheral: NativeRef, characteristic: NativeRef) {
        self.record(SimCall::ReadCharacteristic { characteristic });
    }

    fn read_descriptor(&self, _peripheral: NativeRef, descriptor: NativeRef) {
        self.record(SimCall::ReadDescriptor { descriptor });
    }

    fn write_characteristic(&self, _peripheral: NativeRef, characteristic: NativeRef, value: &[u8], kind: WriteKind) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if kind == WriteKind::WithoutResponse {
            match state.write_credit.as_mut() {
                Some(0) => {
                    state.write_overruns += 1;
                    debug!("Write without response past transmit capacity");
                }
                Some(credit) => *credit -= 1,
                None => {}
            }
        }
        state.calls.push(SimCall::WriteCharacteristic {
            characteristic,
            value: value.to_vec(),
            kind,
        });
    }

    fn write_descriptor(&self, _peripheral: NativeRef, descriptor: NativeRef, value: &[u8]) {
        self.record(SimCall::WriteDescriptor {
            descriptor,
            value: value.to_vec(),
        });
    }

    fn set_notify(&self, _peripheral: NativeRef, characteristic: NativeRef, enabled: bool) {
        self.record(SimCall::SetNotify {
            characteristic,
            enabled,
        });
    }

    fn read_rssi(&self, peripheral: NativeRef) {
        self.record(SimCall::ReadRssi { peripheral });
    }

    fn max_write_len(&self, _peripheral: NativeRef, kind: WriteKind) -> usize {
        match kind {
            WriteKind::WithResponse => 512,
            WriteKind::WithoutResponse => self.lock().max_write_len,
        }
    }

    fn can_send_write_without_response(&self, _peripheral: NativeRef) -> bool {
        self.lock().write_credit.is_none_or(|credit| credit > 0)
    }

    fn alloc_service(&self, service: &MutableService) -> NativeLocalService {
        let mut state = self.lock();
        let native = Self::alloc_tree(&mut state, service);
        state.allocated.push(native.clone());
        native
    }

    fn add_service(&self, _manager: NativeRef, service: NativeRef) {
        self.record(SimCall::AddService { service });
    }

    fn remove_service(&self, _manager: NativeRef, service: NativeRef) {
        self.record(SimCall::RemoveService { service });
    }

    fn remove_all_services(&self, _manager: NativeRef) {
        self.record(SimCall::RemoveAllServices);
    }

    fn start_advertising(&self, _manager: NativeRef, data: &AdvertisementData) {
        self.record(SimCall::StartAdvertising { data: data.clone() });
    }

    fn stop_advertising(&self, _manager: NativeRef) {
        self.record(SimCall::StopAdvertising);
    }

    fn update_value(
        &self,
        _manager: NativeRef,
        value: &[u8],
        characteristic: NativeRef,
        centrals: &[NativeRef],
    ) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        let accepted = match state.update_credit.as_mut() {
            Some(0) => false,
            Some(credit) => {
                *credit -= 1;
                true
            }
            None => true,
        };
        state.calls.push(SimCall::UpdateValue {
            characteristic,
            value: value.to_vec(),
            centrals: centrals.to_vec(),
            accepted,
        });
        accepted
    }

    fn respond_to_request(
        &self,
        _manager: NativeRef,
        request: NativeRef,
        value: Option<&[u8]>,
        result: AttError,
    ) {
        self.record(SimCall::RespondToRequest {
            request,
            value: value.map(<[u8]>::to_vec),
            result,
        });
    }

    fn set_connection_latency(&self, _manager: NativeRef, latency: ConnectionLatency, central: NativeRef) {
        self.record(SimCall::SetConnectionLatency { latency, central });
    }
}
