//! Remote GATT discovery and attribute I/O.
//!
//! Every discovery completion replaces the parent's child list with exactly
//! what was reported: children reported again keep their handles (and their
//! own children), children no longer reported are invalidated together with
//! their subtrees.

use std::collections::HashSet;

use log::{debug, warn};

use crate::core::bridge::{BridgeCore, Entity};
use crate::core::bt_uuid::BtUuid;
use crate::core::central::types::{
    CharacteristicEntity, DescriptorEntity, PeripheralState, QueuedWrite, ServiceEntity,
    ServiceParent, WriteKind, WriteOutcome,
};
use crate::core::error::{BridgeError, Result, TransportError};
use crate::core::events::BridgeEvent;
use crate::core::handle::Handle;
use crate::core::native::{NativeCharacteristic, NativeDescriptor, NativeRef, NativeService};
use crate::core::pending::OperationKind;
use crate::utils::hex;

impl BridgeCore {
    /// Native reference of a peripheral that is connected and usable.
    fn connected_peripheral(&self, peripheral: Handle) -> Result<NativeRef> {
        self.central_ready()?;
        if self.peripheral(peripheral)?.state != PeripheralState::Connected {
            return Err(BridgeError::NotConnected(peripheral));
        }
        self.registry.native(peripheral)
    }

    /// (owning peripheral, its native reference, the characteristic's native reference)
    fn characteristic_target(&self, characteristic: Handle) -> Result<(Handle, NativeRef, NativeRef)> {
        let peripheral = self.characteristic(characteristic)?.peripheral;
        let peripheral_native = self.connected_peripheral(peripheral)?;
        Ok((peripheral, peripheral_native, self.registry.native(characteristic)?))
    }

    fn descriptor_target(&self, descriptor: Handle) -> Result<(Handle, NativeRef, NativeRef)> {
        let peripheral = self.descriptor(descriptor)?.peripheral;
        let peripheral_native = self.connected_peripheral(peripheral)?;
        Ok((peripheral, peripheral_native, self.registry.native(descriptor)?))
    }

    fn service_target(&self, service: Handle) -> Result<(Handle, NativeRef, NativeRef)> {
        let peripheral = self.service(service)?.peripheral;
        let peripheral_native = self.connected_peripheral(peripheral)?;
        Ok((peripheral, peripheral_native, self.registry.native(service)?))
    }

    pub fn discover_services(&mut self, peripheral: Handle, filter: &[BtUuid]) -> Result<()> {
        let native = self.connected_peripheral(peripheral)?;
        self.pending
            .begin(peripheral, OperationKind::DiscoverServices, peripheral)?;
        self.stack.discover_services(native, filter);
        debug!("Discovering services on {}", peripheral);
        Ok(())
    }

    pub fn discover_included_services(&mut self, service: Handle, filter: &[BtUuid]) -> Result<()> {
        let (peripheral, peripheral_native, native) = self.service_target(service)?;
        self.pending
            .begin(service, OperationKind::DiscoverIncludedServices, peripheral)?;
        self.stack
            .discover_included_services(peripheral_native, native, filter);
        Ok(())
    }

    pub fn discover_characteristics(&mut self, service: Handle, filter: &[BtUuid]) -> Result<()> {
        let (peripheral, peripheral_native, native) = self.service_target(service)?;
        self.pending
            .begin(service, OperationKind::DiscoverCharacteristics, peripheral)?;
        self.stack
            .discover_characteristics(peripheral_native, native, filter);
        debug!("Discovering characteristics of {}", service);
        Ok(())
    }

    pub fn discover_descriptors(&mut self, characteristic: Handle) -> Result<()> {
        let (peripheral, peripheral_native, native) = self.characteristic_target(characteristic)?;
        self.pending
            .begin(characteristic, OperationKind::DiscoverDescriptors, peripheral)?;
        self.stack.discover_descriptors(peripheral_native, native);
        Ok(())
    }

    pub fn read_characteristic(&mut self, characteristic: Handle) -> Result<()> {
        let (peripheral, peripheral_native, native) = self.characteristic_target(characteristic)?;
        self.pending
            .begin(characteristic, OperationKind::ReadCharacteristic, peripheral)?;
        self.stack.read_characteristic(peripheral_native, native);
        Ok(())
    }

    pub fn read_descriptor(&mut self, descriptor: Handle) -> Result<()> {
        let (peripheral, peripheral_native, native) = self.descriptor_target(descriptor)?;
        self.pending
            .begin(descriptor, OperationKind::ReadDescriptor, peripheral)?;
        self.stack.read_descriptor(peripheral_native, native);
        Ok(())
    }

    /// Writes with response complete through `CharacteristicWritten`.
    /// Writes without response go out at once while the stack has transmit
    /// credit and nothing is queued ahead of them; otherwise they wait in
    /// the peripheral's queue.
    pub fn write_characteristic(
        &mut self,
        characteristic: Handle,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<WriteOutcome> {
        let (peripheral, peripheral_native, native) = self.characteristic_target(characteristic)?;
        match kind {
            WriteKind::WithResponse => {
                self.pending
                    .begin(characteristic, OperationKind::WriteCharacteristic, peripheral)?;
                self.stack
                    .write_characteristic(peripheral_native, native, value, kind);
                Ok(WriteOutcome::Sent)
            }
            WriteKind::WithoutResponse => {
                let queue_empty = self.peripheral(peripheral)?.write_queue.is_empty();
                if queue_empty && self.stack.can_send_write_without_response(peripheral_native) {
                    self.stack
                        .write_characteristic(peripheral_native, native, value, kind);
                    return Ok(WriteOutcome::Sent);
                }
                let queue = &mut self.peripheral_mut(peripheral)?.write_queue;
                queue.push_back(QueuedWrite {
                    characteristic,
                    value: value.to_vec(),
                });
                debug!("Queued write to {} ({} waiting)", characteristic, queue.len());
                Ok(WriteOutcome::Queued)
            }
        }
    }

    pub fn write_descriptor(&mut self, descriptor: Handle, value: &[u8]) -> Result<()> {
        let (peripheral, peripheral_native, native) = self.descriptor_target(descriptor)?;
        self.pending
            .begin(descriptor, OperationKind::WriteDescriptor, peripheral)?;
        self.stack.write_descriptor(peripheral_native, native, value);
        Ok(())
    }

    pub fn set_notify(&mut self, characteristic: Handle, enabled: bool) -> Result<()> {
        let (peripheral, peripheral_native, native) = self.characteristic_target(characteristic)?;
        self.pending
            .begin(characteristic, OperationKind::SetNotify, peripheral)?;
        self.stack.set_notify(peripheral_native, native, enabled);
        Ok(())
    }

    pub fn read_rssi(&mut self, peripheral: Handle) -> Result<()> {
        let native = self.connected_peripheral(peripheral)?;
        self.pending
            .begin(peripheral, OperationKind::ReadRssi, peripheral)?;
        self.stack.read_rssi(native);
        Ok(())
    }

    /// Largest value a single write of `kind` can carry.
    pub fn max_write_len(&self, peripheral: Handle, kind: WriteKind) -> Result<usize> {
        self.central_ready()?;
        self.peripheral(peripheral)?;
        Ok(self.stack.max_write_len(self.registry.native(peripheral)?, kind))
    }

    /// Writes without response still waiting for transmit credit.
    pub fn queued_writes(&self, peripheral: Handle) -> Result<usize> {
        Ok(self.peripheral(peripheral)?.write_queue.len())
    }

    fn register_service(&mut self, peripheral: Handle, parent: ServiceParent, native: NativeService) -> Handle {
        let (handle, inserted) = self.register(native.object, || {
            Entity::Service(ServiceEntity {
                peripheral,
                parent,
                uuid: native.uuid,
                primary: native.primary,
                characteristics: Vec::new(),
                included: Vec::new(),
            })
        });
        // A service reported at the top level belongs to the peripheral from now on.
        if !inserted && parent == ServiceParent::Peripheral {
            if let Ok(service) = self.service_mut(handle) {
                service.parent = ServiceParent::Peripheral;
            }
        }
        handle
    }

    /// Drops dead handles from the included lists of every service still
    /// reachable from `peripheral`. A service can be listed by more than one
    /// including service, so removing it from its owner is not enough.
    fn prune_included(&mut self, peripheral: Handle) {
        let mut queue: Vec<Handle> = self
            .peripheral(peripheral)
            .map(|p| p.services.clone())
            .unwrap_or_default();
        let mut visited = HashSet::new();
        while let Some(service) = queue.pop() {
            if !visited.insert(service) {
                continue;
            }
            let Ok(entity) = self.service(service) else {
                continue;
            };
            let live: Vec<Handle> = entity
                .included
                .iter()
                .copied()
                .filter(|included| self.registry.contains(*included))
                .collect();
            if live.len() != entity.included.len() {
                debug!(
                    "Pruned {} dead included services from {}",
                    entity.included.len() - live.len(),
                    service
                );
            }
            queue.extend(live.iter().copied());
            if let Ok(entity) = self.service_mut(service) {
                entity.included = live;
            }
        }
    }

    pub(crate) fn on_services_discovered(
        &mut self,
        peripheral: NativeRef,
        services: Vec<NativeService>,
        error: Option<TransportError>,
    ) {
        let Some(handle) = self.lookup_or_drop(peripheral, "service discovery") else {
            return;
        };
        self.pending.complete(handle, OperationKind::DiscoverServices);
        let current = match self.peripheral(handle) {
            Ok(entity) => entity.services.clone(),
            Err(e) => {
                self.diagnostics_mut()
                    .dropped_event(format!("service discovery: {}", e));
                return;
            }
        };

        let services = if error.is_some() {
            current
        } else {
            let reported: Vec<Handle> = services
                .into_iter()
                .map(|native| self.register_service(handle, ServiceParent::Peripheral, native))
                .collect();
            for stale in current.iter().filter(|h| !reported.contains(h)) {
                let owned = self
                    .service(*stale)
                    .is_ok_and(|s| s.parent == ServiceParent::Peripheral);
                if owned {
                    self.invalidate_subtree(*stale);
                }
            }
            if let Ok(entity) = self.peripheral_mut(handle) {
                entity.services = reported.clone();
            }
            self.prune_included(handle);
            reported
        };

        debug!("Peripheral {} has {} services", handle, services.len());
        self.emit(BridgeEvent::ServicesDiscovered {
            peripheral: handle,
            services,
            error,
        });
    }

    pub(crate) fn on_included_services_discovered(
        &mut self,
        _peripheral: NativeRef,
        service: NativeRef,
        included: Vec<NativeService>,
        error: Option<TransportError>,
    ) {
        let Some(handle) = self.lookup_or_drop(service, "included service discovery") else {
            return;
        };
        self.pending
            .complete(handle, OperationKind::DiscoverIncludedServices);
        let (peripheral, current) = match self.service(handle) {
            Ok(entity) => (entity.peripheral, entity.included.clone()),
            Err(e) => {
                self.diagnostics_mut()
                    .dropped_event(format!("included service discovery: {}", e));
                return;
            }
        };

        let included = if error.is_some() {
            current
        } else {
            let reported: Vec<Handle> = included
                .into_iter()
                .map(|native| self.register_service(peripheral, ServiceParent::Service(handle), native))
                .collect();
            for stale in current.iter().filter(|h| !reported.contains(h)) {
                let owned = self
                    .service(*stale)
                    .is_ok_and(|s| s.parent == ServiceParent::Service(handle));
                if owned {
                    self.invalidate_subtree(*stale);
                }
            }
            if let Ok(entity) = self.service_mut(handle) {
                entity.included = reported.clone();
            }
            self.prune_included(peripheral);
            reported
        };

        self.emit(BridgeEvent::IncludedServicesDiscovered {
            service: handle,
            included,
            error,
        });
    }

    pub(crate) fn on_characteristics_discovered(
        &mut self,
        _peripheral: NativeRef,
        service: NativeRef,
        characteristics: Vec<NativeCharacteristic>,
        error: Option<TransportError>,
    ) {
        let Some(handle) = self.lookup_or_drop(service, "characteristic discovery") else {
            return;
        };
        self.pending
            .complete(handle, OperationKind::DiscoverCharacteristics);
        let (peripheral, current) = match self.service(handle) {
            Ok(entity) => (entity.peripheral, entity.characteristics.clone()),
            Err(e) => {
                self.diagnostics_mut()
                    .dropped_event(format!("characteristic discovery: {}", e));
                return;
            }
        };

        let characteristics = if error.is_some() {
            current
        } else {
            let mut reported = Vec::with_capacity(characteristics.len());
            for native in characteristics {
                let (chr, inserted) = self.register(native.object, || {
                    Entity::Characteristic(CharacteristicEntity {
                        peripheral,
                        service: handle,
                        uuid: native.uuid,
                        properties: native.properties,
                        value: None,
                        notifying: native.notifying,
                        descriptors: Vec::new(),
                    })
                });
                if !inserted {
                    if let Ok(entity) = self.characteristic_mut(chr) {
                        entity.properties = native.properties;
                        entity.notifying = native.notifying;
                    }
                }
                reported.push(chr);
            }
            for stale in current.iter().filter(|h| !reported.contains(h)) {
                self.invalidate_subtree(*stale);
            }
            if let Ok(entity) = self.service_mut(handle) {
                entity.characteristics = reported.clone();
            }
            reported
        };

        debug!("Service {} has {} characteristics", handle, characteristics.len());
        self.emit(BridgeEvent::CharacteristicsDiscovered {
            service: handle,
            characteristics,
            error,
        });
    }

    pub(crate) fn on_descriptors_discovered(
        &mut self,
        _peripheral: NativeRef,
        characteristic: NativeRef,
        descriptors: Vec<NativeDescriptor>,
        error: Option<TransportError>,
    ) {
        let Some(handle) = self.lookup_or_drop(characteristic, "descriptor discovery") else {
            return;
        };
        self.pending
            .complete(handle, OperationKind::DiscoverDescriptors);
        let (peripheral, current) = match self.characteristic(handle) {
            Ok(entity) => (entity.peripheral, entity.descriptors.clone()),
            Err(e) => {
                self.diagnostics_mut()
                    .dropped_event(format!("descriptor discovery: {}", e));
                return;
            }
        };

        let descriptors = if error.is_some() {
            current
        } else {
            let reported: Vec<Handle> = descriptors
                .into_iter()
                .map(|native| {
                    self.register(native.object, || {
                        Entity::Descriptor(DescriptorEntity {
                            peripheral,
                            characteristic: handle,
                            uuid: native.uuid,
                            value: None,
                        })
                    })
                    .0
                })
                .collect();
            for stale in current.iter().filter(|h| !reported.contains(h)) {
                self.invalidate_subtree(*stale);
            }
            if let Ok(entity) = self.characteristic_mut(handle) {
                entity.descriptors = reported.clone();
            }
            reported
        };

        self.emit(BridgeEvent::DescriptorsDiscovered {
            characteristic: handle,
            descriptors,
            error,
        });
    }

    /// Read completions and notifications arrive here alike.
    ///
    /// The stack reports both through one callback and nothing tells them
    /// apart, so the first value after a read is taken as its completion.
    /// A notification racing a read therefore completes the read, and the
    /// read's own value then arrives as a plain update.
    pub(crate) fn on_characteristic_value(
        &mut self,
        _peripheral: NativeRef,
        characteristic: NativeRef,
        value: Vec<u8>,
        error: Option<TransportError>,
    ) {
        let Some(handle) = self.lookup_or_drop(characteristic, "characteristic value") else {
            return;
        };
        self.pending
            .complete(handle, OperationKind::ReadCharacteristic);
        match self.characteristic_mut(handle) {
            Ok(entity) => {
                if error.is_none() {
                    entity.value = Some(value.clone());
                }
            }
            Err(e) => {
                self.diagnostics_mut()
                    .dropped_event(format!("characteristic value: {}", e));
                return;
            }
        }
        debug!("Value for {}: {}", handle, hex(&value));
        self.emit(BridgeEvent::CharacteristicValueUpdated {
            characteristic: handle,
            value,
            error,
        });
    }

    pub(crate) fn on_descriptor_value(
        &mut self,
        _peripheral: NativeRef,
        descriptor: NativeRef,
        value: Vec<u8>,
        error: Option<TransportError>,
    ) {
        let Some(handle) = self.lookup_or_drop(descriptor, "descriptor value") else {
            return;
        };
        self.pending.complete(handle, OperationKind::ReadDescriptor);
        match self.descriptor_mut(handle) {
            Ok(entity) => {
                if error.is_none() {
                    entity.value = Some(value.clone());
                }
            }
            Err(e) => {
                self.diagnostics_mut()
                    .dropped_event(format!("descriptor value: {}", e));
                return;
            }
        }
        self.emit(BridgeEvent::DescriptorValueUpdated {
            descriptor: handle,
            value,
            error,
        });
    }

    pub(crate) fn on_characteristic_written(
        &mut self,
        _peripheral: NativeRef,
        characteristic: NativeRef,
        error: Option<TransportError>,
    ) {
        let Some(handle) = self.lookup_or_drop(characteristic, "characteristic write") else {
            return;
        };
        if let Err(e) = self.characteristic(handle) {
            self.diagnostics_mut()
                .dropped_event(format!("characteristic write: {}", e));
            return;
        }
        self.pending
            .complete(handle, OperationKind::WriteCharacteristic);
        self.emit(BridgeEvent::CharacteristicWritten {
            characteristic: handle,
            error,
        });
    }

    pub(crate) fn on_descriptor_written(
        &mut self,
        _peripheral: NativeRef,
        descriptor: NativeRef,
        error: Option<TransportError>,
    ) {
        let Some(handle) = self.lookup_or_drop(descriptor, "descriptor write") else {
            return;
        };
        if let Err(e) = self.descriptor(handle) {
            self.diagnostics_mut()
                .dropped_event(format!("descriptor write: {}", e));
            return;
        }
        self.pending.complete(handle, OperationKind::WriteDescriptor);
        self.emit(BridgeEvent::DescriptorWritten {
            descriptor: handle,
            error,
        });
    }

    /// Drains queued writes in issue order while the stack has credit.
    pub(crate) fn on_ready_to_send(&mut self, peripheral: NativeRef) {
        let Some(handle) = self.lookup_or_drop(peripheral, "ready to send") else {
            return;
        };
        if let Err(e) = self.peripheral(handle) {
            self.diagnostics_mut()
                .dropped_event(format!("ready to send: {}", e));
            return;
        }

        let mut flushed = 0;
        loop {
            let has_queued = self
                .peripheral(handle)
                .is_ok_and(|entity| !entity.write_queue.is_empty());
            if !has_queued || !self.stack.can_send_write_without_response(peripheral) {
                break;
            }
            let Some(write) = self
                .peripheral_mut(handle)
                .ok()
                .and_then(|entity| entity.write_queue.pop_front())
            else {
                break;
            };
            match self.registry.native(write.characteristic) {
                Ok(characteristic) => {
                    self.stack.write_characteristic(
                        peripheral,
                        characteristic,
                        &write.value,
                        WriteKind::WithoutResponse,
                    );
                    flushed += 1;
                }
                Err(_) => warn!(
                    "Skipping queued write to invalidated characteristic {}",
                    write.characteristic
                ),
            }
        }

        let still_queued = self
            .peripheral(handle)
            .map_or(0, |entity| entity.write_queue.len());
        debug!(
            "Flushed {} queued writes to {}, {} still queued",
            flushed, handle, still_queued
        );
        self.emit(BridgeEvent::ReadyToSendWriteWithoutResponse {
            peripheral: handle,
            flushed,
            still_queued,
        });
    }

    pub(crate) fn on_notification_state(
        &mut self,
        _peripheral: NativeRef,
        characteristic: NativeRef,
        notifying: bool,
        error: Option<TransportError>,
    ) {
        let Some(handle) = self.lookup_or_drop(characteristic, "notification state") else {
            return;
        };
        self.pending.complete(handle, OperationKind::SetNotify);
        match self.characteristic_mut(handle) {
            Ok(entity) => {
                if error.is_none() {
                    entity.notifying = notifying;
                }
            }
            Err(e) => {
                self.diagnostics_mut()
                    .dropped_event(format!("notification state: {}", e));
                return;
            }
        }
        self.emit(BridgeEvent::NotificationStateUpdated {
            characteristic: handle,
            notifying,
            error,
        });
    }

    pub(crate) fn on_rssi(&mut self, peripheral: NativeRef, rssi: i16, error: Option<TransportError>) {
        let Some(handle) = self.lookup_or_drop(peripheral, "rssi") else {
            return;
        };
        self.pending.complete(handle, OperationKind::ReadRssi);
        self.emit(BridgeEvent::RssiRead {
            peripheral: handle,
            rssi,
            error,
        });
    }

    pub(crate) fn on_name(&mut self, peripheral: NativeRef, name: Option<String>) {
        let Some(handle) = self.lookup_or_drop(peripheral, "name update") else {
            return;
        };
        match self.peripheral_mut(handle) {
            Ok(entity) => entity.name = name.clone(),
            Err(e) => {
                self.diagnostics_mut()
                    .dropped_event(format!("name update: {}", e));
                return;
            }
        }
        self.emit(BridgeEvent::PeripheralNameUpdated {
            peripheral: handle,
            name,
        });
    }

    /// The remote GATT database changed; the listed services are gone.
    pub(crate) fn on_services_modified(&mut self, peripheral: NativeRef, invalidated: Vec<NativeRef>) {
        let Some(handle) = self.lookup_or_drop(peripheral, "services modified") else {
            return;
        };
        let mut removed = Vec::with_capacity(invalidated.len());
        for native in invalidated {
            let Some(service) = self.registry.lookup(native) else {
                continue;
            };
            let Ok(parent) = self.service(service).map(|s| s.parent) else {
                continue;
            };
            match parent {
                ServiceParent::Peripheral => {
                    if let Ok(entity) = self.peripheral_mut(handle) {
                        entity.services.retain(|s| *s != service);
                    }
                }
                ServiceParent::Service(including) => {
                    if let Ok(entity) = self.service_mut(including) {
                        entity.included.retain(|s| *s != service);
                    }
                }
            }
            self.invalidate_subtree(service);
            removed.push(service);
        }
        self.prune_included(handle);
        self.emit(BridgeEvent::ServicesModified {
            peripheral: handle,
            invalidated: removed,
        });
    }
}

#[cfg(test)]
mod tests {
    use crate::core::bridge::fixture::Fixture;
    use crate::core::bt_uuid::BtUuid;
    use crate::core::central::types::{CharacteristicProperties, WriteKind, WriteOutcome};
    use crate::core::error::{BridgeError, TransportError};
    use crate::core::events::BridgeEvent;
    use crate::core::native::{NativeCharacteristic, RawEvent};
    use crate::core::pending::OperationKind;
    use crate::core::sim::SimCall;
    use crate::core::types::EntityKind;

    const NOTIFY: CharacteristicProperties = CharacteristicProperties::NOTIFY;

    #[test]
    fn test_io_requires_connection() {
        let mut fixture = Fixture::powered();
        let (handle, _) = fixture.discover("Thermo");
        assert_eq!(
            fixture.core.discover_services(handle, &[]),
            Err(BridgeError::NotConnected(handle))
        );
        assert_eq!(fixture.core.read_rssi(handle), Err(BridgeError::NotConnected(handle)));
    }

    #[test]
    fn test_handles_of_wrong_kind_are_rejected() {
        let mut fixture = Fixture::powered();
        let (peripheral, _) = fixture.connected("Thermo");
        assert_eq!(
            fixture.core.read_characteristic(peripheral),
            Err(BridgeError::WrongKind {
                handle: peripheral,
                expected: EntityKind::Characteristic,
                actual: EntityKind::Peripheral,
            })
        );
    }

    #[test]
    fn test_rediscovery_keeps_surviving_handles() {
        let mut fixture = Fixture::powered();
        let peripheral = fixture.connected("Thermo");
        let services = fixture.services(peripheral, &[0x180f, 0x180a]);
        let battery = (services[0].0, services[0].1.object);
        let info = (services[1].0, services[1].1.object);
        let chrs = fixture.characteristics(peripheral.1, battery, &[0x2a19], NOTIFY);

        // Second report drops the device information service only.
        fixture.core.discover_services(peripheral.0, &[]).unwrap();
        fixture.core.handle_native(RawEvent::DidDiscoverServices {
            peripheral: peripheral.1,
            services: vec![services[0].1.clone()],
            error: None,
        });

        assert_eq!(
            fixture.events(),
            vec![BridgeEvent::ServicesDiscovered {
                peripheral: peripheral.0,
                services: vec![battery.0],
                error: None,
            }]
        );
        assert_eq!(fixture.core.service_info(battery.0).unwrap().characteristics, vec![chrs[0].0]);
        assert_eq!(fixture.core.service_info(info.0), Err(BridgeError::NotFound(info.0)));
        assert_eq!(fixture.stack.retain_count(info.1), 0);
    }

    #[test]
    fn test_characteristic_list_matches_latest_report() {
        let mut fixture = Fixture::powered();
        let peripheral = fixture.connected("Thermo");
        let services = fixture.services(peripheral, &[0x180f]);
        let service = (services[0].0, services[0].1.object);

        let first = fixture.characteristics(peripheral.1, service, &[0x2a19, 0x2a1a], NOTIFY);
        let extra = fixture
            .stack
            .new_characteristic(BtUuid::from_u16(0x2a1b), NOTIFY);
        let second: Vec<NativeCharacteristic> = vec![first[1].1.clone(), extra.clone()];

        fixture.core.discover_characteristics(service.0, &[]).unwrap();
        fixture.core.handle_native(RawEvent::DidDiscoverCharacteristics {
            peripheral: peripheral.1,
            service: service.1,
            characteristics: second,
            error: None,
        });

        let listed = fixture.core.service_info(service.0).unwrap().characteristics;
        let extra_handle = fixture.core.registry.lookup(extra.object).unwrap();
        assert_eq!(listed, vec![first[1].0, extra_handle]);
        assert_eq!(
            fixture.core.characteristic_info(first[0].0),
            Err(BridgeError::NotFound(first[0].0))
        );
    }

    #[test]
    fn test_failed_discovery_keeps_previous_list() {
        let mut fixture = Fixture::powered();
        let peripheral = fixture.connected("Thermo");
        let services = fixture.services(peripheral, &[0x180f]);

        fixture.core.discover_services(peripheral.0, &[]).unwrap();
        let error = TransportError::new("Unlikely error", 14);
        fixture.core.handle_native(RawEvent::DidDiscoverServices {
            peripheral: peripheral.1,
            services: vec![],
            error: Some(error.clone()),
        });
        assert_eq!(
            fixture.events(),
            vec![BridgeEvent::ServicesDiscovered {
                peripheral: peripheral.0,
                services: vec![services[0].0],
                error: Some(error),
            }]
        );
    }

    #[test]
    fn test_single_pending_read_per_characteristic() {
        let mut fixture = Fixture::powered();
        let peripheral = fixture.connected("Thermo");
        let services = fixture.services(peripheral, &[0x180f]);
        let chrs = fixture.characteristics(
            peripheral.1,
            (services[0].0, services[0].1.object),
            &[0x2a19],
            CharacteristicProperties::READ,
        );
        let (chr, native) = (chrs[0].0, chrs[0].1.object);

        fixture.core.read_characteristic(chr).unwrap();
        assert_eq!(
            fixture.core.read_characteristic(chr),
            Err(BridgeError::OperationInProgress {
                handle: chr,
                kind: OperationKind::ReadCharacteristic
            })
        );

        fixture.core.handle_native(RawEvent::DidUpdateValueForCharacteristic {
            peripheral: peripheral.1,
            characteristic: native,
            value: vec![87],
            error: None,
        });
        assert_eq!(fixture.core.characteristic_info(chr).unwrap().value, Some(vec![87]));
        fixture.core.read_characteristic(chr).unwrap();

        let reads = fixture
            .stack
            .calls()
            .iter()
            .filter(|call| matches!(call, SimCall::ReadCharacteristic { .. }))
            .count();
        assert_eq!(reads, 2);
    }

    #[test]
    fn test_thousand_unacknowledged_writes_arrive_in_order() {
        let mut fixture = Fixture::powered();
        let peripheral = fixture.connected("Sensor");
        let services = fixture.services(peripheral, &[0xfff0]);
        let chrs = fixture.characteristics(
            peripheral.1,
            (services[0].0, services[0].1.object),
            &[0xfff1],
            CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
        );
        let chr = chrs[0].0;
        fixture.stack.set_write_credit(Some(16));

        let mut queued = 0;
        for i in 0..1000u32 {
            match fixture
                .core
                .write_characteristic(chr, &i.to_le_bytes(), WriteKind::WithoutResponse)
                .unwrap()
            {
                WriteOutcome::Sent => {}
                WriteOutcome::Queued => queued += 1,
            }
        }
        assert_eq!(queued, 1000 - 16);

        while fixture.core.queued_writes(peripheral.0).unwrap() > 0 {
            fixture.stack.add_write_credit(50);
            fixture.core.handle_native(RawEvent::IsReadyToSendWriteWithoutResponse {
                peripheral: peripheral.1,
            });
        }

        let written: Vec<u32> = fixture
            .stack
            .written_values(chrs[0].1.object)
            .into_iter()
            .map(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            .collect();
        assert_eq!(written, (0..1000).collect::<Vec<_>>());
        assert_eq!(fixture.stack.write_overruns(), 0);
    }

    #[test]
    fn test_write_with_response_completes() {
        let mut fixture = Fixture::powered();
        let peripheral = fixture.connected("Sensor");
        let services = fixture.services(peripheral, &[0xfff0]);
        let chrs = fixture.characteristics(
            peripheral.1,
            (services[0].0, services[0].1.object),
            &[0xfff2],
            CharacteristicProperties::WRITE,
        );
        let chr = chrs[0].0;

        assert_eq!(
            fixture.core.write_characteristic(chr, &[1], WriteKind::WithResponse),
            Ok(WriteOutcome::Sent)
        );
        assert!(fixture.core.pending.is_pending(chr, OperationKind::WriteCharacteristic));
        fixture.core.handle_native(RawEvent::DidWriteValueForCharacteristic {
            peripheral: peripheral.1,
            characteristic: chrs[0].1.object,
            error: None,
        });
        assert!(fixture.core.pending.is_empty());
        assert_eq!(
            fixture.events(),
            vec![BridgeEvent::CharacteristicWritten {
                characteristic: chr,
                error: None
            }]
        );
    }

    #[test]
    fn test_included_services_owned_by_includer() {
        let mut fixture = Fixture::powered();
        let peripheral = fixture.connected("Thermo");
        let services = fixture.services(peripheral, &[0x180f, 0x180a]);
        let (outer, outer_native) = (services[0].0, services[0].1.object);
        let inner = fixture.stack.new_service(BtUuid::from_u16(0x1805), false);

        fixture.core.discover_included_services(outer, &[]).unwrap();
        fixture.core.handle_native(RawEvent::DidDiscoverIncludedServices {
            peripheral: peripheral.1,
            service: outer_native,
            // The top-level device information service is also included.
            included: vec![inner.clone(), services[1].1.clone()],
            error: None,
        });
        let inner_handle = fixture.core.registry.lookup(inner.object).unwrap();
        assert_eq!(
            fixture.core.service_info(outer).unwrap().included,
            vec![inner_handle, services[1].0]
        );

        // Dropping the includer takes its own included service along, but not
        // the one owned by the peripheral.
        fixture.core.discover_services(peripheral.0, &[]).unwrap();
        fixture.core.handle_native(RawEvent::DidDiscoverServices {
            peripheral: peripheral.1,
            services: vec![services[1].1.clone()],
            error: None,
        });
        assert_eq!(
            fixture.core.service_info(inner_handle),
            Err(BridgeError::NotFound(inner_handle))
        );
        assert!(fixture.core.service_info(services[1].0).is_ok());
    }

    #[test]
    fn test_rediscovery_prunes_dead_included_services() {
        let mut fixture = Fixture::powered();
        let peripheral = fixture.connected("Thermo");
        let services = fixture.services(peripheral, &[0x180f, 0x180a]);
        let (outer, outer_native) = (services[0].0, services[0].1.object);
        let (gone, gone_native) = (services[1].0, services[1].1.clone());

        fixture.core.discover_included_services(outer, &[]).unwrap();
        fixture.core.handle_native(RawEvent::DidDiscoverIncludedServices {
            peripheral: peripheral.1,
            service: outer_native,
            included: vec![gone_native],
            error: None,
        });
        assert_eq!(fixture.core.service_info(outer).unwrap().included, vec![gone]);

        fixture.core.discover_services(peripheral.0, &[]).unwrap();
        fixture.core.handle_native(RawEvent::DidDiscoverServices {
            peripheral: peripheral.1,
            services: vec![services[0].1.clone()],
            error: None,
        });
        assert_eq!(fixture.core.service_info(gone), Err(BridgeError::NotFound(gone)));
        assert!(fixture.core.service_info(outer).unwrap().included.is_empty());
    }

    #[test]
    fn test_notification_updates_cache_without_pending_read() {
        let mut fixture = Fixture::powered();
        let peripheral = fixture.connected("Band");
        let services = fixture.services(peripheral, &[0x180d]);
        let chrs = fixture.characteristics(
            peripheral.1,
            (services[0].0, services[0].1.object),
            &[0x2a37],
            NOTIFY,
        );
        let (chr, native) = (chrs[0].0, chrs[0].1.object);

        fixture.core.set_notify(chr, true).unwrap();
        fixture.core.handle_native(RawEvent::DidUpdateNotificationState {
            peripheral: peripheral.1,
            characteristic: native,
            notifying: true,
            error: None,
        });
        fixture.core.handle_native(RawEvent::DidUpdateValueForCharacteristic {
            peripheral: peripheral.1,
            characteristic: native,
            value: vec![0x00, 72],
            error: None,
        });

        let info = fixture.core.characteristic_info(chr).unwrap();
        assert!(info.notifying);
        assert_eq!(info.value, Some(vec![0x00, 72]));
        assert_eq!(fixture.events().len(), 2);
    }

    #[test]
    fn test_first_value_after_read_completes_it() {
        let mut fixture = Fixture::powered();
        let peripheral = fixture.connected("Band");
        let services = fixture.services(peripheral, &[0x180d]);
        let chrs = fixture.characteristics(
            peripheral.1,
            (services[0].0, services[0].1.object),
            &[0x2a37],
            NOTIFY | CharacteristicProperties::READ,
        );
        let (chr, native) = (chrs[0].0, chrs[0].1.object);

        fixture.core.read_characteristic(chr).unwrap();
        fixture.core.handle_native(RawEvent::DidUpdateValueForCharacteristic {
            peripheral: peripheral.1,
            characteristic: native,
            value: vec![0x00, 64],
            error: None,
        });
        assert!(fixture.core.pending.is_empty());
        assert_eq!(fixture.core.read_characteristic(chr), Ok(()));
    }

    #[test]
    fn test_services_modified_invalidates_listed_services() {
        let mut fixture = Fixture::powered();
        let peripheral = fixture.connected("Thermo");
        let services = fixture.services(peripheral, &[0x180f, 0x180a]);

        fixture.core.handle_native(RawEvent::DidModifyServices {
            peripheral: peripheral.1,
            invalidated: vec![services[0].1.object],
        });

        assert_eq!(
            fixture.events(),
            vec![BridgeEvent::ServicesModified {
                peripheral: peripheral.0,
                invalidated: vec![services[0].0],
            }]
        );
        assert_eq!(
            fixture.core.peripheral_info(peripheral.0).unwrap().services,
            vec![services[1].0]
        );
    }

    #[test]
    fn test_event_for_unknown_object_is_dropped() {
        let mut fixture = Fixture::powered();
        let stray = fixture.stack.new_characteristic(BtUuid::from_u16(0x2a19), NOTIFY);
        fixture.core.handle_native(RawEvent::DidUpdateValueForCharacteristic {
            peripheral: stray.object,
            characteristic: stray.object,
            value: vec![1],
            error: None,
        });
        assert!(fixture.events().is_empty());
        assert_eq!(
            fixture
                .core
                .diagnostics()
                .count(crate::core::diagnostics::DiagnosticKind::DroppedEvent),
            1
        );
    }

    #[test]
    fn test_stray_events_do_not_grow_diagnostics() {
        let mut config = crate::config::BridgeConfig::default();
        config.diagnostics_capacity = 8;
        let mut fixture = Fixture::with_config(config);
        let stray = fixture.stack.new_characteristic(BtUuid::from_u16(0x2a19), NOTIFY);
        for _ in 0..10_000 {
            fixture.core.handle_native(RawEvent::DidUpdateValueForCharacteristic {
                peripheral: stray.object,
                characteristic: stray.object,
                value: vec![1],
                error: None,
            });
        }
        let diagnostics = fixture.core.diagnostics();
        assert_eq!(diagnostics.records().count(), 8);
        assert_eq!(
            diagnostics.count(crate::core::diagnostics::DiagnosticKind::DroppedEvent),
            10_000
        );
    }
}
