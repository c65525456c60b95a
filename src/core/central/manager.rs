//! Central manager state, peripheral registration and object queries.

use log::{debug, info};
use uuid::Uuid;

use crate::core::bridge::{BridgeCore, Entity};
use crate::core::bt_uuid::BtUuid;
use crate::core::central::CentralState;
use crate::core::central::types::{
    CharacteristicInfo, DescriptorInfo, PeripheralEntity, PeripheralInfo, PeripheralState,
    ServiceInfo,
};
use crate::core::error::{BridgeError, Result};
use crate::core::events::BridgeEvent;
use crate::core::handle::Handle;
use crate::core::native::{NativePeripheral, NativeRef};
use crate::core::types::ManagerState;

impl BridgeCore {
    pub(crate) fn central_ref(&self) -> Result<&CentralState> {
        self.central.as_ref().ok_or(BridgeError::Disabled("central"))
    }

    pub(crate) fn central_ref_mut(&mut self) -> Result<&mut CentralState> {
        self.central.as_mut().ok_or(BridgeError::Disabled("central"))
    }

    /// The native manager, provided it is powered on.
    pub(crate) fn central_ready(&self) -> Result<NativeRef> {
        let central = self.central_ref()?;
        if !central.state.is_powered_on() {
            return Err(BridgeError::NotReady(central.state));
        }
        Ok(central.native)
    }

    pub fn central_manager(&self) -> Result<Handle> {
        Ok(self.central_ref()?.manager)
    }

    pub fn central_state(&self) -> Result<ManagerState> {
        Ok(self.central_ref()?.state)
    }

    pub fn is_scanning(&self) -> Result<bool> {
        Ok(self.central_ref()?.scanning)
    }

    /// Every peripheral currently known, in no particular order.
    pub fn peripherals(&self) -> Result<Vec<Handle>> {
        Ok(self.central_ref()?.by_identifier.values().copied().collect())
    }

    /// True when `manager` is our central manager; otherwise the event is dropped.
    pub(crate) fn is_central_manager(&mut self, manager: NativeRef, context: &str) -> bool {
        let known = self.central.as_ref().is_some_and(|c| c.native == manager);
        if !known {
            self.diagnostics_mut()
                .dropped_event(format!("{} from unknown central manager {:?}", context, manager));
        }
        known
    }

    /// Resolves a peripheral reported by the stack to its handle, reusing the
    /// handle already bound to the same device identifier. `initial` applies
    /// to new handles only; an existing handle keeps its connection state.
    pub(crate) fn register_peripheral(
        &mut self,
        native: &NativePeripheral,
        initial: PeripheralState,
    ) -> Handle {
        let existing = self
            .central
            .as_ref()
            .and_then(|c| c.by_identifier.get(&native.identifier).copied())
            .filter(|handle| self.peripheral(*handle).is_ok());

        if let Some(handle) = existing {
            if let Ok(previous) = self.registry.native(handle) {
                if previous != native.object {
                    debug!(
                        "Peripheral {} rebound from {:?} to {:?}",
                        handle, previous, native.object
                    );
                    if self.registry.rebind(handle, native.object).is_ok() {
                        self.stack.retain(native.object);
                        self.stack.release(previous);
                    }
                }
            }
            if let Ok(peripheral) = self.peripheral_mut(handle) {
                if native.name.is_some() {
                    peripheral.name = native.name.clone();
                }
            }
            return handle;
        }

        let (handle, _) = self.register(native.object, || {
            Entity::Peripheral(PeripheralEntity::new(
                native.identifier,
                native.name.clone(),
                initial,
            ))
        });
        if let Some(central) = self.central.as_mut() {
            central.by_identifier.insert(native.identifier, handle);
        }
        handle
    }

    /// Peripherals the system already holds a connection to that expose any of `services`.
    ///
    /// A system-level link is not a connection of this bridge: new handles
    /// start `Disconnected` and still need `connect`.
    pub fn retrieve_connected_peripherals(&mut self, services: &[BtUuid]) -> Result<Vec<Handle>> {
        let manager = self.central_ready()?;
        let found = self.stack.retrieve_connected_peripherals(manager, services);
        debug!("Retrieved {} connected peripherals", found.len());
        Ok(found
            .iter()
            .map(|native| self.register_peripheral(native, PeripheralState::Disconnected))
            .collect())
    }

    /// Peripherals known to the system under `identifiers`; unknown identifiers are skipped.
    pub fn retrieve_peripherals(&mut self, identifiers: &[Uuid]) -> Result<Vec<Handle>> {
        let manager = self.central_ready()?;
        let found = self.stack.retrieve_peripherals(manager, identifiers);
        debug!(
            "Retrieved {} of {} requested peripherals",
            found.len(),
            identifiers.len()
        );
        Ok(found
            .iter()
            .map(|native| self.register_peripheral(native, PeripheralState::Disconnected))
            .collect())
    }

    /// Drops the peripheral and everything discovered on it. A live
    /// connection is cancelled first.
    pub fn release_peripheral(&mut self, peripheral: Handle) -> Result<()> {
        let manager = self.central_ref()?.native;
        let state = self.peripheral(peripheral)?.state;
        if state != PeripheralState::Disconnected {
            let native = self.registry.native(peripheral)?;
            self.stack.cancel_connect(manager, native);
        }
        self.invalidate_subtree(peripheral);
        info!("Released peripheral {}", peripheral);
        Ok(())
    }

    pub fn peripheral_info(&self, handle: Handle) -> Result<PeripheralInfo> {
        let peripheral = self.peripheral(handle)?;
        Ok(PeripheralInfo {
            handle,
            identifier: peripheral.identifier,
            name: peripheral.name.clone(),
            state: peripheral.state,
            services: peripheral.services.clone(),
        })
    }

    pub fn service_info(&self, handle: Handle) -> Result<ServiceInfo> {
        let service = self.service(handle)?;
        Ok(ServiceInfo {
            handle,
            peripheral: service.peripheral,
            uuid: service.uuid,
            primary: service.primary,
            characteristics: service.characteristics.clone(),
            included: service.included.clone(),
        })
    }

    pub fn characteristic_info(&self, handle: Handle) -> Result<CharacteristicInfo> {
        let characteristic = self.characteristic(handle)?;
        Ok(CharacteristicInfo {
            handle,
            service: characteristic.service,
            uuid: characteristic.uuid,
            properties: characteristic.properties,
            value: characteristic.value.clone(),
            notifying: characteristic.notifying,
            descriptors: characteristic.descriptors.clone(),
        })
    }

    pub fn descriptor_info(&self, handle: Handle) -> Result<DescriptorInfo> {
        let descriptor = self.descriptor(handle)?;
        Ok(DescriptorInfo {
            handle,
            characteristic: descriptor.characteristic,
            uuid: descriptor.uuid,
            value: descriptor.value.clone(),
        })
    }

    pub(crate) fn on_central_state(&mut self, manager: NativeRef, state: ManagerState) {
        if !self.is_central_manager(manager, "state update") {
            return;
        }
        let Ok(central) = self.central_ref_mut() else {
            return;
        };
        let previous = std::mem::replace(&mut central.state, state);
        info!("Central manager state {:?} -> {:?}", previous, state);

        let powered_off = previous.is_powered_on() && !state.is_powered_on();
        if powered_off {
            central.scanning = false;
        }

        self.emit(BridgeEvent::CentralStateChanged { state });
        if powered_off {
            self.drop_links_on_power_loss(state);
        }
    }
}
