//! Peripheral manager commands: services, advertising, value updates and
//! subscriptions.

use log::{debug, info, warn};
use std::collections::HashSet;

use crate::core::bridge::{BridgeCore, Entity};
use crate::core::error::{BridgeError, Result, TransportError};
use crate::core::events::BridgeEvent;
use crate::core::handle::Handle;
use crate::core::native::{NativeCentral, NativeLocalService, NativeRef};
use crate::core::pending::OperationKind;
use crate::core::peripheral::PeripheralManagerState;
use crate::core::peripheral::types::{
    AdvertisementData, CentralInfo, ConnectionLatency, LocalCharacteristicEntity,
    LocalDescriptorEntity, LocalServiceEntity, LocalServiceInfo, MutableService, QueuedUpdate,
    RemoteCentral,
};
use crate::core::types::ManagerState;

impl BridgeCore {
    pub(crate) fn peripheral_manager_ref(&self) -> Result<&PeripheralManagerState> {
        self.peripheral_manager
            .as_ref()
            .ok_or(BridgeError::Disabled("peripheral"))
    }

    pub(crate) fn peripheral_manager_ref_mut(&mut self) -> Result<&mut PeripheralManagerState> {
        self.peripheral_manager
            .as_mut()
            .ok_or(BridgeError::Disabled("peripheral"))
    }

    fn peripheral_manager_ready(&self) -> Result<NativeRef> {
        let manager = self.peripheral_manager_ref()?;
        if !manager.state.is_powered_on() {
            return Err(BridgeError::NotReady(manager.state));
        }
        Ok(manager.native)
    }

    pub fn peripheral_manager(&self) -> Result<Handle> {
        Ok(self.peripheral_manager_ref()?.manager)
    }

    pub fn peripheral_manager_state(&self) -> Result<ManagerState> {
        Ok(self.peripheral_manager_ref()?.state)
    }

    pub fn is_advertising(&self) -> Result<bool> {
        Ok(self.peripheral_manager_ref()?.advertising)
    }

    /// Top-level local services, in the order they were added.
    pub fn local_services(&self) -> Result<Vec<Handle>> {
        Ok(self.peripheral_manager_ref()?.services.clone())
    }

    pub(crate) fn is_peripheral_manager(&mut self, manager: NativeRef, context: &str) -> bool {
        let known = self
            .peripheral_manager
            .as_ref()
            .is_some_and(|m| m.native == manager);
        if !known {
            self.diagnostics_mut().dropped_event(format!(
                "{} from unknown peripheral manager {:?}",
                context, manager
            ));
        }
        known
    }

    /// Registers a local service tree, depth first.
    pub(crate) fn register_local_service(
        &mut self,
        native: &NativeLocalService,
        owner: Option<Handle>,
        published: bool,
    ) -> Handle {
        let (service, _) = self.register(native.object, || {
            Entity::LocalService(LocalServiceEntity {
                uuid: native.uuid,
                primary: native.primary,
                published,
                owner,
                characteristics: Vec::new(),
                included: Vec::new(),
            })
        });

        let mut characteristics = Vec::with_capacity(native.characteristics.len());
        for chr in &native.characteristics {
            let (characteristic, _) = self.register(chr.object, || {
                Entity::LocalCharacteristic(LocalCharacteristicEntity {
                    service,
                    uuid: chr.uuid,
                    properties: chr.properties,
                    permissions: chr.permissions,
                    value: chr.value.clone(),
                    descriptors: Vec::new(),
                    subscribers: HashSet::new(),
                    open_request: None,
                })
            });
            let descriptors: Vec<Handle> = chr
                .descriptors
                .iter()
                .map(|dsc| {
                    self.register(dsc.object, || {
                        Entity::LocalDescriptor(LocalDescriptorEntity {
                            characteristic,
                            uuid: dsc.uuid,
                            value: dsc.value.clone(),
                        })
                    })
                    .0
                })
                .collect();
            if let Ok(entity) = self.local_characteristic_mut(characteristic) {
                entity.descriptors = descriptors;
            }
            characteristics.push(characteristic);
        }

        let included: Vec<Handle> = native
            .included
            .iter()
            .map(|inner| self.register_local_service(inner, Some(service), published))
            .collect();

        if let Ok(entity) = self.local_service_mut(service) {
            entity.characteristics = characteristics;
            entity.included = included;
        }
        service
    }

    fn mark_published(&mut self, service: Handle) {
        let included = match self.local_service_mut(service) {
            Ok(entity) => {
                entity.published = true;
                entity.included.clone()
            }
            Err(_) => return,
        };
        for inner in included {
            self.mark_published(inner);
        }
    }

    /// Publishes a service tree. The handle is usable at once; the add
    /// completes with `ServiceAdded`, and a failed add invalidates the tree.
    pub fn add_service(&mut self, service: &MutableService) -> Result<Handle> {
        let manager = self.peripheral_manager_ready()?;
        let owner = self.peripheral_manager_ref()?.manager;

        let native = self.stack.alloc_service(service);
        let handle = self.register_local_service(&native, None, false);
        self.pending.begin(handle, OperationKind::AddService, owner)?;
        self.stack.add_service(manager, native.object);
        self.peripheral_manager_ref_mut()?.services.push(handle);
        info!("Adding service {} as {}", service.uuid, handle);
        Ok(handle)
    }

    pub fn remove_service(&mut self, service: Handle) -> Result<()> {
        let manager = self.peripheral_manager_ref()?.native;
        let owner = self.local_service(service)?.owner;
        let native = self.registry.native(service)?;

        self.stack.remove_service(manager, native);
        match owner {
            Some(including) => {
                if let Ok(entity) = self.local_service_mut(including) {
                    entity.included.retain(|s| *s != service);
                }
            }
            None => self
                .peripheral_manager_ref_mut()?
                .services
                .retain(|s| *s != service),
        }
        self.invalidate_subtree(service);
        info!("Removed service {}", service);
        Ok(())
    }

    pub fn remove_all_services(&mut self) -> Result<()> {
        let state = self.peripheral_manager_ref_mut()?;
        let services = std::mem::take(&mut state.services);
        let manager = state.native;

        self.stack.remove_all_services(manager);
        for service in &services {
            self.invalidate_subtree(*service);
        }
        info!("Removed all {} services", services.len());
        Ok(())
    }

    /// A non-empty iBeacon payload replaces the name and service UUIDs.
    pub fn start_advertising(&mut self, data: &AdvertisementData) -> Result<()> {
        let manager = self.peripheral_manager_ready()?;
        let owner = self.peripheral_manager_ref()?.manager;
        self.pending
            .begin(owner, OperationKind::StartAdvertising, owner)?;
        self.stack.start_advertising(manager, data);
        self.peripheral_manager_ref_mut()?.advertisement = Some(data.clone());
        info!(
            "Starting advertising (name {:?}, {} services, beacon {})",
            data.local_name,
            data.service_uuids.len(),
            data.is_ibeacon()
        );
        Ok(())
    }

    pub fn stop_advertising(&mut self) -> Result<()> {
        let state = self.peripheral_manager_ref_mut()?;
        state.advertising = false;
        let (manager, owner) = (state.native, state.manager);
        // A start still in flight must not flip the flag back on.
        self.pending.complete(owner, OperationKind::StartAdvertising);
        self.stack.stop_advertising(manager);
        info!("Advertising stopped");
        Ok(())
    }

    /// Sends `value` to the subscribers of `characteristic` (all of them
    /// when `centrals` is empty).
    ///
    /// Returns false when the update could not go out now. It is then queued
    /// and retried, in order, when the stack reports it is ready again.
    pub fn update_value(&mut self, value: &[u8], characteristic: Handle, centrals: &[Handle]) -> Result<bool> {
        let manager = self.peripheral_manager_ready()?;
        self.local_characteristic(characteristic)?;
        let characteristic_native = self.registry.native(characteristic)?;
        let central_natives = centrals
            .iter()
            .map(|central| {
                self.remote_central(*central)?;
                self.registry.native(*central)
            })
            .collect::<Result<Vec<_>>>()?;

        let backlog = !self.peripheral_manager_ref()?.update_queue.is_empty();
        if !backlog
            && self
                .stack
                .update_value(manager, value, characteristic_native, &central_natives)
        {
            return Ok(true);
        }

        let queue = &mut self.peripheral_manager_ref_mut()?.update_queue;
        queue.push_back(QueuedUpdate {
            characteristic,
            value: value.to_vec(),
            centrals: centrals.to_vec(),
        });
        debug!("Queued update for {} ({} waiting)", characteristic, queue.len());
        Ok(false)
    }

    /// Updates refused by the stack and not yet sent.
    pub fn queued_updates(&self) -> Result<usize> {
        Ok(self.peripheral_manager_ref()?.update_queue.len())
    }

    pub fn set_connection_latency(&mut self, latency: ConnectionLatency, central: Handle) -> Result<()> {
        let manager = self.peripheral_manager_ref()?.native;
        self.remote_central(central)?;
        let native = self.registry.native(central)?;
        self.stack.set_connection_latency(manager, latency, native);
        debug!("Requested {:?} latency for {}", latency, central);
        Ok(())
    }

    /// Centrals subscribed to `characteristic`, in handle order.
    pub fn subscribers(&self, characteristic: Handle) -> Result<Vec<Handle>> {
        let mut subscribers: Vec<Handle> = self
            .local_characteristic(characteristic)?
            .subscribers
            .iter()
            .copied()
            .collect();
        subscribers.sort();
        Ok(subscribers)
    }

    pub fn local_service_info(&self, handle: Handle) -> Result<LocalServiceInfo> {
        let service = self.local_service(handle)?;
        Ok(LocalServiceInfo {
            handle,
            uuid: service.uuid,
            primary: service.primary,
            published: service.published,
            characteristics: service.characteristics.clone(),
            included: service.included.clone(),
        })
    }

    pub fn central_info(&self, handle: Handle) -> Result<CentralInfo> {
        let central = self.remote_central(handle)?;
        let mut subscriptions: Vec<Handle> = central.subscriptions.iter().copied().collect();
        subscriptions.sort();
        Ok(CentralInfo {
            handle,
            identifier: central.identifier,
            maximum_update_length: central.maximum_update_length,
            subscriptions,
        })
    }

    pub(crate) fn register_central(&mut self, native: &NativeCentral) -> Handle {
        let (handle, inserted) = self.register(native.object, || {
            Entity::Central(RemoteCentral {
                identifier: native.identifier,
                maximum_update_length: native.maximum_update_length,
                subscriptions: HashSet::new(),
                open_requests: 0,
            })
        });
        if !inserted {
            if let Ok(central) = self.remote_central_mut(handle) {
                central.maximum_update_length = native.maximum_update_length;
            }
        }
        handle
    }

    /// A central with no subscriptions and no open requests is forgotten.
    pub(crate) fn release_idle_central(&mut self, central: Handle) {
        let idle = self
            .remote_central(central)
            .is_ok_and(|c| c.subscriptions.is_empty() && c.open_requests == 0);
        if idle {
            self.release_handle(central);
            debug!("Released idle central {}", central);
        }
    }

    pub(crate) fn on_peripheral_manager_state(&mut self, manager: NativeRef, state: ManagerState) {
        if !self.is_peripheral_manager(manager, "state update") {
            return;
        }
        let Ok(peripheral_manager) = self.peripheral_manager_ref_mut() else {
            return;
        };
        let previous = std::mem::replace(&mut peripheral_manager.state, state);
        info!("Peripheral manager state {:?} -> {:?}", previous, state);

        if previous.is_powered_on() && !state.is_powered_on() {
            peripheral_manager.advertising = false;
            if !peripheral_manager.update_queue.is_empty() {
                warn!(
                    "Discarding {} queued value updates after power loss",
                    peripheral_manager.update_queue.len()
                );
                peripheral_manager.update_queue.clear();
            }
            let owner = peripheral_manager.manager;
            self.pending.drop_owner(owner);
        }

        self.emit(BridgeEvent::PeripheralManagerStateChanged { state });
        if previous.is_powered_on() && !state.is_powered_on() {
            self.end_sessions_on_power_loss();
        }
    }

    /// Remote centrals do not outlive the radio. Open requests are retired
    /// unanswered and every subscription ends with an unsubscribe event.
    fn end_sessions_on_power_loss(&mut self) {
        self.drop_open_requests();

        let mut centrals: Vec<Handle> = self
            .registry
            .handles()
            .into_iter()
            .filter(|handle| self.remote_central(*handle).is_ok())
            .collect();
        centrals.sort();
        for central in centrals {
            let mut subscriptions: Vec<Handle> = match self.remote_central_mut(central) {
                Ok(remote) => remote.subscriptions.drain().collect(),
                Err(_) => continue,
            };
            subscriptions.sort();
            for chr in subscriptions {
                if let Ok(entity) = self.local_characteristic_mut(chr) {
                    entity.subscribers.remove(&central);
                }
                self.emit(BridgeEvent::CentralUnsubscribed {
                    central,
                    characteristic: chr,
                });
            }
            self.release_idle_central(central);
        }
    }

    pub(crate) fn on_service_added(&mut self, manager: NativeRef, service: NativeRef, error: Option<TransportError>) {
        if !self.is_peripheral_manager(manager, "service added") {
            return;
        }
        let Some(handle) = self.lookup_or_drop(service, "service added") else {
            return;
        };
        if let Err(e) = self.local_service(handle) {
            self.diagnostics_mut()
                .dropped_event(format!("service added: {}", e));
            return;
        }
        self.pending.complete(handle, OperationKind::AddService);

        match &error {
            Some(e) => {
                warn!("Failed to add service {}: {}", handle, e);
                if let Ok(state) = self.peripheral_manager_ref_mut() {
                    state.services.retain(|s| *s != handle);
                }
                self.invalidate_subtree(handle);
            }
            None => {
                self.mark_published(handle);
                info!("Service {} published", handle);
            }
        }
        self.emit(BridgeEvent::ServiceAdded {
            service: handle,
            error,
        });
    }

    pub(crate) fn on_advertising_started(&mut self, manager: NativeRef, error: Option<TransportError>) {
        if !self.is_peripheral_manager(manager, "advertising started") {
            return;
        }
        let Ok(owner) = self.peripheral_manager() else {
            return;
        };
        let expected = self.pending.complete(owner, OperationKind::StartAdvertising);
        if expected && error.is_none() {
            if let Ok(state) = self.peripheral_manager_ref_mut() {
                state.advertising = true;
            }
        }
        match &error {
            Some(e) => warn!("Failed to start advertising: {}", e),
            None => info!("Advertising started"),
        }
        self.emit(BridgeEvent::AdvertisingStarted { error });
    }

    pub(crate) fn on_subscribe(&mut self, manager: NativeRef, central: NativeCentral, characteristic: NativeRef) {
        if !self.is_peripheral_manager(manager, "subscribe") {
            return;
        }
        let Some(chr) = self.lookup_or_drop(characteristic, "subscribe") else {
            return;
        };
        if let Err(e) = self.local_characteristic(chr) {
            self.diagnostics_mut().dropped_event(format!("subscribe: {}", e));
            return;
        }

        let handle = self.register_central(&central);
        if let Ok(entity) = self.local_characteristic_mut(chr) {
            entity.subscribers.insert(handle);
        }
        if let Ok(remote) = self.remote_central_mut(handle) {
            remote.subscriptions.insert(chr);
        }
        info!("Central {} subscribed to {}", handle, chr);
        self.emit(BridgeEvent::CentralSubscribed {
            central: handle,
            characteristic: chr,
        });
    }

    pub(crate) fn on_unsubscribe(&mut self, manager: NativeRef, central: NativeCentral, characteristic: NativeRef) {
        if !self.is_peripheral_manager(manager, "unsubscribe") {
            return;
        }
        let Some(chr) = self.lookup_or_drop(characteristic, "unsubscribe") else {
            return;
        };
        let Some(handle) = self.lookup_or_drop(central.object, "unsubscribe") else {
            return;
        };
        if let Ok(entity) = self.local_characteristic_mut(chr) {
            entity.subscribers.remove(&handle);
        }
        match self.remote_central_mut(handle) {
            Ok(remote) => {
                remote.subscriptions.remove(&chr);
            }
            Err(e) => {
                self.diagnostics_mut()
                    .dropped_event(format!("unsubscribe: {}", e));
                return;
            }
        }
        info!("Central {} unsubscribed from {}", handle, chr);
        self.emit(BridgeEvent::CentralUnsubscribed {
            central: handle,
            characteristic: chr,
        });
        self.release_idle_central(handle);
    }

    /// Retries queued value updates in order until the stack refuses again.
    pub(crate) fn on_ready_to_update(&mut self, manager: NativeRef) {
        if !self.is_peripheral_manager(manager, "ready to update") {
            return;
        }

        let mut flushed = 0;
        loop {
            let Some((characteristic, value, centrals)) = self
                .peripheral_manager_ref()
                .ok()
                .and_then(|state| state.update_queue.front())
                .map(|update| (update.characteristic, update.value.clone(), update.centrals.clone()))
            else {
                break;
            };

            let characteristic_native = self
                .local_characteristic(characteristic)
                .and_then(|_| self.registry.native(characteristic));
            let central_natives: Vec<NativeRef> = centrals
                .iter()
                .filter_map(|central| self.registry.native(*central).ok())
                .collect();

            match characteristic_native {
                // Every addressed central is gone; sending to an empty list
                // would reach all subscribers instead.
                Ok(_) if !centrals.is_empty() && central_natives.is_empty() => {
                    debug!("Skipping queued update for {}: recipients gone", characteristic);
                }
                Ok(native) => {
                    if !self.stack.update_value(manager, &value, native, &central_natives) {
                        break;
                    }
                    flushed += 1;
                }
                Err(_) => {
                    warn!("Skipping queued update for removed characteristic {}", characteristic);
                }
            }
            if let Ok(state) = self.peripheral_manager_ref_mut() {
                state.update_queue.pop_front();
            }
        }

        let still_queued = self.queued_updates().unwrap_or(0);
        debug!("Flushed {} queued updates, {} still queued", flushed, still_queued);
        self.emit(BridgeEvent::ReadyToUpdateSubscribers {
            flushed,
            still_queued,
        });
    }
}
