//! Bridge state owned by the dispatcher
//! `BridgeCore` holds the handle registry, pending operations and both
//! manager states. It is driven from exactly one context: caller commands
//! and native events are applied to it one at a time, and the events it
//! produces are collected in an outbox drained after every input.

use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::BridgeConfig;
use crate::core::central::CentralState;
use crate::core::central::types::{
    CharacteristicEntity, DescriptorEntity, PeripheralEntity, ServiceEntity, ServiceParent,
};
use crate::core::diagnostics::Diagnostics;
use crate::core::error::{BridgeError, Result};
use crate::core::events::BridgeEvent;
use crate::core::handle::{Handle, HandleRegistry};
use crate::core::native::{NativeRef, NativeStack, RawEvent};
use crate::core::pending::PendingOperations;
use crate::core::peripheral::PeripheralManagerState;
use crate::core::peripheral::types::{
    AttRequest, LocalCharacteristicEntity, LocalDescriptorEntity, LocalServiceEntity,
    RemoteCentral,
};
use crate::core::types::EntityKind;

/// Everything a handle can refer to.
pub(crate) enum Entity {
    CentralManager,
    PeripheralManager,
    Peripheral(PeripheralEntity),
    Service(ServiceEntity),
    Characteristic(CharacteristicEntity),
    Descriptor(DescriptorEntity),
    LocalService(LocalServiceEntity),
    LocalCharacteristic(LocalCharacteristicEntity),
    LocalDescriptor(LocalDescriptorEntity),
    Central(RemoteCentral),
    Request(AttRequest),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::CentralManager => EntityKind::CentralManager,
            Entity::PeripheralManager => EntityKind::PeripheralManager,
            Entity::Peripheral(_) => EntityKind::Peripheral,
            Entity::Service(_) => EntityKind::Service,
            Entity::Characteristic(_) => EntityKind::Characteristic,
            Entity::Descriptor(_) => EntityKind::Descriptor,
            Entity::LocalService(_) => EntityKind::LocalService,
            Entity::LocalCharacteristic(_) => EntityKind::LocalCharacteristic,
            Entity::LocalDescriptor(_) => EntityKind::LocalDescriptor,
            Entity::Central(_) => EntityKind::Central,
            Entity::Request(_) => EntityKind::Request,
        }
    }
}

pub struct BridgeCore {
    pub(crate) stack: Arc<dyn NativeStack>,
    pub(crate) config: BridgeConfig,
    pub(crate) registry: HandleRegistry<Entity>,
    pub(crate) pending: PendingOperations,
    /// `None` when the central manager is disabled.
    pub(crate) central: Option<CentralState>,
    /// `None` when the peripheral manager is disabled.
    pub(crate) peripheral_manager: Option<PeripheralManagerState>,
    diagnostics: Diagnostics,
    outbox: VecDeque<BridgeEvent>,
}

/// Typed lookups: `NotFound` for dead handles, `WrongKind` for live handles
/// of another entity kind.
macro_rules! entity_accessors {
    ($($variant:ident => $ty:ty, $get:ident, $get_mut:ident;)*) => {
        impl BridgeCore {
            $(
                pub(crate) fn $get(&self, handle: Handle) -> Result<&$ty> {
                    match self.registry.resolve(handle)? {
                        Entity::$variant(entity) => Ok(entity),
                        other => Err(BridgeError::WrongKind {
                            handle,
                            expected: EntityKind::$variant,
                            actual: other.kind(),
                        }),
                    }
                }

                pub(crate) fn $get_mut(&mut self, handle: Handle) -> Result<&mut $ty> {
                    match self.registry.resolve_mut(handle)? {
                        Entity::$variant(entity) => Ok(entity),
                        other => Err(BridgeError::WrongKind {
                            handle,
                            expected: EntityKind::$variant,
                            actual: other.kind(),
                        }),
                    }
                }
            )*
        }
    };
}

entity_accessors! {
    Peripheral => PeripheralEntity, peripheral, peripheral_mut;
    Service => ServiceEntity, service, service_mut;
    Characteristic => CharacteristicEntity, characteristic, characteristic_mut;
    Descriptor => DescriptorEntity, descriptor, descriptor_mut;
    LocalService => LocalServiceEntity, local_service, local_service_mut;
    LocalCharacteristic => LocalCharacteristicEntity, local_characteristic, local_characteristic_mut;
    LocalDescriptor => LocalDescriptorEntity, local_descriptor, local_descriptor_mut;
    Central => RemoteCentral, remote_central, remote_central_mut;
    Request => AttRequest, request, request_mut;
}

impl BridgeCore {
    /// Creates the managers enabled in `config`. Their state is `Unknown`
    /// until the stack reports otherwise.
    pub fn new(stack: Arc<dyn NativeStack>, config: BridgeConfig) -> Self {
        let diagnostics = Diagnostics::with_capacity(config.diagnostics_capacity);
        let mut core = Self {
            stack,
            config,
            registry: HandleRegistry::new(),
            pending: PendingOperations::new(),
            central: None,
            peripheral_manager: None,
            diagnostics,
            outbox: VecDeque::new(),
        };

        if core.config.central.enabled {
            let native = core.stack.create_central_manager(&core.config.central);
            let (handle, _) = core.register(native, || Entity::CentralManager);
            core.central = Some(CentralState::new(handle, native));
            info!("Central manager created as {}", handle);
        }
        if core.config.peripheral.enabled {
            let native = core.stack.create_peripheral_manager(&core.config.peripheral);
            let (handle, _) = core.register(native, || Entity::PeripheralManager);
            core.peripheral_manager = Some(PeripheralManagerState::new(handle, native));
            info!("Peripheral manager created as {}", handle);
        }
        core
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub(crate) fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        &mut self.diagnostics
    }

    pub(crate) fn emit(&mut self, event: BridgeEvent) {
        self.outbox.push_back(event);
    }

    /// Takes every event produced since the last drain, in production order.
    pub fn drain_events(&mut self) -> Vec<BridgeEvent> {
        self.outbox.drain(..).collect()
    }

    /// Number of live handles, managers included.
    pub fn live_handles(&self) -> usize {
        self.registry.len()
    }

    pub fn entity_kind(&self, handle: Handle) -> Result<EntityKind> {
        self.registry.resolve(handle).map(Entity::kind)
    }

    /// Registers `native`, retaining it when a new entry is created.
    pub(crate) fn register(&mut self, native: NativeRef, make: impl FnOnce() -> Entity) -> (Handle, bool) {
        let (handle, inserted) = self.registry.register_with(native, make);
        if inserted {
            self.stack.retain(native);
        }
        (handle, inserted)
    }

    /// Invalidates a single handle and releases its native object.
    pub(crate) fn release_handle(&mut self, handle: Handle) -> Option<Entity> {
        match self.registry.invalidate(handle) {
            Ok((native, entity)) => {
                self.stack.release(native);
                Some(entity)
            }
            Err(_) => None,
        }
    }

    /// Resolves a native reference carried by an event. Unregistered objects
    /// drop the event with a diagnostic.
    pub(crate) fn lookup_or_drop(&mut self, native: NativeRef, context: &str) -> Option<Handle> {
        let handle = self.registry.lookup(native);
        if handle.is_none() {
            self.diagnostics
                .dropped_event(format!("{} names unregistered object {:?}", context, native));
        }
        handle
    }

    /// Invalidates `handle` and everything it owns. Handles already gone are
    /// skipped.
    pub(crate) fn invalidate_subtree(&mut self, handle: Handle) {
        self.pending.drop_target(handle);
        let Some(entity) = self.release_handle(handle) else {
            return;
        };

        match entity {
            Entity::Peripheral(peripheral) => {
                self.pending.drop_owner(handle);
                if let Some(central) = self.central.as_mut() {
                    central.forget_peripheral(peripheral.identifier, handle);
                }
                for service in peripheral.services {
                    self.invalidate_subtree(service);
                }
            }
            Entity::Service(service) => {
                for characteristic in service.characteristics {
                    self.invalidate_subtree(characteristic);
                }
                for included in service.included {
                    let owned = self
                        .service(included)
                        .is_ok_and(|s| s.parent == ServiceParent::Service(handle));
                    if owned {
                        self.invalidate_subtree(included);
                    }
                }
            }
            Entity::Characteristic(characteristic) => {
                for descriptor in characteristic.descriptors {
                    self.invalidate_subtree(descriptor);
                }
            }
            Entity::LocalService(service) => {
                for characteristic in service.characteristics {
                    self.invalidate_subtree(characteristic);
                }
                for included in service.included {
                    self.invalidate_subtree(included);
                }
            }
            Entity::LocalCharacteristic(characteristic) => {
                for descriptor in characteristic.descriptors {
                    self.invalidate_subtree(descriptor);
                }
                for central in characteristic.subscribers {
                    if let Ok(remote) = self.remote_central_mut(central) {
                        remote.subscriptions.remove(&handle);
                    }
                    self.release_idle_central(central);
                }
            }
            Entity::CentralManager
            | Entity::PeripheralManager
            | Entity::Descriptor(_)
            | Entity::LocalDescriptor(_)
            | Entity::Central(_)
            | Entity::Request(_) => {}
        }
    }

    /// Applies one native delegate callback.
    pub fn handle_native(&mut self, event: RawEvent) {
        match event {
            RawEvent::CentralDidUpdateState { manager, state } => {
                self.on_central_state(manager, state)
            }
            RawEvent::CentralWillRestoreState {
                manager,
                peripherals,
                scan_services,
                scan_options,
            } => self.on_central_restore(manager, peripherals, scan_services, scan_options),
            RawEvent::DidDiscoverPeripheral {
                manager,
                peripheral,
                advertisement,
                rssi,
            } => self.on_discover(manager, peripheral, advertisement, rssi),
            RawEvent::DidConnectPeripheral { manager, peripheral } => {
                self.on_connect(manager, peripheral)
            }
            RawEvent::DidFailToConnectPeripheral {
                manager,
                peripheral,
                error,
            } => self.on_connect_failed(manager, peripheral, error),
            RawEvent::DidDisconnectPeripheral {
                manager,
                peripheral,
                error,
            } => self.on_disconnect(manager, peripheral, error),
            RawEvent::DidDiscoverServices {
                peripheral,
                services,
                error,
            } => self.on_services_discovered(peripheral, services, error),
            RawEvent::DidDiscoverIncludedServices {
                peripheral,
                service,
                included,
                error,
            } => self.on_included_services_discovered(peripheral, service, included, error),
            RawEvent::DidDiscoverCharacteristics {
                peripheral,
                service,
                characteristics,
                error,
            } => self.on_characteristics_discovered(peripheral, service, characteristics, error),
            RawEvent::DidDiscoverDescriptors {
                peripheral,
                characteristic,
                descriptors,
                error,
            } => self.on_descriptors_discovered(peripheral, characteristic, descriptors, error),
            RawEvent::DidUpdateValueForCharacteristic {
                peripheral,
                characteristic,
                value,
                error,
            } => self.on_characteristic_value(peripheral, characteristic, value, error),
            RawEvent::DidUpdateValueForDescriptor {
                peripheral,
                descriptor,
                value,
                error,
            } => self.on_descriptor_value(peripheral, descriptor, value, error),
            RawEvent::DidWriteValueForCharacteristic {
                peripheral,
                characteristic,
                error,
            } => self.on_characteristic_written(peripheral, characteristic, error),
            RawEvent::DidWriteValueForDescriptor {
                peripheral,
                descriptor,
                error,
            } => self.on_descriptor_written(peripheral, descriptor, error),
            RawEvent::IsReadyToSendWriteWithoutResponse { peripheral } => {
                self.on_ready_to_send(peripheral)
            }
            RawEvent::DidUpdateNotificationState {
                peripheral,
                characteristic,
                notifying,
                error,
            } => self.on_notification_state(peripheral, characteristic, notifying, error),
            RawEvent::DidReadRssi {
                peripheral,
                rssi,
                error,
            } => self.on_rssi(peripheral, rssi, error),
            RawEvent::DidUpdateName { peripheral, name } => self.on_name(peripheral, name),
            RawEvent::DidModifyServices {
                peripheral,
                invalidated,
            } => self.on_services_modified(peripheral, invalidated),
            RawEvent::PeripheralManagerDidUpdateState { manager, state } => {
                self.on_peripheral_manager_state(manager, state)
            }
            RawEvent::PeripheralManagerWillRestoreState {
                manager,
                services,
                advertisement,
            } => self.on_peripheral_restore(manager, services, advertisement),
            RawEvent::DidAddService {
                manager,
                service,
                error,
            } => self.on_service_added(manager, service, error),
            RawEvent::DidStartAdvertising { manager, error } => {
                self.on_advertising_started(manager, error)
            }
            RawEvent::CentralDidSubscribe {
                manager,
                central,
                characteristic,
            } => self.on_subscribe(manager, central, characteristic),
            RawEvent::CentralDidUnsubscribe {
                manager,
                central,
                characteristic,
            } => self.on_unsubscribe(manager, central, characteristic),
            RawEvent::IsReadyToUpdateSubscribers { manager } => self.on_ready_to_update(manager),
            RawEvent::DidReceiveReadRequest { manager, request } => {
                self.on_read_request(manager, request)
            }
            RawEvent::DidReceiveWriteRequests { manager, requests } => {
                self.on_write_requests(manager, requests)
            }
        }
    }

    /// Releases every native object. Unanswered attribute requests are
    /// reported as protocol violations first.
    pub fn shutdown(&mut self) {
        let unanswered: Vec<Handle> = self
            .registry
            .handles()
            .into_iter()
            .filter(|handle| self.request(*handle).is_ok())
            .collect();
        for request in &unanswered {
            self.diagnostics
                .protocol_violation(format!("request {} was never answered", request));
        }

        if let Some(central) = self.central.as_mut() {
            if central.scanning {
                central.scanning = false;
                self.stack.stop_scan(central.native);
            }
        }
        if let Some(manager) = self.peripheral_manager.as_mut() {
            if manager.advertising {
                manager.advertising = false;
                self.stack.stop_advertising(manager.native);
            }
        }

        let handles = self.registry.handles();
        debug!("Releasing {} native objects", handles.len());
        for handle in handles {
            self.release_handle(handle);
        }
        self.central = None;
        self.peripheral_manager = None;
        if !unanswered.is_empty() {
            warn!("Bridge shut down with {} unanswered requests", unanswered.len());
        }
        info!("Bridge shut down");
    }
}
