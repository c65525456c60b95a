//! State restoration
//! When the system relaunches the host, it hands back the objects it kept
//! alive. Every restored object is registered before the restoration event
//! is emitted, so the handles it carries resolve immediately.

use log::info;

use crate::core::bridge::BridgeCore;
use crate::core::bt_uuid::BtUuid;
use crate::core::central::ScanSession;
use crate::core::central::types::ScanOptions;
use crate::core::events::BridgeEvent;
use crate::core::handle::Handle;
use crate::core::native::{NativeLocalService, NativeRef, RestoredPeripheral};
use crate::core::peripheral::types::AdvertisementData;

impl BridgeCore {
    pub(crate) fn on_central_restore(
        &mut self,
        manager: NativeRef,
        peripherals: Vec<RestoredPeripheral>,
        scan_services: Vec<BtUuid>,
        scan_options: Option<ScanOptions>,
    ) {
        if !self.is_central_manager(manager, "central restoration") {
            return;
        }

        let handles: Vec<Handle> = peripherals
            .iter()
            .map(|restored| self.register_peripheral(&restored.peripheral, restored.state))
            .collect();

        if scan_options.is_some() || !scan_services.is_empty() {
            if let Ok(central) = self.central_ref_mut() {
                central.scanning = true;
                central.scan = ScanSession {
                    services: scan_services.clone(),
                    options: scan_options.clone().unwrap_or_default(),
                    last_seen: Default::default(),
                };
            }
        }

        info!(
            "Restored central state: {} peripherals, scanning {}",
            handles.len(),
            self.is_scanning().unwrap_or(false)
        );
        self.emit(BridgeEvent::CentralRestored {
            peripherals: handles,
            scan_services,
            scan_options,
        });
    }

    pub(crate) fn on_peripheral_restore(
        &mut self,
        manager: NativeRef,
        services: Vec<NativeLocalService>,
        advertisement: Option<AdvertisementData>,
    ) {
        if !self.is_peripheral_manager(manager, "peripheral restoration") {
            return;
        }

        let handles: Vec<Handle> = services
            .iter()
            .map(|service| self.register_local_service(service, None, true))
            .collect();

        if let Ok(state) = self.peripheral_manager_ref_mut() {
            for handle in &handles {
                if !state.services.contains(handle) {
                    state.services.push(*handle);
                }
            }
            if advertisement.is_some() {
                state.advertising = true;
                state.advertisement = advertisement.clone();
            }
        }

        info!(
            "Restored peripheral state: {} services, advertising {}",
            handles.len(),
            advertisement.is_some()
        );
        self.emit(BridgeEvent::PeripheralRestored {
            services: handles,
            advertisement,
        });
    }
}

#[cfg(test)]
mod tests {
    use crate::config::BridgeConfig;
    use crate::core::bridge::fixture::Fixture;
    use crate::core::bt_uuid::BtUuid;
    use crate::core::central::types::{
        AdvFields, CharacteristicProperties, PeripheralState, ScanOptions,
    };
    use crate::core::events::BridgeEvent;
    use crate::core::native::{NativeStack, RawEvent, RestoredPeripheral};
    use crate::core::peripheral::types::{
        AdvertisementData, AttributePermissions, MutableCharacteristic, MutableService,
    };

    fn restoring() -> Fixture {
        let mut config = BridgeConfig::default();
        config.central.restore_identifier = Some("bridge.central".into());
        config.peripheral.restore_identifier = Some("bridge.peripheral".into());
        Fixture::with_config(config)
    }

    #[test]
    fn test_restored_peripherals_keep_handles_across_discovery() {
        let mut fixture = restoring();
        let kept = fixture.stack.new_peripheral(Some("Lock"));
        let manager = fixture.central_native();
        fixture.core.handle_native(RawEvent::CentralWillRestoreState {
            manager,
            peripherals: vec![RestoredPeripheral {
                peripheral: kept.clone(),
                state: PeripheralState::Connected,
            }],
            scan_services: vec![BtUuid::from_u16(0xfe59)],
            scan_options: None,
        });

        let events = fixture.events();
        let [BridgeEvent::CentralRestored { peripherals, .. }] = events.as_slice() else {
            panic!("expected restoration event, got {:?}", events);
        };
        let restored = peripherals[0];
        // Resolvable as soon as the event is seen.
        assert_eq!(
            fixture.core.peripheral_info(restored).unwrap().state,
            PeripheralState::Connected
        );
        assert_eq!(fixture.core.is_scanning(), Ok(true));

        fixture.power_central(crate::core::types::ManagerState::PoweredOn);
        fixture.discover_native(kept, AdvFields::default());
        let discovered: Vec<_> = fixture
            .events()
            .into_iter()
            .filter_map(|e| match e {
                BridgeEvent::PeripheralDiscovered { peripheral, .. } => Some(peripheral),
                _ => None,
            })
            .collect();
        assert_eq!(discovered, vec![restored]);
    }

    #[test]
    fn test_restore_without_scan_leaves_scanning_off() {
        let mut fixture = restoring();
        let manager = fixture.central_native();
        fixture.core.handle_native(RawEvent::CentralWillRestoreState {
            manager,
            peripherals: vec![],
            scan_services: vec![],
            scan_options: None,
        });
        assert_eq!(fixture.core.is_scanning(), Ok(false));

        fixture.core.handle_native(RawEvent::CentralWillRestoreState {
            manager,
            peripherals: vec![],
            scan_services: vec![],
            scan_options: Some(ScanOptions::default()),
        });
        assert_eq!(fixture.core.is_scanning(), Ok(true));
    }

    #[test]
    fn test_peripheral_restoration_registers_service_trees() {
        let mut fixture = restoring();
        let definition = MutableService::new(BtUuid::from_u16(0x180f), true).with_characteristic(
            MutableCharacteristic::new(
                BtUuid::from_u16(0x2a19),
                CharacteristicProperties::NOTIFY,
                AttributePermissions::READABLE,
            ),
        );
        let native = fixture.stack.alloc_service(&definition);
        let advertisement = AdvertisementData {
            local_name: Some("Bridge".into()),
            ..AdvertisementData::default()
        };

        let manager = fixture.peripheral_manager_native();
        fixture.core.handle_native(RawEvent::PeripheralManagerWillRestoreState {
            manager,
            services: vec![native.clone()],
            advertisement: Some(advertisement.clone()),
        });

        let events = fixture.events();
        let [BridgeEvent::PeripheralRestored { services, advertisement: restored }] = events.as_slice() else {
            panic!("expected restoration event, got {:?}", events);
        };
        assert_eq!(restored.as_ref(), Some(&advertisement));
        let info = fixture.core.local_service_info(services[0]).unwrap();
        assert!(info.published);
        assert_eq!(info.characteristics.len(), 1);
        assert_eq!(fixture.core.local_services().unwrap(), services.clone());
        assert_eq!(fixture.core.is_advertising(), Ok(true));
        assert_eq!(fixture.stack.retain_count(native.characteristics[0].object), 1);
    }
}
