#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ble_bridge_lib::config::BridgeConfig;
use ble_bridge_lib::core::central::types::{AdvFields, CharacteristicProperties};
use ble_bridge_lib::core::native::{NativeCharacteristic, NativePeripheral, NativeService};
use ble_bridge_lib::core::types::ManagerState;
use ble_bridge_lib::core::{BridgeEvent, BtUuid, EventStream, Handle, NativeEventSender, NativeRef, RawEvent, SimulatedStack};
use ble_bridge_lib::Bridge;
use tokio::time::timeout;

/// A running dispatcher over the simulated stack, with the test playing the radio.
pub struct Harness {
    pub stack: Arc<SimulatedStack>,
    pub bridge: Bridge,
    pub radio: NativeEventSender,
    pub events: EventStream,
}

impl Harness {
    pub fn start() -> Self {
        Self::with_config(BridgeConfig::default())
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        let stack = Arc::new(SimulatedStack::new());
        let (bridge, radio, events) = ble_bridge_lib::start(stack.clone(), config);
        Self {
            stack,
            bridge,
            radio,
            events,
        }
    }

    pub fn central(&self) -> NativeRef {
        self.stack.central_manager().expect("central manager enabled")
    }

    pub fn peripheral_manager(&self) -> NativeRef {
        self.stack
            .peripheral_manager()
            .expect("peripheral manager enabled")
    }

    pub fn send(&self, event: RawEvent) {
        self.radio.send(event).expect("dispatcher running");
    }

    pub async fn next(&mut self) -> BridgeEvent {
        timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("event within timeout")
            .expect("event stream open")
    }

    /// Skips events until `pick` accepts one.
    pub async fn until<T>(&mut self, mut pick: impl FnMut(BridgeEvent) -> Option<T>) -> T {
        loop {
            if let Some(found) = pick(self.next().await) {
                return found;
            }
        }
    }

    pub async fn power_on(&mut self) {
        let central = self.central();
        self.send(RawEvent::CentralDidUpdateState {
            manager: central,
            state: ManagerState::PoweredOn,
        });
        let state = self
            .until(|e| match e {
                BridgeEvent::CentralStateChanged { state } => Some(state),
                _ => None,
            })
            .await;
        assert_eq!(state, ManagerState::PoweredOn);

        let manager = self.peripheral_manager();
        self.send(RawEvent::PeripheralManagerDidUpdateState {
            manager,
            state: ManagerState::PoweredOn,
        });
        self.until(|e| match e {
            BridgeEvent::PeripheralManagerStateChanged { state } => Some(state),
            _ => None,
        })
        .await;
    }

    pub async fn discover(&mut self, native: &NativePeripheral, advertisement: AdvFields) -> Handle {
        let central = self.central();
        self.send(RawEvent::DidDiscoverPeripheral {
            manager: central,
            peripheral: native.clone(),
            advertisement,
            rssi: -48,
        });
        self.until(|e| match e {
            BridgeEvent::PeripheralDiscovered { peripheral, .. } => Some(peripheral),
            _ => None,
        })
        .await
    }

    /// Discovers and connects a fresh peripheral.
    pub async fn connected(&mut self, name: &str) -> (Handle, NativePeripheral) {
        let native = self.stack.new_peripheral(Some(name));
        let handle = self.discover(&native, AdvFields::default()).await;
        self.bridge.connect(handle, None).await.expect("connect accepted");
        let central = self.central();
        self.send(RawEvent::DidConnectPeripheral {
            manager: central,
            peripheral: native.object,
        });
        self.until(|e| match e {
            BridgeEvent::PeripheralConnected { peripheral } => Some(peripheral),
            _ => None,
        })
        .await;
        (handle, native)
    }

    /// Runs service and characteristic discovery, exposing one characteristic.
    pub async fn characteristic(
        &mut self,
        peripheral: (Handle, &NativePeripheral),
        uuid: u16,
        properties: CharacteristicProperties,
    ) -> (Handle, NativeService, NativeCharacteristic) {
        let service = self.stack.new_service(BtUuid::from_u16(0xfff0), true);
        let characteristic = self.stack.new_characteristic(BtUuid::from_u16(uuid), properties);

        self.bridge
            .discover_services(peripheral.0, vec![])
            .await
            .expect("service discovery accepted");
        self.send(RawEvent::DidDiscoverServices {
            peripheral: peripheral.1.object,
            services: vec![service.clone()],
            error: None,
        });
        let services = self
            .until(|e| match e {
                BridgeEvent::ServicesDiscovered { services, .. } => Some(services),
                _ => None,
            })
            .await;

        self.bridge
            .discover_characteristics(services[0], vec![])
            .await
            .expect("characteristic discovery accepted");
        self.send(RawEvent::DidDiscoverCharacteristics {
            peripheral: peripheral.1.object,
            service: service.object,
            characteristics: vec![characteristic.clone()],
            error: None,
        });
        let characteristics = self
            .until(|e| match e {
                BridgeEvent::CharacteristicsDiscovered { characteristics, .. } => Some(characteristics),
                _ => None,
            })
            .await;
        (characteristics[0], service, characteristic)
    }
}
