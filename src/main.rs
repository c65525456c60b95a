//! Demo: drives the bridge over the simulated stack, playing the radio's part,
//! and prints every normalized event as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use log::info;

use ble_bridge_lib::config::{BridgeConfig, CONFIG_FILE_NAME};
use ble_bridge_lib::core::central::types::{AdvFields, CharacteristicProperties};
use ble_bridge_lib::core::constants::{UUID_BATTERY_LEVEL, UUID_BATTERY_SERVICE};
use ble_bridge_lib::core::marshal::AdvFieldsWire;
use ble_bridge_lib::core::native::{NativeCharacteristic, NativePeripheral, NativeService};
use ble_bridge_lib::core::types::ManagerState;
use ble_bridge_lib::core::{BridgeEvent, EventHandler, NativeEventSender, RawEvent, SimulatedStack};
use ble_bridge_lib::{Bridge, logging};

/// Reacts to each event the way an application would, and answers each
/// command the way a battery-level sensor would.
struct BatteryReader {
    bridge: Bridge,
    radio: NativeEventSender,
    central: ble_bridge_lib::core::NativeRef,
    device: NativePeripheral,
    service: NativeService,
    level: NativeCharacteristic,
}

#[async_trait]
impl EventHandler for BatteryReader {
    async fn handle(&mut self, event: BridgeEvent) -> Result<()> {
        println!("{}", serde_json::to_string(&event)?);

        match event {
            BridgeEvent::CentralStateChanged {
                state: ManagerState::PoweredOn,
            } => {
                self.bridge.scan(vec![UUID_BATTERY_SERVICE], None).await?;
                // The sensor's advertisement arrives in its wire layout.
                let advertisement = AdvFields {
                    local_name: self.device.name.clone(),
                    service_uuids: vec![UUID_BATTERY_SERVICE],
                    tx_power_level: Some(4),
                    connectable: Some(true),
                    ..AdvFields::default()
                };
                let mut payload = Vec::new();
                AdvFieldsWire::from(&advertisement).encode(&mut payload);
                self.radio
                    .send_discovered(self.central, self.device.clone(), &payload, -52)?;
            }
            BridgeEvent::PeripheralDiscovered { peripheral, .. } => {
                self.bridge.stop_scan().await?;
                self.bridge.connect(peripheral, None).await?;
                self.radio.send(RawEvent::DidConnectPeripheral {
                    manager: self.central,
                    peripheral: self.device.object,
                })?;
            }
            BridgeEvent::PeripheralConnected { peripheral } => {
                self.bridge
                    .discover_services(peripheral, vec![UUID_BATTERY_SERVICE])
                    .await?;
                self.radio.send(RawEvent::DidDiscoverServices {
                    peripheral: self.device.object,
                    services: vec![self.service.clone()],
                    error: None,
                })?;
            }
            BridgeEvent::ServicesDiscovered { services, .. } => {
                let service = *services
                    .first()
                    .ok_or_else(|| anyhow!("battery service missing"))?;
                self.bridge
                    .discover_characteristics(service, vec![UUID_BATTERY_LEVEL])
                    .await?;
                self.radio.send(RawEvent::DidDiscoverCharacteristics {
                    peripheral: self.device.object,
                    service: self.service.object,
                    characteristics: vec![self.level.clone()],
                    error: None,
                })?;
            }
            BridgeEvent::CharacteristicsDiscovered { characteristics, .. } => {
                let characteristic = *characteristics
                    .first()
                    .ok_or_else(|| anyhow!("battery level characteristic missing"))?;
                self.bridge.read_characteristic(characteristic).await?;
                self.radio.send(RawEvent::DidUpdateValueForCharacteristic {
                    peripheral: self.device.object,
                    characteristic: self.level.object,
                    value: vec![87],
                    error: None,
                })?;
            }
            BridgeEvent::CharacteristicValueUpdated { value, .. } => {
                info!("Battery level: {}%", value.first().copied().unwrap_or_default());
                self.bridge.shutdown().await;
            }
            _ => {}
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
    let config = BridgeConfig::load_config(&config_path).await?;
    logging::init(config.level_filter());

    let stack = Arc::new(SimulatedStack::new());
    let (bridge, radio, events) = ble_bridge_lib::start(stack.clone(), config);

    let central = stack
        .central_manager()
        .ok_or_else(|| anyhow!("central manager is disabled in {}", config_path.display()))?;
    let handler = BatteryReader {
        bridge: bridge.clone(),
        radio: radio.clone(),
        central,
        device: stack.new_peripheral(Some("Thermo-7")),
        service: stack.new_service(UUID_BATTERY_SERVICE, true),
        level: stack.new_characteristic(
            UUID_BATTERY_LEVEL,
            CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
        ),
    };

    radio.send(RawEvent::CentralDidUpdateState {
        manager: central,
        state: ManagerState::PoweredOn,
    })?;
    events.pump(handler).await;

    info!("{} objects still retained after shutdown", stack.live_objects());
    Ok(())
}
