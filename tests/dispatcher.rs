mod common;

use async_trait::async_trait;
use futures_util::StreamExt;

use ble_bridge_lib::core::bt_uuid::BtUuid;
use ble_bridge_lib::core::central::types::{AdvFields, CharacteristicProperties, PeripheralState};
use ble_bridge_lib::core::error::TransportError;
use ble_bridge_lib::core::marshal::{AdvFieldsWire, MarshalError};
use ble_bridge_lib::core::types::ManagerState;
use ble_bridge_lib::core::{BridgeError, BridgeEvent, EventHandler, RawEvent};
use common::Harness;

#[tokio::test]
async fn test_commands_and_events_share_one_order() {
    let mut harness = Harness::start();
    harness.power_on().await;
    let (peripheral, native) = harness.connected("Scale").await;
    let (chr, _, chr_native) = harness
        .characteristic((peripheral, &native), 0x2a9d, CharacteristicProperties::READ)
        .await;

    harness.bridge.read_characteristic(chr).await.unwrap();
    harness.send(RawEvent::DidUpdateValueForCharacteristic {
        peripheral: native.object,
        characteristic: chr_native.object,
        value: vec![0x02, 0x10, 0x27],
        error: None,
    });
    assert_eq!(
        harness.next().await,
        BridgeEvent::CharacteristicValueUpdated {
            characteristic: chr,
            value: vec![0x02, 0x10, 0x27],
            error: None,
        }
    );
    let info = harness.bridge.characteristic_info(chr).await.unwrap();
    assert_eq!(info.value, Some(vec![0x02, 0x10, 0x27]));
}

#[tokio::test]
async fn test_transport_errors_are_forwarded_verbatim() {
    let mut harness = Harness::start();
    harness.power_on().await;
    let native = harness.stack.new_peripheral(Some("Flaky"));
    let peripheral = harness.discover(&native, AdvFields::default()).await;

    harness.bridge.connect(peripheral, None).await.unwrap();
    let central = harness.central();
    harness.send(RawEvent::DidFailToConnectPeripheral {
        manager: central,
        peripheral: native.object,
        error: Some(TransportError::new("Connection timed out", 6)),
    });
    assert_eq!(
        harness.next().await,
        BridgeEvent::PeripheralConnectFailed {
            peripheral,
            error: Some(TransportError::new("Connection timed out", 6)),
        }
    );
    let info = harness.bridge.peripheral_info(peripheral).await.unwrap();
    assert_eq!(info.state, PeripheralState::Disconnected);
}

#[tokio::test]
async fn test_event_stream_is_a_stream() {
    let mut harness = Harness::start();
    let central = harness.central();
    harness.send(RawEvent::CentralDidUpdateState {
        manager: central,
        state: ManagerState::PoweredOff,
    });
    harness.send(RawEvent::CentralDidUpdateState {
        manager: central,
        state: ManagerState::PoweredOn,
    });

    let states: Vec<BridgeEvent> = (&mut harness.events).take(2).collect().await;
    assert_eq!(
        states,
        vec![
            BridgeEvent::CentralStateChanged {
                state: ManagerState::PoweredOff
            },
            BridgeEvent::CentralStateChanged {
                state: ManagerState::PoweredOn
            },
        ]
    );
}

#[tokio::test]
async fn test_commands_before_power_on_are_not_ready() {
    let harness = Harness::start();
    assert_eq!(
        harness.bridge.scan(vec![], None).await,
        Err(BridgeError::NotReady(ManagerState::Unknown))
    );
}

#[tokio::test]
async fn test_shutdown_releases_everything_and_rejects_commands() {
    let mut harness = Harness::start();
    harness.power_on().await;
    let (peripheral, _) = harness.connected("Band").await;
    assert!(harness.stack.live_objects() > 0);

    harness.bridge.shutdown().await;
    assert!(harness.bridge.is_shutdown());
    assert_eq!(harness.stack.live_objects(), 0);
    assert_eq!(
        harness.bridge.peripheral_info(peripheral).await,
        Err(BridgeError::Shutdown)
    );
    assert_eq!(
        harness.radio.send(RawEvent::IsReadyToUpdateSubscribers {
            manager: harness.peripheral_manager()
        }),
        Err(BridgeError::Shutdown)
    );

    // Remaining events drain, then the stream ends.
    while harness.events.recv().await.is_some() {}
    // A second shutdown is harmless.
    harness.bridge.shutdown().await;
}

struct Recorder {
    seen: Vec<BridgeEvent>,
}

#[async_trait]
impl EventHandler for Recorder {
    async fn handle(&mut self, event: BridgeEvent) -> anyhow::Result<()> {
        self.seen.push(event);
        Ok(())
    }
}

#[tokio::test]
async fn test_pump_delivers_until_shutdown() {
    let harness = Harness::start();
    let central = harness.central();
    harness.send(RawEvent::CentralDidUpdateState {
        manager: central,
        state: ManagerState::PoweredOn,
    });

    let bridge = harness.bridge.clone();
    let pump = tokio::spawn(harness.events.pump(Recorder { seen: Vec::new() }));
    assert!(bridge.is_scanning().await.is_ok());
    bridge.shutdown().await;

    let recorder = pump.await.unwrap();
    assert_eq!(
        recorder.seen,
        vec![BridgeEvent::CentralStateChanged {
            state: ManagerState::PoweredOn
        }]
    );
}

#[tokio::test]
async fn test_disabled_manager_rejects_commands() {
    let mut config = ble_bridge_lib::BridgeConfig::default();
    config.peripheral.enabled = false;
    let harness = Harness::with_config(config);

    assert!(harness.stack.peripheral_manager().is_none());
    assert_eq!(
        harness.bridge.is_advertising().await,
        Err(BridgeError::Disabled("peripheral"))
    );
    assert!(harness.bridge.is_scanning().await.is_ok());
}

#[tokio::test]
async fn test_wire_advertisement_is_decoded_at_the_boundary() {
    let mut harness = Harness::start();
    harness.power_on().await;
    harness.bridge.scan(vec![], None).await.unwrap();
    let central = harness.central();
    let native = harness.stack.new_peripheral(Some("Scale"));

    let advertisement = AdvFields {
        local_name: Some("Scale".into()),
        service_uuids: vec![BtUuid::from_u16(0x181d)],
        connectable: Some(true),
        ..AdvFields::default()
    };
    let mut payload = Vec::new();
    AdvFieldsWire::from(&advertisement).encode(&mut payload);

    assert_eq!(
        harness.radio.send_discovered(central, native.clone(), &payload[..3], -60),
        Err(BridgeError::Malformed(MarshalError::Truncated {
            needed: 4,
            remaining: 3
        }))
    );
    harness
        .radio
        .send_discovered(central, native.clone(), &payload, -60)
        .unwrap();
    let (peripheral, decoded) = harness
        .until(|e| match e {
            BridgeEvent::PeripheralDiscovered {
                peripheral,
                advertisement,
                ..
            } => Some((peripheral, advertisement)),
            _ => None,
        })
        .await;
    assert_eq!(decoded, advertisement);

    harness.bridge.connect(peripheral, None).await.unwrap();
    harness.send(RawEvent::DidConnectPeripheral {
        manager: central,
        peripheral: native.object,
    });
    harness
        .until(|e| matches!(e, BridgeEvent::PeripheralConnected { .. }).then_some(()))
        .await;
    harness
        .radio
        .send_disconnected(central, native.object, Some("Peer went away".into()), 7)
        .unwrap();
    assert_eq!(
        harness.next().await,
        BridgeEvent::PeripheralDisconnected {
            peripheral,
            error: Some(TransportError::new("Peer went away", 7)),
        }
    );
}
