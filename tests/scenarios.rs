mod common;

use ble_bridge_lib::config::BridgeConfig;
use ble_bridge_lib::core::central::types::{
    AdvFields, CharacteristicProperties, PeripheralState, ScanOptions, WriteKind, WriteOutcome,
};
use ble_bridge_lib::core::diagnostics::DiagnosticKind;
use ble_bridge_lib::core::native::{NativeLocalService, RestoredPeripheral};
use ble_bridge_lib::core::peripheral::types::{
    AttError, AttributePermissions, MutableCharacteristic, MutableService,
};
use ble_bridge_lib::core::sim::SimCall;
use ble_bridge_lib::core::{BridgeEvent, BtUuid, Handle, RawEvent};
use common::Harness;

fn adv(name: &str) -> AdvFields {
    AdvFields {
        local_name: Some(name.to_string()),
        ..AdvFields::default()
    }
}

#[tokio::test]
async fn test_thousand_writes_without_response_arrive_in_order() {
    let mut harness = Harness::start();
    harness.power_on().await;
    let (peripheral, native) = harness.connected("Strip").await;
    let (chr, _, chr_native) = harness
        .characteristic(
            (peripheral, &native),
            0xfff2,
            CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
        )
        .await;
    harness.stack.set_write_credit(Some(16));

    let mut queued = 0;
    for i in 0u16..1000 {
        let outcome = harness
            .bridge
            .write_characteristic(chr, i.to_le_bytes().to_vec(), WriteKind::WithoutResponse)
            .await
            .unwrap();
        if outcome == WriteOutcome::Queued {
            queued += 1;
        }
    }
    assert_eq!(queued, 1000 - 16);

    loop {
        harness.stack.add_write_credit(64);
        harness.send(RawEvent::IsReadyToSendWriteWithoutResponse {
            peripheral: native.object,
        });
        let still_queued = harness
            .until(|e| match e {
                BridgeEvent::ReadyToSendWriteWithoutResponse { still_queued, .. } => Some(still_queued),
                _ => None,
            })
            .await;
        if still_queued == 0 {
            break;
        }
    }

    let expected: Vec<Vec<u8>> = (0u16..1000).map(|i| i.to_le_bytes().to_vec()).collect();
    assert_eq!(harness.stack.written_values(chr_native.object), expected);
    assert_eq!(harness.stack.write_overruns(), 0);
    assert_eq!(harness.bridge.queued_writes(peripheral).await, Ok(0));
}

#[tokio::test]
async fn test_duplicate_advertisements_are_suppressed_unless_allowed() {
    let mut harness = Harness::start();
    harness.power_on().await;
    harness.bridge.scan(vec![], None).await.unwrap();

    let beacon = harness.stack.new_peripheral(Some("Tag"));
    let other = harness.stack.new_peripheral(Some("Other"));
    let first = harness.discover(&beacon, adv("Tag")).await;

    // The repeat is swallowed; the next event comes from the other device.
    let central = harness.central();
    harness.send(RawEvent::DidDiscoverPeripheral {
        manager: central,
        peripheral: beacon.clone(),
        advertisement: adv("Tag"),
        rssi: -70,
    });
    let next = harness.discover(&other, adv("Other")).await;
    assert_ne!(next, first);

    // Changed advertisement contents are reported again.
    let again = harness.discover(&beacon, adv("Tag v2")).await;
    assert_eq!(again, first);

    harness
        .bridge
        .scan(
            vec![],
            Some(ScanOptions {
                allow_duplicates: true,
                ..ScanOptions::default()
            }),
        )
        .await
        .unwrap();
    assert_eq!(harness.discover(&beacon, adv("Tag")).await, first);
    assert_eq!(harness.discover(&beacon, adv("Tag")).await, first);
    assert!(harness.stack.calls().contains(&SimCall::Scan {
        services: vec![],
        options: ScanOptions {
            allow_duplicates: true,
            solicited_service_uuids: vec![],
        },
    }));
}

#[tokio::test]
async fn test_restored_objects_resolve_when_the_event_arrives() {
    let mut config = BridgeConfig::default();
    config.central.restore_identifier = Some("bridge.central".into());
    let mut harness = Harness::with_config(config);

    let lock = harness.stack.new_peripheral(Some("Door"));
    let central = harness.central();
    harness.send(RawEvent::CentralWillRestoreState {
        manager: central,
        peripherals: vec![RestoredPeripheral {
            peripheral: lock.clone(),
            state: PeripheralState::Connected,
        }],
        scan_services: vec![BtUuid::from_u16(0x1815)],
        scan_options: Some(ScanOptions::default()),
    });
    let restored = harness
        .until(|e| match e {
            BridgeEvent::CentralRestored { peripherals, .. } => Some(peripherals),
            _ => None,
        })
        .await;
    let handle = restored[0];
    let info = harness.bridge.peripheral_info(handle).await.unwrap();
    assert_eq!(info.state, PeripheralState::Connected);
    assert_eq!(info.identifier, lock.identifier);
    assert_eq!(harness.bridge.is_scanning().await, Ok(true));

    harness.power_on().await;
    assert_eq!(harness.discover(&lock, adv("Door")).await, handle);
    assert_eq!(harness.bridge.peripherals().await.unwrap(), vec![handle]);
}

/// Publishes one readable, writable characteristic and returns its handle
/// and the native tree the stack built for it.
async fn publish(harness: &mut Harness) -> (Handle, NativeLocalService) {
    let service = MutableService::new(BtUuid::from_u16(0xfe00), true).with_characteristic(
        MutableCharacteristic::new(
            BtUuid::from_u16(0xfe01),
            CharacteristicProperties::READ
                | CharacteristicProperties::WRITE
                | CharacteristicProperties::NOTIFY,
            AttributePermissions::READABLE | AttributePermissions::WRITEABLE,
        ),
    );
    let handle = harness.bridge.add_service(service).await.unwrap();
    let manager = harness.peripheral_manager();
    let native = harness
        .stack
        .allocated_services()
        .pop()
        .expect("service allocated");
    harness.send(RawEvent::DidAddService {
        manager,
        service: native.object,
        error: None,
    });
    harness
        .until(|e| match e {
            BridgeEvent::ServiceAdded { service, error: None } => Some(service),
            _ => None,
        })
        .await;
    let info = harness.bridge.local_service_info(handle).await.unwrap();
    (info.characteristics[0], native)
}

#[tokio::test]
async fn test_unanswered_request_is_flagged_without_blocking() {
    let mut harness = Harness::start();
    harness.power_on().await;
    let (chr, native) = publish(&mut harness).await;
    let chr_native = native.characteristics[0].object;
    let remote = harness.stack.new_central(182);
    let manager = harness.peripheral_manager();

    for _ in 0..2 {
        let request = harness.stack.new_request(remote.clone(), chr_native, 0, vec![]);
        harness.send(RawEvent::DidReceiveReadRequest { manager, request });
    }
    let mut requests = Vec::new();
    for _ in 0..2 {
        let request = harness
            .until(|e| match e {
                BridgeEvent::ReadRequest { request } => Some(request),
                _ => None,
            })
            .await;
        assert_eq!(request.characteristic, chr);
        requests.push(request.request);
    }

    let diagnostics = harness.bridge.diagnostics().await.unwrap();
    let violations = diagnostics
        .iter()
        .filter(|d| d.kind == DiagnosticKind::ProtocolViolation)
        .count();
    assert_eq!(violations, 1);
    assert_eq!(harness.bridge.unanswered_requests().await, Ok(2));

    for request in requests {
        harness
            .bridge
            .respond_to_request(request, Some(vec![0x2a]), AttError::Success)
            .await
            .unwrap();
    }
    assert_eq!(harness.bridge.unanswered_requests().await, Ok(0));
    assert_eq!(harness.stack.retain_count(remote.object), 0);
}

#[tokio::test]
async fn test_refused_updates_are_retried_in_order() {
    let mut harness = Harness::start();
    harness.power_on().await;
    let (chr, native) = publish(&mut harness).await;
    let chr_native = native.characteristics[0].object;
    let remote = harness.stack.new_central(182);
    let manager = harness.peripheral_manager();

    harness.send(RawEvent::CentralDidSubscribe {
        manager,
        central: remote.clone(),
        characteristic: chr_native,
    });
    let subscriber = harness
        .until(|e| match e {
            BridgeEvent::CentralSubscribed { central, .. } => Some(central),
            _ => None,
        })
        .await;
    assert_eq!(harness.bridge.subscribers(chr).await.unwrap(), vec![subscriber]);

    harness.stack.set_update_credit(Some(0));
    assert_eq!(harness.bridge.update_value(vec![1], chr, vec![]).await, Ok(false));
    // Queued behind the first, even though the stack would now accept it.
    harness.stack.set_update_credit(None);
    assert_eq!(
        harness.bridge.update_value(vec![2], chr, vec![subscriber]).await,
        Ok(false)
    );
    assert_eq!(harness.bridge.queued_updates().await, Ok(2));

    harness.send(RawEvent::IsReadyToUpdateSubscribers { manager });
    assert_eq!(
        harness.next().await,
        BridgeEvent::ReadyToUpdateSubscribers {
            flushed: 2,
            still_queued: 0
        }
    );
    assert_eq!(harness.stack.updated_values(chr_native), vec![vec![1], vec![2]]);
}
