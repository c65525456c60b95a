use log::{debug, info};

use crate::core::bridge::BridgeCore;
use crate::core::bt_uuid::BtUuid;
use crate::core::central::ScanSession;
use crate::core::central::types::{AdvFields, PeripheralState, ScanOptions};
use crate::core::error::Result;
use crate::core::events::BridgeEvent;
use crate::core::native::{NativePeripheral, NativeRef};

impl BridgeCore {
    /// Starts (or restarts) scanning. `None` uses the configured scan options.
    pub fn scan(&mut self, services: &[BtUuid], options: Option<ScanOptions>) -> Result<()> {
        let manager = self.central_ready()?;
        let options = options.unwrap_or_else(|| self.config.scan.clone());

        self.stack.scan(manager, services, &options);
        let central = self.central_ref_mut()?;
        central.scanning = true;
        central.scan = ScanSession {
            services: services.to_vec(),
            options,
            last_seen: Default::default(),
        };
        info!("Scan started with {} service filters", services.len());
        Ok(())
    }

    /// Idempotent; accepted in any manager state.
    pub fn stop_scan(&mut self) -> Result<()> {
        let central = self.central_ref_mut()?;
        if !central.scanning {
            debug!("stop_scan while not scanning");
            return Ok(());
        }
        central.scanning = false;
        let manager = central.native;
        self.stack.stop_scan(manager);
        info!("Scan stopped");
        Ok(())
    }

    pub(crate) fn on_discover(
        &mut self,
        manager: NativeRef,
        peripheral: NativePeripheral,
        advertisement: AdvFields,
        rssi: i16,
    ) {
        if !self.is_central_manager(manager, "discovery") {
            return;
        }

        let Ok(central) = self.central_ref_mut() else {
            return;
        };
        if !central.scan.options.allow_duplicates
            && central.scan.last_seen.get(&peripheral.identifier) == Some(&advertisement)
        {
            debug!("Suppressed duplicate advertisement from {}", peripheral.identifier);
            return;
        }
        central
            .scan
            .last_seen
            .insert(peripheral.identifier, advertisement.clone());

        let handle = self.register_peripheral(&peripheral, PeripheralState::Disconnected);
        self.emit(BridgeEvent::PeripheralDiscovered {
            peripheral: handle,
            identifier: peripheral.identifier,
            advertisement,
            rssi,
        });
    }
}
