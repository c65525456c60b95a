use log::{debug, info, warn};

use crate::core::bridge::BridgeCore;
use crate::core::central::types::{ConnectOptions, PeripheralState};
use crate::core::constants::POWER_LOSS_ERROR_CODE;
use crate::core::error::{BridgeError, Result, TransportError};
use crate::core::events::BridgeEvent;
use crate::core::handle::Handle;
use crate::core::native::NativeRef;
use crate::core::pending::OperationKind;
use crate::core::types::ManagerState;

impl BridgeCore {
    /// Starts connecting. `None` uses the configured connect options.
    ///
    /// Connecting to a connected peripheral is a no-op; connecting twice
    /// while the first attempt is outstanding is rejected.
    pub fn connect(&mut self, peripheral: Handle, options: Option<ConnectOptions>) -> Result<()> {
        let manager = self.central_ready()?;
        let native = self.registry.native(peripheral)?;
        match self.peripheral(peripheral)?.state {
            PeripheralState::Connected => {
                debug!("Peripheral {} already connected", peripheral);
                return Ok(());
            }
            PeripheralState::Connecting => {
                return Err(BridgeError::OperationInProgress {
                    handle: peripheral,
                    kind: OperationKind::Connect,
                });
            }
            PeripheralState::Disconnected | PeripheralState::Disconnecting => {}
        }

        let options = options.unwrap_or_else(|| self.config.connect.clone());
        self.stack.connect(manager, native, &options);
        self.peripheral_mut(peripheral)?.state = PeripheralState::Connecting;
        info!("Connecting to peripheral {}", peripheral);
        Ok(())
    }

    /// Cancels a pending connection or disconnects. The peripheral stays
    /// `Disconnecting` until the stack reports the disconnect.
    pub fn cancel_connect(&mut self, peripheral: Handle) -> Result<()> {
        let manager = self.central_ready()?;
        let native = self.registry.native(peripheral)?;
        match self.peripheral(peripheral)?.state {
            PeripheralState::Connecting | PeripheralState::Connected => {}
            state => {
                debug!("cancel_connect on {} in state {:?}", peripheral, state);
                return Ok(());
            }
        }

        self.stack.cancel_connect(manager, native);
        self.peripheral_mut(peripheral)?.state = PeripheralState::Disconnecting;
        info!("Disconnecting peripheral {}", peripheral);
        Ok(())
    }

    fn connection_target(&mut self, manager: NativeRef, peripheral: NativeRef, context: &str) -> Option<Handle> {
        if !self.is_central_manager(manager, context) {
            return None;
        }
        let handle = self.lookup_or_drop(peripheral, context)?;
        if self.peripheral(handle).is_err() {
            self.diagnostics_mut()
                .dropped_event(format!("{} names non-peripheral {}", context, handle));
            return None;
        }
        Some(handle)
    }

    pub(crate) fn on_connect(&mut self, manager: NativeRef, peripheral: NativeRef) {
        let Some(handle) = self.connection_target(manager, peripheral, "connect") else {
            return;
        };
        if let Ok(entity) = self.peripheral_mut(handle) {
            // A cancel issued before this completion wins.
            if entity.state != PeripheralState::Disconnecting {
                entity.state = PeripheralState::Connected;
            }
            info!("Peripheral {} connected (state {:?})", handle, entity.state);
        }
        self.emit(BridgeEvent::PeripheralConnected { peripheral: handle });
    }

    pub(crate) fn on_connect_failed(
        &mut self,
        manager: NativeRef,
        peripheral: NativeRef,
        error: Option<TransportError>,
    ) {
        let Some(handle) = self.connection_target(manager, peripheral, "connect failure") else {
            return;
        };
        self.mark_disconnected(handle);
        warn!("Failed to connect to {}: {:?}", handle, error);
        self.emit(BridgeEvent::PeripheralConnectFailed {
            peripheral: handle,
            error,
        });
    }

    pub(crate) fn on_disconnect(
        &mut self,
        manager: NativeRef,
        peripheral: NativeRef,
        error: Option<TransportError>,
    ) {
        let Some(handle) = self.connection_target(manager, peripheral, "disconnect") else {
            return;
        };
        self.mark_disconnected(handle);
        info!("Peripheral {} disconnected", handle);
        self.emit(BridgeEvent::PeripheralDisconnected {
            peripheral: handle,
            error,
        });
    }

    /// Every link dies with the radio. Each peripheral that was connected or
    /// connecting gets its terminal event, carrying a synthetic error.
    pub(crate) fn drop_links_on_power_loss(&mut self, state: ManagerState) {
        let mut peripherals: Vec<Handle> = self
            .central
            .as_ref()
            .map(|c| c.by_identifier.values().copied().collect())
            .unwrap_or_default();
        peripherals.sort();

        let error = TransportError::new(
            format!("Bluetooth is no longer powered on ({:?})", state),
            POWER_LOSS_ERROR_CODE,
        );
        for handle in peripherals {
            let Ok(previous) = self.peripheral(handle).map(|p| p.state) else {
                continue;
            };
            self.mark_disconnected(handle);
            let error = Some(error.clone());
            match previous {
                PeripheralState::Disconnected => {}
                PeripheralState::Connecting => {
                    warn!("Connect to {} aborted by power loss", handle);
                    self.emit(BridgeEvent::PeripheralConnectFailed {
                        peripheral: handle,
                        error,
                    });
                }
                PeripheralState::Connected | PeripheralState::Disconnecting => {
                    info!("Peripheral {} disconnected by power loss", handle);
                    self.emit(BridgeEvent::PeripheralDisconnected {
                        peripheral: handle,
                        error,
                    });
                }
            }
        }
    }

    /// Operations in flight on a lost link will never complete normally.
    fn mark_disconnected(&mut self, handle: Handle) {
        let dropped = self.pending.drop_owner(handle);
        if dropped > 0 {
            debug!("Dropped {} pending operations of {}", dropped, handle);
        }
        if let Ok(entity) = self.peripheral_mut(handle) {
            entity.state = PeripheralState::Disconnected;
            if !entity.write_queue.is_empty() {
                warn!(
                    "Discarding {} queued writes to disconnected {}",
                    entity.write_queue.len(),
                    handle
                );
                entity.write_queue.clear();
            }
        }
    }
}
