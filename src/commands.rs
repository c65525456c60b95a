//! Bridge commands
//! The async, cloneable front of the dispatcher. Each command runs inside the
//! dispatcher task and returns its synchronous result through a oneshot reply;
//! completions arrive later on the `EventStream`.

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bridge::BridgeCore;
use crate::core::bt_uuid::BtUuid;
use crate::core::central::types::{
    CharacteristicInfo, ConnectOptions, DescriptorInfo, PeripheralInfo, ScanOptions, ServiceInfo,
    WriteKind, WriteOutcome,
};
use crate::core::diagnostics::Diagnostic;
use crate::core::dispatcher::Input;
use crate::core::error::{BridgeError, Result};
use crate::core::handle::Handle;
use crate::core::peripheral::types::{
    AdvertisementData, AttError, CentralInfo, ConnectionLatency, LocalServiceInfo, MutableService,
};
use crate::core::types::{EntityKind, ManagerState};

#[derive(Clone)]
pub struct Bridge {
    tx: mpsc::UnboundedSender<Input>,
    cancel_token: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Bridge {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<Input>,
        cancel_token: CancellationToken,
        task: Arc<Mutex<Option<JoinHandle<()>>>>,
    ) -> Self {
        Self {
            tx,
            cancel_token,
            task,
        }
    }

    /// Runs `f` against the bridge state inside the dispatcher.
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut BridgeCore) -> T + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Input::Command(Box::new(move |core| {
                let _ = reply_tx.send(f(core));
            })))
            .map_err(|_| BridgeError::Shutdown)?;
        reply_rx.await.map_err(|_| BridgeError::Shutdown)
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut BridgeCore) -> Result<T> + Send + 'static,
    {
        self.call(f).await?
    }

    /// Stops the dispatcher and waits for it to release every handle.
    /// Later commands fail with [`BridgeError::Shutdown`].
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let Some(task) = self.task.lock().await.take() else {
            return;
        };
        match task.await {
            Ok(()) => info!("Bridge shut down cleanly"),
            Err(e) => warn!("Dispatcher task ended abnormally: {}", e),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel_token.is_cancelled() || self.tx.is_closed()
    }

    // Central manager

    pub async fn central_state(&self) -> Result<ManagerState> {
        self.run(|core| core.central_state()).await
    }

    pub async fn scan(&self, services: Vec<BtUuid>, options: Option<ScanOptions>) -> Result<()> {
        self.run(move |core| core.scan(&services, options)).await
    }

    pub async fn stop_scan(&self) -> Result<()> {
        self.run(|core| core.stop_scan()).await
    }

    pub async fn is_scanning(&self) -> Result<bool> {
        self.run(|core| core.is_scanning()).await
    }

    pub async fn connect(&self, peripheral: Handle, options: Option<ConnectOptions>) -> Result<()> {
        self.run(move |core| core.connect(peripheral, options)).await
    }

    pub async fn cancel_connect(&self, peripheral: Handle) -> Result<()> {
        self.run(move |core| core.cancel_connect(peripheral)).await
    }

    pub async fn retrieve_connected_peripherals(&self, services: Vec<BtUuid>) -> Result<Vec<Handle>> {
        self.run(move |core| core.retrieve_connected_peripherals(&services))
            .await
    }

    pub async fn retrieve_peripherals(&self, identifiers: Vec<Uuid>) -> Result<Vec<Handle>> {
        self.run(move |core| core.retrieve_peripherals(&identifiers))
            .await
    }

    pub async fn release_peripheral(&self, peripheral: Handle) -> Result<()> {
        self.run(move |core| core.release_peripheral(peripheral)).await
    }

    pub async fn peripherals(&self) -> Result<Vec<Handle>> {
        self.run(|core| core.peripherals()).await
    }

    // Remote GATT

    pub async fn discover_services(&self, peripheral: Handle, filter: Vec<BtUuid>) -> Result<()> {
        self.run(move |core| core.discover_services(peripheral, &filter))
            .await
    }

    pub async fn discover_included_services(&self, service: Handle, filter: Vec<BtUuid>) -> Result<()> {
        self.run(move |core| core.discover_included_services(service, &filter))
            .await
    }

    pub async fn discover_characteristics(&self, service: Handle, filter: Vec<BtUuid>) -> Result<()> {
        self.run(move |core| core.discover_characteristics(service, &filter))
            .await
    }

    pub async fn discover_descriptors(&self, characteristic: Handle) -> Result<()> {
        self.run(move |core| core.discover_descriptors(characteristic))
            .await
    }

    pub async fn read_characteristic(&self, characteristic: Handle) -> Result<()> {
        self.run(move |core| core.read_characteristic(characteristic))
            .await
    }

    pub async fn read_descriptor(&self, descriptor: Handle) -> Result<()> {
        self.run(move |core| core.read_descriptor(descriptor)).await
    }

    pub async fn write_characteristic(
        &self,
        characteristic: Handle,
        value: Vec<u8>,
        kind: WriteKind,
    ) -> Result<WriteOutcome> {
        self.run(move |core| core.write_characteristic(characteristic, &value, kind))
            .await
    }

    pub async fn write_descriptor(&self, descriptor: Handle, value: Vec<u8>) -> Result<()> {
        self.run(move |core| core.write_descriptor(descriptor, &value))
            .await
    }

    pub async fn set_notify(&self, characteristic: Handle, enabled: bool) -> Result<()> {
        self.run(move |core| core.set_notify(characteristic, enabled))
            .await
    }

    pub async fn read_rssi(&self, peripheral: Handle) -> Result<()> {
        self.run(move |core| core.read_rssi(peripheral)).await
    }

    pub async fn max_write_len(&self, peripheral: Handle, kind: WriteKind) -> Result<usize> {
        self.run(move |core| core.max_write_len(peripheral, kind)).await
    }

    pub async fn queued_writes(&self, peripheral: Handle) -> Result<usize> {
        self.run(move |core| core.queued_writes(peripheral)).await
    }

    pub async fn peripheral_info(&self, peripheral: Handle) -> Result<PeripheralInfo> {
        self.run(move |core| core.peripheral_info(peripheral)).await
    }

    pub async fn service_info(&self, service: Handle) -> Result<ServiceInfo> {
        self.run(move |core| core.service_info(service)).await
    }

    pub async fn characteristic_info(&self, characteristic: Handle) -> Result<CharacteristicInfo> {
        self.run(move |core| core.characteristic_info(characteristic))
            .await
    }

    pub async fn descriptor_info(&self, descriptor: Handle) -> Result<DescriptorInfo> {
        self.run(move |core| core.descriptor_info(descriptor)).await
    }

    // Peripheral manager

    pub async fn peripheral_manager_state(&self) -> Result<ManagerState> {
        self.run(|core| core.peripheral_manager_state()).await
    }

    pub async fn add_service(&self, service: MutableService) -> Result<Handle> {
        self.run(move |core| core.add_service(&service)).await
    }

    pub async fn remove_service(&self, service: Handle) -> Result<()> {
        self.run(move |core| core.remove_service(service)).await
    }

    pub async fn remove_all_services(&self) -> Result<()> {
        self.run(|core| core.remove_all_services()).await
    }

    pub async fn local_services(&self) -> Result<Vec<Handle>> {
        self.run(|core| core.local_services()).await
    }

    pub async fn local_service_info(&self, service: Handle) -> Result<LocalServiceInfo> {
        self.run(move |core| core.local_service_info(service)).await
    }

    pub async fn start_advertising(&self, data: AdvertisementData) -> Result<()> {
        self.run(move |core| core.start_advertising(&data)).await
    }

    pub async fn stop_advertising(&self) -> Result<()> {
        self.run(|core| core.stop_advertising()).await
    }

    pub async fn is_advertising(&self) -> Result<bool> {
        self.run(|core| core.is_advertising()).await
    }

    /// `Ok(false)` means the update was queued behind the transmit queue.
    pub async fn update_value(&self, value: Vec<u8>, characteristic: Handle, centrals: Vec<Handle>) -> Result<bool> {
        self.run(move |core| core.update_value(&value, characteristic, &centrals))
            .await
    }

    pub async fn queued_updates(&self) -> Result<usize> {
        self.run(|core| core.queued_updates()).await
    }

    pub async fn respond_to_request(
        &self,
        request: Handle,
        value: Option<Vec<u8>>,
        result: AttError,
    ) -> Result<()> {
        self.run(move |core| core.respond_to_request(request, value, result))
            .await
    }

    pub async fn unanswered_requests(&self) -> Result<usize> {
        self.run(|core| core.unanswered_requests()).await
    }

    pub async fn set_connection_latency(&self, latency: ConnectionLatency, central: Handle) -> Result<()> {
        self.run(move |core| core.set_connection_latency(latency, central))
            .await
    }

    pub async fn subscribers(&self, characteristic: Handle) -> Result<Vec<Handle>> {
        self.run(move |core| core.subscribers(characteristic)).await
    }

    pub async fn central_info(&self, central: Handle) -> Result<CentralInfo> {
        self.run(move |core| core.central_info(central)).await
    }

    // Bookkeeping

    pub async fn entity_kind(&self, handle: Handle) -> Result<EntityKind> {
        self.run(move |core| core.entity_kind(handle)).await
    }

    pub async fn live_handles(&self) -> Result<usize> {
        self.call(|core| core.live_handles()).await
    }

    pub async fn diagnostics(&self) -> Result<Vec<Diagnostic>> {
        self.call(|core| core.diagnostics().records().cloned().collect())
            .await
    }

    /// Hands over the retained diagnostics and forgets them.
    pub async fn drain_diagnostics(&self) -> Result<Vec<Diagnostic>> {
        self.call(|core| core.diagnostics_mut().drain()).await
    }
}
