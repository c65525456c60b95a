//! Event dispatcher
//! One task owns the `BridgeCore`. Caller commands and native events share a
//! single queue, so every command has made its native call before any event
//! it triggers is dequeued.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::stream::Stream;
use log::{debug, error, info};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::commands::Bridge;
use crate::config::BridgeConfig;
use crate::core::bridge::BridgeCore;
use crate::core::central::types::AdvFields;
use crate::core::error::{BridgeError, Result, TransportError};
use crate::core::events::BridgeEvent;
use crate::core::marshal::AdvFieldsWire;
use crate::core::native::{NativePeripheral, NativeRef, NativeStack, RawEvent};

pub(crate) type Command = Box<dyn FnOnce(&mut BridgeCore) + Send>;

pub(crate) enum Input {
    Native(RawEvent),
    Command(Command),
}

/// Feeds native delegate callbacks into the dispatcher.
#[derive(Clone)]
pub struct NativeEventSender {
    tx: mpsc::UnboundedSender<Input>,
}

impl NativeEventSender {
    pub fn send(&self, event: RawEvent) -> Result<()> {
        self.tx
            .send(Input::Native(event))
            .map_err(|_| BridgeError::Shutdown)
    }

    /// Reports a discovery whose advertisement arrives in its wire layout.
    /// Nothing is queued when the payload does not decode.
    pub fn send_discovered(
        &self,
        manager: NativeRef,
        peripheral: NativePeripheral,
        mut advertisement: &[u8],
        rssi: i16,
    ) -> Result<()> {
        let wire = AdvFieldsWire::decode(&mut advertisement)?;
        if !advertisement.is_empty() {
            debug!(
                "Ignoring {} trailing advertisement bytes from {}",
                advertisement.len(),
                peripheral.identifier
            );
        }
        self.send(RawEvent::DidDiscoverPeripheral {
            manager,
            peripheral,
            advertisement: AdvFields::try_from(wire)?,
            rssi,
        })
    }

    /// Reports a disconnect from its (message, code) error pair. A missing
    /// message is a clean disconnect.
    pub fn send_disconnected(
        &self,
        manager: NativeRef,
        peripheral: NativeRef,
        message: Option<String>,
        code: i64,
    ) -> Result<()> {
        self.send(RawEvent::DidDisconnectPeripheral {
            manager,
            peripheral,
            error: TransportError::from_pair(message, code),
        })
    }
}

/// Normalized events, in the order the dispatcher produced them.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<BridgeEvent>,
}

impl EventStream {
    /// Waits for the next event; `None` once the dispatcher has stopped and
    /// every event has been read.
    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BridgeEvent> {
        self.rx.try_recv().ok()
    }

    /// Hands every event to `handler` until the stream ends.
    pub async fn pump<H: EventHandler>(mut self, mut handler: H) -> H {
        while let Some(event) = self.rx.recv().await {
            if let Err(e) = handler.handle(event).await {
                error!("Event handler failed: {}", e);
            }
        }
        debug!("Event stream closed");
        handler
    }
}

impl Stream for EventStream {
    type Item = BridgeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[async_trait]
pub trait EventHandler: Send {
    async fn handle(&mut self, event: BridgeEvent) -> anyhow::Result<()>;
}

/// Starts the dispatcher task over `stack`.
///
/// Must be called from within a tokio runtime.
pub fn start(stack: Arc<dyn NativeStack>, config: BridgeConfig) -> (Bridge, NativeEventSender, EventStream) {
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let cancel_token = CancellationToken::new();

    let core = BridgeCore::new(stack, config);
    let task = tokio::spawn(run(core, input_rx, event_tx, cancel_token.clone()));
    info!("Bridge dispatcher started");

    let bridge = Bridge::new(input_tx.clone(), cancel_token, Arc::new(Mutex::new(Some(task))));
    (bridge, NativeEventSender { tx: input_tx }, EventStream { rx: event_rx })
}

async fn run(
    mut core: BridgeCore,
    mut input_rx: mpsc::UnboundedReceiver<Input>,
    event_tx: mpsc::UnboundedSender<BridgeEvent>,
    cancel_token: CancellationToken,
) {
    // Events produced while constructing the managers.
    forward(&mut core, &event_tx);

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                info!("Dispatcher cancelled");
                break;
            }
            input = input_rx.recv() => {
                match input {
                    Some(Input::Native(event)) => core.handle_native(event),
                    Some(Input::Command(command)) => command(&mut core),
                    None => {
                        info!("All dispatcher senders dropped");
                        break;
                    }
                }
                forward(&mut core, &event_tx);
            }
        }
    }

    input_rx.close();
    core.shutdown();
    forward(&mut core, &event_tx);
    info!("Bridge dispatcher stopped");
}

fn forward(core: &mut BridgeCore, event_tx: &mpsc::UnboundedSender<BridgeEvent>) {
    for event in core.drain_events() {
        if event_tx.send(event).is_err() {
            debug!("Event stream dropped; discarding event");
        }
    }
}
