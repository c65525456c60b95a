//! Peripheral side of the bridge
//! The local GATT server: published services, advertising, subscriptions
//! and attribute requests from remote centrals.

mod manager;
mod requests;
pub mod types;

use std::collections::{HashMap, VecDeque};

use crate::core::handle::Handle;
use crate::core::native::NativeRef;
use crate::core::peripheral::types::{AdvertisementData, QueuedUpdate};
use crate::core::types::ManagerState;

pub(crate) struct PeripheralManagerState {
    pub manager: Handle,
    pub native: NativeRef,
    pub state: ManagerState,
    pub advertising: bool,
    pub advertisement: Option<AdvertisementData>,
    /// Top-level services in the order they were added.
    pub services: Vec<Handle>,
    /// Value updates refused by the stack, retried in order.
    pub update_queue: VecDeque<QueuedUpdate>,
    /// Unanswered requests per delivery batch, in delivery order.
    pub batches: HashMap<u64, Vec<Handle>>,
    pub next_batch: u64,
}

impl PeripheralManagerState {
    pub fn new(manager: Handle, native: NativeRef) -> Self {
        Self {
            manager,
            native,
            state: ManagerState::Unknown,
            advertising: false,
            advertisement: None,
            services: Vec::new(),
            update_queue: VecDeque::new(),
            batches: HashMap::new(),
            next_batch: 0,
        }
    }

    pub fn open_batch(&mut self) -> u64 {
        let batch = self.next_batch;
        self.next_batch += 1;
        batch
    }
}
