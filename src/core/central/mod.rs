//! Central side of the bridge
//! Scanning, connections, remote GATT discovery and attribute I/O.

mod connection;
mod gatt;
mod manager;
mod scanner;
pub mod types;

use std::collections::HashMap;
use uuid::Uuid;

use crate::core::bt_uuid::BtUuid;
use crate::core::central::types::{AdvFields, ScanOptions};
use crate::core::handle::Handle;
use crate::core::native::NativeRef;
use crate::core::types::ManagerState;

/// Parameters of the scan in progress and what it has already delivered.
#[derive(Debug, Default)]
pub(crate) struct ScanSession {
    pub services: Vec<BtUuid>,
    pub options: ScanOptions,
    /// Last advertisement delivered per device identifier.
    pub last_seen: HashMap<Uuid, AdvFields>,
}

pub(crate) struct CentralState {
    pub manager: Handle,
    pub native: NativeRef,
    pub state: ManagerState,
    pub scanning: bool,
    pub scan: ScanSession,
    /// Peripherals keep one handle per device identifier.
    pub by_identifier: HashMap<Uuid, Handle>,
}

impl CentralState {
    pub fn new(manager: Handle, native: NativeRef) -> Self {
        Self {
            manager,
            native,
            state: ManagerState::Unknown,
            scanning: false,
            scan: ScanSession::default(),
            by_identifier: HashMap::new(),
        }
    }

    pub fn forget_peripheral(&mut self, identifier: Uuid, handle: Handle) {
        if self.by_identifier.get(&identifier) == Some(&handle) {
            self.by_identifier.remove(&identifier);
            self.scan.last_seen.remove(&identifier);
        }
    }
}
