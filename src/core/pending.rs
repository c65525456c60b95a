//! Pending operation tracking
//! At most one operation of a kind may be in flight per target; a second
//! request of the same kind is rejected with `OperationInProgress`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

use crate::core::error::{BridgeError, Result};
use crate::core::handle::Handle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Tracked by peripheral state rather than the pending table.
    Connect,
    DiscoverServices,
    DiscoverIncludedServices,
    DiscoverCharacteristics,
    DiscoverDescriptors,
    ReadCharacteristic,
    ReadDescriptor,
    WriteCharacteristic,
    WriteDescriptor,
    SetNotify,
    ReadRssi,
    AddService,
    StartAdvertising,
}

#[derive(Debug, Clone, Copy)]
struct PendingOperation {
    /// Peripheral (or peripheral manager) the target belongs to.
    owner: Handle,
    issued_at: Instant,
}

#[derive(Default)]
pub struct PendingOperations {
    operations: HashMap<(Handle, OperationKind), PendingOperation>,
}

impl PendingOperations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, target: Handle, kind: OperationKind, owner: Handle) -> Result<()> {
        if self.operations.contains_key(&(target, kind)) {
            return Err(BridgeError::OperationInProgress {
                handle: target,
                kind,
            });
        }
        self.operations.insert(
            (target, kind),
            PendingOperation {
                owner,
                issued_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Resolves the operation. Returns false when nothing was pending, which
    /// is normal for unsolicited events and for late completions of dropped
    /// operations.
    pub fn complete(&mut self, target: Handle, kind: OperationKind) -> bool {
        match self.operations.remove(&(target, kind)) {
            Some(op) => {
                log::debug!(
                    "{:?} on {} completed after {:?}",
                    kind,
                    target,
                    op.issued_at.elapsed()
                );
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, target: Handle, kind: OperationKind) -> bool {
        self.operations.contains_key(&(target, kind))
    }

    /// Drops every operation aimed at `target`.
    pub fn drop_target(&mut self, target: Handle) -> usize {
        let before = self.operations.len();
        self.operations.retain(|(handle, _), _| *handle != target);
        before - self.operations.len()
    }

    /// Drops every operation whose target belongs to `owner`.
    pub fn drop_owner(&mut self, owner: Handle) -> usize {
        let before = self.operations.len();
        self.operations.retain(|_, op| op.owner != owner);
        before - self.operations.len()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(raw: u64) -> Handle {
        Handle::from_raw(raw)
    }

    #[test]
    fn test_second_request_of_same_kind_is_rejected() {
        let mut pending = PendingOperations::new();
        let chr = handle(3);
        pending.begin(chr, OperationKind::ReadCharacteristic, handle(1)).unwrap();

        assert_eq!(
            pending.begin(chr, OperationKind::ReadCharacteristic, handle(1)),
            Err(BridgeError::OperationInProgress {
                handle: chr,
                kind: OperationKind::ReadCharacteristic
            })
        );
        // A different kind on the same target is independent.
        pending.begin(chr, OperationKind::SetNotify, handle(1)).unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn test_complete_frees_the_slot() {
        let mut pending = PendingOperations::new();
        let chr = handle(3);
        pending.begin(chr, OperationKind::ReadCharacteristic, handle(1)).unwrap();
        assert!(pending.complete(chr, OperationKind::ReadCharacteristic));
        assert!(!pending.complete(chr, OperationKind::ReadCharacteristic));
        pending.begin(chr, OperationKind::ReadCharacteristic, handle(1)).unwrap();
    }

    #[test]
    fn test_drop_owner_only_touches_that_owner() {
        let mut pending = PendingOperations::new();
        pending.begin(handle(10), OperationKind::ReadCharacteristic, handle(1)).unwrap();
        pending.begin(handle(11), OperationKind::DiscoverDescriptors, handle(1)).unwrap();
        pending.begin(handle(20), OperationKind::ReadRssi, handle(2)).unwrap();

        assert_eq!(pending.drop_owner(handle(1)), 2);
        assert!(pending.is_pending(handle(20), OperationKind::ReadRssi));
    }
}
