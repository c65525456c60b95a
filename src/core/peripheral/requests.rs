//! Attribute requests from remote centrals.
//!
//! Every delivered request must be answered exactly once. Write requests
//! arrive in batches that are answered together: responding to any member
//! sends one native response (for the batch's first request) and retires
//! the whole batch. A request arriving on a characteristic whose previous
//! request is still open is delivered anyway and recorded as a protocol
//! violation.

use log::{debug, info, warn};

use crate::core::bridge::{BridgeCore, Entity};
use crate::core::error::Result;
use crate::core::events::BridgeEvent;
use crate::core::handle::Handle;
use crate::core::native::{NativeAttRequest, NativeRef};
use crate::core::peripheral::types::{AttError, AttRequest, RequestInfo, RequestKind};

impl BridgeCore {
    pub(crate) fn on_read_request(&mut self, manager: NativeRef, request: NativeAttRequest) {
        if !self.is_peripheral_manager(manager, "read request") {
            return;
        }
        let Ok(batch) = self.peripheral_manager_ref_mut().map(|m| m.open_batch()) else {
            return;
        };
        let Some(info) = self.accept_request(request, RequestKind::Read, batch) else {
            return;
        };
        if let Ok(state) = self.peripheral_manager_ref_mut() {
            state.batches.insert(batch, vec![info.request]);
        }
        debug!("Read request {} on {}", info.request, info.characteristic);
        self.emit(BridgeEvent::ReadRequest { request: info });
    }

    pub(crate) fn on_write_requests(&mut self, manager: NativeRef, requests: Vec<NativeAttRequest>) {
        if !self.is_peripheral_manager(manager, "write requests") {
            return;
        }
        let Ok(batch) = self.peripheral_manager_ref_mut().map(|m| m.open_batch()) else {
            return;
        };
        let accepted: Vec<RequestInfo> = requests
            .into_iter()
            .filter_map(|request| self.accept_request(request, RequestKind::Write, batch))
            .collect();
        if accepted.is_empty() {
            return;
        }
        if let Ok(state) = self.peripheral_manager_ref_mut() {
            state
                .batches
                .insert(batch, accepted.iter().map(|info| info.request).collect());
        }
        debug!("Write batch {} with {} requests", batch, accepted.len());
        self.emit(BridgeEvent::WriteRequests { requests: accepted });
    }

    fn accept_request(&mut self, native: NativeAttRequest, kind: RequestKind, batch: u64) -> Option<RequestInfo> {
        let characteristic = self.lookup_or_drop(native.characteristic, "attribute request")?;
        let open = match self.local_characteristic(characteristic) {
            Ok(entity) => entity.open_request,
            Err(e) => {
                self.diagnostics_mut()
                    .dropped_event(format!("attribute request: {}", e));
                return None;
            }
        };
        if let Some(previous) = open {
            // Long writes legitimately put several requests for one
            // attribute into the same batch.
            if self.request(previous).is_ok_and(|r| r.batch != batch) {
                self.diagnostics_mut().protocol_violation(format!(
                    "request on {} delivered while request {} is unanswered",
                    characteristic, previous
                ));
            }
        }

        let central = self.register_central(&native.central);
        let value = match kind {
            RequestKind::Read => Vec::new(),
            RequestKind::Write => native.value,
        };
        let (request, _) = self.register(native.object, || {
            Entity::Request(AttRequest {
                kind,
                central,
                characteristic,
                offset: native.offset,
                value: value.clone(),
                batch,
            })
        });
        if let Ok(entity) = self.local_characteristic_mut(characteristic) {
            entity.open_request = Some(request);
        }
        if let Ok(remote) = self.remote_central_mut(central) {
            remote.open_requests += 1;
        }

        Some(RequestInfo {
            request,
            kind,
            central,
            characteristic,
            offset: native.offset,
            value,
        })
    }

    /// Answers `request` and, for writes, every request delivered with it.
    /// `value` is what a read is answered with; it is set on the native
    /// request before the response goes out. Answered requests are
    /// invalidated, so a second answer is `NotFound`.
    pub fn respond_to_request(
        &mut self,
        request: Handle,
        value: Option<Vec<u8>>,
        result: AttError,
    ) -> Result<()> {
        let manager = self.peripheral_manager_ref()?.native;
        let batch = self.request(request)?.batch;
        let members = self
            .peripheral_manager_ref_mut()?
            .batches
            .remove(&batch)
            .unwrap_or_else(|| vec![request]);
        let first = members.first().copied().unwrap_or(request);

        let native = self.registry.native(first)?;
        self.stack
            .respond_to_request(manager, native, value.as_deref(), result);
        info!(
            "Answered batch {} ({} requests) with {:?}",
            batch,
            members.len(),
            result
        );
        for member in members {
            self.retire_request(member);
        }
        Ok(())
    }

    /// Requests delivered and not yet answered.
    pub fn unanswered_requests(&self) -> Result<usize> {
        Ok(self
            .peripheral_manager_ref()?
            .batches
            .values()
            .map(Vec::len)
            .sum())
    }

    /// Retires every open request without answering it. Used when the
    /// link they arrived on is gone.
    pub(crate) fn drop_open_requests(&mut self) {
        let Ok(state) = self.peripheral_manager_ref_mut() else {
            return;
        };
        let mut open: Vec<Handle> = state.batches.drain().flat_map(|(_, members)| members).collect();
        if open.is_empty() {
            return;
        }
        open.sort();
        warn!("Dropping {} unanswered requests", open.len());
        for request in open {
            self.retire_request(request);
        }
    }

    fn retire_request(&mut self, request: Handle) {
        let Some(Entity::Request(answered)) = self.release_handle(request) else {
            return;
        };
        if let Ok(entity) = self.local_characteristic_mut(answered.characteristic) {
            if entity.open_request == Some(request) {
                entity.open_request = None;
            }
        }
        if let Ok(remote) = self.remote_central_mut(answered.central) {
            remote.open_requests = remote.open_requests.saturating_sub(1);
        }
        self.release_idle_central(answered.central);
    }
}
