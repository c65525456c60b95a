//! Diagnostics for conditions the bridge cannot enforce inline
//! Dropped events and caller protocol violations are logged and kept as
//! timestamped records a test harness can assert on. Only the most recent
//! records are kept; the per-kind totals never reset.

use std::collections::VecDeque;

use chrono::Local;
use log::{debug, warn};
use serde::Serialize;

/// Records kept when the configuration does not say otherwise.
pub const DEFAULT_DIAGNOSTICS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// A native event named an object with no live handle.
    DroppedEvent,
    /// The caller broke the request/response contract.
    ProtocolViolation,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug)]
pub struct Diagnostics {
    records: VecDeque<Diagnostic>,
    capacity: usize,
    dropped_events: usize,
    protocol_violations: usize,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_DIAGNOSTICS_CAPACITY)
    }
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `capacity` records, evicting the oldest first.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(DEFAULT_DIAGNOSTICS_CAPACITY)),
            capacity,
            dropped_events: 0,
            protocol_violations: 0,
        }
    }

    pub fn dropped_event(&mut self, message: impl Into<String>) {
        let message = message.into();
        debug!("Dropping event: {}", message);
        self.dropped_events += 1;
        self.push(DiagnosticKind::DroppedEvent, message);
    }

    pub fn protocol_violation(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("Protocol violation: {}", message);
        self.protocol_violations += 1;
        self.push(DiagnosticKind::ProtocolViolation, message);
    }

    fn push(&mut self, kind: DiagnosticKind, message: String) {
        if self.capacity == 0 {
            return;
        }
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(Diagnostic {
            kind,
            message,
            timestamp: Local::now().to_rfc3339(),
        });
    }

    /// Retained records, oldest first.
    pub fn records(&self) -> impl Iterator<Item = &Diagnostic> {
        self.records.iter()
    }

    /// Removes and returns the retained records. Totals are unaffected.
    pub fn drain(&mut self) -> Vec<Diagnostic> {
        self.records.drain(..).collect()
    }

    pub fn protocol_violations(&self) -> impl Iterator<Item = &Diagnostic> {
        self.records
            .iter()
            .filter(|record| record.kind == DiagnosticKind::ProtocolViolation)
    }

    /// Total of `kind` seen since the bridge started, evicted records included.
    pub fn count(&self, kind: DiagnosticKind) -> usize {
        match kind {
            DiagnosticKind::DroppedEvent => self.dropped_events,
            DiagnosticKind::ProtocolViolation => self.protocol_violations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_are_bounded_but_counted() {
        let mut diagnostics = Diagnostics::with_capacity(3);
        for i in 0..10 {
            diagnostics.dropped_event(format!("stray value {}", i));
        }
        diagnostics.protocol_violation("request left unanswered");

        let kept: Vec<&str> = diagnostics.records().map(|r| r.message.as_str()).collect();
        assert_eq!(kept, vec!["stray value 8", "stray value 9", "request left unanswered"]);
        assert_eq!(diagnostics.count(DiagnosticKind::DroppedEvent), 10);
        assert_eq!(diagnostics.count(DiagnosticKind::ProtocolViolation), 1);
        assert_eq!(diagnostics.protocol_violations().count(), 1);
    }

    #[test]
    fn test_drain_empties_records_only() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.dropped_event("late disconnect");
        assert_eq!(diagnostics.drain().len(), 1);
        assert_eq!(diagnostics.records().count(), 0);
        assert_eq!(diagnostics.count(DiagnosticKind::DroppedEvent), 1);
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let mut diagnostics = Diagnostics::with_capacity(0);
        diagnostics.dropped_event("ignored");
        assert_eq!(diagnostics.records().count(), 0);
        assert_eq!(diagnostics.count(DiagnosticKind::DroppedEvent), 1);
    }
}
