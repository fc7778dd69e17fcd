//! Append-only audit trail of committed world changes.

use std::sync::Mutex;

use serde::Serialize;
use tracing::info;

use crate::types::{RobotId, SlotRef, TaskType, TransitionId, ZoneKey};

/// One auditable event.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    TaskIssued {
        robot: RobotId,
        kind: String,
        correlation_id: u64,
    },
    VialMoved {
        robot: RobotId,
        line_code: String,
        transit: Option<String>,
        emergency: bool,
        from: String,
        to: String,
        transition: TransitionId,
    },
    ZoneMoved {
        from: String,
        to: String,
        zone_type: Option<u32>,
        transition: TransitionId,
    },
    ZoneControlled {
        zone: String,
        kind: String,
        count: usize,
    },
    VialDeleted {
        line_code: String,
        location: String,
    },
    VialRouted {
        line_code: String,
        reason: String,
    },
    ArchiveReset {
        zones: Vec<u64>,
    },
    Restarted {
        archive_reset: bool,
    },
}

impl AuditEvent {
    pub fn task_issued(robot: RobotId, kind: Option<TaskType>, correlation_id: u64) -> Self {
        AuditEvent::TaskIssued {
            robot,
            kind: kind.map_or_else(|| "noop".to_string(), |k| k.to_string()),
            correlation_id,
        }
    }

    pub fn controlled(key: ZoneKey, name: &str, kind: TaskType, count: usize) -> Self {
        AuditEvent::ZoneControlled {
            zone: format!("{name} ({key})"),
            kind: kind.to_string(),
            count,
        }
    }

    pub fn slot_label(name: &str, slot: SlotRef) -> String {
        format!("{name} #{}", slot.position)
    }
}

/// Receiver of audit events. Implementations must not block or fail.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Emits events on the `audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, event: &AuditEvent) {
        match serde_json::to_string(event) {
            Ok(line) => info!(target: "audit", "{line}"),
            Err(err) => info!(target: "audit", error = %err, "unserializable audit event"),
        }
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryAudit {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("audit mutex poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("audit mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAudit {
    fn record(&self, event: &AuditEvent) {
        self.events
            .lock()
            .expect("audit mutex poisoned")
            .push(event.clone());
    }
}
