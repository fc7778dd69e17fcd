//! Task scheduling for lab robots moving vials between zones.
//!
//! A [`Scheduler`] answers robot polls with one [`Task`] at a time. Each
//! task's world change is registered as a deferred commit and applied only
//! when the robot confirms the task on its next poll.

pub mod area_lock;
pub mod audit;
pub mod classification;
pub mod config;
pub mod error;
pub mod futures;
mod hooks;
pub mod logging;
pub mod persistence;
pub mod scheduler;
pub mod slot;
pub mod task_queue;
pub mod timer;
pub mod transition;
pub mod types;
pub mod vial;
pub mod waypoints;
pub mod zone;

pub use area_lock::AreaLocks;
pub use audit::{AuditEvent, AuditSink, MemoryAudit, TracingAudit};
pub use classification::{ClassificationPolicy, ClassificationResult};
pub use config::LabConfig;
pub use error::{Error, Result};
pub use persistence::{ArchiveEntry, JsonFileStore, MemoryStore, SnapshotStore};
pub use scheduler::Scheduler;
pub use types::{
    ColorId, CorrelationId, ErrorKind, ItemType, Pose, RobotId, SlotRef, Task, TaskType, ZoneId,
    ZoneKey, ZonePhase,
};
pub use vial::Vial;
pub use waypoints::{WaypointSource, WaypointTable};
