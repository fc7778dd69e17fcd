//! The scheduling engine.
//!
//! All world state lives behind one mutex, so at most one decision, commit
//! or admin command touches it at a time. Zone-area locks are kept outside
//! that mutex; robots hold them across several polls.

mod admin;
mod cascade;
mod control;
mod movement;
mod planner;
mod rotation;
pub(crate) mod world;

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::info;

use crate::area_lock::AreaLocks;
use crate::audit::{AuditSink, TracingAudit};
use crate::classification::ClassificationResult;
use crate::config::LabConfig;
use crate::error::{Error, Result};
use crate::persistence::{ArchiveEntry, MemoryStore, SnapshotStore};
use crate::types::{
    ColorId, CorrelationId, Position, RobotId, SlotRef, Task, ZoneId, ZoneKey, ZonePhase,
};
use crate::vial::Vial;
use crate::waypoints::{WaypointSource, WaypointTable};

use world::WorldState;

/// Thread-safe handle to the scheduler. Cheap to share behind an `Arc`.
pub struct Scheduler {
    world: Arc<Mutex<WorldState>>,
    locks: Arc<AreaLocks>,
}

impl Scheduler {
    /// Build with an in-memory store, the tracing audit sink and the
    /// configured waypoint table.
    pub fn new(config: LabConfig) -> Result<Self> {
        let waypoints = WaypointTable::from_config(&config.waypoints)?;
        Self::with_collaborators(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(TracingAudit),
            Arc::new(waypoints),
        )
    }

    /// Build from explicit collaborators, then load the last snapshot.
    pub fn with_collaborators(
        config: LabConfig,
        store: Arc<dyn SnapshotStore>,
        audit: Arc<dyn AuditSink>,
        waypoints: Arc<dyn WaypointSource>,
    ) -> Result<Self> {
        let state = WorldState::new(config, store, audit, waypoints)?;
        let world = Arc::new(Mutex::new(state));
        {
            let mut guard = world.lock().expect("world mutex poisoned");
            guard.self_ref = Arc::downgrade(&world);
            guard.restart(false);
            info!(
                zones = guard.tree.ids().len(),
                transitions = guard.rules.len(),
                "scheduler ready"
            );
        }
        Ok(Self {
            world,
            locks: Arc::new(AreaLocks::new()),
        })
    }

    fn world(&self) -> MutexGuard<'_, WorldState> {
        self.world.lock().expect("world mutex poisoned")
    }

    /// Answer a robot poll. Returns the no-op task when nothing is feasible.
    pub fn get_task(&self, robot: RobotId) -> Result<Task> {
        self.world().get_task(robot)
    }

    /// Commit the future registered under `id`. Returns false when nothing
    /// was pending for it.
    pub fn execute_future(&self, id: CorrelationId) -> Result<bool> {
        self.world().execute_future(id)
    }

    pub fn restart(&self, archive_reset: bool) {
        self.world().restart(archive_reset);
        self.locks.clear();
    }

    pub fn delete_vial(&self, line_code: &str) -> bool {
        self.world().delete_vial(line_code)
    }

    pub fn reset_archives(&self, zone: Option<ZoneId>) -> Result<()> {
        self.world().reset_archives(zone)
    }

    pub fn reset_empty_archives(&self) -> Result<()> {
        self.world().reset_empty_archives()
    }

    pub fn reset_faults(&self) -> Result<()> {
        self.world().reset_faults()
    }

    /// Minimum vial age for disposal-gated rules; `None` disables the gate.
    pub fn set_disposal_time(&self, secs: Option<u64>) {
        self.world().set_disposal_time(secs);
    }

    /// Time of day ("HH:MM") after which controls may run.
    pub fn set_controls_time(&self, time: Option<String>) -> Result<()> {
        self.world().set_controls_time(time)
    }

    pub fn add_controls(&self) -> Result<usize> {
        self.world().add_controls()
    }

    pub fn reset_controls(&self) -> Result<()> {
        self.world().reset_controls()
    }

    /// Operator reports the dustbin emptied.
    pub fn clear_dustbin(&self) -> Result<bool> {
        self.world().clear_dustbin()
    }

    pub fn extend_runtime(&self, key: ZoneKey) -> Result<()> {
        self.world().extend_runtime(key)
    }

    pub fn change_device_active(&self, device_id: u32, active: bool) -> bool {
        self.world().change_device_active(device_id, active)
    }

    /// Stateful zones as they would be persisted.
    pub fn get_archive_snapshot(&self) -> Vec<ArchiveEntry> {
        self.world().archive_snapshot()
    }

    pub fn snapshot_all(&self) -> Vec<ArchiveEntry> {
        self.world().tree.snapshot(false)
    }

    pub fn set_sensor(&self, sensor_id: u32, value: bool) {
        self.world().sensors.insert(sensor_id, value);
    }

    pub fn register_arrivals(&self, arrivals: &[(Position, ColorId)]) -> Result<usize> {
        self.world().register_arrivals(arrivals)
    }

    pub fn confirm_presence(&self, id: CorrelationId, present: bool) -> Result<()> {
        self.world().confirm_presence(id, present)
    }

    pub fn classification_result(&self, id: CorrelationId, result: &ClassificationResult) -> Result<()> {
        self.world().classification_result(id, result)
    }

    pub fn area_locks(&self) -> Arc<AreaLocks> {
        Arc::clone(&self.locks)
    }

    pub fn zone_phase(&self, key: ZoneKey) -> Result<ZonePhase> {
        Ok(self.world().tree.target(key)?.phase())
    }

    /// Vials held by the (sub)zone and its children.
    pub fn zone_count(&self, key: ZoneKey) -> Result<usize> {
        Ok(self.world().tree.target(key)?.total_count())
    }

    pub fn find_vial(&self, line_code: &str) -> Option<SlotRef> {
        self.world().tree.find_vial(line_code)
    }

    pub fn vial(&self, line_code: &str) -> Option<Vial> {
        let world = self.world();
        let at = world.tree.find_vial(line_code)?;
        world.tree.vial(at).cloned()
    }

    /// Put a vial into an empty slot, keeping its destination hint. Returns
    /// false when the slot is taken or does not exist.
    pub fn place_vial(&self, at: SlotRef, mut vial: Vial) -> Result<bool> {
        let mut world = self.world();
        let zone = world.tree.target_mut(at.key)?;
        let hint = vial.next_zone_id;
        vial.relocate(at.key);
        vial.next_zone_id = hint;
        Ok(zone.put_at(at.position, vial).is_ok())
    }

    /// Operator override of a zone's phase.
    pub fn reset_phase(&self, key: ZoneKey, phase: ZonePhase) -> Result<()> {
        let mut world = self.world();
        if !world.tree.target_mut(key)?.reset_phase(phase) {
            return Err(Error::PhaseNotInOrder { key, phase });
        }
        world.persist();
        Ok(())
    }

    pub fn pending_futures(&self) -> usize {
        self.world().futures.len()
    }

    pub fn current_order(&self) -> Option<u32> {
        self.world().rotation.current_order()
    }

    pub fn batch_count(&self, zone: ZoneId) -> u32 {
        self.world().rotation.count(zone)
    }

    pub fn hook_count(&self) -> usize {
        self.world().hooks.len()
    }

    pub fn robots(&self) -> Vec<RobotId> {
        self.world().config.app.robots.clone()
    }
}
