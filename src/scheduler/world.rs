//! The shared world aggregate and the deferred-commit actions applied to it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, TryLockError, Weak};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditSink};
use crate::config::{LabConfig, ZoneConfig};
use crate::error::{Error, Result};
use crate::futures::FuturesManager;
use crate::hooks::{HookArgs, HookRegistry, HookStage};
use crate::persistence::{ArchiveEntry, SnapshotStore};
use crate::slot::Slot;
use crate::task_queue::RobotQueues;
use crate::timer::{FireAttempt, PhaseTimer};
use crate::transition::{MatchContext, ZoneTransition};
use crate::types::{
    CorrelationId, RobotId, SlotRef, Task, TransitionId, ZoneId, ZoneKey,
};
use crate::vial::Vial;
use crate::waypoints::WaypointSource;
use crate::zone::{AutoAdvance, Zone};

use super::rotation::Rotation;

/// Top-level zones plus an id index.
#[derive(Debug)]
pub(crate) struct ZoneTree {
    zones: Vec<Zone>,
    index: HashMap<ZoneId, usize>,
}

impl ZoneTree {
    pub fn from_config(configs: &[ZoneConfig]) -> Self {
        let zones: Vec<Zone> = configs.iter().map(Zone::from_config).collect();
        let index = zones.iter().enumerate().map(|(i, z)| (z.id, i)).collect();
        Self { zones, index }
    }

    pub fn get(&self, id: ZoneId) -> Result<&Zone> {
        self.index
            .get(&id)
            .map(|&i| &self.zones[i])
            .ok_or(Error::UnknownZone { zone_id: id })
    }

    pub fn get_mut(&mut self, id: ZoneId) -> Result<&mut Zone> {
        match self.index.get(&id) {
            Some(&i) => Ok(&mut self.zones[i]),
            None => Err(Error::UnknownZone { zone_id: id }),
        }
    }

    /// The zone or subzone addressed by `key`.
    pub fn target(&self, key: ZoneKey) -> Result<&Zone> {
        let zone = self.get(key.zone)?;
        match key.subzone {
            None => Ok(zone),
            Some(sub) => zone.subzone(sub).ok_or(Error::UnknownSubzone {
                zone_id: key.zone,
                subzone_id: sub,
            }),
        }
    }

    pub fn target_mut(&mut self, key: ZoneKey) -> Result<&mut Zone> {
        let zone = self.get_mut(key.zone)?;
        match key.subzone {
            None => Ok(zone),
            Some(sub) => zone.subzone_mut(sub).ok_or(Error::UnknownSubzone {
                zone_id: key.zone,
                subzone_id: sub,
            }),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Zone> {
        self.zones.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Zone> {
        self.zones.iter_mut()
    }

    pub fn ids(&self) -> Vec<ZoneId> {
        self.zones.iter().map(|z| z.id).collect()
    }

    /// Key of the (sub)zone chosen by a selection on `zone`.
    pub fn key_for(zone: &Zone, subzone: Option<usize>) -> ZoneKey {
        match subzone {
            Some(i) => ZoneKey::subzone(zone.id, zone.subzones()[i].id),
            None => ZoneKey::zone(zone.id),
        }
    }

    pub fn slot(&self, at: SlotRef) -> Option<&Slot> {
        self.target(at.key).ok()?.slot_at(at.position)
    }

    pub fn slot_mut(&mut self, at: SlotRef) -> Option<&mut Slot> {
        self.target_mut(at.key).ok()?.slot_at_mut(at.position)
    }

    pub fn vial(&self, at: SlotRef) -> Option<&Vial> {
        self.slot(at)?.content()
    }

    pub fn find_vial(&self, line_code: &str) -> Option<SlotRef> {
        self.zones.iter().find_map(|zone| {
            let (sub, index) = zone.find_line_code(line_code)?;
            let key = ZoneKey {
                zone: zone.id,
                subzone: sub,
            };
            let position = self.target(key).ok()?.slots()[index].position;
            Some(SlotRef::new(key, position))
        })
    }

    /// The rule's readiness gate: its `target_zone` must be ready to load.
    pub fn target_ready(&self, rule: &ZoneTransition) -> Result<bool> {
        match rule.target_zone {
            Some(id) => Ok(self.get(id)?.is_ready_to_load()),
            None => Ok(true),
        }
    }

    pub fn snapshot(&self, stateful_only: bool) -> Vec<ArchiveEntry> {
        self.zones
            .iter()
            .filter(|z| !stateful_only || z.stateful)
            .map(|z| ArchiveEntry {
                zone_id: z.id,
                zone: z.snapshot(),
            })
            .collect()
    }
}

fn futures_of(w: &mut WorldState) -> &mut FuturesManager<CommitAction> {
    &mut w.futures
}

/// One step of a deferred commit. Records hold ids only and are resolved
/// against the world when the future runs.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CommitAction {
    Audit(AuditEvent),
    MoveVial {
        from: SlotRef,
        to: SlotRef,
    },
    MoveZoneContents {
        from: ZoneKey,
        to: ZoneKey,
    },
    Cascade {
        transition: TransitionId,
        curr: ZoneKey,
        next: ZoneKey,
    },
    PostOperations {
        transition: TransitionId,
        curr: ZoneKey,
        next: ZoneKey,
        robot: RobotId,
    },
    AdvancePhase(ZoneKey),
    StartZone(ZoneKey),
    SetDoor {
        key: ZoneKey,
        open: bool,
    },
    Initialize {
        key: ZoneKey,
        wait: bool,
    },
    Persist,
}

/// Everything the scheduler mutates, guarded by one mutex.
pub(crate) struct WorldState {
    pub config: LabConfig,
    pub tree: ZoneTree,
    pub rules: HashMap<TransitionId, ZoneTransition>,
    pub rotation: Rotation,
    pub queues: RobotQueues,
    pub futures: FuturesManager<CommitAction>,
    pub last_issued: HashMap<RobotId, CorrelationId>,
    pub sensors: HashMap<u32, bool>,
    pub hooks: HookRegistry,
    pub store: Arc<dyn SnapshotStore>,
    pub audit: Arc<dyn AuditSink>,
    pub waypoints: Arc<dyn WaypointSource>,
    /// Futures registered by the planning cycle in progress.
    pub cycle: Vec<CorrelationId>,
    pub self_ref: Weak<Mutex<WorldState>>,
}

impl WorldState {
    pub fn new(
        config: LabConfig,
        store: Arc<dyn SnapshotStore>,
        audit: Arc<dyn AuditSink>,
        waypoints: Arc<dyn WaypointSource>,
    ) -> Result<Self> {
        let hooks = HookRegistry::builtin();
        let mut rules = HashMap::new();
        for rule in &config.transitions {
            let rule = ZoneTransition::from_config(rule);
            hooks.validate(&rule)?;
            rules.insert(rule.id, rule);
        }
        Ok(Self {
            tree: ZoneTree::from_config(&config.zones),
            rotation: Rotation::from_config(&config.transition_orders, &config.rotation),
            queues: RobotQueues::new(&config.app.robots),
            futures: FuturesManager::new(),
            last_issued: HashMap::new(),
            sensors: HashMap::new(),
            hooks,
            rules,
            store,
            audit,
            waypoints,
            cycle: Vec::new(),
            self_ref: Weak::new(),
            config,
        })
    }

    pub fn rule(&self, id: TransitionId) -> Result<&ZoneTransition> {
        self.rules
            .get(&id)
            .ok_or(Error::UnknownTransition { transition_id: id })
    }

    pub fn match_context(&self) -> MatchContext {
        MatchContext::new(self.config.app.disposal_time_secs.map(Duration::from_secs))
    }

    pub fn record(&self, event: AuditEvent) {
        self.audit.record(&event);
    }

    /// Write the stateful-zone snapshot; failures only cost durability.
    pub fn persist(&self) {
        if let Err(err) = self.store.save(&self.tree.snapshot(true)) {
            warn!(error = %err, "snapshot not saved");
        }
    }

    /// Restore stateful zones from the store; an unreadable snapshot counts
    /// as none.
    pub fn import_snapshot(&mut self) {
        let entries = match self.store.load() {
            Ok(Some(entries)) => entries,
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "snapshot unavailable, starting empty");
                return;
            }
        };
        for entry in &entries {
            match self.tree.get_mut(entry.zone_id) {
                Ok(zone) => zone.restore(&entry.zone),
                Err(_) => warn!(zone_id = entry.zone_id, "snapshot names an unknown zone"),
            }
        }
        info!(zones = entries.len(), "snapshot imported");
    }

    pub fn new_correlation_id(&mut self) -> CorrelationId {
        let mut rng = rand::thread_rng();
        loop {
            let id = rng.gen_range(1_000_000..10_000_000);
            if !self.futures.contains(id) && !self.last_issued.values().any(|&v| v == id) {
                return id;
            }
        }
    }

    pub fn register_future(&mut self, id: CorrelationId, actions: Vec<CommitAction>) {
        self.futures.register(id, actions);
        self.cycle.push(id);
    }

    pub fn push_task(&mut self, robot: RobotId, task: Task) -> Result<()> {
        self.queues
            .push(robot, task)
            .map_err(|_| Error::UnknownRobot { robot_id: robot })
    }

    /// Run the commit registered under `id`, once.
    pub fn execute_future(&mut self, id: CorrelationId) -> Result<bool> {
        let ran = FuturesManager::execute_in(self, id, futures_of, |w, action| w.apply(action))?;
        if !ran {
            debug!(correlation_id = id, "no pending future");
        }
        Ok(ran)
    }

    fn apply(&mut self, action: CommitAction) -> Result<()> {
        match action {
            CommitAction::Audit(event) => self.record(event),
            CommitAction::MoveVial { from, to } => self.move_vial(from, to),
            CommitAction::MoveZoneContents { from, to } => self.move_zone_contents(from, to)?,
            CommitAction::Cascade {
                transition,
                curr,
                next,
            } => {
                let ctx = self.match_context();
                super::cascade::update_zone_phases(self, transition, curr, next, &ctx)?;
            }
            CommitAction::PostOperations {
                transition,
                curr,
                next,
                robot,
            } => {
                let args = HookArgs {
                    transition,
                    curr: Some(curr),
                    next: Some(next),
                    robot,
                };
                self.run_hooks(HookStage::PostOperations, &args)?;
            }
            CommitAction::AdvancePhase(key) => {
                self.tree.target_mut(key)?.progress_phase();
            }
            CommitAction::StartZone(key) => self.start_zone(key)?,
            CommitAction::SetDoor { key, open } => self.tree.target_mut(key)?.set_door(open),
            CommitAction::Initialize { key, wait } => {
                self.tree.target_mut(key)?.initialize(wait, Utc::now());
            }
            CommitAction::Persist => self.persist(),
        }
        Ok(())
    }

    fn move_vial(&mut self, from: SlotRef, to: SlotRef) {
        let Some(mut vial) = self.tree.slot_mut(from).and_then(Slot::take) else {
            warn!(from = %from, "vial left its slot before the move was confirmed");
            return;
        };
        let target = if self.tree.slot(to).is_some_and(Slot::is_empty) {
            vial.relocate(to.key);
            info!(line_code = %vial.line_code, from = %from, to = %to, "vial moved");
            to
        } else {
            warn!(line_code = %vial.line_code, to = %to, "destination slot unavailable, vial kept in place");
            from
        };
        if let Some(slot) = self.tree.slot_mut(target) {
            slot.put(vial);
        }
    }

    fn move_zone_contents(&mut self, from: ZoneKey, to: ZoneKey) -> Result<()> {
        let source = self.tree.target_mut(from)?;
        let zone_type = source.zone_type;
        let items = source.drain();
        let dest = self.tree.target_mut(to)?;
        let mut leftovers = Vec::new();
        for (position, mut vial) in items {
            vial.relocate(to);
            if let Err(vial) = dest.put_at(position, vial) {
                leftovers.push((position, vial));
            }
        }
        if zone_type.is_some() {
            dest.zone_type = zone_type;
        }
        if leftovers.is_empty() {
            info!(from = %from, to = %to, "zone contents moved");
            return Ok(());
        }
        warn!(from = %from, to = %to, count = leftovers.len(), "vials without a free destination slot stay behind");
        let source = self.tree.target_mut(from)?;
        for (position, mut vial) in leftovers {
            vial.relocate(from);
            if let Err(vial) = source.put_at(position, vial) {
                warn!(line_code = %vial.line_code, "vial lost its slot during zone move");
            }
        }
        Ok(())
    }

    fn start_zone(&mut self, key: ZoneKey) -> Result<()> {
        let final_transit = self.config.app.final_transit.clone();
        let zone = self.tree.target_mut(key)?;
        let advance = zone.start();
        zone.apply_start_effects(&final_transit);
        if zone.close_door_on_start {
            zone.set_door(false);
        }
        if self.rotation.is_batch_start_zone(key.zone) {
            self.rotation.bump(key.zone);
        }
        if let Some(advance) = advance {
            self.arm_timer(key, advance)?;
        }
        Ok(())
    }

    /// Arm the auto-advance for `key`. The timer thread re-enters through a
    /// weak handle and retries while the world is locked.
    fn arm_timer(&mut self, key: ZoneKey, advance: AutoAdvance) -> Result<()> {
        let world = self.self_ref.clone();
        let timer = PhaseTimer::spawn(format!("zone-timer-{key}"), advance.after, move || {
            let Some(world) = world.upgrade() else {
                return FireAttempt::Done;
            };
            let mut guard = match world.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::WouldBlock) => return FireAttempt::Retry,
                Err(TryLockError::Poisoned(_)) => return FireAttempt::Done,
            };
            match guard.tree.target_mut(key) {
                Ok(zone) => {
                    zone.apply_auto_advance(&advance);
                }
                Err(err) => warn!(error = %err, "timer fired for a missing zone"),
            }
            FireAttempt::Done
        })
        .map_err(|source| Error::TimerSpawn { key, source })?;
        self.tree.target_mut(key)?.arm_timer(timer);
        Ok(())
    }

    /// Run one hook list of `args.transition`. Guard stages stop at the first
    /// false; post-operations run every hook.
    pub fn run_hooks(&mut self, stage: HookStage, args: &HookArgs) -> Result<bool> {
        let rule = self.rule(args.transition)?;
        let names = match stage {
            HookStage::PreChecks => rule.pre_checks.clone(),
            HookStage::PreOperations => rule.pre_operations.clone(),
            HookStage::PostOperations => rule.post_operations.clone(),
            HookStage::PreTasks => rule.pre_tasks.clone(),
        };
        let mut all = true;
        for name in &names {
            let hook = self.hooks.get(args.transition, name)?;
            let passed = hook(self, args)?;
            if !passed {
                debug!(transition = args.transition, hook = %name, ?stage, "hook returned false");
                all = false;
                if stage.stops_on_false() {
                    return Ok(false);
                }
            }
        }
        Ok(all)
    }
}
