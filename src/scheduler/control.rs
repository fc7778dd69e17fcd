//! Single-zone instructions: start, stop, doors, pause and init.

use chrono::Utc;
use tracing::{debug, info};

use crate::audit::AuditEvent;
use crate::error::Result;
use crate::hooks::{HookArgs, HookStage};
use crate::types::{RobotId, Task, TaskType, TransitionId, ZoneId, ZoneKey, ZonePhase};

use super::world::{CommitAction, WorldState};

impl WorldState {
    fn controlled(&self, key: ZoneKey, kind: TaskType) -> Result<AuditEvent> {
        let zone = self.tree.target(key)?;
        Ok(AuditEvent::controlled(key, &zone.name, kind, zone.total_count()))
    }

    /// Queue a control task whose commit runs `actions` and then audits it.
    fn push_control(
        &mut self,
        robot: RobotId,
        kind: TaskType,
        key: ZoneKey,
        mut actions: Vec<CommitAction>,
    ) -> Result<()> {
        let id = self.new_correlation_id();
        actions.push(CommitAction::Audit(self.controlled(key, kind)?));
        self.register_future(id, actions);
        debug!(robot, zone = %key, %kind, correlation_id = id, "control task queued");
        self.push_task(robot, Task::control(kind, key, id))
    }

    /// Queue an OPEN or CLOSE task. With `progress` the commit also advances
    /// the zone's phase.
    pub(crate) fn push_door_task(
        &mut self,
        robot: RobotId,
        key: ZoneKey,
        open: bool,
        progress: bool,
    ) -> Result<()> {
        let mut actions = vec![CommitAction::SetDoor { key, open }];
        if progress {
            actions.push(CommitAction::AdvancePhase(key));
        }
        actions.push(CommitAction::Persist);
        let kind = if open { TaskType::Open } else { TaskType::Close };
        self.push_control(robot, kind, key, actions)
    }

    /// Capacity gate: a full zone with `capacity_check` pauses the robot.
    /// Returns false when a pause was queued.
    pub(super) fn check_capacity(&mut self, robot: RobotId) -> Result<bool> {
        let excluded = &self.config.app.capacity_excluded_types;
        let full = self
            .tree
            .iter()
            .find(|z| z.capacity_check && !z.has_capacity(excluded))
            .map(|z| z.id);
        let Some(zone) = full else {
            return Ok(true);
        };
        info!(robot, zone, "zone full, pausing robot");
        self.push_control(robot, TaskType::Pause, ZoneKey::zone(zone), vec![CommitAction::Persist])?;
        Ok(false)
    }

    /// Queue an INIT task for the first (sub)zone whose stand-by period ran out.
    pub(super) fn prepare_init(&mut self, robot: RobotId) -> Result<bool> {
        if let Some(blocking) = self.config.app.init_blocking_zone {
            if self.tree.get(blocking)?.total_count() > 0 {
                return Ok(false);
            }
        }
        let now = Utc::now();
        let due = self.tree.iter().find_map(|zone| {
            if zone.has_subzones() {
                zone.subzones()
                    .iter()
                    .find(|s| s.initialize_needed(now))
                    .map(|s| ZoneKey::subzone(zone.id, s.id))
            } else {
                zone.initialize_needed(now).then_some(ZoneKey::zone(zone.id))
            }
        });
        let Some(key) = due else {
            return Ok(false);
        };
        self.push_control(
            robot,
            TaskType::Init,
            key,
            vec![CommitAction::Initialize { key, wait: true }],
        )?;
        Ok(true)
    }

    /// Start the first (sub)zone of `zone_id` that is ready to start.
    pub(super) fn prepare_start(&mut self, zone_id: ZoneId, robot: RobotId) -> Result<bool> {
        let zone = self.tree.get(zone_id)?;
        let key = if zone.has_subzones() {
            zone.subzones()
                .iter()
                .find(|s| s.phase() == ZonePhase::ReadyToStart)
                .map(|s| ZoneKey::subzone(zone_id, s.id))
        } else {
            zone.is_ready_to_start().then_some(ZoneKey::zone(zone_id))
        };
        let Some(key) = key else {
            return Ok(false);
        };
        self.push_control(
            robot,
            TaskType::Start,
            key,
            vec![
                CommitAction::StartZone(key),
                CommitAction::Initialize { key, wait: false },
            ],
        )?;
        Ok(true)
    }

    /// Queue a STOP for every subzone of the rule's source that is ready to
    /// stop and passes the rule's pre-checks.
    pub(super) fn prepare_stop(&mut self, transition: TransitionId, robot: RobotId) -> Result<bool> {
        let zone_id = self.rule(transition)?.curr_zone;
        let zone = self.tree.get(zone_id)?;
        let candidates: Vec<ZoneKey> = if zone.has_subzones() {
            zone.subzones()
                .iter()
                .filter(|s| s.is_ready_to_stop())
                .map(|s| ZoneKey::subzone(zone_id, s.id))
                .collect()
        } else if zone.is_ready_to_stop() {
            vec![ZoneKey::zone(zone_id)]
        } else {
            Vec::new()
        };
        let mut queued = false;
        for key in candidates {
            let args = HookArgs {
                transition,
                curr: Some(key),
                next: None,
                robot,
            };
            if !self.run_hooks(HookStage::PreChecks, &args)? {
                continue;
            }
            self.push_control(
                robot,
                TaskType::Stop,
                key,
                vec![
                    CommitAction::AdvancePhase(key),
                    CommitAction::Initialize { key, wait: false },
                ],
            )?;
            queued = true;
        }
        Ok(queued)
    }
}
