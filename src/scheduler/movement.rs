//! Movement planning for one transition rule.

use tracing::debug;

use crate::audit::AuditEvent;
use crate::error::Result;
use crate::hooks::{HookArgs, HookStage};
use crate::types::{ItemType, RobotId, SlotRef, Task, TaskType, TransitionId, ZoneKey};

use super::cascade::update_possible_next_zone;
use super::world::{CommitAction, WorldState, ZoneTree};

impl WorldState {
    /// Try to queue a movement for `transition`. Returns true when the rule
    /// produced work for the robot this cycle (a task or a phase change).
    pub(super) fn prepare_movement(&mut self, transition: TransitionId, robot: RobotId) -> Result<bool> {
        let (curr_id, next_id, item_type) = {
            let rule = self.rule(transition)?;
            (rule.curr_zone, rule.next_zone, rule.item_type)
        };
        self.tree.get(curr_id)?;
        self.tree.get(next_id)?;
        let queued_before = self.queues.len(robot);

        let whole = HookArgs {
            transition,
            curr: Some(ZoneKey::zone(curr_id)),
            next: Some(ZoneKey::zone(next_id)),
            robot,
        };
        self.run_hooks(HookStage::PreOperations, &whole)?;

        let ctx = self.match_context();
        let rule = self.rule(transition)?;
        let curr = self.tree.get(curr_id)?;
        let next = self.tree.get(next_id)?;

        let curr_gate = curr.has_subzones()
            || (curr.phase_allowed(&rule.curr_phases) && rule.zone_type_compatible(curr.zone_type));
        if !curr_gate {
            update_possible_next_zone(self, transition, ZoneKey::zone(curr_id), None)?;
            return Ok(false);
        }
        let pick = curr.pick_selection(rule, &ctx);
        let curr_key = ZoneTree::key_for(curr, pick.subzone);
        if curr.has_subzones() && pick.subzone.is_none() {
            update_possible_next_zone(self, transition, curr_key, None)?;
            return Ok(false);
        }

        let next_gate = next.has_subzones()
            || (next.phase_allowed(&rule.next_phases) && rule.zone_type_compatible(next.zone_type));
        let curr_target = self.tree.target(curr_key)?;
        let moving = pick.slot.map(|i| &curr_target.slots()[i]);
        let colors = rule.colors_for(moving.and_then(|s| s.content()).and_then(|v| v.color));
        let place = if next_gate {
            next.place_selection(rule, &colors)
        } else {
            Default::default()
        };
        if !next_gate || (next.has_subzones() && place.subzone.is_none()) {
            update_possible_next_zone(self, transition, curr_key, None)?;
            return Ok(false);
        }
        let next_key = ZoneTree::key_for(next, place.subzone);
        let next_target = self.tree.target(next_key)?;
        let curr_slot = moving.map(|s| SlotRef::new(curr_key, s.position));
        let next_slot = place
            .slot
            .map(|i| SlotRef::new(next_key, next_target.slots()[i].position));

        let args = HookArgs {
            transition,
            curr: Some(curr_key),
            next: Some(next_key),
            robot,
        };
        if !self.run_hooks(HookStage::PreChecks, &args)? {
            return Ok(false);
        }
        if self.queues.len(robot) > queued_before {
            return Ok(true);
        }
        if let Some(decided) = update_possible_next_zone(self, transition, curr_key, curr_slot)? {
            return Ok(decided);
        }

        if item_type == ItemType::Vial {
            let rule = self.rule(transition)?;
            let target_ready = self.tree.target_ready(rule)?;
            let no_next = rule.no_next_phase_change;
            if curr_slot.is_none() {
                let unchained = rule.possible_next_trans_ids.is_empty() && rule.orig_trans_ids.is_empty();
                let dest = self.tree.target_mut(next_key)?;
                return Ok(unchained && dest.is_loading() && !no_next && target_ready && dest.progress_phase());
            }
            if next_slot.is_none() {
                let dest = self.tree.target_mut(next_key)?;
                let dest_full = next_key.subzone.is_some() && dest.next_empty_slot().is_none();
                return Ok((!no_next || dest_full) && target_ready && dest.progress_phase());
            }
        }

        let task = self.movement_task(transition, robot, curr_key, next_key, curr_slot, next_slot)?;
        let actions = self.movement_actions(transition, robot, curr_key, next_key, curr_slot, next_slot)?;
        self.register_future(task.correlation_id, actions);
        self.run_hooks(HookStage::PreTasks, &args)?;
        debug!(robot, transition, from = %curr_key, to = %next_key, "movement queued");
        self.push_task(robot, task)?;
        Ok(true)
    }

    fn movement_task(
        &mut self,
        transition: TransitionId,
        robot: RobotId,
        curr_key: ZoneKey,
        next_key: ZoneKey,
        curr_slot: Option<SlotRef>,
        next_slot: Option<SlotRef>,
    ) -> Result<Task> {
        let item_type = self.rule(transition)?.item_type;
        let vial = curr_slot.and_then(|at| self.tree.vial(at));
        let (vial_type, color, decapped) = match vial {
            Some(v) => (v.vial_type.unwrap_or(1), v.color.unwrap_or(0), v.decapped),
            None => (1, 0, false),
        };
        let curr_idx = curr_slot.map_or(0, |s| s.position);
        let next_idx = next_slot.map_or(0, |s| s.position);
        let curr_wp = self.waypoints.pose(robot, curr_key.zone, curr_key.subzone_code(), item_type, curr_idx);
        let next_wp = self.waypoints.pose(robot, next_key.zone, next_key.subzone_code(), item_type, next_idx);
        Ok(Task {
            curr_zone: curr_key.zone,
            next_zone: next_key.zone,
            curr_subzone: curr_key.subzone_code(),
            next_subzone: next_key.subzone_code(),
            curr_wp,
            next_wp,
            curr_task: Some(TaskType::Unload),
            next_task: Some(TaskType::Load),
            item_type: Some(item_type),
            vial_type,
            correlation_id: self.new_correlation_id(),
            color,
            decapped,
            curr_idx,
            next_idx,
        })
    }

    fn movement_actions(
        &self,
        transition: TransitionId,
        robot: RobotId,
        curr_key: ZoneKey,
        next_key: ZoneKey,
        curr_slot: Option<SlotRef>,
        next_slot: Option<SlotRef>,
    ) -> Result<Vec<CommitAction>> {
        let post = CommitAction::PostOperations {
            transition,
            curr: curr_key,
            next: next_key,
            robot,
        };
        let curr_name = self.tree.target(curr_key)?.name.clone();
        let next_name = self.tree.target(next_key)?.name.clone();
        let item_type = self.rule(transition)?.item_type;
        let (ItemType::Vial, Some(from), Some(to)) = (item_type, curr_slot, next_slot) else {
            let zone_type = self.tree.target(curr_key)?.zone_type;
            return Ok(vec![
                CommitAction::MoveZoneContents {
                    from: curr_key,
                    to: next_key,
                },
                CommitAction::AdvancePhase(curr_key),
                CommitAction::AdvancePhase(next_key),
                CommitAction::Audit(AuditEvent::ZoneMoved {
                    from: curr_name,
                    to: next_name,
                    zone_type,
                    transition,
                }),
                post,
            ]);
        };
        let vial = self.tree.vial(from);
        let event = AuditEvent::VialMoved {
            robot,
            line_code: vial.map(|v| v.line_code.clone()).unwrap_or_default(),
            transit: vial.and_then(|v| v.active_transit().map(str::to_string)),
            emergency: vial.is_some_and(|v| v.emergency),
            from: AuditEvent::slot_label(&curr_name, from),
            to: AuditEvent::slot_label(&next_name, to),
            transition,
        };
        Ok(vec![
            CommitAction::Audit(event),
            CommitAction::MoveVial { from, to },
            CommitAction::Cascade {
                transition,
                curr: curr_key,
                next: next_key,
            },
            post,
        ])
    }
}
