//! The per-poll decision loop.

use tracing::{debug, warn};

use crate::audit::AuditEvent;
use crate::error::{Error, Result};
use crate::types::{RobotId, Task, TransitionId};
use crate::zone::ZoneMark;

use super::rotation::Rotation;
use super::world::WorldState;

/// World state a planning cycle may touch through hooks and cursors.
struct Checkpoint {
    zones: Vec<ZoneMark>,
    cursors: Vec<(TransitionId, Option<usize>, Option<usize>)>,
    rotation: Rotation,
}

impl WorldState {
    /// Answer one poll: confirm the robot's previous task, then hand out the
    /// next queued task, planning new work when the queue is empty.
    pub(crate) fn get_task(&mut self, robot: RobotId) -> Result<Task> {
        if !self.queues.knows(robot) {
            return Err(Error::UnknownRobot { robot_id: robot });
        }
        if let Some(previous) = self.last_issued.remove(&robot) {
            if let Err(err) = self.execute_future(previous) {
                warn!(robot, correlation_id = previous, error = %err, "commit failed");
            }
        }
        if self.queues.is_empty(robot) {
            self.plan(robot)?;
        }
        let Some(task) = self.queues.pop(robot) else {
            return Ok(Task::noop());
        };
        if task.correlation_id != 0 {
            self.last_issued.insert(robot, task.correlation_id);
        }
        self.record(AuditEvent::task_issued(robot, task.kind(), task.correlation_id));
        Ok(task)
    }

    /// Plan one cycle. A failing hook or rule leaves no queued task and no
    /// registered future behind, and undoes zone, cursor and rotation changes
    /// made by the cycle's hooks.
    fn plan(&mut self, robot: RobotId) -> Result<()> {
        self.cycle.clear();
        let queued = self.queues.len(robot);
        let checkpoint = self.checkpoint();
        let outcome = self.plan_cycle(robot);
        if let Err(err) = &outcome {
            debug!(robot, error = %err, "planning failed, rewinding");
            for id in std::mem::take(&mut self.cycle) {
                self.futures.discard(id);
            }
            self.queues.truncate(robot, queued);
            self.rewind(checkpoint);
        }
        self.cycle.clear();
        outcome
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            zones: self.tree.iter().map(|z| z.mark()).collect(),
            cursors: self
                .rules
                .values()
                .map(|r| (r.id, r.pick_index.get(), r.place_index.get()))
                .collect(),
            rotation: self.rotation.clone(),
        }
    }

    fn rewind(&mut self, checkpoint: Checkpoint) {
        for (zone, mark) in self.tree.iter_mut().zip(&checkpoint.zones) {
            zone.rewind(mark);
        }
        for (id, pick, place) in checkpoint.cursors {
            if let Some(rule) = self.rules.get(&id) {
                rule.pick_index.set(pick);
                rule.place_index.set(place);
            }
        }
        self.rotation = checkpoint.rotation;
    }

    fn plan_cycle(&mut self, robot: RobotId) -> Result<()> {
        self.rotation.advance_if_due();
        if !self.check_capacity(robot)? {
            return Ok(());
        }
        if self.prepare_init(robot)? {
            return Ok(());
        }
        for transition in self.rotation.transitions_for(robot) {
            if self.prepare_task(transition, robot)? {
                debug!(robot, transition, "transition produced work");
                return Ok(());
            }
        }
        Ok(())
    }

    /// Movement first, then stop, then start on the rule's source zone.
    fn prepare_task(&mut self, transition: TransitionId, robot: RobotId) -> Result<bool> {
        if self.prepare_movement(transition, robot)? {
            return Ok(true);
        }
        if self.prepare_stop(transition, robot)? {
            return Ok(true);
        }
        let zone = self.rule(transition)?.curr_zone;
        self.prepare_start(zone, robot)
    }
}
