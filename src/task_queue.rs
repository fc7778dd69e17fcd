//! Per-robot FIFO queues of issued tasks.
//!
//! One scheduling decision may enqueue several steps (a door task ahead of a
//! movement, say); polls drain the robot's queue before new work is planned.

use std::collections::{HashMap, VecDeque};

use crate::types::{RobotId, Task};

/// FIFO queue per configured robot.
#[derive(Debug, Default)]
pub struct RobotQueues {
    queues: HashMap<RobotId, VecDeque<Task>>,
}

impl RobotQueues {
    /// Create an empty queue for every robot.
    pub fn new(robots: &[RobotId]) -> Self {
        Self {
            queues: robots.iter().map(|&r| (r, VecDeque::new())).collect(),
        }
    }

    pub fn knows(&self, robot: RobotId) -> bool {
        self.queues.contains_key(&robot)
    }

    /// Append a task; returns it back if the robot is unknown.
    pub fn push(&mut self, robot: RobotId, task: Task) -> Result<(), Task> {
        match self.queues.get_mut(&robot) {
            Some(queue) => {
                queue.push_back(task);
                Ok(())
            }
            None => Err(task),
        }
    }

    /// Pop the head of the robot's queue.
    pub fn pop(&mut self, robot: RobotId) -> Option<Task> {
        self.queues.get_mut(&robot)?.pop_front()
    }

    pub fn len(&self, robot: RobotId) -> usize {
        self.queues.get(&robot).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, robot: RobotId) -> bool {
        self.len(robot) == 0
    }

    /// Drop everything queued after the first `len` entries.
    pub fn truncate(&mut self, robot: RobotId, len: usize) -> Vec<Task> {
        match self.queues.get_mut(&robot) {
            Some(queue) if queue.len() > len => queue.split_off(len).into_iter().collect(),
            _ => Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        for queue in self.queues.values_mut() {
            queue.clear();
        }
    }
}
