//! Transition rotation: several per-robot transition orders and a shared
//! cursor advanced by batch counters.

use std::collections::HashMap;

use tracing::info;

use crate::config::{RotationConfig, TransitionOrderConfig};
use crate::types::{RobotId, TransitionId, ZoneId};

#[derive(Debug, Clone)]
pub(crate) struct Rotation {
    orders: Vec<(u32, HashMap<RobotId, Vec<TransitionId>>)>,
    cursor: usize,
    counters: HashMap<ZoneId, u32>,
    threshold: u32,
    start_zones: Vec<ZoneId>,
}

impl Rotation {
    pub fn from_config(orders: &[TransitionOrderConfig], rotation: &RotationConfig) -> Self {
        let mut orders: Vec<(u32, HashMap<RobotId, Vec<TransitionId>>)> = orders
            .iter()
            .map(|order| {
                let lists = order
                    .robots
                    .iter()
                    .map(|r| (r.robot, r.transitions.clone()))
                    .collect();
                (order.order_id, lists)
            })
            .collect();
        orders.sort_by_key(|(id, _)| *id);
        Self {
            orders,
            cursor: 0,
            counters: HashMap::new(),
            threshold: rotation.batch_threshold.max(1),
            start_zones: rotation.batch_start_zones.clone(),
        }
    }

    pub fn current_order(&self) -> Option<u32> {
        self.orders.get(self.cursor).map(|(id, _)| *id)
    }

    /// The robot's transition list in the current order.
    pub fn transitions_for(&self, robot: RobotId) -> Vec<TransitionId> {
        self.orders
            .get(self.cursor)
            .and_then(|(_, lists)| lists.get(&robot))
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_batch_start_zone(&self, zone: ZoneId) -> bool {
        self.start_zones.contains(&zone)
    }

    pub fn bump(&mut self, zone: ZoneId) {
        *self.counters.entry(zone).or_insert(0) += 1;
    }

    pub fn count(&self, zone: ZoneId) -> u32 {
        self.counters.get(&zone).copied().unwrap_or(0)
    }

    /// Move to the next order once any counter has reached the threshold.
    pub fn advance_if_due(&mut self) -> bool {
        if self.orders.len() < 2 || !self.counters.values().any(|&c| c >= self.threshold) {
            return false;
        }
        self.counters.clear();
        self.cursor = (self.cursor + 1) % self.orders.len();
        info!(order = ?self.current_order(), "transition order advanced");
        true
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
        self.counters.clear();
    }
}
