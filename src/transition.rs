//! Declarative transition rules.

use std::cell::Cell;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::{SlotOrder, TransitionConfig};
use crate::types::{ColorId, ItemType, TransitionId, VialTypeId, ZoneId, ZonePhase};

/// Inputs to matching that are not part of a rule or a vial.
#[derive(Clone, Copy, Debug)]
pub struct MatchContext {
    pub now: DateTime<Utc>,
    pub disposal_time: Option<Duration>,
}

impl MatchContext {
    pub fn new(disposal_time: Option<Duration>) -> Self {
        Self {
            now: Utc::now(),
            disposal_time,
        }
    }
}

/// A rule linking a source zone/phase set to a destination zone/phase set.
///
/// Apart from its slot cursors the rule never changes after startup.
#[derive(Debug, Clone)]
pub struct ZoneTransition {
    pub id: TransitionId,
    pub curr_zone: ZoneId,
    pub curr_phases: Vec<ZonePhase>,
    pub next_zone: ZoneId,
    pub next_phases: Vec<ZonePhase>,
    pub colors: Vec<ColorId>,
    pub types: Vec<VialTypeId>,
    pub transits: Vec<String>,
    pub centrifuged: Option<bool>,
    pub item_type: ItemType,
    pub disposable: bool,
    pub zone_type: Option<u32>,
    pub pre_checks: Vec<String>,
    pub pre_operations: Vec<String>,
    pub post_operations: Vec<String>,
    pub pre_tasks: Vec<String>,
    pub orig_trans_ids: Vec<TransitionId>,
    pub possible_next_trans_ids: Vec<TransitionId>,
    pub no_curr_phase_change: bool,
    pub no_next_phase_change: bool,
    pub order_by: Option<SlotOrder>,
    pub target_zone: Option<ZoneId>,
    pub control_process_check: bool,
    /// Round-robin slot cursors; `None` means a linear scan from the start.
    pub pick_index: Cell<Option<usize>>,
    pub place_index: Cell<Option<usize>>,
    initial_pick_index: Option<usize>,
    initial_place_index: Option<usize>,
}

impl ZoneTransition {
    pub fn from_config(config: &TransitionConfig) -> Self {
        Self {
            id: config.transition_id,
            curr_zone: config.curr_zone,
            curr_phases: config.curr_phases.clone(),
            next_zone: config.next_zone,
            next_phases: config.next_phases.clone(),
            colors: config.colors.clone(),
            types: config.types.clone(),
            transits: config.transits.clone(),
            centrifuged: config.centrifuged,
            item_type: config.item_type,
            disposable: config.disposable,
            zone_type: config.zone_type,
            pre_checks: config.pre_checks.clone(),
            pre_operations: config.pre_operations.clone(),
            post_operations: config.post_operations.clone(),
            pre_tasks: config.pre_tasks.clone(),
            orig_trans_ids: config.orig_transitions.clone(),
            possible_next_trans_ids: config.possible_next_transitions.clone(),
            no_curr_phase_change: config.no_curr_phase_change,
            no_next_phase_change: config.no_next_phase_change,
            order_by: config.order_by,
            target_zone: config.target_zone,
            control_process_check: config.control_process_check,
            pick_index: Cell::new(config.pick_index),
            place_index: Cell::new(config.place_index),
            initial_pick_index: config.pick_index,
            initial_place_index: config.place_index,
        }
    }

    /// Every hook name this rule refers to.
    pub fn hook_names(&self) -> impl Iterator<Item = &str> {
        self.pre_checks
            .iter()
            .chain(&self.pre_operations)
            .chain(&self.post_operations)
            .chain(&self.pre_tasks)
            .map(String::as_str)
    }

    /// Rewind configured cursors to the start.
    pub fn reset_cursors(&self) {
        self.pick_index.set(self.initial_pick_index.map(|_| 0));
        self.place_index.set(self.initial_place_index.map(|_| 0));
    }

    /// A zone type on either side that is unset is compatible with anything.
    pub fn zone_type_compatible(&self, zone_type: Option<u32>) -> bool {
        match (self.zone_type, zone_type) {
            (Some(wanted), Some(actual)) => wanted == actual,
            _ => true,
        }
    }

    pub fn colors_for(&self, moving_color: Option<ColorId>) -> Vec<ColorId> {
        if self.colors.is_empty() {
            moving_color.into_iter().collect()
        } else {
            self.colors.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> ZoneTransition {
        let config: TransitionConfig = toml::from_str(text).expect("transition config");
        ZoneTransition::from_config(&config)
    }

    #[test]
    fn hook_names_cover_every_list() {
        let t = parse(
            r#"
            transition_id = 3
            curr_zone = 1
            next_zone = 2
            pre_checks = ["check_items"]
            pre_operations = ["open_door_next"]
            post_operations = ["export_data"]
            pre_tasks = ["close_door_next"]
            "#,
        );
        let names: Vec<&str> = t.hook_names().collect();
        assert_eq!(
            names,
            vec!["check_items", "open_door_next", "export_data", "close_door_next"]
        );
    }

    #[test]
    fn reset_rewinds_only_configured_cursors() {
        let t = parse("transition_id = 1\ncurr_zone = 1\nnext_zone = 2\npick_index = 3\n");
        t.pick_index.set(Some(5));
        t.reset_cursors();
        assert_eq!(t.pick_index.get(), Some(0));
        assert_eq!(t.place_index.get(), None);
    }

    #[test]
    fn zone_type_unset_is_compatible() {
        let mut t = parse("transition_id = 1\ncurr_zone = 1\nnext_zone = 2\n");
        assert!(t.zone_type_compatible(Some(4)));
        t.zone_type = Some(2);
        assert!(t.zone_type_compatible(None));
        assert!(!t.zone_type_compatible(Some(4)));
        assert!(t.zone_type_compatible(Some(2)));
    }
}
