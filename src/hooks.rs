//! Named hooks referenced by transition rules.
//!
//! Every hook has the same signature and sees the whole world. Guard stages
//! treat `false` as a veto. `close_locks` and `is_counter_needed` change state
//! before vetoing; `can_unload_counter` advances an emptied source and then
//! lets the transition through.

use std::collections::HashMap;

use chrono::{Local, Utc};

use crate::config::parse_clock;
use crate::error::{Error, Result};
use crate::scheduler::world::WorldState;
use crate::transition::ZoneTransition;
use crate::types::{RobotId, TransitionId, ZoneId, ZoneKey, ZonePhase};

/// Arguments passed to every hook.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HookArgs {
    pub transition: TransitionId,
    pub curr: Option<ZoneKey>,
    pub next: Option<ZoneKey>,
    pub robot: RobotId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HookStage {
    PreChecks,
    PreOperations,
    PostOperations,
    PreTasks,
}

impl HookStage {
    pub fn stops_on_false(self) -> bool {
        matches!(self, HookStage::PreChecks)
    }
}

pub(crate) type HookFn = fn(&mut WorldState, &HookArgs) -> Result<bool>;

pub(crate) struct HookRegistry {
    hooks: HashMap<&'static str, HookFn>,
}

impl HookRegistry {
    pub fn builtin() -> Self {
        let mut hooks: HashMap<&'static str, HookFn> = HashMap::new();
        // guards
        hooks.insert("check_items", check_items);
        hooks.insert("is_curr_zone_active", is_curr_zone_active);
        hooks.insert("is_next_zone_active", is_next_zone_active);
        hooks.insert("check_sensor", check_sensor);
        hooks.insert("check_disposal_time", check_disposal_time);
        hooks.insert("retests_exists", retests_exists);
        hooks.insert("is_not_waiting_period", is_not_waiting_period);
        hooks.insert("can_open_archive", can_open_archive);
        hooks.insert("is_not_down_time", is_not_down_time);
        hooks.insert("is_controls_time", is_controls_time);
        // phases
        hooks.insert("progress_curr_phase", progress_curr_phase);
        hooks.insert("progress_next_phase", progress_next_phase);
        hooks.insert("progress_next_phase_strictly", progress_next_phase_strictly);
        hooks.insert("change_to_unloading", change_to_unloading);
        hooks.insert("fill_archive", fill_archive);
        hooks.insert("zone_reset", zone_reset);
        // doors
        hooks.insert("open_door_curr", open_door_curr);
        hooks.insert("open_door_next", open_door_next);
        hooks.insert("close_door_next", close_door_next);
        hooks.insert("open_common_door_next", open_common_door_next);
        hooks.insert("close_common_door_curr", close_common_door_curr);
        hooks.insert("close_common_door_next", close_common_door_next);
        hooks.insert("open_locks", open_locks);
        hooks.insert("close_locks", close_locks);
        // counter balance
        hooks.insert("is_counter_needed", is_counter_needed);
        hooks.insert("can_unload_counter", can_unload_counter);
        // vials
        hooks.insert("set_centrifuged", set_centrifuged);
        hooks.insert("set_centrifuged_all", set_centrifuged_all);
        hooks.insert("set_decapped", set_decapped);
        hooks.insert("set_added_time", set_added_time);
        hooks.insert("update_emergency", update_emergency);
        hooks.insert("progress_transit", progress_transit);
        // zones
        hooks.insert("reset_zone_type", reset_zone_type);
        hooks.insert("update_place_index", update_place_index);
        hooks.insert("update_pick_index", update_pick_index);
        hooks.insert("count_batch", count_batch);
        hooks.insert("calculate_runtime", calculate_runtime);
        hooks.insert("export_data", export_data);
        Self { hooks }
    }

    /// Fail on the first hook name of `rule` that is not registered.
    pub fn validate(&self, rule: &ZoneTransition) -> Result<()> {
        match rule.hook_names().find(|name| !self.hooks.contains_key(name)) {
            Some(name) => Err(Error::UnknownHook {
                transition_id: rule.id,
                name: name.to_string(),
            }),
            None => Ok(()),
        }
    }

    pub fn get(&self, transition: TransitionId, name: &str) -> Result<HookFn> {
        self.hooks.get(name).copied().ok_or_else(|| Error::UnknownHook {
            transition_id: transition,
            name: name.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }
}

// ---- guards ---------------------------------------------------------------

fn check_items(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    let (Some(curr), Some(next)) = (a.curr, a.next) else {
        return Ok(false);
    };
    let ctx = w.match_context();
    let rule = w.rule(a.transition)?;
    let has_item = w.tree.target(curr)?.any_item_for(rule, &ctx);
    let has_space = w.tree.target(next)?.any_empty_for(rule, &rule.colors);
    Ok(has_item && has_space)
}

fn is_curr_zone_active(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    match a.curr {
        Some(curr) => Ok(w.tree.target(curr)?.is_active_zone()),
        None => Ok(false),
    }
}

fn is_next_zone_active(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    match a.next {
        Some(next) => Ok(w.tree.target(next)?.is_active_zone()),
        None => Ok(false),
    }
}

/// Zones without a sensor always pass; an unreported sensor reads as off.
fn check_sensor(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    let Some(curr) = a.curr else {
        return Ok(false);
    };
    Ok(match w.tree.target(curr)?.sensor_id {
        Some(id) => w.sensors.get(&id).copied().unwrap_or(false),
        None => true,
    })
}

/// The most recently added vial of the source is past the disposal interval.
fn check_disposal_time(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    let Some(curr) = a.curr else {
        return Ok(false);
    };
    let ctx = w.match_context();
    Ok(w.tree
        .target(curr)?
        .vials()
        .into_iter()
        .max_by_key(|v| v.added_time)
        .is_some_and(|v| v.is_disposable(&ctx)))
}

fn retests_exists(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    let Some(curr) = a.curr else {
        return Ok(false);
    };
    let ctx = w.match_context();
    let rule = w.rule(a.transition)?;
    Ok(w.tree.target(curr)?.any_item_for(rule, &ctx))
}

/// No part of the destination device is inside its post-init wait.
fn is_not_waiting_period(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    let zone = w.tree.get(w.rule(a.transition)?.next_zone)?;
    let now = Utc::now();
    Ok(if zone.has_subzones() {
        zone.subzones().iter().all(|s| s.is_not_waiting_period(now))
    } else {
        zone.is_not_waiting_period(now)
    })
}

/// Only one archive may have its door open at a time.
fn can_open_archive(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    let rule = w.rule(a.transition)?;
    let involved = [rule.curr_zone, rule.next_zone];
    let busy = w
        .config
        .app
        .archive_zone_ids
        .iter()
        .filter(|id| !involved.contains(id))
        .filter_map(|id| w.tree.get(*id).ok())
        .any(|z| z.door_opened || z.subzones().iter().any(|s| s.door_opened));
    Ok(!busy)
}

fn is_not_down_time(w: &mut WorldState, _a: &HookArgs) -> Result<bool> {
    let Some(window) = &w.config.app.down_time else {
        return Ok(true);
    };
    let (start, end) = window.bounds()?;
    let now = Local::now().time();
    let inside = if start <= end {
        now >= start && now < end
    } else {
        now >= start || now < end
    };
    Ok(!inside)
}

fn is_controls_time(w: &mut WorldState, _a: &HookArgs) -> Result<bool> {
    match &w.config.app.controls_time {
        Some(at) => Ok(Local::now().time() >= parse_clock(at)?),
        None => Ok(false),
    }
}

// ---- phases ---------------------------------------------------------------

fn progress_curr_phase(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    let Some(curr) = a.curr else {
        return Ok(true);
    };
    let ctx = w.match_context();
    let rule = w.rule(a.transition)?;
    if !w.tree.target(curr)?.any_item_for(rule, &ctx) {
        w.tree.target_mut(curr)?.progress_phase();
    }
    Ok(true)
}

fn progress_next_phase(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    let Some(next) = a.next else {
        return Ok(true);
    };
    let zone = w.tree.target_mut(next)?;
    if zone.next_empty_slot().is_none() {
        zone.progress_phase();
    }
    Ok(true)
}

fn progress_next_phase_strictly(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    if let Some(next) = a.next {
        w.tree.target_mut(next)?.progress_phase();
    }
    Ok(true)
}

fn change_to_unloading(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    if let Some(curr) = a.curr {
        let zone = w.tree.target_mut(curr)?;
        if zone.phase() == ZonePhase::ReadyToUnload {
            zone.progress_phase();
        }
    }
    Ok(true)
}

/// A full archive is handed over for unloading.
fn fill_archive(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    if let Some(next) = a.next {
        let zone = w.tree.target_mut(next)?;
        if zone.next_empty_slot().is_none() && zone.phase() != ZonePhase::ReadyToUnload {
            zone.reset_phase(ZonePhase::ReadyToUnload);
        }
    }
    Ok(true)
}

fn zone_reset(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    if let Some(next) = a.next {
        w.tree.target_mut(next)?.reset_phase(ZonePhase::ReadyToProcess);
    }
    Ok(true)
}

// ---- doors ----------------------------------------------------------------

/// Open the door of `zone_id` (or of its first subzone in `phases`). Passes
/// when the door is already open or an open task was queued.
fn open_door(
    w: &mut WorldState,
    zone_id: ZoneId,
    phases: &[ZonePhase],
    partner_ok: bool,
    robot: RobotId,
) -> Result<bool> {
    let zone = w.tree.get(zone_id)?;
    let target = if zone.has_common_door || !zone.has_subzones() {
        if zone.door_opened {
            return Ok(true);
        }
        (partner_ok && zone.phase_allowed(phases)).then_some((ZoneKey::zone(zone_id), false))
    } else {
        zone.subzones()
            .iter()
            .find(|s| s.phase_allowed(phases))
            .map(|s| (ZoneKey::subzone(zone_id, s.id), s.door_opened))
    };
    match target {
        None => Ok(false),
        Some((_, true)) => Ok(true),
        Some((key, false)) => {
            let progress = !zone.has_common_door;
            w.push_door_task(robot, key, true, progress)?;
            Ok(true)
        }
    }
}

fn open_door_curr(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    let rule = w.rule(a.transition)?;
    let (curr, next, phases) = (rule.curr_zone, rule.next_zone, rule.curr_phases.clone());
    let next_ok = w.tree.get(next)?.phase_allowed(&w.rule(a.transition)?.next_phases);
    open_door(w, curr, &phases, next_ok, a.robot)
}

fn open_door_next(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    let rule = w.rule(a.transition)?;
    let (next, phases) = (rule.next_zone, rule.next_phases.clone());
    open_door(w, next, &phases, true, a.robot)
}

/// Close the destination once nothing more can be moved into it.
fn close_door_next(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    let Some(next) = a.next else {
        return Ok(true);
    };
    if !w.tree.target(next)?.door_opened || check_items(w, a)? {
        return Ok(true);
    }
    w.push_door_task(a.robot, next, false, true)?;
    Ok(true)
}

fn open_common_door_next(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    let rule = w.rule(a.transition)?;
    let curr_ok = w.tree.get(rule.curr_zone)?.phase_allowed(&rule.curr_phases);
    let next = w.tree.get(rule.next_zone)?;
    if next.door_opened {
        return Ok(true);
    }
    if !curr_ok || !next.phase_allowed(&rule.next_phases) {
        return Ok(false);
    }
    let key = ZoneKey::zone(next.id);
    w.push_door_task(a.robot, key, true, false)?;
    Ok(true)
}

fn close_common_door(w: &mut WorldState, zone_id: ZoneId, robot: RobotId) -> Result<bool> {
    if w.tree.get(zone_id)?.door_opened {
        w.push_door_task(robot, ZoneKey::zone(zone_id), false, false)?;
    }
    Ok(true)
}

fn close_common_door_curr(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    let zone = w.rule(a.transition)?.curr_zone;
    close_common_door(w, zone, a.robot)
}

fn close_common_door_next(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    let zone = w.rule(a.transition)?.next_zone;
    close_common_door(w, zone, a.robot)
}

fn open_locks(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    let Some(curr) = a.curr else {
        return Ok(false);
    };
    let zone = w.tree.target(curr)?;
    if zone.door_opened {
        return Ok(true);
    }
    if zone.phase() != ZonePhase::PreProcess {
        return Ok(false);
    }
    w.push_door_task(a.robot, curr, true, true)?;
    Ok(true)
}

/// Queues the close when processing is over, and vetoes either way.
fn close_locks(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    let Some(curr) = a.curr else {
        return Ok(false);
    };
    let zone = w.tree.target(curr)?;
    if zone.door_opened && zone.phase() == ZonePhase::PostProcess {
        w.push_door_task(a.robot, curr, false, true)?;
    }
    Ok(false)
}

// ---- counter balance ------------------------------------------------------

/// Passes while the destination holds an odd number of matching vials.
/// On an even count it advances both sides and vetoes.
fn is_counter_needed(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    let Some(next) = a.next else {
        return Ok(false);
    };
    let rule = w.rule(a.transition)?;
    let (types, no_curr, no_next) = (
        rule.types.clone(),
        rule.no_curr_phase_change,
        rule.no_next_phase_change,
    );
    let count = w
        .tree
        .target(next)?
        .vials()
        .iter()
        .filter(|v| v.vial_type.is_some_and(|t| types.contains(&t)))
        .count();
    if count % 2 == 1 {
        return Ok(true);
    }
    if !no_next {
        w.tree.target_mut(next)?.progress_phase();
    }
    if let (false, Some(curr)) = (no_curr, a.curr) {
        w.tree.target_mut(curr)?.progress_phase();
    }
    Ok(false)
}

/// Only counter-balance tubes are left in the source.
fn can_unload_counter(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    let Some(curr) = a.curr else {
        return Ok(false);
    };
    let counter = w.config.app.counter_color;
    let no_curr = w.rule(a.transition)?.no_curr_phase_change;
    let zone = w.tree.target_mut(curr)?;
    if zone.vials().iter().any(|v| v.color != counter) {
        return Ok(false);
    }
    if !no_curr && zone.total_count() == 0 {
        zone.progress_phase();
    }
    Ok(true)
}

// ---- vials ----------------------------------------------------------------

fn for_next_vials(w: &mut WorldState, a: &HookArgs, mut f: impl FnMut(&mut crate::vial::Vial)) -> Result<bool> {
    if let Some(next) = a.next {
        for vial in w.tree.target_mut(next)?.vials_mut() {
            f(vial);
        }
    }
    Ok(true)
}

fn set_centrifuged(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    let counter = w.config.app.counter_color;
    for_next_vials(w, a, |v| {
        if v.color != counter || counter.is_none() {
            v.centrifuged = true;
        }
    })
}

fn set_centrifuged_all(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    for_next_vials(w, a, |v| v.centrifuged = true)
}

fn set_decapped(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    for_next_vials(w, a, |v| v.decapped = true)
}

fn set_added_time(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    let now = Utc::now();
    for_next_vials(w, a, |v| v.added_time = now)
}

fn update_emergency(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    for_next_vials(w, a, |v| v.emergency = false)
}

fn progress_transit(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    let final_transit = w.config.app.final_transit.clone();
    for_next_vials(w, a, |v| v.progress_transit(&final_transit))
}

// ---- zones ----------------------------------------------------------------

fn reset_zone_type(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    if let Some(curr) = a.curr {
        w.tree.target_mut(curr)?.zone_type = None;
    }
    Ok(true)
}

/// Move the parent's place cursor past the subzone just filled.
fn update_place_index(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    if let Some(ZoneKey {
        zone,
        subzone: Some(sub),
    }) = a.next
    {
        let parent = w.tree.get_mut(zone)?;
        if let Some(i) = parent.subzone_index(sub) {
            parent.place_index = (i + 1) % parent.subzones().len();
        }
    }
    Ok(true)
}

/// Move the parent's pick cursor past the subzone just emptied.
fn update_pick_index(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    if let Some(ZoneKey {
        zone,
        subzone: Some(sub),
    }) = a.curr
    {
        let parent = w.tree.get_mut(zone)?;
        if let Some(i) = parent.subzone_index(sub) {
            parent.pick_index = (i + 1) % parent.subzones().len();
        }
    }
    Ok(true)
}

fn count_batch(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    let zone = w.rule(a.transition)?.next_zone;
    w.rotation.bump(zone);
    Ok(true)
}

fn calculate_runtime(w: &mut WorldState, a: &HookArgs) -> Result<bool> {
    if let Some(next) = a.next {
        let zone = w.tree.target_mut(next)?;
        if let Some(run_time) = zone.runtime_for_count(zone.total_count()) {
            zone.run_time = run_time;
        }
    }
    Ok(true)
}

fn export_data(w: &mut WorldState, _a: &HookArgs) -> Result<bool> {
    w.persist();
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAudit;
    use crate::config::LabConfig;
    use crate::persistence::MemoryStore;
    use crate::types::{SlotRef, TaskType};
    use crate::vial::Vial;
    use crate::waypoints::WaypointTable;
    use std::sync::Arc;

    const WORLD: &str = r#"
        [app]
        robots = [1]
        counter_color = 9

        [[zones]]
        zone_id = 1
        slot_count = 4
        phase_order = ["READY_TO_UNLOAD", "UNLOADING"]

        [[zones]]
        zone_id = 3
        slot_count = 4
        phase_order = ["READY_TO_LOAD", "LOADING", "READY_TO_START"]
        sensor_id = 12

        [[zones]]
        zone_id = 5
        slot_count = 2
        phase_order = ["PRE_PROCESS", "IN_PROCESS", "POST_PROCESS"]

        [[transitions]]
        transition_id = 1
        curr_zone = 1
        next_zone = 3
        types = [1]
    "#;

    fn world() -> WorldState {
        let config = LabConfig::from_toml_str(WORLD).expect("config");
        WorldState::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryAudit::new()),
            Arc::new(WaypointTable::new()),
        )
        .expect("world")
    }

    fn args(curr: ZoneId, next: Option<ZoneId>) -> HookArgs {
        HookArgs {
            transition: 1,
            curr: Some(ZoneKey::zone(curr)),
            next: next.map(ZoneKey::zone),
            robot: 1,
        }
    }

    fn place(w: &mut WorldState, zone: ZoneId, position: u32, vial: Vial) {
        w.tree
            .slot_mut(SlotRef::new(ZoneKey::zone(zone), position))
            .expect("slot")
            .put(vial);
    }

    #[test]
    fn registry_rejects_unknown_names() {
        let registry = HookRegistry::builtin();
        let config: crate::config::TransitionConfig = toml::from_str(
            "transition_id = 4\ncurr_zone = 1\nnext_zone = 2\npre_checks = [\"check_items\", \"make_coffee\"]\n",
        )
        .expect("transition");
        let err = registry
            .validate(&ZoneTransition::from_config(&config))
            .expect_err("unknown hook");
        assert!(matches!(err, Error::UnknownHook { transition_id: 4, ref name } if name == "make_coffee"));
        assert!(registry.get(4, "export_data").is_ok());
        assert!(registry.len() >= 38);
    }

    #[test]
    fn check_items_needs_source_vial_and_free_slot() {
        let mut w = world();
        assert!(!check_items(&mut w, &args(1, Some(3))).expect("hook"));
        place(&mut w, 1, 1, Vial::new("A", Some(1), Some(1)));
        assert!(check_items(&mut w, &args(1, Some(3))).expect("hook"));
        assert!(!check_items(&mut w, &args(1, None)).expect("hook"));
    }

    #[test]
    fn sensor_defaults_to_off_until_reported() {
        let mut w = world();
        assert!(!check_sensor(&mut w, &args(3, None)).expect("hook"));
        w.sensors.insert(12, true);
        assert!(check_sensor(&mut w, &args(3, None)).expect("hook"));
        assert!(check_sensor(&mut w, &args(1, None)).expect("zone without sensor"));
    }

    #[test]
    fn counter_hook_advances_and_vetoes_on_even_count() {
        let mut w = world();
        place(&mut w, 3, 1, Vial::new("A", Some(1), Some(1)));
        assert!(is_counter_needed(&mut w, &args(1, Some(3))).expect("odd count"));
        assert_eq!(w.tree.get(3).expect("zone").phase(), ZonePhase::ReadyToLoad);

        place(&mut w, 3, 2, Vial::new("B", Some(1), Some(1)));
        assert!(!is_counter_needed(&mut w, &args(1, Some(3))).expect("even count"));
        assert_eq!(w.tree.get(3).expect("zone").phase(), ZonePhase::Loading);
        assert_eq!(w.tree.get(1).expect("zone").phase(), ZonePhase::Unloading);
    }

    #[test]
    fn disposal_gate_follows_operator_setting() {
        let mut w = world();
        let mut old = Vial::new("A", Some(1), Some(1));
        old.added_time = Utc::now() - chrono::Duration::seconds(10);
        place(&mut w, 1, 1, old);
        assert!(!check_disposal_time(&mut w, &args(1, None)).expect("no interval"));
        w.set_disposal_time(Some(3600));
        assert!(!check_disposal_time(&mut w, &args(1, None)).expect("too young"));
        w.set_disposal_time(Some(1));
        assert!(check_disposal_time(&mut w, &args(1, None)).expect("old enough"));
    }

    #[test]
    fn controls_time_is_validated_before_use() {
        let mut w = world();
        assert!(!is_controls_time(&mut w, &args(1, None)).expect("unset"));
        w.set_controls_time(Some("00:00".to_string())).expect("valid time");
        assert!(is_controls_time(&mut w, &args(1, None)).expect("after midnight"));
        let err = w.set_controls_time(Some("24:61".to_string())).expect_err("bad time");
        assert!(matches!(err, Error::Config { .. }));
        assert_eq!(w.config.app.controls_time.as_deref(), Some("00:00"));
    }

    #[test]
    fn counter_hook_without_types_counts_nothing() {
        let mut w = world();
        w.rules.get_mut(&1).expect("rule").types.clear();
        place(&mut w, 3, 1, Vial::new("A", Some(1), Some(1)));
        assert!(!is_counter_needed(&mut w, &args(1, Some(3))).expect("nothing counted"));
        assert_eq!(w.tree.get(3).expect("zone").phase(), ZonePhase::Loading);
    }

    #[test]
    fn close_locks_queues_close_but_still_vetoes() {
        let mut w = world();
        let key = ZoneKey::zone(5);
        {
            let zone = w.tree.target_mut(key).expect("zone");
            zone.set_door(true);
            zone.reset_phase(ZonePhase::PostProcess);
        }
        assert!(!close_locks(&mut w, &args(5, None)).expect("hook"));
        let task = w.queues.pop(1).expect("close task queued");
        assert_eq!(task.kind(), Some(TaskType::Close));
        assert_eq!(task.curr_zone, 5);
        assert!(w.futures.contains(task.correlation_id));
    }

    #[test]
    fn open_locks_only_in_pre_process() {
        let mut w = world();
        assert!(open_locks(&mut w, &args(5, None)).expect("hook"));
        assert_eq!(w.queues.len(1), 1);
        w.tree.target_mut(ZoneKey::zone(5)).expect("zone").progress_phase();
        w.queues.clear();
        assert!(!open_locks(&mut w, &args(5, None)).expect("hook"));
        assert!(w.queues.is_empty(1));
    }

    #[test]
    fn can_unload_counter_sees_only_counter_tubes() {
        let mut w = world();
        place(&mut w, 1, 1, Vial::new("C", Some(9), Some(1)));
        assert!(can_unload_counter(&mut w, &args(1, Some(3))).expect("counter only"));
        place(&mut w, 1, 2, Vial::new("S", Some(2), Some(1)));
        assert!(!can_unload_counter(&mut w, &args(1, Some(3))).expect("sample present"));
    }

    #[test]
    fn can_unload_counter_advances_empty_source_and_allows() {
        let mut w = world();
        assert!(can_unload_counter(&mut w, &args(1, Some(3))).expect("empty source"));
        assert_eq!(w.tree.get(1).expect("zone").phase(), ZonePhase::Unloading);
    }

    #[test]
    fn set_centrifuged_skips_counter_tubes() {
        let mut w = world();
        place(&mut w, 3, 1, Vial::new("C", Some(9), Some(1)));
        place(&mut w, 3, 2, Vial::new("S", Some(2), Some(1)));
        set_centrifuged(&mut w, &args(1, Some(3))).expect("hook");
        let zone = w.tree.get(3).expect("zone");
        let flags: Vec<(String, bool)> = zone
            .vials()
            .iter()
            .map(|v| (v.line_code.clone(), v.centrifuged))
            .collect();
        assert_eq!(flags, vec![("C".to_string(), false), ("S".to_string(), true)]);
    }

    #[test]
    fn fill_archive_hands_over_full_zone() {
        let mut w = world();
        let key = ZoneKey::zone(1);
        place(&mut w, 1, 1, Vial::new("A", None, None));
        fill_archive(&mut w, &args(3, Some(1))).expect("hook");
        w.tree.target_mut(key).expect("zone").progress_phase();
        for p in 2..=4 {
            place(&mut w, 1, p, Vial::new(format!("V{p}"), None, None));
        }
        fill_archive(&mut w, &args(3, Some(1))).expect("hook");
        assert_eq!(w.tree.target(key).expect("zone").phase(), ZonePhase::ReadyToUnload);
    }
}
