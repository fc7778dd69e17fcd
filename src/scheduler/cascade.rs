//! Phase propagation after a confirmed move, and the fallback chain that
//! lets phases progress when a rule finds nothing to move.

use crate::error::{Error, Result};
use crate::transition::{MatchContext, ZoneTransition};
use crate::types::{SlotRef, TransitionId, ZoneKey};

use super::world::{WorldState, ZoneTree};

fn rule_of(
    rules: &std::collections::HashMap<TransitionId, ZoneTransition>,
    id: TransitionId,
) -> Result<&ZoneTransition> {
    rules
        .get(&id)
        .ok_or(Error::UnknownTransition { transition_id: id })
}

/// Advance source and destination phases after a vial of `transition` was
/// moved from `curr` to `next`.
pub(super) fn update_zone_phases(
    w: &mut WorldState,
    transition: TransitionId,
    curr: ZoneKey,
    next: ZoneKey,
    ctx: &MatchContext,
) -> Result<()> {
    let rule = rule_of(&w.rules, transition)?;
    let tree = &mut w.tree;

    if rule.orig_trans_ids.is_empty() {
        if tree.target(next)?.is_loading_started() {
            tree.target_mut(next)?.progress_phase();
        }
        if !tree.target(curr)?.any_item_for(rule, ctx) {
            if !rule.no_next_phase_change && tree.target_ready(rule)? {
                tree.target_mut(next)?.progress_phase();
            }
            let source = tree.target(curr)?;
            if !rule.no_curr_phase_change || (!source.is_exchange && source.next_occupied_slot().is_none()) {
                tree.target_mut(curr)?.progress_phase();
            }
        } else if !tree.target(next)?.any_empty_for(rule, &rule.colors)
            && !rule.no_next_phase_change
            && tree.target_ready(rule)?
        {
            tree.target_mut(next)?.progress_phase();
        }
        return Ok(());
    }

    for &orig_id in &rule.orig_trans_ids {
        let orig = rule_of(&w.rules, orig_id)?;
        let orig_zone = tree.get(orig.curr_zone)?;
        let picked = orig_zone.peek_pick(orig, ctx);
        let orig_key = ZoneTree::key_for(orig_zone, picked.subzone);
        let orig_emergency = match picked.slot {
            Some(i) => tree.target(orig_key)?.slots()[i].content().map(|v| v.emergency),
            None => None,
        };

        if tree.target(next)?.is_loading_started() {
            tree.target_mut(next)?.progress_phase();
        }
        let curr_has_item = tree.target(curr)?.any_item_for(rule, ctx);
        if !curr_has_item && !rule.no_curr_phase_change {
            tree.target_mut(curr)?.progress_phase();
        }

        if orig_emergency == Some(false) && tree.target(next)?.is_emergency_zone() && tree.target_ready(rule)? {
            if !rule.no_next_phase_change {
                tree.target_mut(next)?.progress_phase();
            }
        } else if orig_emergency.is_none() && !curr_has_item {
            match orig.orig_trans_ids.first() {
                Some(&relay_id) => {
                    let relay = rule_of(&w.rules, relay_id)?;
                    let relay_zone = tree.get(relay.curr_zone)?;
                    let relay_pick = relay_zone.peek_pick(relay, ctx);
                    let relay_key = ZoneTree::key_for(relay_zone, relay_pick.subzone);
                    if relay_pick.slot.is_none() {
                        if !relay.no_curr_phase_change {
                            tree.target_mut(relay_key)?.progress_phase();
                        }
                        let relay_empty = relay_pick.subzone.is_some()
                            && tree.target(relay_key)?.next_occupied_slot().is_none();
                        let dest = tree.target(next)?;
                        if (!rule.no_next_phase_change || (!dest.is_exchange && relay_empty))
                            && tree.target_ready(rule)?
                        {
                            tree.target_mut(next)?.progress_phase();
                        }
                    }
                }
                None => {
                    if !orig.no_curr_phase_change {
                        tree.target_mut(orig_key)?.progress_phase();
                    }
                    let orig_empty = tree.target(orig_key)?.next_occupied_slot().is_none();
                    let dest = tree.target(next)?;
                    if (!rule.no_next_phase_change
                        || (!dest.is_exchange && orig_empty)
                        || dest.next_empty_slot().is_none())
                        && tree.target_ready(rule)?
                    {
                        tree.target_mut(next)?.progress_phase();
                    }
                }
            }
        } else if !tree.target(next)?.any_empty_for(rule, &rule.colors) {
            let dest_full = tree.target(next)?.next_empty_slot().is_none();
            if (!rule.no_next_phase_change || dest_full) && tree.target_ready(rule)? {
                tree.target_mut(next)?.progress_phase();
            }
        }
    }
    Ok(())
}

/// Follow the rule's first alternate transition. Returns `Some` when the
/// chain decided this cycle's outcome (true if any phase moved).
pub(super) fn update_possible_next_zone(
    w: &mut WorldState,
    transition: TransitionId,
    curr: ZoneKey,
    curr_item: Option<SlotRef>,
) -> Result<Option<bool>> {
    let rule = rule_of(&w.rules, transition)?;
    let Some(&alt_id) = rule.possible_next_trans_ids.first() else {
        return Ok(None);
    };
    let no_curr = rule.no_curr_phase_change;
    let alt = rule_of(&w.rules, alt_id)?;
    let tree = &mut w.tree;

    let alt_zone = tree.get(alt.next_zone)?;
    let placed = alt_zone.peek_place(alt, &alt.colors);
    let alt_key = ZoneTree::key_for(alt_zone, placed.subzone);
    let ready = tree.target_ready(alt)?;
    let curr_emergency = curr_item.and_then(|at| tree.vial(at)).map(|v| v.emergency);

    if placed.slot.is_none() || curr_emergency.is_none() {
        let mut moved = false;
        let dest = tree.target(alt_key)?;
        let dest_full = placed.subzone.is_some() && dest.next_empty_slot().is_none();
        if dest.is_loading() && ((!alt.no_next_phase_change && ready) || dest_full) {
            moved |= tree.target_mut(alt_key)?.progress_phase();
        }
        if !no_curr {
            moved |= tree.target_mut(curr)?.progress_phase();
        }
        return Ok(Some(moved));
    }
    if curr_emergency == Some(false) && tree.target(alt_key)?.is_emergency_zone() {
        let moved = !alt.no_next_phase_change && ready && tree.target_mut(alt_key)?.progress_phase();
        return Ok(Some(moved));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAudit;
    use crate::config::LabConfig;
    use crate::persistence::MemoryStore;
    use crate::types::ZonePhase;
    use crate::vial::Vial;
    use crate::waypoints::WaypointTable;
    use std::sync::Arc;

    fn world(extra: &str) -> WorldState {
        let text = format!(
            r#"
            [app]
            robots = [1]

            [[zones]]
            zone_id = 1
            slot_count = 2
            phase_order = ["READY_TO_UNLOAD", "UNLOADING", "READY_TO_LOAD"]

            [[zones]]
            zone_id = 2
            slot_count = 2
            phase_order = ["READY_TO_LOAD", "LOADING", "READY_TO_START"]

            {extra}
            "#
        );
        WorldState::new(
            LabConfig::from_toml_str(&text).expect("config"),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryAudit::new()),
            Arc::new(WaypointTable::new()),
        )
        .expect("world")
    }

    fn put(w: &mut WorldState, zone: u64, position: u32, code: &str) {
        w.tree
            .slot_mut(SlotRef::new(ZoneKey::zone(zone), position))
            .expect("slot")
            .put(Vial::new(code, Some(1), Some(1)));
    }

    fn phase(w: &WorldState, zone: u64) -> ZonePhase {
        w.tree.get(zone).expect("zone").phase()
    }

    const PLAIN: &str = r#"
        [[transitions]]
        transition_id = 1
        curr_zone = 1
        next_zone = 2
    "#;

    #[test]
    fn first_arrival_starts_loading_and_empty_source_advances() {
        let mut w = world(PLAIN);
        put(&mut w, 1, 2, "B");
        put(&mut w, 2, 1, "A");
        let ctx = MatchContext::new(None);
        update_zone_phases(&mut w, 1, ZoneKey::zone(1), ZoneKey::zone(2), &ctx).expect("cascade");
        assert_eq!(phase(&w, 2), ZonePhase::Loading);
        assert_eq!(phase(&w, 1), ZonePhase::ReadyToUnload);
    }

    #[test]
    fn last_item_advances_both_sides_one_step_each() {
        let mut w = world(PLAIN);
        put(&mut w, 2, 1, "A");
        let ctx = MatchContext::new(None);
        update_zone_phases(&mut w, 1, ZoneKey::zone(1), ZoneKey::zone(2), &ctx).expect("cascade");
        assert_eq!(phase(&w, 2), ZonePhase::ReadyToStart);
        assert_eq!(phase(&w, 1), ZonePhase::Unloading);
    }

    #[test]
    fn suppression_flags_hold_phases() {
        let mut w = world(
            r#"
            [[transitions]]
            transition_id = 1
            curr_zone = 1
            next_zone = 2
            no_curr_phase_change = true
            no_next_phase_change = true
            "#,
        );
        put(&mut w, 1, 1, "B");
        put(&mut w, 2, 1, "A");
        put(&mut w, 2, 2, "C");
        let ctx = MatchContext::new(None);
        update_zone_phases(&mut w, 1, ZoneKey::zone(1), ZoneKey::zone(2), &ctx).expect("cascade");
        assert_eq!(phase(&w, 2), ZonePhase::ReadyToLoad);
        assert_eq!(phase(&w, 1), ZonePhase::ReadyToUnload);
    }

    #[test]
    fn fallback_without_alternates_is_undecided() {
        let mut w = world(PLAIN);
        let decided = update_possible_next_zone(&mut w, 1, ZoneKey::zone(1), None).expect("fallback");
        assert_eq!(decided, None);
    }

    #[test]
    fn fallback_advances_source_when_nothing_to_pick() {
        let mut w = world(
            r#"
            [[transitions]]
            transition_id = 1
            curr_zone = 1
            next_zone = 2
            possible_next_transitions = [2]

            [[transitions]]
            transition_id = 2
            curr_zone = 1
            next_zone = 2
            "#,
        );
        let decided = update_possible_next_zone(&mut w, 1, ZoneKey::zone(1), None).expect("fallback");
        assert_eq!(decided, Some(true));
        assert_eq!(phase(&w, 1), ZonePhase::Unloading);
        assert_eq!(phase(&w, 2), ZonePhase::ReadyToLoad);
    }
}
