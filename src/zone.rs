//! Zone tree nodes and their local phase state machine.
//!
//! A zone owns either slots (leaf) or child zones (internal node). Readiness
//! queries on an internal node are answered by existential OR over its
//! children.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{ColorLimit, RuntimeStep, SlotOrder, StartEffect, ZoneConfig};
use crate::slot::{Slot, SlotSnapshot};
use crate::timer::PhaseTimer;
use crate::transition::{MatchContext, ZoneTransition};
use crate::types::{ColorId, Position, ZoneId, ZonePhase};
use crate::vial::Vial;

/// Result of a slot/subzone search: indices into `subzones` and the slot list
/// of the chosen (sub)zone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Selection {
    pub subzone: Option<usize>,
    pub slot: Option<usize>,
}

/// Pending auto-advance produced by starting a zone with a run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoAdvance {
    pub from: ZonePhase,
    pub to: ZonePhase,
    pub after: Duration,
}

/// Persisted state of one zone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZoneSnapshot {
    pub phase: ZonePhase,
    #[serde(default)]
    pub zone_items: Vec<SlotSnapshot>,
    #[serde(default)]
    pub subzones: Vec<SubzoneSnapshot>,
    #[serde(default)]
    pub door_opened: bool,
    #[serde(default)]
    pub zone_type: Option<u32>,
    #[serde(default)]
    pub zone_name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubzoneSnapshot {
    pub zone_id: ZoneId,
    pub zone: ZoneSnapshot,
}

/// Mutable state of a subtree, taken before a planning cycle so a failed
/// cycle can be undone. Armed timers are not part of it.
#[derive(Debug, Clone)]
pub struct ZoneMark {
    phase: ZonePhase,
    door_opened: bool,
    pick_index: usize,
    place_index: usize,
    zone_type: Option<u32>,
    controls_processed: bool,
    last_init_time: Option<DateTime<Utc>>,
    run_time: Duration,
    contents: Vec<Option<Vial>>,
    subzones: Vec<ZoneMark>,
}

#[derive(Debug)]
pub struct Zone {
    pub id: ZoneId,
    pub name: String,
    phase: ZonePhase,
    phase_order: Vec<ZonePhase>,
    slots: Vec<Slot>,
    subzones: Vec<Zone>,
    pub run_time: Duration,
    pub stand_by_time: Option<Duration>,
    pub wait_time: Duration,
    pub last_init_time: Option<DateTime<Utc>>,
    pub limits_by_color: Vec<ColorLimit>,
    pub is_exchange: bool,
    pub sensor_id: Option<u32>,
    pub stateful: bool,
    pub capacity_check: bool,
    pub has_common_door: bool,
    pub pick_index: usize,
    pub place_index: usize,
    pub zone_type: Option<u32>,
    pub is_active: bool,
    pub device_id: Option<u32>,
    pub door_opened: bool,
    pub controls_processed: bool,
    pub start_effects: Vec<StartEffect>,
    pub close_door_on_start: bool,
    pub runtime_table: Vec<RuntimeStep>,
    timer: Option<PhaseTimer>,
}

impl Zone {
    pub fn from_config(config: &ZoneConfig) -> Self {
        let phase_order = if config.phase_order.is_empty() {
            vec![ZonePhase::ReadyToLoad]
        } else {
            config.phase_order.clone()
        };
        Self {
            id: config.zone_id,
            name: if config.name.is_empty() {
                format!("zone-{}", config.zone_id)
            } else {
                config.name.clone()
            },
            phase: phase_order[0],
            phase_order,
            slots: config
                .slot_definitions()
                .iter()
                .map(Slot::from_config)
                .collect(),
            subzones: config.subzones.iter().map(Zone::from_config).collect(),
            run_time: Duration::from_secs_f64(config.run_time_secs),
            stand_by_time: config.stand_by_time_secs.map(Duration::from_secs),
            wait_time: Duration::from_secs(config.wait_time_secs),
            last_init_time: None,
            limits_by_color: config.limits_by_color.clone(),
            is_exchange: config.is_exchange,
            sensor_id: config.sensor_id,
            stateful: config.stateful,
            capacity_check: config.capacity_check,
            has_common_door: config.has_common_door,
            pick_index: config.pick_index,
            place_index: config.place_index,
            zone_type: config.zone_type,
            is_active: config.is_active,
            device_id: config.device_id,
            door_opened: false,
            controls_processed: false,
            start_effects: config.start_effects.clone(),
            close_door_on_start: config.close_door_on_start,
            runtime_table: config.runtime_table.clone(),
            timer: None,
        }
    }

    // ---- structure -------------------------------------------------------

    pub fn has_subzones(&self) -> bool {
        !self.subzones.is_empty()
    }

    pub fn subzones(&self) -> &[Zone] {
        &self.subzones
    }

    pub fn subzones_mut(&mut self) -> &mut [Zone] {
        &mut self.subzones
    }

    pub fn subzone_index(&self, id: ZoneId) -> Option<usize> {
        self.subzones.iter().position(|z| z.id == id)
    }

    pub fn subzone(&self, id: ZoneId) -> Option<&Zone> {
        self.subzones.iter().find(|z| z.id == id)
    }

    pub fn subzone_mut(&mut self, id: ZoneId) -> Option<&mut Zone> {
        self.subzones.iter_mut().find(|z| z.id == id)
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut [Slot] {
        &mut self.slots
    }

    pub fn slot_index(&self, position: Position) -> Option<usize> {
        self.slots.iter().position(|s| s.position == position)
    }

    pub fn slot_at(&self, position: Position) -> Option<&Slot> {
        self.slots.iter().find(|s| s.position == position)
    }

    pub fn slot_at_mut(&mut self, position: Position) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.position == position)
    }

    /// Every vial held by this zone and its subzones.
    pub fn vials(&self) -> Vec<&Vial> {
        let mut out: Vec<&Vial> = self.slots.iter().filter_map(Slot::content).collect();
        for sub in &self.subzones {
            out.extend(sub.vials());
        }
        out
    }

    pub fn vials_mut(&mut self) -> Vec<&mut Vial> {
        let mut out: Vec<&mut Vial> = self.slots.iter_mut().filter_map(Slot::content_mut).collect();
        for sub in &mut self.subzones {
            out.extend(sub.vials_mut());
        }
        out
    }

    /// Occupied slots of this zone only.
    pub fn count(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_empty()).count()
    }

    /// Occupied slots including subzones.
    pub fn total_count(&self) -> usize {
        self.count() + self.subzones.iter().map(Zone::total_count).sum::<usize>()
    }

    pub fn next_empty_slot(&self) -> Option<usize> {
        self.slots.iter().position(Slot::is_empty)
    }

    pub fn next_occupied_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| !s.is_empty())
    }

    /// Locate a vial by line code; returns the subzone id (if any) and slot index.
    pub fn find_line_code(&self, line_code: &str) -> Option<(Option<ZoneId>, usize)> {
        if let Some(index) = self
            .slots
            .iter()
            .position(|s| s.content().is_some_and(|v| v.line_code == line_code))
        {
            return Some((None, index));
        }
        self.subzones.iter().find_map(|sub| {
            sub.find_line_code(line_code)
                .map(|(_, index)| (Some(sub.id), index))
        })
    }

    // ---- phase state machine ---------------------------------------------

    pub fn phase(&self) -> ZonePhase {
        self.phase
    }

    pub fn phase_order(&self) -> &[ZonePhase] {
        &self.phase_order
    }

    /// An empty phase list places no restriction.
    pub fn phase_allowed(&self, phases: &[ZonePhase]) -> bool {
        phases.is_empty() || phases.contains(&self.phase)
    }

    /// The phase after the current one; the last phase maps to itself.
    pub fn next_phase(&self) -> ZonePhase {
        self.phase_order
            .iter()
            .position(|p| *p == self.phase)
            .and_then(|i| self.phase_order.get(i + 1))
            .copied()
            .unwrap_or(self.phase)
    }

    /// Advance one step along `phase_order`. Returns true if the phase changed.
    pub fn progress_phase(&mut self) -> bool {
        let next = self.next_phase();
        if next == self.phase {
            return false;
        }
        info!(zone = %self.name, from = %self.phase, to = %next, "zone phase changed");
        self.phase = next;
        true
    }

    /// Explicit reset to any phase of the order. Returns false if `phase` is
    /// not part of it.
    pub fn reset_phase(&mut self, phase: ZonePhase) -> bool {
        if !self.phase_order.contains(&phase) {
            return false;
        }
        if phase != self.phase {
            info!(zone = %self.name, from = %self.phase, to = %phase, "zone phase reset");
            self.phase = phase;
        }
        true
    }

    pub fn is_ready_to_start(&self) -> bool {
        if self.has_subzones() {
            self.subzones.iter().any(Zone::is_ready_to_start)
        } else {
            self.phase == ZonePhase::ReadyToStart
        }
    }

    pub fn is_ready_to_stop(&self) -> bool {
        if self.has_subzones() {
            self.subzones.iter().any(Zone::is_ready_to_stop)
        } else {
            self.phase == ZonePhase::ReadyToStop
        }
    }

    pub fn is_ready_to_load(&self) -> bool {
        if self.has_subzones() {
            self.subzones
                .iter()
                .any(|z| z.is_ready_to_load() && z.is_active)
        } else {
            self.phase == ZonePhase::ReadyToLoad
        }
    }

    pub fn is_ready_to_unload(&self) -> bool {
        if self.has_subzones() {
            self.subzones.iter().any(Zone::is_ready_to_unload)
        } else {
            self.phase == ZonePhase::ReadyToUnload
        }
    }

    /// The first vial has just arrived.
    pub fn is_loading_started(&self) -> bool {
        self.phase == ZonePhase::ReadyToLoad && self.count() == 1
    }

    pub fn is_loading(&self) -> bool {
        self.phase == ZonePhase::Loading && self.count() >= 1
    }

    pub fn is_active_zone(&self) -> bool {
        if self.has_subzones() {
            self.subzones.iter().any(|z| z.is_active)
        } else {
            self.is_active
        }
    }

    /// Advance a leaf that is being started. Any armed timer is cancelled
    /// first; the returned value describes the auto-advance to arm, if the
    /// zone has a run time.
    pub fn start(&mut self) -> Option<AutoAdvance> {
        self.cancel_timer();
        self.progress_phase();
        if self.run_time.is_zero() {
            return None;
        }
        let to = self.next_phase();
        (to != self.phase).then_some(AutoAdvance {
            from: self.phase,
            to,
            after: self.run_time,
        })
    }

    pub fn stop(&mut self) -> bool {
        self.progress_phase()
    }

    /// Apply a fired auto-advance if the zone has not moved on meanwhile.
    pub fn apply_auto_advance(&mut self, advance: &AutoAdvance) -> bool {
        self.timer = None;
        if self.phase != advance.from {
            return false;
        }
        self.progress_phase()
    }

    /// Store a newly armed timer, cancelling any prior one.
    pub fn arm_timer(&mut self, timer: PhaseTimer) {
        self.cancel_timer();
        self.timer = Some(timer);
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }

    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }

    pub fn set_door(&mut self, open: bool) {
        if self.door_opened != open {
            info!(zone = %self.name, open, "door state changed");
        }
        self.door_opened = open;
    }

    pub fn apply_start_effects(&mut self, final_transit: &str) {
        let effects = self.start_effects.clone();
        for vial in self.slots.iter_mut().filter_map(Slot::content_mut) {
            for effect in &effects {
                match effect {
                    StartEffect::DecapCentrifuged if vial.centrifuged => vial.decapped = true,
                    StartEffect::DecapCentrifuged => {}
                    StartEffect::ProgressTransit => vial.progress_transit(final_transit),
                }
            }
        }
    }

    // ---- periodic initialisation -----------------------------------------

    /// Record an initialisation; without wait the waiting period is skipped.
    pub fn initialize(&mut self, with_wait: bool, now: DateTime<Utc>) {
        if self.stand_by_time.is_none() {
            return;
        }
        let offset = if with_wait {
            chrono::Duration::zero()
        } else {
            chrono::Duration::from_std(self.wait_time).unwrap_or_else(|_| chrono::Duration::zero())
        };
        self.last_init_time = Some(now - offset);
        info!(zone = %self.name, "zone initialized");
    }

    pub fn initialize_needed(&self, now: DateTime<Utc>) -> bool {
        let Some(stand_by) = self.stand_by_time else {
            return false;
        };
        if !self.is_active {
            return false;
        }
        match self.last_init_time {
            None => true,
            Some(last) => elapsed_since(last, now) > stand_by,
        }
    }

    pub fn is_not_waiting_period(&self, now: DateTime<Utc>) -> bool {
        match self.last_init_time {
            None => true,
            Some(last) => elapsed_since(last, now) > self.wait_time,
        }
    }

    // ---- matching and selection ------------------------------------------

    /// Any held vial is flagged as an emergency.
    pub fn is_emergency_zone(&self) -> bool {
        self.slots
            .iter()
            .any(|s| s.content().is_some_and(|v| v.emergency))
    }

    pub fn is_emergency_position(&self, position: Position) -> bool {
        self.slot_at(position).is_some_and(|s| s.emergency)
    }

    fn scan_order(&self, order: Option<SlotOrder>) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.slots.len()).collect();
        match order {
            Some(SlotOrder::Position) => indices.sort_by_key(|&i| self.slots[i].position),
            Some(SlotOrder::AddedTime) => indices.sort_by_key(|&i| {
                self.slots[i]
                    .content()
                    .map(|v| v.added_time)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
            }),
            None => {}
        }
        indices
    }

    /// Slot holding the next vial `rule` may pick. Emergency vials win
    /// regardless of the cursor; with `emergency_only` nothing else is returned.
    pub fn next_item_for(
        &self,
        rule: &ZoneTransition,
        emergency_only: bool,
        ctx: &MatchContext,
    ) -> Option<usize> {
        let order = self.scan_order(rule.order_by);
        let matches = |i: usize| {
            self.slots[i]
                .content()
                .is_some_and(|v| v.matches(rule, ctx))
        };
        if let Some(i) = order.iter().copied().find(|&i| {
            self.slots[i].content().is_some_and(|v| v.emergency) && matches(i)
        }) {
            return Some(i);
        }
        if emergency_only {
            return None;
        }
        match rule.pick_index.get() {
            Some(cursor) => {
                let found = round_robin(order.len(), cursor, |k| matches(order[k]))?;
                rule.pick_index.set(Some((found + 1) % order.len()));
                Some(order[found])
            }
            None => order.into_iter().find(|&i| matches(i)),
        }
    }

    /// Empty slot `rule` may place into, honouring per-color caps.
    pub fn next_empty_for(&self, rule: &ZoneTransition, colors: &[ColorId]) -> Option<usize> {
        if self.color_limit_exceeded(colors) {
            return None;
        }
        let fits = |i: usize| self.slots[i].is_empty() && self.slots[i].matches(rule);
        match rule.place_index.get() {
            Some(cursor) => {
                let found = round_robin(self.slots.len(), cursor, fits)?;
                rule.place_index.set(Some((found + 1) % self.slots.len()));
                Some(found)
            }
            None => (0..self.slots.len()).find(|&i| fits(i)),
        }
    }

    /// True when some color group already holds `limit` vials of `colors`.
    pub fn color_limit_exceeded(&self, colors: &[ColorId]) -> bool {
        if colors.is_empty() || self.limits_by_color.is_empty() {
            return false;
        }
        let held: Vec<ColorId> = self
            .slots
            .iter()
            .filter_map(|s| s.content().and_then(|v| v.color))
            .filter(|c| colors.contains(c))
            .collect();
        if held.is_empty() {
            return false;
        }
        self.limits_by_color.iter().any(|group| {
            let total = held.iter().filter(|c| group.colors.contains(c)).count();
            total >= group.limit as usize
        })
    }

    /// Subzone to pick from: emergency subzones first, then a round-robin
    /// from `pick_index` per allowed phase.
    pub fn subzone_to_pick(&self, rule: &ZoneTransition, ctx: &MatchContext) -> Option<usize> {
        for phase in &rule.curr_phases {
            if let Some(i) = self
                .subzones
                .iter()
                .position(|z| z.phase == *phase && z.is_emergency_zone())
            {
                return Some(i);
            }
        }
        let n = self.subzones.len();
        for phase in &rule.curr_phases {
            if let Some(i) = round_robin(n, self.pick_index, |i| {
                let z = &self.subzones[i];
                z.phase == *phase && rule.zone_type_compatible(z.zone_type)
            }) {
                return Some(i);
            }
        }
        if rule.curr_phases.is_empty() {
            return self.subzones.iter().position(|z| {
                rule.zone_type_compatible(z.zone_type)
                    && z.next_item_for(rule, z.is_emergency_zone(), ctx).is_some()
            });
        }
        None
    }

    /// Subzone to place into: a round-robin from `place_index` over active,
    /// type-compatible subzones in an allowed phase. A rule without
    /// destination phases never places into subzones.
    pub fn subzone_to_place(&self, rule: &ZoneTransition) -> Option<usize> {
        if rule.control_process_check {
            return rule.next_phases.iter().find_map(|phase| {
                self.subzones
                    .iter()
                    .position(|z| z.phase == *phase && z.is_active && !z.controls_processed)
            });
        }
        let n = self.subzones.len();
        for phase in &rule.next_phases {
            if let Some(i) = round_robin(n, self.place_index, |i| {
                let z = &self.subzones[i];
                z.phase == *phase && z.is_active && rule.zone_type_compatible(z.zone_type)
            }) {
                return Some(i);
            }
        }
        None
    }

    fn selected(&self, subzone: Option<usize>) -> &Zone {
        subzone.map(|i| &self.subzones[i]).unwrap_or(self)
    }

    /// Source subzone and slot for `rule`.
    pub fn pick_selection(&self, rule: &ZoneTransition, ctx: &MatchContext) -> Selection {
        let subzone = if self.has_subzones() {
            match self.subzone_to_pick(rule, ctx) {
                Some(i) => Some(i),
                None => return Selection::default(),
            }
        } else {
            None
        };
        let zone = self.selected(subzone);
        Selection {
            subzone,
            slot: zone.next_item_for(rule, zone.is_emergency_zone(), ctx),
        }
    }

    /// Destination subzone and empty slot for `rule`.
    pub fn place_selection(&self, rule: &ZoneTransition, colors: &[ColorId]) -> Selection {
        let subzone = if self.has_subzones() {
            match self.subzone_to_place(rule) {
                Some(i) => Some(i),
                None => return Selection::default(),
            }
        } else {
            if !self.phase_allowed(&rule.next_phases) || !rule.zone_type_compatible(self.zone_type) {
                return Selection::default();
            }
            None
        };
        let zone = self.selected(subzone);
        if zone.color_limit_exceeded(colors) {
            return Selection { subzone, slot: None };
        }
        Selection {
            subzone,
            slot: zone.next_empty_for(rule, colors),
        }
    }

    /// Any held vial matches `rule`. Cursors are left untouched.
    pub fn any_item_for(&self, rule: &ZoneTransition, ctx: &MatchContext) -> bool {
        self.slots
            .iter()
            .any(|s| s.content().is_some_and(|v| v.matches(rule, ctx)))
    }

    /// Some empty slot accepts `rule` and no color cap is reached.
    pub fn any_empty_for(&self, rule: &ZoneTransition, colors: &[ColorId]) -> bool {
        !self.color_limit_exceeded(colors)
            && self.slots.iter().any(|s| s.is_empty() && s.matches(rule))
    }

    /// `pick_selection` without moving the rule's cursor.
    pub fn peek_pick(&self, rule: &ZoneTransition, ctx: &MatchContext) -> Selection {
        let saved = rule.pick_index.get();
        let selection = self.pick_selection(rule, ctx);
        rule.pick_index.set(saved);
        selection
    }

    /// `place_selection` without moving the rule's cursor.
    pub fn peek_place(&self, rule: &ZoneTransition, colors: &[ColorId]) -> Selection {
        let saved = rule.place_index.get();
        let selection = self.place_selection(rule, colors);
        rule.place_index.set(saved);
        selection
    }

    /// Free space for the capacity gate; typed subzones of an excluded type
    /// do not count.
    pub fn has_capacity(&self, excluded_types: &[u32]) -> bool {
        if self.has_subzones() {
            self.subzones.iter().any(|z| {
                z.zone_type.is_none_or(|t| !excluded_types.contains(&t))
                    && z.next_empty_slot().is_some()
            })
        } else {
            self.next_empty_slot().is_some()
        }
    }

    /// Run time for the current occupancy, from `runtime_table`.
    pub fn runtime_for_count(&self, count: usize) -> Option<Duration> {
        self.runtime_table
            .iter()
            .filter(|step| step.min_count as usize <= count)
            .max_by_key(|step| step.min_count)
            .map(|step| Duration::from_secs_f64(step.run_time_secs.max(0.0)))
    }

    /// Toggle devices with `device_id` anywhere in this subtree.
    pub fn change_device_active(&mut self, device_id: u32, active: bool) -> bool {
        if self.has_subzones() {
            let mut changed = false;
            for sub in &mut self.subzones {
                changed |= sub.change_device_active(device_id, active);
            }
            return changed;
        }
        if self.device_id == Some(device_id) {
            self.is_active = active;
            info!(zone = %self.name, active, "device activity changed");
            return true;
        }
        false
    }

    // ---- lifecycle and persistence ---------------------------------------

    /// Empty the subtree and return to the initial phase.
    pub fn restart(&mut self) {
        for sub in &mut self.subzones {
            sub.restart();
        }
        for slot in &mut self.slots {
            slot.take();
        }
        self.cancel_timer();
        self.phase = self.phase_order[0];
        self.door_opened = false;
        self.pick_index = 0;
        self.place_index = 0;
        self.last_init_time = None;
        self.controls_processed = false;
    }

    pub fn mark(&self) -> ZoneMark {
        ZoneMark {
            phase: self.phase,
            door_opened: self.door_opened,
            pick_index: self.pick_index,
            place_index: self.place_index,
            zone_type: self.zone_type,
            controls_processed: self.controls_processed,
            last_init_time: self.last_init_time,
            run_time: self.run_time,
            contents: self.slots.iter().map(|s| s.content().cloned()).collect(),
            subzones: self.subzones.iter().map(Zone::mark).collect(),
        }
    }

    /// Put back the state recorded by `mark`.
    pub fn rewind(&mut self, mark: &ZoneMark) {
        self.phase = mark.phase;
        self.door_opened = mark.door_opened;
        self.pick_index = mark.pick_index;
        self.place_index = mark.place_index;
        self.zone_type = mark.zone_type;
        self.controls_processed = mark.controls_processed;
        self.last_init_time = mark.last_init_time;
        self.run_time = mark.run_time;
        for (slot, content) in self.slots.iter_mut().zip(&mark.contents) {
            slot.take();
            if let Some(vial) = content {
                slot.put(vial.clone());
            }
        }
        for (sub, sub_mark) in self.subzones.iter_mut().zip(&mark.subzones) {
            sub.rewind(sub_mark);
        }
    }

    /// Remove every vial from this zone's own slots.
    pub fn drain(&mut self) -> Vec<(Position, Vial)> {
        self.slots
            .iter_mut()
            .filter_map(|s| {
                let position = s.position;
                s.take().map(|v| (position, v))
            })
            .collect()
    }

    /// Place into the empty slot at `position`; hands the vial back otherwise.
    pub fn put_at(&mut self, position: Position, vial: Vial) -> Result<(), Vial> {
        match self.slot_at_mut(position) {
            Some(slot) if slot.is_empty() => {
                slot.put(vial);
                Ok(())
            }
            _ => Err(vial),
        }
    }

    pub fn snapshot(&self) -> ZoneSnapshot {
        ZoneSnapshot {
            phase: self.phase,
            zone_items: self.slots.iter().filter_map(Slot::snapshot).collect(),
            subzones: self
                .subzones
                .iter()
                .map(|z| SubzoneSnapshot {
                    zone_id: z.id,
                    zone: z.snapshot(),
                })
                .collect(),
            door_opened: self.door_opened,
            zone_type: self.zone_type,
            zone_name: self.name.clone(),
        }
    }

    /// Load persisted phase and contents. Entries that no longer fit the
    /// configured tree are skipped with a warning.
    pub fn restore(&mut self, snapshot: &ZoneSnapshot) {
        if !self.reset_phase(snapshot.phase) {
            warn!(zone = %self.name, phase = %snapshot.phase, "persisted phase not in phase order");
        }
        self.zone_type = snapshot.zone_type;
        if self.stateful {
            self.door_opened = snapshot.door_opened;
        }
        for item in &snapshot.zone_items {
            if let Err(vial) = self.put_at(item.position, item.content.clone()) {
                warn!(
                    zone = %self.name,
                    position = item.position,
                    line_code = %vial.line_code,
                    "persisted vial does not fit an empty slot"
                );
            }
        }
        for sub in &snapshot.subzones {
            match self.subzone_mut(sub.zone_id) {
                Some(zone) => zone.restore(&sub.zone),
                None => warn!(zone = %self.name, subzone = sub.zone_id, "persisted subzone not configured"),
            }
        }
    }
}

fn elapsed_since(earlier: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    now.signed_duration_since(earlier)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// First index `i` in the cyclic scan starting at `start` satisfying `pred`.
fn round_robin(len: usize, start: usize, mut pred: impl FnMut(usize) -> bool) -> Option<usize> {
    (0..len).map(|k| (start + k) % len).find(|&i| pred(i))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransitionConfig;
    use proptest::prelude::*;

    fn zone(text: &str) -> Zone {
        let config: ZoneConfig = toml::from_str(text).expect("zone config");
        Zone::from_config(&config)
    }

    fn rule(text: &str) -> ZoneTransition {
        let config: TransitionConfig = toml::from_str(&format!(
            "transition_id = 1\ncurr_zone = 1\nnext_zone = 2\n{text}"
        ))
        .expect("transition config");
        ZoneTransition::from_config(&config)
    }

    fn ctx() -> MatchContext {
        MatchContext::new(None)
    }

    fn vial(code: &str, color: u32) -> Vial {
        Vial::new(code, Some(color), Some(1))
    }

    #[test]
    fn phase_advances_forward_and_stops_at_end() {
        let mut z = zone(
            "zone_id = 1\nslot_count = 1\nphase_order = [\"READY_TO_LOAD\", \"LOADING\", \"READY_TO_START\"]\n",
        );
        assert_eq!(z.phase(), ZonePhase::ReadyToLoad);
        assert!(z.progress_phase());
        assert_eq!(z.phase(), ZonePhase::Loading);
        assert!(z.progress_phase());
        assert!(!z.progress_phase());
        assert_eq!(z.phase(), ZonePhase::ReadyToStart);
        assert!(!z.reset_phase(ZonePhase::InProcess));
        assert!(z.reset_phase(ZonePhase::ReadyToLoad));
    }

    #[test]
    fn empty_phase_order_defaults_to_ready_to_load() {
        let z = zone("zone_id = 1\nslot_count = 1\n");
        assert_eq!(z.phase_order(), &[ZonePhase::ReadyToLoad]);
        assert_eq!(z.next_phase(), ZonePhase::ReadyToLoad);
    }

    #[test]
    fn parent_readiness_is_existential_over_children() {
        let mut z = zone(
            r#"
            zone_id = 3
            [[subzones]]
            zone_id = 1
            slot_count = 2
            phase_order = ["READY_TO_START", "IN_PROCESS"]
            [[subzones]]
            zone_id = 2
            slot_count = 2
            phase_order = ["READY_TO_LOAD", "LOADING"]
            is_active = false
            "#,
        );
        assert!(z.is_ready_to_start());
        assert!(!z.is_ready_to_load());
        z.subzone_mut(2).expect("subzone").is_active = true;
        assert!(z.is_ready_to_load());
        assert!(!z.is_ready_to_stop());
    }

    #[test]
    fn loading_started_only_on_first_occupant() {
        let mut z = zone("zone_id = 1\nslot_count = 2\nphase_order = [\"READY_TO_LOAD\", \"LOADING\"]\n");
        assert!(!z.is_loading_started());
        z.put_at(1, vial("A", 1)).expect("slot free");
        assert!(z.is_loading_started());
        z.put_at(2, vial("B", 1)).expect("slot free");
        assert!(!z.is_loading_started());
        z.progress_phase();
        assert!(z.is_loading());
    }

    #[test]
    fn emergency_vial_beats_cursor() {
        let mut z = zone("zone_id = 1\nslot_count = 4\n");
        for (pos, code) in [(1, "A"), (2, "B"), (4, "E")] {
            z.put_at(pos, vial(code, 1)).expect("slot free");
        }
        z.slot_at_mut(4)
            .and_then(Slot::content_mut)
            .expect("vial")
            .emergency = true;
        let r = rule("pick_index = 1\n");
        assert_eq!(z.next_item_for(&r, false, &ctx()), Some(3));
        assert!(z.is_emergency_zone());
        assert_eq!(z.next_item_for(&r, true, &ctx()), Some(3));
    }

    #[test]
    fn emergency_only_withholds_regular_vials() {
        let mut z = zone("zone_id = 1\nslot_count = 2\n");
        z.put_at(1, vial("A", 1)).expect("slot free");
        let mut em = vial("E", 2);
        em.emergency = true;
        z.put_at(2, em).expect("slot free");
        let r = rule("colors = [1]\n");
        assert_eq!(z.next_item_for(&r, true, &ctx()), None);
        assert_eq!(z.next_item_for(&r, false, &ctx()), Some(0));
    }

    #[test]
    fn pick_cursor_moves_past_matched_slot() {
        let mut z = zone("zone_id = 1\nslot_count = 3\n");
        for (pos, code) in [(1, "A"), (2, "B"), (3, "C")] {
            z.put_at(pos, vial(code, 1)).expect("slot free");
        }
        let r = rule("pick_index = 0\n");
        let first = z.next_item_for(&r, false, &ctx());
        let second = z.next_item_for(&r, false, &ctx());
        let third = z.next_item_for(&r, false, &ctx());
        assert_eq!((first, second, third), (Some(0), Some(1), Some(2)));
        assert_eq!(z.next_item_for(&r, false, &ctx()), Some(0));
    }

    #[test]
    fn place_cursor_spreads_over_empty_slots() {
        let z = zone("zone_id = 1\nslot_count = 3\n");
        let r = rule("place_index = 2\n");
        assert_eq!(z.next_empty_for(&r, &[]), Some(2));
        assert_eq!(z.next_empty_for(&r, &[]), Some(0));
        assert_eq!(z.next_empty_for(&r, &[]), Some(1));
    }

    #[test]
    fn color_limit_blocks_placement() {
        let mut z = zone(
            "zone_id = 1\nslot_count = 4\nlimits_by_color = [{ colors = [3, 4], limit = 2 }]\n",
        );
        let r = rule("colors = [3]\n");
        z.put_at(1, vial("A", 3)).expect("slot free");
        assert!(!z.color_limit_exceeded(&[3]));
        assert!(z.next_empty_for(&r, &[3]).is_some());
        z.put_at(2, vial("B", 3)).expect("slot free");
        assert!(z.color_limit_exceeded(&[3]));
        assert_eq!(z.next_empty_for(&r, &[3]), None);
        assert_eq!(z.place_selection(&r, &[3]).slot, None);
        assert!(!z.color_limit_exceeded(&[5]));
        z.slot_at_mut(2).expect("slot").take();
        assert!(z.next_empty_for(&r, &[3]).is_some());
    }

    #[test]
    fn pick_prefers_emergency_subzone() {
        let mut z = zone(
            r#"
            zone_id = 3
            [[subzones]]
            zone_id = 1
            slot_count = 2
            phase_order = ["READY_TO_UNLOAD"]
            [[subzones]]
            zone_id = 2
            slot_count = 2
            phase_order = ["READY_TO_UNLOAD"]
            "#,
        );
        z.subzone_mut(1).expect("sub").put_at(1, vial("A", 1)).expect("free");
        let mut em = vial("E", 1);
        em.emergency = true;
        z.subzone_mut(2).expect("sub").put_at(2, em).expect("free");
        let r = rule("curr_phases = [\"READY_TO_UNLOAD\"]\n");
        let sel = z.pick_selection(&r, &ctx());
        assert_eq!(sel, Selection { subzone: Some(1), slot: Some(1) });
    }

    #[test]
    fn place_selection_skips_inactive_and_mismatched_subzones() {
        let mut z = zone(
            r#"
            zone_id = 4
            [[subzones]]
            zone_id = 1
            slot_count = 2
            is_active = false
            [[subzones]]
            zone_id = 2
            slot_count = 2
            zone_type = 7
            [[subzones]]
            zone_id = 3
            slot_count = 2
            zone_type = 2
            "#,
        );
        let r = rule("next_phases = [\"READY_TO_LOAD\"]\nzone_type = 2\n");
        assert_eq!(z.place_selection(&r, &[]), Selection { subzone: Some(2), slot: Some(0) });
        z.place_index = 1;
        assert_eq!(z.subzone_to_place(&r), Some(2));
        let r = rule("next_phases = [\"LOADING\"]\n");
        assert_eq!(z.place_selection(&r, &[]), Selection::default());
    }

    #[test]
    fn rule_without_next_phases_places_into_no_subzone() {
        let z = zone(
            r#"
            zone_id = 4
            [[subzones]]
            zone_id = 1
            slot_count = 2
            "#,
        );
        let r = rule("");
        assert_eq!(z.subzone_to_place(&r), None);
        assert_eq!(z.place_selection(&r, &[]), Selection::default());
    }

    #[test]
    fn rewind_restores_marked_state() {
        let mut z = zone(
            r#"
            zone_id = 4
            slot_count = 2
            phase_order = ["READY_TO_LOAD", "LOADING"]
            [[subzones]]
            zone_id = 1
            slot_count = 1
            phase_order = ["READY_TO_START", "IN_PROCESS"]
            "#,
        );
        z.put_at(1, vial("A", 1)).expect("free");
        let mark = z.mark();

        z.progress_phase();
        z.set_door(true);
        z.place_index = 1;
        z.drain();
        z.put_at(2, vial("B", 1)).expect("free");
        z.subzone_mut(1).expect("subzone").progress_phase();

        z.rewind(&mark);
        assert_eq!(z.phase(), ZonePhase::ReadyToLoad);
        assert!(!z.door_opened);
        assert_eq!(z.place_index, 0);
        assert_eq!(z.slot_at(1).and_then(Slot::content).map(|v| v.line_code.as_str()), Some("A"));
        assert!(z.slot_at(2).is_some_and(Slot::is_empty));
        assert_eq!(z.subzone(1).expect("subzone").phase(), ZonePhase::ReadyToStart);
    }

    #[test]
    fn capacity_ignores_excluded_subzone_types() {
        let mut z = zone(
            r#"
            zone_id = 5
            capacity_check = true
            [[subzones]]
            zone_id = 1
            slot_count = 1
            zone_type = 1
            [[subzones]]
            zone_id = 2
            slot_count = 1
            zone_type = 2
            "#,
        );
        assert!(z.has_capacity(&[1]));
        z.subzone_mut(2).expect("sub").put_at(1, vial("A", 1)).expect("free");
        assert!(!z.has_capacity(&[1]));
        assert!(z.has_capacity(&[]));
    }

    #[test]
    fn restart_clears_contents_and_phase() {
        let mut z = zone(
            "zone_id = 1\nslot_count = 2\nphase_order = [\"READY_TO_LOAD\", \"LOADING\"]\n",
        );
        z.put_at(1, vial("A", 1)).expect("free");
        z.progress_phase();
        z.set_door(true);
        z.pick_index = 1;
        z.restart();
        assert_eq!(z.count(), 0);
        assert_eq!(z.phase(), ZonePhase::ReadyToLoad);
        assert!(!z.door_opened);
        assert_eq!(z.pick_index, 0);
    }

    #[test]
    fn snapshot_restores_into_fresh_zone() {
        let text = r#"
            zone_id = 4
            stateful = true
            phase_order = ["READY_TO_LOAD", "LOADING"]
            [[subzones]]
            zone_id = 1
            slot_count = 3
            phase_order = ["READY_TO_LOAD", "LOADING"]
        "#;
        let mut original = zone(text);
        original.subzone_mut(1).expect("sub").put_at(3, vial("A", 2)).expect("free");
        original.subzone_mut(1).expect("sub").progress_phase();
        original.set_door(true);
        let snap = original.snapshot();

        let mut restored = zone(text);
        restored.restore(&snap);
        assert_eq!(restored.snapshot(), snap);
        assert_eq!(restored.find_line_code("A"), Some((Some(1), 2)));
    }

    #[test]
    fn device_toggle_reaches_leaf_subzones() {
        let mut z = zone(
            r#"
            zone_id = 6
            [[subzones]]
            zone_id = 1
            slot_count = 1
            device_id = 42
            "#,
        );
        assert!(z.change_device_active(42, false));
        assert!(!z.is_active_zone());
        assert!(!z.change_device_active(7, false));
    }

    #[test]
    fn init_clock_tracks_stand_by_and_wait() {
        let mut z = zone("zone_id = 1\nslot_count = 1\nstand_by_time_secs = 60\nwait_time_secs = 10\n");
        let now = Utc::now();
        assert!(z.initialize_needed(now));
        z.initialize(true, now);
        assert!(!z.initialize_needed(now));
        assert!(!z.is_not_waiting_period(now + chrono::Duration::seconds(5)));
        assert!(z.is_not_waiting_period(now + chrono::Duration::seconds(11)));
        assert!(z.initialize_needed(now + chrono::Duration::seconds(61)));
        z.initialize(false, now);
        assert!(z.is_not_waiting_period(now + chrono::Duration::seconds(1)));
    }

    #[test]
    fn start_reports_auto_advance_for_run_time() {
        let mut z = zone(
            "zone_id = 1\nslot_count = 1\nrun_time_secs = 0.5\nphase_order = [\"READY_TO_START\", \"IN_PROCESS\", \"READY_TO_STOP\"]\n",
        );
        let advance = z.start().expect("auto advance");
        assert_eq!(z.phase(), ZonePhase::InProcess);
        assert_eq!(advance.from, ZonePhase::InProcess);
        assert_eq!(advance.to, ZonePhase::ReadyToStop);
        assert!(z.apply_auto_advance(&advance));
        assert_eq!(z.phase(), ZonePhase::ReadyToStop);
        assert!(!z.apply_auto_advance(&advance));
    }

    #[test]
    fn runtime_table_picks_largest_threshold() {
        let z = zone(
            "zone_id = 1\nslot_count = 1\nruntime_table = [{ min_count = 0, run_time_secs = 60.0 }, { min_count = 5, run_time_secs = 90.0 }]\n",
        );
        assert_eq!(z.runtime_for_count(2), Some(Duration::from_secs(60)));
        assert_eq!(z.runtime_for_count(7), Some(Duration::from_secs(90)));
    }

    proptest! {
        #[test]
        fn progress_never_skips_or_regresses(steps in 0usize..20) {
            let mut z = zone(
                "zone_id = 1\nslot_count = 1\nphase_order = [\"READY_TO_LOAD\", \"LOADING\", \"READY_TO_START\", \"IN_PROCESS\"]\n",
            );
            let mut index = 0usize;
            for _ in 0..steps {
                z.progress_phase();
                index = (index + 1).min(3);
                prop_assert_eq!(z.phase(), z.phase_order()[index]);
            }
        }

        #[test]
        fn round_robin_pick_never_repeats_while_alternatives_exist(
            occupied in proptest::collection::btree_set(1u32..=8, 2..=8),
            cursor in 0usize..8,
        ) {
            let mut z = zone("zone_id = 1\nslot_count = 8\n");
            for pos in &occupied {
                z.put_at(*pos, vial(&format!("V{pos}"), 1)).expect("free");
            }
            let r = rule(&format!("pick_index = {cursor}\n"));
            let first = z.next_item_for(&r, false, &ctx());
            let second = z.next_item_for(&r, false, &ctx());
            prop_assert!(first.is_some());
            prop_assert_ne!(first, second);
        }
    }
}
