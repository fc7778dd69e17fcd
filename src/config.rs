//! Static lab configuration loaded from TOML.
//!
//! The document describes the zone tree, the transition rules, the per-robot
//! rotation lists and the color tables used by classification.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::NaiveTime;
use serde::Deserialize;

use crate::classification::ClassificationPolicy;
use crate::error::{Error, Result};
use crate::types::{
    ColorId, ItemType, Position, RobotId, TransitionId, VialTypeId, ZoneId, ZonePhase,
};
use crate::waypoints::WaypointConfig;

/// Fault zone used when none is configured.
pub const DEFAULT_FAULT_ZONE: ZoneId = 10;

/// Transit codes that mark a vial as bound for an archive.
pub const DEFAULT_ARCHIVE_TRANSITS: &[&str] =
    &["ARCH", "DIMM-ARCH", "SYSM-ARCH", "ORTH-ARCH", "COAG-ARCH"];

/// Root configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LabConfig {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,
    #[serde(default)]
    pub transitions: Vec<TransitionConfig>,
    #[serde(default)]
    pub transition_orders: Vec<TransitionOrderConfig>,
    #[serde(default)]
    pub color_transit_order: Vec<ColorTransitOrder>,
    #[serde(default)]
    pub color_type_map: Vec<ColorTypeMapping>,
    #[serde(default)]
    pub color_zone_map: Vec<ColorZoneMapping>,
    #[serde(default)]
    pub classification: Vec<ClassificationPolicy>,
    #[serde(default)]
    pub fixtures: Vec<FixtureConfig>,
    #[serde(default)]
    pub waypoints: Vec<WaypointConfig>,
    #[serde(default)]
    pub controls: Option<ControlsConfig>,
}

/// Deployment-wide settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Selects the classification policy.
    pub app_id: u32,
    pub robots: Vec<RobotId>,
    /// Minimum vial age before disposal-gated transitions match it.
    pub disposal_time_secs: Option<u64>,
    pub fault_zone_id: ZoneId,
    pub intake_zone_id: ZoneId,
    pub inspection_zone_id: ZoneId,
    /// Color of counter-balance tubes, which some hooks skip.
    pub counter_color: Option<ColorId>,
    pub archive_transits: Vec<String>,
    pub final_transit: String,
    /// Zones restarted together by `reset_archives`.
    pub archive_groups: Vec<Vec<ZoneId>>,
    pub archive_zone_ids: Vec<ZoneId>,
    pub fault_zone_ids: Vec<ZoneId>,
    /// Subzone types ignored by the capacity gate and archive cleanup.
    pub capacity_excluded_types: Vec<u32>,
    /// Init tasks are withheld while this zone holds any vial.
    pub init_blocking_zone: Option<ZoneId>,
    pub down_time: Option<DownTime>,
    /// Time of day ("HH:MM") after which controls may run.
    pub controls_time: Option<String>,
    /// Waste zone emptied by `clear_dustbin`.
    pub dustbin_zone_id: Option<ZoneId>,
    pub snapshot_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_id: 0,
            robots: Vec::new(),
            disposal_time_secs: None,
            fault_zone_id: DEFAULT_FAULT_ZONE,
            intake_zone_id: 1,
            inspection_zone_id: 2,
            counter_color: None,
            archive_transits: DEFAULT_ARCHIVE_TRANSITS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            final_transit: "ARCH".to_string(),
            archive_groups: Vec::new(),
            archive_zone_ids: Vec::new(),
            fault_zone_ids: Vec::new(),
            capacity_excluded_types: Vec::new(),
            init_blocking_zone: None,
            down_time: None,
            controls_time: None,
            dustbin_zone_id: None,
            snapshot_path: None,
        }
    }
}

impl AppConfig {
    /// Zones restarted by `reset_faults`.
    pub fn fault_zones(&self) -> Vec<ZoneId> {
        if self.fault_zone_ids.is_empty() {
            vec![self.fault_zone_id]
        } else {
            self.fault_zone_ids.clone()
        }
    }
}

/// Daily maintenance window ("HH:MM" local time) during which guarded moves pause.
#[derive(Debug, Clone, Deserialize)]
pub struct DownTime {
    pub start: String,
    pub end: String,
}

impl DownTime {
    pub fn bounds(&self) -> Result<(NaiveTime, NaiveTime)> {
        Ok((parse_clock(&self.start)?, parse_clock(&self.end)?))
    }
}

pub fn parse_clock(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .map_err(|err| Error::config(format!("invalid time of day `{value}`: {err}")))
}

/// Batch counters that advance the shared rotation cursor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub batch_threshold: u32,
    /// Starting any of these zones counts towards its batch counter.
    pub batch_start_zones: Vec<ZoneId>,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            batch_threshold: 1,
            batch_start_zones: Vec::new(),
        }
    }
}

/// Side effect applied to the vials of a zone when it is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartEffect {
    /// Advance every vial to its next transit.
    ProgressTransit,
    /// Mark centrifuged vials as decapped.
    DecapCentrifuged,
}

/// Per-color occupancy cap inside one zone.
#[derive(Debug, Clone, Deserialize)]
pub struct ColorLimit {
    pub colors: Vec<ColorId>,
    pub limit: u32,
}

/// Run time chosen by occupancy (`calculate_runtime` hook).
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeStep {
    pub min_count: u32,
    pub run_time_secs: f64,
}

/// One position of a leaf zone.
#[derive(Debug, Clone, Deserialize)]
pub struct SlotConfig {
    pub position: Position,
    #[serde(default)]
    pub types: Vec<VialTypeId>,
    #[serde(default)]
    pub emergency: bool,
    #[serde(default)]
    pub color: Option<ColorId>,
    #[serde(default)]
    pub transit: Option<String>,
}

/// A zone; leaves declare slots, internal nodes declare subzones.
#[derive(Debug, Clone, Deserialize)]
pub struct ZoneConfig {
    pub zone_id: ZoneId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub subzones: Vec<ZoneConfig>,
    #[serde(default)]
    pub slots: Vec<SlotConfig>,
    /// Shorthand for `slot_count` unfiltered slots at positions 1..=n.
    #[serde(default)]
    pub slot_count: Option<u32>,
    #[serde(default)]
    pub phase_order: Vec<ZonePhase>,
    #[serde(default)]
    pub run_time_secs: f64,
    #[serde(default)]
    pub stand_by_time_secs: Option<u64>,
    #[serde(default)]
    pub wait_time_secs: u64,
    #[serde(default)]
    pub limits_by_color: Vec<ColorLimit>,
    #[serde(default)]
    pub is_exchange: bool,
    #[serde(default)]
    pub sensor_id: Option<u32>,
    #[serde(default)]
    pub stateful: bool,
    #[serde(default)]
    pub capacity_check: bool,
    #[serde(default)]
    pub has_common_door: bool,
    #[serde(default)]
    pub pick_index: usize,
    #[serde(default)]
    pub place_index: usize,
    #[serde(default)]
    pub zone_type: Option<u32>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Id used by operators to toggle the device.
    #[serde(default)]
    pub device_id: Option<u32>,
    #[serde(default)]
    pub start_effects: Vec<StartEffect>,
    #[serde(default)]
    pub close_door_on_start: bool,
    #[serde(default)]
    pub runtime_table: Vec<RuntimeStep>,
}

fn default_true() -> bool {
    true
}

/// Ordering applied to a zone's slots when scanning for a pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotOrder {
    Position,
    AddedTime,
}

/// Declarative movement rule.
#[derive(Debug, Clone, Deserialize)]
pub struct TransitionConfig {
    pub transition_id: TransitionId,
    pub curr_zone: ZoneId,
    #[serde(default)]
    pub curr_phases: Vec<ZonePhase>,
    pub next_zone: ZoneId,
    #[serde(default)]
    pub next_phases: Vec<ZonePhase>,
    #[serde(default)]
    pub colors: Vec<ColorId>,
    #[serde(default)]
    pub types: Vec<VialTypeId>,
    #[serde(default)]
    pub transits: Vec<String>,
    #[serde(default)]
    pub centrifuged: Option<bool>,
    #[serde(default)]
    pub item_type: ItemType,
    #[serde(default)]
    pub disposable: bool,
    #[serde(default)]
    pub zone_type: Option<u32>,
    #[serde(default)]
    pub pre_checks: Vec<String>,
    #[serde(default)]
    pub pre_operations: Vec<String>,
    #[serde(default)]
    pub post_operations: Vec<String>,
    #[serde(default)]
    pub pre_tasks: Vec<String>,
    #[serde(default)]
    pub orig_transitions: Vec<TransitionId>,
    #[serde(default)]
    pub possible_next_transitions: Vec<TransitionId>,
    #[serde(default)]
    pub no_curr_phase_change: bool,
    #[serde(default)]
    pub no_next_phase_change: bool,
    #[serde(default)]
    pub order_by: Option<SlotOrder>,
    #[serde(default)]
    pub target_zone: Option<ZoneId>,
    #[serde(default)]
    pub pick_index: Option<usize>,
    #[serde(default)]
    pub place_index: Option<usize>,
    #[serde(default)]
    pub control_process_check: bool,
}

/// One robot's transition list inside a rotation order.
#[derive(Debug, Clone, Deserialize)]
pub struct RobotTransitions {
    pub robot: RobotId,
    pub transitions: Vec<TransitionId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransitionOrderConfig {
    pub order_id: u32,
    #[serde(default)]
    pub robots: Vec<RobotTransitions>,
}

/// Priority of transit codes for vials of the listed colors.
#[derive(Debug, Clone, Deserialize)]
pub struct ColorTransitOrder {
    pub colors: Vec<ColorId>,
    pub transits: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColorTypeMapping {
    pub colors: Vec<ColorId>,
    pub vial_type: VialTypeId,
}

/// Device zone that processes vials of the listed colors.
#[derive(Debug, Clone, Deserialize)]
pub struct ColorZoneMapping {
    pub colors: Vec<ColorId>,
    pub zone: ZoneId,
}

/// Vial placed at every restart, e.g. a centrifuge counter-balance.
#[derive(Debug, Clone, Deserialize)]
pub struct FixtureConfig {
    pub zone_id: ZoneId,
    #[serde(default)]
    pub subzone_id: Option<ZoneId>,
    pub position: Position,
    pub line_code: String,
    #[serde(default)]
    pub color: Option<ColorId>,
    #[serde(default)]
    pub vial_type: Option<VialTypeId>,
    #[serde(default)]
    pub next_zone: Option<ZoneId>,
}

/// Control vials an operator can load into a dedicated (sub)zone.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlsConfig {
    pub zone_id: ZoneId,
    #[serde(default)]
    pub subzone_id: Option<ZoneId>,
    /// Controls are only added while the target sits in this phase.
    #[serde(default = "default_controls_phase")]
    pub ready_phase: ZonePhase,
    #[serde(default)]
    pub color: Option<ColorId>,
    #[serde(default)]
    pub vials: Vec<ControlVialConfig>,
}

fn default_controls_phase() -> ZonePhase {
    ZonePhase::ReadyToUnload
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlVialConfig {
    pub position: Position,
    #[serde(default)]
    pub vial_type: Option<VialTypeId>,
    #[serde(default)]
    pub transits: Vec<String>,
}

impl LabConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: LabConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| Error::io(path, err))?;
        Self::from_toml_str(&text)
    }

    /// Structural checks. Cross references between rules and zones are
    /// resolved lazily by the scheduler.
    pub fn validate(&self) -> Result<()> {
        if self.app.robots.is_empty() {
            return Err(Error::config("at least one robot must be configured"));
        }
        let mut zone_ids = HashSet::new();
        for zone in &self.zones {
            if !zone_ids.insert(zone.zone_id) {
                return Err(Error::config(format!("duplicate zone id {}", zone.zone_id)));
            }
            zone.validate()?;
        }
        let mut transition_ids = HashSet::new();
        for transition in &self.transitions {
            if !transition_ids.insert(transition.transition_id) {
                return Err(Error::config(format!(
                    "duplicate transition id {}",
                    transition.transition_id
                )));
            }
        }
        if self.rotation.batch_threshold == 0 {
            return Err(Error::config("rotation.batch_threshold must be > 0"));
        }
        if let Some(window) = &self.app.down_time {
            window.bounds()?;
        }
        if let Some(controls) = &self.app.controls_time {
            parse_clock(controls)?;
        }
        if let Some(controls) = &self.controls {
            let mut positions = HashSet::new();
            for vial in &controls.vials {
                if vial.position == 0 || !positions.insert(vial.position) {
                    return Err(Error::config(format!(
                        "controls list an invalid or duplicate position {}",
                        vial.position
                    )));
                }
            }
        }
        Ok(())
    }

    /// Transit priority list for a color, if one is configured.
    pub fn transit_order_for(&self, color: Option<ColorId>) -> Option<&[String]> {
        let color = color?;
        self.color_transit_order
            .iter()
            .find(|order| order.colors.contains(&color))
            .map(|order| order.transits.as_slice())
    }

    pub fn vial_type_for(&self, color: ColorId) -> Option<VialTypeId> {
        self.color_type_map
            .iter()
            .find(|mapping| mapping.colors.contains(&color))
            .map(|mapping| mapping.vial_type)
    }

    pub fn zone_for_color(&self, color: ColorId) -> Option<ZoneId> {
        self.color_zone_map
            .iter()
            .find(|mapping| mapping.colors.contains(&color))
            .map(|mapping| mapping.zone)
    }
}

impl ZoneConfig {
    fn validate(&self) -> Result<()> {
        if !self.subzones.is_empty() && (!self.slots.is_empty() || self.slot_count.is_some()) {
            return Err(Error::config(format!(
                "zone {} declares both slots and subzones",
                self.zone_id
            )));
        }
        let mut positions = HashSet::new();
        for slot in &self.slots {
            if slot.position == 0 || !positions.insert(slot.position) {
                return Err(Error::config(format!(
                    "zone {} has an invalid or duplicate slot position {}",
                    self.zone_id, slot.position
                )));
            }
        }
        let mut sub_ids = HashSet::new();
        for sub in &self.subzones {
            if !sub_ids.insert(sub.zone_id) {
                return Err(Error::config(format!(
                    "zone {} has duplicate subzone id {}",
                    self.zone_id, sub.zone_id
                )));
            }
            sub.validate()?;
        }
        if self.run_time_secs < 0.0 || !self.run_time_secs.is_finite() {
            return Err(Error::config(format!(
                "zone {} has an invalid run time",
                self.zone_id
            )));
        }
        Ok(())
    }

    /// Slot definitions, expanding the `slot_count` shorthand.
    pub fn slot_definitions(&self) -> Vec<SlotConfig> {
        if !self.slots.is_empty() {
            return self.slots.clone();
        }
        (1..=self.slot_count.unwrap_or(0))
            .map(|position| SlotConfig {
                position,
                types: Vec::new(),
                emergency: false,
                color: None,
                transit: None,
            })
            .collect()
    }
}
