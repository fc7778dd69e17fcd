//! Shared identifiers, enumerations and the task model used across the system.

use std::fmt;

use serde::{Deserialize, Serialize, Serializer};

/// Unique identifier for a polling robot.
pub type RobotId = u64;
/// Identifier of a zone; subzone ids are local to their parent.
pub type ZoneId = u64;
/// Identifier of a configured transition rule.
pub type TransitionId = u64;
/// Opaque id linking an issued task to its deferred commit.
pub type CorrelationId = u64;
/// Identifier of a named zone-area lock.
pub type LockId = u64;
/// Enumerated vial color.
pub type ColorId = u32;
/// Enumerated vial (tube) type.
pub type VialTypeId = u32;
/// 1-based slot position within a zone.
pub type Position = u32;

/// Numeric code carried on the wire for an enumerated value.
pub trait WireCode {
    fn code(&self) -> u8;
}

/// Phase of a zone's local state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ZonePhase {
    ReadyToLoad,
    ReadyToStart,
    InProcess,
    ReadyToStop,
    ReadyToUnload,
    ReadyToProcess,
    Loading,
    Unloading,
    PreProcess,
    PostProcess,
}

impl WireCode for ZonePhase {
    fn code(&self) -> u8 {
        match self {
            ZonePhase::ReadyToLoad => 1,
            ZonePhase::ReadyToStart => 2,
            ZonePhase::InProcess => 3,
            ZonePhase::ReadyToStop => 4,
            ZonePhase::ReadyToUnload => 5,
            ZonePhase::ReadyToProcess => 6,
            ZonePhase::Loading => 7,
            ZonePhase::Unloading => 8,
            ZonePhase::PreProcess => 9,
            ZonePhase::PostProcess => 10,
        }
    }
}

impl fmt::Display for ZonePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ZonePhase::ReadyToLoad => "READY_TO_LOAD",
            ZonePhase::ReadyToStart => "READY_TO_START",
            ZonePhase::InProcess => "IN_PROCESS",
            ZonePhase::ReadyToStop => "READY_TO_STOP",
            ZonePhase::ReadyToUnload => "READY_TO_UNLOAD",
            ZonePhase::ReadyToProcess => "READY_TO_PROCESS",
            ZonePhase::Loading => "LOADING",
            ZonePhase::Unloading => "UNLOADING",
            ZonePhase::PreProcess => "PRE_PROCESS",
            ZonePhase::PostProcess => "POST_PROCESS",
        };
        f.write_str(name)
    }
}

/// Kind of physical instruction sent to a robot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskType {
    Load,
    Unload,
    Start,
    Stop,
    Open,
    Close,
    Pause,
    Init,
}

impl WireCode for TaskType {
    fn code(&self) -> u8 {
        match self {
            TaskType::Load => 1,
            TaskType::Unload => 2,
            TaskType::Start => 3,
            TaskType::Stop => 4,
            TaskType::Open => 5,
            TaskType::Close => 6,
            TaskType::Pause => 7,
            TaskType::Init => 8,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskType::Load => "load",
            TaskType::Unload => "unload",
            TaskType::Start => "start",
            TaskType::Stop => "stop",
            TaskType::Open => "open",
            TaskType::Close => "close",
            TaskType::Pause => "pause",
            TaskType::Init => "init",
        };
        f.write_str(name)
    }
}

/// What a movement transition carries: a single vial or a whole zone's contents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemType {
    #[default]
    Vial,
    Zone,
}

impl WireCode for ItemType {
    fn code(&self) -> u8 {
        match self {
            ItemType::Vial => 1,
            ItemType::Zone => 2,
        }
    }
}

/// Reason a vial was routed to the fault zone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ColorFail,
    LineCodeFail,
    LevelFail,
    LisFail,
    UnknownFail,
}

impl WireCode for ErrorKind {
    fn code(&self) -> u8 {
        match self {
            ErrorKind::ColorFail => 1,
            ErrorKind::LineCodeFail => 2,
            ErrorKind::LevelFail => 3,
            ErrorKind::LisFail => 4,
            ErrorKind::UnknownFail => 5,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ColorFail => "COLOR_FAIL",
            ErrorKind::LineCodeFail => "LINE_CODE_FAIL",
            ErrorKind::LevelFail => "LEVEL_FAIL",
            ErrorKind::LisFail => "LIS_FAIL",
            ErrorKind::UnknownFail => "UNKNOWN_FAIL",
        };
        f.write_str(name)
    }
}

/// 6-DOF robot pose.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub rx: f64,
    pub ry: f64,
    pub rz: f64,
}

impl Pose {
    pub fn new(x: f64, y: f64, z: f64, rx: f64, ry: f64, rz: f64) -> Self {
        Self { x, y, z, rx, ry, rz }
    }
}

/// Address of a zone or one of its subzones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ZoneKey {
    pub zone: ZoneId,
    pub subzone: Option<ZoneId>,
}

impl ZoneKey {
    pub fn zone(zone: ZoneId) -> Self {
        Self { zone, subzone: None }
    }

    pub fn subzone(zone: ZoneId, subzone: ZoneId) -> Self {
        Self {
            zone,
            subzone: Some(subzone),
        }
    }

    /// Subzone id as sent on the wire (0 when addressing the zone itself).
    pub fn subzone_code(&self) -> ZoneId {
        self.subzone.unwrap_or(0)
    }
}

impl fmt::Display for ZoneKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.subzone {
            Some(sub) => write!(f, "{}/{}", self.zone, sub),
            None => write!(f, "{}", self.zone),
        }
    }
}

/// Address of one slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotRef {
    pub key: ZoneKey,
    pub position: Position,
}

impl SlotRef {
    pub fn new(key: ZoneKey, position: Position) -> Self {
        Self { key, position }
    }
}

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.key, self.position)
    }
}

fn serialize_code<S, T>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: WireCode,
{
    serializer.serialize_u8(value.as_ref().map(WireCode::code).unwrap_or(0))
}

/// One physical instruction returned for a robot poll.
///
/// The all-zero default value is the neutral no-op.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Task {
    pub curr_zone: ZoneId,
    pub next_zone: ZoneId,
    pub curr_subzone: ZoneId,
    pub next_subzone: ZoneId,
    pub curr_wp: Pose,
    pub next_wp: Pose,
    #[serde(serialize_with = "serialize_code")]
    pub curr_task: Option<TaskType>,
    #[serde(serialize_with = "serialize_code")]
    pub next_task: Option<TaskType>,
    #[serde(serialize_with = "serialize_code")]
    pub item_type: Option<ItemType>,
    pub vial_type: VialTypeId,
    pub correlation_id: CorrelationId,
    pub color: ColorId,
    pub decapped: bool,
    pub curr_idx: Position,
    pub next_idx: Position,
}

impl Task {
    /// The neutral instruction returned when nothing is feasible.
    pub fn noop() -> Self {
        Self::default()
    }

    pub fn is_noop(&self) -> bool {
        self.curr_task.is_none() && self.next_task.is_none() && self.correlation_id == 0
    }

    /// A single-zone instruction (start, stop, door, pause, init).
    pub fn control(kind: TaskType, key: ZoneKey, correlation_id: CorrelationId) -> Self {
        Self {
            curr_zone: key.zone,
            curr_subzone: key.subzone_code(),
            curr_task: Some(kind),
            correlation_id,
            ..Self::default()
        }
    }

    /// The primary kind of this task, if any.
    pub fn kind(&self) -> Option<TaskType> {
        self.curr_task.or(self.next_task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_task_serializes_to_zero_codes() {
        let json = serde_json::to_value(Task::noop()).expect("serialize task");
        assert_eq!(json["curr_task"], 0);
        assert_eq!(json["item_type"], 0);
        assert_eq!(json["correlation_id"], 0);
        assert!(Task::noop().is_noop());
    }

    #[test]
    fn control_task_addresses_subzone() {
        let task = Task::control(TaskType::Open, ZoneKey::subzone(4, 2), 77);
        assert_eq!(task.curr_zone, 4);
        assert_eq!(task.curr_subzone, 2);
        assert_eq!(task.kind(), Some(TaskType::Open));
        let json = serde_json::to_value(&task).expect("serialize task");
        assert_eq!(json["curr_task"], 5);
        assert!(!task.is_noop());
    }

    #[test]
    fn phases_use_screaming_names() {
        let phase: ZonePhase = serde_json::from_str("\"READY_TO_UNLOAD\"").expect("parse phase");
        assert_eq!(phase, ZonePhase::ReadyToUnload);
        assert_eq!(phase.to_string(), "READY_TO_UNLOAD");
        assert_eq!(phase.code(), 5);
    }
}
