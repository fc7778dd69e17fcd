//! Error types for the scheduling engine.

use std::path::PathBuf;

use crate::types::{RobotId, TransitionId, ZoneId, ZoneKey, ZonePhase};

/// The result type used throughout labflow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by configuration, scheduling and persistence.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A rule or request referenced a zone id that is not configured.
    #[error("unknown zone: {zone_id}")]
    UnknownZone { zone_id: ZoneId },

    /// A zone exists but has no subzone with the given local id.
    #[error("unknown subzone {subzone_id} in zone {zone_id}")]
    UnknownSubzone { zone_id: ZoneId, subzone_id: ZoneId },

    /// A rule referenced a transition id that is not configured.
    #[error("unknown transition: {transition_id}")]
    UnknownTransition { transition_id: TransitionId },

    /// A poll arrived from a robot that is not configured.
    #[error("unknown robot: {robot_id}")]
    UnknownRobot { robot_id: RobotId },

    /// A transition names a hook that the registry does not provide.
    #[error("transition {transition_id} references unknown hook `{name}`")]
    UnknownHook {
        transition_id: TransitionId,
        name: String,
    },

    /// An explicit reset targeted a phase outside the zone's order.
    #[error("phase {phase} is not part of the phase order of zone {key}")]
    PhaseNotInOrder { key: ZoneKey, phase: ZonePhase },

    /// A classification callback arrived with no vial at the inspection slot.
    #[error("no vial present at inspection zone {zone_id}")]
    NoVialAtInspection { zone_id: ZoneId },

    /// The configuration document is structurally invalid.
    #[error("invalid configuration: {message}")]
    Config { message: String },

    /// The configuration document could not be parsed.
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Reading or writing a file failed.
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Snapshot serialization failed.
    #[error("snapshot serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// The OS refused to start a zone timer thread.
    #[error("failed to start timer for zone {key}: {source}")]
    TimerSpawn {
        key: ZoneKey,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
