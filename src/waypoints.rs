//! Pose lookup for slot positions.
//!
//! Poses are registered per (robot, zone, subzone, item type). A rack can be
//! given as explicit poses or as one or more grids spanned by three corners.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{ItemType, Pose, Position, RobotId, ZoneId};

/// Resolves a slot position to a robot pose.
pub trait WaypointSource: Send + Sync {
    fn pose(
        &self,
        robot: RobotId,
        zone: ZoneId,
        subzone: ZoneId,
        item_type: ItemType,
        position: Position,
    ) -> Pose;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WaypointKey {
    pub robot: RobotId,
    pub zone: ZoneId,
    /// 0 addresses the zone itself.
    pub subzone: ZoneId,
    pub item_type: ItemType,
}

/// `[[waypoints]]` entry of the lab configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WaypointConfig {
    pub robot: RobotId,
    pub zone_id: ZoneId,
    #[serde(default)]
    pub subzone_id: ZoneId,
    #[serde(default)]
    pub item_type: ItemType,
    /// `[x, y, z, rx, ry, rz]` per point.
    pub points: Vec<[f64; 6]>,
    /// With `rows`/`cols`, each consecutive triple of points spans a grid.
    #[serde(default)]
    pub rows: Option<usize>,
    #[serde(default)]
    pub cols: Option<usize>,
}

#[derive(Debug, Default, Clone)]
pub struct WaypointTable {
    poses: HashMap<WaypointKey, Vec<Pose>>,
}

impl WaypointTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(entries: &[WaypointConfig]) -> Result<Self> {
        let mut table = Self::new();
        for entry in entries {
            let key = WaypointKey {
                robot: entry.robot,
                zone: entry.zone_id,
                subzone: entry.subzone_id,
                item_type: entry.item_type,
            };
            let points: Vec<Pose> = entry.points.iter().map(|p| pose_from(*p)).collect();
            match (entry.rows, entry.cols) {
                (Some(rows), Some(cols)) => table.register_grids(key, &points, rows, cols)?,
                (None, None) => table.register(key, points),
                _ => {
                    return Err(Error::config(format!(
                        "waypoints for zone {} need both rows and cols",
                        entry.zone_id
                    )));
                }
            }
        }
        Ok(table)
    }

    pub fn register(&mut self, key: WaypointKey, poses: Vec<Pose>) {
        debug!(zone = key.zone, subzone = key.subzone, count = poses.len(), "waypoints registered");
        self.poses.insert(key, poses);
    }

    /// Register the concatenation of one grid per corner triple.
    pub fn register_grids(&mut self, key: WaypointKey, corners: &[Pose], rows: usize, cols: usize) -> Result<()> {
        if corners.is_empty() || corners.len() % 3 != 0 {
            return Err(Error::config(format!(
                "waypoint grid for zone {} needs corner triples, got {} points",
                key.zone,
                corners.len()
            )));
        }
        let poses = corners
            .chunks(3)
            .flat_map(|c| grid(c[0], c[1], c[2], rows, cols))
            .collect();
        self.register(key, poses);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }
}

impl WaypointSource for WaypointTable {
    fn pose(
        &self,
        robot: RobotId,
        zone: ZoneId,
        subzone: ZoneId,
        item_type: ItemType,
        position: Position,
    ) -> Pose {
        let key = WaypointKey {
            robot,
            zone,
            subzone,
            item_type,
        };
        let index = (position as usize).saturating_sub(1);
        self.poses
            .get(&key)
            .and_then(|poses| poses.get(index))
            .copied()
            .unwrap_or_default()
    }
}

fn pose_from(p: [f64; 6]) -> Pose {
    Pose::new(p[0], p[1], p[2], p[3], p[4], p[5])
}

/// Row-major grid: `origin` is the first slot, `row_end` the last slot of
/// the first row and `col_end` the first slot of the last row. Height and
/// orientation come from `origin`.
pub fn grid(origin: Pose, row_end: Pose, col_end: Pose, rows: usize, cols: usize) -> Vec<Pose> {
    let step = |from: f64, to: f64, n: usize| if n > 1 { (to - from) / (n - 1) as f64 } else { 0.0 };
    let (cx, cy) = (step(origin.x, row_end.x, cols), step(origin.y, row_end.y, cols));
    let (rx, ry) = (step(origin.x, col_end.x, rows), step(origin.y, col_end.y, rows));
    let mut out = Vec::with_capacity(rows * cols);
    for row in 0..rows {
        for col in 0..cols {
            out.push(Pose {
                x: origin.x + col as f64 * cx + row as f64 * rx,
                y: origin.y + col as f64 * cy + row as f64 * ry,
                ..origin
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(x: f64, y: f64) -> Pose {
        Pose::new(x, y, 50.0, 0.0, 0.0, 0.0)
    }

    #[test]
    fn grid_interpolates_between_corners() {
        let poses = grid(p(2.0, 2.0), p(6.0, 2.0), p(2.0, 6.0), 2, 2);
        assert_eq!(poses, vec![p(2.0, 2.0), p(6.0, 2.0), p(2.0, 6.0), p(6.0, 6.0)]);
    }

    #[test]
    fn unknown_key_yields_zero_pose() {
        let table = WaypointTable::new();
        assert_eq!(table.pose(1, 3, 0, ItemType::Vial, 1), Pose::default());
    }

    #[test]
    fn lookup_is_one_based() {
        let mut table = WaypointTable::new();
        let key = WaypointKey {
            robot: 1,
            zone: 3,
            subzone: 2,
            item_type: ItemType::Vial,
        };
        table
            .register_grids(key, &[p(0.0, 0.0), p(10.0, 0.0), p(0.0, 10.0)], 2, 3)
            .expect("grid");
        assert_eq!(table.pose(1, 3, 2, ItemType::Vial, 2), p(5.0, 0.0));
        assert_eq!(table.pose(1, 3, 2, ItemType::Vial, 4), p(0.0, 10.0));
        assert_eq!(table.pose(1, 3, 2, ItemType::Vial, 99), Pose::default());
        assert_eq!(table.pose(2, 3, 2, ItemType::Vial, 1), Pose::default());
    }

    #[test]
    fn config_requires_both_dimensions() {
        let entry: WaypointConfig =
            toml::from_str("robot = 1\nzone_id = 2\nrows = 2\npoints = [[0.0, 0.0, 0.0, 0.0, 0.0, 0.0]]\n")
                .expect("parse");
        assert!(WaypointTable::from_config(&[entry]).is_err());
    }

    #[test]
    fn config_registers_explicit_points() {
        let entry: WaypointConfig = toml::from_str(
            "robot = 1\nzone_id = 2\npoints = [[1.0, 2.0, 3.0, 0.0, 0.0, 0.0]]\n",
        )
        .expect("parse");
        let table = WaypointTable::from_config(&[entry]).expect("table");
        assert_eq!(table.pose(1, 2, 0, ItemType::Vial, 1), Pose::new(1.0, 2.0, 3.0, 0.0, 0.0, 0.0));
    }
}
