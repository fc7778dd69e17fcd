//! Addressable positions inside a leaf zone.

use serde::{Deserialize, Serialize};

use crate::config::SlotConfig;
use crate::transition::ZoneTransition;
use crate::types::{ColorId, Position, VialTypeId};
use crate::vial::Vial;

/// One position, owning at most one vial.
#[derive(Clone, Debug)]
pub struct Slot {
    pub position: Position,
    pub types: Vec<VialTypeId>,
    pub emergency: bool,
    pub color: Option<ColorId>,
    pub transit: Option<String>,
    content: Option<Vial>,
}

/// Persisted form of an occupied slot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlotSnapshot {
    pub position: Position,
    pub content: Vial,
}

impl Slot {
    pub fn new(position: Position) -> Self {
        Self {
            position,
            types: Vec::new(),
            emergency: false,
            color: None,
            transit: None,
            content: None,
        }
    }

    pub fn from_config(config: &SlotConfig) -> Self {
        Self {
            position: config.position,
            types: config.types.clone(),
            emergency: config.emergency,
            color: config.color,
            transit: config.transit.clone(),
            content: None,
        }
    }

    pub fn content(&self) -> Option<&Vial> {
        self.content.as_ref()
    }

    pub fn content_mut(&mut self) -> Option<&mut Vial> {
        self.content.as_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_none()
    }

    /// Place a vial, returning whatever the slot held before.
    pub fn put(&mut self, vial: Vial) -> Option<Vial> {
        self.content.replace(vial)
    }

    pub fn take(&mut self) -> Option<Vial> {
        self.content.take()
    }

    /// Position-level filters: transit, color and an overlapping type.
    pub fn matches(&self, rule: &ZoneTransition) -> bool {
        let transit_ok = self
            .transit
            .as_ref()
            .is_none_or(|t| rule.transits.is_empty() || rule.transits.contains(t));
        let color_ok = self
            .color
            .is_none_or(|c| rule.colors.is_empty() || rule.colors.contains(&c));
        let types_ok = self.types.is_empty()
            || rule.types.is_empty()
            || self.types.iter().any(|t| rule.types.contains(t));
        transit_ok && color_ok && types_ok
    }

    pub fn snapshot(&self) -> Option<SlotSnapshot> {
        self.content.as_ref().map(|vial| SlotSnapshot {
            position: self.position,
            content: vial.clone(),
        })
    }
}
