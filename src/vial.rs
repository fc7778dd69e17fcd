//! Vial records and their rule-matching predicate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transition::{MatchContext, ZoneTransition};
use crate::types::{ColorId, ErrorKind, VialTypeId, ZoneId, ZoneKey};

/// A tracked sample carrier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vial {
    pub line_code: String,
    #[serde(default)]
    pub color: Option<ColorId>,
    #[serde(default, rename = "type")]
    pub vial_type: Option<VialTypeId>,
    #[serde(default)]
    pub current_zone_id: ZoneId,
    #[serde(default)]
    pub current_subzone_id: Option<ZoneId>,
    /// Destination hint; only transitions into this zone match while set.
    #[serde(default)]
    pub next_zone_id: Option<ZoneId>,
    #[serde(default = "default_fluid_level")]
    pub fluid_level: bool,
    #[serde(default)]
    pub centrifuged: bool,
    #[serde(default)]
    pub decapped: bool,
    #[serde(default)]
    pub emergency: bool,
    #[serde(default = "Utc::now")]
    pub added_time: DateTime<Utc>,
    /// Routing queue; the head is the active requirement.
    #[serde(default)]
    pub transits: Vec<String>,
    #[serde(default)]
    pub archive_type: Option<String>,
    #[serde(default)]
    pub error_code: Option<ErrorKind>,
    #[serde(default)]
    pub blood_bags: Vec<String>,
}

fn default_fluid_level() -> bool {
    true
}

impl Vial {
    pub fn new(line_code: impl Into<String>, color: Option<ColorId>, vial_type: Option<VialTypeId>) -> Self {
        Self {
            line_code: line_code.into(),
            color,
            vial_type,
            current_zone_id: 0,
            current_subzone_id: None,
            next_zone_id: None,
            fluid_level: true,
            centrifuged: false,
            decapped: false,
            emergency: false,
            added_time: Utc::now(),
            transits: Vec::new(),
            archive_type: None,
            error_code: None,
            blood_bags: Vec::new(),
        }
    }

    /// Record the vial's new location and clear its destination hint.
    pub fn relocate(&mut self, key: ZoneKey) {
        self.current_zone_id = key.zone;
        self.current_subzone_id = key.subzone;
        self.next_zone_id = None;
    }

    pub fn location(&self) -> ZoneKey {
        ZoneKey {
            zone: self.current_zone_id,
            subzone: self.current_subzone_id,
        }
    }

    pub fn active_transit(&self) -> Option<&str> {
        self.transits.first().map(String::as_str)
    }

    /// True when this vial satisfies every filter of `rule`.
    pub fn matches(&self, rule: &ZoneTransition, ctx: &MatchContext) -> bool {
        let destination_ok = self
            .next_zone_id
            .is_none_or(|hint| hint == rule.next_zone);
        let transit_ok = rule.transits.is_empty()
            || self
                .active_transit()
                .is_none_or(|head| rule.transits.iter().any(|t| t == head));
        let color_ok = self
            .color
            .is_none_or(|c| rule.colors.is_empty() || rule.colors.contains(&c));
        let type_ok = self
            .vial_type
            .is_none_or(|t| rule.types.is_empty() || rule.types.contains(&t));
        let centrifuged_ok = rule
            .centrifuged
            .is_none_or(|required| required == self.centrifuged);
        let disposal_ok = !rule.disposable || self.is_disposable(ctx);
        destination_ok && transit_ok && color_ok && type_ok && centrifuged_ok && disposal_ok
    }

    /// Age strictly exceeds the configured disposal interval.
    pub fn is_disposable(&self, ctx: &MatchContext) -> bool {
        match ctx.disposal_time {
            Some(interval) => ctx
                .now
                .signed_duration_since(self.added_time)
                .to_std()
                .is_ok_and(|age| age > interval),
            None => false,
        }
    }

    /// Add `transit`, replacing an archive code when present, then re-sort by
    /// the color's priority order and drop codes that order does not know.
    pub fn set_transit(&mut self, transit: &str, archive_transits: &[String], order: Option<&[String]>) {
        if !transit.is_empty() && !self.transits.iter().any(|t| t == transit) {
            let archive_slot = archive_transits
                .iter()
                .find_map(|arch| self.transits.iter().position(|t| t == arch));
            match archive_slot {
                Some(index) => self.transits[index] = transit.to_string(),
                None => self.transits.push(transit.to_string()),
            }
        }
        if let Some(order) = order {
            self.transits.retain(|t| order.contains(t));
            self.transits
                .sort_by_key(|t| order.iter().position(|o| o == t).unwrap_or(usize::MAX));
        }
    }

    /// Advance the routing queue; the last requirement becomes `final_transit`.
    pub fn progress_transit(&mut self, final_transit: &str) {
        match self.transits.len() {
            0 => self.transits.push(final_transit.to_string()),
            1 => self.transits[0] = final_transit.to_string(),
            _ => {
                self.transits.remove(0);
            }
        }
    }

    pub fn add_bags(&mut self, bags: &[String]) {
        if bags.is_empty() {
            return;
        }
        self.blood_bags.clear();
        for bag in bags {
            if !self.blood_bags.contains(bag) {
                self.blood_bags.push(bag.clone());
            }
        }
    }
}
