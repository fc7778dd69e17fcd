//! Applying inspection-station results to the vial under the camera.
//!
//! Deployments differ in how they derive type and transit from color. Each
//! one is a [`ClassificationPolicy`] entry selected by `app.app_id`.

use serde::Deserialize;
use tracing::{info, warn};

use crate::audit::AuditEvent;
use crate::error::{Error, Result};
use crate::scheduler::world::WorldState;
use crate::types::{ColorId, CorrelationId, ErrorKind, VialTypeId};
use crate::vial::Vial;

/// Color-to-transit assignment.
#[derive(Debug, Clone, Deserialize)]
pub struct ColorTransit {
    pub colors: Vec<ColorId>,
    pub transit: String,
}

/// Color-to-type fallback used when the station reports no type.
#[derive(Debug, Clone, Deserialize)]
pub struct ColorType {
    pub colors: Vec<ColorId>,
    pub vial_type: VialTypeId,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClassificationPolicy {
    pub app_id: u32,
    pub color_types: Vec<ColorType>,
    pub color_transits: Vec<ColorTransit>,
    /// Vials of this color keep their recorded line code; a different scan
    /// routes them to the fault zone.
    pub pilot_color: Option<ColorId>,
    /// Colors the station may not overwrite.
    pub keep_colors: Vec<ColorId>,
    /// Route vials whose processing device is switched off to the fault zone.
    pub check_device_active: bool,
    /// Colors allowed to leave inspection without a transit.
    pub lis_exempt_colors: Vec<ColorId>,
}

impl ClassificationPolicy {
    fn type_for(&self, color: Option<ColorId>) -> Option<VialTypeId> {
        let color = color?;
        self.color_types
            .iter()
            .find(|m| m.colors.contains(&color))
            .map(|m| m.vial_type)
    }

    fn transit_for(&self, color: Option<ColorId>) -> Option<&str> {
        let color = color?;
        self.color_transits
            .iter()
            .find(|m| m.colors.contains(&color))
            .map(|m| m.transit.as_str())
    }
}

/// What the inspection station reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassificationResult {
    pub success: bool,
    pub vial_type: Option<VialTypeId>,
    pub line_code: String,
    pub color: Option<ColorId>,
}

/// Error kind for a vial the station could not classify.
fn failure_kind(vial: &Vial) -> ErrorKind {
    if vial.color.is_none_or(|c| c == 0) {
        ErrorKind::ColorFail
    } else if vial.line_code.is_empty() {
        ErrorKind::LineCodeFail
    } else {
        ErrorKind::LevelFail
    }
}

impl WorldState {
    /// Confirm the move into inspection, then classify the vial sitting in
    /// the inspection zone's first slot.
    pub(crate) fn classification_result(
        &mut self,
        id: CorrelationId,
        result: &ClassificationResult,
    ) -> Result<()> {
        self.execute_future(id)?;
        let inspection = self.config.app.inspection_zone_id;
        let fault_zone = self.config.app.fault_zone_id;
        let policy = self
            .config
            .classification
            .iter()
            .find(|p| p.app_id == self.config.app.app_id)
            .cloned()
            .unwrap_or_default();

        let device_active = result
            .color
            .or_else(|| self.inspected_vial(inspection).and_then(|v| v.color))
            .and_then(|c| self.config.zone_for_color(c))
            .map(|zone| self.tree.get(zone).is_ok_and(|z| z.is_active_zone()));

        let vial = self
            .tree
            .get_mut(inspection)?
            .slots_mut()
            .first_mut()
            .and_then(|slot| slot.content_mut())
            .ok_or(Error::NoVialAtInspection { zone_id: inspection })?;

        if !vial.centrifuged {
            vial.vial_type = result.vial_type.or_else(|| policy.type_for(vial.color)).or(vial.vial_type);
        }
        let routed = if !result.success {
            Some(failure_kind(vial))
        } else if vial.centrifuged {
            None
        } else if policy.pilot_color.is_some()
            && vial.color == policy.pilot_color
            && !vial.line_code.is_empty()
            && vial.line_code != result.line_code
        {
            Some(ErrorKind::LineCodeFail)
        } else {
            if !result.line_code.is_empty() {
                vial.line_code = result.line_code.clone();
            }
            if vial.color.is_none_or(|c| !policy.keep_colors.contains(&c)) {
                vial.color = result.color.or(vial.color);
            }
            if policy.check_device_active && device_active == Some(false) {
                Some(ErrorKind::UnknownFail)
            } else {
                if let Some(transit) = policy.transit_for(vial.color) {
                    let order = self.config.transit_order_for(vial.color);
                    vial.set_transit(transit, &self.config.app.archive_transits, order);
                }
                let exempt = vial.color.is_some_and(|c| policy.lis_exempt_colors.contains(&c));
                let missing = vial.active_transit().is_none_or(str::is_empty);
                (!policy.color_transits.is_empty() && missing && !exempt).then_some(ErrorKind::LisFail)
            }
        };

        let Some(kind) = routed else {
            info!(line_code = %vial.line_code, transit = ?vial.active_transit(), "vial classified");
            return Ok(());
        };
        vial.next_zone_id = Some(fault_zone);
        vial.error_code = Some(kind);
        warn!(line_code = %vial.line_code, reason = %kind, "vial routed to fault zone");
        let event = AuditEvent::VialRouted {
            line_code: vial.line_code.clone(),
            reason: kind.to_string(),
        };
        self.record(event);
        Ok(())
    }

    fn inspected_vial(&self, inspection: u64) -> Option<&Vial> {
        self.tree.get(inspection).ok()?.slots().first()?.content()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAudit;
    use crate::config::LabConfig;
    use crate::persistence::MemoryStore;
    use crate::types::{SlotRef, ZoneKey};
    use crate::waypoints::WaypointTable;
    use std::sync::Arc;

    const CONFIG: &str = r#"
        [app]
        robots = [1]
        app_id = 7
        inspection_zone_id = 2
        fault_zone_id = 10

        [[zones]]
        zone_id = 2
        slot_count = 1

        [[zones]]
        zone_id = 5
        slot_count = 4
        device_id = 50

        [[zones]]
        zone_id = 10
        slot_count = 4

        [[color_zone_map]]
        colors = [4]
        zone = 5

        [[color_transit_order]]
        colors = [2, 4]
        transits = ["DIMM", "SYSM", "ARCH"]

        [[classification]]
        app_id = 7
        pilot_color = 10
        keep_colors = [9, 10]
        check_device_active = true
        lis_exempt_colors = [10]
        color_types = [{ colors = [2], vial_type = 3 }]
        color_transits = [{ colors = [2], transit = "DIMM" }, { colors = [4], transit = "SYSM" }, { colors = [10], transit = "ARCH" }]
    "#;

    fn world() -> (WorldState, Arc<MemoryAudit>) {
        let audit = Arc::new(MemoryAudit::new());
        let world = WorldState::new(
            LabConfig::from_toml_str(CONFIG).expect("config"),
            Arc::new(MemoryStore::new()),
            audit.clone(),
            Arc::new(WaypointTable::new()),
        )
        .expect("world");
        (world, audit)
    }

    fn inspect(w: &mut WorldState, vial: Vial) {
        w.tree
            .slot_mut(SlotRef::new(ZoneKey::zone(2), 1))
            .expect("inspection slot")
            .put(vial);
    }

    fn inspected(w: &WorldState) -> Vial {
        w.inspected_vial(2).cloned().expect("vial at inspection")
    }

    fn scan(line_code: &str, color: Option<ColorId>) -> ClassificationResult {
        ClassificationResult {
            success: true,
            vial_type: None,
            line_code: line_code.to_string(),
            color,
        }
    }

    #[test]
    fn pilot_vial_with_foreign_line_code_goes_to_fault_zone() {
        let (mut w, audit) = world();
        inspect(&mut w, Vial::new("P-100", Some(10), Some(1)));
        w.classification_result(0, &scan("P-999", Some(10))).expect("classify");
        let vial = inspected(&w);
        assert_eq!(vial.next_zone_id, Some(10));
        assert_eq!(vial.error_code, Some(ErrorKind::LineCodeFail));
        assert_eq!(vial.line_code, "P-100");
        assert!(audit.events().iter().any(|e| matches!(
            e,
            AuditEvent::VialRouted { reason, .. } if reason == "LINE_CODE_FAIL"
        )));
    }

    #[test]
    fn successful_scan_assigns_code_type_and_transit() {
        let (mut w, _) = world();
        inspect(&mut w, Vial::new("", Some(2), None));
        w.classification_result(0, &scan("L-1", Some(2))).expect("classify");
        let vial = inspected(&w);
        assert_eq!(vial.line_code, "L-1");
        assert_eq!(vial.vial_type, Some(3));
        assert_eq!(vial.transits, vec!["DIMM".to_string()]);
        assert_eq!(vial.next_zone_id, None);
    }

    #[test]
    fn failed_scan_picks_error_kind_from_what_is_missing() {
        let (mut w, _) = world();
        inspect(&mut w, Vial::new("L-2", None, None));
        let failed = ClassificationResult::default();
        w.classification_result(0, &failed).expect("classify");
        assert_eq!(inspected(&w).error_code, Some(ErrorKind::ColorFail));

        let (mut w, _) = world();
        inspect(&mut w, Vial::new("", Some(2), None));
        w.classification_result(0, &failed).expect("classify");
        assert_eq!(inspected(&w).error_code, Some(ErrorKind::LineCodeFail));

        let (mut w, _) = world();
        inspect(&mut w, Vial::new("L-3", Some(2), None));
        w.classification_result(0, &failed).expect("classify");
        assert_eq!(inspected(&w).error_code, Some(ErrorKind::LevelFail));
    }

    #[test]
    fn inactive_device_routes_vial_away() {
        let (mut w, _) = world();
        assert!(w.change_device_active(50, false));
        inspect(&mut w, Vial::new("", Some(4), None));
        w.classification_result(0, &scan("L-4", Some(4))).expect("classify");
        let vial = inspected(&w);
        assert_eq!(vial.next_zone_id, Some(10));
        assert_eq!(vial.error_code, Some(ErrorKind::UnknownFail));
    }

    #[test]
    fn color_without_transit_fails_lis_lookup() {
        let (mut w, _) = world();
        inspect(&mut w, Vial::new("", Some(3), None));
        w.classification_result(0, &scan("L-5", Some(3))).expect("classify");
        assert_eq!(inspected(&w).error_code, Some(ErrorKind::LisFail));
    }

    #[test]
    fn missing_vial_is_an_error() {
        let (mut w, _) = world();
        let err = w
            .classification_result(0, &scan("L-6", Some(2)))
            .expect_err("empty inspection");
        assert!(matches!(err, Error::NoVialAtInspection { zone_id: 2 }));
    }
}
