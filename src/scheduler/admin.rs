//! Operator commands and intake bookkeeping.

use rand::Rng;
use tracing::{info, warn};

use crate::audit::AuditEvent;
use crate::config::parse_clock;
use crate::error::{Error, Result};
use crate::persistence::ArchiveEntry;
use crate::types::{ColorId, CorrelationId, Position, SlotRef, ZoneId, ZoneKey, ZonePhase};
use crate::vial::Vial;

use super::world::WorldState;

impl WorldState {
    /// Empty every zone and reload the stateful ones from the store. With
    /// `archive_reset` the empty state is saved first, so nothing comes back.
    pub(crate) fn restart(&mut self, archive_reset: bool) {
        self.rotation.reset();
        for zone in self.tree.iter_mut() {
            zone.restart();
        }
        for rule in self.rules.values() {
            rule.reset_cursors();
        }
        self.queues.clear();
        self.futures.clear();
        self.last_issued.clear();
        if archive_reset {
            self.persist();
            info!("archive reset");
        }
        self.place_fixtures();
        self.import_snapshot();
        if let Err(err) = self.reset_controls() {
            warn!(error = %err, "controls not removed");
        }
        self.record(AuditEvent::Restarted { archive_reset });
    }

    fn place_fixtures(&mut self) {
        let fixtures = self.config.fixtures.clone();
        for fixture in fixtures {
            let key = ZoneKey {
                zone: fixture.zone_id,
                subzone: fixture.subzone_id,
            };
            let mut vial = Vial::new(fixture.line_code, fixture.color, fixture.vial_type);
            vial.relocate(key);
            vial.next_zone_id = fixture.next_zone;
            match self.tree.target_mut(key) {
                Ok(zone) => {
                    if let Err(vial) = zone.put_at(fixture.position, vial) {
                        warn!(zone = %key, line_code = %vial.line_code, "fixture slot unavailable");
                    }
                }
                Err(err) => warn!(error = %err, "fixture names an unknown zone"),
            }
        }
    }

    pub(crate) fn set_disposal_time(&mut self, secs: Option<u64>) {
        info!(?secs, "disposal time changed");
        self.config.app.disposal_time_secs = secs;
    }

    pub(crate) fn set_controls_time(&mut self, time: Option<String>) -> Result<()> {
        if let Some(value) = &time {
            parse_clock(value)?;
        }
        info!(?time, "controls time changed");
        self.config.app.controls_time = time;
        Ok(())
    }

    /// Load the configured control vials. Nothing is placed unless the
    /// target sits in its ready phase; returns the number of vials placed.
    pub(crate) fn add_controls(&mut self) -> Result<usize> {
        let Some(controls) = self.config.controls.clone() else {
            return Ok(0);
        };
        let key = ZoneKey {
            zone: controls.zone_id,
            subzone: controls.subzone_id,
        };
        let target = self.tree.target_mut(key)?;
        if target.phase() != controls.ready_phase {
            info!(zone = %key, phase = %target.phase(), "controls cannot be added");
            return Ok(0);
        }
        let mut placed = 0;
        for control in &controls.vials {
            let Some(slot) = target.slot_at_mut(control.position) else {
                warn!(zone = %key, position = control.position, "control slot not configured");
                continue;
            };
            let mut vial = Vial::new(
                format!("CTRL-{}-{}", key.zone, control.position),
                controls.color,
                control.vial_type,
            );
            vial.relocate(key);
            vial.transits = control.transits.clone();
            slot.color = controls.color;
            slot.types = control.vial_type.into_iter().collect();
            if let Some(old) = slot.put(vial) {
                warn!(zone = %key, position = control.position, line_code = %old.line_code, "control replaced a vial");
            }
            placed += 1;
        }
        info!(zone = %key, placed, "controls added");
        self.persist();
        Ok(placed)
    }

    /// Empty the controls target.
    pub(crate) fn reset_controls(&mut self) -> Result<()> {
        let Some(controls) = &self.config.controls else {
            return Ok(());
        };
        let key = ZoneKey {
            zone: controls.zone_id,
            subzone: controls.subzone_id,
        };
        let removed = self.tree.target_mut(key)?.drain().len();
        info!(zone = %key, removed, "controls removed");
        self.persist();
        Ok(())
    }

    /// Empty the dustbin once it is reported cleared. Only a bin in LOADING
    /// is touched; returns whether it was.
    pub(crate) fn clear_dustbin(&mut self) -> Result<bool> {
        let Some(id) = self.config.app.dustbin_zone_id else {
            return Ok(false);
        };
        let bin = self.tree.get_mut(id)?;
        if bin.phase() != ZonePhase::Loading {
            return Ok(false);
        }
        let removed = bin.drain().len();
        bin.progress_phase();
        info!(zone = id, removed, "dustbin cleared");
        self.persist();
        Ok(true)
    }

    /// Send a running (sub)zone back to READY_TO_START so it runs again.
    pub(crate) fn extend_runtime(&mut self, key: ZoneKey) -> Result<()> {
        let target = self.tree.target_mut(key)?;
        target.cancel_timer();
        if !target.reset_phase(ZonePhase::ReadyToStart) {
            return Err(Error::PhaseNotInOrder {
                key,
                phase: ZonePhase::ReadyToStart,
            });
        }
        info!(zone = %key, "runtime extended");
        self.persist();
        Ok(())
    }

    /// Remove a vial wherever it is. Returns false if no slot holds it.
    pub(crate) fn delete_vial(&mut self, line_code: &str) -> bool {
        let Some(at) = self.tree.find_vial(line_code) else {
            info!(line_code, "vial to delete not found");
            return false;
        };
        let label = self
            .tree
            .target(at.key)
            .map(|z| AuditEvent::slot_label(&z.name, at))
            .unwrap_or_else(|_| at.to_string());
        if let Some(slot) = self.tree.slot_mut(at) {
            slot.take();
        }
        info!(line_code, location = %at, "vial deleted");
        self.record(AuditEvent::VialDeleted {
            line_code: line_code.to_string(),
            location: label,
        });
        self.persist();
        true
    }

    /// Restart one zone (its whole archive group, if it belongs to one) or,
    /// with `None`, every stateful zone.
    pub(crate) fn reset_archives(&mut self, zone: Option<ZoneId>) -> Result<()> {
        let zones: Vec<ZoneId> = match zone {
            Some(id) => {
                self.tree.get(id)?;
                self.config
                    .app
                    .archive_groups
                    .iter()
                    .find(|group| group.contains(&id))
                    .cloned()
                    .unwrap_or_else(|| vec![id])
            }
            None => self.tree.iter().filter(|z| z.stateful).map(|z| z.id).collect(),
        };
        for id in &zones {
            self.tree.get_mut(*id)?.restart();
        }
        info!(?zones, "archives reset");
        self.record(AuditEvent::ArchiveReset { zones });
        self.persist();
        Ok(())
    }

    /// Return empty, unloaded archive subzones to service.
    pub(crate) fn reset_empty_archives(&mut self) -> Result<()> {
        let archives = self.config.app.archive_zone_ids.clone();
        let excluded = self.config.app.capacity_excluded_types.clone();
        for id in archives {
            for sub in self.tree.get_mut(id)?.subzones_mut() {
                let eligible = sub.phase() == ZonePhase::ReadyToUnload
                    && sub.total_count() == 0
                    && sub.zone_type.is_none_or(|t| !excluded.contains(&t));
                if eligible {
                    sub.reset_phase(ZonePhase::ReadyToProcess);
                }
            }
        }
        self.persist();
        Ok(())
    }

    pub(crate) fn reset_faults(&mut self) -> Result<()> {
        for id in self.config.app.fault_zones() {
            self.tree.get_mut(id)?.restart();
        }
        info!("fault zones reset");
        self.persist();
        Ok(())
    }

    pub(crate) fn change_device_active(&mut self, device_id: u32, active: bool) -> bool {
        let mut changed = false;
        for zone in self.tree.iter_mut() {
            changed |= zone.change_device_active(device_id, active);
        }
        changed
    }

    pub(crate) fn archive_snapshot(&self) -> Vec<ArchiveEntry> {
        self.tree.snapshot(true)
    }

    /// Turn intake classification output into vials in the intake zone.
    /// Unknown positions are skipped; returns the number of vials placed.
    pub(crate) fn register_arrivals(&mut self, arrivals: &[(Position, ColorId)]) -> Result<usize> {
        let intake = self.config.app.intake_zone_id;
        let inspection = self.config.app.inspection_zone_id;
        let mut rng = rand::thread_rng();
        let mut placed = 0;
        for &(position, color) in arrivals {
            let Some(slot) = self.tree.get(intake)?.slot_at(position) else {
                warn!(position, "arrival at unknown intake position");
                continue;
            };
            let vial_type = slot
                .types
                .first()
                .copied()
                .or_else(|| self.config.vial_type_for(color));
            let emergency = slot.emergency;
            let mut vial = Vial::new(
                rng.gen_range(1_000_000..10_000_000u32).to_string(),
                Some(color),
                vial_type,
            );
            vial.emergency = emergency;
            vial.relocate(ZoneKey::zone(intake));
            vial.next_zone_id = Some(inspection);
            let at = SlotRef::new(ZoneKey::zone(intake), position);
            if let Some(previous) = self.tree.slot_mut(at).and_then(|s| s.put(vial)) {
                warn!(position, line_code = %previous.line_code, "arrival replaced an untracked vial");
            }
            placed += 1;
        }
        info!(intake, placed, "arrivals registered");
        Ok(placed)
    }

    /// Confirm the inspection move and drop the vial if the station saw none.
    pub(crate) fn confirm_presence(&mut self, id: CorrelationId, present: bool) -> Result<()> {
        self.execute_future(id)?;
        if present {
            return Ok(());
        }
        let inspection = self.config.app.inspection_zone_id;
        let zone = self.tree.get_mut(inspection)?;
        let first = zone
            .slots_mut()
            .first_mut()
            .ok_or(Error::NoVialAtInspection { zone_id: inspection })?;
        if let Some(vial) = first.take() {
            warn!(line_code = %vial.line_code, "vial missing at inspection, dropped");
        }
        zone.progress_phase();
        self.persist();
        Ok(())
    }
}
