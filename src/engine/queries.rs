use std::collections::HashMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::locations::location_and_descendants;
use crate::model::*;

use super::capacity::remaining_minutes;
use super::overlap::find_overlaps;
use super::reports::{average_durations, history_count, HistorySample};
use super::schedule::{build_scheduled_block, daily_candidates, day_span, list_daily_scheduled_blocks};
use super::{report_data_quality, Engine, EngineError, SharedSlotState};

fn validate_window(from: Ms, to: Ms) -> Result<(), EngineError> {
    if from > to {
        return Err(EngineError::validation("from must not be after to"));
    }
    if to - from > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

impl Engine {
    pub(super) fn slot_handles(&self) -> Vec<SharedSlotState> {
        self.slots.iter().map(|e| e.value().clone()).collect()
    }

    pub(super) fn slot_ids_in_block(&self, block_id: &Ulid) -> Vec<Ulid> {
        self.block_slots
            .get(block_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Slots of the given blocks (voided included) and every appointment in them.
    async fn load_slots(&self, block_ids: impl IntoIterator<Item = Ulid>) -> (Vec<TimeSlot>, Vec<Appointment>) {
        let mut slots = Vec::new();
        let mut appointments = Vec::new();
        for block_id in block_ids {
            for slot_id in self.slot_ids_in_block(&block_id) {
                let Some(ss) = self.get_slot(&slot_id) else {
                    continue;
                };
                let guard = ss.read().await;
                slots.push(guard.slot.clone());
                appointments.extend(guard.appointments.iter().cloned());
            }
        }
        (slots, appointments)
    }

    /// Every appointment in the engine, voided included.
    async fn all_appointments(&self) -> Vec<Appointment> {
        let mut out = Vec::new();
        for ss in self.slot_handles() {
            let guard = ss.read().await;
            out.extend(guard.appointments.iter().cloned());
        }
        out
    }

    // ── Lookups ──────────────────────────────────────────────

    pub fn get_appointment_type(&self, id: &Ulid) -> Option<AppointmentType> {
        self.appointment_types.get(id).map(|e| e.value().clone())
    }

    /// Appointment types sorted by name.
    pub fn list_appointment_types(&self, include_retired: bool) -> Vec<AppointmentType> {
        let mut types: Vec<AppointmentType> = self
            .appointment_types
            .iter()
            .filter(|e| include_retired || !e.is_retired())
            .map(|e| e.value().clone())
            .collect();
        types.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        types
    }

    pub fn get_appointment_block(&self, id: &Ulid) -> Option<AppointmentBlock> {
        self.blocks.get(id).map(|e| e.value().clone())
    }

    pub async fn get_time_slot(&self, id: &Ulid) -> Option<TimeSlot> {
        let ss = self.get_slot(id)?;
        let guard = ss.read().await;
        Some(guard.slot.clone())
    }

    /// Non-voided slots of a block, ordered by start.
    pub async fn get_time_slots_in_block(&self, block_id: Ulid) -> Vec<TimeSlot> {
        let (mut slots, _) = self.load_slots([block_id]).await;
        slots.retain(|s| !s.is_voided());
        slots.sort_by_key(|s| (s.span.start, s.id));
        slots
    }

    pub async fn get_appointment(&self, id: &Ulid) -> Option<Appointment> {
        let ss = self.get_slot(&self.slot_for_appointment(id)?)?;
        let guard = ss.read().await;
        guard.appointment(id).cloned()
    }

    /// Non-voided appointments in a slot, in booking order.
    pub async fn get_appointments_in_time_slot(&self, slot_id: Ulid) -> Result<Vec<Appointment>, EngineError> {
        let ss = self.get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let guard = ss.read().await;
        Ok(guard
            .appointments
            .iter()
            .filter(|a| !a.is_voided())
            .cloned()
            .collect())
    }

    pub async fn count_appointments_in_time_slot(
        &self,
        slot_id: Ulid,
        exclude_missed_and_cancelled: bool,
    ) -> Result<usize, EngineError> {
        let ss = self.get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let guard = ss.read().await;
        Ok(guard
            .appointments
            .iter()
            .filter(|a| !a.is_voided())
            .filter(|a| !exclude_missed_and_cancelled || a.status.occupies_slot())
            .count())
    }

    pub async fn get_appointment_current_status_start(&self, id: Ulid) -> Result<Ms, EngineError> {
        self.get_appointment(&id)
            .await
            .and_then(|a| a.current_status_start())
            .ok_or(EngineError::NotFound(id))
    }

    /// Non-voided appointments whose current status is one of `states`.
    pub async fn get_appointments_by_status(&self, states: &[AppointmentStatus]) -> Vec<Appointment> {
        let mut out: Vec<Appointment> = self
            .all_appointments()
            .await
            .into_iter()
            .filter(|a| !a.is_voided() && states.contains(&a.status))
            .collect();
        out.sort_by_key(|a| a.id);
        out
    }

    /// The patient's SCHEDULED or RESCHEDULED appointments.
    pub async fn get_scheduled_appointments_for_patient(&self, patient_id: Ulid) -> Vec<Appointment> {
        let mut out: Vec<Appointment> = self
            .get_appointments_by_status(&[AppointmentStatus::Scheduled, AppointmentStatus::Rescheduled])
            .await;
        out.retain(|a| a.patient_id == patient_id);
        out
    }

    /// The patient's non-voided appointment with the latest slot start.
    pub async fn get_last_appointment(&self, patient_id: Ulid) -> Option<Appointment> {
        let mut best: Option<(Ms, Appointment)> = None;
        for ss in self.slot_handles() {
            let guard = ss.read().await;
            let start = guard.slot.span.start;
            for a in guard
                .appointments
                .iter()
                .filter(|a| a.patient_id == patient_id && !a.is_voided())
            {
                if best.as_ref().is_none_or(|(s, b)| (start, a.id) > (*s, b.id)) {
                    best = Some((start, a.clone()));
                }
            }
        }
        best.map(|(_, a)| a)
    }

    // ── Capacity ─────────────────────────────────────────────

    pub async fn slot_occupancy(&self, slot_id: Ulid) -> Result<SlotOccupancy, EngineError> {
        let ss = self.get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let guard = ss.read().await;
        let occupancy = remaining_minutes(&guard.slot, &guard.appointments, |t| self.type_minutes(t));
        report_data_quality(slot_id, &occupancy.warnings);
        Ok(occupancy)
    }

    /// Unallocated minutes in a slot; negative when overbooked.
    pub async fn remaining_minutes(&self, slot_id: Ulid) -> Result<i64, EngineError> {
        Ok(self.slot_occupancy(slot_id).await?.remaining_minutes)
    }

    // ── Blocks ───────────────────────────────────────────────

    /// Stored blocks that conflict with `candidate`.
    pub fn find_overlaps(&self, candidate: &AppointmentBlock) -> Vec<AppointmentBlock> {
        let existing: Vec<AppointmentBlock> = self.blocks.iter().map(|e| e.value().clone()).collect();
        find_overlaps(candidate, &existing)
    }

    /// Non-voided blocks matching every given filter. A location filter also
    /// matches the location's descendants.
    pub async fn get_appointment_blocks(&self, filter: &BlockFilter) -> Result<Vec<AppointmentBlock>, EngineError> {
        if let (Some(from), Some(to)) = (filter.from, filter.to) {
            validate_window(from, to)?;
        }
        let locations = match filter.location_id {
            Some(root) => Some(location_and_descendants(self.locations.as_ref(), root).await?),
            None => None,
        };
        let mut hits: Vec<AppointmentBlock> = self
            .blocks
            .iter()
            .filter(|b| !b.is_voided())
            .filter(|b| filter.from.is_none_or(|from| b.span.end > from))
            .filter(|b| filter.to.is_none_or(|to| b.span.start < to))
            .filter(|b| locations.as_ref().is_none_or(|set| set.contains(&b.location_id)))
            .filter(|b| filter.provider_id.is_none_or(|p| b.owner.provider() == Some(p)))
            .filter(|b| filter.appointment_type_id.is_none_or(|t| b.offers(&t)))
            .map(|e| e.value().clone())
            .collect();
        hits.sort_by_key(|b| (b.span.start, b.id));
        Ok(hits)
    }

    pub async fn build_scheduled_block(&self, block_id: Ulid) -> Result<ScheduledAppointmentBlock, EngineError> {
        let block = self
            .get_appointment_block(&block_id)
            .ok_or(EngineError::NotFound(block_id))?;
        let (slots, appointments) = self.load_slots([block_id]).await;
        Ok(build_scheduled_block(&block, &slots, &appointments, |t| self.type_minutes(t)))
    }

    /// Occupied blocks at `location` on `date` (UTC).
    pub async fn list_daily_scheduled_blocks(
        &self,
        location_id: Ulid,
        date: NaiveDate,
    ) -> Vec<ScheduledAppointmentBlock> {
        let all: Vec<AppointmentBlock> = self.blocks.iter().map(|e| e.value().clone()).collect();
        let candidates: Vec<AppointmentBlock> = daily_candidates(location_id, day_span(date), &all)
            .into_iter()
            .cloned()
            .collect();
        let (slots, appointments) = self.load_slots(candidates.iter().map(|b| b.id)).await;
        list_daily_scheduled_blocks(location_id, date, &candidates, &slots, &appointments, |t| {
            self.type_minutes(t)
        })
    }

    /// Bookable slots for an appointment type intersecting `[from, to)`.
    /// Unless `include_full`, only slots with room for the type's default
    /// duration are returned.
    pub async fn get_time_slots_by_constraints(
        &self,
        constraints: &SlotConstraints,
        include_full: bool,
    ) -> Result<Vec<TimeSlot>, EngineError> {
        if let (Some(from), Some(to)) = (constraints.from, constraints.to) {
            validate_window(from, to)?;
        }
        let type_id = constraints.appointment_type_id;
        if !self.appointment_types.contains_key(&type_id) {
            return Err(EngineError::NotFound(type_id));
        }
        let needed = self.type_minutes(&type_id).unwrap_or(0);

        let blocks = self
            .get_appointment_blocks(&BlockFilter {
                from: None,
                to: None,
                location_id: constraints.location_id,
                provider_id: constraints.provider_id,
                appointment_type_id: Some(type_id),
            })
            .await?;

        let mut out = Vec::new();
        for block in &blocks {
            for slot_id in self.slot_ids_in_block(&block.id) {
                let Some(ss) = self.get_slot(&slot_id) else {
                    continue;
                };
                let guard = ss.read().await;
                let slot = &guard.slot;
                if slot.is_voided()
                    || constraints.from.is_some_and(|from| slot.span.end <= from)
                    || constraints.to.is_some_and(|to| slot.span.start >= to)
                {
                    continue;
                }
                if !include_full {
                    let occupancy = remaining_minutes(slot, &guard.appointments, |t| self.type_minutes(t));
                    if occupancy.remaining_minutes < needed {
                        continue;
                    }
                }
                out.push(slot.clone());
            }
        }
        out.sort_by_key(|s| (s.span.start, s.id));
        Ok(out)
    }

    // ── Reports ──────────────────────────────────────────────

    /// Average minutes spent in `status`, grouped by appointment type or by
    /// provider. Location-only blocks have no provider and are not counted
    /// in the per-provider variant.
    pub async fn get_average_duration(
        &self,
        from: Ms,
        to: Ms,
        status: AppointmentStatus,
        group_by: GroupBy,
    ) -> Result<HashMap<Ulid, f64>, EngineError> {
        validate_window(from, to)?;
        let mut samples = Vec::new();
        for ss in self.slot_handles() {
            let guard = ss.read().await;
            let provider = self
                .blocks
                .get(&guard.slot.block_id)
                .and_then(|b| b.owner.provider());
            for a in guard.appointments.iter().filter(|a| !a.is_voided()) {
                let key = match group_by {
                    GroupBy::AppointmentType => a.appointment_type_id,
                    GroupBy::Provider => match provider {
                        Some(p) => p,
                        None => continue,
                    },
                };
                samples.extend(a.history.iter().map(|entry| HistorySample { key, entry: *entry }));
            }
        }
        Ok(average_durations(samples, from, to, status))
    }

    /// Closed history entries with `status` inside `[from, to]`.
    pub async fn get_history_count(&self, from: Ms, to: Ms, status: AppointmentStatus) -> Result<usize, EngineError> {
        validate_window(from, to)?;
        let appointments = self.all_appointments().await;
        Ok(history_count(
            appointments
                .iter()
                .filter(|a| !a.is_voided())
                .flat_map(|a| a.history.iter()),
            from,
            to,
            status,
        ))
    }

    /// Non-voided appointments per type, for slots starting in `[from, to)`.
    pub async fn get_appointment_type_distribution(
        &self,
        from: Ms,
        to: Ms,
    ) -> Result<HashMap<Ulid, usize>, EngineError> {
        validate_window(from, to)?;
        let mut counts = HashMap::new();
        for ss in self.slot_handles() {
            let guard = ss.read().await;
            if guard.slot.span.start < from || guard.slot.span.start >= to {
                continue;
            }
            for a in guard.appointments.iter().filter(|a| !a.is_voided()) {
                *counts.entry(a.appointment_type_id).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }
}
