use dashmap::mapref::entry::Entry;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::capacity::{check_capacity, estimated_minutes, now_ms, remaining_minutes, validate_minutes};
use super::status::{initial_history, is_past_due, reconcile_target, transition_instant};
use super::{report_data_quality, Engine, EngineError};

/// Outcome of one reconciliation pass. One appointment failing does not stop
/// the rest.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub updated: Vec<Appointment>,
    pub failed: Vec<(Ulid, EngineError)>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.failed.is_empty()
    }
}

impl Engine {
    /// Book a new appointment into its time slot as SCHEDULED.
    ///
    /// Fails with `TimeSlotFull` when the appointment does not fit and the
    /// caller has not consented to overbooking; nothing is written then.
    pub async fn book_appointment(
        &self,
        request: NewAppointment,
        allow_overbook: bool,
    ) -> Result<Appointment, EngineError> {
        validate_minutes(request.duration_minutes)?;
        if let Some(ref r) = request.reason
            && r.len() > MAX_REASON_LEN
        {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        // Rebooking an existing appointment is a reschedule, not a booking.
        if self.slot_for_appointment(&request.id).is_some() {
            return Err(EngineError::AlreadyExists(request.id));
        }
        if !self.appointment_types.contains_key(&request.appointment_type_id) {
            return Err(EngineError::NotFound(request.appointment_type_id));
        }

        let slot_id = request.time_slot_id;
        let id = request.id;
        let _permit = self.mutation_permit().await;
        let ss = self.get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let mut guard = ss.write().await;
        // Purged while we waited for the lock
        if !self.slots.contains_key(&slot_id) {
            return Err(EngineError::NotFound(slot_id));
        }
        // Claim the id before anything is written. A concurrent booking of
        // the same id into another slot sees the claim and fails.
        match self.appointment_to_slot.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(v) => {
                v.insert(slot_id);
            }
        }
        let booked = self.book_claimed(&mut guard, request, allow_overbook).await;
        if booked.is_err() {
            self.appointment_to_slot.remove(&id);
        }
        booked
    }

    /// Capacity check and persist for a booking whose id is already claimed
    /// in the reverse index. The caller releases the claim on error.
    async fn book_claimed(
        &self,
        guard: &mut SlotState,
        request: NewAppointment,
        allow_overbook: bool,
    ) -> Result<Appointment, EngineError> {
        let slot_id = guard.slot.id;
        if guard.slot.is_voided() {
            return Err(EngineError::validation(format!("time slot {slot_id} is voided")));
        }
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_SLOT {
            return Err(EngineError::LimitExceeded("too many appointments in time slot"));
        }

        let occupancy = remaining_minutes(&guard.slot, &guard.appointments, |t| self.type_minutes(t));
        report_data_quality(slot_id, &occupancy.warnings);
        let requested = match estimated_minutes(
            request.id,
            request.appointment_type_id,
            request.duration_minutes,
            |t| self.type_minutes(t),
        ) {
            Ok(m) => m,
            Err(w) => {
                report_data_quality(slot_id, &[w]);
                0
            }
        };

        if let Err(e) = check_capacity(&occupancy, requested, allow_overbook) {
            metrics::counter!(observability::BOOKINGS_TOTAL, "outcome" => "full").increment(1);
            return Err(e);
        }
        let overbooked = requested > occupancy.remaining_minutes;

        let appointment = Appointment {
            id: request.id,
            patient_id: request.patient_id,
            time_slot_id: slot_id,
            visit_id: request.visit_id,
            appointment_type_id: request.appointment_type_id,
            duration_minutes: request.duration_minutes,
            reason: request.reason,
            status: AppointmentStatus::Scheduled,
            history: initial_history(now_ms()),
            void_reason: None,
        };
        let event = Event::AppointmentBooked {
            appointment: appointment.clone(),
        };
        self.persist_and_apply(slot_id, guard, &event)
            .await
            .map_err(|e| e.context(format!("booking appointment {} into time slot {slot_id}", appointment.id)))?;

        let outcome = if overbooked { "overbooked" } else { "booked" };
        metrics::counter!(observability::BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(observability::BOOKED_MINUTES).record(requested as f64);
        if overbooked {
            info!(
                time_slot = %slot_id,
                appointment = %appointment.id,
                requested,
                remaining = occupancy.remaining_minutes,
                "time slot overbooked"
            );
        }
        Ok(appointment)
    }

    /// Move an appointment to `status` now.
    pub async fn change_appointment_status(
        &self,
        id: Ulid,
        status: AppointmentStatus,
    ) -> Result<(), EngineError> {
        self.change_appointment_status_at(id, status, now_ms()).await
    }

    /// Move an appointment to `status` as of `now`. The recorded instant is
    /// floored at the start of the current history entry.
    pub async fn change_appointment_status_at(
        &self,
        id: Ulid,
        status: AppointmentStatus,
        now: Ms,
    ) -> Result<(), EngineError> {
        let _permit = self.mutation_permit().await;
        let (slot_id, mut guard) = self.resolve_appointment_write(&id).await?;
        let at = guard
            .appointment(&id)
            .map(|a| transition_instant(a, now))
            .ok_or(EngineError::NotFound(id))?;
        let event = Event::AppointmentStatusChanged {
            id,
            time_slot_id: slot_id,
            status,
            at,
        };
        self.persist_and_apply(slot_id, &mut guard, &event)
            .await
            .map_err(|e| e.context(format!("changing status of appointment {id}")))?;
        metrics::counter!(
            observability::STATUS_TRANSITIONS_TOTAL,
            "status" => observability::status_label(status)
        )
        .increment(1);
        Ok(())
    }

    /// Appointments (with their slot) that reconciliation would move at `now`.
    pub async fn collect_past_due(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut due = Vec::new();
        for ss in self.slot_handles() {
            let guard = ss.read().await;
            if guard.slot.span.end >= now {
                continue;
            }
            for a in &guard.appointments {
                if is_past_due(&guard.slot, a, now) {
                    due.push((a.id, guard.slot.id));
                }
            }
        }
        due
    }

    /// Close out every pending or in-progress appointment whose slot ended
    /// before `now`: pending → MISSED, INCONSULTATION → COMPLETED.
    ///
    /// Running it again on unchanged data changes nothing.
    pub async fn reconcile_past_due(&self, now: Ms) -> ReconcileReport {
        let due = self.collect_past_due(now).await;
        self.reconcile_collected(due, now).await
    }

    /// Transition each collected `(appointment, slot)` pair independently.
    /// A pair that fails lands in `failed`; the rest still move.
    pub async fn reconcile_collected(&self, due: Vec<(Ulid, Ulid)>, now: Ms) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for (appointment_id, slot_id) in due {
            match self.reconcile_one(appointment_id, slot_id, now).await {
                Ok(Some(updated)) => report.updated.push(updated),
                Ok(None) => debug!(appointment = %appointment_id, "no longer past due, skipped"),
                Err(e) => {
                    warn!(appointment = %appointment_id, "reconciliation failed: {e}");
                    report.failed.push((appointment_id, e));
                }
            }
        }
        metrics::counter!(observability::RECONCILE_RUNS_TOTAL).increment(1);
        metrics::counter!(observability::RECONCILE_FAILED_TOTAL).increment(report.failed.len() as u64);
        report
    }

    /// Re-check under the slot lock, then transition. `Ok(None)` if the
    /// appointment changed since it was collected.
    async fn reconcile_one(
        &self,
        appointment_id: Ulid,
        slot_id: Ulid,
        now: Ms,
    ) -> Result<Option<Appointment>, EngineError> {
        let _permit = self.mutation_permit().await;
        let ss = self.get_slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let mut guard = ss.write().await;
        let Some(current) = guard.appointment(&appointment_id) else {
            return Ok(None);
        };
        if !is_past_due(&guard.slot, current, now) {
            return Ok(None);
        }
        let Some(target) = reconcile_target(current.status) else {
            return Ok(None);
        };
        let event = Event::AppointmentStatusChanged {
            id: appointment_id,
            time_slot_id: slot_id,
            status: target,
            at: transition_instant(current, now),
        };
        self.persist_and_apply(slot_id, &mut guard, &event)
            .await
            .map_err(|e| e.context(format!("reconciling appointment {appointment_id}")))?;
        metrics::counter!(
            observability::RECONCILE_UPDATED_TOTAL,
            "status" => observability::status_label(target)
        )
        .increment(1);
        Ok(guard.appointment(&appointment_id).cloned())
    }
}
