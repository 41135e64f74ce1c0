use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Wall-clock unix millis.
pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::validation("end must be after start"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

pub(crate) fn validate_minutes(minutes: Option<i64>) -> Result<(), EngineError> {
    match minutes {
        Some(m) if m <= 0 => Err(EngineError::validation("duration must be positive")),
        Some(m) if m > crate::limits::MAX_APPOINTMENT_MINUTES => {
            Err(EngineError::LimitExceeded("duration too long"))
        }
        _ => Ok(()),
    }
}

/// Minutes an appointment takes out of its slot: its own duration, else the
/// type default. `Err` carries the warning; the caller counts it as zero.
pub fn estimated_minutes<F>(
    appointment_id: Ulid,
    appointment_type_id: Ulid,
    own_minutes: Option<i64>,
    type_minutes: F,
) -> Result<i64, DataQualityWarning>
where
    F: Fn(&Ulid) -> Option<i64>,
{
    own_minutes
        .or_else(|| type_minutes(&appointment_type_id))
        .ok_or(DataQualityWarning::MissingDuration {
            appointment_id,
            appointment_type_id,
        })
}

/// Slot length minus the minutes held by its active appointments.
///
/// Appointments referencing other slots, voided appointments and CANCELLED or
/// MISSED appointments are ignored.
pub fn remaining_minutes<F>(slot: &TimeSlot, appointments: &[Appointment], type_minutes: F) -> SlotOccupancy
where
    F: Fn(&Ulid) -> Option<i64>,
{
    let mut allocated = 0;
    let mut warnings = Vec::new();
    for a in appointments
        .iter()
        .filter(|a| a.time_slot_id == slot.id && a.is_active())
    {
        match estimated_minutes(a.id, a.appointment_type_id, a.duration_minutes, &type_minutes) {
            Ok(m) => allocated += m,
            Err(w) => warnings.push(w),
        }
    }
    let slot_minutes = slot.duration_minutes();
    SlotOccupancy {
        time_slot_id: slot.id,
        slot_minutes,
        allocated_minutes: allocated,
        remaining_minutes: slot_minutes - allocated,
        warnings,
    }
}

/// Veto an unacknowledged overflow. An explicit overbook always passes.
pub fn check_capacity(
    occupancy: &SlotOccupancy,
    requested_minutes: i64,
    allow_overbook: bool,
) -> Result<(), EngineError> {
    if !allow_overbook && requested_minutes > occupancy.remaining_minutes {
        return Err(EngineError::TimeSlotFull {
            time_slot_id: occupancy.time_slot_id,
            requested_minutes,
            remaining_minutes: occupancy.remaining_minutes,
        });
    }
    Ok(())
}
