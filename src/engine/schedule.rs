use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::*;

use super::capacity::remaining_minutes;

/// The UTC calendar day `[00:00, 24:00)` as a span.
pub fn day_span(date: NaiveDate) -> Span {
    let start = date.and_time(NaiveTime::MIN).and_utc().timestamp_millis();
    Span::new(start, start + DAY_MS)
}

/// Occupancy view of one block: its non-voided slots (ordered by start), each
/// with its active appointments and unallocated minutes.
pub fn build_scheduled_block<F>(
    block: &AppointmentBlock,
    slots: &[TimeSlot],
    appointments: &[Appointment],
    type_minutes: F,
) -> ScheduledAppointmentBlock
where
    F: Fn(&Ulid) -> Option<i64>,
{
    let mut own: Vec<&TimeSlot> = slots
        .iter()
        .filter(|s| s.block_id == block.id && !s.is_voided())
        .collect();
    own.sort_by_key(|s| (s.span.start, s.id));

    let slots = own
        .into_iter()
        .map(|slot| {
            let occupancy = remaining_minutes(slot, appointments, &type_minutes);
            for w in &occupancy.warnings {
                tracing::warn!(time_slot = %slot.id, "{w}");
            }
            ScheduledTimeSlot {
                slot: slot.clone(),
                appointments: appointments
                    .iter()
                    .filter(|a| a.time_slot_id == slot.id && a.is_active())
                    .cloned()
                    .collect(),
                unallocated_minutes: occupancy.remaining_minutes,
            }
        })
        .collect();

    ScheduledAppointmentBlock {
        block: block.clone(),
        slots,
    }
}

/// Non-voided blocks at `location` whose interval touches `day`.
pub fn daily_candidates<'a>(
    location: Ulid,
    day: Span,
    blocks: impl IntoIterator<Item = &'a AppointmentBlock>,
) -> Vec<&'a AppointmentBlock> {
    let mut hits: Vec<&AppointmentBlock> = blocks
        .into_iter()
        .filter(|b| b.location_id == location && !b.is_voided() && b.span.overlaps(&day))
        .collect();
    hits.sort_by_key(|b| (b.span.start, b.id));
    hits
}

/// Occupied schedules at `location` on `date`. Blocks with no active
/// appointment in any slot are left out.
pub fn list_daily_scheduled_blocks<F>(
    location: Ulid,
    date: NaiveDate,
    blocks: &[AppointmentBlock],
    slots: &[TimeSlot],
    appointments: &[Appointment],
    type_minutes: F,
) -> Vec<ScheduledAppointmentBlock>
where
    F: Fn(&Ulid) -> Option<i64>,
{
    daily_candidates(location, day_span(date), blocks)
        .into_iter()
        .map(|b| build_scheduled_block(b, slots, appointments, &type_minutes))
        .filter(|view| view.is_occupied())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: Ms = MINUTE_MS;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    fn block_on(location: Ulid, start: Ms, end: Ms) -> AppointmentBlock {
        AppointmentBlock {
            id: Ulid::new(),
            span: Span::new(start, end),
            location_id: location,
            owner: BlockOwner::LocationOnly,
            appointment_types: vec![],
            void_reason: None,
        }
    }

    fn slot_in(block: &AppointmentBlock, offset_min: Ms, len_min: Ms) -> TimeSlot {
        let start = block.span.start + offset_min * M;
        TimeSlot {
            id: Ulid::new(),
            block_id: block.id,
            span: Span::new(start, start + len_min * M),
            void_reason: None,
        }
    }

    fn appt(slot: &TimeSlot, minutes: i64, status: AppointmentStatus) -> Appointment {
        Appointment {
            id: Ulid::new(),
            patient_id: Ulid::new(),
            time_slot_id: slot.id,
            visit_id: None,
            appointment_type_id: Ulid::new(),
            duration_minutes: Some(minutes),
            reason: None,
            status,
            history: vec![StatusHistoryEntry { status, start: 0, end: None }],
            void_reason: None,
        }
    }

    fn no_types(_: &Ulid) -> Option<i64> {
        None
    }

    #[test]
    fn day_span_is_utc_midnight_to_midnight() {
        let span = day_span(date());
        assert_eq!(span.start, 1_710_460_800_000);
        assert_eq!(span.duration_ms(), DAY_MS);
    }

    #[test]
    fn scheduled_block_filters_slots_and_appointments() {
        let day = day_span(date());
        let block = block_on(Ulid::new(), day.start + 540 * M, day.start + 600 * M);
        let s1 = slot_in(&block, 30, 30);
        let s0 = slot_in(&block, 0, 30);
        let mut voided_slot = slot_in(&block, 0, 60);
        voided_slot.void_reason = Some("provider ill".into());
        let foreign = slot_in(&block_on(block.location_id, day.start, day.start + 60 * M), 0, 30);

        let appts = vec![
            appt(&s0, 10, AppointmentStatus::Scheduled),
            appt(&s0, 10, AppointmentStatus::Cancelled),
            appt(&s1, 40, AppointmentStatus::WalkIn),
            appt(&voided_slot, 10, AppointmentStatus::Scheduled),
        ];
        let slots = vec![s1.clone(), voided_slot, s0.clone(), foreign];
        let view = build_scheduled_block(&block, &slots, &appts, no_types);

        assert_eq!(view.slots.len(), 2);
        assert_eq!(view.slots[0].slot.id, s0.id);
        assert_eq!(view.slots[0].appointments.len(), 1);
        assert_eq!(view.slots[0].unallocated_minutes, 20);
        assert_eq!(view.slots[1].slot.id, s1.id);
        assert_eq!(view.slots[1].unallocated_minutes, -10);
        assert_eq!(view.remaining_minutes(), 10);
        assert_eq!(view.appointment_count(), 2);
    }

    #[test]
    fn daily_listing_omits_unoccupied_blocks() {
        let loc = Ulid::new();
        let day = day_span(date());
        let empty = block_on(loc, day.start + 480 * M, day.start + 540 * M);
        let busy = block_on(loc, day.start + 600 * M, day.start + 720 * M);

        let empty_slot = slot_in(&empty, 0, 60);
        let busy_slot = slot_in(&busy, 0, 120);

        let appts = vec![
            appt(&empty_slot, 10, AppointmentStatus::Cancelled),
            appt(&empty_slot, 10, AppointmentStatus::Missed),
            appt(&busy_slot, 20, AppointmentStatus::Scheduled),
            appt(&busy_slot, 20, AppointmentStatus::Waiting),
            appt(&busy_slot, 20, AppointmentStatus::InConsultation),
        ];
        let blocks = vec![empty, busy.clone()];
        let slots = vec![empty_slot, busy_slot];

        let listed = list_daily_scheduled_blocks(loc, date(), &blocks, &slots, &appts, no_types);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].block.id, busy.id);
        assert_eq!(listed[0].appointment_count(), 3);
        assert_eq!(listed[0].remaining_minutes(), 60);
    }

    #[test]
    fn daily_candidates_by_location_and_day() {
        let loc = Ulid::new();
        let day = day_span(date());
        let today = block_on(loc, day.start + 60 * M, day.start + 120 * M);
        let overnight = block_on(loc, day.start - 60 * M, day.start + 60 * M);
        let tomorrow = block_on(loc, day.end, day.end + 60 * M);
        let elsewhere = block_on(Ulid::new(), day.start + 60 * M, day.start + 120 * M);
        let mut voided = block_on(loc, day.start, day.start + 60 * M);
        voided.void_reason = Some("closed".into());

        let blocks = vec![today.clone(), overnight.clone(), tomorrow, elsewhere, voided];
        let ids: Vec<Ulid> = daily_candidates(loc, day, &blocks).iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![overnight.id, today.id]);
    }
}
