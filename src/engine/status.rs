use crate::model::*;

/// Where reconciliation moves an appointment whose slot has ended.
/// `None` for terminal statuses, which are left alone.
pub fn reconcile_target(status: AppointmentStatus) -> Option<AppointmentStatus> {
    match status {
        AppointmentStatus::Scheduled
        | AppointmentStatus::Rescheduled
        | AppointmentStatus::Waiting
        | AppointmentStatus::WalkIn => Some(AppointmentStatus::Missed),
        AppointmentStatus::InConsultation => Some(AppointmentStatus::Completed),
        AppointmentStatus::Completed | AppointmentStatus::Cancelled | AppointmentStatus::Missed => None,
    }
}

/// Whether the appointment is due for reconciliation at `now`.
pub fn is_past_due(slot: &TimeSlot, appointment: &Appointment, now: Ms) -> bool {
    !appointment.is_voided() && slot.span.end < now && reconcile_target(appointment.status).is_some()
}

/// The instant a transition requested at `now` is recorded at: never before
/// the start or end of the latest history entry.
pub fn transition_instant(appointment: &Appointment, now: Ms) -> Ms {
    match appointment.history.last() {
        Some(last) => now.max(last.start).max(last.end.unwrap_or(last.start)),
        None => now,
    }
}

/// First history entry of a freshly booked appointment.
pub fn initial_history(now: Ms) -> Vec<StatusHistoryEntry> {
    vec![StatusHistoryEntry {
        status: AppointmentStatus::Scheduled,
        start: now,
        end: None,
    }]
}

/// Close the open entry and append one for `status`. Terminal statuses are
/// closed at the instant they open.
pub fn record_transition(appointment: &mut Appointment, status: AppointmentStatus, at: Ms) {
    let at = transition_instant(appointment, at);
    for entry in appointment.history.iter_mut().filter(|h| h.is_open()) {
        entry.end = Some(at);
    }
    appointment.history.push(StatusHistoryEntry {
        status,
        start: at,
        end: status.is_terminal().then_some(at),
    });
    appointment.status = status;
    debug_assert!(appointment.history_is_well_formed());
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const M: Ms = MINUTE_MS;

    fn booked(at: Ms) -> Appointment {
        Appointment {
            id: Ulid::new(),
            patient_id: Ulid::new(),
            time_slot_id: Ulid::new(),
            visit_id: None,
            appointment_type_id: Ulid::new(),
            duration_minutes: Some(15),
            reason: None,
            status: AppointmentStatus::Scheduled,
            history: initial_history(at),
            void_reason: None,
        }
    }

    fn slot_ending(end: Ms) -> TimeSlot {
        TimeSlot {
            id: Ulid::new(),
            block_id: Ulid::new(),
            span: Span::new(end - 30 * M, end),
            void_reason: None,
        }
    }

    #[test]
    fn reconcile_table() {
        use AppointmentStatus::*;
        let expected = [
            (Scheduled, Some(Missed)),
            (Rescheduled, Some(Missed)),
            (Waiting, Some(Missed)),
            (WalkIn, Some(Missed)),
            (InConsultation, Some(Completed)),
            (Completed, None),
            (Cancelled, None),
            (Missed, None),
        ];
        for (from, to) in expected {
            assert_eq!(reconcile_target(from), to, "{from}");
        }
    }

    #[test]
    fn reconcile_targets_are_fixed_points() {
        for s in AppointmentStatus::ALL {
            if let Some(target) = reconcile_target(s) {
                assert_eq!(reconcile_target(target), None);
            }
        }
    }

    #[test]
    fn past_due_requires_strictly_ended_slot() {
        let slot = slot_ending(100 * M);
        let a = booked(0);
        assert!(!is_past_due(&slot, &a, 100 * M));
        assert!(is_past_due(&slot, &a, 100 * M + 1));
    }

    #[test]
    fn voided_appointment_is_never_past_due() {
        let slot = slot_ending(100 * M);
        let mut a = booked(0);
        a.void_reason = Some("error".into());
        assert!(!is_past_due(&slot, &a, 200 * M));
    }

    #[test]
    fn transition_closes_open_entry() {
        let mut a = booked(0);
        record_transition(&mut a, AppointmentStatus::Waiting, 5 * M);
        record_transition(&mut a, AppointmentStatus::InConsultation, 10 * M);

        assert_eq!(a.status, AppointmentStatus::InConsultation);
        assert_eq!(a.history.len(), 3);
        assert_eq!(a.history[0].end, Some(5 * M));
        assert_eq!(a.history[1].end, Some(10 * M));
        assert!(a.history[2].is_open());
        assert!(a.history_is_well_formed());
    }

    #[test]
    fn terminal_entry_closed_on_entry() {
        let mut a = booked(0);
        record_transition(&mut a, AppointmentStatus::Completed, 30 * M);
        let last = a.history.last().unwrap();
        assert_eq!(last.start, 30 * M);
        assert_eq!(last.end, Some(30 * M));
        assert!(a.open_entry().is_none());
    }

    #[test]
    fn clock_skew_floored_at_previous_start() {
        let mut a = booked(10 * M);
        record_transition(&mut a, AppointmentStatus::Waiting, 4 * M);
        assert_eq!(a.history[0].end, Some(10 * M));
        assert_eq!(a.history[1].start, 10 * M);
        assert!(a.history_is_well_formed());
    }

    #[test]
    fn leaving_terminal_state_reopens_timeline() {
        let mut a = booked(0);
        record_transition(&mut a, AppointmentStatus::Cancelled, 5 * M);
        record_transition(&mut a, AppointmentStatus::Scheduled, 3 * M);
        assert_eq!(a.history.len(), 3);
        assert_eq!(a.history[2].start, 5 * M);
        assert!(a.history[2].is_open());
        assert!(a.history_is_well_formed());
    }

    #[test]
    fn same_status_transition_still_recorded() {
        let mut a = booked(0);
        record_transition(&mut a, AppointmentStatus::Scheduled, M);
        assert_eq!(a.history.len(), 2);
        assert!(a.history_is_well_formed());
    }
}
