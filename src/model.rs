use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 86_400_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Whole minutes covered by the span (partial minutes are dropped).
    pub fn duration_minutes(&self) -> i64 {
        self.duration_ms() / MINUTE_MS
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Appointment status ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Scheduled,
    Rescheduled,
    Waiting,
    WalkIn,
    InConsultation,
    Completed,
    Cancelled,
    Missed,
}

impl AppointmentStatus {
    pub const ALL: [AppointmentStatus; 8] = [
        AppointmentStatus::Scheduled,
        AppointmentStatus::Rescheduled,
        AppointmentStatus::Waiting,
        AppointmentStatus::WalkIn,
        AppointmentStatus::InConsultation,
        AppointmentStatus::Completed,
        AppointmentStatus::Cancelled,
        AppointmentStatus::Missed,
    ];

    /// Booked or checked in, but the consultation has not started.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            AppointmentStatus::Scheduled
                | AppointmentStatus::Rescheduled
                | AppointmentStatus::Waiting
                | AppointmentStatus::WalkIn
        )
    }

    pub fn is_in_progress(self) -> bool {
        self == AppointmentStatus::InConsultation
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AppointmentStatus::Completed | AppointmentStatus::Cancelled | AppointmentStatus::Missed
        )
    }

    /// Whether the status still occupies time in its slot.
    pub fn occupies_slot(self) -> bool {
        !matches!(self, AppointmentStatus::Cancelled | AppointmentStatus::Missed)
    }

    pub fn label(self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "SCHEDULED",
            AppointmentStatus::Rescheduled => "RESCHEDULED",
            AppointmentStatus::Waiting => "WAITING",
            AppointmentStatus::WalkIn => "WALKIN",
            AppointmentStatus::InConsultation => "INCONSULTATION",
            AppointmentStatus::Completed => "COMPLETED",
            AppointmentStatus::Cancelled => "CANCELLED",
            AppointmentStatus::Missed => "MISSED",
        }
    }
}

impl std::fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One entry of an appointment's status timeline. `end` is `None` while the
/// status is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub status: AppointmentStatus,
    pub start: Ms,
    pub end: Option<Ms>,
}

impl StatusHistoryEntry {
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }
}

// ── Reference data ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentType {
    pub id: Ulid,
    pub name: String,
    /// Default minutes booked for an appointment of this type.
    pub duration_minutes: Option<i64>,
    pub description: Option<String>,
    pub retire_reason: Option<String>,
}

impl AppointmentType {
    pub fn is_retired(&self) -> bool {
        self.retire_reason.is_some()
    }
}

// ── Blocks and slots ─────────────────────────────────────────────

/// Who owns the capacity of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockOwner {
    Provider(Ulid),
    /// Shared, location-level capacity.
    LocationOnly,
}

impl BlockOwner {
    pub fn provider(&self) -> Option<Ulid> {
        match self {
            BlockOwner::Provider(id) => Some(*id),
            BlockOwner::LocationOnly => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentBlock {
    pub id: Ulid,
    pub span: Span,
    pub location_id: Ulid,
    pub owner: BlockOwner,
    /// Appointment types that may be booked into this block.
    pub appointment_types: Vec<Ulid>,
    pub void_reason: Option<String>,
}

impl AppointmentBlock {
    pub fn is_voided(&self) -> bool {
        self.void_reason.is_some()
    }

    pub fn offers(&self, appointment_type_id: &Ulid) -> bool {
        self.appointment_types.contains(appointment_type_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub id: Ulid,
    pub block_id: Ulid,
    pub span: Span,
    pub void_reason: Option<String>,
}

impl TimeSlot {
    pub fn is_voided(&self) -> bool {
        self.void_reason.is_some()
    }

    pub fn duration_minutes(&self) -> i64 {
        self.span.duration_minutes()
    }
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub patient_id: Ulid,
    pub time_slot_id: Ulid,
    pub visit_id: Option<Ulid>,
    pub appointment_type_id: Ulid,
    /// Explicit booking length; falls back to the type's default when `None`.
    pub duration_minutes: Option<i64>,
    pub reason: Option<String>,
    /// Denormalized copy of the status of the last history entry.
    pub status: AppointmentStatus,
    /// Ordered by `start`; at most one entry is open.
    pub history: Vec<StatusHistoryEntry>,
    pub void_reason: Option<String>,
}

impl Appointment {
    pub fn is_voided(&self) -> bool {
        self.void_reason.is_some()
    }

    /// Not voided and not CANCELLED or MISSED.
    pub fn is_active(&self) -> bool {
        !self.is_voided() && self.status.occupies_slot()
    }

    pub fn open_entry(&self) -> Option<&StatusHistoryEntry> {
        self.history.iter().rev().find(|h| h.is_open())
    }

    /// Start of the current status. Falls back to the last (closed) entry
    /// for terminal appointments.
    pub fn current_status_start(&self) -> Option<Ms> {
        self.open_entry().or(self.history.last()).map(|h| h.start)
    }

    /// True if the timeline is ordered, non-overlapping and has at most one
    /// open entry, which must be the last one.
    pub fn history_is_well_formed(&self) -> bool {
        let open = self.history.iter().filter(|h| h.is_open()).count();
        if open > 1 {
            return false;
        }
        if open == 1 && !self.history.last().is_some_and(|h| h.is_open()) {
            return false;
        }
        for entry in &self.history {
            if let Some(end) = entry.end
                && end < entry.start
            {
                return false;
            }
        }
        self.history.windows(2).all(|w| match w[0].end {
            Some(end) => w[0].start <= w[1].start && end <= w[1].start,
            None => false,
        })
    }
}

/// A booking request. The caller supplies the identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAppointment {
    pub id: Ulid,
    pub patient_id: Ulid,
    pub time_slot_id: Ulid,
    pub visit_id: Option<Ulid>,
    pub appointment_type_id: Ulid,
    pub duration_minutes: Option<i64>,
    pub reason: Option<String>,
}

/// A time slot plus every appointment that references it.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub slot: TimeSlot,
    /// Ordered by booking (insertion) order.
    pub appointments: Vec<Appointment>,
}

impl SlotState {
    pub fn new(slot: TimeSlot) -> Self {
        Self {
            slot,
            appointments: Vec::new(),
        }
    }

    pub fn insert_appointment(&mut self, appointment: Appointment) {
        match self.appointments.iter_mut().find(|a| a.id == appointment.id) {
            Some(existing) => *existing = appointment,
            None => self.appointments.push(appointment),
        }
    }

    pub fn remove_appointment(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    pub fn appointment(&self, id: &Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == *id)
    }

    pub fn appointment_mut(&mut self, id: &Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == *id)
    }

    pub fn active_appointments(&self) -> impl Iterator<Item = &Appointment> {
        self.appointments.iter().filter(|a| a.is_active())
    }
}

/// Flat event records. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AppointmentTypeSaved {
        appointment_type: AppointmentType,
    },
    AppointmentTypeRetired {
        id: Ulid,
        reason: String,
    },
    AppointmentTypeUnretired {
        id: Ulid,
    },
    AppointmentTypePurged {
        id: Ulid,
    },
    BlockSaved {
        block: AppointmentBlock,
    },
    BlockVoided {
        id: Ulid,
        reason: String,
    },
    BlockUnvoided {
        id: Ulid,
    },
    BlockPurged {
        id: Ulid,
    },
    TimeSlotCreated {
        slot: TimeSlot,
    },
    TimeSlotVoided {
        id: Ulid,
        reason: String,
    },
    TimeSlotUnvoided {
        id: Ulid,
    },
    TimeSlotPurged {
        id: Ulid,
        block_id: Ulid,
    },
    AppointmentBooked {
        appointment: Appointment,
    },
    AppointmentStatusChanged {
        id: Ulid,
        time_slot_id: Ulid,
        status: AppointmentStatus,
        at: Ms,
    },
    AppointmentVoided {
        id: Ulid,
        time_slot_id: Ulid,
        reason: String,
    },
    AppointmentUnvoided {
        id: Ulid,
        time_slot_id: Ulid,
    },
    AppointmentPurged {
        id: Ulid,
        time_slot_id: Ulid,
    },
}

impl Event {
    /// The time slot whose lock guards this event, if any.
    pub fn time_slot_id(&self) -> Option<Ulid> {
        match self {
            Event::TimeSlotVoided { id, .. } | Event::TimeSlotUnvoided { id } => Some(*id),
            Event::AppointmentBooked { appointment } => Some(appointment.time_slot_id),
            Event::AppointmentStatusChanged { time_slot_id, .. }
            | Event::AppointmentVoided { time_slot_id, .. }
            | Event::AppointmentUnvoided { time_slot_id, .. }
            | Event::AppointmentPurged { time_slot_id, .. } => Some(*time_slot_id),
            Event::AppointmentTypeSaved { .. }
            | Event::AppointmentTypeRetired { .. }
            | Event::AppointmentTypeUnretired { .. }
            | Event::AppointmentTypePurged { .. }
            | Event::BlockSaved { .. }
            | Event::BlockVoided { .. }
            | Event::BlockUnvoided { .. }
            | Event::BlockPurged { .. }
            | Event::TimeSlotCreated { .. }
            | Event::TimeSlotPurged { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// Non-fatal data problem found while computing occupancy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DataQualityWarning {
    /// Neither the appointment nor its type carries a duration; counted as zero.
    MissingDuration {
        appointment_id: Ulid,
        appointment_type_id: Ulid,
    },
}

impl std::fmt::Display for DataQualityWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataQualityWarning::MissingDuration {
                appointment_id,
                appointment_type_id,
            } => write!(
                f,
                "appointment {appointment_id} has no duration and type {appointment_type_id} has no default; counted as 0 minutes"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotOccupancy {
    pub time_slot_id: Ulid,
    pub slot_minutes: i64,
    pub allocated_minutes: i64,
    /// Negative when the slot is overbooked.
    pub remaining_minutes: i64,
    pub warnings: Vec<DataQualityWarning>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledTimeSlot {
    pub slot: TimeSlot,
    /// Active appointments only.
    pub appointments: Vec<Appointment>,
    pub unallocated_minutes: i64,
}

/// Read-only occupancy view of one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledAppointmentBlock {
    pub block: AppointmentBlock,
    pub slots: Vec<ScheduledTimeSlot>,
}

impl ScheduledAppointmentBlock {
    pub fn remaining_minutes(&self) -> i64 {
        self.slots.iter().map(|s| s.unallocated_minutes).sum()
    }

    pub fn appointment_count(&self) -> usize {
        self.slots.iter().map(|s| s.appointments.len()).sum()
    }

    pub fn is_occupied(&self) -> bool {
        self.slots.iter().any(|s| !s.appointments.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupBy {
    AppointmentType,
    Provider,
}

/// Filters for slot search. `None` means unconstrained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotConstraints {
    pub appointment_type_id: Ulid,
    pub from: Option<Ms>,
    pub to: Option<Ms>,
    pub provider_id: Option<Ulid>,
    pub location_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockFilter {
    pub from: Option<Ms>,
    pub to: Option<Ms>,
    pub location_id: Option<Ulid>,
    pub provider_id: Option<Ulid>,
    pub appointment_type_id: Option<Ulid>,
}
