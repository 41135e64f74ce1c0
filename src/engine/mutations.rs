use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::capacity::{validate_minutes, validate_span};
use super::{Engine, EngineError};

fn validate_reason(reason: &str) -> Result<(), EngineError> {
    if reason.trim().is_empty() {
        return Err(EngineError::validation("reason is required"));
    }
    if reason.len() > MAX_REASON_LEN {
        return Err(EngineError::LimitExceeded("reason too long"));
    }
    Ok(())
}

impl Engine {
    // ── Appointment types ────────────────────────────────────

    /// True if another non-retired type already uses this name
    /// (case-insensitive).
    pub fn verify_duplicated_appointment_type_name(&self, appointment_type: &AppointmentType) -> bool {
        let name = appointment_type.name.trim();
        self.appointment_types.iter().any(|e| {
            let t = e.value();
            t.id != appointment_type.id && !t.is_retired() && t.name.trim().eq_ignore_ascii_case(name)
        })
    }

    /// Create or update an appointment type.
    pub async fn save_appointment_type(&self, appointment_type: AppointmentType) -> Result<(), EngineError> {
        if appointment_type.name.trim().is_empty() {
            return Err(EngineError::validation("appointment type name is required"));
        }
        if appointment_type.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("appointment type name too long"));
        }
        if let Some(ref d) = appointment_type.description
            && d.len() > MAX_REASON_LEN
        {
            return Err(EngineError::LimitExceeded("description too long"));
        }
        validate_minutes(appointment_type.duration_minutes)?;
        let _permit = self.mutation_permit().await;
        if self.verify_duplicated_appointment_type_name(&appointment_type) {
            return Err(EngineError::validation(format!(
                "appointment type name '{}' is already in use",
                appointment_type.name.trim()
            )));
        }
        self.persist_catalog(&Event::AppointmentTypeSaved { appointment_type })
            .await
    }

    pub async fn retire_appointment_type(&self, id: Ulid, reason: String) -> Result<(), EngineError> {
        validate_reason(&reason)?;
        let _permit = self.mutation_permit().await;
        if !self.appointment_types.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_catalog(&Event::AppointmentTypeRetired { id, reason })
            .await
    }

    pub async fn unretire_appointment_type(&self, id: Ulid) -> Result<(), EngineError> {
        let _permit = self.mutation_permit().await;
        let Some(t) = self.appointment_types.get(&id).map(|e| e.value().clone()) else {
            return Err(EngineError::NotFound(id));
        };
        if self.verify_duplicated_appointment_type_name(&t) {
            return Err(EngineError::validation(format!(
                "appointment type name '{}' is already in use",
                t.name.trim()
            )));
        }
        self.persist_catalog(&Event::AppointmentTypeUnretired { id })
            .await
    }

    /// Hard delete. Refused while any block offers the type or any
    /// appointment references it.
    pub async fn purge_appointment_type(&self, id: Ulid) -> Result<(), EngineError> {
        let _permit = self.mutation_permit().await;
        if !self.appointment_types.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if self.blocks.iter().any(|b| b.offers(&id)) {
            return Err(EngineError::validation("appointment type is offered by a block"));
        }
        for ss in self.slot_handles() {
            let guard = ss.read().await;
            if guard.appointments.iter().any(|a| a.appointment_type_id == id) {
                return Err(EngineError::validation("appointment type is referenced by appointments"));
            }
        }
        self.persist_catalog(&Event::AppointmentTypePurged { id })
            .await
    }

    // ── Appointment blocks ───────────────────────────────────

    /// Create or update a block. Overlaps are not checked here; callers that
    /// want to enforce them ask `find_overlaps` first.
    pub async fn save_appointment_block(&self, block: AppointmentBlock) -> Result<(), EngineError> {
        validate_span(&block.span)?;
        if block.appointment_types.is_empty() {
            return Err(EngineError::validation("block must offer at least one appointment type"));
        }
        if block.appointment_types.len() > MAX_APPOINTMENT_TYPES_PER_BLOCK {
            return Err(EngineError::LimitExceeded("too many appointment types on block"));
        }
        if let Some(missing) = block
            .appointment_types
            .iter()
            .find(|t| !self.appointment_types.contains_key(t))
        {
            return Err(EngineError::NotFound(*missing));
        }
        if let Some(ref r) = block.void_reason {
            validate_reason(r)?;
        }
        let _permit = self.mutation_permit().await;
        let _block = self.lock_block(block.id).await;
        for slot in self.get_time_slots_in_block(block.id).await {
            if !block.span.contains_span(&slot.span) {
                return Err(EngineError::validation(format!(
                    "time slot {} would fall outside the block",
                    slot.id
                )));
            }
        }
        self.persist_catalog(&Event::BlockSaved { block }).await
    }

    /// Void a block and every one of its slots. Appointments are untouched.
    pub async fn void_appointment_block(&self, id: Ulid, reason: String) -> Result<(), EngineError> {
        validate_reason(&reason)?;
        let _permit = self.mutation_permit().await;
        let _block = self.lock_block(id).await;
        if !self.blocks.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_catalog(&Event::BlockVoided {
            id,
            reason: reason.clone(),
        })
        .await?;
        for slot_id in self.slot_ids_in_block(&id) {
            let Some(ss) = self.get_slot(&slot_id) else {
                continue;
            };
            let mut guard = ss.write().await;
            if guard.slot.is_voided() {
                continue;
            }
            let event = Event::TimeSlotVoided {
                id: slot_id,
                reason: reason.clone(),
            };
            self.persist_and_apply(slot_id, &mut guard, &event)
                .await
                .map_err(|e| e.context(format!("voiding time slot {slot_id} of block {id}")))?;
        }
        Ok(())
    }

    /// Restore a voided block. Its slots stay voided until restored one by one.
    pub async fn unvoid_appointment_block(&self, id: Ulid) -> Result<(), EngineError> {
        let _permit = self.mutation_permit().await;
        let _block = self.lock_block(id).await;
        if !self.blocks.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_catalog(&Event::BlockUnvoided { id }).await
    }

    /// Hard delete a block and its slots. Refused while any slot still holds
    /// appointments (voided ones included).
    pub async fn purge_appointment_block(&self, id: Ulid) -> Result<(), EngineError> {
        let _permit = self.mutation_permit().await;
        let _block = self.lock_block(id).await;
        if !self.blocks.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }

        // Acquire write locks in sorted order to prevent deadlocks.
        let mut slot_ids = self.slot_ids_in_block(&id);
        slot_ids.sort();
        let mut guards = Vec::with_capacity(slot_ids.len());
        for slot_id in &slot_ids {
            let Some(ss) = self.get_slot(slot_id) else {
                continue;
            };
            let guard = ss.write_owned().await;
            if !guard.appointments.is_empty() {
                return Err(EngineError::validation(format!(
                    "time slot {slot_id} still has appointments"
                )));
            }
            guards.push(guard);
        }

        for guard in &guards {
            self.persist_catalog(&Event::TimeSlotPurged {
                id: guard.slot.id,
                block_id: id,
            })
            .await?;
        }
        drop(guards);
        self.persist_catalog(&Event::BlockPurged { id }).await?;
        self.block_locks.remove(&id);
        metrics::gauge!(crate::observability::TIME_SLOTS_ACTIVE).set(self.slots.len() as f64);
        Ok(())
    }

    // ── Time slots ───────────────────────────────────────────

    pub async fn create_time_slot(&self, id: Ulid, block_id: Ulid, span: Span) -> Result<(), EngineError> {
        validate_span(&span)?;
        if span.duration_minutes() < 1 {
            return Err(EngineError::validation("time slot must last at least one minute"));
        }
        let _permit = self.mutation_permit().await;
        // Held through the persist so the block cannot be voided or purged
        // between the check below and the new slot landing.
        let _block = self.lock_block(block_id).await;
        if self.slots.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let block = self
            .blocks
            .get(&block_id)
            .map(|b| b.value().clone())
            .ok_or(EngineError::NotFound(block_id))?;
        if block.is_voided() {
            return Err(EngineError::validation("cannot add a time slot to a voided block"));
        }
        if !block.span.contains_span(&span) {
            return Err(EngineError::validation("time slot must lie within its block"));
        }
        if self.slot_ids_in_block(&block_id).len() >= MAX_SLOTS_PER_BLOCK {
            return Err(EngineError::LimitExceeded("too many time slots in block"));
        }

        let slot = TimeSlot {
            id,
            block_id,
            span,
            void_reason: None,
        };
        self.persist_catalog(&Event::TimeSlotCreated { slot }).await?;
        metrics::gauge!(crate::observability::TIME_SLOTS_ACTIVE).set(self.slots.len() as f64);
        Ok(())
    }

    /// Carve the block into consecutive slots of `slot_minutes`. A trailing
    /// remainder shorter than one slot is left unallocated.
    pub async fn create_time_slots_for_block(
        &self,
        block_id: Ulid,
        slot_minutes: i64,
    ) -> Result<Vec<Ulid>, EngineError> {
        validate_minutes(Some(slot_minutes))?;
        let block = self
            .blocks
            .get(&block_id)
            .map(|b| b.value().clone())
            .ok_or(EngineError::NotFound(block_id))?;
        let step = slot_minutes * MINUTE_MS;
        let mut created = Vec::new();
        let mut start = block.span.start;
        while start + step <= block.span.end {
            let id = Ulid::new();
            self.create_time_slot(id, block_id, Span::new(start, start + step))
                .await?;
            created.push(id);
            start += step;
        }
        Ok(created)
    }

    /// Void a slot. Its appointments keep their own void state.
    pub async fn void_time_slot(&self, id: Ulid, reason: String) -> Result<(), EngineError> {
        validate_reason(&reason)?;
        let _permit = self.mutation_permit().await;
        let ss = self.get_slot(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = ss.write().await;
        let event = Event::TimeSlotVoided { id, reason };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    pub async fn unvoid_time_slot(&self, id: Ulid) -> Result<(), EngineError> {
        let _permit = self.mutation_permit().await;
        let ss = self.get_slot(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = ss.write().await;
        let event = Event::TimeSlotUnvoided { id };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    /// Hard delete. Refused while appointments reference the slot.
    pub async fn purge_time_slot(&self, id: Ulid) -> Result<(), EngineError> {
        let _permit = self.mutation_permit().await;
        let ss = self.get_slot(&id).ok_or(EngineError::NotFound(id))?;
        let guard = ss.write().await;
        if !guard.appointments.is_empty() {
            return Err(EngineError::validation(format!(
                "time slot {id} still has appointments"
            )));
        }
        let block_id = guard.slot.block_id;
        self.persist_catalog(&Event::TimeSlotPurged { id, block_id })
            .await?;
        drop(guard);
        metrics::gauge!(crate::observability::TIME_SLOTS_ACTIVE).set(self.slots.len() as f64);
        Ok(())
    }

    // ── Appointments ─────────────────────────────────────────

    pub async fn void_appointment(&self, id: Ulid, reason: String) -> Result<(), EngineError> {
        validate_reason(&reason)?;
        let _permit = self.mutation_permit().await;
        let (slot_id, mut guard) = self.resolve_appointment_write(&id).await?;
        let event = Event::AppointmentVoided {
            id,
            time_slot_id: slot_id,
            reason,
        };
        self.persist_and_apply(slot_id, &mut guard, &event).await
    }

    pub async fn unvoid_appointment(&self, id: Ulid) -> Result<(), EngineError> {
        let _permit = self.mutation_permit().await;
        let (slot_id, mut guard) = self.resolve_appointment_write(&id).await?;
        let event = Event::AppointmentUnvoided {
            id,
            time_slot_id: slot_id,
        };
        self.persist_and_apply(slot_id, &mut guard, &event).await
    }

    /// Hard delete an appointment together with its status history.
    pub async fn purge_appointment(&self, id: Ulid) -> Result<(), EngineError> {
        let _permit = self.mutation_permit().await;
        let (slot_id, mut guard) = self.resolve_appointment_write(&id).await?;
        let event = Event::AppointmentPurged {
            id,
            time_slot_id: slot_id,
        };
        self.persist_and_apply(slot_id, &mut guard, &event).await
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate current state.
    ///
    /// Mutations are held off from the snapshot until the new log is in
    /// place, so nothing acknowledged can land in the file being replaced.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.compaction_gate.write().await;
        let mut events: Vec<Event> = self
            .appointment_types
            .iter()
            .map(|e| Event::AppointmentTypeSaved {
                appointment_type: e.value().clone(),
            })
            .collect();
        events.extend(self.blocks.iter().map(|e| Event::BlockSaved {
            block: e.value().clone(),
        }));

        let mut block_ids: Vec<Ulid> = self.block_slots.iter().map(|e| *e.key()).collect();
        block_ids.sort();
        for block_id in block_ids {
            for slot_id in self.slot_ids_in_block(&block_id) {
                let Some(ss) = self.get_slot(&slot_id) else {
                    continue;
                };
                let guard = ss.read().await;
                events.push(Event::TimeSlotCreated {
                    slot: guard.slot.clone(),
                });
                events.extend(guard.appointments.iter().map(|a| Event::AppointmentBooked {
                    appointment: a.clone(),
                }));
            }
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.wal_tx
            .send(super::WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .wal_tx
            .send(super::WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
