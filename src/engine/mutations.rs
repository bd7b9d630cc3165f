use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use dashmap::mapref::entry::Entry;
use tokio::sync::{RwLock, oneshot};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_batch_disjoint, check_no_conflict, checked_span};
use super::{Engine, EngineError, WalCommand, apply_to_room};

/// A lesson as submitted, before any validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LessonRequest {
    pub id: Ulid,
    pub room_id: Ulid,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub group_name: String,
    pub teacher_name: String,
    pub subject_name: String,
}

impl LessonRequest {
    /// Checks that need no ledger state: time ordering and field widths.
    fn into_lesson(self) -> Result<Lesson, EngineError> {
        let span = checked_span(self.start, self.end)?;
        if self.group_name.chars().count() > MAX_GROUP_NAME_LEN {
            return Err(EngineError::LimitExceeded("group name too long"));
        }
        if self.teacher_name.chars().count() > MAX_TEACHER_NAME_LEN {
            return Err(EngineError::LimitExceeded("teacher name too long"));
        }
        if self.subject_name.chars().count() > MAX_SUBJECT_NAME_LEN {
            return Err(EngineError::LimitExceeded("subject name too long"));
        }
        Ok(Lesson {
            id: self.id,
            room_id: self.room_id,
            date: self.date,
            span,
            group_name: self.group_name,
            teacher_name: self.teacher_name,
            subject_name: self.subject_name,
        })
    }
}

fn validate_room(room: &Room) -> Result<(), EngineError> {
    if room.number.trim().is_empty() {
        return Err(EngineError::InvalidRoom("room number is required"));
    }
    if room.building.trim().is_empty() {
        return Err(EngineError::InvalidRoom("building is required"));
    }
    if room.number.chars().count() > MAX_ROOM_NUMBER_LEN {
        return Err(EngineError::LimitExceeded("room number too long"));
    }
    if room.building.chars().count() > MAX_BUILDING_LEN {
        return Err(EngineError::LimitExceeded("building code too long"));
    }
    if room.capacity == 0 {
        return Err(EngineError::InvalidRoom("capacity must be positive"));
    }
    if !(room.area.is_finite() && room.area > 0.0) {
        return Err(EngineError::InvalidRoom("area must be positive"));
    }
    Ok(())
}

impl Engine {
    pub async fn create_room(&self, room: Room) -> Result<(), EngineError> {
        validate_room(&room)?;
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }

        let _gate = self.commit_gate.read().await;
        let id = room.id;
        let event = Event::RoomCreated { room: room.clone() };
        // Claim the id before the WAL await. The room stays write-locked until
        // its record is durable, so readers never observe an uncommitted room.
        let rs = Arc::new(RwLock::new(RoomState::new(room)));
        let mut guard = rs.clone().write_owned().await;
        match self.rooms.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(rs);
            }
        }

        if let Err(e) = self.wal_append(&event).await {
            guard.deleted = true;
            self.rooms.remove(&id);
            return Err(e);
        }
        info!(room = %id, "room created");
        Ok(())
    }

    /// Replace every attribute of an existing room. Lessons are untouched.
    pub async fn update_room(&self, room: Room) -> Result<(), EngineError> {
        validate_room(&room)?;
        let _gate = self.commit_gate.read().await;
        let rs = self.get_room(&room.id).ok_or(EngineError::NotFound(room.id))?;
        let mut guard = rs.write().await;
        if guard.deleted {
            return Err(EngineError::NotFound(room.id));
        }
        let event = Event::RoomUpdated { room };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Delete a room that has no lessons. Rooms with lessons are never cascaded.
    pub async fn delete_room(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let rs = self.get_room(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        if guard.deleted {
            return Err(EngineError::NotFound(id));
        }
        let lessons = guard.lesson_count();
        if lessons > 0 {
            return Err(EngineError::ReferentialBlock { room: id, lessons });
        }

        self.wal_append(&Event::RoomDeleted { id }).await?;
        guard.deleted = true;
        self.rooms.remove(&id);
        info!(room = %id, "room deleted");
        Ok(())
    }

    /// proposed → validated → committed, or rejected with nothing persisted.
    /// The room's write lock spans the conflict check and the commit.
    pub async fn book_lesson(&self, request: LessonRequest) -> Result<Ulid, EngineError> {
        let lesson = request.into_lesson()?;
        let room_id = lesson.room_id;
        if self.lesson_to_room.contains_key(&lesson.id) {
            return Err(EngineError::AlreadyExists(lesson.id));
        }
        let _gate = self.commit_gate.read().await;
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let mut guard = rs.write().await;
        if guard.deleted {
            return Err(EngineError::NotFound(room_id));
        }
        if guard.lesson_count() >= MAX_LESSONS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many lessons in room"));
        }
        if let Err(e) = check_no_conflict(&guard, lesson.date, &lesson.span) {
            metrics::counter!(crate::observability::CONFLICTS_REJECTED_TOTAL).increment(1);
            debug!(room = %room_id, date = %lesson.date, "lesson rejected: {e}");
            return Err(e);
        }

        let id = lesson.id;
        let event = Event::LessonsBooked { lessons: vec![lesson] };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::LESSONS_BOOKED_TOTAL).increment(1);
        Ok(id)
    }

    /// Book several lessons, possibly in different rooms. All or nothing:
    /// a conflict with the ledger or within the batch rejects every lesson,
    /// and the batch is one WAL record.
    pub async fn book_lessons(&self, requests: Vec<LessonRequest>) -> Result<Vec<Ulid>, EngineError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        if requests.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let lessons = requests
            .into_iter()
            .map(LessonRequest::into_lesson)
            .collect::<Result<Vec<_>, _>>()?;
        for (i, lesson) in lessons.iter().enumerate() {
            if self.lesson_to_room.contains_key(&lesson.id)
                || lessons[..i].iter().any(|l| l.id == lesson.id)
            {
                return Err(EngineError::AlreadyExists(lesson.id));
            }
        }

        // Lock rooms in id order so concurrent batches cannot deadlock.
        let mut room_ids: Vec<Ulid> = lessons.iter().map(|l| l.room_id).collect();
        room_ids.sort();
        room_ids.dedup();

        let _gate = self.commit_gate.read().await;
        let mut guards = Vec::with_capacity(room_ids.len());
        for room_id in &room_ids {
            let rs = self.get_room(room_id).ok_or(EngineError::NotFound(*room_id))?;
            let guard = rs.write_owned().await;
            if guard.deleted {
                return Err(EngineError::NotFound(*room_id));
            }
            guards.push(guard);
        }

        {
            let mut by_room: HashMap<Ulid, Vec<&Lesson>> = HashMap::new();
            for lesson in &lessons {
                by_room.entry(lesson.room_id).or_default().push(lesson);
            }
            for guard in &guards {
                let Some(batch) = by_room.get(&guard.room.id) else {
                    continue;
                };
                if guard.lesson_count() + batch.len() > MAX_LESSONS_PER_ROOM {
                    return Err(EngineError::LimitExceeded("too many lessons in room"));
                }
                let ledger_check = batch
                    .iter()
                    .try_for_each(|l| check_no_conflict(guard, l.date, &l.span));
                if let Err(e) = ledger_check.and_then(|()| check_batch_disjoint(batch)) {
                    metrics::counter!(crate::observability::CONFLICTS_REJECTED_TOTAL).increment(1);
                    debug!(room = %guard.room.id, "batch rejected: {e}");
                    return Err(e);
                }
            }
        }

        let ids: Vec<Ulid> = lessons.iter().map(|l| l.id).collect();
        let event = Event::LessonsBooked { lessons };
        self.wal_append(&event).await?;
        for guard in &mut guards {
            apply_to_room(guard, &event, &self.lesson_to_room);
        }
        metrics::counter!(crate::observability::LESSONS_BOOKED_TOTAL).increment(ids.len() as u64);
        Ok(ids)
    }

    /// Returns the room the lesson was booked in.
    pub async fn cancel_lesson(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.commit_gate.read().await;
        let (room_id, mut guard) = self.resolve_lesson_write(&id).await?;
        // A concurrent cancel may have won the lock first.
        if self.room_for_lesson(&id) != Some(room_id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::LessonCancelled { id, room_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(room_id)
    }

    /// Rewrite the WAL as the minimal event set recreating the current ledger.
    /// Commits wait while it runs; none can land in the old log after the snapshot.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();
        for rs in self.room_handles() {
            let guard = rs.read().await;
            if guard.deleted {
                continue;
            }
            events.push(Event::RoomCreated {
                room: guard.room.clone(),
            });
            let lessons: Vec<Lesson> = guard.all_lessons().cloned().collect();
            if !lessons.is_empty() {
                events.push(Event::LessonsBooked { lessons });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::PersistenceFailure("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::PersistenceFailure("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::PersistenceFailure(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
