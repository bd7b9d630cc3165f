use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// All live rooms in catalog order.
    pub async fn list_rooms(&self) -> Vec<Room> {
        let mut rooms = Vec::with_capacity(self.rooms.len());
        for rs in self.room_handles() {
            let guard = rs.read().await;
            if !guard.deleted {
                rooms.push(guard.room.clone());
            }
        }
        rooms.sort_by(|a, b| a.catalog_key().cmp(&b.catalog_key()));
        rooms
    }

    pub async fn room_info(&self, id: Ulid) -> Result<Room, EngineError> {
        let rs = self.get_room(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        if guard.deleted {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard.room.clone())
    }

    /// Lessons on `date`, optionally for one room, ordered by start time
    /// and then room number.
    pub async fn schedule(
        &self,
        date: NaiveDate,
        room_id: Option<Ulid>,
    ) -> Result<Vec<ScheduledLesson>, EngineError> {
        let handles = match room_id {
            Some(id) => vec![self.get_room(&id).ok_or(EngineError::NotFound(id))?],
            None => self.room_handles(),
        };

        let mut out = Vec::new();
        for rs in handles {
            let guard = rs.read().await;
            if guard.deleted {
                if let Some(id) = room_id {
                    return Err(EngineError::NotFound(id));
                }
                continue;
            }
            out.extend(guard.lessons_on(date).iter().map(|lesson| ScheduledLesson {
                lesson: lesson.clone(),
                room_number: guard.room.number.clone(),
                building: guard.room.building.clone(),
            }));
        }
        out.sort_by(|a, b| {
            a.lesson
                .span
                .start
                .cmp(&b.lesson.span.start)
                .then_with(|| a.room_number.cmp(&b.room_number))
                .then_with(|| a.lesson.id.cmp(&b.lesson.id))
        });
        Ok(out)
    }

    /// Every lesson of one room, by date then start.
    pub async fn room_lessons(&self, room_id: Ulid) -> Result<Vec<Lesson>, EngineError> {
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        if guard.deleted {
            return Err(EngineError::NotFound(room_id));
        }
        Ok(guard.all_lessons().cloned().collect())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn lesson_count(&self) -> usize {
        self.lesson_to_room.len()
    }
}
