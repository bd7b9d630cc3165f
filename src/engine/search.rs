use std::collections::HashSet;

use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::*;

use super::conflict::checked_span;
use super::{Engine, EngineError};

/// Static, time-independent part of a free-room search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomFilter {
    /// Rooms with fewer seats are excluded. 0 means any.
    pub min_capacity: u32,
    /// Exact building code; empty means any.
    pub building: String,
    pub require_projector: bool,
    pub require_computers: bool,
}

impl RoomFilter {
    pub fn matches(&self, room: &Room) -> bool {
        room.capacity >= self.min_capacity
            && (self.building.is_empty() || room.building == self.building)
            && (!self.require_projector || room.equipment.has_projector)
            && (!self.require_computers || room.equipment.has_computers)
    }
}

impl Engine {
    /// Rooms matching `filter` with no lesson overlapping `[start, end)` on `date`,
    /// in catalog order.
    pub async fn find_free(
        &self,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        filter: &RoomFilter,
    ) -> Result<Vec<Room>, EngineError> {
        let window = checked_span(start, end)?;

        // (a) static filter, (b) busy set for the window, in one pass over the rooms.
        let mut candidates = Vec::new();
        let mut busy: HashSet<Ulid> = HashSet::new();
        for rs in self.room_handles() {
            let guard = rs.read().await;
            if guard.deleted {
                continue;
            }
            if guard.overlapping(date, &window).next().is_some() {
                busy.insert(guard.room.id);
            }
            if filter.matches(&guard.room) {
                candidates.push(guard.room.clone());
            }
        }

        // (c) filtered rooms minus the busy set.
        candidates.retain(|room| !busy.contains(&room.id));
        candidates.sort_by(|a, b| a.catalog_key().cmp(&b.catalog_key()));
        Ok(candidates)
    }
}
