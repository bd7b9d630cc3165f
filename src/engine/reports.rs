use std::collections::HashSet;

use chrono::NaiveDate;

use crate::model::*;

use super::Engine;

/// `count / slots` as a percentage with one decimal, capped at 100.
pub(crate) fn occupancy_rate(lesson_count: usize, slots: u32) -> f64 {
    if slots == 0 {
        return 0.0;
    }
    let pct = lesson_count as f64 / f64::from(slots) * 100.0;
    ((pct * 10.0).round() / 10.0).min(100.0)
}

fn equipment_row(room: &Room) -> RoomEquipment {
    let eq = &room.equipment;
    RoomEquipment {
        room_id: room.id,
        number: room.number.clone(),
        building: room.building.clone(),
        has_projector: eq.has_projector,
        computers_count: if eq.has_computers { eq.computers_count } else { 0 },
        has_board: eq.has_board,
        has_air_conditioner: eq.has_air_conditioner,
    }
}

impl Engine {
    pub async fn occupancy_report(&self) -> Vec<RoomOccupancy> {
        let slots = self.settings.occupancy_slots;
        let mut rows = Vec::new();
        for rs in self.room_handles() {
            let guard = rs.read().await;
            if guard.deleted {
                continue;
            }
            let room = &guard.room;
            let lesson_count = guard.lesson_count();
            rows.push(RoomOccupancy {
                room_id: room.id,
                number: room.number.clone(),
                building: room.building.clone(),
                floor: room.floor,
                capacity: room.capacity,
                lesson_count,
                occupancy_rate: occupancy_rate(lesson_count, slots),
            });
        }
        rows.sort_by(|a, b| {
            (&a.building, a.floor, &a.number, a.room_id).cmp(&(&b.building, b.floor, &b.number, b.room_id))
        });
        rows
    }

    pub async fn equipment_report(&self) -> Vec<RoomEquipment> {
        self.list_rooms().await.iter().map(equipment_row).collect()
    }

    pub async fn stats(&self, date: NaiveDate) -> LedgerStats {
        let mut total_rooms = 0;
        let mut total_lessons = 0;
        let mut lessons_on_date = 0;
        let mut busy = HashSet::new();
        for rs in self.room_handles() {
            let guard = rs.read().await;
            if guard.deleted {
                continue;
            }
            total_rooms += 1;
            total_lessons += guard.lesson_count();
            let today = guard.lessons_on(date).len();
            if today > 0 {
                lessons_on_date += today;
                busy.insert(guard.room.id);
            }
        }
        LedgerStats {
            total_rooms,
            total_lessons,
            lessons_on_date,
            busy_rooms: busy.len(),
            free_rooms: total_rooms - busy.len(),
        }
    }
}
