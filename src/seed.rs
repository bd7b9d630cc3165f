use chrono::{Days, NaiveDate, NaiveTime};
use tracing::info;
use ulid::Ulid;

use crate::engine::{Engine, EngineError, LessonRequest};
use crate::model::*;

/// (number, building, floor, capacity, area, projector, computers, air conditioner, computers count)
type RoomRow = (&'static str, &'static str, i32, u32, f64, bool, bool, bool, u32);

const DEMO_ROOMS: [RoomRow; 6] = [
    ("101", "A", 1, 30, 45.5, true, false, false, 0),
    ("102", "A", 1, 25, 40.0, false, true, false, 10),
    ("103", "A", 1, 20, 35.0, true, true, false, 8),
    ("201", "A", 2, 40, 60.0, true, true, true, 15),
    ("202", "A", 2, 35, 55.0, true, false, false, 0),
    ("301", "B", 3, 50, 70.0, true, true, true, 20),
];

/// (room index, days from today, start, end, group, teacher, subject)
type LessonRow = (usize, u64, (u32, u32), (u32, u32), &'static str, &'static str, &'static str);

const DEMO_LESSONS: [LessonRow; 4] = [
    (0, 0, (9, 0), (10, 30), "IS-21", "Ivanov I.I.", "Mathematics"),
    (1, 0, (9, 0), (10, 30), "P-31", "Petrova A.S.", "Physics"),
    (2, 0, (10, 45), (12, 15), "DB-22", "Sidorov M.P.", "Databases"),
    (3, 1, (9, 0), (10, 30), "IS-21", "Ivanov I.I.", "Mathematics"),
];

fn hm((h, m): (u32, u32)) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN)
}

/// Fill an empty ledger with sample rooms and lessons around `today`.
/// Returns whether anything was written.
pub async fn seed_demo_data(engine: &Engine, today: NaiveDate) -> Result<bool, EngineError> {
    if engine.room_count() > 0 {
        info!("ledger not empty, skipping demo data");
        return Ok(false);
    }

    let mut room_ids = Vec::with_capacity(DEMO_ROOMS.len());
    for (number, building, floor, capacity, area, projector, computers, air, count) in DEMO_ROOMS {
        let mut room = Room::new(Ulid::new(), number, building);
        room.floor = floor;
        room.capacity = capacity;
        room.area = area;
        room.equipment = Equipment {
            has_projector: projector,
            has_computers: computers,
            has_board: true,
            has_air_conditioner: air,
            computers_count: count,
        };
        room_ids.push(room.id);
        engine.create_room(room).await?;
    }

    let lessons: Vec<LessonRequest> = DEMO_LESSONS
        .iter()
        .map(|&(room, offset, start, end, group, teacher, subject)| LessonRequest {
            id: Ulid::new(),
            room_id: room_ids[room],
            date: today.checked_add_days(Days::new(offset)).unwrap_or(today),
            start: hm(start),
            end: hm(end),
            group_name: group.into(),
            teacher_name: teacher.into(),
            subject_name: subject.into(),
        })
        .collect();
    engine.book_lessons(lessons).await?;

    info!(
        rooms = DEMO_ROOMS.len(),
        lessons = DEMO_LESSONS.len(),
        "demo data loaded"
    );
    Ok(true)
}
