use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open time-of-day interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Span {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    /// Touching spans (one ends exactly where the other starts) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Equipment {
    pub has_projector: bool,
    pub has_computers: bool,
    pub has_board: bool,
    pub has_air_conditioner: bool,
    pub computers_count: u32,
}

impl Default for Equipment {
    fn default() -> Self {
        Self {
            has_projector: false,
            has_computers: false,
            has_board: true,
            has_air_conditioner: false,
            computers_count: 0,
        }
    }
}

/// A bookable room and its static attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    /// Display number; only unique within a building.
    pub number: String,
    pub building: String,
    pub floor: i32,
    pub capacity: u32,
    /// Square metres.
    pub area: f64,
    pub equipment: Equipment,
}

impl Room {
    /// A room with the defaults of the entry form: floor 1, 20 seats, 30 m², a board.
    pub fn new(id: Ulid, number: impl Into<String>, building: impl Into<String>) -> Self {
        Self {
            id,
            number: number.into(),
            building: building.into(),
            floor: 1,
            capacity: 20,
            area: 30.0,
            equipment: Equipment::default(),
        }
    }

    /// Catalog order: building, floor, number, then id as tie-breaker.
    pub fn catalog_key(&self) -> (&str, i32, &str, Ulid) {
        (&self.building, self.floor, &self.number, self.id)
    }
}

/// A committed lesson booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: Ulid,
    pub room_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub group_name: String,
    pub teacher_name: String,
    pub subject_name: String,
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    /// Lessons per date, each day sorted by `span.start`.
    pub lessons: BTreeMap<NaiveDate, Vec<Lesson>>,
    /// Set under the write lock when the room is deleted, so a booking that
    /// raced the deletion for the lock sees a dead room.
    pub deleted: bool,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            lessons: BTreeMap::new(),
            deleted: false,
        }
    }

    pub fn lesson_count(&self) -> usize {
        self.lessons.values().map(Vec::len).sum()
    }

    pub fn lessons_on(&self, date: NaiveDate) -> &[Lesson] {
        self.lessons.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Insert a lesson keeping its day sorted by start.
    pub fn insert_lesson(&mut self, lesson: Lesson) {
        let day = self.lessons.entry(lesson.date).or_default();
        let pos = day.partition_point(|l| l.span.start <= lesson.span.start);
        day.insert(pos, lesson);
    }

    pub fn remove_lesson(&mut self, id: Ulid) -> Option<Lesson> {
        let (date, pos) = self.lessons.iter().find_map(|(date, day)| {
            day.iter().position(|l| l.id == id).map(|pos| (*date, pos))
        })?;
        let day = self.lessons.get_mut(&date)?;
        let removed = day.remove(pos);
        if day.is_empty() {
            self.lessons.remove(&date);
        }
        Some(removed)
    }

    /// Lessons on `date` whose span overlaps `query`.
    /// Binary search skips every lesson starting at or after `query.end`.
    pub fn overlapping(&self, date: NaiveDate, query: &Span) -> impl Iterator<Item = &Lesson> {
        let day = self.lessons_on(date);
        let right_bound = day.partition_point(|l| l.span.start < query.end);
        day[..right_bound]
            .iter()
            .filter(move |l| l.span.end > query.start)
    }

    pub fn all_lessons(&self) -> impl Iterator<Item = &Lesson> {
        self.lessons.values().flatten()
    }
}

/// WAL record format. One record is one atomic commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated { room: Room },
    RoomUpdated { room: Room },
    RoomDeleted { id: Ulid },
    /// One or more lessons committed together.
    LessonsBooked { lessons: Vec<Lesson> },
    LessonCancelled { id: Ulid, room_id: Ulid },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledLesson {
    pub lesson: Lesson,
    pub room_number: String,
    pub building: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoomOccupancy {
    pub room_id: Ulid,
    pub number: String,
    pub building: String,
    pub floor: i32,
    pub capacity: u32,
    pub lesson_count: usize,
    /// Percentage, one decimal, capped at 100.
    pub occupancy_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomEquipment {
    pub room_id: Ulid,
    pub number: String,
    pub building: String,
    pub has_projector: bool,
    /// Zero when the room has no computers, whatever the stored count says.
    pub computers_count: u32,
    pub has_board: bool,
    pub has_air_conditioner: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerStats {
    pub total_rooms: usize,
    pub total_lessons: usize,
    pub lessons_on_date: usize,
    pub busy_rooms: usize,
    pub free_rooms: usize,
}
