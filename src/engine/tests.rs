use super::*;
use crate::limits::*;

use chrono::{NaiveDate, NaiveTime};

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 9, 2).unwrap()
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("roomledger_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(name: &str) -> Engine {
    Engine::new(test_wal_path(name), EngineSettings::default()).unwrap()
}

/// Engine whose WAL writer is gone: every append fails.
fn engine_with_dead_wal() -> Engine {
    let (wal_tx, wal_rx) = mpsc::channel(1);
    drop(wal_rx);
    Engine {
        rooms: DashMap::new(),
        lesson_to_room: DashMap::new(),
        wal_tx,
        settings: EngineSettings::default(),
        commit_gate: RwLock::new(()),
    }
}

async fn add_room(engine: &Engine, number: &str, building: &str) -> Ulid {
    let id = Ulid::new();
    engine.create_room(Room::new(id, number, building)).await.unwrap();
    id
}

fn request(room_id: Ulid, start: NaiveTime, end: NaiveTime) -> LessonRequest {
    LessonRequest {
        id: Ulid::new(),
        room_id,
        date: day(),
        start,
        end,
        group_name: "CS-21".into(),
        teacher_name: "Ivanova".into(),
        subject_name: "Algebra".into(),
    }
}

// ── Rooms ────────────────────────────────────────────────

#[tokio::test]
async fn create_and_list_rooms_in_catalog_order() {
    let engine = new_engine("catalog_order.wal");
    let mut b201 = Room::new(Ulid::new(), "201", "A");
    b201.floor = 2;
    engine.create_room(b201).await.unwrap();
    add_room(&engine, "301", "B").await;
    add_room(&engine, "102", "A").await;
    add_room(&engine, "101", "A").await;

    let numbers: Vec<String> = engine.list_rooms().await.into_iter().map(|r| r.number).collect();
    assert_eq!(numbers, vec!["101", "102", "201", "301"]);
}

#[tokio::test]
async fn create_room_rejects_duplicates_and_bad_attributes() {
    let engine = new_engine("room_validation.wal");
    let id = add_room(&engine, "101", "A").await;

    let dup = engine.create_room(Room::new(id, "999", "Z")).await;
    assert!(matches!(dup, Err(EngineError::AlreadyExists(x)) if x == id));

    let mut zero_cap = Room::new(Ulid::new(), "102", "A");
    zero_cap.capacity = 0;
    assert!(matches!(
        engine.create_room(zero_cap).await,
        Err(EngineError::InvalidRoom(_))
    ));

    let mut bad_area = Room::new(Ulid::new(), "103", "A");
    bad_area.area = f64::NAN;
    assert!(matches!(
        engine.create_room(bad_area).await,
        Err(EngineError::InvalidRoom(_))
    ));

    assert!(matches!(
        engine.create_room(Room::new(Ulid::new(), "  ", "A")).await,
        Err(EngineError::InvalidRoom(_))
    ));

    let long = "x".repeat(MAX_ROOM_NUMBER_LEN + 1);
    assert!(matches!(
        engine.create_room(Room::new(Ulid::new(), long, "A")).await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert_eq!(engine.room_count(), 1);
}

#[tokio::test]
async fn update_room_changes_attributes_keeps_lessons() {
    let engine = new_engine("update_room.wal");
    let id = add_room(&engine, "101", "A").await;
    engine.book_lesson(request(id, t(9, 0), t(10, 30))).await.unwrap();

    let mut edited = engine.room_info(id).await.unwrap();
    edited.capacity = 60;
    edited.equipment.has_projector = true;
    engine.update_room(edited).await.unwrap();

    let room = engine.room_info(id).await.unwrap();
    assert_eq!(room.capacity, 60);
    assert!(room.equipment.has_projector);
    assert_eq!(engine.room_lessons(id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn update_missing_room_is_not_found() {
    let engine = new_engine("update_missing.wal");
    let room = Room::new(Ulid::new(), "101", "A");
    let id = room.id;
    assert!(matches!(engine.update_room(room).await, Err(EngineError::NotFound(x)) if x == id));
}

#[tokio::test]
async fn delete_room_blocked_while_lessons_exist() {
    let engine = new_engine("delete_blocked.wal");
    let id = add_room(&engine, "101", "A").await;
    let lesson = engine.book_lesson(request(id, t(9, 0), t(10, 30))).await.unwrap();

    let result = engine.delete_room(id).await;
    assert!(matches!(
        result,
        Err(EngineError::ReferentialBlock { room, lessons: 1 }) if room == id
    ));
    assert_eq!(engine.room_count(), 1);

    assert_eq!(engine.cancel_lesson(lesson).await.unwrap(), id);
    engine.delete_room(id).await.unwrap();
    assert_eq!(engine.room_count(), 0);
    assert!(matches!(engine.room_info(id).await, Err(EngineError::NotFound(_))));
    assert!(matches!(engine.delete_room(id).await, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn booking_into_deleted_room_handle_is_not_found() {
    let engine = new_engine("deleted_handle.wal");
    let id = add_room(&engine, "101", "A").await;
    // A booking that looked the room up before the delete won the lock.
    let stale = engine.get_room(&id).unwrap();
    engine.delete_room(id).await.unwrap();
    assert!(stale.read().await.deleted);

    let result = engine.book_lesson(request(id, t(9, 0), t(10, 0))).await;
    assert!(matches!(result, Err(EngineError::NotFound(x)) if x == id));
}

// ── Conflict checker ─────────────────────────────────────

#[tokio::test]
async fn has_conflict_reports_overlap_only() {
    let engine = new_engine("has_conflict.wal");
    let id = add_room(&engine, "101", "A").await;
    engine.book_lesson(request(id, t(10, 0), t(11, 30))).await.unwrap();

    assert!(engine.has_conflict(id, day(), t(11, 0), t(12, 0)).await.unwrap());
    assert!(engine.has_conflict(id, day(), t(9, 0), t(13, 0)).await.unwrap());
    assert!(!engine.has_conflict(id, day(), t(11, 30), t(12, 30)).await.unwrap());
    assert!(!engine.has_conflict(id, day(), t(8, 0), t(10, 0)).await.unwrap());
    let tomorrow = day().succ_opt().unwrap();
    assert!(!engine.has_conflict(id, tomorrow, t(10, 0), t(11, 30)).await.unwrap());
}

#[tokio::test]
async fn has_conflict_validates_input() {
    let engine = new_engine("has_conflict_input.wal");
    let id = add_room(&engine, "101", "A").await;
    assert!(matches!(
        engine.has_conflict(id, day(), t(12, 0), t(12, 0)).await,
        Err(EngineError::InvalidTimeRange { .. })
    ));
    assert!(matches!(
        engine.has_conflict(Ulid::new(), day(), t(9, 0), t(10, 0)).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn has_conflict_does_not_mutate() {
    let engine = new_engine("has_conflict_pure.wal");
    let id = add_room(&engine, "101", "A").await;
    engine.has_conflict(id, day(), t(9, 0), t(10, 0)).await.unwrap();
    assert_eq!(engine.lesson_count(), 0);
    assert_eq!(engine.wal_appends_since_compact().await, 1);
}

// ── Lesson insert ────────────────────────────────────────

#[tokio::test]
async fn identical_booking_is_rejected() {
    let engine = new_engine("identical.wal");
    let id = add_room(&engine, "101", "A").await;
    let first = engine.book_lesson(request(id, t(9, 0), t(10, 30))).await.unwrap();

    let second = engine.book_lesson(request(id, t(9, 0), t(10, 30))).await;
    assert!(matches!(second, Err(EngineError::ConflictDetected(x)) if x == first));
    assert_eq!(engine.lesson_count(), 1);
}

#[tokio::test]
async fn back_to_back_lessons_are_accepted() {
    let engine = new_engine("back_to_back.wal");
    let id = add_room(&engine, "101", "A").await;
    engine.book_lesson(request(id, t(10, 0), t(11, 30))).await.unwrap();
    engine.book_lesson(request(id, t(11, 30), t(12, 30))).await.unwrap();
    assert_eq!(engine.room_lessons(id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn one_minute_overlap_is_rejected() {
    let engine = new_engine("one_minute.wal");
    let id = add_room(&engine, "101", "A").await;
    engine.book_lesson(request(id, t(10, 0), t(11, 30))).await.unwrap();
    let result = engine.book_lesson(request(id, t(11, 29), t(11, 31))).await;
    assert!(matches!(result, Err(EngineError::ConflictDetected(_))));
}

#[tokio::test]
async fn same_slot_in_other_room_or_day_is_fine() {
    let engine = new_engine("other_room_day.wal");
    let a = add_room(&engine, "101", "A").await;
    let b = add_room(&engine, "102", "A").await;
    engine.book_lesson(request(a, t(9, 0), t(10, 30))).await.unwrap();
    engine.book_lesson(request(b, t(9, 0), t(10, 30))).await.unwrap();
    let mut next_day = request(a, t(9, 0), t(10, 30));
    next_day.date = day().succ_opt().unwrap();
    engine.book_lesson(next_day).await.unwrap();
    assert_eq!(engine.lesson_count(), 3);
}

#[tokio::test]
async fn invalid_time_range_on_insert() {
    let engine = new_engine("insert_invalid_range.wal");
    let id = add_room(&engine, "101", "A").await;
    for (start, end) in [(t(10, 0), t(10, 0)), (t(11, 0), t(10, 0))] {
        let result = engine.book_lesson(request(id, start, end)).await;
        assert!(matches!(result, Err(EngineError::InvalidTimeRange { .. })));
    }
    assert_eq!(engine.lesson_count(), 0);
}

#[tokio::test]
async fn booking_unknown_room_is_not_found() {
    let engine = new_engine("unknown_room.wal");
    let room = Ulid::new();
    let result = engine.book_lesson(request(room, t(9, 0), t(10, 0))).await;
    assert!(matches!(result, Err(EngineError::NotFound(x)) if x == room));
}

#[tokio::test]
async fn duplicate_lesson_id_is_rejected() {
    let engine = new_engine("dup_lesson_id.wal");
    let id = add_room(&engine, "101", "A").await;
    let req = request(id, t(9, 0), t(10, 0));
    let mut again = req.clone();
    again.start = t(14, 0);
    again.end = t(15, 0);
    engine.book_lesson(req).await.unwrap();
    assert!(matches!(engine.book_lesson(again).await, Err(EngineError::AlreadyExists(_))));
}

#[tokio::test]
async fn long_names_are_rejected() {
    let engine = new_engine("long_names.wal");
    let id = add_room(&engine, "101", "A").await;
    let mut req = request(id, t(9, 0), t(10, 0));
    req.group_name = "g".repeat(MAX_GROUP_NAME_LEN + 1);
    assert!(matches!(engine.book_lesson(req).await, Err(EngineError::LimitExceeded(_))));
}

#[tokio::test]
async fn concurrent_bookings_of_one_slot_admit_exactly_one() {
    let engine = Arc::new(new_engine("concurrent_slot.wal"));
    let id = add_room(&engine, "101", "A").await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.book_lesson(request(id, t(9, 0), t(10, 30))).await
        }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::ConflictDetected(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(engine.lesson_count(), 1);
}

#[tokio::test]
async fn accepted_lessons_never_overlap() {
    let engine = new_engine("pairwise.wal");
    let id = add_room(&engine, "101", "A").await;
    // Sweep of overlapping proposals in 15-minute steps.
    for step in 0..32u32 {
        let start = t(8, 0) + chrono::Duration::minutes(i64::from(step) * 15);
        let end = start + chrono::Duration::minutes(50);
        let _ = engine.book_lesson(request(id, start, end)).await;
    }

    let lessons = engine.room_lessons(id).await.unwrap();
    assert!(lessons.len() > 1);
    for (i, a) in lessons.iter().enumerate() {
        for b in &lessons[i + 1..] {
            assert!(a.date != b.date || !a.span.overlaps(&b.span));
        }
    }
}

#[tokio::test]
async fn cancel_unknown_lesson_is_not_found() {
    let engine = new_engine("cancel_unknown.wal");
    assert!(matches!(
        engine.cancel_lesson(Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn cancel_frees_the_slot() {
    let engine = new_engine("cancel_frees.wal");
    let id = add_room(&engine, "101", "A").await;
    let lesson = engine.book_lesson(request(id, t(9, 0), t(10, 30))).await.unwrap();
    engine.cancel_lesson(lesson).await.unwrap();
    assert!(engine.room_for_lesson(&lesson).is_none());
    engine.book_lesson(request(id, t(9, 0), t(10, 30))).await.unwrap();
    assert!(matches!(engine.cancel_lesson(lesson).await, Err(EngineError::NotFound(_))));
}

// ── Batch insert ─────────────────────────────────────────

#[tokio::test]
async fn batch_books_across_rooms() {
    let engine = new_engine("batch_rooms.wal");
    let a = add_room(&engine, "101", "A").await;
    let b = add_room(&engine, "102", "A").await;
    let ids = engine
        .book_lessons(vec![
            request(a, t(9, 0), t(10, 30)),
            request(b, t(9, 0), t(10, 30)),
            request(a, t(10, 30), t(12, 0)),
        ])
        .await
        .unwrap();
    assert_eq!(ids.len(), 3);
    assert_eq!(engine.room_lessons(a).await.unwrap().len(), 2);
    assert_eq!(engine.room_lessons(b).await.unwrap().len(), 1);
    assert_eq!(engine.wal_appends_since_compact().await, 3);
}

#[tokio::test]
async fn batch_is_all_or_nothing() {
    let engine = new_engine("batch_atomic.wal");
    let a = add_room(&engine, "101", "A").await;
    let b = add_room(&engine, "102", "A").await;
    engine.book_lesson(request(b, t(9, 0), t(10, 30))).await.unwrap();

    let result = engine
        .book_lessons(vec![
            request(a, t(9, 0), t(10, 30)),
            request(b, t(10, 0), t(11, 0)),
        ])
        .await;
    assert!(matches!(result, Err(EngineError::ConflictDetected(_))));
    assert!(engine.room_lessons(a).await.unwrap().is_empty());
    assert_eq!(engine.lesson_count(), 1);
}

#[tokio::test]
async fn batch_members_conflicting_with_each_other() {
    let engine = new_engine("batch_internal.wal");
    let a = add_room(&engine, "101", "A").await;
    let result = engine
        .book_lessons(vec![request(a, t(9, 0), t(10, 30)), request(a, t(10, 0), t(11, 0))])
        .await;
    assert!(matches!(result, Err(EngineError::ConflictDetected(_))));
    assert_eq!(engine.lesson_count(), 0);
}

#[tokio::test]
async fn batch_with_unknown_room_books_nothing() {
    let engine = new_engine("batch_unknown.wal");
    let a = add_room(&engine, "101", "A").await;
    let result = engine
        .book_lessons(vec![request(a, t(9, 0), t(10, 0)), request(Ulid::new(), t(9, 0), t(10, 0))])
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
    assert_eq!(engine.lesson_count(), 0);
}

#[tokio::test]
async fn empty_batch_is_noop() {
    let engine = new_engine("batch_empty.wal");
    assert!(engine.book_lessons(Vec::new()).await.unwrap().is_empty());
    assert_eq!(engine.wal_appends_since_compact().await, 0);
}

#[tokio::test]
async fn batch_over_limit() {
    let engine = new_engine("batch_limit.wal");
    let a = add_room(&engine, "101", "A").await;
    let requests = (0..=MAX_BATCH_SIZE)
        .map(|_| request(a, t(9, 0), t(10, 0)))
        .collect();
    assert!(matches!(
        engine.book_lessons(requests).await,
        Err(EngineError::LimitExceeded(_))
    ));
}

// ── Free-room search ─────────────────────────────────────

#[tokio::test]
async fn empty_ledger_search_returns_catalog() {
    let engine = new_engine("search_empty.wal");
    add_room(&engine, "101", "A").await;
    add_room(&engine, "102", "A").await;
    let free = engine
        .find_free(day(), t(9, 0), t(10, 30), &RoomFilter::default())
        .await
        .unwrap();
    assert_eq!(free.len(), 2);
}

#[tokio::test]
async fn search_excludes_exactly_conflicting_rooms() {
    let engine = new_engine("search_conflicting.wal");
    let r1 = add_room(&engine, "101", "A").await;
    let r2 = add_room(&engine, "102", "A").await;
    engine.book_lesson(request(r1, t(9, 0), t(10, 30))).await.unwrap();

    let any = RoomFilter::default();
    let free: Vec<Ulid> = engine
        .find_free(day(), t(9, 0), t(10, 30), &any)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(free, vec![r2]);

    let free: Vec<Ulid> = engine
        .find_free(day(), t(10, 30), t(11, 0), &any)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(free, vec![r1, r2]);
}

#[tokio::test]
async fn search_applies_static_filter() {
    let engine = new_engine("search_filter.wal");
    let mut big = Room::new(Ulid::new(), "201", "A");
    big.capacity = 60;
    big.equipment.has_projector = true;
    let big_id = big.id;
    engine.create_room(big).await.unwrap();
    add_room(&engine, "101", "A").await;
    add_room(&engine, "301", "B").await;

    let filter = RoomFilter {
        min_capacity: 40,
        building: "A".into(),
        require_projector: true,
        ..Default::default()
    };
    let free = engine.find_free(day(), t(9, 0), t(10, 0), &filter).await.unwrap();
    assert_eq!(free.len(), 1);
    assert_eq!(free[0].id, big_id);
}

#[tokio::test]
async fn invalid_time_range_on_search() {
    let engine = new_engine("search_invalid.wal");
    let result = engine
        .find_free(day(), t(12, 0), t(11, 0), &RoomFilter::default())
        .await;
    assert!(matches!(result, Err(EngineError::InvalidTimeRange { .. })));
}

#[tokio::test]
async fn room_availability_lists_gaps() {
    let engine = new_engine("availability.wal");
    let id = add_room(&engine, "101", "A").await;
    engine.book_lesson(request(id, t(9, 0), t(10, 30))).await.unwrap();
    engine.book_lesson(request(id, t(12, 0), t(13, 30))).await.unwrap();

    let gaps = engine.room_availability(id, day(), t(8, 0), t(14, 0)).await.unwrap();
    assert_eq!(
        gaps,
        vec![
            Span::new(t(8, 0), t(9, 0)),
            Span::new(t(10, 30), t(12, 0)),
            Span::new(t(13, 30), t(14, 0)),
        ]
    );
}

// ── Queries and reports ──────────────────────────────────

#[tokio::test]
async fn schedule_orders_by_start_then_room() {
    let engine = new_engine("schedule.wal");
    let a = add_room(&engine, "102", "A").await;
    let b = add_room(&engine, "101", "A").await;
    engine.book_lesson(request(a, t(11, 0), t(12, 0))).await.unwrap();
    engine.book_lesson(request(a, t(9, 0), t(10, 0))).await.unwrap();
    engine.book_lesson(request(b, t(9, 0), t(10, 0))).await.unwrap();

    let all = engine.schedule(day(), None).await.unwrap();
    let order: Vec<(NaiveTime, &str)> = all
        .iter()
        .map(|s| (s.lesson.span.start, s.room_number.as_str()))
        .collect();
    assert_eq!(order, vec![(t(9, 0), "101"), (t(9, 0), "102"), (t(11, 0), "102")]);

    assert_eq!(engine.schedule(day(), Some(a)).await.unwrap().len(), 2);
    let other_day = day().succ_opt().unwrap();
    assert!(engine.schedule(other_day, None).await.unwrap().is_empty());
    assert!(matches!(
        engine.schedule(day(), Some(Ulid::new())).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn stats_count_distinct_busy_rooms() {
    let engine = new_engine("stats.wal");
    let a = add_room(&engine, "101", "A").await;
    let b = add_room(&engine, "102", "A").await;
    add_room(&engine, "103", "A").await;
    engine.book_lesson(request(a, t(9, 0), t(10, 0))).await.unwrap();
    engine.book_lesson(request(a, t(10, 0), t(11, 0))).await.unwrap();
    let mut later = request(b, t(9, 0), t(10, 0));
    later.date = day().succ_opt().unwrap();
    engine.book_lesson(later).await.unwrap();

    let stats = engine.stats(day()).await;
    assert_eq!(
        stats,
        LedgerStats {
            total_rooms: 3,
            total_lessons: 3,
            lessons_on_date: 2,
            busy_rooms: 1,
            free_rooms: 2,
        }
    );
}

#[tokio::test]
async fn occupancy_uses_configured_slots() {
    let engine = Engine::new(
        test_wal_path("occupancy_slots.wal"),
        EngineSettings { occupancy_slots: 4 },
    )
    .unwrap();
    let a = add_room(&engine, "101", "A").await;
    add_room(&engine, "102", "A").await;
    engine.book_lesson(request(a, t(9, 0), t(10, 0))).await.unwrap();

    let report = engine.occupancy_report().await;
    assert_eq!(report.len(), 2);
    assert_eq!(report[0].room_id, a);
    assert_eq!(report[0].lesson_count, 1);
    assert_eq!(report[0].occupancy_rate, 25.0);
    assert_eq!(report[1].occupancy_rate, 0.0);
}

#[tokio::test]
async fn equipment_report_follows_catalog() {
    let engine = new_engine("equipment.wal");
    let mut lab = Room::new(Ulid::new(), "201", "A");
    lab.floor = 2;
    lab.equipment.has_computers = true;
    lab.equipment.computers_count = 15;
    engine.create_room(lab).await.unwrap();
    add_room(&engine, "101", "A").await;

    let report = engine.equipment_report().await;
    assert_eq!(report[0].number, "101");
    assert_eq!(report[0].computers_count, 0);
    assert!(report[0].has_board);
    assert_eq!(report[1].computers_count, 15);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn wal_replay_restores_ledger() {
    let path = test_wal_path("replay.wal");
    let a;
    let kept;
    {
        let engine = Engine::new(path.clone(), EngineSettings::default()).unwrap();
        a = add_room(&engine, "101", "A").await;
        let gone = add_room(&engine, "102", "A").await;
        kept = engine.book_lesson(request(a, t(9, 0), t(10, 30))).await.unwrap();
        let cancelled = engine.book_lesson(request(a, t(11, 0), t(12, 0))).await.unwrap();
        engine.cancel_lesson(cancelled).await.unwrap();
        engine.delete_room(gone).await.unwrap();
    }

    let engine = Engine::new(path, EngineSettings::default()).unwrap();
    assert_eq!(engine.room_count(), 1);
    let lessons = engine.room_lessons(a).await.unwrap();
    assert_eq!(lessons.len(), 1);
    assert_eq!(lessons[0].id, kept);
    assert_eq!(engine.room_for_lesson(&kept), Some(a));
    // The restored ledger still rejects the taken slot.
    assert!(matches!(
        engine.book_lesson(request(a, t(10, 0), t(11, 0))).await,
        Err(EngineError::ConflictDetected(x)) if x == kept
    ));
}

#[tokio::test]
async fn batch_survives_replay() {
    let path = test_wal_path("batch_replay.wal");
    let a;
    let b;
    {
        let engine = Engine::new(path.clone(), EngineSettings::default()).unwrap();
        a = add_room(&engine, "101", "A").await;
        b = add_room(&engine, "102", "A").await;
        engine
            .book_lessons(vec![request(a, t(9, 0), t(10, 0)), request(b, t(9, 0), t(10, 0))])
            .await
            .unwrap();
    }
    let engine = Engine::new(path, EngineSettings::default()).unwrap();
    assert_eq!(engine.room_lessons(a).await.unwrap().len(), 1);
    assert_eq!(engine.room_lessons(b).await.unwrap().len(), 1);
    assert_eq!(engine.lesson_count(), 2);
}

#[tokio::test]
async fn compact_wal_preserves_state() {
    let path = test_wal_path("compact_state.wal");
    let engine = Engine::new(path.clone(), EngineSettings::default()).unwrap();
    let a = add_room(&engine, "101", "A").await;
    engine.book_lesson(request(a, t(9, 0), t(10, 0))).await.unwrap();
    for _ in 0..20 {
        let tmp = engine.book_lesson(request(a, t(15, 0), t(16, 0))).await.unwrap();
        engine.cancel_lesson(tmp).await.unwrap();
    }

    let size_before = std::fs::metadata(&path).unwrap().len();
    engine.compact_wal().await.unwrap();
    let size_after = std::fs::metadata(&path).unwrap().len();
    assert!(size_after < size_before);
    assert_eq!(engine.wal_appends_since_compact().await, 0);

    let restored = Engine::new(path, EngineSettings::default()).unwrap();
    assert_eq!(restored.room_count(), 1);
    assert_eq!(
        restored.room_lessons(a).await.unwrap(),
        engine.room_lessons(a).await.unwrap()
    );
}

#[tokio::test]
async fn compact_wal_survives_restart_with_later_appends() {
    let path = test_wal_path("compact_restart.wal");
    let a;
    {
        let engine = Engine::new(path.clone(), EngineSettings::default()).unwrap();
        a = add_room(&engine, "101", "A").await;
        engine.book_lesson(request(a, t(9, 0), t(10, 0))).await.unwrap();
        engine.compact_wal().await.unwrap();
        engine.book_lesson(request(a, t(10, 0), t(11, 0))).await.unwrap();
    }
    let engine = Engine::new(path, EngineSettings::default()).unwrap();
    assert_eq!(engine.room_lessons(a).await.unwrap().len(), 2);
}

#[tokio::test]
async fn commits_racing_compaction_survive_restart() {
    let path = test_wal_path("compact_race.wal");
    let engine = Arc::new(Engine::new(path.clone(), EngineSettings::default()).unwrap());
    let a = add_room(&engine, "101", "A").await;

    // Park the compaction inside its snapshot by holding room A.
    let room_a = engine.get_room(&a).unwrap();
    let held = room_a.write().await;
    let compaction = tokio::spawn({
        let engine = engine.clone();
        async move { engine.compact_wal().await }
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let b = Ulid::new();
    let create = tokio::spawn({
        let engine = engine.clone();
        async move { engine.create_room(Room::new(b, "102", "A")).await }
    });
    let booking = tokio::spawn({
        let engine = engine.clone();
        async move { engine.book_lesson(request(a, t(9, 0), t(10, 0))).await }
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    drop(held);

    compaction.await.unwrap().unwrap();
    create.await.unwrap().unwrap();
    let lesson = booking.await.unwrap().unwrap();

    let restored = Engine::new(path, EngineSettings::default()).unwrap();
    assert_eq!(restored.room_count(), 2);
    assert_eq!(restored.room_info(b).await.unwrap().number, "102");
    assert_eq!(restored.room_for_lesson(&lesson), Some(a));
}

#[tokio::test]
async fn torn_tail_is_cut_before_new_commits() {
    let path = test_wal_path("torn_then_commit.wal");
    let a;
    let b;
    {
        let engine = Engine::new(path.clone(), EngineSettings::default()).unwrap();
        a = add_room(&engine, "101", "A").await;
    }
    {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[0xAB, 0xCD]).unwrap();
    }
    {
        let engine = Engine::new(path.clone(), EngineSettings::default()).unwrap();
        assert_eq!(engine.room_count(), 1);
        b = add_room(&engine, "102", "A").await;
    }

    let engine = Engine::new(path, EngineSettings::default()).unwrap();
    assert_eq!(engine.room_count(), 2);
    assert!(engine.room_info(a).await.is_ok());
    assert!(engine.room_info(b).await.is_ok());
}

#[tokio::test]
async fn concurrent_creates_with_one_id_admit_one() {
    let path = test_wal_path("create_same_id.wal");
    let engine = Engine::new(path.clone(), EngineSettings::default()).unwrap();
    let id = Ulid::new();

    let (first, second) = tokio::join!(
        engine.create_room(Room::new(id, "101", "A")),
        engine.create_room(Room::new(id, "999", "Z")),
    );
    let winner = match (first, second) {
        (Ok(()), Err(EngineError::AlreadyExists(x))) if x == id => "101",
        (Err(EngineError::AlreadyExists(x)), Ok(())) if x == id => "999",
        other => panic!("expected exactly one create to win, got {other:?}"),
    };
    assert_eq!(engine.room_count(), 1);
    assert_eq!(engine.room_info(id).await.unwrap().number, winner);

    let restored = Engine::new(path, EngineSettings::default()).unwrap();
    assert_eq!(restored.room_count(), 1);
    assert_eq!(restored.room_info(id).await.unwrap().number, winner);
}

#[tokio::test]
async fn group_commit_handles_concurrent_creates() {
    let path = test_wal_path("group_commit.wal");
    let engine = Arc::new(Engine::new(path.clone(), EngineSettings::default()).unwrap());

    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.create_room(Room::new(Ulid::new(), format!("{}", 100 + i), "A")).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.list_rooms().await.len(), n);

    let engine2 = Engine::new(path, EngineSettings::default()).unwrap();
    assert_eq!(engine2.list_rooms().await.len(), n);
}

#[tokio::test]
async fn failed_persist_leaves_ledger_untouched() {
    let engine = engine_with_dead_wal();
    let result = engine.create_room(Room::new(Ulid::new(), "101", "A")).await;
    assert!(matches!(result, Err(EngineError::PersistenceFailure(_))));
    assert_eq!(engine.room_count(), 0);

    // Seed a room behind the WAL's back, then try to book into it.
    let room = Room::new(Ulid::new(), "102", "A");
    let id = room.id;
    engine.rooms.insert(id, Arc::new(RwLock::new(RoomState::new(room))));
    let result = engine.book_lesson(request(id, t(9, 0), t(10, 0))).await;
    assert!(matches!(result, Err(EngineError::PersistenceFailure(_))));
    assert_eq!(engine.lesson_count(), 0);
    assert!(engine.room_lessons(id).await.unwrap().is_empty());
    assert!(!engine.has_conflict(id, day(), t(9, 0), t(10, 0)).await.unwrap());
}
