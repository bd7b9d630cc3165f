mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod reports;
mod search;
#[cfg(test)]
mod tests;

pub use availability::{free_windows, merge_overlapping, subtract_spans};
pub use error::EngineError;
pub use mutations::LessonRequest;
pub use search::RoomFilter;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

/// Default divisor for the occupancy report: lesson slots per room that count as 100%.
pub const DEFAULT_OCCUPANCY_SLOTS: u32 = 40;

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub occupancy_slots: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            occupancy_slots: DEFAULT_OCCUPANCY_SLOTS,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is running are written
/// together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch = match cmd {
            WalCommand::Append { event, response } => vec![(event, response)],
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let appended = batch.iter().try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so stale bytes never leak into the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// In-memory room catalog and lesson ledger, made durable by the WAL.
pub struct Engine {
    pub(super) rooms: DashMap<Ulid, SharedRoomState>,
    /// Reverse lookup: lesson id → room id.
    pub(super) lesson_to_room: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) settings: EngineSettings,
    /// Mutations hold it shared from check to apply; compaction holds it
    /// exclusively, so its snapshot covers every acknowledged commit.
    pub(super) commit_gate: RwLock<()>,
}

/// Apply an event to one room. The caller holds the room's write lock.
/// Lessons of a multi-room booking that belong to other rooms are skipped.
fn apply_to_room(rs: &mut RoomState, event: &Event, lesson_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::RoomUpdated { room } => {
            rs.room = room.clone();
        }
        Event::LessonsBooked { lessons } => {
            let room_id = rs.room.id;
            for lesson in lessons.iter().filter(|l| l.room_id == room_id) {
                lesson_index.insert(lesson.id, lesson.room_id);
                rs.insert_lesson(lesson.clone());
            }
        }
        Event::LessonCancelled { id, .. } => {
            rs.remove_lesson(*id);
            lesson_index.remove(id);
        }
        // Catalog membership is handled at the map level.
        Event::RoomCreated { .. } | Event::RoomDeleted { .. } => {}
    }
}

/// Rooms touched by a non-catalog event.
fn event_room_ids(event: &Event) -> Vec<Ulid> {
    match event {
        Event::RoomUpdated { room } => vec![room.id],
        Event::LessonsBooked { lessons } => {
            let mut ids: Vec<Ulid> = lessons.iter().map(|l| l.room_id).collect();
            ids.sort();
            ids.dedup();
            ids
        }
        Event::LessonCancelled { room_id, .. } => vec![*room_id],
        Event::RoomCreated { .. } | Event::RoomDeleted { .. } => Vec::new(),
    }
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task.
    /// Must be called inside a Tokio runtime.
    pub fn new(wal_path: PathBuf, settings: EngineSettings) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.dropped_tail {
            warn!(
                path = %wal_path.display(),
                valid_len = replay.valid_len,
                "truncating torn or corrupt tail of the WAL"
            );
            Wal::truncate(&wal_path, replay.valid_len)?;
        }
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            lesson_to_room: DashMap::new(),
            wal_tx,
            settings,
            commit_gate: RwLock::new(()),
        };

        // Sole owner of every lock during replay: try_write never contends.
        // blocking_write would panic here since this may run on a runtime thread.
        for event in &replay.events {
            match event {
                Event::RoomCreated { room } => {
                    engine
                        .rooms
                        .insert(room.id, Arc::new(RwLock::new(RoomState::new(room.clone()))));
                }
                Event::RoomDeleted { id } => {
                    if let Some((_, rs)) = engine.rooms.remove(id)
                        && let Ok(guard) = rs.try_read()
                    {
                        for lesson in guard.all_lessons() {
                            engine.lesson_to_room.remove(&lesson.id);
                        }
                    }
                }
                other => {
                    for room_id in event_room_ids(other) {
                        if let Some(rs) = engine.get_room(&room_id)
                            && let Ok(mut guard) = rs.try_write()
                        {
                            apply_to_room(&mut guard, other, &engine.lesson_to_room);
                        }
                    }
                }
            }
        }

        info!(
            rooms = engine.rooms.len(),
            lessons = engine.lesson_to_room.len(),
            events = replay.events.len(),
            "ledger restored from WAL"
        );
        Ok(engine)
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    /// Hand an event to the group-commit writer and wait until it is durable.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::PersistenceFailure("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::PersistenceFailure("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::PersistenceFailure(e.to_string()))
    }

    pub fn get_room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn room_for_lesson(&self, lesson_id: &Ulid) -> Option<Ulid> {
        self.lesson_to_room.get(lesson_id).map(|e| *e.value())
    }

    /// Snapshot of the room handles, so no map shard stays locked across an await.
    pub(super) fn room_handles(&self) -> Vec<SharedRoomState> {
        self.rooms.iter().map(|e| e.value().clone()).collect()
    }

    /// Commit point: the WAL write must succeed before memory changes,
    /// so a failed write leaves the ledger exactly as it was.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_room(rs, event, &self.lesson_to_room);
        Ok(())
    }

    /// Look up a lesson's room and take its write lock.
    pub(super) async fn resolve_lesson_write(
        &self,
        lesson_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<RoomState>), EngineError> {
        let room_id = self
            .room_for_lesson(lesson_id)
            .ok_or(EngineError::NotFound(*lesson_id))?;
        let rs = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.write_owned().await;
        Ok((room_id, guard))
    }
}
