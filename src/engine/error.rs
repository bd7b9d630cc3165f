use chrono::NaiveTime;
use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid time range: start {start} must be before end {end}")]
    InvalidTimeRange { start: NaiveTime, end: NaiveTime },
    #[error("time slot already taken by lesson {0}")]
    ConflictDetected(Ulid),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("cannot delete room {room}: {lessons} lesson(s) still booked")]
    ReferentialBlock { room: Ulid, lessons: usize },
    #[error("invalid room: {0}")]
    InvalidRoom(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
}
