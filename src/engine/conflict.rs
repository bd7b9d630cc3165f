use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Build a span from client input, rejecting empty and inverted ranges.
pub(crate) fn checked_span(start: NaiveTime, end: NaiveTime) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::InvalidTimeRange { start, end });
    }
    Ok(Span::new(start, end))
}

/// First lesson of the room on `date` overlapping `span`, if any.
pub(crate) fn first_conflict<'a>(
    rs: &'a RoomState,
    date: NaiveDate,
    span: &Span,
) -> Option<&'a Lesson> {
    rs.overlapping(date, span).next()
}

pub(crate) fn check_no_conflict(
    rs: &RoomState,
    date: NaiveDate,
    span: &Span,
) -> Result<(), EngineError> {
    match first_conflict(rs, date, span) {
        Some(existing) => Err(EngineError::ConflictDetected(existing.id)),
        None => Ok(()),
    }
}

/// Pairwise check among candidates of one batch that share a room.
pub(crate) fn check_batch_disjoint(candidates: &[&Lesson]) -> Result<(), EngineError> {
    for (i, a) in candidates.iter().enumerate() {
        for b in &candidates[i + 1..] {
            if a.date == b.date && a.span.overlaps(&b.span) {
                return Err(EngineError::ConflictDetected(a.id));
            }
        }
    }
    Ok(())
}

impl Engine {
    /// Whether a lesson in `room_id` on `date` from `start` to `end` would
    /// overlap an existing one. Read-only.
    pub async fn has_conflict(
        &self,
        room_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<bool, EngineError> {
        let span = checked_span(start, end)?;
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        if guard.deleted {
            return Err(EngineError::NotFound(room_id));
        }
        Ok(first_conflict(&guard, date, &span).is_some())
    }
}
