use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::*;

use super::conflict::checked_span;
use super::{Engine, EngineError};

/// Merge sorted overlapping or touching spans into disjoint spans.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`; both sorted by start, `to_remove` may overlap itself.
pub fn subtract_spans(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut cursor = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= cursor {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > cursor {
                result.push(Span::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
            j += 1;
        }

        if cursor < b.end {
            result.push(Span::new(cursor, b.end));
        }
    }

    result
}

/// Free sub-windows of `window` on `date` for one room.
pub fn free_windows(rs: &RoomState, date: NaiveDate, window: &Span) -> Vec<Span> {
    let busy: Vec<Span> = rs
        .overlapping(date, window)
        .map(|l| l.span)
        .collect();
    subtract_spans(&[*window], &merge_overlapping(&busy))
}

impl Engine {
    /// Gaps in a room's day between `start` and `end`.
    pub async fn room_availability(
        &self,
        room_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<Vec<Span>, EngineError> {
        let window = checked_span(start, end)?;
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        if guard.deleted {
            return Err(EngineError::NotFound(room_id));
        }
        Ok(free_windows(&guard, date, &window))
    }
}
