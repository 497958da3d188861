use chrono::{FixedOffset, NaiveDate, TimeZone};

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Reject malformed or out-of-bounds windows before any lookup.
pub(crate) fn validate_range(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    if start >= end {
        return Err(EngineError::InvalidRange { start, end });
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end - start > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(Span::new(start, end))
}

/// `[local midnight, next local midnight)` for `date` at a fixed UTC offset.
pub fn day_window(date: NaiveDate, utc_offset_minutes: i32) -> Result<Span, EngineError> {
    let offset = utc_offset_minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .ok_or(EngineError::LimitExceeded("utc offset out of range"))?;
    let midnight = |d: NaiveDate| {
        d.and_hms_opt(0, 0, 0)
            .and_then(|naive| offset.from_local_datetime(&naive).single())
            .map(|dt| dt.timestamp_millis())
    };
    let start = midnight(date);
    let end = date.succ_opt().and_then(midnight);
    match (start, end) {
        (Some(start), Some(end)) => Ok(Span::new(start, end)),
        _ => Err(EngineError::LimitExceeded("date out of range")),
    }
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
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

/// `base` minus `to_remove`. Both sorted by start, `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut cursor = b.start;
        while ri < to_remove.len() && to_remove[ri].end <= cursor {
            ri += 1;
        }
        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = to_remove[j];
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

/// Free sub-windows of `window` not covered by any confirmed booking of `venue`.
pub fn free_windows(venue: &VenueState, window: &Span) -> Vec<Span> {
    let busy: Vec<Span> = venue
        .confirmed_overlapping(window)
        .map(|b| b.span)
        .collect();
    subtract_intervals(&[*window], &merge_overlapping(&busy))
}
