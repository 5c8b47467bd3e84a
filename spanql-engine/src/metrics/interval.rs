//! Mapping timestamps onto the buckets of a range query.
//!
//! All times are unix nanoseconds unless the name says otherwise. Ranges are
//! aligned to the step: the start is rounded down and the end is rounded up.

use std::time::Duration;

use super::QueryRangeRequest;

const SECOND: u64 = 1_000_000_000;
const MILLISECOND: u64 = 1_000_000;

/// Picks a step that yields roughly 240 points over the range, rounded to
/// 5s (or 1s for short ranges) and never below 1s.
pub fn default_query_range_step(start: u64, end: u64) -> u64 {
    let baseline = end.saturating_sub(start) / 240;

    let mut interval = baseline / (5 * SECOND) * (5 * SECOND);
    if interval < 5 * SECOND {
        interval = baseline / SECOND * SECOND;
    }

    interval.max(SECOND)
}

pub(crate) fn align_start(start: u64, step: u64) -> u64 {
    if step == 0 {
        return 0;
    }

    start - start % step
}

pub(crate) fn align_end(end: u64, step: u64) -> u64 {
    if step == 0 {
        return 0;
    }

    match end % step {
        0 => end,
        rem => end + (step - rem),
    }
}

/// Number of buckets in the aligned range, both ends included.
pub fn interval_count(start: u64, end: u64, step: u64) -> usize {
    if step == 0 {
        return 0;
    }

    let start = align_start(start, step);
    let end = align_end(end, step);

    ((end - start) / step + 1) as usize
}

pub fn timestamp_of(interval: usize, start: u64, step: u64) -> u64 {
    align_start(start, step) + interval as u64 * step
}

/// The bucket that `ts` falls in, if it falls in the range at all.
pub fn interval_of(ts: u64, start: u64, end: u64, step: u64) -> Option<usize> {
    let start = align_start(start, step);
    let end = align_end(end, step) + step;

    if ts < start || ts > end || end == start || step == 0 {
        return None;
    }

    Some(((ts - start) / step) as usize)
}

/// Same as [`interval_of`] with the timestamp in unix milliseconds. The range
/// is truncated to millisecond precision first.
pub fn interval_of_ms(ts_ms: i64, start: u64, end: u64, step: u64) -> Option<usize> {
    let ts = u64::try_from(ts_ms).ok()?.checked_mul(MILLISECOND)?;
    let start = start - start % MILLISECOND;
    let end = end - end % MILLISECOND;

    interval_of(ts, start, end, step)
}

pub fn is_instant(req: &QueryRangeRequest) -> bool {
    req.end.wrapping_sub(req.start) == req.step
}

/// Aligns the range to the step so repeated queries over a sliding window
/// produce the same buckets. Instant queries are left alone.
pub fn align_request(req: &mut QueryRangeRequest) {
    if is_instant(req) {
        return;
    }

    req.start = align_start(req.start, req.step);
    req.end = align_end(req.end, req.step);
}

/// Narrows the range to the overlap with a block. The block end has second
/// precision and is inclusive. Instant queries stay instant.
pub fn trim_to_block_overlap(
    start: u64,
    end: u64,
    step: u64,
    block_start: u64,
    block_end: u64,
) -> (u64, u64, u64) {
    let was_instant = end.wrapping_sub(start) == step;

    let block_end = block_end.saturating_add(Duration::from_secs(1).as_nanos() as u64);

    let start = start.max(block_start);
    let end = end.min(block_end);

    let step = if was_instant {
        end.saturating_sub(start)
    } else {
        step
    };

    (start, end, step)
}

/// Shortens the range to only include times before `before`.
pub fn trim_to_before(req: &mut QueryRangeRequest, before: u64) {
    let was_instant = is_instant(req);

    req.start = req.start.min(before);
    req.end = req.end.min(before);

    if was_instant {
        req.step = req.end - req.start;
    }
}

/// Shortens the range to only include times after `after`.
pub fn trim_to_after(req: &mut QueryRangeRequest, after: u64) {
    let was_instant = is_instant(req);

    req.start = req.start.max(after);
    req.end = req.end.max(after);

    if was_instant {
        req.step = req.end - req.start;
    }
}
