//! Billable segment arithmetic.
//!
//! A segment is 160 characters of message body. Counting is done in Unicode
//! scalar values, not bytes.

/// Characters per billable segment.
pub const SEGMENT_LENGTH: usize = 160;

/// Raw segment count: whole segments plus one for a partial trailing segment.
///
/// An empty body yields 0 here; see [`billable_segments`].
pub fn raw_segments(body: &str) -> i64 {
    let len = body.chars().count();
    let whole = len / SEGMENT_LENGTH;
    let partial = usize::from(len % SEGMENT_LENGTH != 0);
    (whole + partial) as i64
}

/// Segments actually charged for a body. Clamped to at least one so an empty
/// message is never free to send.
pub fn billable_segments(body: &str) -> i64 {
    raw_segments(body).max(1)
}
