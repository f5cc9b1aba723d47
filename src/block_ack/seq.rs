//! Modulo-4096 sequence number arithmetic.

/// Size of the 12-bit sequence number space.
pub const SEQNO_SPACE_SIZE: u16 = 4096;
/// Half the sequence space: anything this far behind the window start is stale.
pub const SEQNO_SPACE_HALF_SIZE: u16 = SEQNO_SPACE_SIZE / 2;

/// Forward distance from `from` to `to`, modulo 4096.
pub fn distance(from: u16, to: u16) -> u16 {
    (to + SEQNO_SPACE_SIZE - from % SEQNO_SPACE_SIZE) % SEQNO_SPACE_SIZE
}

/// A frame is stale when it lies in the half of the space behind `start`.
pub fn is_old_packet(start: u16, seq: u16) -> bool {
    distance(start, seq) >= SEQNO_SPACE_HALF_SIZE
}

/// Whether `seq` falls in `[start, start + size)` modulo 4096.
pub fn is_in_window(seq: u16, start: u16, size: u16) -> bool {
    distance(start, seq) < size
}

/// Reference point used to order sequence controls without wrap ambiguity:
/// the sequence number half a space after the window start.
pub fn end_of_window_reference(start: u16) -> u16 {
    (start + SEQNO_SPACE_HALF_SIZE - 1) % SEQNO_SPACE_SIZE
}

/// Map a sequence control (sequence << 4 | fragment) onto a monotone integer
/// relative to `end_sequence`. Sequence numbers just after `end_sequence`
/// map lowest.
pub fn map_seq_control(seq_control: u16, end_sequence: u16) -> u32 {
    let seq = (seq_control >> 4) & 0x0fff;
    let position = (u32::from(SEQNO_SPACE_SIZE) - (u32::from(end_sequence) + 1) + u32::from(seq)) % u32::from(SEQNO_SPACE_SIZE);
    position * 16 + u32::from(seq_control & 0x000f)
}

/// Sequence number `count` positions before `seq`.
pub fn sub(seq: u16, count: u16) -> u16 {
    (seq + SEQNO_SPACE_SIZE - count % SEQNO_SPACE_SIZE) % SEQNO_SPACE_SIZE
}

pub fn add(seq: u16, count: u16) -> u16 {
    (seq + count % SEQNO_SPACE_SIZE) % SEQNO_SPACE_SIZE
}
