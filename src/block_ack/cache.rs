//! Receive bitmap used to answer BlockAckReqs and implicit requests.

use super::seq::{self, SEQNO_SPACE_SIZE};
use crate::error::{MacError, Result};
use crate::frame::{BlockAck, BlockAckVariant};

/// Smallest scoreboard kept, whatever the negotiated buffer size.
const MIN_WINDOW_SIZE: u16 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAckCache {
    win_start: u16,
    win_end: u16,
    win_size: u16,
    /// One entry per sequence number. Entries are cleared as they enter the
    /// window, so stale bits outside it are never read.
    bitmap: Vec<bool>,
}

impl BlockAckCache {
    pub fn new(win_start: u16, buffer_size: u16) -> Self {
        let win_size = buffer_size.max(MIN_WINDOW_SIZE);
        let win_start = win_start % SEQNO_SPACE_SIZE;
        Self {
            win_start,
            win_end: seq::add(win_start, win_size - 1),
            win_size,
            bitmap: vec![false; usize::from(SEQNO_SPACE_SIZE)],
        }
    }

    pub fn win_start(&self) -> u16 {
        self.win_start
    }

    pub fn win_end(&self) -> u16 {
        self.win_end
    }

    pub fn win_size(&self) -> u16 {
        self.win_size
    }

    fn is_in_window(&self, sequence: u16) -> bool {
        seq::is_in_window(sequence, self.win_start, self.win_size)
    }

    fn slot(&self, sequence: u16) -> usize {
        usize::from(sequence % SEQNO_SPACE_SIZE)
    }

    /// Clear every slot from `start` to `end` inclusive, modulo 4096.
    fn reset_range(&mut self, start: u16, end: u16) {
        let mut i = start;
        while i != end {
            let slot = self.slot(i);
            self.bitmap[slot] = false;
            i = seq::add(i, 1);
        }
        let slot = self.slot(end);
        self.bitmap[slot] = false;
    }

    /// Record a received MPDU, sliding the window forward if it lies beyond the end.
    pub fn update_with_mpdu(&mut self, sequence: u16) {
        if seq::is_old_packet(self.win_start, sequence) {
            return;
        }
        if !self.is_in_window(sequence) {
            let delta = seq::distance(self.win_end, sequence);
            if delta > 1 {
                self.reset_range(seq::add(self.win_end, 1), seq::sub(sequence, 1));
            }
            self.win_start = seq::add(self.win_start, delta);
            self.win_end = sequence;
        }
        let slot = self.slot(sequence);
        self.bitmap[slot] = true;
    }

    /// Move the window to the starting sequence of a BlockAckReq.
    pub fn update_with_block_ack_req(&mut self, starting_sequence: u16) {
        if seq::is_old_packet(self.win_start, starting_sequence) {
            return;
        }
        if self.is_in_window(starting_sequence) {
            if starting_sequence != self.win_start {
                self.win_start = starting_sequence;
                let new_end = seq::add(self.win_start, self.win_size - 1);
                self.reset_range(seq::add(self.win_end, 1), new_end);
                self.win_end = new_end;
            }
        } else {
            self.win_start = starting_sequence;
            self.win_end = seq::add(self.win_start, self.win_size - 1);
            self.reset_range(self.win_start, self.win_end);
        }
    }

    /// Build a BlockAck of `variant` whose bitmap starts at `starting_sequence`.
    pub fn block_ack(&self, tid: u8, starting_sequence: u16, variant: BlockAckVariant) -> Result<BlockAck> {
        if variant == BlockAckVariant::Basic {
            return Err(MacError::Unsupported("basic block ack bitmap".to_string()));
        }
        let len = variant.bitmap_len();
        let covered = len.min(self.win_size);
        let bitmap = (0..len)
            .map(|offset| {
                let sequence = seq::add(starting_sequence, offset);
                offset < covered && self.bitmap[self.slot(sequence)]
            })
            .collect();
        Ok(BlockAck {
            tid,
            starting_sequence,
            variant,
            bitmap,
        })
    }
}
