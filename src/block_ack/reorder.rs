//! Per-agreement receive reordering.
//!
//! MPDUs received under a Block-Ack agreement are held sorted by sequence
//! control until every earlier sequence number has been delivered or given
//! up on. All delivery happens through the returned vectors, in order.

use super::agreement::BlockAckAgreement;
use super::cache::BlockAckCache;
use super::seq;
use crate::error::Result;
use crate::frame::{BlockAck, BlockAckVariant, Mpdu};

#[derive(Debug, Clone)]
pub struct ReorderBuffer {
    agreement: BlockAckAgreement,
    /// Buffered MPDUs sorted by mapped sequence control.
    buffered: Vec<Mpdu>,
    cache: BlockAckCache,
}

impl ReorderBuffer {
    pub fn new(agreement: BlockAckAgreement) -> Self {
        let cache = BlockAckCache::new(agreement.starting_sequence(), agreement.buffer_size());
        Self {
            agreement,
            buffered: Vec::new(),
            cache,
        }
    }

    pub fn agreement(&self) -> &BlockAckAgreement {
        &self.agreement
    }

    pub fn cache(&self) -> &BlockAckCache {
        &self.cache
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Sequence numbers currently held, in buffer order.
    pub fn buffered_sequences(&self) -> Vec<u16> {
        self.buffered.iter().map(|m| m.header.sequence).collect()
    }

    fn mapped(&self, seq_control: u16) -> u32 {
        let end = seq::end_of_window_reference(self.agreement.starting_sequence());
        seq::map_seq_control(seq_control, end)
    }

    /// Insert in sequence-control order and mark the cache.
    /// Returns false for a duplicate of a frame already buffered.
    fn store(&mut self, mpdu: Mpdu) -> bool {
        let control = mpdu.header.sequence_control();
        if self.buffered.iter().any(|m| m.header.sequence_control() == control) {
            log::debug!("duplicate seq={} from {} ignored", mpdu.header.sequence, self.agreement.peer());
            return false;
        }
        let key = self.mapped(control);
        let position = self.buffered.partition_point(|m| self.mapped(m.header.sequence_control()) < key);
        self.cache.update_with_mpdu(mpdu.header.sequence);
        self.buffered.insert(position, mpdu);
        true
    }

    /// Admit an MPDU received under this agreement and return the frames that
    /// became deliverable, in order.
    ///
    /// Stale frames are dropped. A frame beyond the window drags the window
    /// start forward, forcing out everything below the new start.
    pub fn admit(&mut self, mpdu: Mpdu) -> Vec<Mpdu> {
        let sequence = mpdu.header.sequence;
        let start = self.agreement.starting_sequence();
        if seq::is_old_packet(start, sequence) {
            log::debug!("stale seq={} (window start {}) from {}", sequence, start, self.agreement.peer());
            return Vec::new();
        }
        self.store(mpdu);

        let mut delivered = Vec::new();
        let buffer_size = self.agreement.buffer_size();
        if !seq::is_in_window(sequence, start, buffer_size) {
            let new_start = seq::sub(sequence, buffer_size - 1);
            log::debug!("seq={} beyond window, start {} -> {}", sequence, start, new_start);
            self.agreement.set_starting_sequence(new_start);
            delivered.extend(self.flush_smaller_than(self.agreement.starting_sequence_control()));
        }
        delivered.extend(self.flush_contiguous_prefix());
        delivered
    }

    /// Release every buffered frame whose sequence control sorts below
    /// `seq_control`. Sequence numbers whose fragments are incomplete are
    /// discarded.
    pub fn flush_smaller_than(&mut self, seq_control: u16) -> Vec<Mpdu> {
        let limit = self.mapped(seq_control);
        let split = self.buffered.partition_point(|m| self.mapped(m.header.sequence_control()) < limit);
        let below: Vec<Mpdu> = self.buffered.drain(..split).collect();

        let mut delivered = Vec::with_capacity(below.len());
        let mut pending: Vec<Mpdu> = Vec::new();
        for mpdu in below {
            let continues = pending
                .last()
                .is_some_and(|prev| prev.header.sequence == mpdu.header.sequence && prev.header.fragment + 1 == mpdu.header.fragment);
            if !continues {
                if !pending.is_empty() {
                    log::debug!("dropping incomplete fragments of seq={}", pending[0].header.sequence);
                }
                pending.clear();
                if mpdu.header.fragment != 0 {
                    continue;
                }
            }
            let complete = !mpdu.header.more_fragments;
            pending.push(mpdu);
            if complete {
                delivered.append(&mut pending);
            }
        }
        delivered
    }

    /// Release frames from the window start up to the first gap and advance
    /// the window start past them.
    pub fn flush_contiguous_prefix(&mut self) -> Vec<Mpdu> {
        let mut guard = self.agreement.starting_sequence_control();
        let mut committed_guard = guard;
        let mut complete_until = 0;
        for (i, mpdu) in self.buffered.iter().enumerate() {
            if mpdu.header.sequence_control() != guard {
                break;
            }
            if mpdu.header.more_fragments {
                guard = guard.wrapping_add(1);
            } else {
                guard = guard.wrapping_add(16) & 0xfff0;
                committed_guard = guard;
                complete_until = i + 1;
            }
        }
        self.agreement.set_starting_sequence_control(committed_guard);
        self.buffered.drain(..complete_until).collect()
    }

    /// Apply an explicit BlockAckReq: move the window start to the request's
    /// starting sequence when it is not stale and release what that frees.
    pub fn handle_block_ack_request(&mut self, starting_sequence: u16) -> Vec<Mpdu> {
        if seq::is_old_packet(self.agreement.starting_sequence(), starting_sequence) {
            log::debug!("stale BlockAckReq start {} ignored", starting_sequence);
            return Vec::new();
        }
        self.agreement.set_starting_sequence(starting_sequence);
        let mut delivered = self.flush_smaller_than(self.agreement.starting_sequence_control());
        delivered.extend(self.flush_contiguous_prefix());
        delivered
    }

    pub fn update_cache_with_block_ack_req(&mut self, starting_sequence: u16) {
        self.cache.update_with_block_ack_req(starting_sequence);
    }

    /// BlockAck answering a request that starts at `starting_sequence`.
    pub fn block_ack(&self, starting_sequence: u16, variant: BlockAckVariant) -> Result<BlockAck> {
        self.cache.block_ack(self.agreement.tid(), starting_sequence, variant)
    }

    /// BlockAck answering the implicit request of an A-MPDU: it starts at the
    /// cache window start.
    pub fn implicit_block_ack(&self, variant: BlockAckVariant) -> Result<BlockAck> {
        self.block_ack(self.cache.win_start(), variant)
    }

    /// Release everything still deliverable before the agreement is torn down.
    pub fn flush_for_teardown(&mut self) -> Vec<Mpdu> {
        let mut delivered = self.flush_smaller_than(self.agreement.starting_sequence_control());
        delivered.extend(self.flush_contiguous_prefix());
        delivered
    }
}
