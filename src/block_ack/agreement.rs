use embassy_time::Duration;

use super::seq;
use crate::frame::MacAddress;

/// Block-Ack timeout values are expressed in units of 1024 µs.
pub const BLOCK_ACK_TIMEOUT_UNIT_US: u64 = 1024;

/// Fields of an ADDBA Response that set up a receive agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddBaResponse {
    pub tid: u8,
    pub immediate_block_ack: bool,
    pub amsdu_supported: bool,
    /// Buffer size field as carried in the frame (one less than the window).
    pub buffer_size: u16,
    /// Inactivity timeout in 1024 µs units; zero disables it.
    pub timeout: u16,
}

/// Recipient side of a Block-Ack agreement with one (originator, TID).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAckAgreement {
    peer: MacAddress,
    tid: u8,
    buffer_size: u16,
    timeout: u16,
    immediate: bool,
    amsdu_supported: bool,
    /// Window start as a sequence control (sequence << 4 | fragment).
    starting_sequence_control: u16,
}

impl BlockAckAgreement {
    pub fn from_response(peer: MacAddress, response: &AddBaResponse, starting_sequence: u16) -> Self {
        Self {
            peer,
            tid: response.tid,
            buffer_size: response.buffer_size.saturating_add(1),
            timeout: response.timeout,
            immediate: response.immediate_block_ack,
            amsdu_supported: response.amsdu_supported,
            starting_sequence_control: (starting_sequence % seq::SEQNO_SPACE_SIZE) << 4,
        }
    }

    pub fn peer(&self) -> MacAddress {
        self.peer
    }

    pub fn tid(&self) -> u8 {
        self.tid
    }

    pub fn buffer_size(&self) -> u16 {
        self.buffer_size
    }

    pub fn is_immediate(&self) -> bool {
        self.immediate
    }

    pub fn is_amsdu_supported(&self) -> bool {
        self.amsdu_supported
    }

    pub fn starting_sequence(&self) -> u16 {
        (self.starting_sequence_control >> 4) & 0x0fff
    }

    pub fn starting_sequence_control(&self) -> u16 {
        self.starting_sequence_control
    }

    pub fn set_starting_sequence(&mut self, sequence: u16) {
        self.starting_sequence_control = (sequence % seq::SEQNO_SPACE_SIZE) << 4;
    }

    pub fn set_starting_sequence_control(&mut self, sequence_control: u16) {
        self.starting_sequence_control = sequence_control;
    }

    /// Last sequence number inside the window.
    pub fn win_end(&self) -> u16 {
        seq::add(self.starting_sequence(), self.buffer_size - 1)
    }

    /// Inactivity timeout, `None` when disabled.
    pub fn inactivity_timeout(&self) -> Option<Duration> {
        (self.timeout != 0).then(|| Duration::from_micros(BLOCK_ACK_TIMEOUT_UNIT_US * u64::from(self.timeout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::PEER;

    fn response(buffer_size: u16, timeout: u16) -> AddBaResponse {
        AddBaResponse {
            tid: 5,
            immediate_block_ack: true,
            amsdu_supported: false,
            buffer_size,
            timeout,
        }
    }

    #[test]
    fn window_is_one_more_than_the_advertised_buffer() {
        let agreement = BlockAckAgreement::from_response(PEER, &response(99, 0), 4090);
        assert_eq!(agreement.buffer_size(), 100);
        assert_eq!(agreement.starting_sequence(), 4090);
        assert_eq!(agreement.win_end(), 93);
        assert!(agreement.inactivity_timeout().is_none());
    }

    #[test]
    fn largest_advertised_buffer_does_not_overflow() {
        let agreement = BlockAckAgreement::from_response(PEER, &response(u16::MAX, 2), 4100);
        assert_eq!(agreement.buffer_size(), u16::MAX);
        assert_eq!(agreement.starting_sequence(), 4);
        assert_eq!(agreement.inactivity_timeout(), Some(Duration::from_micros(2048)));
    }
}
