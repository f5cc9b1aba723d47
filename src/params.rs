use embassy_time::Duration;

use crate::frame::BlockAckVariant;

/// Acknowledgment expected for a transmitted PSDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckRequirement {
    #[default]
    None,
    Normal,
    BlockAck(BlockAckVariant),
    /// No immediate response: a BlockAckReq follows the data.
    BlockAckRequest(BlockAckVariant),
}

/// Per-exchange transmission parameters chosen by the exchange owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxParams {
    pub ack: AckRequirement,
    pub must_send_rts: bool,
    /// Size of the fragment that follows this one, when fragmenting.
    pub next_packet_size: Option<u32>,
    /// Explicit Duration/ID value overriding the computed one.
    pub duration_id: Option<Duration>,
}

impl TxParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_normal_ack(mut self) -> Self {
        self.ack = AckRequirement::Normal;
        self
    }

    pub fn with_block_ack(mut self, variant: BlockAckVariant) -> Self {
        self.ack = AckRequirement::BlockAck(variant);
        self
    }

    pub fn with_block_ack_request(mut self, variant: BlockAckVariant) -> Self {
        self.ack = AckRequirement::BlockAckRequest(variant);
        self
    }

    pub fn with_rts(mut self) -> Self {
        self.must_send_rts = true;
        self
    }

    pub fn with_next_packet(mut self, size: u32) -> Self {
        self.next_packet_size = Some(size);
        self
    }

    pub fn with_duration_id(mut self, duration: Duration) -> Self {
        self.duration_id = Some(duration);
        self
    }

    pub fn must_wait_normal_ack(&self) -> bool {
        self.ack == AckRequirement::Normal
    }

    pub fn must_wait_block_ack(&self) -> bool {
        matches!(self.ack, AckRequirement::BlockAck(_))
    }

    pub fn must_send_block_ack_request(&self) -> bool {
        matches!(self.ack, AckRequirement::BlockAckRequest(_))
    }

    pub fn has_next_packet(&self) -> bool {
        self.next_packet_size.is_some()
    }
}
