//! Exchange ownership: the channel-access function that started an exchange
//! and the queue it draws frames from.
//!
//! The MAC never holds a reference to its owner. It keeps a `TxopId` handle
//! and reports outcomes as `MacEvent::Txop` events for the driver to route.

use embassy_time::{Duration, Instant};

use crate::frame::{MacAddress, Mpdu};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxopId(pub u32);

/// Snapshot of the owner taken when an exchange starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOwner {
    pub id: TxopId,
    /// Whether the owner is a QoS (EDCA) channel-access function.
    pub qos: bool,
    /// TXOP limit; zero when the owner has none.
    pub txop_limit: Duration,
    /// End of the current TXOP, if one is running.
    pub txop_end: Option<Instant>,
    /// End of the current allocation (service period or CBAP), if bounded.
    pub allocation_end: Option<Instant>,
}

impl ExchangeOwner {
    /// A non-QoS owner without TXOP or allocation bounds.
    pub fn legacy(id: TxopId) -> Self {
        Self {
            id,
            qos: false,
            txop_limit: Duration::from_ticks(0),
            txop_end: None,
            allocation_end: None,
        }
    }

    pub fn qos(id: TxopId) -> Self {
        Self { qos: true, ..Self::legacy(id) }
    }

    pub fn with_txop(mut self, limit: Duration, end: Instant) -> Self {
        self.txop_limit = limit;
        self.txop_end = Some(end);
        self
    }

    pub fn with_allocation_end(mut self, end: Instant) -> Self {
        self.allocation_end = Some(end);
        self
    }

    pub fn has_txop_limit(&self) -> bool {
        self.txop_limit > Duration::from_ticks(0)
    }

    /// Time left for transmission: the allocation bound when there is one,
    /// otherwise the TXOP bound. `None` means unbounded.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.allocation_end.or(self.txop_end).map(|end| end.saturating_duration_since(now))
    }

    /// Whether the owner's time budget limits the PPDU duration.
    pub fn bounds_ppdu_duration(&self, now: Instant) -> bool {
        self.has_txop_limit() || self.allocation_end.is_some_and(|end| end > now)
    }
}

/// Transmit window of an originator-side BlockAck agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgreementWindow {
    /// First sequence number the recipient has not acknowledged yet.
    pub starting_sequence: u16,
    pub buffer_size: u16,
}

/// Queue of the exchange owner, used to dequeue and aggregate frames.
pub trait FrameQueue {
    /// Frame the owner peeked (without dequeuing) for this transmission.
    fn peeked_frame(&self) -> Option<&Mpdu>;

    /// Remove the peeked frame from the queue.
    fn dequeue_peeked(&mut self) -> Option<Mpdu>;

    /// Next frame waiting for `receiver`/`tid`, left in place.
    fn peek_next(&self, receiver: MacAddress, tid: u8) -> Option<&Mpdu>;

    /// Remove the frame `peek_next` returns.
    fn dequeue_next(&mut self, receiver: MacAddress, tid: u8) -> Option<Mpdu>;

    /// Window of the established originator-side BlockAck agreement.
    fn agreement_window(&self, receiver: MacAddress, tid: u8) -> Option<AgreementWindow>;
}
