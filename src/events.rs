//! Outcomes produced by the MAC low layer.
//!
//! Events are queued in order and drained by whoever drives the simulation
//! (`MacLow::take_events`).

use crate::frame::{BlockAck, MacAddress, MacHeader, Mpdu, Psdu};
use crate::txop::TxopId;

/// Notifications routed to the owner of an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxopEvent {
    /// No CTS arrived. Carries the frames that were protected by the RTS.
    MissedCts(Psdu),
    GotAck,
    MissedAck,
    GotBlockAck { block_ack: BlockAck, from: MacAddress },
    MissedBlockAck { n_mpdus: usize },
    StartNextFragment,
    StartNextPacket,
    TerminateTxop,
    /// A frame that expects no response finished transmitting.
    EndTxNoAck,
    /// The exchange was pre-empted while one of its timers was running.
    Cancel,
    /// A BlockAckReq must follow the data just sent.
    ScheduleBar { receiver: MacAddress, tid: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacEvent {
    Txop { owner: TxopId, event: TxopEvent },
    /// Frame handed to the upper MAC, in final delivery order.
    Deliver(Mpdu),
    /// A DELBA must be sent for the receive agreement with `originator`.
    SendDelba { originator: MacAddress, tid: u8 },
    /// A QoS MPDU left the MAC (one per MPDU of each transmitted PSDU).
    MpduTransmitted { receiver: MacAddress, tid: u8, sequence: u16 },
    /// Owner-less transmission completed.
    TransmissionOk(MacHeader),
    ShortSswTransmitted,
    ShortSswReceived(Mpdu),
}
