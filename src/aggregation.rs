//! A-MPDU framing and aggregation under size and airtime budgets.

use embassy_time::Duration;

use crate::block_ack::seq;
use crate::frame::{MacAddress, Mpdu};
use crate::phy::{ModulationClass, Phy, TxVector};
use crate::station::StationManager;
use crate::txop::{AgreementWindow, FrameQueue};

/// Each A-MPDU subframe starts with a 4-byte delimiter.
pub const AMPDU_DELIMITER_SIZE: u32 = 4;

/// Size of an A-MPDU of `ampdu_size` bytes once an MPDU of `mpdu_size` bytes
/// is appended: the previous subframe is padded to a 4-byte boundary, then a
/// delimiter and the MPDU follow.
pub fn size_if_aggregated(mpdu_size: u32, ampdu_size: u32) -> u32 {
    let padding = (4 - ampdu_size % 4) % 4;
    ampdu_size + padding + AMPDU_DELIMITER_SIZE + mpdu_size
}

/// Checks and builds A-MPDUs for one transmission.
///
/// `ppdu_duration_limit` is the airtime left for the PPDU once protection and
/// response overhead are taken out of the owner's budget. `None` means the
/// owner imposes no limit.
pub struct MpduAggregator<'a> {
    phy: &'a dyn Phy,
    station: &'a dyn StationManager,
    tx_vector: TxVector,
    ppdu_duration_limit: Option<Duration>,
}

impl<'a> MpduAggregator<'a> {
    pub fn new(phy: &'a dyn Phy, station: &'a dyn StationManager, tx_vector: TxVector, ppdu_duration_limit: Option<Duration>) -> Self {
        Self {
            phy,
            station,
            tx_vector,
            ppdu_duration_limit,
        }
    }

    /// Whether an MPDU of `mpdu_size` bytes can join an A-MPDU currently
    /// `ampdu_size` bytes long (zero when the MPDU would be sent alone).
    ///
    /// # Returns
    /// * `false` for a zero time budget, or when the resulting PPDU payload
    ///   exceeds the receiver's max A-MPDU size, the duration limit or the
    ///   preamble's maximum PPDU duration
    pub fn is_within_size_and_time_limits(&self, mpdu_size: u32, receiver: MacAddress, tid: u8, ampdu_size: u32) -> bool {
        if self.ppdu_duration_limit.is_some_and(|limit| limit == Duration::from_ticks(0)) {
            log::debug!("no time left for a PPDU");
            return false;
        }

        let class = self.tx_vector.modulation_class();
        let max_ampdu_size = self.station.max_ampdu_size(receiver, tid, class);

        let ppdu_payload_size = if ampdu_size > 0 || class >= ModulationClass::Vht {
            size_if_aggregated(mpdu_size, ampdu_size)
        } else {
            mpdu_size
        };

        if max_ampdu_size > 0 && ppdu_payload_size > max_ampdu_size {
            log::debug!("{} bytes exceed max A-MPDU size {} of {}", ppdu_payload_size, max_ampdu_size, receiver);
            return false;
        }

        let tx_time = self.phy.tx_duration(ppdu_payload_size, &self.tx_vector);
        if self.ppdu_duration_limit.is_some_and(|limit| tx_time > limit) {
            log::debug!("{} us airtime exceeds the PPDU duration limit", tx_time.as_micros());
            return false;
        }
        if self.tx_vector.preamble.max_ppdu_duration().is_some_and(|max| tx_time > max) {
            log::debug!("{} us airtime exceeds the maximum PPDU duration", tx_time.as_micros());
            return false;
        }
        true
    }

    /// Aggregate `first` with the frames queued behind it for the same
    /// receiver and TID.
    ///
    /// Frames are only added while an originator agreement exists, their
    /// sequence number stays inside the agreement's transmit window, and the
    /// growing A-MPDU still fits the limits. Frames that do not fit stay
    /// queued.
    ///
    /// # Returns
    /// The MPDUs to send, `first` included. A single element means no
    /// aggregation took place.
    pub fn next_ampdu(&self, first: Mpdu, queue: &mut dyn FrameQueue) -> Vec<Mpdu> {
        let receiver = first.header.addr1;
        let Some(tid) = first.header.qos_tid() else {
            return vec![first];
        };
        let Some(AgreementWindow {
            starting_sequence: window_start,
            buffer_size: window,
        }) = queue.agreement_window(receiver, tid)
        else {
            return vec![first];
        };
        if self.station.max_ampdu_size(receiver, tid, self.tx_vector.modulation_class()) == 0 {
            return vec![first];
        }

        let mut ampdu_size = size_if_aggregated(first.size(), 0);
        let mut mpdus = vec![first];
        while let Some(next) = queue.peek_next(receiver, tid) {
            if !seq::is_in_window(next.header.sequence, window_start, window) {
                log::trace!("seq={} outside the agreement window starting at {}", next.header.sequence, window_start);
                break;
            }
            if !self.is_within_size_and_time_limits(next.size(), receiver, tid, ampdu_size) {
                break;
            }
            let Some(next) = queue.dequeue_next(receiver, tid) else {
                break;
            };
            ampdu_size = size_if_aggregated(next.size(), ampdu_size);
            mpdus.push(next);
        }
        if mpdus.len() > 1 {
            log::debug!("aggregated {} MPDUs ({} bytes) for {}", mpdus.len(), ampdu_size, receiver);
        }
        mpdus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::PreambleType;
    use crate::test_support::{FakePhy, FakeQueue, FakeStation, PEER, qos_mpdu};

    #[test]
    fn aggregated_size_pads_previous_subframe() {
        assert_eq!(size_if_aggregated(100, 0), 104);
        assert_eq!(size_if_aggregated(100, 104), 208);
        assert_eq!(size_if_aggregated(10, 105), 108 + 4 + 10);
        assert_eq!(size_if_aggregated(10, 107), 108 + 4 + 10);
    }

    #[test]
    fn zero_budget_never_fits() {
        let phy = FakePhy::new();
        let station = FakeStation::new();
        let aggregator = MpduAggregator::new(&phy, &station, station.data_vector(), Some(Duration::from_ticks(0)));
        assert!(!aggregator.is_within_size_and_time_limits(10, PEER, 0, 0));
    }

    #[test]
    fn limits_apply_size_duration_and_preamble_bounds() {
        let phy = FakePhy::new();
        let mut station = FakeStation::new();
        station.set_max_ampdu_size(2000);
        let unlimited = MpduAggregator::new(&phy, &station, station.data_vector(), None);
        assert!(unlimited.is_within_size_and_time_limits(1500, PEER, 0, 0));
        // 1500 + padding + delimiter + 1500 is above 2000
        assert!(!unlimited.is_within_size_and_time_limits(1500, PEER, 0, 1500));

        // 1031 bytes at 100 bytes/us plus the 1 us preamble is 12 us
        let tight = MpduAggregator::new(&phy, &station, station.data_vector(), Some(Duration::from_micros(11)));
        assert!(!tight.is_within_size_and_time_limits(1031, PEER, 0, 0));
        let enough = MpduAggregator::new(&phy, &station, station.data_vector(), Some(Duration::from_micros(12)));
        assert!(enough.is_within_size_and_time_limits(1031, PEER, 0, 0));

        let mut vht = station.data_vector();
        vht.mode.class = ModulationClass::Vht;
        vht.preamble = PreambleType::Vht;
        station.set_max_ampdu_size(0);
        let vht = MpduAggregator::new(&phy, &station, vht, None);
        // 600 000 bytes at 100 bytes/us is longer than 5484 us
        assert!(!vht.is_within_size_and_time_limits(600_000, PEER, 0, 0));
        assert!(vht.is_within_size_and_time_limits(1000, PEER, 0, 0));
    }

    #[test]
    fn aggregation_stops_at_window_edge_and_leaves_rest_queued() {
        let phy = FakePhy::new();
        let station = FakeStation::new();
        let mut queue = FakeQueue::new();
        for s in 10..16 {
            queue.push(qos_mpdu(s, 1000));
        }
        queue.set_agreement(PEER, 0, 10, 4);

        let first = queue.dequeue_peeked().unwrap();
        let aggregator = MpduAggregator::new(&phy, &station, station.data_vector(), None);
        let ampdu = aggregator.next_ampdu(first, &mut queue);
        let seqs: Vec<u16> = ampdu.iter().map(|m| m.header.sequence).collect();
        assert_eq!(seqs, vec![10, 11, 12, 13]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn window_starts_at_oldest_unacknowledged_frame() {
        let phy = FakePhy::new();
        let station = FakeStation::new();
        let mut queue = FakeQueue::new();
        // 4094 is still waiting for its BlockAck: the window is 4094..=3
        for s in [0, 1, 2, 3, 4, 5] {
            queue.push(qos_mpdu(s, 1000));
        }
        queue.set_agreement(PEER, 0, 4094, 6);

        let first = queue.dequeue_peeked().unwrap();
        let aggregator = MpduAggregator::new(&phy, &station, station.data_vector(), None);
        let ampdu = aggregator.next_ampdu(first, &mut queue);
        let seqs: Vec<u16> = ampdu.iter().map(|m| m.header.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn aggregation_respects_duration_budget() {
        let phy = FakePhy::new();
        let station = FakeStation::new();
        let mut queue = FakeQueue::new();
        for s in 0..8 {
            queue.push(qos_mpdu(s, 1000));
        }
        queue.set_agreement(PEER, 0, 0, 64);

        // each 1030-byte MPDU adds about 10.4 us at 100 bytes/us
        let first = queue.dequeue_peeked().unwrap();
        let aggregator = MpduAggregator::new(&phy, &station, station.data_vector(), Some(Duration::from_micros(33)));
        let ampdu = aggregator.next_ampdu(first, &mut queue);
        assert_eq!(ampdu.len(), 3);
        assert_eq!(queue.len(), 5);
    }

    #[test]
    fn no_agreement_means_single_mpdu() {
        let phy = FakePhy::new();
        let station = FakeStation::new();
        let mut queue = FakeQueue::new();
        queue.push(qos_mpdu(0, 100));
        queue.push(qos_mpdu(1, 100));
        let first = queue.dequeue_peeked().unwrap();
        let aggregator = MpduAggregator::new(&phy, &station, station.data_vector(), None);
        assert_eq!(aggregator.next_ampdu(first, &mut queue).len(), 1);
        assert_eq!(queue.len(), 1);
    }
}
