//! Rate/station manager interface.

use crate::frame::{MacAddress, MacHeader};
use crate::phy::{ModulationClass, TxVector};

/// Per-destination transmit-vector selection and link feedback.
///
/// Feedback hooks default to no-ops so simple managers only implement the
/// vector selection.
pub trait StationManager {
    fn data_tx_vector(&self, header: &MacHeader) -> TxVector;

    fn rts_tx_vector(&self, header: &MacHeader) -> TxVector;

    /// DMG control mode vector (MCS 0), used for DMG CTS and short SSW.
    fn control_tx_vector(&self) -> TxVector;

    fn cts_tx_vector(&self, to: MacAddress, rts_tx_vector: &TxVector) -> TxVector;

    fn ack_tx_vector(&self, to: MacAddress, data_tx_vector: &TxVector) -> TxVector;

    fn block_ack_tx_vector(&self, to: MacAddress, data_tx_vector: &TxVector) -> TxVector;

    /// Largest A-MPDU the receiver accepts for `tid` with `class`. Zero disables aggregation.
    fn max_ampdu_size(&self, to: MacAddress, tid: u8, class: ModulationClass) -> u32;

    fn rifs_permitted(&self) -> bool {
        false
    }

    fn need_cts_to_self(&self, _data_tx_vector: &TxVector) -> bool {
        false
    }

    fn edmg_supported(&self) -> bool {
        false
    }

    fn report_rx_ok(&mut self, _from: MacAddress, _header: &MacHeader) {}

    fn report_rts_ok(&mut self, _to: MacAddress, _header: &MacHeader) {}

    fn report_rts_failed(&mut self, _to: MacAddress, _header: &MacHeader) {}

    fn report_data_ok(&mut self, _to: MacAddress, _header: &MacHeader) {}

    /// Forget per-station state (called on channel switch).
    fn reset(&mut self) {}
}
