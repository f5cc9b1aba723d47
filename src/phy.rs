//! Radio interface consumed by the MAC low layer.
//!
//! The PHY computes airtimes and carries frames; the MAC never derives a
//! duration formula itself.

use embassy_time::Duration;

use crate::frame::Psdu;

/// Modulation classes, ordered the way size rules compare them
/// (everything from `Vht` upward frames single MPDUs as S-MPDUs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModulationClass {
    Dsss,
    DmgCtrl,
    DmgSc,
    DmgOfdm,
    Ofdm,
    Ht,
    Vht,
    He,
    EdmgCtrl,
    EdmgSc,
    EdmgOfdm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreambleType {
    Long,
    Short,
    HtMixed,
    Vht,
    He,
    Dmg,
    Edmg,
}

impl PreambleType {
    /// aPPDUMaxTime for this preamble, when the standard defines one.
    pub fn max_ppdu_duration(&self) -> Option<Duration> {
        match self {
            PreambleType::HtMixed => Some(Duration::from_millis(10)),
            PreambleType::Vht | PreambleType::He => Some(Duration::from_micros(5484)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WifiMode {
    pub class: ModulationClass,
    pub mcs: u8,
}

impl WifiMode {
    pub fn new(class: ModulationClass, mcs: u8) -> Self {
        Self { class, mcs }
    }
}

/// Parameters the PHY needs to transmit one PPDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxVector {
    pub mode: WifiMode,
    pub preamble: PreambleType,
    /// Set when the PSDU is an A-MPDU or S-MPDU.
    pub aggregation: bool,
}

impl TxVector {
    pub fn new(mode: WifiMode, preamble: PreambleType) -> Self {
        Self {
            mode,
            preamble,
            aggregation: false,
        }
    }

    pub fn modulation_class(&self) -> ModulationClass {
        self.mode.class
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhyState {
    Idle,
    CcaBusy,
    Tx,
    Rx,
    Switching,
    Sleep,
    Off,
}

pub trait Phy {
    fn state(&self) -> PhyState;

    /// Airtime of a PSDU of `size` bytes sent with `tx_vector`, preamble included.
    fn tx_duration(&self, size: u32, tx_vector: &TxVector) -> Duration;

    /// Airtime of the preamble and PHY header alone (aRxPHYStartDelay).
    fn preamble_and_header_duration(&self, tx_vector: &TxVector) -> Duration;

    /// Start transmitting. The PHY is in `PhyState::Tx` when this returns,
    /// unless it is switched off.
    fn send(&mut self, psdu: Psdu, tx_vector: TxVector);
}
