//! Directional-antenna collaborator and beamforming training phases.

use crate::frame::MacAddress;

/// Beacon interval access periods of a DMG BSS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPeriod {
    /// Beacon transmission interval.
    Bti,
    /// Association beamforming training.
    Abft,
    /// Announcement transmission interval.
    Ati,
    /// Data transfer interval.
    Dti,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationType {
    /// Contention-based access period.
    Cbap,
    ServicePeriod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationRole {
    AccessPoint,
    Station,
    AdHoc,
}

/// Training procedure currently taking priority over data exchange.
///
/// The two procedures are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrainingPhase {
    #[default]
    Idle,
    /// Sector-level sweep.
    SectorSweep,
    /// MIMO beamforming training.
    MimoBft,
}

pub trait Beamforming {
    fn access_period(&self) -> AccessPeriod;

    fn allocation_type(&self) -> AllocationType;

    fn role(&self) -> StationRole;

    /// Association ID of this station, matched against Grant frames.
    fn association_id(&self) -> u8;

    /// Point both the transmit and receive antenna at `peer`.
    fn steer_antenna_toward(&mut self, peer: MacAddress, is_data: bool);

    /// Point only the transmit antenna at `peer`.
    fn steer_tx_antenna_toward(&mut self, peer: MacAddress, is_data: bool);
}
