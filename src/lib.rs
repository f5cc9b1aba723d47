//! Low MAC layer of a directional multi-gigabit (802.11ad/ay) station.
//!
//! [`MacLow`] runs frame exchanges (RTS/CTS, data, Ack and BlockAck), keeps
//! the NAV, reorders frames received under Block-Ack agreements and holds
//! unfinished exchanges across allocation boundaries. Time is virtual: see
//! [`time_driver`].

pub mod aggregation;
pub mod allocation;
pub mod beamforming;
pub mod block_ack;
pub mod config;
pub mod error;
pub mod events;
pub mod frame;
pub mod listener;
pub mod mac_low;
pub mod nav;
pub mod params;
pub mod phy;
pub mod station;
pub mod time_driver;
pub mod timer;
pub mod txop;

#[cfg(test)]
mod test_support;

pub use config::MacConfig;
pub use error::{MacError, Result};
pub use events::{MacEvent, TxopEvent};
pub use frame::{FrameKind, MacAddress, MacHeader, Mpdu, Psdu};
pub use listener::{ChannelAccessListener, ChannelAccessNotification, ListenerRegistry};
pub use mac_low::{MacLow, TimerKind};
pub use params::TxParams;
pub use txop::{AgreementWindow, ExchangeOwner, FrameQueue, TxopId};

use env_logger::Builder;
use log::LevelFilter;

/// Route `log` output to stderr at `level`. Later calls are no-ops, so every
/// test may call it.
pub fn init_logging(level: LevelFilter) {
    let _ = Builder::new().filter_level(level).is_test(true).try_init();
}
