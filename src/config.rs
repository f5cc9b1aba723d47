//! MAC low-layer configuration.

use anyhow::Context;
use embassy_time::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::frame::MacAddress;

/// Interframe spacings and behaviour switches of one MAC instance.
///
/// All spacings are in microseconds. Defaults are the DMG (802.11ad) values.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MacConfig {
    /// Own MAC address
    pub address: MacAddress,
    pub sifs_us: u64,
    pub slot_us: u64,
    pub pifs_us: u64,
    pub rifs_us: u64,
    /// Short beamforming interframe space
    pub sbifs_us: u64,
    /// Medium beamforming interframe space
    pub mbifs_us: u64,
    /// Long beamforming interframe space
    pub lbifs_us: u64,
    /// Beam refinement protocol interframe space
    pub brifs_us: u64,
    /// Protect data with CTS-to-self when the station manager asks for it
    pub cts_to_self_supported: bool,
    /// Deliver data frames addressed to other stations
    pub promiscuous: bool,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            address: MacAddress::default(),
            sifs_us: 3,
            slot_us: 5,
            pifs_us: 8,
            rifs_us: 2,
            sbifs_us: 1,
            mbifs_us: 9,
            lbifs_us: 18,
            brifs_us: 40,
            cts_to_self_supported: false,
            promiscuous: false,
        }
    }
}

impl MacConfig {
    /// Load a configuration file.
    ///
    /// Files ending in `.json` are parsed as JSON, everything else as TOML.
    /// Missing keys take their default value.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read MAC config file: {}", path.display()))?;

        let config: MacConfig = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content).context("Invalid JSON format")?
        } else {
            toml::from_str(&content).context("Invalid TOML format")?
        };

        config.validate().map_err(|e| anyhow::anyhow!("Invalid MAC config {}: {}", path.display(), e))?;
        Ok(config)
    }

    /// Check the interframe spacings are usable.
    ///
    /// # Returns
    /// * `Ok(())` if the configuration is consistent
    /// * `Err(String)` describing the first problem found
    pub fn validate(&self) -> Result<(), String> {
        if self.sifs_us == 0 {
            return Err("sifs-us must be greater than zero".to_string());
        }
        if self.slot_us == 0 {
            return Err("slot-us must be greater than zero".to_string());
        }
        if self.pifs_us < self.sifs_us {
            return Err(format!("pifs-us ({}) must not be shorter than sifs-us ({})", self.pifs_us, self.sifs_us));
        }
        if self.address.is_group() {
            return Err(format!("address {} is a group address", self.address));
        }
        Ok(())
    }

    pub fn with_address(mut self, address: MacAddress) -> Self {
        self.address = address;
        self
    }

    pub fn sifs(&self) -> Duration {
        Duration::from_micros(self.sifs_us)
    }

    pub fn slot(&self) -> Duration {
        Duration::from_micros(self.slot_us)
    }

    pub fn pifs(&self) -> Duration {
        Duration::from_micros(self.pifs_us)
    }

    pub fn rifs(&self) -> Duration {
        Duration::from_micros(self.rifs_us)
    }

    pub fn sbifs(&self) -> Duration {
        Duration::from_micros(self.sbifs_us)
    }

    pub fn mbifs(&self) -> Duration {
        Duration::from_micros(self.mbifs_us)
    }

    pub fn lbifs(&self) -> Duration {
        Duration::from_micros(self.lbifs_us)
    }

    pub fn brifs(&self) -> Duration {
        Duration::from_micros(self.brifs_us)
    }
}
