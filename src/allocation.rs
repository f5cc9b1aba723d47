//! Saved in-flight transmissions across allocation (service period) boundaries.

use std::collections::HashMap;

use crate::error::{MacError, Result};
use crate::frame::Psdu;
use crate::params::TxParams;
use crate::phy::TxVector;
use crate::txop::TxopId;

pub type AllocationId = u8;

/// Exchange state captured when an allocation ends mid-transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedTransmission {
    pub psdu: Psdu,
    pub params: TxParams,
    pub tx_vector: TxVector,
    pub owner: Option<TxopId>,
}

/// Table of suspended transmissions keyed by allocation id, plus the state of
/// the allocation currently being served.
#[derive(Debug, Default)]
pub struct AllocationManager {
    saved: HashMap<AllocationId, SavedTransmission>,
    current_id: AllocationId,
    /// Transmission restored at the start of the current allocation.
    restored: Option<SavedTransmission>,
    /// Set on restore, cleared once the restored transmission is resumed.
    restored_pending: bool,
    suspended: bool,
}

impl AllocationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_id(&self) -> AllocationId {
        self.current_id
    }

    /// Enter allocation `id` and pick up whatever was saved for it.
    ///
    /// # Returns
    /// * `true` if a suspended transmission was restored
    pub fn restore(&mut self, id: AllocationId) -> bool {
        self.suspended = false;
        self.current_id = id;
        match self.saved.get(&id) {
            Some(saved) => {
                log::debug!("restored allocation {} ({} MPDUs)", id, saved.psdu.n_mpdus());
                self.restored = Some(saved.clone());
                self.restored_pending = true;
                true
            }
            None => {
                log::debug!("nothing stored for allocation {}", id);
                self.restored = None;
                self.restored_pending = false;
                false
            }
        }
    }

    /// Save `transmission` (if any) under the current allocation id and forget
    /// the restored one.
    pub fn store(&mut self, transmission: Option<SavedTransmission>) {
        if let Some(transmission) = transmission {
            log::debug!(
                "suspending {} bytes (seq={}) for allocation {}",
                transmission.psdu.size(),
                transmission.psdu.header().map_or(0, |h| h.sequence),
                self.current_id
            );
            self.saved.insert(self.current_id, transmission);
        }
        self.restored = None;
    }

    /// Hand the restored transmission over for resumption and drop its table entry.
    pub fn begin_resume(&mut self) -> Result<SavedTransmission> {
        let restored = self.restored.clone().ok_or(MacError::NothingToResume(self.current_id))?;
        self.restored_pending = false;
        self.saved.remove(&self.current_id);
        Ok(restored)
    }

    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    pub fn is_transmission_suspended(&self) -> bool {
        self.suspended
    }

    pub fn is_current_allocation_empty(&self) -> bool {
        self.restored.is_none()
    }

    /// False while `owner` still has a restored transmission waiting to be resumed.
    pub fn completed_suspended_psdu_transmission(&self, owner: TxopId) -> bool {
        !(self.restored_pending && self.restored.as_ref().is_some_and(|r| r.owner == Some(owner)))
    }

    pub fn saved(&self, id: AllocationId) -> Option<&SavedTransmission> {
        self.saved.get(&id)
    }

    pub fn saved_len(&self) -> usize {
        self.saved.len()
    }
}
