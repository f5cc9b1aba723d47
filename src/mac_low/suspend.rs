//! Suspending an exchange at the end of an allocation and resuming it when
//! the same allocation comes around again.

use embassy_time::Duration;

use super::{MacLow, TimerKind, TransmissionContext};
use crate::allocation::{AllocationId, AllocationManager, SavedTransmission};
use crate::error::Result;
use crate::txop::{ExchangeOwner, TxopId};

impl MacLow {
    /// Enter allocation `id`. Returns whether a suspended transmission was
    /// restored for it.
    pub fn restore_allocation_parameters(&mut self, id: AllocationId) -> bool {
        self.allocations.restore(id)
    }

    /// Retry the transmission restored for the current allocation if it fits
    /// in `available`. Otherwise it stays suspended until the next visit.
    pub fn resume_transmission(&mut self, available: Duration, owner: ExchangeOwner) -> Result<()> {
        let saved = self.allocations.begin_resume()?;
        self.current = Some(TransmissionContext {
            psdu: saved.psdu,
            params: saved.params,
            tx_vector: saved.tx_vector,
        });

        let needed = self.transaction_time()?;
        if needed > available {
            log::debug!(
                "suspended transmission needs {} us, {} us left in allocation {}",
                needed.as_micros(),
                available.as_micros(),
                self.allocations.current_id()
            );
            self.allocations.suspend();
            // stays with this owner if the allocation ends first
            self.owner = Some(owner);
            return Ok(());
        }

        log::debug!("resuming transmission in allocation {}", self.allocations.current_id());
        self.cancel_all_events();
        self.owner = Some(owner);
        let must_send_rts = self.current.as_ref().is_some_and(|c| c.params.must_send_rts);
        if must_send_rts { self.send_rts_for_packet() } else { self.send_data_packet() }
    }

    /// The allocation ended: pre-empt the exchange and keep an unfinished QoS
    /// data transmission for the next visit of this allocation.
    pub fn end_allocation_period(&mut self) {
        let owner = self.owner.map(|o| o.id);
        self.cancel_all_events();

        let saved = self
            .current
            .take()
            .filter(|ctx| ctx.psdu.header().is_some_and(|h| h.is_qos_data()))
            .map(|ctx| SavedTransmission {
                psdu: ctx.psdu,
                params: ctx.params,
                tx_vector: ctx.tx_vector,
                owner,
            });
        self.allocations.store(saved);

        self.timers.cancel(TimerKind::NavResetCtsMissed);
        let now = self.now();
        self.nav.reset(now, Duration::from_ticks(0));
        self.owner = None;
    }

    pub fn is_transmission_suspended(&self) -> bool {
        self.allocations.is_transmission_suspended()
    }

    pub fn is_current_allocation_empty(&self) -> bool {
        self.allocations.is_current_allocation_empty()
    }

    pub fn completed_suspended_psdu_transmission(&self, owner: TxopId) -> bool {
        self.allocations.completed_suspended_psdu_transmission(owner)
    }

    pub fn allocations(&self) -> &AllocationManager {
        &self.allocations
    }
}
