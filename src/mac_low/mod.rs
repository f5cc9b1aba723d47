//! Frame exchange controller of a DMG station.
//!
//! `MacLow` sequences RTS/CTS/Data/Ack/BlockAck exchanges on behalf of the
//! channel-access function that owns each exchange, tracks the NAV, runs the
//! recipient side of Block-Ack agreements and gives beamforming training
//! priority over data. It is a single-threaded discrete-event machine: every
//! timer lives in one `TimerTable` and fires from `process_due_events`, and
//! every outcome is queued as a `MacEvent` for the driver to drain.

mod rx;
mod suspend;
mod tx;

use embassy_time::{Duration, Instant};
use std::collections::{HashMap, VecDeque};

use crate::allocation::AllocationManager;
use crate::beamforming::{Beamforming, TrainingPhase};
use crate::block_ack::{AddBaResponse, BlockAckAgreement, ReorderBuffer};
use crate::config::MacConfig;
use crate::error::Result;
use crate::events::{MacEvent, TxopEvent};
use crate::frame::{BlockAckRequest, MacAddress, Mpdu, Psdu};
use crate::listener::{ChannelAccessNotification, ListenerRegistry};
use crate::nav::Nav;
use crate::params::TxParams;
use crate::phy::{Phy, TxVector};
use crate::station::StationManager;
use crate::time_driver;
use crate::timer::TimerTable;
use crate::txop::{ExchangeOwner, TxopId};

/// Margin added to a PSDU's airtime when a response timeout is pushed back
/// because a reception started.
pub const PSDU_DURATION_SAFEGUARD: Duration = Duration::from_nanos(400);

/// Named timer slots. Each holds at most one pending event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    NormalAckTimeout,
    BlockAckTimeout,
    CtsTimeout,
    SendCts,
    SendAck,
    SendData,
    /// Inter-frame wait before the next fragment or packet of a TXOP.
    WaitIfs,
    EndTxNoAck,
    NavResetCtsMissed,
    BlockAckInactivity(MacAddress, u8),
}

/// Slots cancelled together when an exchange is pre-empted.
const EXCHANGE_TIMERS: [TimerKind; 8] = [
    TimerKind::NormalAckTimeout,
    TimerKind::BlockAckTimeout,
    TimerKind::CtsTimeout,
    TimerKind::SendCts,
    TimerKind::SendAck,
    TimerKind::SendData,
    TimerKind::WaitIfs,
    TimerKind::EndTxNoAck,
];

/// Action run when a timer fires.
#[derive(Debug, Clone, PartialEq, Eq)]
enum MacTimer {
    CtsTimeout,
    NormalAckTimeout,
    BlockAckTimeout,
    SendDmgCts {
        source: MacAddress,
        duration: Duration,
        rts_tx_vector: TxVector,
    },
    SendAck {
        source: MacAddress,
        duration: Duration,
        data_tx_vector: TxVector,
    },
    SendBlockAckAfterBar {
        request: BlockAckRequest,
        originator: MacAddress,
        duration: Duration,
        bar_tx_vector: TxVector,
    },
    SendBlockAckAfterAmpdu {
        tid: u8,
        originator: MacAddress,
        duration: Duration,
        data_tx_vector: TxVector,
    },
    SendDataAfterCts {
        duration: Duration,
    },
    StartNextFragment,
    StartNextPacket,
    EndTxNoAck,
    NavReset,
    InactivityTimeout {
        originator: MacAddress,
        tid: u8,
    },
}

/// The in-flight PSDU and how it is being sent.
#[derive(Debug, Clone)]
struct TransmissionContext {
    psdu: Psdu,
    params: TxParams,
    tx_vector: TxVector,
}

pub struct MacLow {
    config: MacConfig,
    phy: Box<dyn Phy>,
    station: Box<dyn StationManager>,
    beamforming: Box<dyn Beamforming>,
    listeners: ListenerRegistry,
    timers: TimerTable<TimerKind, MacTimer>,
    nav: Nav,
    current: Option<TransmissionContext>,
    owner: Option<ExchangeOwner>,
    reorder_buffers: HashMap<(MacAddress, u8), ReorderBuffer>,
    allocations: AllocationManager,
    training: TrainingPhase,
    events: VecDeque<MacEvent>,
}

impl MacLow {
    pub fn new(
        config: MacConfig,
        phy: Box<dyn Phy>,
        station: Box<dyn StationManager>,
        beamforming: Box<dyn Beamforming>,
        listeners: ListenerRegistry,
    ) -> Self {
        log::info!("MAC low {} up (SIFS {} us, slot {} us)", config.address, config.sifs_us, config.slot_us);
        Self {
            config,
            phy,
            station,
            beamforming,
            listeners,
            timers: TimerTable::new(),
            nav: Nav::new(),
            current: None,
            owner: None,
            reorder_buffers: HashMap::new(),
            allocations: AllocationManager::new(),
            training: TrainingPhase::Idle,
            events: VecDeque::new(),
        }
    }

    pub fn address(&self) -> MacAddress {
        self.config.address
    }

    pub fn config(&self) -> &MacConfig {
        &self.config
    }

    fn now(&self) -> Instant {
        time_driver::now()
    }

    /// Drain the outcomes queued since the last call, oldest first.
    pub fn take_events(&mut self) -> Vec<MacEvent> {
        self.events.drain(..).collect()
    }

    fn emit(&mut self, event: MacEvent) {
        log::trace!("event {:?}", event);
        self.events.push_back(event);
    }

    fn notify_owner(&mut self, event: TxopEvent) {
        match self.owner {
            Some(owner) => self.emit(MacEvent::Txop { owner: owner.id, event }),
            None => log::warn!("dropping {:?}: no exchange owner", event),
        }
    }

    fn deliver(&mut self, mpdus: Vec<Mpdu>) {
        for mpdu in mpdus {
            self.emit(MacEvent::Deliver(mpdu));
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn is_timer_running(&self, kind: TimerKind) -> bool {
        self.timers.is_running(kind)
    }

    /// Fire every event due at the current instant, in deadline then arming order.
    pub fn process_due_events(&mut self) -> Result<()> {
        let now = self.now();
        while let Some((kind, timer)) = self.timers.pop_due(now) {
            log::trace!("{:?} fired", kind);
            self.fire(timer)?;
        }
        Ok(())
    }

    /// Run the clock forward to `until`, firing events as their deadlines pass.
    pub fn advance_until(&mut self, until: Instant) -> Result<()> {
        while let Some(deadline) = self.timers.next_deadline() {
            if deadline > until {
                break;
            }
            time_driver::advance_to(deadline);
            self.process_due_events()?;
        }
        time_driver::advance_to(until);
        Ok(())
    }

    fn fire(&mut self, timer: MacTimer) -> Result<()> {
        match timer {
            MacTimer::CtsTimeout => self.cts_timeout(),
            MacTimer::NormalAckTimeout => self.normal_ack_timeout(),
            MacTimer::BlockAckTimeout => self.block_ack_timeout(),
            MacTimer::SendDmgCts {
                source,
                duration,
                rts_tx_vector,
            } => self.send_dmg_cts_after_rts(source, duration, rts_tx_vector)?,
            MacTimer::SendAck {
                source,
                duration,
                data_tx_vector,
            } => self.send_ack_after_data(source, duration, data_tx_vector)?,
            MacTimer::SendBlockAckAfterBar {
                request,
                originator,
                duration,
                bar_tx_vector,
            } => self.send_block_ack_after_block_ack_request(request, originator, duration, bar_tx_vector)?,
            MacTimer::SendBlockAckAfterAmpdu {
                tid,
                originator,
                duration,
                data_tx_vector,
            } => self.send_block_ack_after_ampdu(tid, originator, duration, data_tx_vector)?,
            MacTimer::SendDataAfterCts { duration } => self.send_data_after_cts(duration)?,
            MacTimer::StartNextFragment => self.notify_owner(TxopEvent::StartNextFragment),
            MacTimer::StartNextPacket => self.notify_owner(TxopEvent::StartNextPacket),
            MacTimer::EndTxNoAck => self.end_tx_no_ack(),
            MacTimer::NavReset => self.nav_reset(Duration::from_ticks(0)),
            MacTimer::InactivityTimeout { originator, tid } => {
                log::debug!("block ack agreement with {} tid {} inactive", originator, tid);
                self.emit(MacEvent::SendDelba { originator, tid });
            }
        }
        Ok(())
    }

    /// Cancel every exchange timer. If one was pending, the owner is told
    /// with `Cancel` and forgotten.
    fn cancel_all_events(&mut self) {
        let mut one_running = false;
        for kind in EXCHANGE_TIMERS {
            one_running |= self.timers.cancel(kind);
        }
        if !one_running {
            return;
        }
        if let Some(owner) = self.owner.take() {
            log::debug!("exchange of {:?} cancelled", owner.id);
            self.emit(MacEvent::Txop {
                owner: owner.id,
                event: TxopEvent::Cancel,
            });
        }
    }

    pub fn nav(&self) -> &Nav {
        &self.nav
    }

    pub fn is_nav_zero(&self) -> bool {
        self.nav.is_zero(self.now())
    }

    fn nav_start(&mut self, duration: Duration) -> bool {
        self.listeners.notify(ChannelAccessNotification::NavStart(duration));
        let now = self.now();
        let updated = self.nav.start(now, duration);
        if updated {
            log::debug!("NAV busy until {} us", self.nav.busy_until().as_micros());
        }
        updated
    }

    fn nav_reset(&mut self, duration: Duration) {
        log::debug!("NAV reset to {} us", duration.as_micros());
        self.listeners.notify(ChannelAccessNotification::NavReset(duration));
        let now = self.now();
        self.nav.reset(now, duration);
    }

    pub fn has_current_transmission(&self) -> bool {
        self.current.is_some()
    }

    pub fn current_owner(&self) -> Option<TxopId> {
        self.owner.map(|o| o.id)
    }

    /// Drop the exchange entirely: timers, NAV, in-flight PSDU and owner.
    fn abort_exchange(&mut self) {
        self.cancel_all_events();
        self.timers.cancel(TimerKind::NavResetCtsMissed);
        let now = self.now();
        self.nav.reset(now, Duration::from_ticks(0));
        self.current = None;
        self.owner = None;
    }

    pub fn notify_switching_start(&mut self, duration: Duration) {
        log::debug!("switching channel for {} us", duration.as_micros());
        self.abort_exchange();
        self.station.reset();
    }

    pub fn notify_sleep(&mut self) {
        log::debug!("PHY asleep");
        self.abort_exchange();
    }

    pub fn notify_off(&mut self) {
        log::debug!("PHY off");
        self.abort_exchange();
    }

    pub fn training_phase(&self) -> TrainingPhase {
        self.training
    }

    pub fn is_performing_sls(&self) -> bool {
        self.training == TrainingPhase::SectorSweep
    }

    pub fn is_performing_mimo_bft(&self) -> bool {
        self.training == TrainingPhase::MimoBft
    }

    fn enter_training(&mut self, phase: TrainingPhase) {
        log::debug!("{:?} phase started", phase);
        self.training = phase;
        self.timers.cancel(TimerKind::SendAck);
        let ack_pending = self.timers.cancel(TimerKind::NormalAckTimeout);
        let block_ack_pending = self.timers.cancel(TimerKind::BlockAckTimeout);
        if !(ack_pending || block_ack_pending) {
            return;
        }
        self.current = None;
        if let Some(owner) = self.owner.take() {
            log::debug!("exchange of {:?} pre-empted by training", owner.id);
            self.emit(MacEvent::Txop {
                owner: owner.id,
                event: TxopEvent::Cancel,
            });
        }
    }

    fn leave_training(&mut self, phase: TrainingPhase) {
        if self.training == phase {
            log::debug!("{:?} phase ended", phase);
            self.training = TrainingPhase::Idle;
        }
    }

    pub fn sls_phase_started(&mut self) {
        self.enter_training(TrainingPhase::SectorSweep);
    }

    pub fn sls_phase_ended(&mut self) {
        self.leave_training(TrainingPhase::SectorSweep);
    }

    pub fn mimo_bft_phase_started(&mut self) {
        self.enter_training(TrainingPhase::MimoBft);
    }

    pub fn mimo_bft_phase_ended(&mut self) {
        self.leave_training(TrainingPhase::MimoBft);
    }

    /// Set up the recipient side of a Block-Ack agreement with `originator`.
    pub fn create_block_ack_agreement(&mut self, response: &AddBaResponse, originator: MacAddress, starting_sequence: u16) -> Result<()> {
        let agreement = BlockAckAgreement::from_response(originator, response, starting_sequence);
        let key = (originator, agreement.tid());
        log::info!(
            "block ack agreement with {} tid {}: window {} from seq={}",
            originator,
            agreement.tid(),
            agreement.buffer_size(),
            agreement.starting_sequence()
        );
        if let Some(timeout) = agreement.inactivity_timeout() {
            let kind = TimerKind::BlockAckInactivity(originator, agreement.tid());
            self.timers.cancel(kind);
            let now = self.now();
            self.timers.arm(kind, now, timeout, MacTimer::InactivityTimeout { originator, tid: agreement.tid() })?;
        }
        if let Some(mut previous) = self.reorder_buffers.insert(key, ReorderBuffer::new(agreement)) {
            log::warn!("replacing existing agreement with {} tid {}", originator, key.1);
            let flushed = previous.flush_for_teardown();
            self.deliver(flushed);
        }
        Ok(())
    }

    /// Tear down the agreement, delivering whatever it can still release.
    pub fn destroy_block_ack_agreement(&mut self, originator: MacAddress, tid: u8) {
        if let Some(mut buffer) = self.reorder_buffers.remove(&(originator, tid)) {
            log::info!("block ack agreement with {} tid {} torn down", originator, tid);
            let flushed = buffer.flush_for_teardown();
            self.deliver(flushed);
            self.timers.cancel(TimerKind::BlockAckInactivity(originator, tid));
        }
    }

    pub fn reorder_buffer(&self, originator: MacAddress, tid: u8) -> Option<&ReorderBuffer> {
        self.reorder_buffers.get(&(originator, tid))
    }

    fn reset_block_ack_inactivity_timer(&mut self, originator: MacAddress, tid: u8) -> Result<()> {
        let Some(timeout) = self.reorder_buffers.get(&(originator, tid)).and_then(|b| b.agreement().inactivity_timeout()) else {
            return Ok(());
        };
        let kind = TimerKind::BlockAckInactivity(originator, tid);
        self.timers.cancel(kind);
        let now = self.now();
        self.timers.arm(kind, now, timeout, MacTimer::InactivityTimeout { originator, tid })
    }
}
