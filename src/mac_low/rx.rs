//! Receive side: de-aggregation, NAV updates, frame classification and the
//! responses scheduled SIFS after a reception.

use embassy_time::Duration;

use super::{MacLow, MacTimer, PSDU_DURATION_SAFEGUARD, TimerKind};
use crate::beamforming::TrainingPhase;
use crate::error::{MacError, Result};
use crate::events::{MacEvent, TxopEvent};
use crate::frame::{
    ACK_SIZE, AckPolicy, BlockAck, BlockAckRequest, BlockAckVariant, CTS_SIZE, DMG_CTS_SIZE, FrameKind, MacAddress, MacHeader, Mpdu, Psdu,
    SHORT_SSW_SIZE,
};
use crate::listener::ChannelAccessNotification;
use crate::nav::MAX_NAV_DURATION_US;
use crate::phy::{ModulationClass, PhyState, TxVector};

/// How a correctly received MPDU is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reception {
    Rts,
    /// CTS answering our RTS.
    Cts,
    /// Ack for the frame we are waiting on.
    Ack,
    /// BlockAck for the A-MPDU we are waiting on.
    BlockAck,
    BlockAckRequest,
    Beacon,
    SectorSweep,
    /// Control frame we have no use for.
    DroppedControl,
    ToSelf,
    Group,
    Promiscuous,
    NotForUs,
}

impl MacLow {
    /// A PPDU preamble was detected. A pending response timeout is pushed back
    /// so it cannot expire while the response is still being received.
    pub fn rx_start_indication(&mut self, tx_vector: TxVector, psdu_duration: Duration) -> Result<()> {
        if psdu_duration == Duration::from_ticks(0) {
            return Err(MacError::InvalidDuration("PSDU duration must be positive".to_string()));
        }
        log::trace!("rx start {:?} for {} us", tx_vector.mode, psdu_duration.as_micros());
        let now = self.now();
        let delay = psdu_duration + PSDU_DURATION_SAFEGUARD;

        if self.timers.cancel(TimerKind::NormalAckTimeout) {
            self.listeners.notify(ChannelAccessNotification::AckTimeoutReset);
            self.timers.arm(TimerKind::NormalAckTimeout, now, delay, MacTimer::NormalAckTimeout)
        } else if self.timers.cancel(TimerKind::BlockAckTimeout) {
            self.listeners.notify(ChannelAccessNotification::AckTimeoutReset);
            self.timers.arm(TimerKind::BlockAckTimeout, now, delay, MacTimer::BlockAckTimeout)
        } else if self.timers.cancel(TimerKind::CtsTimeout) {
            self.listeners.notify(ChannelAccessNotification::CtsTimeoutReset);
            self.timers.arm(TimerKind::CtsTimeout, now, delay, MacTimer::CtsTimeout)
        } else {
            if self.timers.cancel(TimerKind::NavResetCtsMissed) {
                log::debug!("reception started, NAV stays set");
            }
            Ok(())
        }
    }

    /// A PSDU failed its FCS. Without contention-free periods there is
    /// nothing to recover.
    pub fn receive_error(&mut self, psdu: &Psdu) {
        log::debug!("rx failed ({} bytes)", psdu.size());
    }

    /// A PSDU was received. `status_per_mpdu` flags which MPDUs passed their
    /// FCS and must hold one entry per MPDU.
    pub fn receive_ok(&mut self, psdu: Psdu, tx_vector: TxVector, status_per_mpdu: &[bool]) -> Result<()> {
        if status_per_mpdu.len() != psdu.n_mpdus() {
            return Err(MacError::ProtocolViolation(format!(
                "{} receive flags for {} MPDUs",
                status_per_mpdu.len(),
                psdu.n_mpdus()
            )));
        }
        let Some(first) = psdu.header().cloned() else {
            return Ok(());
        };

        if !tx_vector.aggregation {
            if psdu.is_aggregate() {
                return Err(MacError::ProtocolViolation("aggregate PSDU without the aggregation flag".to_string()));
            }
            if !status_per_mpdu[0] {
                log::debug!("dropping corrupted {}-byte PSDU", psdu.size());
                return Ok(());
            }
            let is_short_ssw = tx_vector.modulation_class() == ModulationClass::EdmgCtrl && psdu.size() == SHORT_SSW_SIZE;
            let Some(mpdu) = psdu.into_mpdus().into_iter().next() else {
                return Ok(());
            };
            if is_short_ssw {
                log::debug!("rx short SSW");
                self.emit(MacEvent::ShortSswReceived(mpdu));
                return Ok(());
            }
            return self.receive_mpdu_ok(mpdu, tx_vector, false);
        }

        if self.training != TrainingPhase::Idle {
            log::debug!("dropping A-MPDU during {:?}", self.training);
            return Ok(());
        }
        self.notify_nav(&first)?;
        if first.addr1 != self.config.address {
            return Ok(());
        }

        let single = psdu.is_single();
        let mut normal_ack = false;
        for (mpdu, &passed) in psdu.into_mpdus().into_iter().zip(status_per_mpdu) {
            let header = mpdu.header.clone();
            if header.addr1 != first.addr1 {
                return Err(MacError::ProtocolViolation(format!(
                    "A-MPDU subframe for {} in an A-MPDU for {}",
                    header.addr1, first.addr1
                )));
            }
            if !passed {
                log::trace!("skipping corrupted subframe seq={}", header.sequence);
                continue;
            }

            let ampdu_subframe = !single;
            if !single && !self.timers.is_running(TimerKind::SendAck) && header.ack_policy() == Some(AckPolicy::NormalAck) {
                if let Some(tid) = header.qos_tid() {
                    let now = self.now();
                    let sifs = self.config.sifs();
                    self.timers.arm(
                        TimerKind::SendAck,
                        now,
                        sifs,
                        MacTimer::SendBlockAckAfterAmpdu {
                            tid,
                            originator: header.addr2,
                            duration: header.duration,
                            data_tx_vector: tx_vector,
                        },
                    )?;
                }
            }

            if header.is_ack() || header.is_block_ack() || header.is_block_ack_req() {
                self.receive_mpdu_ok(mpdu, tx_vector, ampdu_subframe)?;
            } else if header.is_data() {
                self.receive_mpdu_ok(mpdu, tx_vector, ampdu_subframe)?;
                if header.ack_policy() == Some(AckPolicy::NormalAck) {
                    normal_ack = true;
                }
            } else {
                return Err(MacError::ProtocolViolation(format!("{} inside an A-MPDU", header.kind.name())));
            }

            if !single && normal_ack {
                if header.is_block_ack_req() {
                    return Err(MacError::ProtocolViolation("BlockAckReq in an A-MPDU soliciting an implicit BlockAck".to_string()));
                }
                if let Some(tid) = header.qos_tid() {
                    self.reset_block_ack_inactivity_timer(header.addr2, tid)?;
                }
            }
        }
        Ok(())
    }

    /// Update the NAV from the Duration/ID of a frame not addressed to us.
    fn notify_nav(&mut self, header: &MacHeader) -> Result<()> {
        if header.duration.as_micros() > MAX_NAV_DURATION_US {
            return Ok(());
        }
        if header.addr1 == self.config.address {
            return Ok(());
        }
        if let FrameKind::Grant(grant) = &header.kind {
            let aid = self.beamforming.association_id();
            if grant.source_aid == aid || grant.destination_aid == aid {
                log::debug!("Grant names us, NAV left alone");
                return Ok(());
            }
        }

        let updated = self.nav_start(header.duration);
        if header.kind == FrameKind::Rts && updated {
            // clear the NAV again if the CTS never shows up
            let rts_vector = self.station.rts_tx_vector(header);
            let sifs = self.config.sifs();
            let slot = self.config.slot();
            let delay = self.phy.tx_duration(CTS_SIZE, &rts_vector) + sifs * 2 + slot * 2 + self.phy.preamble_and_header_duration(&rts_vector);
            self.timers.cancel(TimerKind::NavResetCtsMissed);
            let now = self.now();
            self.timers.arm(TimerKind::NavResetCtsMissed, now, delay, MacTimer::NavReset)?;
        }
        Ok(())
    }

    fn classify(&self, header: &MacHeader) -> Reception {
        let own = self.config.address;
        let to_us = header.addr1 == own;
        let waiting = |kind| self.timers.is_running(kind);
        let params = self.current.as_ref().map(|c| c.params);

        match &header.kind {
            FrameKind::Rts => Reception::Rts,
            FrameKind::Cts | FrameKind::DmgCts if to_us && waiting(TimerKind::CtsTimeout) && self.current.is_some() => Reception::Cts,
            FrameKind::Ack if to_us && waiting(TimerKind::NormalAckTimeout) && params.is_some_and(|p| p.must_wait_normal_ack()) => {
                Reception::Ack
            }
            FrameKind::BlockAck(_) if to_us && waiting(TimerKind::BlockAckTimeout) && params.is_some_and(|p| p.must_wait_block_ack()) => {
                Reception::BlockAck
            }
            FrameKind::BlockAckReq(_) if to_us => Reception::BlockAckRequest,
            FrameKind::DmgBeacon => Reception::Beacon,
            kind if to_us && kind.is_sector_sweep() => Reception::SectorSweep,
            _ if header.is_ctl() => Reception::DroppedControl,
            _ if to_us => Reception::ToSelf,
            _ if header.addr1.is_group() => Reception::Group,
            _ if self.config.promiscuous => Reception::Promiscuous,
            _ => Reception::NotForUs,
        }
    }

    fn receive_mpdu_ok(&mut self, mpdu: Mpdu, tx_vector: TxVector, ampdu_subframe: bool) -> Result<()> {
        let header = mpdu.header.clone();
        let nav_was_zero = self.is_nav_zero();
        log::trace!("rx {} from={} duration={}us", header.kind.name(), header.addr2, header.duration.as_micros());
        self.notify_nav(&header)?;

        match self.classify(&header) {
            Reception::Rts => {
                if ampdu_subframe {
                    return Err(MacError::ProtocolViolation("RTS inside an A-MPDU".to_string()));
                }
                if nav_was_zero && header.addr1 == self.config.address {
                    log::debug!("rx RTS from={}, schedule CTS", header.addr2);
                    self.station.report_rx_ok(header.addr2, &header);
                    let now = self.now();
                    let sifs = self.config.sifs();
                    self.timers.arm(
                        TimerKind::SendCts,
                        now,
                        sifs,
                        MacTimer::SendDmgCts {
                            source: header.addr2,
                            duration: header.duration,
                            rts_tx_vector: tx_vector,
                        },
                    )?;
                } else {
                    log::debug!("rx RTS from={}, cannot schedule CTS", header.addr2);
                }
            }
            Reception::Cts => {
                if ampdu_subframe {
                    return Err(MacError::ProtocolViolation("CTS inside an A-MPDU".to_string()));
                }
                let data_header = self.current_ctx()?.psdu.header().cloned().ok_or(MacError::NoCurrentTransmission)?;
                log::debug!("rx CTS from={}", header.addr2);
                self.station.report_rx_ok(data_header.addr1, &header);
                self.station.report_rts_ok(data_header.addr1, &data_header);
                self.timers.cancel(TimerKind::CtsTimeout);
                self.listeners.notify(ChannelAccessNotification::CtsTimeoutReset);
                let now = self.now();
                let sifs = self.config.sifs();
                self.timers.arm(
                    TimerKind::SendData,
                    now,
                    sifs,
                    MacTimer::SendDataAfterCts { duration: header.duration },
                )?;
            }
            Reception::Ack => {
                let ctx = self.current_ctx()?;
                let has_next_packet = ctx.params.has_next_packet();
                let data_header = ctx.psdu.header().cloned().ok_or(MacError::NoCurrentTransmission)?;
                log::debug!("rx Ack from={}", header.addr2);
                if !has_next_packet {
                    self.station.report_rx_ok(data_header.addr1, &header);
                    self.station.report_data_ok(data_header.addr1, &data_header);
                }
                self.timers.cancel(TimerKind::NormalAckTimeout);
                self.listeners.notify(ChannelAccessNotification::AckTimeoutReset);
                self.notify_owner(TxopEvent::GotAck);

                let now = self.now();
                let ifs = self.ifs();
                if has_next_packet {
                    self.timers.arm(TimerKind::WaitIfs, now, ifs, MacTimer::StartNextFragment)?;
                } else if data_header.is_qos_data() && self.txop_continues() {
                    self.timers.arm(TimerKind::WaitIfs, now, ifs, MacTimer::StartNextPacket)?;
                } else if self.owner.is_some_and(|o| o.qos) {
                    self.notify_owner(TxopEvent::TerminateTxop);
                }
                self.current = None;
            }
            Reception::BlockAck => {
                let FrameKind::BlockAck(block_ack) = &header.kind else {
                    return Ok(());
                };
                log::debug!("rx BlockAck from={}", header.addr2);
                self.timers.cancel(TimerKind::BlockAckTimeout);
                self.listeners.notify(ChannelAccessNotification::AckTimeoutReset);
                self.notify_owner(TxopEvent::GotBlockAck {
                    block_ack: block_ack.clone(),
                    from: header.addr2,
                });

                if self.txop_continues() {
                    let now = self.now();
                    let ifs = self.ifs();
                    self.timers.arm(TimerKind::WaitIfs, now, ifs, MacTimer::StartNextPacket)?;
                } else if self.owner.is_some_and(|o| o.qos) {
                    self.notify_owner(TxopEvent::TerminateTxop);
                }
                self.current = None;
            }
            Reception::BlockAckRequest => self.receive_block_ack_request(&header, tx_vector)?,
            Reception::Beacon => {
                self.station.report_rx_ok(header.addr1, &header);
                self.emit(MacEvent::Deliver(mpdu));
            }
            Reception::SectorSweep => {
                self.station.report_rx_ok(header.addr2, &header);
                self.emit(MacEvent::Deliver(mpdu));
            }
            Reception::DroppedControl => log::trace!("rx drop {}", header.kind.name()),
            Reception::ToSelf => self.receive_for_us(mpdu, tx_vector, ampdu_subframe)?,
            Reception::Group => {
                if ampdu_subframe {
                    return Err(MacError::ProtocolViolation("group-addressed frame inside an A-MPDU".to_string()));
                }
                if header.is_data() || header.is_mgmt() {
                    log::debug!("rx group from={}", header.addr2);
                    self.emit(MacEvent::Deliver(mpdu));
                }
            }
            Reception::Promiscuous => {
                if header.is_data() {
                    self.emit(MacEvent::Deliver(mpdu));
                }
            }
            Reception::NotForUs => {
                if self.training == TrainingPhase::MimoBft && header.addr1 == header.addr2 {
                    self.emit(MacEvent::Deliver(mpdu));
                } else {
                    log::trace!("rx not for me from={}", header.addr2);
                }
            }
        }
        Ok(())
    }

    fn receive_block_ack_request(&mut self, header: &MacHeader, tx_vector: TxVector) -> Result<()> {
        if self.training != TrainingPhase::Idle {
            log::debug!("ignoring BlockAckReq during {:?}", self.training);
            return Ok(());
        }
        let FrameKind::BlockAckReq(request) = &header.kind else {
            return Ok(());
        };
        if request.multi_tid {
            return Err(MacError::Unsupported("multi-TID BlockAckReq".to_string()));
        }
        let originator = header.addr2;
        let Some(buffer) = self.reorder_buffers.get_mut(&(originator, request.tid)) else {
            log::debug!("BlockAckReq from {} tid {} without agreement", originator, request.tid);
            return Ok(());
        };
        buffer.update_cache_with_block_ack_req(request.starting_sequence);
        let immediate = buffer.agreement().is_immediate();
        self.timers.cancel(TimerKind::SendAck);
        self.reset_block_ack_inactivity_timer(originator, request.tid)?;
        if !immediate {
            return Err(MacError::Unsupported("delayed BlockAck".to_string()));
        }
        log::debug!("rx BlockAckReq from={} start={}", originator, request.starting_sequence);
        let now = self.now();
        let sifs = self.config.sifs();
        self.timers.arm(
            TimerKind::SendAck,
            now,
            sifs,
            MacTimer::SendBlockAckAfterBar {
                request: request.clone(),
                originator,
                duration: header.duration,
                bar_tx_vector: tx_vector,
            },
        )
    }

    /// Unicast frame addressed to us that is not a response we were waiting for.
    fn receive_for_us(&mut self, mpdu: Mpdu, tx_vector: TxVector, ampdu_subframe: bool) -> Result<()> {
        let header = mpdu.header.clone();
        match self.training {
            TrainingPhase::SectorSweep => {
                log::debug!("dropping {} during SLS", header.kind.name());
                self.timers.cancel(TimerKind::SendAck);
                return Ok(());
            }
            TrainingPhase::MimoBft if header.is_data() || header.is_block_ack() => {
                log::debug!("dropping {} during MIMO BFT", header.kind.name());
                self.timers.cancel(TimerKind::SendAck);
                return Ok(());
            }
            _ => {}
        }

        self.station.report_rx_ok(header.addr2, &header);
        match header.kind {
            FrameKind::ActionNoAck => self.emit(MacEvent::Deliver(mpdu)),
            FrameKind::QosData { tid, ack_policy } if self.reorder_buffers.contains_key(&(header.addr2, tid)) => {
                let originator = header.addr2;
                let mut delivered = Vec::new();
                if let Some(buffer) = self.reorder_buffers.get_mut(&(originator, tid)) {
                    delivered = buffer.admit(mpdu);
                    if ack_policy == AckPolicy::NormalAck && !ampdu_subframe {
                        let start = buffer.agreement().starting_sequence_control();
                        delivered.extend(buffer.flush_smaller_than(start));
                        delivered.extend(buffer.flush_contiguous_prefix());
                    }
                }
                self.deliver(delivered);
                if ack_policy == AckPolicy::NormalAck && !ampdu_subframe {
                    log::debug!("rx QoS unicast from={} seq={}, schedule Ack", originator, header.sequence);
                    self.schedule_ack(&header, tx_vector)?;
                } else if ack_policy == AckPolicy::BlockAck {
                    self.reset_block_ack_inactivity_timer(originator, tid)?;
                }
            }
            FrameKind::QosData {
                tid,
                ack_policy: AckPolicy::BlockAck,
            } => {
                log::debug!("BlockAck policy from {} tid {} without agreement", header.addr2, tid);
                self.emit(MacEvent::SendDelba {
                    originator: header.addr2,
                    tid,
                });
            }
            FrameKind::QosData {
                ack_policy: AckPolicy::NoAck,
                ..
            } => {
                log::debug!("rx unicast/noAck from={}", header.addr2);
                self.emit(MacEvent::Deliver(mpdu));
            }
            _ if header.is_data() || header.is_mgmt() => {
                if header.is_mgmt() && ampdu_subframe {
                    return Err(MacError::ProtocolViolation("management frame inside an A-MPDU".to_string()));
                }
                log::debug!("rx unicast from={} seq={}, schedule Ack", header.addr2, header.sequence);
                self.schedule_ack(&header, tx_vector)?;
                self.emit(MacEvent::Deliver(mpdu));
            }
            _ => self.emit(MacEvent::Deliver(mpdu)),
        }
        Ok(())
    }

    fn schedule_ack(&mut self, header: &MacHeader, data_tx_vector: TxVector) -> Result<()> {
        let now = self.now();
        let sifs = self.config.sifs();
        self.timers.arm(
            TimerKind::SendAck,
            now,
            sifs,
            MacTimer::SendAck {
                source: header.addr2,
                duration: header.duration,
                data_tx_vector,
            },
        )
    }

    /// Subtract response airtime and SIFS from a received Duration/ID.
    fn remaining_duration(duration: Duration, airtime: Duration, sifs: Duration, what: &str) -> Result<Duration> {
        duration
            .checked_sub(airtime)
            .and_then(|d| d.checked_sub(sifs))
            .ok_or_else(|| MacError::InvalidDuration(format!("{} us too short for the {}", duration.as_micros(), what)))
    }

    pub(super) fn send_dmg_cts_after_rts(&mut self, source: MacAddress, duration: Duration, rts_tx_vector: TxVector) -> Result<()> {
        let cts_vector = self.station.control_tx_vector();
        let cts_airtime = self.phy.tx_duration(DMG_CTS_SIZE, &cts_vector);
        let duration = Self::remaining_duration(duration, cts_airtime, self.config.sifs(), "DMG CTS")?;
        log::debug!("send DMG CTS to={} (RTS mode {:?})", source, rts_tx_vector.mode);
        let cts = MacHeader::new(FrameKind::DmgCts, source, self.config.address).with_duration(duration);
        self.forward_down(Psdu::single(Mpdu::control(cts)), cts_vector);
        Ok(())
    }

    fn response_blocked(&self) -> bool {
        matches!(self.phy.state(), PhyState::Tx | PhyState::Switching)
    }

    pub(super) fn send_ack_after_data(&mut self, source: MacAddress, duration: Duration, data_tx_vector: TxVector) -> Result<()> {
        if self.response_blocked() {
            log::debug!("skip Ack to {}: PHY busy", source);
            return Ok(());
        }
        let ack_vector = self.station.ack_tx_vector(source, &data_tx_vector);
        let ack_airtime = self.phy.tx_duration(ACK_SIZE, &ack_vector);
        let duration = Self::remaining_duration(duration, ack_airtime, self.config.sifs(), "Ack")?;
        let ack = MacHeader::new(FrameKind::Ack, source, self.config.address).with_duration(duration);
        self.forward_down(Psdu::single(Mpdu::control(ack)), ack_vector);
        Ok(())
    }

    pub(super) fn send_block_ack_after_block_ack_request(
        &mut self,
        request: BlockAckRequest,
        originator: MacAddress,
        duration: Duration,
        bar_tx_vector: TxVector,
    ) -> Result<()> {
        if self.response_blocked() {
            log::debug!("skip BlockAck to {}: PHY busy", originator);
            return Ok(());
        }
        let variant = if self.station.edmg_supported() {
            BlockAckVariant::EdmgCompressed
        } else {
            request.variant
        };
        let Some(buffer) = self.reorder_buffers.get_mut(&(originator, request.tid)) else {
            log::debug!("agreement with {} tid {} gone before the BlockAck", originator, request.tid);
            return Ok(());
        };
        let block_ack = buffer.block_ack(request.starting_sequence, variant)?;
        let immediate = buffer.agreement().is_immediate();
        let delivered = buffer.handle_block_ack_request(request.starting_sequence);
        self.deliver(delivered);
        self.send_block_ack_response(block_ack, originator, immediate, duration, bar_tx_vector)
    }

    pub(super) fn send_block_ack_after_ampdu(
        &mut self,
        tid: u8,
        originator: MacAddress,
        duration: Duration,
        data_tx_vector: TxVector,
    ) -> Result<()> {
        if self.response_blocked() {
            log::debug!("skip BlockAck to {}: PHY busy", originator);
            return Ok(());
        }
        let edmg = self.station.edmg_supported();
        let Some(buffer) = self.reorder_buffers.get(&(originator, tid)) else {
            log::debug!("no agreement with {} tid {} for the implicit BlockAckReq", originator, tid);
            return Ok(());
        };
        let variant = if edmg {
            BlockAckVariant::EdmgCompressed
        } else if buffer.agreement().buffer_size() > 64 {
            BlockAckVariant::ExtendedCompressed
        } else {
            BlockAckVariant::Compressed
        };
        let block_ack = buffer.implicit_block_ack(variant)?;
        let immediate = buffer.agreement().is_immediate();
        self.send_block_ack_response(block_ack, originator, immediate, duration, data_tx_vector)
    }

    fn send_block_ack_response(
        &mut self,
        block_ack: BlockAck,
        originator: MacAddress,
        immediate: bool,
        duration: Duration,
        request_tx_vector: TxVector,
    ) -> Result<()> {
        if !immediate {
            return Err(MacError::Unsupported("delayed BlockAck".to_string()));
        }
        let block_ack_vector = self.station.block_ack_tx_vector(originator, &request_tx_vector);
        let airtime = self.phy.tx_duration(block_ack.variant.block_ack_size(), &block_ack_vector);
        let duration = Self::remaining_duration(duration, airtime, self.config.sifs(), "BlockAck")?;
        log::debug!("send BlockAck to={} start={}", originator, block_ack.starting_sequence);
        let header = MacHeader::new(FrameKind::BlockAck(block_ack), originator, self.config.address).with_duration(duration);
        self.forward_down(Psdu::single(Mpdu::control(header)), block_ack_vector);
        Ok(())
    }
}
