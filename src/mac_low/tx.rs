//! Transmit side: starting exchanges, protection, Duration/ID fields and
//! response timeouts.

use embassy_time::Duration;

use super::{MacLow, MacTimer, TimerKind, TransmissionContext};
use crate::aggregation::MpduAggregator;
use crate::beamforming::{AccessPeriod, AllocationType, StationRole, TrainingPhase};
use crate::error::{MacError, Result};
use crate::events::{MacEvent, TxopEvent};
use crate::frame::{
    ACK_SIZE, AckPolicy, BLOCK_ACK_REQUEST_SIZE, BlockAckVariant, CTS_SIZE, DMG_CTS_SIZE, FrameKind, MacAddress, MacHeader, Mpdu, Psdu,
    PsduKind, RTS_SIZE,
};
use crate::listener::ChannelAccessNotification;
use crate::params::{AckRequirement, TxParams};
use crate::phy::{ModulationClass, PhyState, TxVector};
use crate::txop::{ExchangeOwner, FrameQueue};

fn zero() -> Duration {
    Duration::from_ticks(0)
}

/// Round up to a whole number of microseconds.
fn round_up_to_micros(duration: Duration) -> Duration {
    let micros = duration.as_micros();
    let floor = Duration::from_micros(micros);
    if floor < duration { Duration::from_micros(micros + 1) } else { floor }
}

impl MacLow {
    /// Off, asleep or switching channel: nothing may be sent.
    fn radio_unavailable(&self) -> bool {
        matches!(self.phy.state(), PhyState::Off | PhyState::Sleep | PhyState::Switching)
    }

    /// Start an exchange for `owner`.
    ///
    /// QoS unicast frames are checked against the owner's remaining time and
    /// aggregated with what `queue` holds for the same receiver and TID. The
    /// PSDU is then protected with RTS/CTS or CTS-to-self as requested, or
    /// sent directly.
    pub fn start_transmission(&mut self, mpdu: Mpdu, params: TxParams, owner: ExchangeOwner, queue: &mut dyn FrameQueue) -> Result<()> {
        if self.radio_unavailable() {
            log::debug!("cannot start TX because the PHY is {:?}", self.phy.state());
            return Ok(());
        }
        self.cancel_all_events();
        self.owner = Some(owner);

        let header = mpdu.header.clone();
        let tx_vector = if header.is_ctl() {
            self.station.rts_tx_vector(&header)
        } else {
            self.station.data_tx_vector(&header)
        };
        let mut params = params;
        let psdu = if header.is_qos_data() && !header.addr1.is_broadcast() && !header.more_fragments && header.fragment == 0 {
            match self.build_qos_psdu(mpdu, &mut params, tx_vector, &owner, queue) {
                Some(psdu) => psdu,
                None => return Ok(()),
            }
        } else {
            Psdu::single(mpdu)
        };

        log::debug!(
            "startTx size={} to={} seq={} owner={:?} mpdus={}",
            psdu.size(),
            header.addr1,
            header.sequence,
            owner.id,
            psdu.n_mpdus()
        );
        let must_send_rts = params.must_send_rts;
        self.current = Some(TransmissionContext { psdu, params, tx_vector });

        if must_send_rts {
            self.send_rts_for_packet()
        } else if self.config.cts_to_self_supported && self.station.need_cts_to_self(&tx_vector) {
            self.send_cts_to_self()
        } else {
            self.send_data_packet()
        }
    }

    /// Apply the time budget and aggregate. `None` means nothing is sent: a
    /// peeked frame stays in the queue, a dequeued one stays current.
    fn build_qos_psdu(
        &mut self,
        mpdu: Mpdu,
        params: &mut TxParams,
        tx_vector: TxVector,
        owner: &ExchangeOwner,
        queue: &mut dyn FrameQueue,
    ) -> Option<Psdu> {
        let receiver = mpdu.header.addr1;
        let tid = mpdu.header.qos_tid()?;
        let is_peeked = queue.peeked_frame().is_some_and(|p| p.uid() == mpdu.uid());

        let limit = self.ppdu_duration_limit(owner, params, &tx_vector, &mpdu.header);
        let fits = MpduAggregator::new(self.phy.as_ref(), self.station.as_ref(), tx_vector, limit).is_within_size_and_time_limits(
            mpdu.size(),
            receiver,
            tid,
            0,
        );
        if !fits {
            log::debug!("seq={} to {} does not fit the time left", mpdu.header.sequence, receiver);
            self.current = if is_peeked {
                None
            } else {
                Some(TransmissionContext {
                    psdu: Psdu::single(mpdu),
                    params: *params,
                    tx_vector,
                })
            };
            return None;
        }

        let first = if is_peeked { queue.dequeue_peeked().unwrap_or(mpdu) } else { mpdu };
        let variant = if self.station.edmg_supported() {
            BlockAckVariant::EdmgCompressed
        } else if queue.agreement_window(receiver, tid).is_some_and(|w| w.buffer_size > 64) {
            BlockAckVariant::ExtendedCompressed
        } else {
            BlockAckVariant::Compressed
        };
        // an A-MPDU is answered by a BlockAck, so budget for that response
        let ampdu_limit = self.ppdu_duration_limit(owner, &params.with_block_ack(variant), &tx_vector, &first.header);
        let mut mpdus = MpduAggregator::new(self.phy.as_ref(), self.station.as_ref(), tx_vector, ampdu_limit).next_ampdu(first, queue);

        if mpdus.len() > 1 {
            let mut psdu = Psdu::ampdu(mpdus);
            psdu.set_ack_policy(AckPolicy::NormalAck);
            params.ack = AckRequirement::BlockAck(variant);
            return Some(psdu);
        }
        let single = mpdus.pop()?;
        if matches!(tx_vector.modulation_class(), ModulationClass::Vht | ModulationClass::He) {
            Some(Psdu::s_mpdu(single))
        } else {
            Some(Psdu::single(single))
        }
    }

    /// Airtime the PPDU may use once protection and response are taken out of
    /// the owner's remaining time. `None` when the owner is unbounded.
    fn ppdu_duration_limit(&self, owner: &ExchangeOwner, params: &TxParams, tx_vector: &TxVector, header: &MacHeader) -> Option<Duration> {
        let now = self.now();
        if !owner.bounds_ppdu_duration(now) {
            return None;
        }
        let remaining = owner.remaining(now).unwrap_or(owner.txop_limit);
        let mut overhead = self.response_duration(params, tx_vector, header.addr1);
        if params.must_send_rts {
            let rts_vector = self.station.rts_tx_vector(header);
            overhead += self.phy.tx_duration(RTS_SIZE, &rts_vector) + self.cts_duration(header.addr1, &rts_vector) + self.config.sifs() * 2;
        }
        Some(remaining.checked_sub(overhead).unwrap_or(zero()))
    }

    /// Send one frame for `owner` without queue access or aggregation.
    pub fn transmit_single_frame(&mut self, mpdu: Mpdu, params: TxParams, owner: ExchangeOwner) -> Result<()> {
        if self.radio_unavailable() {
            log::debug!("cannot start TX because the PHY is {:?}", self.phy.state());
            return Ok(());
        }
        self.cancel_all_events();
        self.owner = Some(owner);
        self.start_single(mpdu, params)
    }

    /// Send a frame nobody owns, such as a beamforming control frame.
    /// Completion is reported as `MacEvent::TransmissionOk`.
    pub fn start_unowned_transmission(&mut self, mpdu: Mpdu, params: TxParams) -> Result<()> {
        if self.radio_unavailable() {
            log::debug!("cannot start TX because the PHY is {:?}", self.phy.state());
            return Ok(());
        }
        self.cancel_all_events();
        self.owner = None;
        self.start_single(mpdu, params)
    }

    fn start_single(&mut self, mpdu: Mpdu, params: TxParams) -> Result<()> {
        let tx_vector = self.station.data_tx_vector(&mpdu.header);
        log::debug!("send single {} to={}", mpdu.header.kind.name(), mpdu.header.addr1);
        self.current = Some(TransmissionContext {
            psdu: Psdu::single(mpdu),
            params,
            tx_vector,
        });
        self.send_data_packet()
    }

    /// Send a short SSW in control mode, bypassing antenna steering.
    pub fn start_short_ssw_transmission(&mut self, mpdu: Mpdu) -> Result<()> {
        if self.radio_unavailable() {
            log::debug!("cannot start TX because the PHY is {:?}", self.phy.state());
            return Ok(());
        }
        self.cancel_all_events();
        self.owner = None;
        let tx_vector = self.station.control_tx_vector();
        let psdu = Psdu::single(mpdu);
        self.current = Some(TransmissionContext {
            psdu: psdu.clone(),
            params: TxParams::new(),
            tx_vector,
        });
        self.start_data_tx_timers(tx_vector)?;
        log::debug!("send short SSW");
        self.phy.send(psdu, tx_vector);
        Ok(())
    }

    pub(super) fn current_ctx(&self) -> Result<&TransmissionContext> {
        self.current.as_ref().ok_or(MacError::NoCurrentTransmission)
    }

    fn current_header(&self) -> Result<MacHeader> {
        self.current_ctx()?.psdu.header().cloned().ok_or(MacError::NoCurrentTransmission)
    }

    pub(super) fn ifs(&self) -> Duration {
        if self.station.rifs_permitted() { self.config.rifs() } else { self.config.sifs() }
    }

    pub(super) fn ack_duration(&self, receiver: MacAddress, data_tx_vector: &TxVector) -> Duration {
        let ack_vector = self.station.ack_tx_vector(receiver, data_tx_vector);
        self.phy.tx_duration(ACK_SIZE, &ack_vector)
    }

    fn block_ack_duration(&self, receiver: MacAddress, data_tx_vector: &TxVector, variant: BlockAckVariant) -> Duration {
        let block_ack_vector = self.station.block_ack_tx_vector(receiver, data_tx_vector);
        self.phy.tx_duration(variant.block_ack_size(), &block_ack_vector)
    }

    fn block_ack_request_duration(&self, receiver: MacAddress, data_tx_vector: &TxVector) -> Duration {
        let block_ack_vector = self.station.block_ack_tx_vector(receiver, data_tx_vector);
        self.phy.tx_duration(BLOCK_ACK_REQUEST_SIZE, &block_ack_vector)
    }

    /// Airtime of the CTS answering an RTS sent with `rts_tx_vector`. DMG
    /// control mode RTS frames are answered with a DMG CTS.
    pub(super) fn cts_duration(&self, receiver: MacAddress, rts_tx_vector: &TxVector) -> Duration {
        match rts_tx_vector.modulation_class() {
            ModulationClass::DmgCtrl | ModulationClass::EdmgCtrl => {
                let control = self.station.control_tx_vector();
                self.phy.tx_duration(DMG_CTS_SIZE, &control)
            }
            _ => {
                let cts_vector = self.station.cts_tx_vector(receiver, rts_tx_vector);
                self.phy.tx_duration(CTS_SIZE, &cts_vector)
            }
        }
    }

    /// Time from the end of the data to the end of its response.
    fn response_duration(&self, params: &TxParams, data_tx_vector: &TxVector, receiver: MacAddress) -> Duration {
        let sifs = self.config.sifs();
        match params.ack {
            AckRequirement::None => zero(),
            AckRequirement::Normal => sifs + self.ack_duration(receiver, data_tx_vector),
            AckRequirement::BlockAck(variant) => sifs + self.block_ack_duration(receiver, data_tx_vector, variant),
            AckRequirement::BlockAckRequest(variant) => {
                sifs * 2
                    + self.block_ack_request_duration(receiver, data_tx_vector)
                    + self.block_ack_duration(receiver, data_tx_vector, variant)
            }
        }
    }

    /// Airtime the in-flight exchange still needs: data, RTS/CTS when
    /// protected, and the response.
    pub(super) fn transaction_time(&self) -> Result<Duration> {
        let ctx = self.current_ctx()?;
        let header = ctx.psdu.header().ok_or(MacError::NoCurrentTransmission)?;
        let mut total = self.phy.tx_duration(ctx.psdu.size(), &ctx.tx_vector);
        if ctx.params.must_send_rts {
            let rts_vector = self.station.rts_tx_vector(header);
            total += self.phy.tx_duration(RTS_SIZE, &rts_vector) + self.cts_duration(header.addr1, &rts_vector) + self.config.sifs() * 2;
        }
        total += self.response_duration(&ctx.params, &ctx.tx_vector, header.addr1);
        Ok(round_up_to_micros(total))
    }

    /// Whether the owner's TXOP leaves room for another frame after SIFS.
    pub(super) fn txop_continues(&self) -> bool {
        let now = self.now();
        let sifs = self.config.sifs();
        self.owner
            .is_some_and(|o| o.qos && o.has_txop_limit() && o.remaining(now).is_none_or(|left| left > sifs))
    }

    pub(super) fn send_rts_for_packet(&mut self) -> Result<()> {
        let ctx = self.current_ctx()?;
        let header = self.current_header()?;
        let receiver = header.addr1;
        let rts_vector = self.station.rts_tx_vector(&header);
        let sifs = self.config.sifs();

        let mut duration = sifs
            + self.cts_duration(receiver, &rts_vector)
            + sifs
            + self.phy.tx_duration(ctx.psdu.size(), &ctx.tx_vector)
            + self.response_duration(&ctx.params, &ctx.tx_vector, receiver);
        if let Some(next) = ctx.params.next_packet_size {
            duration += self.phy.tx_duration(next, &ctx.tx_vector) + self.response_duration(&ctx.params, &ctx.tx_vector, receiver);
        }

        let timeout = self.phy.tx_duration(RTS_SIZE, &rts_vector) + sifs + self.config.slot() + self.phy.preamble_and_header_duration(&rts_vector);
        self.listeners.notify(ChannelAccessNotification::CtsTimeoutStart(timeout));
        let now = self.now();
        self.timers.arm(TimerKind::CtsTimeout, now, timeout, MacTimer::CtsTimeout)?;

        let rts = MacHeader::new(FrameKind::Rts, receiver, self.config.address).with_duration(duration);
        self.forward_down(Psdu::single(Mpdu::control(rts)), rts_vector);
        Ok(())
    }

    fn send_cts_to_self(&mut self) -> Result<()> {
        let ctx = self.current_ctx()?;
        let header = self.current_header()?;
        let receiver = header.addr1;
        let cts_vector = self.station.rts_tx_vector(&header);
        let sifs = self.config.sifs();

        let response = self.response_duration(&ctx.params, &ctx.tx_vector, receiver);
        let mut duration = sifs + self.phy.tx_duration(ctx.psdu.size(), &ctx.tx_vector) + response;
        if let Some(next) = ctx.params.next_packet_size {
            duration += sifs + self.phy.tx_duration(next, &ctx.tx_vector) + response;
        }
        let cts_airtime = self.phy.tx_duration(CTS_SIZE, &cts_vector);

        let cts = MacHeader::new(FrameKind::Cts, self.config.address, self.config.address).with_duration(duration);
        self.forward_down(Psdu::single(Mpdu::control(cts)), cts_vector);
        let now = self.now();
        self.timers
            .arm(TimerKind::SendData, now, cts_airtime + sifs, MacTimer::SendDataAfterCts { duration })
    }

    /// Arm the timer that follows the data: a response timeout when one is
    /// expected, otherwise the continuation of the TXOP or its end.
    pub(super) fn start_data_tx_timers(&mut self, data_tx_vector: TxVector) -> Result<()> {
        let ctx = self.current_ctx()?;
        let header = self.current_header()?;
        let tx_duration = self.phy.tx_duration(ctx.psdu.size(), &data_tx_vector);
        let sifs = self.config.sifs();
        let slot = self.config.slot();
        let params = ctx.params;
        let now = self.now();

        if params.must_wait_normal_ack() {
            let ack_vector = self.station.ack_tx_vector(header.addr1, &data_tx_vector);
            let timeout = tx_duration + sifs + slot + self.phy.preamble_and_header_duration(&ack_vector);
            self.listeners.notify(ChannelAccessNotification::AckTimeoutStart(timeout));
            self.timers.arm(TimerKind::NormalAckTimeout, now, timeout, MacTimer::NormalAckTimeout)
        } else if params.must_wait_block_ack() {
            let block_ack_vector = self.station.block_ack_tx_vector(header.addr1, &data_tx_vector);
            let timeout = tx_duration + sifs + slot + self.phy.preamble_and_header_duration(&block_ack_vector);
            self.listeners.notify(ChannelAccessNotification::AckTimeoutStart(timeout));
            self.timers.arm(TimerKind::BlockAckTimeout, now, timeout, MacTimer::BlockAckTimeout)
        } else if params.has_next_packet() {
            let delay = tx_duration + self.ifs();
            self.timers.arm(TimerKind::WaitIfs, now, delay, MacTimer::StartNextFragment)
        } else if header.is_qos_data() && self.txop_continues() {
            let delay = tx_duration + self.ifs();
            self.timers.arm(TimerKind::WaitIfs, now, delay, MacTimer::StartNextPacket)
        } else {
            self.timers.arm(TimerKind::EndTxNoAck, now, tx_duration, MacTimer::EndTxNoAck)
        }
    }

    /// Duration/ID covering the response and, when fragmenting, the next fragment and its response.
    fn data_duration_field(&self, ctx: &TransmissionContext, receiver: MacAddress) -> Duration {
        let mut duration = self.response_duration(&ctx.params, &ctx.tx_vector, receiver);
        if let Some(next) = ctx.params.next_packet_size {
            duration += self.ifs() + self.phy.tx_duration(next, &ctx.tx_vector) + self.response_duration(&ctx.params, &ctx.tx_vector, receiver);
        }
        duration
    }

    pub(super) fn send_data_packet(&mut self) -> Result<()> {
        let tx_vector = self.current_ctx()?.tx_vector;
        self.start_data_tx_timers(tx_vector)?;

        let ctx = self.current_ctx()?;
        let header = self.current_header()?;
        let duration = match ctx.params.duration_id {
            Some(duration) => duration,
            None => self.data_duration_field(ctx, header.addr1),
        };
        self.finish_data(duration, &header)
    }

    /// Send the protected data once the CTS came back. `duration` is the
    /// Duration/ID of that CTS.
    pub(super) fn send_data_after_cts(&mut self, duration: Duration) -> Result<()> {
        let tx_vector = self.current_ctx()?.tx_vector;
        self.start_data_tx_timers(tx_vector)?;

        let ctx = self.current_ctx()?;
        let header = self.current_header()?;
        let own = self.data_duration_field(ctx, header.addr1);
        let tx_duration = self.phy.tx_duration(ctx.psdu.size(), &tx_vector);
        let left = duration
            .checked_sub(tx_duration)
            .and_then(|d| d.checked_sub(self.config.sifs()))
            .unwrap_or(zero());
        self.finish_data(left.max(own), &header)
    }

    fn finish_data(&mut self, duration: Duration, header: &MacHeader) -> Result<()> {
        let ctx = self.current.as_mut().ok_or(MacError::NoCurrentTransmission)?;
        ctx.psdu.set_duration(duration);
        let psdu = ctx.psdu.clone();
        let tx_vector = ctx.tx_vector;
        let must_send_bar = ctx.params.must_send_block_ack_request();

        if must_send_bar {
            if let Some(tid) = header.qos_tid() {
                self.notify_owner(TxopEvent::ScheduleBar { receiver: header.addr1, tid });
            }
        }
        self.forward_down(psdu, tx_vector);
        Ok(())
    }

    fn steer_toward(&mut self, header: &MacHeader) {
        let period = self.beamforming.access_period();
        let role = self.beamforming.role();
        let is_response = header.is_ack() || header.is_block_ack();
        if (period == AccessPeriod::Dti && self.beamforming.allocation_type() == AllocationType::Cbap) || period == AccessPeriod::Ati {
            if role == StationRole::AccessPoint && is_response {
                self.beamforming.steer_tx_antenna_toward(header.addr1, false);
            } else if !header.kind.is_sector_sweep() && self.training != TrainingPhase::MimoBft {
                self.beamforming.steer_antenna_toward(header.addr1, header.is_data());
            }
        } else if role == StationRole::AdHoc {
            if is_response {
                self.beamforming.steer_tx_antenna_toward(header.addr1, true);
            } else {
                self.beamforming.steer_antenna_toward(header.addr1, header.is_data());
            }
        }
    }

    /// Hand a PSDU to the PHY, steering the antenna first when the access
    /// period calls for it.
    pub(super) fn forward_down(&mut self, psdu: Psdu, mut tx_vector: TxVector) {
        let Some(header) = psdu.header().cloned() else {
            return;
        };
        log::debug!(
            "send {} to={} size={} duration={}us seq={} mode={:?}",
            header.kind.name(),
            header.addr1,
            psdu.size(),
            header.duration.as_micros(),
            header.sequence,
            tx_vector.mode
        );
        self.steer_toward(&header);

        match psdu.kind() {
            PsduKind::Single => {}
            PsduKind::SMpdu => {
                tx_vector.aggregation = true;
                log::debug!("sending S-MPDU");
            }
            PsduKind::Ampdu => {
                tx_vector.aggregation = true;
                log::debug!("sending A-MPDU of {} MPDUs", psdu.n_mpdus());
            }
        }
        for mpdu in psdu.mpdus() {
            if let Some(tid) = mpdu.header.qos_tid() {
                self.emit(MacEvent::MpduTransmitted {
                    receiver: mpdu.header.addr1,
                    tid,
                    sequence: mpdu.header.sequence,
                });
            }
        }
        self.phy.send(psdu, tx_vector);
    }

    pub(super) fn cts_timeout(&mut self) {
        log::debug!("CTS timeout");
        if let Some(ctx) = self.current.take() {
            if let Some(header) = ctx.psdu.header() {
                self.station.report_rts_failed(header.addr1, header);
            }
            self.notify_owner(TxopEvent::MissedCts(ctx.psdu));
        }
        self.owner = None;
    }

    pub(super) fn normal_ack_timeout(&mut self) {
        log::debug!("normal Ack timeout");
        self.notify_owner(TxopEvent::MissedAck);
        self.owner = None;
        self.current = None;
    }

    pub(super) fn block_ack_timeout(&mut self) {
        log::debug!("BlockAck timeout");
        let n_mpdus = self.current.as_ref().map_or(0, |c| c.psdu.n_mpdus());
        self.notify_owner(TxopEvent::MissedBlockAck { n_mpdus });
        self.owner = None;
        self.current = None;
    }

    pub(super) fn end_tx_no_ack(&mut self) {
        let ctx = self.current.take();
        match self.owner.take() {
            Some(owner) => self.emit(MacEvent::Txop {
                owner: owner.id,
                event: TxopEvent::EndTxNoAck,
            }),
            None => match ctx.and_then(|c| c.psdu.header().cloned()) {
                Some(header) if header.kind == FrameKind::ShortSsw => self.emit(MacEvent::ShortSswTransmitted),
                Some(header) => self.emit(MacEvent::TransmissionOk(header)),
                None => {}
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MacConfig;
    use crate::frame::{BlockAck, GrantInfo};
    use crate::mac_low::PSDU_DURATION_SAFEGUARD;
    use crate::test_support::{
        FakeBeamforming, FakeQueue, FakeStation, Harness, PEER, SELF, START_US, at, control_vector, harness, harness_with, qos_mpdu, us,
    };
    use crate::txop::TxopId;

    const OWNER: TxopId = TxopId(1);

    fn running_response_timeouts(h: &Harness) -> usize {
        [TimerKind::CtsTimeout, TimerKind::NormalAckTimeout, TimerKind::BlockAckTimeout]
            .into_iter()
            .filter(|k| h.mac.is_timer_running(*k))
            .count()
    }

    fn ack_from_peer() -> Psdu {
        Psdu::single(Mpdu::control(MacHeader::new(FrameKind::Ack, SELF, PEER)))
    }

    fn owner_events(events: &[MacEvent]) -> Vec<TxopEvent> {
        events
            .iter()
            .filter_map(|e| match e {
                MacEvent::Txop { event, .. } => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn rts_cts_data_ack_exchange_succeeds() {
        let mut h = harness();
        let mut queue = FakeQueue::new();
        let params = TxParams::new().with_normal_ack().with_rts();
        h.mac.start_transmission(qos_mpdu(0, 1000), params, ExchangeOwner::qos(OWNER), &mut queue).unwrap();

        // RTS covers SIFS + CTS(3) + SIFS + data(12) + SIFS + Ack(3)
        assert_eq!(h.phy.sent_kinds(), vec!["RTS"]);
        assert_eq!(h.phy.last_sent_header().unwrap().duration, us(27));
        assert_eq!(h.mac.timers.deadline(TimerKind::CtsTimeout), Some(at(START_US + 12)));
        assert_eq!(running_response_timeouts(&h), 1);

        h.mac.advance_until(at(1005)).unwrap();
        h.mac.rx_start_indication(control_vector(), us(3)).unwrap();
        assert_eq!(h.mac.timers.deadline(TimerKind::CtsTimeout), Some(at(1008) + PSDU_DURATION_SAFEGUARD));

        h.mac.advance_until(at(1008)).unwrap();
        let cts = MacHeader::new(FrameKind::DmgCts, SELF, PEER).with_duration(us(21));
        h.mac.receive_ok(Psdu::single(Mpdu::control(cts)), control_vector(), &[true]).unwrap();
        assert_eq!(running_response_timeouts(&h), 0);
        assert_eq!(h.station.borrow().rts_ok, 1);

        h.mac.advance_until(at(1011)).unwrap();
        assert_eq!(h.phy.sent_kinds(), vec!["RTS", "QOSDATA"]);
        assert_eq!(h.phy.record.borrow().sent[1].at, at(1011));
        assert_eq!(h.phy.last_sent_header().unwrap().duration, us(6));
        assert_eq!(running_response_timeouts(&h), 1);
        assert!(h.mac.is_timer_running(TimerKind::NormalAckTimeout));

        h.mac.advance_until(at(1026)).unwrap();
        h.mac.receive_ok(ack_from_peer(), control_vector(), &[true]).unwrap();
        assert_eq!(running_response_timeouts(&h), 0);
        assert!(!h.mac.has_current_transmission());

        let events = h.mac.take_events();
        assert_eq!(
            events,
            vec![
                MacEvent::MpduTransmitted {
                    receiver: PEER,
                    tid: 0,
                    sequence: 0
                },
                MacEvent::Txop {
                    owner: OWNER,
                    event: TxopEvent::GotAck
                },
                MacEvent::Txop {
                    owner: OWNER,
                    event: TxopEvent::TerminateTxop
                },
            ]
        );
        assert_eq!(h.station.borrow().data_ok, 1);
        let notifications = h.notifications.borrow();
        assert_eq!(notifications[0], ChannelAccessNotification::CtsTimeoutStart(us(12)));
        assert!(notifications.contains(&ChannelAccessNotification::AckTimeoutStart(us(21))));
        assert_eq!(notifications.last(), Some(&ChannelAccessNotification::AckTimeoutReset));
    }

    #[test]
    fn missing_cts_reports_missed_cts_once() {
        let mut h = harness();
        let mut queue = FakeQueue::new();
        let params = TxParams::new().with_normal_ack().with_rts();
        h.mac.start_transmission(qos_mpdu(5, 1000), params, ExchangeOwner::qos(OWNER), &mut queue).unwrap();

        h.mac.advance_until(at(1100)).unwrap();
        let events = owner_events(&h.mac.take_events());
        assert_eq!(events.len(), 1);
        match &events[0] {
            TxopEvent::MissedCts(psdu) => assert_eq!(psdu.header().unwrap().sequence, 5),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.phy.sent_kinds(), vec!["RTS"]);
        assert_eq!(h.station.borrow().rts_failed, 1);
        assert!(!h.mac.has_current_transmission());
        assert!(h.mac.current_owner().is_none());
    }

    #[test]
    fn missing_ack_reports_missed_ack() {
        let mut h = harness();
        h.mac
            .transmit_single_frame(qos_mpdu(1, 1000), TxParams::new().with_normal_ack(), ExchangeOwner::qos(OWNER))
            .unwrap();
        // data 12 us + SIFS + slot + preamble
        assert_eq!(h.mac.timers.deadline(TimerKind::NormalAckTimeout), Some(at(1021)));
        h.mac.advance_until(at(1021)).unwrap();
        assert_eq!(owner_events(&h.mac.take_events()), vec![TxopEvent::MissedAck]);
        assert!(h.mac.next_deadline().is_none());
    }

    #[test]
    fn txop_continues_with_next_packet_after_ack() {
        let mut h = harness();
        let owner = ExchangeOwner::qos(OWNER).with_txop(us(1000), at(2000));
        h.mac
            .start_transmission(qos_mpdu(0, 1000), TxParams::new().with_normal_ack(), owner, &mut FakeQueue::new())
            .unwrap();
        h.mac.advance_until(at(1018)).unwrap();
        h.mac.receive_ok(ack_from_peer(), control_vector(), &[true]).unwrap();
        h.mac.advance_until(at(1021)).unwrap();
        assert_eq!(owner_events(&h.mac.take_events()), vec![TxopEvent::GotAck, TxopEvent::StartNextPacket]);
    }

    #[test]
    fn fragment_duration_covers_next_fragment() {
        let mut h = harness();
        let params = TxParams::new().with_normal_ack().with_next_packet(500);
        h.mac.transmit_single_frame(qos_mpdu(0, 1000), params, ExchangeOwner::qos(OWNER)).unwrap();
        // Ack(6) + SIFS + next fragment(6) + Ack(6)
        assert_eq!(h.phy.last_sent_header().unwrap().duration, us(21));

        h.mac.advance_until(at(1018)).unwrap();
        h.mac.receive_ok(ack_from_peer(), control_vector(), &[true]).unwrap();
        // more fragments follow, so the station manager hears nothing yet
        assert_eq!(h.station.borrow().data_ok, 0);
        h.mac.advance_until(at(1021)).unwrap();
        assert_eq!(owner_events(&h.mac.take_events()), vec![TxopEvent::GotAck, TxopEvent::StartNextFragment]);
    }

    #[test]
    fn frames_without_response_end_the_exchange() {
        let mut h = harness();
        h.mac
            .transmit_single_frame(qos_mpdu(0, 1000), TxParams::new(), ExchangeOwner::qos(OWNER))
            .unwrap();
        h.mac.advance_until(at(1012)).unwrap();
        assert_eq!(owner_events(&h.mac.take_events()), vec![TxopEvent::EndTxNoAck]);

        let grant = MacHeader::new(
            FrameKind::Grant(GrantInfo {
                source_aid: 1,
                destination_aid: 2,
            }),
            PEER,
            SELF,
        );
        h.mac.start_unowned_transmission(Mpdu::control(grant.clone()), TxParams::new()).unwrap();
        h.mac.advance_until(at(1100)).unwrap();
        assert_eq!(h.mac.take_events(), vec![MacEvent::TransmissionOk(grant)]);
    }

    #[test]
    fn ampdu_is_built_from_peeked_frame_and_answered_by_block_ack() {
        let mut h = harness();
        let mut queue = FakeQueue::new();
        for s in 0..3 {
            queue.push(qos_mpdu(s, 1000));
        }
        queue.set_agreement(PEER, 0, 0, 64);
        let head = queue.peeked_frame().cloned().unwrap();
        h.mac
            .start_transmission(head, TxParams::new().with_normal_ack(), ExchangeOwner::qos(OWNER), &mut queue)
            .unwrap();

        assert_eq!(queue.len(), 0);
        {
            let record = h.phy.record.borrow();
            let sent = &record.sent[0];
            assert_eq!(sent.psdu.kind(), PsduKind::Ampdu);
            assert_eq!(sent.psdu.n_mpdus(), 3);
            assert!(sent.tx_vector.aggregation);
            assert!(sent.psdu.mpdus().iter().all(|m| m.header.ack_policy() == Some(AckPolicy::NormalAck)));
        }
        assert!(h.mac.is_timer_running(TimerKind::BlockAckTimeout));
        let transmitted = h.mac.take_events().iter().filter(|e| matches!(e, MacEvent::MpduTransmitted { .. })).count();
        assert_eq!(transmitted, 3);

        let block_ack = BlockAck {
            tid: 0,
            starting_sequence: 0,
            variant: BlockAckVariant::Compressed,
            bitmap: vec![true, true, true],
        };
        let header = MacHeader::new(FrameKind::BlockAck(block_ack.clone()), SELF, PEER);
        h.mac.advance_until(at(1040)).unwrap();
        h.mac.receive_ok(Psdu::single(Mpdu::control(header)), control_vector(), &[true]).unwrap();
        assert_eq!(
            owner_events(&h.mac.take_events()),
            vec![TxopEvent::GotBlockAck { block_ack, from: PEER }, TxopEvent::TerminateTxop]
        );
    }

    #[test]
    fn missing_block_ack_reports_mpdu_count() {
        let mut h = harness();
        let mut queue = FakeQueue::new();
        for s in 0..4 {
            queue.push(qos_mpdu(s, 1000));
        }
        queue.set_agreement(PEER, 0, 0, 64);
        let head = queue.peeked_frame().cloned().unwrap();
        h.mac
            .start_transmission(head, TxParams::new().with_normal_ack(), ExchangeOwner::qos(OWNER), &mut queue)
            .unwrap();
        h.mac.advance_until(at(1200)).unwrap();
        assert_eq!(owner_events(&h.mac.take_events()), vec![TxopEvent::MissedBlockAck { n_mpdus: 4 }]);
    }

    #[test]
    fn frame_that_does_not_fit_is_not_sent() {
        let mut h = harness();
        // 10 us left, 6 us of it taken by the Ack: a 12 us frame cannot go
        let owner = ExchangeOwner::qos(OWNER).with_allocation_end(at(START_US + 10));
        let mut queue = FakeQueue::new();
        queue.push(qos_mpdu(0, 1000));
        let head = queue.peeked_frame().cloned().unwrap();
        h.mac.start_transmission(head, TxParams::new().with_normal_ack(), owner, &mut queue).unwrap();
        assert_eq!(h.phy.sent_len(), 0);
        assert_eq!(queue.len(), 1);
        assert!(!h.mac.has_current_transmission());

        // already dequeued: nothing is sent but the frame stays current
        h.mac
            .start_transmission(qos_mpdu(1, 1000), TxParams::new().with_normal_ack(), owner, &mut FakeQueue::new())
            .unwrap();
        assert_eq!(h.phy.sent_len(), 0);
        assert!(h.mac.has_current_transmission());
    }

    #[test]
    fn cts_to_self_precedes_data() {
        let mut station = FakeStation::new();
        station.set_cts_to_self(true);
        let config = MacConfig {
            cts_to_self_supported: true,
            ..MacConfig::default()
        };
        let mut h = harness_with(station, FakeBeamforming::new(), config);
        h.mac
            .start_transmission(qos_mpdu(0, 1000), TxParams::new().with_normal_ack(), ExchangeOwner::qos(OWNER), &mut FakeQueue::new())
            .unwrap();
        let cts = h.phy.last_sent_header().unwrap();
        assert_eq!(cts.kind, FrameKind::Cts);
        assert_eq!(cts.addr1, SELF);
        assert_eq!(cts.duration, us(21));

        // CTS airtime(3) + SIFS
        h.mac.advance_until(at(1006)).unwrap();
        assert_eq!(h.phy.sent_kinds(), vec!["CTS", "QOSDATA"]);
        assert_eq!(h.phy.last_sent_header().unwrap().duration, us(6));
    }

    #[test]
    fn antenna_steering_follows_access_period_and_role() {
        let mut beamforming = FakeBeamforming::new();
        beamforming.allocation_type = AllocationType::Cbap;
        let mut h = harness_with(FakeStation::new(), beamforming, MacConfig::default());
        h.mac
            .transmit_single_frame(qos_mpdu(0, 100), TxParams::new(), ExchangeOwner::qos(OWNER))
            .unwrap();
        assert_eq!(*h.steering.borrow(), vec![(PEER, false, true)]);

        h.mac.advance_until(at(1100)).unwrap();
        let ssw = MacHeader::new(FrameKind::Ssw, PEER, SELF);
        h.mac.start_unowned_transmission(Mpdu::control(ssw), TxParams::new()).unwrap();
        assert_eq!(h.steering.borrow().len(), 1);

        // service periods steer only for ad hoc stations
        let mut beamforming = FakeBeamforming::new();
        beamforming.role = StationRole::AdHoc;
        let mut h = harness_with(FakeStation::new(), beamforming, MacConfig::default());
        h.mac
            .transmit_single_frame(qos_mpdu(0, 100), TxParams::new(), ExchangeOwner::qos(OWNER))
            .unwrap();
        assert_eq!(*h.steering.borrow(), vec![(PEER, false, true)]);
        let mut h = harness();
        h.mac
            .transmit_single_frame(qos_mpdu(0, 100), TxParams::new(), ExchangeOwner::qos(OWNER))
            .unwrap();
        assert!(h.steering.borrow().is_empty());
    }

    #[test]
    fn short_ssw_goes_out_in_control_mode_without_owner() {
        let mut h = harness();
        let short_ssw = Mpdu::control(MacHeader::new(FrameKind::ShortSsw, MacAddress::BROADCAST, SELF));
        h.mac.start_short_ssw_transmission(short_ssw).unwrap();
        {
            let record = h.phy.record.borrow();
            assert_eq!(record.sent[0].tx_vector, control_vector());
            assert_eq!(record.sent[0].psdu.size(), 6);
        }
        h.mac.advance_until(at(1010)).unwrap();
        assert_eq!(h.mac.take_events(), vec![MacEvent::ShortSswTransmitted]);
    }

    #[test]
    fn nothing_starts_while_phy_is_off() {
        let mut h = harness();
        h.phy.force_state(Some(PhyState::Off));
        h.mac
            .start_transmission(qos_mpdu(0, 100), TxParams::new().with_normal_ack(), ExchangeOwner::qos(OWNER), &mut FakeQueue::new())
            .unwrap();
        assert!(!h.mac.has_current_transmission());
        assert!(h.mac.next_deadline().is_none());
    }

    fn assert_nothing_started(h: &mut Harness) {
        assert_eq!(h.phy.sent_len(), 0);
        assert!(!h.mac.has_current_transmission());
        assert!(h.mac.current_owner().is_none());
        assert!(h.mac.next_deadline().is_none());
        h.mac.advance_until(at(START_US + 1000)).unwrap();
        assert!(h.mac.take_events().is_empty());
    }

    #[test]
    fn sleeping_or_switching_radio_sends_nothing() {
        for state in [PhyState::Sleep, PhyState::Switching] {
            let mut h = harness();
            h.phy.force_state(Some(state));
            h.mac
                .start_transmission(qos_mpdu(0, 100), TxParams::new().with_normal_ack(), ExchangeOwner::qos(OWNER), &mut FakeQueue::new())
                .unwrap();
            assert_nothing_started(&mut h);

            h.mac
                .transmit_single_frame(qos_mpdu(1, 100), TxParams::new().with_normal_ack().with_rts(), ExchangeOwner::qos(OWNER))
                .unwrap();
            assert_nothing_started(&mut h);

            let beacon = Mpdu::new(MacHeader::new(FrameKind::Management, PEER, SELF), 40);
            h.mac.start_unowned_transmission(beacon, TxParams::new().with_normal_ack()).unwrap();
            assert_nothing_started(&mut h);

            let short_ssw = Mpdu::control(MacHeader::new(FrameKind::ShortSsw, MacAddress::BROADCAST, SELF));
            h.mac.start_short_ssw_transmission(short_ssw).unwrap();
            assert_nothing_started(&mut h);
        }
    }

    #[test]
    fn block_ack_request_policy_asks_owner_for_bar() {
        let mut h = harness();
        let params = TxParams::new().with_block_ack_request(BlockAckVariant::Compressed);
        h.mac.transmit_single_frame(qos_mpdu(3, 100), params, ExchangeOwner::qos(OWNER)).unwrap();
        assert_eq!(owner_events(&h.mac.take_events()), vec![TxopEvent::ScheduleBar { receiver: PEER, tid: 0 }]);
    }

    #[test]
    fn transaction_time_rounds_up_to_microseconds() {
        assert_eq!(round_up_to_micros(Duration::from_micros(7)), Duration::from_micros(7));
        let mut h = harness();
        h.mac
            .transmit_single_frame(qos_mpdu(0, 1000), TxParams::new().with_normal_ack().with_rts(), ExchangeOwner::qos(OWNER))
            .unwrap();
        // data 12 + RTS 3 + CTS 3 + 2 SIFS + Ack response 6
        assert_eq!(h.mac.transaction_time().unwrap(), us(30));
    }
}
