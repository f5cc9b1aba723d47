//! Recording fakes for the PHY, station manager, beamforming collaborator
//! and owner queue, shared by the unit tests.

use embassy_time::{Duration, Instant};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::beamforming::{AccessPeriod, AllocationType, Beamforming, StationRole};
use crate::config::MacConfig;
use crate::frame::{AckPolicy, FrameKind, MacAddress, MacHeader, Mpdu, Psdu};
use crate::listener::{ChannelAccessListener, ChannelAccessNotification, ListenerRegistry};
use crate::mac_low::MacLow;
use crate::phy::{ModulationClass, Phy, PhyState, PreambleType, TxVector, WifiMode};
use crate::station::StationManager;
use crate::time_driver;
use crate::txop::{AgreementWindow, FrameQueue};

pub const SELF: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x01]);
pub const PEER: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x02]);
pub const OTHER: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x03]);
/// Association id of `SELF`.
pub const OWN_AID: u8 = 1;

pub const PREAMBLE_US: u64 = 1;
const CONTROL_BYTES_PER_US: u64 = 10;
const DATA_BYTES_PER_US: u64 = 100;

/// Airtime model: 1 us preamble, then 10 bytes/us in control mode and 100 bytes/us otherwise.
pub fn airtime(size: u32, tx_vector: &TxVector) -> Duration {
    let rate = match tx_vector.modulation_class() {
        ModulationClass::DmgCtrl | ModulationClass::EdmgCtrl => CONTROL_BYTES_PER_US,
        _ => DATA_BYTES_PER_US,
    };
    Duration::from_micros(PREAMBLE_US + u64::from(size).div_ceil(rate))
}

pub fn us(v: u64) -> Duration {
    Duration::from_micros(v)
}

pub fn at(v: u64) -> Instant {
    Instant::from_micros(v)
}

pub fn qos_header(sequence: u16, ack_policy: AckPolicy) -> MacHeader {
    MacHeader::new(FrameKind::QosData { tid: 0, ack_policy }, PEER, SELF).with_sequence(sequence)
}

/// Outbound QoS data frame from `SELF` to `PEER`, TID 0, normal ack policy.
pub fn qos_mpdu(sequence: u16, payload: u32) -> Mpdu {
    Mpdu::new(qos_header(sequence, AckPolicy::NormalAck), payload)
}

/// Inbound QoS data frame from `PEER` to `SELF`.
pub fn rx_qos_mpdu(sequence: u16, ack_policy: AckPolicy, duration: Duration) -> Mpdu {
    let header = MacHeader::new(FrameKind::QosData { tid: 0, ack_policy }, SELF, PEER)
        .with_sequence(sequence)
        .with_duration(duration);
    Mpdu::new(header, 1000)
}

pub fn control_vector() -> TxVector {
    TxVector::new(WifiMode::new(ModulationClass::DmgCtrl, 0), PreambleType::Dmg)
}

pub fn data_vector() -> TxVector {
    TxVector::new(WifiMode::new(ModulationClass::DmgSc, 12), PreambleType::Dmg)
}

pub struct SentPsdu {
    pub at: Instant,
    pub psdu: Psdu,
    pub tx_vector: TxVector,
}

#[derive(Default)]
pub struct PhyRecord {
    pub sent: Vec<SentPsdu>,
    pub forced_state: Option<PhyState>,
    pub busy_until: Option<Instant>,
}

#[derive(Clone, Default)]
pub struct FakePhy {
    pub record: Rc<RefCell<PhyRecord>>,
}

impl FakePhy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the first frame of every PSDU sent, in order.
    pub fn sent_kinds(&self) -> Vec<&'static str> {
        self.record.borrow().sent.iter().filter_map(|s| s.psdu.header().map(|h| h.kind.name())).collect()
    }

    pub fn sent_len(&self) -> usize {
        self.record.borrow().sent.len()
    }

    pub fn last_sent_header(&self) -> Option<MacHeader> {
        self.record.borrow().sent.last().and_then(|s| s.psdu.header().cloned())
    }

    pub fn force_state(&self, state: Option<PhyState>) {
        self.record.borrow_mut().forced_state = state;
    }
}

impl Phy for FakePhy {
    fn state(&self) -> PhyState {
        let record = self.record.borrow();
        if let Some(state) = record.forced_state {
            return state;
        }
        match record.busy_until {
            Some(end) if end > time_driver::now() => PhyState::Tx,
            _ => PhyState::Idle,
        }
    }

    fn tx_duration(&self, size: u32, tx_vector: &TxVector) -> Duration {
        airtime(size, tx_vector)
    }

    fn preamble_and_header_duration(&self, _tx_vector: &TxVector) -> Duration {
        Duration::from_micros(PREAMBLE_US)
    }

    fn send(&mut self, psdu: Psdu, tx_vector: TxVector) {
        if self.state() == PhyState::Off {
            return;
        }
        let now = time_driver::now();
        let mut record = self.record.borrow_mut();
        record.busy_until = Some(now + airtime(psdu.size(), &tx_vector));
        record.sent.push(SentPsdu { at: now, psdu, tx_vector });
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StationRecord {
    pub rx_ok: usize,
    pub rts_ok: usize,
    pub rts_failed: usize,
    pub data_ok: usize,
    pub resets: usize,
}

pub struct FakeStation {
    pub record: Rc<RefCell<StationRecord>>,
    max_ampdu_size: u32,
    edmg: bool,
    cts_to_self: bool,
    rifs: bool,
}

impl FakeStation {
    pub fn new() -> Self {
        Self {
            record: Rc::new(RefCell::new(StationRecord::default())),
            max_ampdu_size: 262_143,
            edmg: false,
            cts_to_self: false,
            rifs: false,
        }
    }

    pub fn data_vector(&self) -> TxVector {
        data_vector()
    }

    pub fn set_max_ampdu_size(&mut self, size: u32) {
        self.max_ampdu_size = size;
    }

    pub fn set_edmg(&mut self, edmg: bool) {
        self.edmg = edmg;
    }

    pub fn set_cts_to_self(&mut self, needed: bool) {
        self.cts_to_self = needed;
    }

    pub fn set_rifs(&mut self, permitted: bool) {
        self.rifs = permitted;
    }
}

impl StationManager for FakeStation {
    fn data_tx_vector(&self, _header: &MacHeader) -> TxVector {
        data_vector()
    }

    fn rts_tx_vector(&self, _header: &MacHeader) -> TxVector {
        control_vector()
    }

    fn control_tx_vector(&self) -> TxVector {
        control_vector()
    }

    fn cts_tx_vector(&self, _to: MacAddress, _rts_tx_vector: &TxVector) -> TxVector {
        control_vector()
    }

    fn ack_tx_vector(&self, _to: MacAddress, _data_tx_vector: &TxVector) -> TxVector {
        control_vector()
    }

    fn block_ack_tx_vector(&self, _to: MacAddress, _data_tx_vector: &TxVector) -> TxVector {
        control_vector()
    }

    fn max_ampdu_size(&self, _to: MacAddress, _tid: u8, _class: ModulationClass) -> u32 {
        self.max_ampdu_size
    }

    fn rifs_permitted(&self) -> bool {
        self.rifs
    }

    fn need_cts_to_self(&self, _data_tx_vector: &TxVector) -> bool {
        self.cts_to_self
    }

    fn edmg_supported(&self) -> bool {
        self.edmg
    }

    fn report_rx_ok(&mut self, _from: MacAddress, _header: &MacHeader) {
        self.record.borrow_mut().rx_ok += 1;
    }

    fn report_rts_ok(&mut self, _to: MacAddress, _header: &MacHeader) {
        self.record.borrow_mut().rts_ok += 1;
    }

    fn report_rts_failed(&mut self, _to: MacAddress, _header: &MacHeader) {
        self.record.borrow_mut().rts_failed += 1;
    }

    fn report_data_ok(&mut self, _to: MacAddress, _header: &MacHeader) {
        self.record.borrow_mut().data_ok += 1;
    }

    fn reset(&mut self) {
        self.record.borrow_mut().resets += 1;
    }
}

/// (peer, transmit antenna only, data)
pub type SteeringLog = Rc<RefCell<Vec<(MacAddress, bool, bool)>>>;

pub struct FakeBeamforming {
    pub access_period: AccessPeriod,
    pub allocation_type: AllocationType,
    pub role: StationRole,
    pub steering: SteeringLog,
}

impl FakeBeamforming {
    pub fn new() -> Self {
        Self {
            access_period: AccessPeriod::Dti,
            allocation_type: AllocationType::ServicePeriod,
            role: StationRole::Station,
            steering: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl Beamforming for FakeBeamforming {
    fn access_period(&self) -> AccessPeriod {
        self.access_period
    }

    fn allocation_type(&self) -> AllocationType {
        self.allocation_type
    }

    fn role(&self) -> StationRole {
        self.role
    }

    fn association_id(&self) -> u8 {
        OWN_AID
    }

    fn steer_antenna_toward(&mut self, peer: MacAddress, is_data: bool) {
        self.steering.borrow_mut().push((peer, false, is_data));
    }

    fn steer_tx_antenna_toward(&mut self, peer: MacAddress, is_data: bool) {
        self.steering.borrow_mut().push((peer, true, is_data));
    }
}

/// Owner queue: the head frame is the peeked frame.
#[derive(Default)]
pub struct FakeQueue {
    frames: VecDeque<Mpdu>,
    agreements: HashMap<(MacAddress, u8), AgreementWindow>,
}

impl FakeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mpdu: Mpdu) {
        self.frames.push_back(mpdu);
    }

    pub fn set_agreement(&mut self, receiver: MacAddress, tid: u8, starting_sequence: u16, buffer_size: u16) {
        self.agreements.insert(
            (receiver, tid),
            AgreementWindow {
                starting_sequence,
                buffer_size,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    fn head_matches(&self, receiver: MacAddress, tid: u8) -> bool {
        self.frames.front().is_some_and(|m| m.header.addr1 == receiver && m.header.qos_tid() == Some(tid))
    }
}

impl FrameQueue for FakeQueue {
    fn peeked_frame(&self) -> Option<&Mpdu> {
        self.frames.front()
    }

    fn dequeue_peeked(&mut self) -> Option<Mpdu> {
        self.frames.pop_front()
    }

    fn peek_next(&self, receiver: MacAddress, tid: u8) -> Option<&Mpdu> {
        if self.head_matches(receiver, tid) { self.frames.front() } else { None }
    }

    fn dequeue_next(&mut self, receiver: MacAddress, tid: u8) -> Option<Mpdu> {
        if self.head_matches(receiver, tid) { self.frames.pop_front() } else { None }
    }

    fn agreement_window(&self, receiver: MacAddress, tid: u8) -> Option<AgreementWindow> {
        self.agreements.get(&(receiver, tid)).copied()
    }
}

pub type NotificationLog = Rc<RefCell<Vec<ChannelAccessNotification>>>;

pub struct RecordingListener(pub NotificationLog);

impl ChannelAccessListener for RecordingListener {
    fn notify(&mut self, notification: ChannelAccessNotification) {
        self.0.borrow_mut().push(notification);
    }
}

/// A MAC wired to fakes, with the clock rewound and then moved to 1 ms so the
/// NAV starts out idle.
pub struct Harness {
    pub mac: MacLow,
    pub phy: FakePhy,
    pub station: Rc<RefCell<StationRecord>>,
    pub steering: SteeringLog,
    pub notifications: NotificationLog,
}

pub const START_US: u64 = 1000;

pub fn harness() -> Harness {
    harness_with(FakeStation::new(), FakeBeamforming::new(), MacConfig::default())
}

pub fn harness_with(station: FakeStation, beamforming: FakeBeamforming, config: MacConfig) -> Harness {
    crate::init_logging(log::LevelFilter::Trace);
    time_driver::reset();
    time_driver::advance_to(at(START_US));

    let phy = FakePhy::new();
    let station_record = station.record.clone();
    let steering = beamforming.steering.clone();
    let notifications: NotificationLog = Rc::new(RefCell::new(Vec::new()));
    let mut listeners = ListenerRegistry::new();
    listeners.register(Box::new(RecordingListener(notifications.clone())));

    let mac = MacLow::new(config.with_address(SELF), Box::new(phy.clone()), Box::new(station), Box::new(beamforming), listeners);
    Harness {
        mac,
        phy,
        station: station_record,
        steering,
        notifications,
    }
}
