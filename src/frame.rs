//! Frame model: addresses, MAC headers, MPDUs and PSDUs.
//!
//! Only the fields that drive exchange sequencing are modelled. Frame bodies
//! are opaque and represented by their size.

use embassy_time::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::aggregation::size_if_aggregated;

pub const RTS_SIZE: u32 = 20;
pub const CTS_SIZE: u32 = 14;
pub const DMG_CTS_SIZE: u32 = 20;
pub const ACK_SIZE: u32 = 14;
pub const BLOCK_ACK_REQUEST_SIZE: u32 = 24;
/// A short SSW frame is a bare 6-byte PSDU sent in EDMG control mode.
pub const SHORT_SSW_SIZE: u32 = 6;
/// Fixed part of every control frame carrying addr1/addr2 plus the FCS.
const CONTROL_FRAME_BASE_SIZE: u32 = 20;
const QOS_DATA_HEADER_SIZE: u32 = 26;
const DATA_HEADER_SIZE: u32 = 24;
const MGMT_HEADER_SIZE: u32 = 24;
const FCS_SIZE: u32 = 4;

/// 48-bit IEEE MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const BROADCAST: MacAddress = MacAddress([0xff; 6]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Group addresses have the individual/group bit set.
    pub fn is_group(&self) -> bool {
        self.0[0] & 0x01 == 0x01
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", b[0], b[1], b[2], b[3], b[4], b[5])
    }
}

impl FromStr for MacAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(|| format!("MAC address '{}' has fewer than 6 octets", s))?;
            *byte = u8::from_str_radix(part, 16).map_err(|e| format!("invalid octet '{}' in MAC address '{}': {}", part, s, e))?;
        }
        if parts.next().is_some() {
            return Err(format!("MAC address '{}' has more than 6 octets", s));
        }
        Ok(MacAddress(bytes))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(value: MacAddress) -> Self {
        value.to_string()
    }
}

/// QoS Ack Policy subfield.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// Immediate Ack, or implicit BlockAckReq when sent inside an A-MPDU.
    NormalAck,
    NoAck,
    NoExplicitAck,
    BlockAck,
}

/// BlockAck bitmap variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockAckVariant {
    Basic,
    Compressed,
    ExtendedCompressed,
    EdmgCompressed,
}

impl BlockAckVariant {
    /// Number of sequence numbers covered by the bitmap.
    pub fn bitmap_len(&self) -> u16 {
        match self {
            BlockAckVariant::Basic | BlockAckVariant::Compressed => 64,
            BlockAckVariant::ExtendedCompressed => 256,
            BlockAckVariant::EdmgCompressed => 1024,
        }
    }

    /// Size of a BlockAck frame of this variant, FCS included.
    pub fn block_ack_size(&self) -> u32 {
        let bitmap_bytes = match self {
            // Basic bitmaps carry 16 fragment bits per sequence number
            BlockAckVariant::Basic => 128,
            _ => u32::from(self.bitmap_len()) / 8,
        };
        CONTROL_FRAME_BASE_SIZE + 4 + bitmap_bytes
    }
}

/// Body of a BlockAckReq frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAckRequest {
    pub tid: u8,
    pub starting_sequence: u16,
    pub variant: BlockAckVariant,
    pub multi_tid: bool,
}

impl BlockAckRequest {
    pub fn starting_sequence_control(&self) -> u16 {
        self.starting_sequence << 4
    }
}

/// Body of a BlockAck frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAck {
    pub tid: u8,
    pub starting_sequence: u16,
    pub variant: BlockAckVariant,
    /// One flag per sequence number starting at `starting_sequence`.
    pub bitmap: Vec<bool>,
}

impl BlockAck {
    /// Whether the bitmap acknowledges `seq`.
    pub fn is_received(&self, seq: u16) -> bool {
        let offset = (seq + 4096 - self.starting_sequence) % 4096;
        self.bitmap.get(usize::from(offset)).copied().unwrap_or(false)
    }
}

/// Dynamic allocation info carried by a DMG Grant frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantInfo {
    pub source_aid: u8,
    pub destination_aid: u8,
}

/// Frame type/subtype as a tagged variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    Rts,
    Cts,
    DmgCts,
    Ack,
    BlockAckReq(BlockAckRequest),
    BlockAck(BlockAck),
    Grant(GrantInfo),
    Ssw,
    SswFeedback,
    SswAck,
    /// Any other control subtype (Poll, SPR, DMG DTS, ...).
    OtherControl,
    DmgBeacon,
    ShortSsw,
    Data,
    QosData { tid: u8, ack_policy: AckPolicy },
    ActionNoAck,
    Management,
}

/// Coarse frame class used by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    Control,
    Data,
    Management,
    Extension,
}

impl FrameKind {
    pub fn class(&self) -> FrameClass {
        match self {
            FrameKind::Rts
            | FrameKind::Cts
            | FrameKind::DmgCts
            | FrameKind::Ack
            | FrameKind::BlockAckReq(_)
            | FrameKind::BlockAck(_)
            | FrameKind::Grant(_)
            | FrameKind::Ssw
            | FrameKind::SswFeedback
            | FrameKind::SswAck
            | FrameKind::OtherControl => FrameClass::Control,
            FrameKind::DmgBeacon | FrameKind::ShortSsw => FrameClass::Extension,
            FrameKind::Data | FrameKind::QosData { .. } => FrameClass::Data,
            FrameKind::ActionNoAck | FrameKind::Management => FrameClass::Management,
        }
    }

    pub fn is_sector_sweep(&self) -> bool {
        matches!(self, FrameKind::Ssw | FrameKind::SswFeedback | FrameKind::SswAck)
    }

    pub fn name(&self) -> &'static str {
        match self {
            FrameKind::Rts => "RTS",
            FrameKind::Cts => "CTS",
            FrameKind::DmgCts => "DMG-CTS",
            FrameKind::Ack => "ACK",
            FrameKind::BlockAckReq(_) => "BAR",
            FrameKind::BlockAck(_) => "BA",
            FrameKind::Grant(_) => "GRANT",
            FrameKind::Ssw => "SSW",
            FrameKind::SswFeedback => "SSW-FBCK",
            FrameKind::SswAck => "SSW-ACK",
            FrameKind::OtherControl => "CTL",
            FrameKind::DmgBeacon => "DMG-BEACON",
            FrameKind::ShortSsw => "SHORT-SSW",
            FrameKind::Data => "DATA",
            FrameKind::QosData { .. } => "QOSDATA",
            FrameKind::ActionNoAck => "ACTION-NOACK",
            FrameKind::Management => "MGT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacHeader {
    pub kind: FrameKind,
    /// Receiver address.
    pub addr1: MacAddress,
    /// Transmitter address.
    pub addr2: MacAddress,
    /// Duration/ID field.
    pub duration: Duration,
    /// 12-bit sequence number.
    pub sequence: u16,
    /// 4-bit fragment number.
    pub fragment: u8,
    pub more_fragments: bool,
}

impl MacHeader {
    pub fn new(kind: FrameKind, addr1: MacAddress, addr2: MacAddress) -> Self {
        Self {
            kind,
            addr1,
            addr2,
            duration: Duration::from_ticks(0),
            sequence: 0,
            fragment: 0,
            more_fragments: false,
        }
    }

    pub fn with_sequence(mut self, sequence: u16) -> Self {
        self.sequence = sequence % 4096;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn sequence_control(&self) -> u16 {
        (self.sequence << 4) | u16::from(self.fragment & 0x0f)
    }

    pub fn is_ctl(&self) -> bool {
        self.kind.class() == FrameClass::Control
    }

    /// True for both QoS and non-QoS data.
    pub fn is_data(&self) -> bool {
        self.kind.class() == FrameClass::Data
    }

    pub fn is_mgmt(&self) -> bool {
        self.kind.class() == FrameClass::Management
    }

    pub fn is_qos_data(&self) -> bool {
        matches!(self.kind, FrameKind::QosData { .. })
    }

    pub fn qos_tid(&self) -> Option<u8> {
        match self.kind {
            FrameKind::QosData { tid, .. } => Some(tid),
            _ => None,
        }
    }

    pub fn ack_policy(&self) -> Option<AckPolicy> {
        match self.kind {
            FrameKind::QosData { ack_policy, .. } => Some(ack_policy),
            _ => None,
        }
    }

    pub fn set_ack_policy(&mut self, policy: AckPolicy) {
        if let FrameKind::QosData { ack_policy, .. } = &mut self.kind {
            *ack_policy = policy;
        }
    }

    pub fn is_ack(&self) -> bool {
        self.kind == FrameKind::Ack
    }

    pub fn is_block_ack(&self) -> bool {
        matches!(self.kind, FrameKind::BlockAck(_))
    }

    pub fn is_block_ack_req(&self) -> bool {
        matches!(self.kind, FrameKind::BlockAckReq(_))
    }

    /// Serialized size of the header alone, FCS included for control frames.
    fn header_size(&self) -> u32 {
        match &self.kind {
            FrameKind::Rts => RTS_SIZE,
            FrameKind::Cts | FrameKind::Ack => CTS_SIZE,
            FrameKind::DmgCts => DMG_CTS_SIZE,
            FrameKind::BlockAckReq(_) => BLOCK_ACK_REQUEST_SIZE,
            FrameKind::BlockAck(ba) => ba.variant.block_ack_size(),
            FrameKind::ShortSsw => SHORT_SSW_SIZE,
            FrameKind::Grant(_) | FrameKind::Ssw | FrameKind::SswFeedback | FrameKind::SswAck | FrameKind::OtherControl => {
                CONTROL_FRAME_BASE_SIZE
            }
            FrameKind::QosData { .. } => QOS_DATA_HEADER_SIZE + FCS_SIZE,
            FrameKind::Data => DATA_HEADER_SIZE + FCS_SIZE,
            FrameKind::DmgBeacon | FrameKind::ActionNoAck | FrameKind::Management => MGMT_HEADER_SIZE + FCS_SIZE,
        }
    }
}

static NEXT_UID: AtomicU64 = AtomicU64::new(1);

/// One addressed MAC frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mpdu {
    pub header: MacHeader,
    /// Size of the opaque frame body in bytes.
    pub payload_size: u32,
    uid: u64,
}

impl Mpdu {
    pub fn new(header: MacHeader, payload_size: u32) -> Self {
        Self {
            header,
            payload_size,
            uid: NEXT_UID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Control frames carry no body beyond their fixed format.
    pub fn control(header: MacHeader) -> Self {
        Self::new(header, 0)
    }

    /// Identity of the underlying packet. Clones share it.
    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn size(&self) -> u32 {
        self.header.header_size() + self.payload_size
    }
}

/// How the MPDUs of a PSDU are framed on the air.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsduKind {
    /// A plain, non-aggregated MPDU.
    Single,
    /// A VHT/HE single MPDU sent inside an A-MPDU (EOF set).
    SMpdu,
    Ampdu,
}

/// PHY service data unit: one or more MPDUs sent as a single transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Psdu {
    mpdus: Vec<Mpdu>,
    kind: PsduKind,
}

impl Psdu {
    pub fn single(mpdu: Mpdu) -> Self {
        Self {
            mpdus: vec![mpdu],
            kind: PsduKind::Single,
        }
    }

    pub fn s_mpdu(mpdu: Mpdu) -> Self {
        Self {
            mpdus: vec![mpdu],
            kind: PsduKind::SMpdu,
        }
    }

    /// Build an A-MPDU. A one-element list is still framed as an A-MPDU.
    pub fn ampdu(mpdus: Vec<Mpdu>) -> Self {
        Self {
            mpdus,
            kind: PsduKind::Ampdu,
        }
    }

    pub fn kind(&self) -> PsduKind {
        self.kind
    }

    /// True for S-MPDUs.
    pub fn is_single(&self) -> bool {
        self.kind == PsduKind::SMpdu
    }

    /// True for S-MPDUs and A-MPDUs.
    pub fn is_aggregate(&self) -> bool {
        self.kind != PsduKind::Single
    }

    pub fn mpdus(&self) -> &[Mpdu] {
        &self.mpdus
    }

    pub fn into_mpdus(self) -> Vec<Mpdu> {
        self.mpdus
    }

    pub fn n_mpdus(&self) -> usize {
        self.mpdus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mpdus.is_empty()
    }

    /// Header of the first MPDU.
    pub fn header(&self) -> Option<&MacHeader> {
        self.mpdus.first().map(|m| &m.header)
    }

    pub fn addr1(&self) -> Option<MacAddress> {
        self.header().map(|h| h.addr1)
    }

    /// Set the Duration/ID field of every MPDU.
    pub fn set_duration(&mut self, duration: Duration) {
        for mpdu in &mut self.mpdus {
            mpdu.header.duration = duration;
        }
    }

    pub fn set_ack_policy(&mut self, policy: AckPolicy) {
        for mpdu in &mut self.mpdus {
            mpdu.header.set_ack_policy(policy);
        }
    }

    pub fn size(&self) -> u32 {
        match self.kind {
            PsduKind::Single => self.mpdus.iter().map(Mpdu::size).sum(),
            PsduKind::SMpdu | PsduKind::Ampdu => self.mpdus.iter().fold(0, |ampdu, mpdu| size_if_aggregated(mpdu.size(), ampdu)),
        }
    }
}
