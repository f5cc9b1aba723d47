use thiserror::Error;

/// Fatal conditions raised by the MAC low layer.
///
/// Timing failures (missed CTS, Ack or BlockAck) are not errors: they are
/// reported to the exchange owner as events. Everything here means the
/// caller drove the engine into a state it cannot continue from.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MacError {
    /// A frame arrived in a context where the protocol forbids it
    /// (for example an RTS inside an A-MPDU).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A feature the engine does not implement was requested.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A timer kind was armed while its previous instance was still pending.
    #[error("timer {timer} armed while still pending")]
    TimerAlreadyArmed { timer: String },

    /// A Duration/ID field computed to a negative value.
    #[error("invalid duration field: {0}")]
    InvalidDuration(String),

    /// An operation needed the in-flight transmission context but none exists.
    #[error("no transmission in progress")]
    NoCurrentTransmission,

    /// A resume was requested but no suspended transmission was restored.
    #[error("no suspended transmission restored for allocation {0}")]
    NothingToResume(u8),
}

pub type Result<T> = std::result::Result<T, MacError>;
