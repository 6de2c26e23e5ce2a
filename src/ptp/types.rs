//! PTP primitive types shared by all message codecs.
//!
//! Everything here maps 1:1 onto wire fields of IEEE 1588-2019 messages.
//! Timestamps use the PTP epoch (TAI); arithmetic on measurements happens
//! in plain nanoseconds.

use std::fmt;

/// Unicast flag in the PTP flagField (byte 0, bit 2)
pub const FLAG_UNICAST: u16 = 1 << 10;

/// logMessageInterval value meaning "not set"
pub const LOG_MSG_INTERVAL_UNSET: i8 = 0x7f;

/// PTP message types (lower nibble of the first header byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Sync = 0x0,
    DelayReq = 0x1,
    Announce = 0xB,
}

impl MessageType {
    /// Decode from the lower nibble of the first header byte
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble & 0x0F {
            0x0 => Some(MessageType::Sync),
            0x1 => Some(MessageType::DelayReq),
            0xB => Some(MessageType::Announce),
            _ => None,
        }
    }

    /// controlField value for legacy hardware (Sync=0, Delay_Req=1, other=5)
    pub fn control_field(&self) -> u8 {
        match self {
            MessageType::Sync => 0,
            MessageType::DelayReq => 1,
            MessageType::Announce => 5,
        }
    }
}

/// Clock Identity (EUI-64) - 8 bytes identifying a PTP clock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockIdentity(pub [u8; 8]);

impl fmt::Display for ClockIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self
            .0
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":");
        write!(f, "{}", s)
    }
}

/// Port Identity - clock identity plus port number
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortIdentity {
    pub clock_identity: ClockIdentity,
    pub port_number: u16,
}

impl fmt::Display for PortIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.clock_identity, self.port_number)
    }
}

/// PTP wire timestamp: 48-bit seconds + 32-bit nanoseconds, big-endian
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PtpTimestamp {
    pub seconds: u64,
    pub nanoseconds: u32,
}

impl PtpTimestamp {
    pub const WIRE_LEN: usize = 10;

    /// Build from total nanoseconds since the epoch
    pub fn from_nanos(ns: i64) -> Self {
        let ns = ns.max(0) as u64;
        Self {
            seconds: ns / 1_000_000_000,
            nanoseconds: (ns % 1_000_000_000) as u32,
        }
    }

    /// Total nanoseconds since the epoch
    pub fn nanos(&self) -> i64 {
        self.seconds as i64 * 1_000_000_000 + self.nanoseconds as i64
    }

    /// Serialize into 10 bytes (uint48 seconds, uint32 nanoseconds)
    pub fn write_bytes(&self, buf: &mut [u8]) {
        let secs = self.seconds.to_be_bytes();
        buf[..6].copy_from_slice(&secs[2..8]);
        buf[6..10].copy_from_slice(&self.nanoseconds.to_be_bytes());
    }

    /// Parse from 10 bytes; rejects nanoseconds >= 10^9
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_LEN {
            return None;
        }
        let seconds = u64::from_be_bytes([0, 0, buf[0], buf[1], buf[2], buf[3], buf[4], buf[5]]);
        let nanoseconds = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
        if nanoseconds >= 1_000_000_000 {
            return None;
        }
        Some(Self {
            seconds,
            nanoseconds,
        })
    }
}

/// correctionField: nanoseconds scaled by 2^16
///
/// Arithmetic ignores the fractional part. Values whose integer part would
/// not fit are treated as zero, the way one-step transparent clocks signal
/// "too big".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrectionField(pub i64);

impl CorrectionField {
    /// Build from integer nanoseconds
    pub fn from_nanos(ns: i64) -> Self {
        Self(ns << 16)
    }

    /// Integer nanoseconds, truncating the fractional 16 bits.
    /// Returns 0 when the raw value exceeds i64::MAX / 2^16.
    pub fn nanos(&self) -> i64 {
        if self.0 > i64::MAX >> 16 {
            return 0;
        }
        self.0 >> 16
    }
}

/// Clock Quality as carried in Announce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockQuality {
    /// Clock class (6 = primary reference, 248 = default)
    pub clock_class: u8,
    /// Clock accuracy enum (0x20 = within 25ns; lower is better)
    pub clock_accuracy: u8,
    /// offsetScaledLogVariance (stability; lower is better)
    pub offset_scaled_log_variance: u16,
}

impl Default for ClockQuality {
    fn default() -> Self {
        Self {
            clock_class: 248,
            clock_accuracy: 0xFE,
            offset_scaled_log_variance: 0xFFFF,
        }
    }
}

/// timeSource - origin of the time used by the grandmaster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TimeSource {
    AtomicClock = 0x10,
    Gps = 0x20,
    TerrestrialRadio = 0x30,
    Ptp = 0x40,
    Ntp = 0x50,
    HandSet = 0x60,
    Other = 0x90,
    InternalOscillator = 0xA0,
}

impl TimeSource {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0x10 => TimeSource::AtomicClock,
            0x20 => TimeSource::Gps,
            0x30 => TimeSource::TerrestrialRadio,
            0x40 => TimeSource::Ptp,
            0x50 => TimeSource::Ntp,
            0x60 => TimeSource::HandSet,
            0xA0 => TimeSource::InternalOscillator,
            _ => TimeSource::Other,
        }
    }
}

impl fmt::Display for TimeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeSource::AtomicClock => write!(f, "ATOMIC_CLOCK"),
            TimeSource::Gps => write!(f, "GPS"),
            TimeSource::TerrestrialRadio => write!(f, "TERRESTRIAL_RADIO"),
            TimeSource::Ptp => write!(f, "PTP"),
            TimeSource::Ntp => write!(f, "NTP"),
            TimeSource::HandSet => write!(f, "HAND_SET"),
            TimeSource::Other => write!(f, "OTHER"),
            TimeSource::InternalOscillator => write!(f, "INTERNAL_OSCILLATOR"),
        }
    }
}
