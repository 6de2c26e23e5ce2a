//! PTP Wire-Format (IEEE 1588v2.1, Unicast-Teilmenge)
//!
//! Implementiert die drei Nachrichten des SPTP-Austauschs:
//! Delay-Request, Sync und Announce, jeweils im Big-Endian Netzwerkformat.

mod messages;
mod types;

pub use messages::{
    parse, probe_message_type, AlternateResponsePortTlv, Announce, AnnounceBody, CodecError,
    Header, Packet, SyncDelayReq, HEADER_LEN, MSG_LEN_ANNOUNCE, MSG_LEN_SYNC_DELAY_REQ,
    TLV_ALTERNATE_RESPONSE_PORT,
};
pub use types::{
    ClockIdentity, ClockQuality, CorrectionField, MessageType, PortIdentity, PtpTimestamp,
    TimeSource, FLAG_UNICAST, LOG_MSG_INTERVAL_UNSET,
};

/// PTP Event-Port (Sync, Delay-Request - mit Timestamps)
pub const PTP_EVENT_PORT: u16 = 319;

/// PTP General-Port (Announce - ohne Timestamps)
pub const PTP_GENERAL_PORT: u16 = 320;
