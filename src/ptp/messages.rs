//! PTP message codec (Sync / Delay-Request / Announce)
//!
//! All fields are big-endian network order. The common header is 34 bytes:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | SdoId | Type  | Minor | Vers  |         messageLength         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    domain     |  minorSdoId   |           flagField           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! +                        correctionField                        +
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      messageTypeSpecific                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! +                                                               +
//! |                      sourcePortIdentity                       |
//! +                               +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                               |          sequenceId           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | controlField  |  logMsgIntvl  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Sync and Delay-Request share the same body (an origin timestamp).
//! The SPTP server repurposes the Sync origin timestamp to carry T4.

use byteorder::{ByteOrder, NetworkEndian};
use bytes::BytesMut;
use thiserror::Error;

use super::types::{
    ClockIdentity, ClockQuality, CorrectionField, MessageType, PortIdentity, PtpTimestamp,
    TimeSource, FLAG_UNICAST, LOG_MSG_INTERVAL_UNSET,
};

/// Common header length
pub const HEADER_LEN: usize = 34;

/// Total length of a Sync or Delay-Request without TLVs
pub const MSG_LEN_SYNC_DELAY_REQ: u16 = 44;

/// Total length of an Announce
pub const MSG_LEN_ANNOUNCE: u16 = 64;

/// versionPTP byte: major 2, minor 1 (IEEE 1588-2019)
const VERSION_PTP: u8 = 0x12;

/// TLV type requesting a response from an alternate source port
pub const TLV_ALTERNATE_RESPONSE_PORT: u16 = 0x200A;

/// Codec failures. Malformed packets are dropped and counted, never fatal.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("unsupported message type 0x{0:x}")]
    UnsupportedType(u8),
    #[error("unsupported PTP version 0x{0:x}")]
    UnsupportedVersion(u8),
    #[error("malformed {msg_type:?}: length field {have}, expected {want}")]
    Malformed {
        msg_type: MessageType,
        have: u16,
        want: u16,
    },
    #[error("malformed timestamp")]
    BadTimestamp,
}

/// Common 34-byte PTP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub message_type: MessageType,
    pub message_length: u16,
    pub domain_number: u8,
    pub flag_field: u16,
    pub correction_field: CorrectionField,
    pub source_port_identity: PortIdentity,
    pub sequence_id: u16,
    pub log_message_interval: i8,
}

impl Header {
    /// Header for an outgoing unicast message of the given type
    pub fn unicast(
        message_type: MessageType,
        message_length: u16,
        domain_number: u8,
        source_port_identity: PortIdentity,
    ) -> Self {
        Self {
            message_type,
            message_length,
            domain_number,
            flag_field: FLAG_UNICAST,
            correction_field: CorrectionField::default(),
            source_port_identity,
            sequence_id: 0,
            log_message_interval: LOG_MSG_INTERVAL_UNSET,
        }
    }

    /// Serialize into the first 34 bytes of `buf`
    pub fn write_bytes(&self, buf: &mut [u8]) {
        buf[0] = self.message_type as u8; // majorSdoId = 0
        buf[1] = VERSION_PTP;
        NetworkEndian::write_u16(&mut buf[2..4], self.message_length);
        buf[4] = self.domain_number;
        buf[5] = 0; // minorSdoId
        NetworkEndian::write_u16(&mut buf[6..8], self.flag_field);
        NetworkEndian::write_i64(&mut buf[8..16], self.correction_field.0);
        NetworkEndian::write_u32(&mut buf[16..20], 0); // messageTypeSpecific
        buf[20..28].copy_from_slice(&self.source_port_identity.clock_identity.0);
        NetworkEndian::write_u16(&mut buf[28..30], self.source_port_identity.port_number);
        NetworkEndian::write_u16(&mut buf[30..32], self.sequence_id);
        buf[32] = self.message_type.control_field();
        buf[33] = self.log_message_interval as u8;
    }

    /// Parse the common header
    pub fn parse(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::TooShort(buf.len()));
        }
        let message_type =
            MessageType::from_nibble(buf[0]).ok_or(CodecError::UnsupportedType(buf[0] & 0x0F))?;
        if buf[1] & 0x0F != 2 {
            return Err(CodecError::UnsupportedVersion(buf[1]));
        }
        let mut clock_identity = ClockIdentity::default();
        clock_identity.0.copy_from_slice(&buf[20..28]);
        Ok(Self {
            message_type,
            message_length: NetworkEndian::read_u16(&buf[2..4]),
            domain_number: buf[4],
            flag_field: NetworkEndian::read_u16(&buf[6..8]),
            correction_field: CorrectionField(NetworkEndian::read_i64(&buf[8..16])),
            source_port_identity: PortIdentity {
                clock_identity,
                port_number: NetworkEndian::read_u16(&buf[28..30]),
            },
            sequence_id: NetworkEndian::read_u16(&buf[30..32]),
            log_message_interval: buf[33] as i8,
        })
    }
}

/// Sync and Delay-Request share this layout: header + origin timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncDelayReq {
    pub header: Header,
    pub origin_timestamp: PtpTimestamp,
}

impl SyncDelayReq {
    /// Outgoing unicast Delay-Request template (sequence id stamped per send)
    pub fn delay_req(source: PortIdentity, domain_number: u8) -> Self {
        Self {
            header: Header::unicast(
                MessageType::DelayReq,
                MSG_LEN_SYNC_DELAY_REQ,
                domain_number,
                source,
            ),
            origin_timestamp: PtpTimestamp::default(),
        }
    }

    /// Unicast Sync carrying `t4` in the origin timestamp (SPTP server side
    /// and ptping probe responses)
    pub fn sync(source: PortIdentity, domain_number: u8, sequence_id: u16, t4: PtpTimestamp) -> Self {
        let mut header = Header::unicast(
            MessageType::Sync,
            MSG_LEN_SYNC_DELAY_REQ,
            domain_number,
            source,
        );
        header.sequence_id = sequence_id;
        Self {
            header,
            origin_timestamp: t4,
        }
    }

    /// Serialize, optionally appending an AlternateResponsePort TLV
    pub fn serialize(&self, tlv: Option<AlternateResponsePortTlv>, buf: &mut BytesMut) {
        buf.clear();
        let total = MSG_LEN_SYNC_DELAY_REQ as usize + tlv.map_or(0, |_| AlternateResponsePortTlv::WIRE_LEN);
        buf.resize(total, 0);
        let mut header = self.header;
        header.message_length = total as u16;
        header.write_bytes(&mut buf[..HEADER_LEN]);
        self.origin_timestamp.write_bytes(&mut buf[HEADER_LEN..HEADER_LEN + 10]);
        if let Some(tlv) = tlv {
            tlv.write_bytes(&mut buf[MSG_LEN_SYNC_DELAY_REQ as usize..total]);
        }
    }

    fn parse_body(header: Header, buf: &[u8]) -> Result<Self, CodecError> {
        let origin_timestamp = PtpTimestamp::from_bytes(&buf[HEADER_LEN..HEADER_LEN + 10])
            .ok_or(CodecError::BadTimestamp)?;
        Ok(Self {
            header,
            origin_timestamp,
        })
    }
}

/// Announce body (30 bytes after the header)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceBody {
    pub origin_timestamp: PtpTimestamp,
    pub current_utc_offset: i16,
    pub grandmaster_priority1: u8,
    pub grandmaster_clock_quality: ClockQuality,
    pub grandmaster_priority2: u8,
    pub grandmaster_identity: ClockIdentity,
    pub steps_removed: u16,
    pub time_source: TimeSource,
}

impl Default for AnnounceBody {
    fn default() -> Self {
        Self {
            origin_timestamp: PtpTimestamp::default(),
            current_utc_offset: 0,
            grandmaster_priority1: 128,
            grandmaster_clock_quality: ClockQuality::default(),
            grandmaster_priority2: 128,
            grandmaster_identity: ClockIdentity::default(),
            steps_removed: 0,
            time_source: TimeSource::InternalOscillator,
        }
    }
}

/// Announce message: header + AnnounceBody
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announce {
    pub header: Header,
    pub body: AnnounceBody,
}

impl Announce {
    /// Outgoing unicast Announce (ptping probe responses)
    pub fn unicast(
        source: PortIdentity,
        domain_number: u8,
        sequence_id: u16,
        body: AnnounceBody,
    ) -> Self {
        let mut header = Header::unicast(
            MessageType::Announce,
            MSG_LEN_ANNOUNCE,
            domain_number,
            source,
        );
        header.sequence_id = sequence_id;
        Self { header, body }
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.clear();
        buf.resize(MSG_LEN_ANNOUNCE as usize, 0);
        let mut header = self.header;
        header.message_length = MSG_LEN_ANNOUNCE;
        header.write_bytes(&mut buf[..HEADER_LEN]);
        let b = &mut buf[HEADER_LEN..];
        self.body.origin_timestamp.write_bytes(&mut b[0..10]);
        NetworkEndian::write_i16(&mut b[10..12], self.body.current_utc_offset);
        b[12] = 0; // reserved
        b[13] = self.body.grandmaster_priority1;
        b[14] = self.body.grandmaster_clock_quality.clock_class;
        b[15] = self.body.grandmaster_clock_quality.clock_accuracy;
        NetworkEndian::write_u16(
            &mut b[16..18],
            self.body.grandmaster_clock_quality.offset_scaled_log_variance,
        );
        b[18] = self.body.grandmaster_priority2;
        b[19..27].copy_from_slice(&self.body.grandmaster_identity.0);
        NetworkEndian::write_u16(&mut b[27..29], self.body.steps_removed);
        b[29] = self.body.time_source as u8;
    }

    fn parse_body(header: Header, buf: &[u8]) -> Result<Self, CodecError> {
        let b = &buf[HEADER_LEN..];
        let origin_timestamp =
            PtpTimestamp::from_bytes(&b[0..10]).ok_or(CodecError::BadTimestamp)?;
        let mut grandmaster_identity = ClockIdentity::default();
        grandmaster_identity.0.copy_from_slice(&b[19..27]);
        Ok(Self {
            header,
            body: AnnounceBody {
                origin_timestamp,
                current_utc_offset: NetworkEndian::read_i16(&b[10..12]),
                grandmaster_priority1: b[13],
                grandmaster_clock_quality: ClockQuality {
                    clock_class: b[14],
                    clock_accuracy: b[15],
                    offset_scaled_log_variance: NetworkEndian::read_u16(&b[16..18]),
                },
                grandmaster_priority2: b[18],
                grandmaster_identity,
                steps_removed: NetworkEndian::read_u16(&b[27..29]),
                time_source: TimeSource::from_u8(b[29]),
            },
        })
    }
}

/// AlternateResponsePort TLV: asks the server to answer from
/// `source port + offset` to probe asymmetric paths. Treated as opaque
/// beyond the offset; no server-side semantics are assumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlternateResponsePortTlv {
    pub offset: u16,
}

impl AlternateResponsePortTlv {
    pub const WIRE_LEN: usize = 6;

    pub fn write_bytes(&self, buf: &mut [u8]) {
        NetworkEndian::write_u16(&mut buf[0..2], TLV_ALTERNATE_RESPONSE_PORT);
        NetworkEndian::write_u16(&mut buf[2..4], 2); // lengthField
        NetworkEndian::write_u16(&mut buf[4..6], self.offset);
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_LEN {
            return None;
        }
        if NetworkEndian::read_u16(&buf[0..2]) != TLV_ALTERNATE_RESPONSE_PORT {
            return None;
        }
        if NetworkEndian::read_u16(&buf[2..4]) != 2 {
            return None;
        }
        Some(Self {
            offset: NetworkEndian::read_u16(&buf[4..6]),
        })
    }
}

/// A fully parsed incoming packet
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Packet {
    Sync(SyncDelayReq),
    DelayReq(SyncDelayReq, Option<AlternateResponsePortTlv>),
    Announce(Announce),
}

impl Packet {
    pub fn header(&self) -> &Header {
        match self {
            Packet::Sync(m) => &m.header,
            Packet::DelayReq(m, _) => &m.header,
            Packet::Announce(m) => &m.header,
        }
    }
}

/// Cheap message-type probe from the first byte, before a full parse
pub fn probe_message_type(buf: &[u8]) -> Option<MessageType> {
    buf.first().and_then(|b| MessageType::from_nibble(*b))
}

/// Parse a packet, validating the header length field against the type
pub fn parse(buf: &[u8]) -> Result<Packet, CodecError> {
    let header = Header::parse(buf)?;
    if (buf.len() as u16) < header.message_length {
        return Err(CodecError::TooShort(buf.len()));
    }
    match header.message_type {
        MessageType::Sync => {
            if header.message_length != MSG_LEN_SYNC_DELAY_REQ {
                return Err(CodecError::Malformed {
                    msg_type: MessageType::Sync,
                    have: header.message_length,
                    want: MSG_LEN_SYNC_DELAY_REQ,
                });
            }
            Ok(Packet::Sync(SyncDelayReq::parse_body(header, buf)?))
        }
        MessageType::DelayReq => {
            let with_tlv =
                MSG_LEN_SYNC_DELAY_REQ + AlternateResponsePortTlv::WIRE_LEN as u16;
            if header.message_length != MSG_LEN_SYNC_DELAY_REQ
                && header.message_length != with_tlv
            {
                return Err(CodecError::Malformed {
                    msg_type: MessageType::DelayReq,
                    have: header.message_length,
                    want: MSG_LEN_SYNC_DELAY_REQ,
                });
            }
            let tlv = if header.message_length == with_tlv {
                AlternateResponsePortTlv::from_bytes(&buf[MSG_LEN_SYNC_DELAY_REQ as usize..])
            } else {
                None
            };
            Ok(Packet::DelayReq(SyncDelayReq::parse_body(header, buf)?, tlv))
        }
        MessageType::Announce => {
            if header.message_length != MSG_LEN_ANNOUNCE {
                return Err(CodecError::Malformed {
                    msg_type: MessageType::Announce,
                    have: header.message_length,
                    want: MSG_LEN_ANNOUNCE,
                });
            }
            Ok(Packet::Announce(Announce::parse_body(header, buf)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> PortIdentity {
        PortIdentity {
            clock_identity: ClockIdentity([1, 2, 3, 4, 5, 6, 7, 8]),
            port_number: 1,
        }
    }

    #[test]
    fn test_delay_req_roundtrip() {
        let mut msg = SyncDelayReq::delay_req(source(), 0);
        msg.header.sequence_id = 0xBEEF;
        let mut buf = BytesMut::new();
        msg.serialize(None, &mut buf);
        assert_eq!(buf.len(), 44);

        match parse(&buf).unwrap() {
            Packet::DelayReq(parsed, tlv) => {
                assert_eq!(parsed.header.sequence_id, 0xBEEF);
                assert_eq!(parsed.header.source_port_identity, source());
                assert_eq!(parsed.header.flag_field & FLAG_UNICAST, FLAG_UNICAST);
                assert!(tlv.is_none());
            }
            other => panic!("expected DelayReq, got {:?}", other),
        }
    }

    #[test]
    fn test_delay_req_with_alternate_port_tlv() {
        let msg = SyncDelayReq::delay_req(source(), 0);
        let mut buf = BytesMut::new();
        msg.serialize(Some(AlternateResponsePortTlv { offset: 3 }), &mut buf);
        assert_eq!(buf.len(), 50);

        match parse(&buf).unwrap() {
            Packet::DelayReq(_, Some(tlv)) => assert_eq!(tlv.offset, 3),
            other => panic!("expected DelayReq with TLV, got {:?}", other),
        }
    }

    #[test]
    fn test_sync_carries_t4() {
        let t4 = PtpTimestamp::from_nanos(1_621_604_525_000_000_100);
        let msg = SyncDelayReq::sync(source(), 0, 42, t4);
        let mut buf = BytesMut::new();
        msg.serialize(None, &mut buf);

        match parse(&buf).unwrap() {
            Packet::Sync(parsed) => {
                assert_eq!(parsed.origin_timestamp, t4);
                assert_eq!(parsed.header.sequence_id, 42);
            }
            other => panic!("expected Sync, got {:?}", other),
        }
    }

    #[test]
    fn test_announce_roundtrip() {
        let body = AnnounceBody {
            origin_timestamp: PtpTimestamp::from_nanos(1_621_604_525_010_000_000),
            current_utc_offset: 37,
            grandmaster_priority1: 1,
            grandmaster_clock_quality: ClockQuality {
                clock_class: 6,
                clock_accuracy: 0x21,
                offset_scaled_log_variance: 0x4E5D,
            },
            grandmaster_priority2: 2,
            grandmaster_identity: ClockIdentity([8, 7, 6, 5, 4, 3, 2, 1]),
            steps_removed: 1,
            time_source: TimeSource::Gps,
        };
        let msg = Announce::unicast(source(), 0, 7, body);
        let mut buf = BytesMut::new();
        msg.serialize(&mut buf);
        assert_eq!(buf.len(), 64);

        match parse(&buf).unwrap() {
            Packet::Announce(parsed) => {
                assert_eq!(parsed.body, body);
                assert_eq!(parsed.header.sequence_id, 7);
            }
            other => panic!("expected Announce, got {:?}", other),
        }
    }

    #[test]
    fn test_correction_field_survives_header() {
        let mut msg = SyncDelayReq::sync(source(), 0, 1, PtpTimestamp::default());
        msg.header.correction_field = CorrectionField::from_nanos(6_000);
        let mut buf = BytesMut::new();
        msg.serialize(None, &mut buf);

        let parsed = parse(&buf).unwrap();
        assert_eq!(parsed.header().correction_field.nanos(), 6_000);
    }

    #[test]
    fn test_length_mismatch_is_malformed() {
        let msg = SyncDelayReq::delay_req(source(), 0);
        let mut buf = BytesMut::new();
        msg.serialize(None, &mut buf);
        // corrupt the length field
        buf[2] = 0;
        buf[3] = 40;
        assert!(matches!(
            parse(&buf),
            Err(CodecError::Malformed { .. })
        ));
    }

    #[test]
    fn test_probe_before_parse() {
        let msg = SyncDelayReq::delay_req(source(), 0);
        let mut buf = BytesMut::new();
        msg.serialize(None, &mut buf);
        assert_eq!(probe_message_type(&buf), Some(MessageType::DelayReq));
        assert_eq!(probe_message_type(&[0x08]), None);
        assert_eq!(probe_message_type(&[]), None);
    }

    #[test]
    fn test_short_packet_rejected() {
        assert!(matches!(parse(&[0u8; 10]), Err(CodecError::TooShort(10))));
    }
}
