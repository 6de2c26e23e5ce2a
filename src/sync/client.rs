//! Per-GM client: one SPTP exchange per tick against one grandmaster.
//!
//! The client owns its measurement store and parses everything itself;
//! the coordinator's listeners only route raw datagrams into the inbox by
//! source address. Outgoing sequence ids carry the tenant tag in their
//! top bits so several clients can share a port without collisions.

use std::net::SocketAddr;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::net::{TsError, TsSocket};
use crate::ptp::{self, AlternateResponsePortTlv, Packet, PortIdentity, SyncDelayReq};
use crate::stats::Stats;
use crate::sync::measurement::{MeasurementConfig, MeasurementResult, MeasurementStore};
use crate::sync::ExchangeError;

/// Tenant tag: the top `bits` of every sequence id are forced to `value`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceMask {
    mask: u16,
    value: u16,
}

impl SequenceMask {
    pub fn new(bits: u8, value: u16) -> Self {
        let bits = bits.min(15);
        if bits == 0 {
            return Self { mask: 0, value: 0 };
        }
        let mask = !(u16::MAX >> bits);
        Self {
            mask,
            value: (value << (16 - bits)) & mask,
        }
    }

    /// True when the packet belongs to this tenant
    pub fn matches(&self, seq: u16) -> bool {
        seq & self.mask == self.value
    }

    fn apply(&self, seq: u16) -> u16 {
        (seq & !self.mask) | self.value
    }
}

/// Raw datagram routed to a client by the coordinator's listeners
#[derive(Debug, Clone)]
pub struct InPacket {
    pub payload: Vec<u8>,
    /// RX timestamp for event-port packets, None on the general port
    pub rx_timestamp_ns: Option<i64>,
}

/// One client per configured grandmaster
pub struct SptpClient {
    /// GM event address (port 319)
    gm_addr: SocketAddr,
    socket: Arc<TsSocket>,
    /// Serializes send + TX-timestamp readout on a shared event socket;
    /// None in parallel-TX mode
    tx_serialize: Option<Arc<Mutex<()>>>,
    seq_mask: SequenceMask,
    /// Current sequence id, randomly initialized
    seq: u16,
    template: SyncDelayReq,
    tlv: Option<AlternateResponsePortTlv>,
    out_buf: BytesMut,
    store: MeasurementStore,
    inbox: Receiver<InPacket>,
    stats: Arc<Stats>,
}

impl SptpClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gm_addr: SocketAddr,
        socket: Arc<TsSocket>,
        tx_serialize: Option<Arc<Mutex<()>>>,
        source: PortIdentity,
        domain_number: u8,
        seq_mask: SequenceMask,
        alternate_port_offset: u16,
        measurement: MeasurementConfig,
        inbox: Receiver<InPacket>,
        stats: Arc<Stats>,
    ) -> Self {
        let tlv = (alternate_port_offset > 0).then_some(AlternateResponsePortTlv {
            offset: alternate_port_offset,
        });
        Self {
            gm_addr,
            socket,
            tx_serialize,
            seq_mask,
            seq: seq_mask.apply(rand::random()),
            template: SyncDelayReq::delay_req(source, domain_number),
            tlv,
            out_buf: BytesMut::with_capacity(128),
            store: MeasurementStore::new(measurement),
            inbox,
            stats,
        }
    }

    fn next_seq(&mut self) -> u16 {
        self.seq = self.seq_mask.apply(self.seq.wrapping_add(1));
        self.seq
    }

    /// One full exchange: send the Delay-Request, record T3, then fold
    /// inbox packets until the measurement completes or the deadline hits.
    pub fn run_once(&mut self, timeout: Duration) -> Result<MeasurementResult, ExchangeError> {
        let deadline = Instant::now() + timeout;
        self.store.cleanup();
        // packets from previous ticks are stale by definition
        while self.inbox.try_recv().is_ok() {}

        let seq = self.next_seq();
        let mut msg = self.template;
        msg.header.sequence_id = seq;
        msg.serialize(self.tlv, &mut self.out_buf);

        let tx_ts = {
            let _guard = self.tx_serialize.as_ref().map(|l| l.lock());
            self.socket
                .send_with_ts(&self.out_buf, self.gm_addr, seq)
                .map_err(|e| match e {
                    TsError::Io(io) => ExchangeError::Send(io),
                    other => ExchangeError::Timestamp(other),
                })?
        };
        self.stats.inc_tx_delay_req(self.gm_addr.ip());
        self.store.add_t3(seq, tx_ts);
        trace!("sent delay-req seq {} to {} (T3 {})", seq, self.gm_addr, tx_ts);

        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(ExchangeError::Deadline)?;
            match self.inbox.recv_timeout(remaining) {
                Ok(packet) => {
                    self.handle_packet(&packet)?;
                    if let Ok(result) = self.store.latest() {
                        return Ok(result);
                    }
                }
                Err(RecvTimeoutError::Timeout) => return Err(ExchangeError::Deadline),
                Err(RecvTimeoutError::Disconnected) => return Err(ExchangeError::Deadline),
            }
        }
    }

    /// Parse one routed datagram and fold it into the store. Packets of
    /// another tenant (masked sequence id mismatch) are dropped silently.
    fn handle_packet(&mut self, packet: &InPacket) -> Result<(), ExchangeError> {
        let parsed = ptp::parse(&packet.payload).map_err(ExchangeError::Codec)?;
        let seq = parsed.header().sequence_id;
        if !self.seq_mask.matches(seq) {
            trace!("ignoring foreign-tenant packet seq {:#06x} from {}", seq, self.gm_addr);
            return Ok(());
        }
        match parsed {
            Packet::Sync(sync) => {
                let Some(t2) = packet.rx_timestamp_ns else {
                    debug!("sync without RX timestamp from {}", self.gm_addr);
                    return Ok(());
                };
                self.stats.inc_rx_sync(self.gm_addr.ip());
                self.store.add_sync(
                    seq,
                    t2,
                    sync.header.correction_field.nanos(),
                    sync.origin_timestamp.nanos(),
                );
            }
            Packet::Announce(announce) => {
                self.stats.inc_rx_announce(self.gm_addr.ip());
                self.store.add_announce(
                    seq,
                    announce.body.origin_timestamp.nanos(),
                    announce.header.correction_field.nanos(),
                    announce,
                );
            }
            Packet::DelayReq(..) => {
                debug!("unexpected delay-req from GM {}", self.gm_addr);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{open_udp_socket, TsMode};
    use crate::ptp::{Announce, AnnounceBody, ClockIdentity, CorrectionField, PtpTimestamp};
    use std::sync::mpsc;

    #[test]
    fn test_mask_disabled_passes_everything() {
        let mask = SequenceMask::new(0, 0);
        assert!(mask.matches(0x0000));
        assert!(mask.matches(0xFFFF));
        assert_eq!(mask.apply(0x1234), 0x1234);
    }

    #[test]
    fn test_mask_forces_top_bits() {
        let mask = SequenceMask::new(2, 0b10);
        for seq in [0u16, 1, 0x3FFF, 0xFFFF] {
            let tagged = mask.apply(seq);
            assert_eq!(tagged >> 14, 0b10);
            assert!(mask.matches(tagged));
        }
        assert!(!mask.matches(0x0001));
        assert!(!mask.matches(0xFFFF));
    }

    #[test]
    fn test_mask_preserves_low_bits() {
        let mask = SequenceMask::new(4, 0xA);
        assert_eq!(mask.apply(0x0123) & 0x0FFF, 0x0123);
    }

    fn port_identity() -> PortIdentity {
        PortIdentity {
            clock_identity: ClockIdentity([9, 9, 9, 9, 9, 9, 9, 9]),
            port_number: 1,
        }
    }

    fn loopback_client(inbox: Receiver<InPacket>) -> (SptpClient, std::net::UdpSocket) {
        let sock = open_udp_socket("127.0.0.1:0".parse().unwrap(), None, 0).unwrap();
        let ts_sock = Arc::new(
            TsSocket::new(sock, None, TsMode::Software, 10, Duration::from_millis(2)).unwrap(),
        );
        // the "GM" is a plain socket owned by the test
        let gm = open_udp_socket("127.0.0.1:0".parse().unwrap(), None, 0).unwrap();
        gm.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let gm_addr = gm.local_addr().unwrap();

        let client = SptpClient::new(
            gm_addr,
            ts_sock,
            Some(Arc::new(Mutex::new(()))),
            port_identity(),
            0,
            SequenceMask::new(0, 0),
            0,
            MeasurementConfig::default(),
            inbox,
            Arc::new(Stats::new()),
        );
        (client, gm)
    }

    fn wall_now_ns() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos() as i64
    }

    #[test]
    fn test_run_once_times_out_without_responses() {
        let (_tx, rx) = mpsc::channel();
        let (mut client, _gm) = loopback_client(rx);
        let err = client.run_once(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, ExchangeError::Deadline));
    }

    #[test]
    fn test_run_once_completes_from_inbox() {
        let (tx, rx) = mpsc::channel();
        let (mut client, gm) = loopback_client(rx);

        // play the server: read the real Delay-Request to learn its
        // sequence id, then push a matching Sync and Announce into the
        // inbox the way the coordinator listener would
        let feeder = std::thread::spawn(move || {
            let mut buf = [0u8; 128];
            let (n, _src) = gm.recv_from(&mut buf).expect("delay-req");
            let parsed = ptp::parse(&buf[..n]).expect("valid delay-req");
            let seq = parsed.header().sequence_id;

            let source = PortIdentity {
                clock_identity: ClockIdentity([1; 8]),
                port_number: 1,
            };
            let now = wall_now_ns();
            let t4 = now + 100_000_000;
            let t1 = now + 10_000_000;
            let t2 = now + 110_000_000;

            let mut sync = SyncDelayReq::sync(source, 0, seq, PtpTimestamp::from_nanos(t4));
            sync.header.correction_field = CorrectionField::from_nanos(2_000);
            let mut buf = BytesMut::new();
            sync.serialize(None, &mut buf);
            tx.send(InPacket {
                payload: buf.to_vec(),
                rx_timestamp_ns: Some(t2),
            })
            .unwrap();

            let mut announce = Announce::unicast(source, 0, seq, AnnounceBody {
                origin_timestamp: PtpTimestamp::from_nanos(t1),
                ..AnnounceBody::default()
            });
            announce.header.correction_field = CorrectionField::from_nanos(1_000);
            let mut buf = BytesMut::new();
            announce.serialize(&mut buf);
            tx.send(InPacket {
                payload: buf.to_vec(),
                rx_timestamp_ns: None,
            })
            .unwrap();
        });

        let result = client.run_once(Duration::from_millis(500)).expect("exchange");
        feeder.join().unwrap();

        assert!(result.t3 > 0);
        assert_eq!(result.cf_rx_ns, 2_000);
        assert_eq!(result.cf_tx_ns, 1_000);
        assert!(result.delay_ns > 0.0);
    }

    #[test]
    fn test_malformed_inbox_packet_is_codec_error() {
        let (tx, rx) = mpsc::channel();
        let (mut client, gm) = loopback_client(rx);

        // packets queued before the exchange are drained as stale, so the
        // malformed one must arrive after the Delay-Request went out
        let feeder = std::thread::spawn(move || {
            let mut buf = [0u8; 128];
            gm.recv_from(&mut buf).expect("delay-req");
            tx.send(InPacket {
                payload: vec![0u8; 44],
                rx_timestamp_ns: Some(1),
            })
            .unwrap();
        });

        let err = client.run_once(Duration::from_millis(500)).unwrap_err();
        feeder.join().unwrap();
        assert!(matches!(err, ExchangeError::Codec(_)));
    }
}
