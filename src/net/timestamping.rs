//! Linux packet timestamping: SO_TIMESTAMPING, the error-queue TX path
//! and cmsg RX timestamps.
//!
//! TX timestamps come back through MSG_ERRQUEUE after the send; the reader
//! polls POLLPRI and drains the queue so a stale timestamp from an earlier
//! send can never be matched to a new Delay-Request. On kernels with
//! SCM_TS_OPT_ID the sequence id rides along in a cmsg and the reader
//! matches by id instead of FIFO order; the first EINVAL downgrades the
//! socket to FIFO for its remaining lifetime.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

// Linux constants not in stable libc
mod linux_consts {
    pub const SOF_TIMESTAMPING_TX_HARDWARE: u32 = 1 << 0;
    pub const SOF_TIMESTAMPING_TX_SOFTWARE: u32 = 1 << 1;
    pub const SOF_TIMESTAMPING_RX_HARDWARE: u32 = 1 << 2;
    pub const SOF_TIMESTAMPING_RX_SOFTWARE: u32 = 1 << 3;
    pub const SOF_TIMESTAMPING_SOFTWARE: u32 = 1 << 4;
    pub const SOF_TIMESTAMPING_RAW_HARDWARE: u32 = 1 << 6;
    pub const SOF_TIMESTAMPING_OPT_ID: u32 = 1 << 7;
    pub const SOF_TIMESTAMPING_OPT_TSONLY: u32 = 1 << 11;

    pub const SO_SELECT_ERR_QUEUE: libc::c_int = 45;

    /// Per-sendmsg timestamp id, kernel >= 6.13
    pub const SCM_TS_OPT_ID: libc::c_int = 81;

    pub const IP_RECVERR: libc::c_int = 11;
    pub const IPV6_RECVERR: libc::c_int = 25;
    pub const SO_EE_ORIGIN_TIMESTAMPING: u8 = 4;

    pub const SIOCSHWTSTAMP: libc::c_ulong = 0x89b0;
    pub const HWTSTAMP_TX_ON: libc::c_int = 1;
    pub const HWTSTAMP_FILTER_ALL: libc::c_int = 1;
}

/// Timestamping mode for the event socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsMode {
    Hardware,
    Software,
}

/// Timestamping failures
#[derive(Debug, Error)]
pub enum TsError {
    #[error("no TX timestamp after polling the error queue")]
    NoTxTimestamp,
    #[error("zero timestamp in receive cmsg")]
    ZeroTimestamp,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// `struct sock_extended_err` from linux/errqueue.h
#[repr(C)]
#[derive(Clone, Copy)]
struct SockExtendedErr {
    ee_errno: u32,
    ee_origin: u8,
    ee_type: u8,
    ee_code: u8,
    ee_pad: u8,
    ee_info: u32,
    ee_data: u32,
}

/// `struct hwtstamp_config` from linux/net_tstamp.h
#[repr(C)]
struct HwtstampConfig {
    flags: libc::c_int,
    tx_type: libc::c_int,
    rx_filter: libc::c_int,
}

/// `struct ifreq` with the data-pointer arm of the union
#[repr(C)]
struct IfreqData {
    ifr_name: [libc::c_char; libc::IF_NAMESIZE],
    ifr_data: *mut libc::c_void,
}

/// UDP socket with kernel TX/RX timestamping enabled
pub struct TsSocket {
    socket: UdpSocket,
    /// SCM_TS_OPT_ID still believed supported by the kernel
    ts_opt_id: AtomicBool,
    attempts_txts: u32,
    timeout_txts: Duration,
}

impl TsSocket {
    /// Wrap a bound socket, enabling timestamps. Hardware mode also flips
    /// the interface to TX-on / RX-all via SIOCSHWTSTAMP and enables
    /// SELECT_ERR_QUEUE.
    pub fn new(
        socket: UdpSocket,
        iface: Option<&str>,
        mode: TsMode,
        attempts_txts: u32,
        timeout_txts: Duration,
    ) -> io::Result<Self> {
        let fd = socket.as_raw_fd();

        let flags: u32 = match mode {
            TsMode::Hardware => {
                linux_consts::SOF_TIMESTAMPING_TX_HARDWARE
                    | linux_consts::SOF_TIMESTAMPING_RX_HARDWARE
                    | linux_consts::SOF_TIMESTAMPING_RAW_HARDWARE
                    | linux_consts::SOF_TIMESTAMPING_OPT_TSONLY
                    | linux_consts::SOF_TIMESTAMPING_OPT_ID
            }
            TsMode::Software => {
                linux_consts::SOF_TIMESTAMPING_TX_SOFTWARE
                    | linux_consts::SOF_TIMESTAMPING_RX_SOFTWARE
                    | linux_consts::SOF_TIMESTAMPING_SOFTWARE
                    | linux_consts::SOF_TIMESTAMPING_OPT_TSONLY
                    | linux_consts::SOF_TIMESTAMPING_OPT_ID
            }
        };

        if mode == TsMode::Hardware {
            let iface = iface.ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "hardware timestamping requires an interface",
                )
            })?;
            enable_hw_timestamping(fd, iface)?;
            setsockopt_int(fd, libc::SOL_SOCKET, linux_consts::SO_SELECT_ERR_QUEUE, 1)?;
        }

        setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_TIMESTAMPING, flags as libc::c_int)?;

        Ok(Self {
            socket,
            ts_opt_id: AtomicBool::new(true),
            attempts_txts: attempts_txts.max(1),
            timeout_txts,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(dur)
    }

    /// Plain send without TX-timestamp retrieval (probe responses)
    pub fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, dst)
    }

    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Send `buf` and return the kernel TX timestamp in nanoseconds.
    ///
    /// `seq_id` is passed as SCM_TS_OPT_ID where supported so the error
    /// queue entry can be matched by id; otherwise the newest drained
    /// entry wins.
    pub fn send_with_ts(&self, buf: &[u8], dst: SocketAddr, seq_id: u16) -> Result<i64, TsError> {
        if self.ts_opt_id.load(Ordering::Relaxed) {
            match self.sendmsg_with_id(buf, dst, seq_id as u32) {
                Ok(_) => return self.fetch_tx_timestamp(Some(seq_id as u32)),
                Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                    warn!(
                        "kernel rejected SCM_TS_OPT_ID, falling back to FIFO timestamp matching"
                    );
                    self.ts_opt_id.store(false, Ordering::Relaxed);
                }
                Err(e) => return Err(TsError::Io(e)),
            }
        }
        self.socket.send_to(buf, dst)?;
        self.fetch_tx_timestamp(None)
    }

    /// Receive a packet with its RX timestamp in nanoseconds
    pub fn recv_with_ts(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr, i64), TsError> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut control = [0u8; 512];

        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = &mut storage as *mut _ as *mut libc::c_void;
        msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.len();

        // SAFETY: msg points at valid, live buffers for the duration of the call
        let n = unsafe { libc::recvmsg(self.fd(), &mut msg, 0) };
        if n < 0 {
            return Err(TsError::Io(io::Error::last_os_error()));
        }

        let ts = cmsg_rx_timestamp(&msg).ok_or(TsError::ZeroTimestamp)?;
        let addr = sockaddr_to_addr(&storage).ok_or_else(|| {
            TsError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "unparseable source address",
            ))
        })?;
        Ok((n as usize, addr, ts))
    }

    fn sendmsg_with_id(&self, buf: &[u8], dst: SocketAddr, id: u32) -> io::Result<usize> {
        let (storage, addr_len) = sockaddr_from_addr(dst);
        let mut iov = libc::iovec {
            iov_base: buf.as_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut control = [0u8; 64];

        unsafe {
            let mut msg: libc::msghdr = mem::zeroed();
            msg.msg_name = &storage as *const _ as *mut libc::c_void;
            msg.msg_namelen = addr_len;
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = libc::CMSG_SPACE(4) as usize;

            // SAFETY: control is large enough for one u32 cmsg
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = linux_consts::SCM_TS_OPT_ID;
            (*cmsg).cmsg_len = libc::CMSG_LEN(4) as usize;
            ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut u32, id);

            let n = libc::sendmsg(self.fd(), &msg, 0);
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(n as usize)
        }
    }

    /// Poll the error queue up to `attempts_txts` times; drain everything
    /// queued and keep the newest (or id-matching) timestamp.
    fn fetch_tx_timestamp(&self, want_id: Option<u32>) -> Result<i64, TsError> {
        let mut newest: Option<i64> = None;
        for _ in 0..self.attempts_txts {
            self.poll_errqueue(self.timeout_txts)?;
            loop {
                match self.read_errqueue()? {
                    Some((ts, id)) => {
                        let accepted = match want_id {
                            Some(want) => id == Some(want),
                            None => true,
                        };
                        if accepted {
                            if let Some(ts) = ts {
                                newest = Some(ts);
                            }
                        }
                    }
                    None => {
                        // queue drained
                        if let Some(ts) = newest {
                            return Ok(ts);
                        }
                        break;
                    }
                }
            }
        }
        Err(TsError::NoTxTimestamp)
    }

    fn poll_errqueue(&self, timeout: Duration) -> io::Result<()> {
        let mut pfd = libc::pollfd {
            fd: self.fd(),
            events: libc::POLLPRI,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().max(1) as libc::c_int;
        // SAFETY: pfd is a valid pollfd for the duration of the call
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// One MSG_ERRQUEUE read. `None` means the queue is empty; otherwise
    /// the entry's timestamp (if any) and its OPT_ID.
    fn read_errqueue(&self) -> io::Result<Option<(Option<i64>, Option<u32>)>> {
        // OPT_TSONLY: no payload comes back, but leave room anyway
        let mut data = [0u8; 64];
        let mut control = [0u8; 512];

        let mut iov = libc::iovec {
            iov_base: data.as_mut_ptr() as *mut libc::c_void,
            iov_len: data.len(),
        };
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.len();

        // SAFETY: msg points at valid, live buffers for the duration of the call
        let n = unsafe { libc::recvmsg(self.fd(), &mut msg, libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT) };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock => Ok(None),
                _ => Err(err),
            };
        }

        let mut ts: Option<i64> = None;
        let mut id: Option<u32> = None;
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                let level = (*cmsg).cmsg_level;
                let ctype = (*cmsg).cmsg_type;
                if level == libc::SOL_SOCKET && ctype == libc::SO_TIMESTAMPING {
                    // SCM_TIMESTAMPING == SO_TIMESTAMPING
                    let tss =
                        ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const [libc::timespec; 3]);
                    ts = select_timestamp(&tss);
                } else if (level == libc::IPPROTO_IP && ctype == linux_consts::IP_RECVERR)
                    || (level == libc::IPPROTO_IPV6 && ctype == linux_consts::IPV6_RECVERR)
                {
                    let ee =
                        ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const SockExtendedErr);
                    if ee.ee_origin == linux_consts::SO_EE_ORIGIN_TIMESTAMPING {
                        id = Some(ee.ee_data);
                    } else {
                        debug!("error queue entry with origin {} ignored", ee.ee_origin);
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }
        Ok(Some((ts, id)))
    }
}

/// Pick the usable slot of a `scm_timestamping`: ts[0] software,
/// ts[1] legacy (unused), ts[2] raw hardware. First non-zero of
/// {hardware, software} wins; both zero means no timestamp.
fn select_timestamp(tss: &[libc::timespec; 3]) -> Option<i64> {
    let hw = timespec_nanos(&tss[2]);
    if hw != 0 {
        return Some(hw);
    }
    let sw = timespec_nanos(&tss[0]);
    if sw != 0 {
        return Some(sw);
    }
    None
}

fn timespec_nanos(ts: &libc::timespec) -> i64 {
    ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
}

/// Extract the RX timestamp from a received message's control data
fn cmsg_rx_timestamp(msg: &libc::msghdr) -> Option<i64> {
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SO_TIMESTAMPING
            {
                let tss = ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const [libc::timespec; 3]);
                return select_timestamp(&tss);
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
    None
}

fn sockaddr_from_addr(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
            // SAFETY: sockaddr_storage is large enough for sockaddr_in
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                (*sin).sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                };
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            // SAFETY: sockaddr_storage is large enough for sockaddr_in6
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_addr.s6_addr = v6.ip().octets();
                (*sin6).sin6_scope_id = v6.scope_id();
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: ss_family says this is a sockaddr_in
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            // SAFETY: ss_family says this is a sockaddr_in6
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(
                IpAddr::V6(ip),
                u16::from_be(sin6.sin6_port),
            ))
        }
        _ => None,
    }
}

/// SIOCSHWTSTAMP: switch the interface to TX-on / RX-all
fn enable_hw_timestamping(fd: RawFd, iface: &str) -> io::Result<()> {
    if iface.len() >= libc::IF_NAMESIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "interface name too long",
        ));
    }
    let mut config = HwtstampConfig {
        flags: 0,
        tx_type: linux_consts::HWTSTAMP_TX_ON,
        rx_filter: linux_consts::HWTSTAMP_FILTER_ALL,
    };
    let mut req: IfreqData = unsafe { mem::zeroed() };
    for (dst, src) in req.ifr_name.iter_mut().zip(iface.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    req.ifr_data = &mut config as *mut _ as *mut libc::c_void;

    // SAFETY: req and config outlive the ioctl call
    let ret = unsafe { libc::ioctl(fd, linux_consts::SIOCSHWTSTAMP, &mut req) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn setsockopt_int(
    fd: RawFd,
    level: libc::c_int,
    option: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    // SAFETY: value is a live c_int and the size matches
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            option,
            &value as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::open_udp_socket;

    fn tspec(sec: i64, nsec: i64) -> libc::timespec {
        libc::timespec {
            tv_sec: sec,
            tv_nsec: nsec,
        }
    }

    #[test]
    fn test_select_timestamp_prefers_hardware() {
        let tss = [tspec(100, 1), tspec(0, 0), tspec(200, 2)];
        assert_eq!(select_timestamp(&tss), Some(200_000_000_002));
    }

    #[test]
    fn test_select_timestamp_falls_back_to_software() {
        let tss = [tspec(100, 1), tspec(0, 0), tspec(0, 0)];
        assert_eq!(select_timestamp(&tss), Some(100_000_000_001));
    }

    #[test]
    fn test_select_timestamp_all_zero_is_none() {
        let tss = [tspec(0, 0), tspec(0, 0), tspec(0, 0)];
        assert_eq!(select_timestamp(&tss), None);
    }

    #[test]
    fn test_sockaddr_roundtrip_v4() {
        let addr: SocketAddr = "192.168.1.5:319".parse().unwrap();
        let (storage, _) = sockaddr_from_addr(addr);
        assert_eq!(sockaddr_to_addr(&storage), Some(addr));
    }

    #[test]
    fn test_sockaddr_roundtrip_v6() {
        let addr: SocketAddr = "[2001:db8::1]:320".parse().unwrap();
        let (storage, _) = sockaddr_from_addr(addr);
        assert_eq!(sockaddr_to_addr(&storage), Some(addr));
    }

    #[test]
    fn test_sw_timestamping_enables_on_loopback() {
        let sock = open_udp_socket("127.0.0.1:0".parse().unwrap(), None, 0).unwrap();
        let ts_sock = TsSocket::new(
            sock,
            None,
            TsMode::Software,
            10,
            Duration::from_millis(1),
        );
        assert!(ts_sock.is_ok());
    }

    #[test]
    fn test_sw_tx_and_rx_timestamps_on_loopback() {
        let tx = TsSocket::new(
            open_udp_socket("127.0.0.1:0".parse().unwrap(), None, 0).unwrap(),
            None,
            TsMode::Software,
            10,
            Duration::from_millis(2),
        )
        .unwrap();
        let rx = TsSocket::new(
            open_udp_socket("127.0.0.1:0".parse().unwrap(), None, 0).unwrap(),
            None,
            TsMode::Software,
            10,
            Duration::from_millis(2),
        )
        .unwrap();
        rx.set_read_timeout(Some(Duration::from_millis(500))).unwrap();

        let dst = rx.local_addr().unwrap();
        let payload = b"sptp-ts-test";
        let tx_ts = tx.send_with_ts(payload, dst, 7).expect("TX timestamp");
        assert!(tx_ts > 0);

        let mut buf = [0u8; 128];
        let (n, src, rx_ts) = rx.recv_with_ts(&mut buf).expect("RX timestamp");
        assert_eq!(&buf[..n], payload);
        assert_eq!(src, tx.local_addr().unwrap());
        assert!(rx_ts > 0);
    }
}
