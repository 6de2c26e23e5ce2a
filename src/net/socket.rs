//! UDP socket construction for the PTP event and general ports.
//!
//! Sockets are built with socket2 so we can set reuse-port and the DSCP
//! byte before binding. They stay blocking; listeners use read timeouts
//! plus a running flag to shut down.

use std::net::{SocketAddr, UdpSocket};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};

/// Open a blocking UDP socket bound to `local`, optionally pinned to an
/// interface, with the DSCP value written into TOS / TCLASS (shifted by
/// the two ECN bits).
pub fn open_udp_socket(local: SocketAddr, iface: Option<&str>, dscp: u8) -> Result<UdpSocket> {
    let domain = if local.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .context("failed to create UDP socket")?;

    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    if dscp > 0 {
        let tos = (dscp as u32) << 2;
        if local.is_ipv4() {
            socket.set_tos(tos)?;
        } else {
            socket.set_tclass_v6(tos)?;
        }
    }

    #[cfg(target_os = "linux")]
    if let Some(iface) = iface {
        socket
            .bind_device(Some(iface.as_bytes()))
            .with_context(|| format!("failed to bind socket to interface {}", iface))?;
    }

    socket
        .bind(&local.into())
        .with_context(|| format!("failed to bind UDP socket to {}", local))?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral_v4() {
        let sock = open_udp_socket("127.0.0.1:0".parse().unwrap(), None, 35).unwrap();
        let addr = sock.local_addr().unwrap();
        assert!(addr.is_ipv4());
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_reuse_port_allows_second_bind() {
        let a = open_udp_socket("127.0.0.1:0".parse().unwrap(), None, 0).unwrap();
        let addr = a.local_addr().unwrap();
        // with SO_REUSEPORT a second socket may bind the same port
        let b = open_udp_socket(addr, None, 0);
        assert!(b.is_ok());
    }
}
