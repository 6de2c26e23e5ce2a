//! UDP-Sockets mit Kernel-Timestamping
//!
//! Aufbau der Event-/General-Sockets (socket2) und die Linux-Timestamping-
//! Schicht darüber (SO_TIMESTAMPING, MSG_ERRQUEUE, SCM_TS_OPT_ID).

mod socket;
mod timestamping;

pub use socket::open_udp_socket;
pub use timestamping::{TsMode, TsSocket, TsError};
