//! Austausch-Engine
//!
//! Pro Grandmaster ein Client, darüber der Koordinator mit Tick-Schleife,
//! Listener, BMCA und Uhrensteuerung.

mod backoff;
mod bmca;
mod client;
mod coordinator;
mod measurement;
mod window;

pub use backoff::{Backoff, BackoffConfig, BackoffMode};
pub use bmca::{reprioritize, select_best, telco_dscmp, BmcaConfig, ComparisonResult};
pub use client::{InPacket, SequenceMask, SptpClient};
pub use coordinator::Sptp;
pub use measurement::{
    MeasurementConfig, MeasurementError, MeasurementResult, MeasurementStore, PathDelayFilter,
};
pub use window::SlidingWindow;

use std::time::Duration;

use thiserror::Error;

use crate::net::TsError;
use crate::ptp::CodecError;

/// Fehler eines einzelnen Austauschs. Sie stürzen den Koordinator nie ab,
/// sondern werden pro GM gezählt und steuern den Backoff.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("exchange deadline exceeded")]
    Deadline,
    #[error("send failed: {0}")]
    Send(#[source] std::io::Error),
    #[error("timestamp unavailable: {0}")]
    Timestamp(#[source] TsError),
    #[error("codec error: {0}")]
    Codec(#[source] CodecError),
    /// Vom Koordinator eingesetzter Platzhalter, kein Austauschfehler:
    /// der Backoff wird dekrementiert statt erhöht.
    #[error("skipped, backoff active ({0:?} remaining)")]
    BackoffSkip(Duration),
}
