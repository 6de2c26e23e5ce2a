//! Uhren-Abstraktion: PHC, Systemuhr oder frei laufend
//!
//! Alle drei Varianten teilen denselben Vertrag (Frequenz stellen, Schritt,
//! Frequenz lesen, Maximalfrequenz, Sync-Markierung). Der Koordinator
//! besitzt genau eine Variante pro Lauf; dynamischer Dispatch ist nicht
//! nötig.

mod adjtime;
mod phc;
mod sys;

pub use phc::{phc_device_path, PhcClock};
pub use sys::SysClock;

use std::io;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("clock adjustment failed: {0}")]
    Adjust(#[source] io::Error),
    #[error("failed to open PHC device {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("no PHC device found for interface {0}")]
    NoPhc(String),
}

/// Die gesteuerte Uhr eines Laufs
pub enum Clock {
    /// PTP-Hardware-Clock der Netzwerkkarte
    Phc(PhcClock),
    /// CLOCK_REALTIME über clock_adjtime
    System(SysClock),
    /// Dry-Run: alle Operationen sind No-Ops
    FreeRunning(FreeRunningClock),
}

impl Clock {
    /// Frequenzkorrektur in ppb anwenden
    pub fn adj_freq_ppb(&mut self, ppb: f64) -> Result<(), ClockError> {
        match self {
            Clock::Phc(c) => c.adj_freq_ppb(ppb),
            Clock::System(c) => c.adj_freq_ppb(ppb),
            Clock::FreeRunning(c) => c.adj_freq_ppb(ppb),
        }
    }

    /// Uhr um `offset_ns` springen lassen
    pub fn step(&mut self, offset_ns: i64) -> Result<(), ClockError> {
        match self {
            Clock::Phc(c) => c.step(offset_ns),
            Clock::System(c) => c.step(offset_ns),
            Clock::FreeRunning(c) => c.step(offset_ns),
        }
    }

    /// Aktuelle Frequenzkorrektur in ppb lesen
    pub fn frequency_ppb(&mut self) -> Result<f64, ClockError> {
        match self {
            Clock::Phc(c) => c.frequency_ppb(),
            Clock::System(c) => c.frequency_ppb(),
            Clock::FreeRunning(c) => c.frequency_ppb(),
        }
    }

    /// Maximal stellbare Frequenz in ppb
    pub fn max_freq_ppb(&self) -> f64 {
        match self {
            Clock::Phc(c) => c.max_freq_ppb(),
            Clock::System(c) => c.max_freq_ppb(),
            Clock::FreeRunning(c) => c.max_freq_ppb(),
        }
    }

    /// Uhr als synchronisiert markieren (nur Systemuhr)
    pub fn set_sync(&mut self) -> Result<(), ClockError> {
        match self {
            Clock::Phc(c) => c.set_sync(),
            Clock::System(c) => c.set_sync(),
            Clock::FreeRunning(c) => c.set_sync(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Clock::Phc(_) => "PHC",
            Clock::System(_) => "SYSTEM",
            Clock::FreeRunning(_) => "FREE_RUNNING",
        }
    }
}

/// No-Op-Uhr für den Dry-Run-Modus
#[derive(Debug, Default)]
pub struct FreeRunningClock;

impl FreeRunningClock {
    pub fn adj_freq_ppb(&mut self, ppb: f64) -> Result<(), ClockError> {
        debug!("free-running clock: ignoring frequency adjustment of {:.1}ppb", ppb);
        Ok(())
    }

    pub fn step(&mut self, offset_ns: i64) -> Result<(), ClockError> {
        debug!("free-running clock: ignoring step of {}ns", offset_ns);
        Ok(())
    }

    pub fn frequency_ppb(&mut self) -> Result<f64, ClockError> {
        Ok(0.0)
    }

    pub fn max_freq_ppb(&self) -> f64 {
        // keeps the servo arithmetic identical to the steered variants
        adjtime::DEFAULT_MAX_FREQ_PPB
    }

    pub fn set_sync(&mut self) -> Result<(), ClockError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_running_is_noop() {
        let mut clock = Clock::FreeRunning(FreeRunningClock);
        assert!(clock.adj_freq_ppb(1000.0).is_ok());
        assert!(clock.step(-5_000_000).is_ok());
        assert_eq!(clock.frequency_ppb().unwrap(), 0.0);
        assert!(clock.set_sync().is_ok());
        assert_eq!(clock.name(), "FREE_RUNNING");
        assert!(clock.max_freq_ppb() > 0.0);
    }
}
