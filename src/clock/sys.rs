//! CLOCK_REALTIME steering via clock_adjtime.

use tracing::warn;

use super::adjtime;
use super::ClockError;

/// System realtime clock
#[derive(Debug, Default)]
pub struct SysClock;

impl SysClock {
    pub fn new() -> Self {
        Self
    }

    pub fn adj_freq_ppb(&mut self, ppb: f64) -> Result<(), ClockError> {
        let in_sync = adjtime::adj_freq_ppb(libc::CLOCK_REALTIME, ppb)?;
        if !in_sync {
            warn!("system clock state is not TIME_OK after frequency adjustment");
        }
        Ok(())
    }

    pub fn step(&mut self, offset_ns: i64) -> Result<(), ClockError> {
        let in_sync = adjtime::step(libc::CLOCK_REALTIME, offset_ns)?;
        if !in_sync {
            warn!("system clock state is not TIME_OK after step");
        }
        Ok(())
    }

    pub fn frequency_ppb(&mut self) -> Result<f64, ClockError> {
        adjtime::read_freq_ppb(libc::CLOCK_REALTIME)
    }

    pub fn max_freq_ppb(&self) -> f64 {
        adjtime::DEFAULT_MAX_FREQ_PPB
    }

    pub fn set_sync(&mut self) -> Result<(), ClockError> {
        let in_sync = adjtime::mark_synced(libc::CLOCK_REALTIME)?;
        if !in_sync {
            warn!("system clock state is not TIME_OK after sync mark");
        }
        Ok(())
    }
}
