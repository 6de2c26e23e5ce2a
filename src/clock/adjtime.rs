//! clock_adjtime plumbing shared by the PHC and system clock variants.
//!
//! Frequency values cross this boundary in ppb; the kernel wants scaled
//! ppm (ppb * 65.536). Steps use ADJ_SETOFFSET with nanosecond resolution.

use std::io;

use super::ClockError;

/// Fallback when the driver does not report max_adj
pub const DEFAULT_MAX_FREQ_PPB: f64 = 500_000.0;

/// `clock_adjtime` return value when the clock is in sync
const TIME_OK: libc::c_int = 0;

fn clock_adjtime(clockid: libc::clockid_t, timex: &mut libc::timex) -> Result<libc::c_int, ClockError> {
    // SAFETY: timex is a valid, zero-initialized struct for the call
    let ret = unsafe { libc::clock_adjtime(clockid, timex) };
    if ret < 0 {
        return Err(ClockError::Adjust(io::Error::last_os_error()));
    }
    Ok(ret)
}

/// Apply a frequency correction. Returns the kernel clock state so the
/// system clock can warn when it is not TIME_OK.
pub fn adj_freq_ppb(clockid: libc::clockid_t, ppb: f64) -> Result<bool, ClockError> {
    let mut timex: libc::timex = unsafe { std::mem::zeroed() };
    timex.modes = libc::ADJ_FREQUENCY;
    timex.freq = (ppb * 65.536) as libc::c_long;
    let state = clock_adjtime(clockid, &mut timex)?;
    Ok(state == TIME_OK)
}

/// Step the clock by `offset_ns`
pub fn step(clockid: libc::clockid_t, offset_ns: i64) -> Result<bool, ClockError> {
    let mut sec = offset_ns / 1_000_000_000;
    let mut nsec = offset_ns % 1_000_000_000;
    // ADJ_NANO requires 0 <= tv_usec < 1e9
    if nsec < 0 {
        sec -= 1;
        nsec += 1_000_000_000;
    }
    let mut timex: libc::timex = unsafe { std::mem::zeroed() };
    timex.modes = libc::ADJ_SETOFFSET | libc::ADJ_NANO;
    timex.time.tv_sec = sec;
    timex.time.tv_usec = nsec;
    let state = clock_adjtime(clockid, &mut timex)?;
    Ok(state == TIME_OK)
}

/// Read the current frequency correction in ppb
pub fn read_freq_ppb(clockid: libc::clockid_t) -> Result<f64, ClockError> {
    let mut timex: libc::timex = unsafe { std::mem::zeroed() };
    clock_adjtime(clockid, &mut timex)?;
    Ok(timex.freq as f64 / 65.536)
}

/// Clear STA_UNSYNC and reset the error estimates on the clock
pub fn mark_synced(clockid: libc::clockid_t) -> Result<bool, ClockError> {
    let mut timex: libc::timex = unsafe { std::mem::zeroed() };
    clock_adjtime(clockid, &mut timex)?;
    let status = timex.status & !libc::STA_UNSYNC;

    let mut timex: libc::timex = unsafe { std::mem::zeroed() };
    timex.modes = libc::ADJ_STATUS | libc::ADJ_MAXERROR | libc::ADJ_ESTERROR;
    timex.status = status;
    timex.maxerror = 0;
    timex.esterror = 0;
    let state = clock_adjtime(clockid, &mut timex)?;
    Ok(state == TIME_OK)
}
