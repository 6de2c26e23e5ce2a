//! PTP hardware clock behind the NIC's character device.
//!
//! The clockid is derived from the open file descriptor (FD_TO_CLOCKID);
//! the device path comes from sysfs unless the caller supplies one.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::adjtime;
use super::ClockError;

// Linux constants not in stable libc
mod linux_consts {
    /// Dynamic clocks: clockid = (~fd << 3) | CLOCKFD
    pub const CLOCKFD: libc::clockid_t = 3;

    /// _IOR('=', 1, struct ptp_clock_caps): dir=read, type 0x3d, nr 1,
    /// size 80 (20 ints)
    pub const PTP_CLOCK_GETCAPS: libc::c_ulong = 0x8050_3d01;
}

/// `struct ptp_clock_caps` from linux/ptp_clock.h
#[repr(C)]
#[derive(Default)]
struct PtpClockCaps {
    max_adj: libc::c_int,
    n_alarm: libc::c_int,
    n_ext_ts: libc::c_int,
    n_per_out: libc::c_int,
    pps: libc::c_int,
    n_pins: libc::c_int,
    cross_timestamping: libc::c_int,
    adjust_phase: libc::c_int,
    max_phase_adj: libc::c_int,
    rsv: [libc::c_int; 11],
}

/// Map an interface name to its PHC character device via sysfs
pub fn phc_device_path(iface: &str) -> Result<PathBuf, ClockError> {
    let sysfs = format!("/sys/class/net/{}/device/ptp", iface);
    let entries = fs::read_dir(&sysfs).map_err(|_| ClockError::NoPhc(iface.to_string()))?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("ptp") {
            return Ok(PathBuf::from("/dev").join(name.as_ref()));
        }
    }
    Err(ClockError::NoPhc(iface.to_string()))
}

/// PHC clock handle; the file keeps the clockid alive
pub struct PhcClock {
    /// Keeps the fd (and with it the clockid) alive
    _file: File,
    clockid: libc::clockid_t,
    max_freq: f64,
}

impl PhcClock {
    /// Open the PHC mapped to `iface` (sysfs lookup)
    pub fn open_for_iface(iface: &str) -> Result<Self, ClockError> {
        let path = phc_device_path(iface)?;
        Self::open(&path)
    }

    /// Open a PHC device directly
    pub fn open(path: &Path) -> Result<Self, ClockError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| ClockError::Open {
                path: path.display().to_string(),
                source: e,
            })?;
        let fd = file.as_raw_fd();
        let clockid = ((!(fd as libc::clockid_t)) << 3) | linux_consts::CLOCKFD;

        let max_freq = match read_max_adj(fd) {
            Ok(max_adj) => max_adj as f64,
            Err(e) => {
                warn!(
                    "PTP_CLOCK_GETCAPS failed on {} ({}), assuming {}ppb",
                    path.display(),
                    e,
                    adjtime::DEFAULT_MAX_FREQ_PPB
                );
                adjtime::DEFAULT_MAX_FREQ_PPB
            }
        };

        debug!(
            "opened PHC {} (clockid {}, max_adj {}ppb)",
            path.display(),
            clockid,
            max_freq
        );
        Ok(Self {
            _file: file,
            clockid,
            max_freq,
        })
    }

    pub fn adj_freq_ppb(&mut self, ppb: f64) -> Result<(), ClockError> {
        adjtime::adj_freq_ppb(self.clockid, ppb)?;
        Ok(())
    }

    pub fn step(&mut self, offset_ns: i64) -> Result<(), ClockError> {
        adjtime::step(self.clockid, offset_ns)?;
        Ok(())
    }

    pub fn frequency_ppb(&mut self) -> Result<f64, ClockError> {
        adjtime::read_freq_ppb(self.clockid)
    }

    pub fn max_freq_ppb(&self) -> f64 {
        self.max_freq
    }

    /// The PHC carries no kernel sync status
    pub fn set_sync(&mut self) -> Result<(), ClockError> {
        Ok(())
    }
}

fn read_max_adj(fd: libc::c_int) -> io::Result<libc::c_int> {
    let mut caps = PtpClockCaps::default();
    // SAFETY: caps is a valid ptp_clock_caps buffer for the ioctl
    let ret = unsafe { libc::ioctl(fd, linux_consts::PTP_CLOCK_GETCAPS, &mut caps) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(caps.max_adj)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_iface_has_no_phc() {
        assert!(matches!(
            phc_device_path("does-not-exist0"),
            Err(ClockError::NoPhc(_))
        ));
    }
}
