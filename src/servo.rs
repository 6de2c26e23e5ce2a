//! PI servo: turns offset samples into frequency adjustments.
//!
//! Gains follow the ptp4l lineage (kp 0.7, ki 0.3 at 1s intervals). The
//! servo keeps a rolling mean of its recent outputs so holdover can park
//! the clock at a plausible frequency, and rejects single spike samples
//! before they reach the integrator.

use serde::Deserialize;
use tracing::{debug, info};

use crate::sync::SlidingWindow;

/// Servo state as reported per tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServoState {
    /// Collecting the first samples, no adjustment yet
    Init = 0,
    /// One-shot clock step requested
    Jump = 1,
    /// Tracking, frequency adjustments active
    Locked = 2,
    /// One sample ignored as a spike, next good sample resumes
    Filter = 3,
    /// No usable master, running on the rolling mean frequency
    Holdover = 4,
}

impl std::fmt::Display for ServoState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServoState::Init => "INIT",
            ServoState::Jump => "JUMP",
            ServoState::Locked => "LOCKED",
            ServoState::Filter => "FILTER",
            ServoState::Holdover => "HOLDOVER",
        };
        write!(f, "{}", s)
    }
}

/// Servo tuning; all thresholds in nanoseconds
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ServoConfig {
    #[serde(default = "default_kp")]
    pub kp: f64,
    #[serde(default = "default_ki")]
    pub ki: f64,
    /// One-shot step on the first sample when the offset is at least this
    /// large (0 disables)
    #[serde(default = "default_first_step_threshold", alias = "first_step_threshold")]
    pub first_step_threshold_ns: i64,
    /// Offsets beyond this are treated as spikes while locked
    #[serde(default = "default_spike_threshold", alias = "spike_threshold")]
    pub spike_threshold_ns: i64,
    /// Consecutive spikes tolerated before the servo re-initializes
    #[serde(default = "default_max_spike_skips")]
    pub max_spike_skips: u32,
    /// Window length for the holdover frequency mean
    #[serde(default = "default_freq_mean_window")]
    pub freq_mean_window: usize,
}

fn default_kp() -> f64 {
    0.7
}

fn default_ki() -> f64 {
    0.3
}

fn default_first_step_threshold() -> i64 {
    // 20us, the classic first_step_threshold
    20_000
}

fn default_spike_threshold() -> i64 {
    // 1ms
    1_000_000
}

fn default_max_spike_skips() -> u32 {
    10
}

fn default_freq_mean_window() -> usize {
    30
}

impl Default for ServoConfig {
    fn default() -> Self {
        Self {
            kp: default_kp(),
            ki: default_ki(),
            first_step_threshold_ns: default_first_step_threshold(),
            spike_threshold_ns: default_spike_threshold(),
            max_spike_skips: default_max_spike_skips(),
            freq_mean_window: default_freq_mean_window(),
        }
    }
}

/// PI servo with spike filter and holdover mean
#[derive(Debug)]
pub struct PiServo {
    config: ServoConfig,
    state: ServoState,
    /// Integrator (ppb)
    drift: f64,
    /// Last output frequency (ppb)
    freq: f64,
    /// Clamp for drift and output
    max_freq: f64,
    /// (offset, local timestamp) of the first sample while initializing
    first_sample: Option<(i64, u64)>,
    /// The integrator has been primed by two samples
    has_locked: bool,
    /// The one-shot step is still available
    first_update: bool,
    /// Consecutive spike rejections
    skips: u32,
    /// Recent outputs for holdover
    freq_history: SlidingWindow,
}

impl PiServo {
    /// `start_freq` should be the clock's current frequency so holdover
    /// before the first lock stays near reality.
    pub fn new(config: ServoConfig, start_freq: f64, max_freq: f64) -> Self {
        let mut freq_history = SlidingWindow::new(config.freq_mean_window);
        freq_history.add(start_freq);
        Self {
            config,
            state: ServoState::Init,
            drift: start_freq,
            freq: start_freq,
            max_freq,
            first_sample: None,
            has_locked: false,
            first_update: config.first_step_threshold_ns > 0,
            skips: 0,
            freq_history,
        }
    }

    pub fn state(&self) -> ServoState {
        self.state
    }

    /// Rolling mean of recent frequency outputs
    pub fn mean_freq(&self) -> f64 {
        if self.freq_history.is_empty() {
            self.freq
        } else {
            self.freq_history.mean()
        }
    }

    /// Park on the rolling mean and report Holdover
    pub fn enter_holdover(&mut self) -> f64 {
        self.freq = self.mean_freq();
        self.state = ServoState::Holdover;
        self.freq
    }

    /// Spike check, run before `sample`. A rejected sample must not reach
    /// the integrator; the caller skips `sample` for this tick.
    pub fn is_spike(&mut self, offset_ns: i64) -> bool {
        if !matches!(self.state, ServoState::Locked | ServoState::Filter) {
            return false;
        }
        if offset_ns.abs() <= self.config.spike_threshold_ns {
            self.skips = 0;
            return false;
        }
        self.skips += 1;
        if self.skips > self.config.max_spike_skips {
            // too many in a row: that is not a spike, that is reality
            info!(
                "offset {}ns exceeded spike threshold {} times, re-initializing servo",
                offset_ns, self.skips
            );
            self.state = ServoState::Init;
            self.first_sample = None;
            self.has_locked = false;
            self.skips = 0;
        } else {
            debug!("spike sample {}ns skipped ({} in a row)", offset_ns, self.skips);
            self.state = ServoState::Filter;
        }
        true
    }

    /// Feed one offset sample; returns the frequency adjustment in ppb and
    /// the resulting state. The caller applies `-freq` to the clock (and a
    /// `-offset` step on Jump).
    pub fn sample(&mut self, offset_ns: i64, local_ts_ns: u64) -> (f64, ServoState) {
        if self.has_locked {
            // Locked, Filter and Holdover all resume normal tracking
            self.state = ServoState::Locked;
            return self.locked_sample(offset_ns);
        }
        match self.first_sample {
            None => {
                if self.first_update && offset_ns.abs() >= self.config.first_step_threshold_ns {
                    // one-shot jump; sampling restarts after the step
                    self.first_update = false;
                    self.state = ServoState::Jump;
                    return (self.freq, ServoState::Jump);
                }
                self.first_sample = Some((offset_ns, local_ts_ns));
                self.state = ServoState::Init;
                (self.freq, ServoState::Init)
            }
            Some((prev_offset, prev_ts)) => {
                // estimate the frequency error from the first two samples
                let dt = local_ts_ns.saturating_sub(prev_ts);
                if dt > 0 {
                    let est = (offset_ns - prev_offset) as f64 * 1e9 / dt as f64;
                    self.drift = clamp(self.drift + est, self.max_freq);
                }
                self.has_locked = true;
                self.state = ServoState::Locked;
                self.locked_sample(offset_ns)
            }
        }
    }

    fn locked_sample(&mut self, offset_ns: i64) -> (f64, ServoState) {
        let offset = offset_ns as f64;
        self.drift = clamp(self.drift + self.config.ki * offset, self.max_freq);
        let ppb = clamp(self.config.kp * offset + self.drift, self.max_freq);
        self.freq = ppb;
        self.freq_history.add(ppb);
        (ppb, ServoState::Locked)
    }
}

fn clamp(value: f64, limit: f64) -> f64 {
    value.min(limit).max(-limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000_000;

    fn servo() -> PiServo {
        PiServo::new(ServoConfig::default(), 0.0, 500_000.0)
    }

    #[test]
    fn test_first_large_offset_jumps() {
        let mut s = servo();
        let (_, state) = s.sample(5_000_000, SEC);
        assert_eq!(state, ServoState::Jump);
        // the jump is single-shot
        let (_, state) = s.sample(5_000_000, 2 * SEC);
        assert_eq!(state, ServoState::Init);
    }

    #[test]
    fn test_small_offsets_lock() {
        let mut s = servo();
        let (_, state) = s.sample(500, SEC);
        assert_eq!(state, ServoState::Init);
        let (freq, state) = s.sample(400, 2 * SEC);
        assert_eq!(state, ServoState::Locked);
        assert!(freq.abs() <= 500_000.0);
    }

    #[test]
    fn test_zero_threshold_disables_jump() {
        let config = ServoConfig {
            first_step_threshold_ns: 0,
            ..ServoConfig::default()
        };
        let mut s = PiServo::new(config, 0.0, 500_000.0);
        let (_, state) = s.sample(50_000_000, SEC);
        assert_eq!(state, ServoState::Init);
    }

    #[test]
    fn test_locked_output_follows_offset_sign() {
        let mut s = servo();
        s.sample(100, SEC);
        let (freq, _) = s.sample(100, 2 * SEC);
        // positive offset -> positive adjustment (caller applies -freq)
        assert!(freq > 0.0);
    }

    #[test]
    fn test_spike_is_filtered_then_recovers() {
        let mut s = servo();
        s.sample(100, SEC);
        s.sample(100, 2 * SEC);
        assert_eq!(s.state(), ServoState::Locked);

        assert!(s.is_spike(50_000_000));
        assert_eq!(s.state(), ServoState::Filter);

        // next good sample returns to Locked
        assert!(!s.is_spike(120));
        let (_, state) = s.sample(120, 3 * SEC);
        assert_eq!(state, ServoState::Locked);
    }

    #[test]
    fn test_persistent_spikes_reinitialize() {
        let config = ServoConfig {
            max_spike_skips: 2,
            ..ServoConfig::default()
        };
        let mut s = PiServo::new(config, 0.0, 500_000.0);
        s.sample(100, SEC);
        s.sample(100, 2 * SEC);

        assert!(s.is_spike(50_000_000));
        assert!(s.is_spike(50_000_000));
        // third one trips the skip cap
        assert!(s.is_spike(50_000_000));
        assert_eq!(s.state(), ServoState::Init);
    }

    #[test]
    fn test_spike_check_inactive_before_lock() {
        let mut s = servo();
        assert!(!s.is_spike(50_000_000));
    }

    #[test]
    fn test_holdover_uses_mean_of_recent_outputs() {
        let mut s = servo();
        s.sample(100, SEC);
        let (f1, _) = s.sample(100, 2 * SEC);
        let (f2, _) = s.sample(80, 3 * SEC);
        let freq = s.enter_holdover();
        assert_eq!(s.state(), ServoState::Holdover);
        // start_freq 0.0 is part of the window
        let expected = (0.0 + f1 + f2) / 3.0;
        assert!((freq - expected).abs() < 1e-9);
    }

    #[test]
    fn test_output_clamped_to_max_freq() {
        let mut s = PiServo::new(
            ServoConfig {
                first_step_threshold_ns: 0,
                spike_threshold_ns: i64::MAX,
                ..ServoConfig::default()
            },
            0.0,
            1000.0,
        );
        s.sample(1_000_000_000, SEC);
        let (freq, _) = s.sample(1_000_000_000, 2 * SEC);
        assert_eq!(freq, 1000.0);
    }
}
