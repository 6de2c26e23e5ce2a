//! Measurement store: folds the four timestamps of one SPTP exchange into
//! an offset/path-delay result.
//!
//! Timestamps arrive in any order (Sync brings T2, CF1 and T4; Announce
//! brings T1, CF2 and the grandmaster snapshot; the send path brings T3)
//! and are keyed by sequence id. The store is wiped at the start of every
//! tick; a stale exchange is lost on purpose instead of being matched
//! against fresh data.

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::ptp::Announce;
use crate::sync::window::SlidingWindow;

/// Averaging stage of the path-delay filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathDelayFilter {
    /// Use the raw delay of the current exchange
    #[default]
    None,
    /// Mean over the sliding window
    Mean,
    /// Median over the sliding window
    Median,
}

/// Path-delay filter configuration
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct MeasurementConfig {
    #[serde(default)]
    pub path_delay_filter: PathDelayFilter,
    #[serde(default = "default_filter_length")]
    pub path_delay_filter_length: usize,
    /// Raw delays below this floor are rejected (0 disables)
    #[serde(default, alias = "path_delay_discard_below")]
    pub path_delay_discard_below_ns: i64,
    /// Raw delays above median * multiplier are rejected once the window
    /// is full (0 disables)
    #[serde(default)]
    pub path_delay_discard_multiplier: f64,
}

fn default_filter_length() -> usize {
    59
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            path_delay_filter: PathDelayFilter::None,
            path_delay_filter_length: default_filter_length(),
            path_delay_discard_below_ns: 0,
            path_delay_discard_multiplier: 0.0,
        }
    }
}

impl MeasurementConfig {
    fn discard_enabled(&self) -> bool {
        self.path_delay_discard_below_ns > 0 || self.path_delay_discard_multiplier > 0.0
    }
}

#[derive(Debug, Error)]
pub enum MeasurementError {
    #[error("not enough data for a complete measurement")]
    NotEnoughData,
}

/// Per-sequence-id accumulator. All values in nanoseconds, 0 = not seen.
#[derive(Debug, Clone, Copy, Default)]
struct MData {
    t1: i64,
    t2: i64,
    t3: i64,
    t4: i64,
    c1: i64,
    c2: i64,
    announce: Option<Announce>,
}

impl MData {
    fn complete(&self) -> bool {
        self.t1 != 0 && self.t2 != 0 && self.t3 != 0 && self.t4 != 0 && self.announce.is_some()
    }
}

/// One finished exchange, as consumed by BMCA and the servo
#[derive(Debug, Clone)]
pub struct MeasurementResult {
    /// Filtered path delay
    pub delay_ns: f64,
    /// Clock offset derived with the filtered delay
    pub offset_ns: i64,
    /// Server-to-client leg (T2 - T1 - CF1)
    pub s2c_delay_ns: i64,
    /// Client-to-server leg (T4 - T3 - CF2)
    pub c2s_delay_ns: i64,
    /// Correction accumulated on the Sync path
    pub cf_rx_ns: i64,
    /// Correction accumulated on the Delay-Request path
    pub cf_tx_ns: i64,
    /// Measurement time (T2)
    pub timestamp_ns: i64,
    /// Grandmaster snapshot from the Announce of this exchange
    pub announce: Announce,
    pub t1: i64,
    pub t2: i64,
    pub t3: i64,
    pub t4: i64,
    /// Raw delay was rejected by the discard stage; the previous filtered
    /// delay was used instead
    pub bad_delay: bool,
}

impl MeasurementResult {
    /// Broken-timestamp marker: a transparent clock never produces a
    /// negative residence time
    pub fn has_negative_cf(&self) -> bool {
        self.cf_rx_ns < 0 || self.cf_tx_ns < 0
    }
}

/// Per-GM measurement store
#[derive(Debug)]
pub struct MeasurementStore {
    config: MeasurementConfig,
    data: HashMap<u16, MData>,
    delays: SlidingWindow,
    /// Last filter output; stands in when a raw delay is rejected
    last_delay: Option<f64>,
}

impl MeasurementStore {
    pub fn new(config: MeasurementConfig) -> Self {
        Self {
            config,
            data: HashMap::new(),
            delays: SlidingWindow::new(config.path_delay_filter_length),
            last_delay: None,
        }
    }

    /// Drop all per-sequence state. Called at the start of every tick;
    /// the delay filter window survives across ticks.
    pub fn cleanup(&mut self) {
        self.data.clear();
    }

    /// T3: TX timestamp of our Delay-Request
    pub fn add_t3(&mut self, seq: u16, t3: i64) {
        self.data.entry(seq).or_default().t3 = t3;
    }

    /// Sync carries T2 (RX timestamp), CF1 (its correction field) and T4
    /// (the origin timestamp the server repurposed)
    pub fn add_sync(&mut self, seq: u16, t2: i64, cf1: i64, t4: i64) {
        let entry = self.data.entry(seq).or_default();
        entry.t2 = t2;
        entry.c1 = cf1;
        entry.t4 = t4;
    }

    /// Announce carries T1 (origin timestamp), CF2 (the echoed
    /// Delay-Request correction) and the grandmaster snapshot
    pub fn add_announce(&mut self, seq: u16, t1: i64, cf2: i64, announce: Announce) {
        let entry = self.data.entry(seq).or_default();
        entry.t1 = t1;
        entry.c2 = cf2;
        entry.announce = Some(announce);
    }

    /// Produce a result from the most recent complete exchange (greatest
    /// T2 wins), feeding its raw delay through the filter.
    pub fn latest(&mut self) -> Result<MeasurementResult, MeasurementError> {
        let best = self
            .data
            .values()
            .filter(|m| m.complete())
            .max_by_key(|m| m.t2)
            .copied()
            .ok_or(MeasurementError::NotEnoughData)?;

        // negative corrections are a broken-timestamp artifact; the delay
        // arithmetic treats them as zero
        let c1 = best.c1.max(0);
        let c2 = best.c2.max(0);
        let s2c = best.t2 - best.t1 - c1;
        let c2s = best.t4 - best.t3 - c2;
        let raw_delay = (s2c + c2s) as f64 / 2.0;

        let announce = best.announce.ok_or(MeasurementError::NotEnoughData)?;
        let (delay, bad_delay) = self.filter_delay(raw_delay);
        let offset = (s2c as f64 - delay).round() as i64;

        Ok(MeasurementResult {
            delay_ns: delay,
            offset_ns: offset,
            s2c_delay_ns: s2c,
            c2s_delay_ns: c2s,
            cf_rx_ns: best.c1,
            cf_tx_ns: best.c2,
            timestamp_ns: best.t2,
            announce,
            t1: best.t1,
            t2: best.t2,
            t3: best.t3,
            t4: best.t4,
            bad_delay,
        })
    }

    /// Two-stage filter: discard obviously bad raw delays, then average
    fn filter_delay(&mut self, raw: f64) -> (f64, bool) {
        if self.config.discard_enabled() {
            let below = self.config.path_delay_discard_below_ns;
            let mult = self.config.path_delay_discard_multiplier;
            let too_low = below > 0 && raw < below as f64;
            let too_high =
                mult > 0.0 && self.delays.is_full() && raw > mult * self.delays.median();
            if too_low || too_high {
                debug!(
                    "discarding path delay sample {:.0}ns ({} samples in window)",
                    raw,
                    self.delays.len()
                );
                // the previously computed delay stands; the very first
                // sample has nothing to stand in for it
                if let Some(last) = self.last_delay {
                    return (last, true);
                }
            }
        }

        self.delays.add(raw);
        let out = match self.config.path_delay_filter {
            PathDelayFilter::None => self.delays.last_sample(),
            PathDelayFilter::Mean => self.delays.mean(),
            PathDelayFilter::Median => self.delays.median(),
        };
        self.last_delay = Some(out);
        (out, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: i64 = 1_000_000;
    const US: i64 = 1_000;

    fn store() -> MeasurementStore {
        MeasurementStore::new(MeasurementConfig::default())
    }

    fn test_announce(seq: u16) -> Announce {
        use crate::ptp::{AnnounceBody, ClockIdentity, PortIdentity};
        Announce::unicast(
            PortIdentity {
                clock_identity: ClockIdentity([1, 2, 3, 4, 5, 6, 7, 8]),
                port_number: 1,
            },
            0,
            seq,
            AnnounceBody::default(),
        )
    }

    /// 2021-05-21T13:32:05Z in nanoseconds
    const T3_BASE: i64 = 1_621_604_525_000_000_000;

    fn run_exchange(
        store: &mut MeasurementStore,
        seq: u16,
        t1: i64,
        t2: i64,
        t3: i64,
        t4: i64,
        cf1: i64,
        cf2: i64,
    ) -> MeasurementResult {
        store.add_t3(seq, t3);
        store.add_sync(seq, t2, cf1, t4);
        store.add_announce(seq, t1, cf2, test_announce(seq));
        store.latest().expect("complete exchange")
    }

    #[test]
    fn test_symmetric_path_zero_offset() {
        let mut s = store();
        let t3 = T3_BASE;
        let t4 = t3 + 100 * MS;
        let t1 = t3 + 10 * MS;
        let t2 = t1 + 100 * MS;
        let r = run_exchange(&mut s, 1, t1, t2, t3, t4, 0, 0);
        assert_eq!(r.delay_ns, (100 * MS) as f64);
        assert_eq!(r.offset_ns, 0);
        assert_eq!(r.s2c_delay_ns, 100 * MS);
        assert_eq!(r.c2s_delay_ns, 100 * MS);
    }

    #[test]
    fn test_asymmetric_path_negative_offset() {
        let mut s = store();
        let t3 = T3_BASE;
        let t4 = t3 + 400 * MS;
        let t1 = t3 + 10 * MS;
        let t2 = t1 + 200 * MS;
        let r = run_exchange(&mut s, 1, t1, t2, t3, t4, 0, 0);
        assert_eq!(r.delay_ns, (300 * MS) as f64);
        assert_eq!(r.offset_ns, -100 * MS);
        assert_eq!(r.s2c_delay_ns, 200 * MS);
        assert_eq!(r.c2s_delay_ns, 400 * MS);
    }

    #[test]
    fn test_correction_fields_shift_legs() {
        let mut s = store();
        let t3 = T3_BASE;
        let t4 = t3 + 400 * MS;
        let t1 = t3 + 10 * MS;
        let t2 = t1 + 200 * MS;
        let r = run_exchange(&mut s, 1, t1, t2, t3, t4, 6 * US, 4 * US);
        // delay = (200ms - 6us + 400ms - 4us) / 2 = 299.995ms
        assert_eq!(r.delay_ns, 299_995_000.0);
        // offset = S2C - delay = 199.994ms - 299.995ms
        assert_eq!(r.offset_ns, -100_001_000);
        assert_eq!(r.cf_rx_ns, 6 * US);
        assert_eq!(r.cf_tx_ns, 4 * US);
    }

    #[test]
    fn test_incomplete_exchange_is_not_enough_data() {
        let mut s = store();
        s.add_t3(5, T3_BASE);
        s.add_sync(5, T3_BASE + MS, 0, T3_BASE + MS);
        assert!(matches!(
            s.latest(),
            Err(MeasurementError::NotEnoughData)
        ));
    }

    #[test]
    fn test_cleanup_discards_pending_sequences() {
        let mut s = store();
        run_exchange(
            &mut s,
            1,
            T3_BASE + 10 * MS,
            T3_BASE + 110 * MS,
            T3_BASE,
            T3_BASE + 100 * MS,
            0,
            0,
        );
        s.cleanup();
        assert!(matches!(
            s.latest(),
            Err(MeasurementError::NotEnoughData)
        ));
    }

    #[test]
    fn test_latest_picks_greatest_t2() {
        let mut s = store();
        run_exchange(
            &mut s,
            1,
            T3_BASE + 10 * MS,
            T3_BASE + 110 * MS,
            T3_BASE,
            T3_BASE + 100 * MS,
            0,
            0,
        );
        let newer = run_exchange(
            &mut s,
            2,
            T3_BASE + 1010 * MS,
            T3_BASE + 1110 * MS,
            T3_BASE + 1000 * MS,
            T3_BASE + 1100 * MS,
            0,
            0,
        );
        assert_eq!(newer.t2, T3_BASE + 1110 * MS);
        assert_eq!(s.latest().unwrap().t2, newer.t2);
    }

    #[test]
    fn test_negative_correction_treated_as_zero_in_delay() {
        let mut s = store();
        let t3 = T3_BASE;
        let t4 = t3 + 100 * MS;
        let t1 = t3 + 10 * MS;
        let t2 = t1 + 100 * MS;
        let r = run_exchange(&mut s, 1, t1, t2, t3, t4, -5 * US, 0);
        assert_eq!(r.delay_ns, (100 * MS) as f64);
        // the raw value stays visible for the BMCA exclusion
        assert_eq!(r.cf_rx_ns, -5 * US);
        assert!(r.has_negative_cf());
    }

    #[test]
    fn test_discard_stage_keeps_previous_delay() {
        let cfg = MeasurementConfig {
            path_delay_filter: PathDelayFilter::None,
            path_delay_filter_length: 3,
            path_delay_discard_below_ns: 0,
            path_delay_discard_multiplier: 2.0,
        };
        let mut s = MeasurementStore::new(cfg);
        // fill the window with ~100ms delays
        for i in 0..3u16 {
            let t3 = T3_BASE + i as i64 * 1000 * MS;
            let t4 = t3 + 100 * MS;
            let t1 = t3 + 10 * MS;
            let t2 = t1 + 100 * MS;
            run_exchange(&mut s, i, t1, t2, t3, t4, 0, 0);
            s.cleanup();
        }
        // a 500ms outlier is > 2 * median(100ms): rejected
        let t3 = T3_BASE + 10_000 * MS;
        let t4 = t3 + 500 * MS;
        let t1 = t3 + 10 * MS;
        let t2 = t1 + 500 * MS;
        let r = run_exchange(&mut s, 99, t1, t2, t3, t4, 0, 0);
        assert!(r.bad_delay);
        assert_eq!(r.delay_ns, (100 * MS) as f64);
        // offset is computed against the standing delay
        assert_eq!(r.offset_ns, 400 * MS);
    }

    #[test]
    fn test_discard_below_floor() {
        let cfg = MeasurementConfig {
            path_delay_filter: PathDelayFilter::None,
            path_delay_filter_length: 4,
            path_delay_discard_below_ns: 50 * MS,
            path_delay_discard_multiplier: 0.0,
        };
        let mut s = MeasurementStore::new(cfg);
        let t3 = T3_BASE;
        let t4 = t3 + 100 * MS;
        let t1 = t3 + 10 * MS;
        let t2 = t1 + 100 * MS;
        run_exchange(&mut s, 1, t1, t2, t3, t4, 0, 0);
        s.cleanup();
        // 10ms delay is under the 50ms floor
        let t3 = T3_BASE + 1000 * MS;
        let t4 = t3 + 10 * MS;
        let t1 = t3 + 5 * MS;
        let t2 = t1 + 10 * MS;
        let r = run_exchange(&mut s, 2, t1, t2, t3, t4, 0, 0);
        assert!(r.bad_delay);
        assert_eq!(r.delay_ns, (100 * MS) as f64);
    }

    #[test]
    fn test_median_filter_smooths_delay() {
        let cfg = MeasurementConfig {
            path_delay_filter: PathDelayFilter::Median,
            path_delay_filter_length: 3,
            path_delay_discard_below_ns: 0,
            path_delay_discard_multiplier: 0.0,
        };
        let mut s = MeasurementStore::new(cfg);
        let mut last = None;
        for (i, delay_ms) in [100i64, 102, 120].iter().enumerate() {
            let t3 = T3_BASE + i as i64 * 1000 * MS;
            let t4 = t3 + delay_ms * MS;
            let t1 = t3 + 10 * MS;
            let t2 = t1 + delay_ms * MS;
            last = Some(run_exchange(&mut s, i as u16, t1, t2, t3, t4, 0, 0));
            s.cleanup();
        }
        // median of {100, 102, 120} ms
        assert_eq!(last.unwrap().delay_ns, (102 * MS) as f64);
    }
}
