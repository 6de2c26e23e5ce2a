//! Laufzeit-Statistiken
//!
//! Zähler und Messwerte pro Grandmaster plus globale Werte. Der Snapshot
//! ist serialisierbar und entspricht der Form, die ein externer
//! Statistik-Endpunkt ausliefern würde.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

use crate::sync::MeasurementResult;

/// Messwerte und Zähler eines einzelnen GM
#[derive(Debug, Clone, Default, Serialize)]
pub struct GmStats {
    /// Letzter Offset in Nanosekunden
    pub offset: i64,
    /// Letzter Pfad-Delay in Nanosekunden
    pub delay: f64,
    pub s2c_delay: i64,
    pub c2s_delay: i64,
    /// GM hat im letzten Tick geantwortet
    pub gm_present: bool,
    /// Aktuell als Best Master ausgewählt
    pub selected: bool,
    /// Vom Pfad-Delay-Filter verworfene Samples
    pub filtered: u64,
    pub backoff_active: bool,
    pub backoff_seconds: u64,
    pub error_count: u64,
    pub rx_sync: u64,
    pub rx_announce: u64,
    pub tx_delay_req: u64,
}

/// Globale Werte des Koordinators
#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalStats {
    pub servo_state: u8,
    /// Angewandte Frequenzkorrektur in ppb
    pub freq: f64,
    pub tick_duration_ms: f64,
    /// Wechsel des Best Masters seit Start
    pub port_change_count: u64,
    /// Verworfene unbekannte/defekte Pakete
    pub rx_unsupported: u64,
    /// Beantwortete ptping-Proben
    pub probes_answered: u64,
}

/// Serialisierbarer Gesamt-Snapshot
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub gms: HashMap<String, GmStats>,
    pub global: GlobalStats,
}

/// Thread-sicheres Statistik-Register
#[derive(Debug, Default)]
pub struct Stats {
    gms: RwLock<HashMap<IpAddr, GmStats>>,
    global: RwLock<GlobalStats>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_gm<F: FnOnce(&mut GmStats)>(&self, addr: IpAddr, f: F) {
        let mut gms = self.gms.write();
        f(gms.entry(addr).or_default());
    }

    pub fn update_measurement(&self, addr: IpAddr, m: &MeasurementResult) {
        self.with_gm(addr, |s| {
            s.offset = m.offset_ns;
            s.delay = m.delay_ns;
            s.s2c_delay = m.s2c_delay_ns;
            s.c2s_delay = m.c2s_delay_ns;
            s.gm_present = true;
            if m.bad_delay {
                s.filtered += 1;
            }
        });
    }

    pub fn record_error(&self, addr: IpAddr) {
        self.with_gm(addr, |s| {
            s.gm_present = false;
            s.error_count += 1;
        });
    }

    pub fn set_backoff(&self, addr: IpAddr, active: bool, seconds: u64) {
        self.with_gm(addr, |s| {
            s.backoff_active = active;
            s.backoff_seconds = seconds;
        });
    }

    pub fn set_selected(&self, best: Option<IpAddr>) {
        let mut gms = self.gms.write();
        for (addr, s) in gms.iter_mut() {
            s.selected = Some(*addr) == best;
        }
    }

    pub fn inc_rx_sync(&self, addr: IpAddr) {
        self.with_gm(addr, |s| s.rx_sync += 1);
    }

    pub fn inc_rx_announce(&self, addr: IpAddr) {
        self.with_gm(addr, |s| s.rx_announce += 1);
    }

    pub fn inc_tx_delay_req(&self, addr: IpAddr) {
        self.with_gm(addr, |s| s.tx_delay_req += 1);
    }

    pub fn inc_rx_unsupported(&self) {
        self.global.write().rx_unsupported += 1;
    }

    pub fn inc_probes_answered(&self) {
        self.global.write().probes_answered += 1;
    }

    pub fn inc_port_changes(&self) {
        self.global.write().port_change_count += 1;
    }

    pub fn set_servo(&self, state: u8, freq: f64) {
        let mut global = self.global.write();
        global.servo_state = state;
        global.freq = freq;
    }

    pub fn set_tick_duration(&self, duration: Duration) {
        self.global.write().tick_duration_ms = duration.as_secs_f64() * 1000.0;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            gms: self
                .gms
                .read()
                .iter()
                .map(|(addr, s)| (addr.to_string(), s.clone()))
                .collect(),
            global: self.global.read().clone(),
        }
    }
}
