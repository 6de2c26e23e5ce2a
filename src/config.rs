//! Konfigurationsmodul
//!
//! Lädt die Client-Konfiguration aus einer TOML-Datei

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::net::TsMode;
use crate::servo::ServoConfig;
use crate::sync::{BackoffConfig, MeasurementConfig};

/// Zeitstempel-Modus der Event-Sockets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampingMode {
    /// Hardware-Timestamps der Netzwerkkarte
    Hw,
    /// Software-Timestamps des Kernels
    Sw,
}

impl TimestampingMode {
    pub fn ts_mode(self) -> TsMode {
        match self {
            TimestampingMode::Hw => TsMode::Hardware,
            TimestampingMode::Sw => TsMode::Software,
        }
    }
}

/// Haupt-Konfiguration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Netzwerk-Interface für PHC und Timestamping
    #[serde(default = "default_iface")]
    pub iface: String,

    /// Lokale Adresse für Event- und General-Port
    #[serde(default = "default_listen_address")]
    pub listen_address: IpAddr,

    /// Tick-Periode in Sekunden
    #[serde(default = "default_interval")]
    pub interval: f64,

    /// Timeout eines Austauschs in Sekunden (muss unter interval liegen)
    #[serde(default = "default_exchange_timeout")]
    pub exchange_timeout: f64,

    #[serde(default = "default_timestamping")]
    pub timestamping: TimestampingMode,

    /// DSCP-Wert (0-63) für beide Sockets
    #[serde(default)]
    pub dscp: u8,

    /// Grandmaster: Adresse → Rang (1 = bevorzugt)
    #[serde(default)]
    pub servers: HashMap<String, u8>,

    /// GM oberhalb dieser Clock-Class wird verworfen
    #[serde(default = "default_max_clock_class")]
    pub max_clock_class: u8,

    /// GM oberhalb dieser Clock-Accuracy wird verworfen
    #[serde(default = "default_max_clock_accuracy")]
    pub max_clock_accuracy: u8,

    /// Pfad-Delay-Filter
    #[serde(default)]
    pub measurement: MeasurementConfig,

    /// PI-Servo
    #[serde(default)]
    pub servo: ServoConfig,

    /// Backoff nach fehlgeschlagenen Austauschen
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Poll-Versuche für TX-Timestamps
    #[serde(default = "default_attempts_txts")]
    pub attempts_txts: u32,

    /// Timeout je Poll-Versuch in Sekunden
    #[serde(default = "default_timeout_txts")]
    pub timeout_txts: f64,

    /// Mandanten-Tag: Anzahl der obersten Sequence-ID-Bits (0-15)
    #[serde(default)]
    pub sequence_id_mask_bits: u8,

    /// Wert des Mandanten-Tags
    #[serde(default)]
    pub sequence_id_mask_value: u16,

    /// Dry-Run: Uhr wird nicht gestellt
    #[serde(default)]
    pub free_running: bool,

    /// Ein Event-Socket je GM statt eines geteilten
    #[serde(default)]
    pub parallel_tx: bool,

    /// AlternateResponsePort-TLV: Port-Versatz (0 = kein TLV)
    #[serde(default)]
    pub alternate_port_offset: u16,

    /// PTP-Domain
    #[serde(default)]
    pub domain_number: u8,
}

// Default-Werte
fn default_iface() -> String {
    "eth0".to_string()
}
fn default_listen_address() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
}
fn default_interval() -> f64 {
    1.0
}
fn default_exchange_timeout() -> f64 {
    0.1
}
fn default_timestamping() -> TimestampingMode {
    TimestampingMode::Hw
}
fn default_max_clock_class() -> u8 {
    6
}
fn default_max_clock_accuracy() -> u8 {
    0x21
}
fn default_attempts_txts() -> u32 {
    10
}
fn default_timeout_txts() -> f64 {
    0.001
}

impl Default for Config {
    fn default() -> Self {
        Self {
            iface: default_iface(),
            listen_address: default_listen_address(),
            interval: default_interval(),
            exchange_timeout: default_exchange_timeout(),
            timestamping: default_timestamping(),
            dscp: 0,
            servers: HashMap::new(),
            max_clock_class: default_max_clock_class(),
            max_clock_accuracy: default_max_clock_accuracy(),
            measurement: MeasurementConfig::default(),
            servo: ServoConfig::default(),
            backoff: BackoffConfig::default(),
            attempts_txts: default_attempts_txts(),
            timeout_txts: default_timeout_txts(),
            sequence_id_mask_bits: 0,
            sequence_id_mask_value: 0,
            free_running: false,
            parallel_tx: false,
            alternate_port_offset: 0,
            domain_number: 0,
        }
    }
}

impl Config {
    /// Konfiguration laden
    pub fn load() -> Result<Self> {
        let config_paths = [
            "sptp.toml",
            "/etc/sptp/sptp.toml",
            "~/.config/sptp/sptp.toml",
        ];

        for path in config_paths {
            let expanded_path = shellexpand::tilde(path);
            if Path::new(expanded_path.as_ref()).exists() {
                return Self::load_from_file(expanded_path.as_ref());
            }
        }

        // Keine Konfiguration gefunden, Standard verwenden
        tracing::warn!("Keine sptp.toml gefunden, verwende Standardwerte");
        Ok(Self::default())
    }

    /// Konfiguration aus Datei laden
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("Konnte {} nicht lesen", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Fehler beim Parsen von {}", path))?;

        tracing::info!("Konfiguration geladen von: {}", path);
        Ok(config)
    }

    /// Konfiguration prüfen
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            bail!("keine Grandmaster konfiguriert (servers)");
        }
        for (addr, rank) in &self.servers {
            addr.parse::<IpAddr>()
                .with_context(|| format!("ungültige GM-Adresse: {}", addr))?;
            if *rank == 0 {
                bail!("GM-Rang muss >= 1 sein ({})", addr);
            }
        }
        // Ränge müssen eine Permutation von 1..N sein, sonst bricht die
        // Ringverschiebung nach einem Masterwechsel
        let mut ranks: Vec<u8> = self.servers.values().copied().collect();
        ranks.sort_unstable();
        if ranks
            .iter()
            .enumerate()
            .any(|(i, rank)| *rank != (i + 1) as u8)
        {
            bail!("GM-Ränge müssen lückenlos 1..{} vergeben sein", self.servers.len());
        }
        if self.interval <= 0.0 {
            bail!("interval muss positiv sein");
        }
        if self.exchange_timeout <= 0.0 || self.exchange_timeout >= self.interval {
            bail!("exchange_timeout muss zwischen 0 und interval liegen");
        }
        if self.dscp > 63 {
            bail!("dscp muss zwischen 0 und 63 liegen");
        }
        if self.sequence_id_mask_bits > 15 {
            bail!("sequence_id_mask_bits muss zwischen 0 und 15 liegen");
        }
        if self.attempts_txts == 0 {
            bail!("attempts_txts muss >= 1 sein");
        }
        Ok(())
    }

    /// Server als geparste Adressen, nach Rang sortiert
    pub fn server_addrs(&self) -> Result<Vec<(IpAddr, u8)>> {
        let mut servers = Vec::with_capacity(self.servers.len());
        for (addr, rank) in &self.servers {
            let ip = addr
                .parse::<IpAddr>()
                .with_context(|| format!("ungültige GM-Adresse: {}", addr))?;
            servers.push((ip, *rank));
        }
        servers.sort_by_key(|(_, rank)| *rank);
        Ok(servers)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.exchange_timeout)
    }

    pub fn timeout_txts(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_txts)
    }
}
