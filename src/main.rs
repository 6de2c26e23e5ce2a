//! SPTP Client
//!
//! Simple Unicast PTP - Zeit-Synchronisation gegen mehrere Grandmaster
//!
//! Funktionen:
//! - Zwei-Paket-Austausch (Delay-Request / Sync + Announce) je Tick
//! - Hardware- oder Software-Timestamping
//! - Erweiterte BMCA mit Betreiber-Prioritäten
//! - PI-Servo mit Spike-Filter und Holdover
//! - PHC- oder Systemuhr-Steuerung, Dry-Run-Modus

mod clock;
mod config;
mod net;
mod ptp;
mod servo;
mod stats;
mod sync;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::sync::Sptp;

#[tokio::main]
async fn main() -> Result<()> {
    // Logging initialisieren
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("⏱️ SPTP Client v{}", env!("CARGO_PKG_VERSION"));
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    // Konfiguration laden
    let config = Config::load()?;
    config.validate()?;
    info!(
        "Konfiguration: {} Grandmaster, Interface {}, Timestamping {:?}",
        config.servers.len(),
        config.iface,
        config.timestamping
    );
    if config.free_running {
        info!("Dry-Run: Uhr wird nicht gestellt");
    }

    // Koordinator aufbauen und laufen lassen (blockiert bis Ctrl-C)
    let mut sptp = Sptp::new(config)?;
    let stats = sptp.stats();
    sptp.run().await?;

    // Abschluss-Statistik
    match serde_json::to_string_pretty(&stats.snapshot()) {
        Ok(json) => info!("Statistik:\n{}", json),
        Err(e) => info!("Statistik nicht serialisierbar: {}", e),
    }
    info!("SPTP Client beendet");
    Ok(())
}
