//! Per-GM Backoff nach fehlgeschlagenen Austauschen
//!
//! Ein Grandmaster, der nicht antwortet, wird für eine wachsende Zahl von
//! Ticks übersprungen. Der Wert sinkt mit der realen Wartezeit wieder ab.

use std::time::Duration;

use serde::Deserialize;

/// Wachstumsmodus des Backoff-Werts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffMode {
    /// Kein Backoff, Wert bleibt immer 0
    #[default]
    None,
    /// Konstanter Wert `step`
    Fixed,
    /// `counter * step`
    Linear,
    /// `step ^ counter`
    Exponential,
}

/// Backoff-Konfiguration (Sekunden)
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BackoffConfig {
    #[serde(default)]
    pub mode: BackoffMode,
    #[serde(default = "default_step")]
    pub step: u64,
    #[serde(default = "default_max_value")]
    pub max_value: u64,
}

fn default_step() -> u64 {
    2
}

fn default_max_value() -> u64 {
    60
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            mode: BackoffMode::None,
            step: default_step(),
            max_value: default_max_value(),
        }
    }
}

/// Backoff-Zustand eines einzelnen GM
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    counter: u32,
    value: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            counter: 0,
            value: Duration::ZERO,
        }
    }

    /// Aktiv, sobald ein Restwert ansteht
    pub fn is_active(&self) -> bool {
        self.value > Duration::ZERO
    }

    pub fn value(&self) -> Duration {
        self.value
    }

    /// Nächste Stufe nach einem Fehlschlag; liefert den neuen Wert in
    /// Sekunden (0 im Modus `none`)
    pub fn inc(&mut self) -> u64 {
        if self.config.mode == BackoffMode::None {
            return 0;
        }
        self.counter += 1;
        let secs = match self.config.mode {
            BackoffMode::None => 0,
            BackoffMode::Fixed => self.config.step,
            BackoffMode::Linear => self.config.step.saturating_mul(self.counter as u64),
            BackoffMode::Exponential => self.config.step.saturating_pow(self.counter),
        };
        let secs = secs.min(self.config.max_value);
        self.value = Duration::from_secs(secs);
        secs
    }

    /// Verstrichene Zeit abziehen, bei 0 geklemmt; liefert den Restwert
    pub fn dec(&mut self, elapsed: Duration) -> Duration {
        self.value = self.value.saturating_sub(elapsed);
        self.value
    }

    /// Zähler und Wert zurücksetzen (nach erfolgreichem Austausch)
    pub fn reset(&mut self) {
        self.counter = 0;
        self.value = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(mode: BackoffMode, step: u64, max_value: u64) -> Backoff {
        Backoff::new(BackoffConfig {
            mode,
            step,
            max_value,
        })
    }

    #[test]
    fn test_mode_none_stays_inactive() {
        let mut b = backoff(BackoffMode::None, 5, 60);
        assert_eq!(b.inc(), 0);
        assert_eq!(b.dec(Duration::from_secs(1)), Duration::ZERO);
        assert!(!b.is_active());
    }

    #[test]
    fn test_mode_fixed_dec_steps_down() {
        let mut b = backoff(BackoffMode::Fixed, 10, 60);
        assert_eq!(b.inc(), 10);
        assert_eq!(b.dec(Duration::from_secs(3)), Duration::from_secs(7));
        assert_eq!(b.dec(Duration::from_secs(3)), Duration::from_secs(4));
        assert_eq!(b.dec(Duration::from_secs(10)), Duration::ZERO);
        assert!(!b.is_active());
    }

    #[test]
    fn test_mode_linear_grows_and_clamps() {
        let mut b = backoff(BackoffMode::Linear, 4, 10);
        assert_eq!(b.inc(), 4);
        assert_eq!(b.inc(), 8);
        assert_eq!(b.inc(), 10);
        assert_eq!(b.inc(), 10);
    }

    #[test]
    fn test_mode_exponential_grows_and_clamps() {
        let mut b = backoff(BackoffMode::Exponential, 3, 30);
        assert_eq!(b.inc(), 3);
        assert_eq!(b.inc(), 9);
        assert_eq!(b.inc(), 27);
        assert_eq!(b.inc(), 30);
    }

    #[test]
    fn test_reset_restarts_growth() {
        let mut b = backoff(BackoffMode::Exponential, 2, 64);
        b.inc();
        b.inc();
        b.reset();
        assert!(!b.is_active());
        assert_eq!(b.inc(), 2);
    }

    #[test]
    fn test_active_iff_value_positive() {
        let mut b = backoff(BackoffMode::Fixed, 1, 60);
        assert!(!b.is_active());
        b.inc();
        assert!(b.is_active());
        b.dec(Duration::from_secs(1));
        assert!(!b.is_active());
    }
}
