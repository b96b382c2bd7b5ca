//! Minuterie monotone pour le pas de service coopératif.

use std::time::{Duration, Instant};

/// Minuterie à période fixe sur horloge monotone.
///
/// Une période nulle est toujours expirée : c'est la valeur sentinelle
/// "désarmée" utilisée par les moteurs.
#[derive(Debug, Clone)]
pub struct Timer {
    period: Duration,
    origin: Instant,
}

impl Timer {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            origin: Instant::now(),
        }
    }

    pub fn expired(&self) -> bool {
        self.period.is_zero() || self.origin.elapsed() >= self.period
    }

    /// Force l'expiration au prochain test.
    pub fn trigger(&mut self) {
        self.origin = Instant::now() - self.period;
    }

    pub fn reset(&mut self) {
        self.origin = Instant::now();
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn set_period(&mut self, period: Duration) {
        self.period = period;
    }
}
