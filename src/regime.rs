//! Market-regime state and advisory seams
//!
//! The regime classification itself is an external collaborator; this
//! module owns the shared flag and the retrain discipline. The flag sits
//! behind a read/write lock so the per-update read path never waits on a
//! slow retrain, which runs in its own task under a separate mutex and
//! swaps the flag only on completion.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::feed::Bar;

/// Market regime label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegimeLabel {
    Bull,
    Bear,
    Sideways,
    /// Entries are blocked: slippage risk outweighs the scalp edge
    Volatile,
}

/// A regime classification with its confidence
#[derive(Debug, Clone, Copy)]
pub struct RegimeReading {
    pub label: RegimeLabel,
    pub strength: f64,
}

impl Default for RegimeReading {
    fn default() -> Self {
        Self {
            label: RegimeLabel::Sideways,
            strength: 0.0,
        }
    }
}

/// Advisory regime classifier. Pure from the engine's point of view.
#[async_trait]
pub trait RegimeDetector: Send + Sync {
    /// Classify from the latest closed bar
    fn detect(&self, bar: &Bar) -> RegimeReading;

    /// Refit the model on a longer history. May be slow; the engine
    /// never calls it on the update path.
    async fn retrain(&self, history: &[Bar]) -> anyhow::Result<()> {
        let _ = history;
        Ok(())
    }

    /// Classification over a longer history with a probability, for
    /// models that support it
    fn predict(&self, history: &[Bar]) -> Option<(RegimeLabel, f64)> {
        let _ = history;
        None
    }
}

/// Default detector: no opinion, never blocks trading
pub struct HoldDetector;

#[async_trait]
impl RegimeDetector for HoldDetector {
    fn detect(&self, _bar: &Bar) -> RegimeReading {
        RegimeReading::default()
    }
}

/// Risk profile selected by the advisory model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskProfile {
    Conservative,
    Balanced,
    Aggressive,
}

impl RiskProfile {
    /// Stop-distance multiplier for the profile
    pub fn stop_multiplier(&self) -> f64 {
        match self {
            Self::Conservative => 1.0,
            Self::Balanced => 1.5,
            Self::Aggressive => 2.0,
        }
    }
}

/// Advisory risk-profile selector. Observation vector: normalized
/// momentum, volatility, bandwidth, trend strength, current drawdown.
pub trait RiskAdvisor: Send + Sync {
    fn predict(&self, observation: [f64; 5]) -> RiskProfile;
}

/// Default advisor: always the balanced profile (the mandated fallback
/// when no model is available)
pub struct BalancedAdvisor;

impl RiskAdvisor for BalancedAdvisor {
    fn predict(&self, _observation: [f64; 5]) -> RiskProfile {
        RiskProfile::Balanced
    }
}

/// Shared regime flag with retrain mutual exclusion
#[derive(Clone)]
pub struct SharedRegime {
    reading: Arc<RwLock<RegimeReading>>,
    retrain_guard: Arc<Mutex<()>>,
    detector: Arc<dyn RegimeDetector>,
}

impl SharedRegime {
    pub fn new(detector: Arc<dyn RegimeDetector>) -> Self {
        Self {
            reading: Arc::new(RwLock::new(RegimeReading::default())),
            retrain_guard: Arc::new(Mutex::new(())),
            detector,
        }
    }

    /// Current classification (fast read, never blocked by retrain)
    pub async fn current(&self) -> RegimeReading {
        *self.reading.read().await
    }

    /// Refresh the flag from the latest bar
    pub async fn refresh(&self, bar: &Bar) {
        let reading = self.detector.detect(bar);
        *self.reading.write().await = reading;
    }

    /// Run a retrain if none is in flight. Failure is logged and skipped,
    /// never fatal; an in-flight retrain makes this a no-op.
    pub async fn retrain(&self, history: Vec<Bar>) {
        let Ok(_guard) = self.retrain_guard.try_lock() else {
            debug!("retrain already in progress, skipping");
            return;
        };
        if let Err(e) = self.detector.retrain(&history).await {
            warn!(error = %e, "regime retrain failed, keeping previous model");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingDetector {
        retrains: AtomicU32,
    }

    #[async_trait]
    impl RegimeDetector for CountingDetector {
        fn detect(&self, _bar: &Bar) -> RegimeReading {
            RegimeReading {
                label: RegimeLabel::Volatile,
                strength: 0.9,
            }
        }

        async fn retrain(&self, _history: &[Bar]) -> anyhow::Result<()> {
            self.retrains.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn refresh_swaps_the_flag() {
        let detector = Arc::new(CountingDetector {
            retrains: AtomicU32::new(0),
        });
        let regime = SharedRegime::new(detector.clone());
        assert_eq!(regime.current().await.label, RegimeLabel::Sideways);

        let bar = Bar::new("BTCUSDT", 100.0, 101.0, 99.0, 100.5, 10.0);
        regime.refresh(&bar).await;
        assert_eq!(regime.current().await.label, RegimeLabel::Volatile);

        regime.retrain(vec![bar]).await;
        assert_eq!(detector.retrains.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_retrain_is_tolerated() {
        struct FailingDetector;

        #[async_trait]
        impl RegimeDetector for FailingDetector {
            fn detect(&self, _bar: &Bar) -> RegimeReading {
                RegimeReading::default()
            }
            async fn retrain(&self, _history: &[Bar]) -> anyhow::Result<()> {
                anyhow::bail!("model blew up")
            }
        }

        let regime = SharedRegime::new(Arc::new(FailingDetector));
        regime.retrain(Vec::new()).await;
        // Reading is still usable after a failed retrain
        assert_eq!(regime.current().await.label, RegimeLabel::Sideways);
    }

    #[test]
    fn profile_multipliers() {
        assert_eq!(RiskProfile::Conservative.stop_multiplier(), 1.0);
        assert_eq!(RiskProfile::Balanced.stop_multiplier(), 1.5);
        assert_eq!(RiskProfile::Aggressive.stop_multiplier(), 2.0);
        assert_eq!(BalancedAdvisor.predict([0.0; 5]), RiskProfile::Balanced);
    }
}
