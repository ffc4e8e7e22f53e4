use serde::{Deserialize, Serialize};

use crate::log_entry::LogLevel;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerConfig {
    /// Width of the (service, window) buckets, in seconds
    pub window_secs: i64,
    /// Bucket is anomalous above `mean + k * stddev`
    pub k: f64,
    /// Services with fewer entries than this skip the statistical comparison
    pub min_samples: usize,
    pub weights: SeverityWeights,
    /// Scores used when the statistics are degenerate
    pub heuristic: LevelScores,
    /// Scores for entries outside anomaly windows
    pub baseline: LevelScores,
}

/// Per-level contribution to a bucket's density
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SeverityWeights {
    pub debug: f64,
    pub info: f64,
    pub warn: f64,
    pub error: f64,
    pub critical: f64,
    pub unknown: f64,
}

impl SeverityWeights {
    pub fn weight(&self, level: LogLevel) -> f64 {
        match level {
            LogLevel::Debug => self.debug,
            LogLevel::Info => self.info,
            LogLevel::Warn => self.warn,
            LogLevel::Error => self.error,
            LogLevel::Critical => self.critical,
            LogLevel::Unknown => self.unknown,
        }
    }
}

impl Default for SeverityWeights {
    fn default() -> Self {
        Self {
            debug: 0.0,
            info: 0.0,
            warn: 0.3,
            error: 1.0,
            critical: 1.5,
            unknown: 0.0,
        }
    }
}

/// Level-only scores; every level other than ERROR/CRITICAL scores 0
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LevelScores {
    pub error: f64,
    pub critical: f64,
}

impl LevelScores {
    pub fn score(&self, level: LogLevel) -> f64 {
        match level {
            LogLevel::Error => self.error,
            LogLevel::Critical => self.critical,
            _ => 0.0,
        }
    }

    pub fn degenerate() -> Self {
        Self {
            error: 0.5,
            critical: 0.8,
        }
    }

    pub fn outside_window() -> Self {
        Self {
            error: 0.2,
            critical: 0.3,
        }
    }
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            window_secs: 300,
            k: 2.0,
            min_samples: 5,
            weights: SeverityWeights::default(),
            heuristic: LevelScores::degenerate(),
            baseline: LevelScores::outside_window(),
        }
    }
}

impl ScorerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags smaller bursts (k = 1.5)
    pub fn sensitive() -> Self {
        Self {
            k: 1.5,
            ..Default::default()
        }
    }

    /// Only flags pronounced bursts (k = 3)
    pub fn conservative() -> Self {
        Self {
            k: 3.0,
            ..Default::default()
        }
    }

    pub fn with_window_secs(mut self, secs: i64) -> Self {
        self.window_secs = secs;
        self
    }

    pub fn with_k(mut self, k: f64) -> Self {
        self.k = k.max(0.0);
        self
    }

    pub fn with_min_samples(mut self, min_samples: usize) -> Self {
        self.min_samples = min_samples.max(1);
        self
    }

    pub fn with_weights(mut self, weights: SeverityWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Window width in minutes, the unit densities are expressed in
    pub fn window_minutes(&self) -> f64 {
        self.window_secs as f64 / 60.0
    }
}
