/// Batch-relative anomaly scoring
///
/// Entries are bucketed per (service, window). A bucket whose severity-weighted
/// density sits more than `k` standard deviations above the rest of the
/// service's buckets is an anomaly window; its entries score by how far the
/// density clears the threshold. Everything else gets a level-only baseline.
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{PipelineError, PipelineResult};
use crate::histogram::{BaselineStats, DensityHistogram};
use crate::log_entry::LogEntry;
use crate::scorer_config::ScorerConfig;
use crate::traits::BaselineProvider;

/// Standard deviations at or below this are treated as zero variance
const ZERO_VARIANCE: f64 = 1e-9;

/// Compares each window against the other windows of the same batch
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchBaseline;

impl BaselineProvider for BatchBaseline {
    fn baselines(
        &self,
        _service: &str,
        histogram: &DensityHistogram,
        exclude: &BTreeSet<i64>,
    ) -> BTreeMap<i64, Option<BaselineStats>> {
        histogram.leave_one_out(exclude)
    }

    fn name(&self) -> &str {
        "batch"
    }
}

/// Per-service statistics carried over from earlier batches.
///
/// Services without history fall back to the batch baseline.
#[derive(Debug, Clone, Default)]
pub struct HistoricalBaseline {
    stats: FxHashMap<String, BaselineStats>,
}

impl HistoricalBaseline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: &str, stats: BaselineStats) -> Self {
        self.stats.insert(service.to_string(), stats);
        self
    }

    /// Learn per-service statistics from a previously ingested batch
    pub fn from_batch(entries: &[LogEntry], config: &ScorerConfig) -> Self {
        let mut baseline = Self::new();
        if config.window_secs <= 0 {
            return baseline;
        }
        for (service, histogram) in build_histograms(entries, config) {
            if let Some(stats) = histogram.stats_excluding(&BTreeSet::new()) {
                baseline.stats.insert(service.to_string(), stats);
            }
        }
        baseline
    }

    pub fn service_count(&self) -> usize {
        self.stats.len()
    }
}

impl BaselineProvider for HistoricalBaseline {
    fn baselines(
        &self,
        service: &str,
        histogram: &DensityHistogram,
        exclude: &BTreeSet<i64>,
    ) -> BTreeMap<i64, Option<BaselineStats>> {
        match self.stats.get(service) {
            Some(stats) => histogram.densities().map(|(window, _)| (window, Some(*stats))).collect(),
            None => histogram.leave_one_out(exclude),
        }
    }

    fn name(&self) -> &str {
        "historical"
    }
}

/// Verdict for one (service, window) bucket
#[derive(Debug, Clone, Copy, PartialEq)]
enum WindowVerdict {
    /// Not enough signal; use the level-only heuristic
    Degenerate,
    Normal,
    Anomalous(f64),
}

/// A flagged bucket, for reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyWindow {
    pub service: String,
    pub window_start: DateTime<Utc>,
    pub entry_count: usize,
    pub density: f64,
    pub threshold: f64,
    pub score: f64,
}

pub struct AnomalyScorer {
    config: ScorerConfig,
    baseline: Arc<dyn BaselineProvider>,
}

impl Default for AnomalyScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl AnomalyScorer {
    pub fn new() -> Self {
        Self::with_config(ScorerConfig::default())
    }

    pub fn with_config(config: ScorerConfig) -> Self {
        Self {
            config,
            baseline: Arc::new(BatchBaseline),
        }
    }

    pub fn with_baseline(mut self, baseline: Arc<dyn BaselineProvider>) -> Self {
        self.baseline = baseline;
        self
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    /// Score a batch. Never fails: on an internal error every entry is
    /// returned with a score of 0.
    pub fn score(&self, mut entries: Vec<LogEntry>) -> Vec<LogEntry> {
        self.score_in_place(&mut entries);
        entries
    }

    pub fn score_in_place(&self, entries: &mut [LogEntry]) {
        match self.try_scores(entries) {
            Ok(scores) => {
                for (entry, score) in entries.iter_mut().zip(scores) {
                    entry.anomaly_score = score;
                }
            }
            Err(e) => {
                tracing::warn!("Anomaly scoring degraded to unscored entries: {}", e);
                for entry in entries.iter_mut() {
                    entry.anomaly_score = 0.0;
                }
            }
        }
    }

    /// Scores aligned with `entries`. Only reads timestamp, level and service,
    /// so re-scoring a scored batch yields the same numbers.
    pub fn try_scores(&self, entries: &[LogEntry]) -> PipelineResult<Vec<f64>> {
        let verdicts = self.verdicts(entries)?;

        let mut scores = Vec::with_capacity(entries.len());
        for entry in entries {
            let window = self.window_of(entry);
            let verdict = verdicts
                .get(&(entry.service.as_str(), window))
                .copied()
                .unwrap_or(WindowVerdict::Degenerate);

            let score = match verdict {
                WindowVerdict::Degenerate => self.config.heuristic.score(entry.level),
                WindowVerdict::Normal => self.config.baseline.score(entry.level),
                WindowVerdict::Anomalous(score) => score,
            };

            if !score.is_finite() {
                return Err(PipelineError::Scoring(format!(
                    "non-finite score for line {} ({})",
                    entry.line_index, entry.service
                )));
            }
            scores.push(score.clamp(0.0, 1.0));
        }

        Ok(scores)
    }

    /// The anomaly windows of a batch, ordered by service then time
    pub fn anomaly_windows(&self, entries: &[LogEntry]) -> PipelineResult<Vec<AnomalyWindow>> {
        self.check_config()?;
        let histograms = build_histograms(entries, &self.config);

        let mut windows = Vec::new();
        let mut services: Vec<&&str> = histograms.keys().collect();
        services.sort();

        for service in services {
            let histogram = &histograms[*service];
            if self.is_degenerate(histogram) {
                continue;
            }
            let baselines = self.final_baselines(service, histogram);
            for (window, density) in histogram.densities() {
                if let Some(Some(stats)) = baselines.get(&window) {
                    if let WindowVerdict::Anomalous(score) = self.judge(density, stats) {
                        windows.push(AnomalyWindow {
                            service: service.to_string(),
                            window_start: DateTime::from_timestamp(window * self.config.window_secs, 0)
                                .unwrap_or_default(),
                            entry_count: histogram.get_count(window),
                            density,
                            threshold: stats.threshold(self.config.k),
                            score,
                        });
                    }
                }
            }
        }

        Ok(windows)
    }

    fn check_config(&self) -> PipelineResult<()> {
        if self.config.window_secs <= 0 {
            return Err(PipelineError::Scoring(format!(
                "window width must be positive, got {}s",
                self.config.window_secs
            )));
        }
        if !self.config.k.is_finite() {
            return Err(PipelineError::Scoring("k must be finite".to_string()));
        }
        Ok(())
    }

    fn window_of(&self, entry: &LogEntry) -> i64 {
        entry.timestamp.timestamp().div_euclid(self.config.window_secs)
    }

    fn is_degenerate(&self, histogram: &DensityHistogram) -> bool {
        histogram.total < self.config.min_samples || histogram.window_count() < 2
    }

    fn verdicts<'a>(
        &self,
        entries: &'a [LogEntry],
    ) -> PipelineResult<FxHashMap<(&'a str, i64), WindowVerdict>> {
        self.check_config()?;
        let histograms = build_histograms(entries, &self.config);
        let mut verdicts = FxHashMap::default();

        for (service, histogram) in &histograms {
            if self.is_degenerate(histogram) {
                tracing::debug!(
                    "Service {} has {} entries in {} window(s); using level heuristic",
                    service,
                    histogram.total,
                    histogram.window_count()
                );
                continue;
            }

            let baselines = self.final_baselines(service, histogram);
            for (window, density) in histogram.densities() {
                let verdict = match baselines.get(&window) {
                    Some(Some(stats)) => self.judge(density, stats),
                    _ => WindowVerdict::Degenerate,
                };
                verdicts.insert((*service, window), verdict);
            }
        }

        Ok(verdicts)
    }

    /// Two passes: the plain leave-one-out baseline flags the obvious
    /// windows, then every window is re-judged with those windows left out
    /// of the baseline so a burst spanning several windows cannot hide itself.
    fn final_baselines(
        &self,
        service: &str,
        histogram: &DensityHistogram,
    ) -> BTreeMap<i64, Option<BaselineStats>> {
        let first = self.baseline.baselines(service, histogram, &BTreeSet::new());

        let flagged: BTreeSet<i64> = histogram
            .densities()
            .filter(|(window, density)| {
                matches!(
                    first.get(window),
                    Some(Some(stats)) if matches!(self.judge(*density, stats), WindowVerdict::Anomalous(_))
                )
            })
            .map(|(window, _)| window)
            .collect();

        if flagged.is_empty() {
            return first;
        }

        tracing::debug!(
            "Service {}: {} window(s) flagged in first pass, re-baselining without them",
            service,
            flagged.len()
        );
        self.baseline.baselines(service, histogram, &flagged)
    }

    fn judge(&self, density: f64, stats: &BaselineStats) -> WindowVerdict {
        if stats.std_dev <= ZERO_VARIANCE {
            return WindowVerdict::Degenerate;
        }
        let threshold = stats.threshold(self.config.k);
        if density > threshold && density > 0.0 {
            WindowVerdict::Anomalous(((density - threshold) / density).min(1.0))
        } else {
            WindowVerdict::Normal
        }
    }
}

fn build_histograms<'a>(
    entries: &'a [LogEntry],
    config: &ScorerConfig,
) -> FxHashMap<&'a str, DensityHistogram> {
    let mut histograms: FxHashMap<&str, DensityHistogram> = FxHashMap::default();
    let window_minutes = config.window_minutes();

    for entry in entries {
        let window = entry.timestamp.timestamp().div_euclid(config.window_secs);
        histograms
            .entry(entry.service.as_str())
            .or_insert_with(|| DensityHistogram::new(window_minutes))
            .add(window, config.weights.weight(entry.level));
    }

    histograms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_entry::LogLevel;
    use chrono::{Duration, TimeZone};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap()
    }

    fn entry(service: &str, level: LogLevel, offset_secs: i64) -> LogEntry {
        LogEntry {
            job_id: "JOB-test".to_string(),
            line_index: 0,
            timestamp: base() + Duration::seconds(offset_secs),
            level,
            service: service.to_string(),
            message: format!("{} event", level),
            raw_line: String::new(),
            anomaly_score: 0.0,
            extra: None,
        }
    }

    /// 24 quiet windows with the odd warning, then one window full of errors
    fn burst_batch() -> Vec<LogEntry> {
        let mut entries = Vec::new();
        for window in 0..24 {
            entries.push(entry("api", LogLevel::Info, window * 300));
            if window % 3 == 0 {
                entries.push(entry("api", LogLevel::Warn, window * 300 + 10));
            }
        }
        for i in 0..20 {
            entries.push(entry("api", LogLevel::Error, 24 * 300 + i * 10));
        }
        entries
    }

    #[test]
    fn test_single_entry_uses_heuristic() {
        let scorer = AnomalyScorer::new();
        let scored = scorer.score(vec![entry("api", LogLevel::Error, 0)]);
        assert_eq!(scored[0].anomaly_score, 0.5);

        let scored = scorer.score(vec![entry("api", LogLevel::Info, 0)]);
        assert_eq!(scored[0].anomaly_score, 0.0);
    }

    #[test]
    fn test_empty_batch() {
        assert!(AnomalyScorer::new().score(Vec::new()).is_empty());
    }

    #[test]
    fn test_few_samples_fall_back_to_heuristic() {
        let entries = vec![
            entry("api", LogLevel::Critical, 0),
            entry("api", LogLevel::Error, 600),
            entry("api", LogLevel::Warn, 1200),
        ];
        let scores: Vec<f64> = AnomalyScorer::new()
            .score(entries)
            .iter()
            .map(|e| e.anomaly_score)
            .collect();
        assert_eq!(scores, vec![0.8, 0.5, 0.0]);
    }

    #[test]
    fn test_zero_variance_falls_back_to_heuristic() {
        // Same density in every window
        let entries: Vec<LogEntry> = (0..10)
            .map(|w| entry("api", LogLevel::Error, w * 300))
            .collect();
        let scored = AnomalyScorer::new().score(entries);
        assert!(scored.iter().all(|e| e.anomaly_score == 0.5));
    }

    #[test]
    fn test_burst_window_scores_high() {
        let scored = AnomalyScorer::new().score(burst_batch());

        for e in &scored {
            if e.level == LogLevel::Error {
                assert!(e.anomaly_score >= 0.7, "error scored {}", e.anomaly_score);
            } else {
                assert!(e.anomaly_score < 0.3, "{} scored {}", e.level, e.anomaly_score);
            }
        }

        let windows = AnomalyScorer::new().anomaly_windows(&burst_batch()).unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].service, "api");
        assert_eq!(windows[0].entry_count, 20);
        assert_eq!(windows[0].window_start, base() + Duration::seconds(24 * 300));
    }

    #[test]
    fn test_order_independent() {
        let sorted = burst_batch();
        let mut shuffled = sorted.clone();
        shuffled.reverse();
        shuffled.swap(3, 17);

        let scorer = AnomalyScorer::new();
        let mut a: Vec<(i64, LogLevel, u64)> = scorer
            .score(sorted)
            .iter()
            .map(|e| (e.timestamp.timestamp(), e.level, e.anomaly_score.to_bits()))
            .collect();
        let mut b: Vec<(i64, LogLevel, u64)> = scorer
            .score(shuffled)
            .iter()
            .map(|e| (e.timestamp.timestamp(), e.level, e.anomaly_score.to_bits()))
            .collect();
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rescoring_is_deterministic() {
        let scorer = AnomalyScorer::new();
        let once = scorer.score(burst_batch());
        let twice = scorer.score(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_invalid_window_degrades_to_zero() {
        let scorer = AnomalyScorer::with_config(ScorerConfig::new().with_window_secs(0));
        let mut entries = burst_batch();
        for e in entries.iter_mut() {
            e.anomaly_score = 0.9;
        }
        let scored = scorer.score(entries);
        assert!(scored.iter().all(|e| e.anomaly_score == 0.0));
        assert!(scorer.try_scores(&scored).is_err());
    }

    #[test]
    fn test_historical_baseline_flags_uniform_batch() {
        // Every window has 4 errors: zero variance within the batch, but far
        // above what this service normally does
        let entries: Vec<LogEntry> = (0..6)
            .flat_map(|w| (0..4).map(move |i| entry("db", LogLevel::Error, w * 300 + i)))
            .collect();

        let batch_only = AnomalyScorer::new().score(entries.clone());
        assert!(batch_only.iter().all(|e| e.anomaly_score == 0.5));

        let history = HistoricalBaseline::new().with_service(
            "db",
            BaselineStats {
                mean: 0.02,
                std_dev: 0.01,
                samples: 100,
            },
        );
        let scored = AnomalyScorer::new()
            .with_baseline(Arc::new(history))
            .score(entries);
        assert!(scored.iter().all(|e| e.anomaly_score > 0.9));
    }

    #[test]
    fn test_historical_baseline_from_batch() {
        let history = HistoricalBaseline::from_batch(&burst_batch(), &ScorerConfig::default());
        assert_eq!(history.service_count(), 1);
    }
}
