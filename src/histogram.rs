use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Mean and spread of bucket densities a window is compared against
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaselineStats {
    pub mean: f64,
    pub std_dev: f64,
    pub samples: usize,
}

impl BaselineStats {
    pub fn threshold(&self, k: f64) -> f64 {
        self.mean + k * self.std_dev
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct Bucket {
    weighted: f64,
    count: usize,
}

/// Severity-weighted activity of one service, bucketed into fixed windows.
///
/// Windows are `floor(unix_secs / window_secs)`, so out-of-order input lands
/// in the same buckets as sorted input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DensityHistogram {
    window_minutes: f64,
    buckets: BTreeMap<i64, Bucket>,
    pub total: usize,
}

impl DensityHistogram {
    pub fn new(window_minutes: f64) -> Self {
        Self {
            window_minutes,
            buckets: BTreeMap::new(),
            total: 0,
        }
    }

    /// Record one entry of the given weight in `window`
    pub fn add(&mut self, window: i64, weight: f64) {
        let bucket = self.buckets.entry(window).or_default();
        bucket.weighted += weight;
        bucket.count += 1;
        self.total += 1;
    }

    pub fn window_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn get_count(&self, window: i64) -> usize {
        self.buckets.get(&window).map(|b| b.count).unwrap_or(0)
    }

    /// Weighted sum divided by window width (per minute)
    pub fn density(&self, window: i64) -> Option<f64> {
        self.buckets
            .get(&window)
            .map(|b| b.weighted / self.window_minutes)
    }

    pub fn densities(&self) -> impl Iterator<Item = (i64, f64)> + '_ {
        self.buckets
            .iter()
            .map(move |(&window, b)| (window, b.weighted / self.window_minutes))
    }

    /// Statistics over every window not in `exclude`
    pub fn stats_excluding(&self, exclude: &BTreeSet<i64>) -> Option<BaselineStats> {
        let mut acc = ShiftedSums::new(self.densities().next().map(|(_, d)| d).unwrap_or(0.0));
        for (window, density) in self.densities() {
            if !exclude.contains(&window) {
                acc.add(density);
            }
        }
        acc.stats()
    }

    /// Baseline for every window, each computed without the window itself and
    /// without anything in `exclude`. Linear in the number of windows.
    pub fn leave_one_out(&self, exclude: &BTreeSet<i64>) -> BTreeMap<i64, Option<BaselineStats>> {
        let shift = self.densities().next().map(|(_, d)| d).unwrap_or(0.0);
        let mut all = ShiftedSums::new(shift);
        for (window, density) in self.densities() {
            if !exclude.contains(&window) {
                all.add(density);
            }
        }

        self.densities()
            .map(|(window, density)| {
                let stats = if exclude.contains(&window) {
                    all.stats()
                } else {
                    all.without(density).stats()
                };
                (window, stats)
            })
            .collect()
    }
}

/// Running sums of `x - shift`; shifting by a sample keeps the variance
/// exact (zero) for constant series.
#[derive(Debug, Clone, Copy)]
struct ShiftedSums {
    shift: f64,
    n: usize,
    s1: f64,
    s2: f64,
}

impl ShiftedSums {
    fn new(shift: f64) -> Self {
        Self {
            shift,
            n: 0,
            s1: 0.0,
            s2: 0.0,
        }
    }

    fn add(&mut self, x: f64) {
        let d = x - self.shift;
        self.n += 1;
        self.s1 += d;
        self.s2 += d * d;
    }

    fn without(&self, x: f64) -> Self {
        let d = x - self.shift;
        Self {
            shift: self.shift,
            n: self.n.saturating_sub(1),
            s1: self.s1 - d,
            s2: self.s2 - d * d,
        }
    }

    fn stats(&self) -> Option<BaselineStats> {
        if self.n == 0 {
            return None;
        }
        let n = self.n as f64;
        let mean_shifted = self.s1 / n;
        let variance = (self.s2 / n - mean_shifted * mean_shifted).max(0.0);
        Some(BaselineStats {
            mean: self.shift + mean_shifted,
            std_dev: variance.sqrt(),
            samples: self.n,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn histogram(densities: &[(i64, f64)]) -> DensityHistogram {
        let mut hist = DensityHistogram::new(1.0);
        for &(window, weight) in densities {
            hist.add(window, weight);
        }
        hist
    }

    #[test]
    fn test_histogram_counts() {
        let mut hist = DensityHistogram::new(5.0);
        hist.add(1, 1.0);
        hist.add(1, 0.3);
        hist.add(2, 0.0);

        assert_eq!(hist.total, 3);
        assert_eq!(hist.window_count(), 2);
        assert_eq!(hist.get_count(1), 2);
        assert!((hist.density(1).unwrap() - 0.26).abs() < 1e-12);
        assert_eq!(hist.density(3), None);
    }

    #[test]
    fn test_leave_one_out_excludes_self() {
        let hist = histogram(&[(0, 1.0), (1, 1.0), (2, 1.0), (3, 9.0)]);
        let baselines = hist.leave_one_out(&BTreeSet::new());

        let spike = baselines[&3].unwrap();
        assert_eq!(spike.samples, 3);
        assert!((spike.mean - 1.0).abs() < 1e-12);
        assert_eq!(spike.std_dev, 0.0);

        let normal = baselines[&0].unwrap();
        assert!((normal.mean - 11.0 / 3.0).abs() < 1e-12);
        assert!(normal.std_dev > 3.0);
    }

    #[test]
    fn test_leave_one_out_honours_exclusions() {
        let hist = histogram(&[(0, 1.0), (1, 2.0), (2, 9.0), (3, 9.0)]);
        let exclude: BTreeSet<i64> = [2, 3].into_iter().collect();
        let baselines = hist.leave_one_out(&exclude);

        let excluded = baselines[&2].unwrap();
        assert_eq!(excluded.samples, 2);
        assert!((excluded.mean - 1.5).abs() < 1e-12);

        let kept = baselines[&0].unwrap();
        assert_eq!(kept.samples, 1);
        assert!((kept.mean - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_single_window_has_no_baseline() {
        let hist = histogram(&[(7, 3.0)]);
        assert_eq!(hist.leave_one_out(&BTreeSet::new())[&7], None);
    }

    #[test]
    fn test_stats_excluding_matches_direct_computation() {
        let hist = histogram(&[(0, 2.0), (1, 4.0), (2, 4.0), (3, 4.0), (4, 5.0), (5, 5.0), (6, 7.0), (7, 9.0)]);
        let stats = hist.stats_excluding(&BTreeSet::new()).unwrap();

        assert!((stats.mean - 5.0).abs() < 1e-12);
        assert!((stats.std_dev - 2.0).abs() < 1e-12);
        assert!((stats.threshold(2.0) - 9.0).abs() < 1e-12);
    }
}
