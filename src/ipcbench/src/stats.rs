//! Stability checking and reduction of raw samples.
//!
//! Samples move through two types: [`RawSamples`] as collected, and
//! [`CorrectedSamples`] after the overhead baseline has been subtracted.
//! The only way from the first to the second is [`RawSamples::correct`],
//! which consumes its input, so a baseline is subtracted exactly once.
use core::fmt;
use serde::Deserialize;

use crate::counter::{CounterWidth, TimingSample};

/// The percentiles reported by [`Summary`].
pub const PERCENTILES: [u32; 5] = [0, 10, 50, 90, 100];

/// Returns `true` if every sample from index 1 onward is identical.
///
/// The first sample is excluded because it routinely includes cold cache and
/// TLB effects.
pub fn is_stable(samples: &[TimingSample]) -> bool {
    match samples.get(1..) {
        Some(rest) => rest.windows(2).all(|w| w[0] == w[1]),
        None => true,
    }
}

/// How a pair of timestamps is turned into a duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaPolicy {
    /// The absolute difference of the two timestamps.
    #[default]
    Symmetric,
    /// `end - start` modulo the counter width. A counter that wrapped around
    /// during the measurement still yields the elapsed cycle count.
    Directed,
}

/// The result of [`raw_delta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawDelta {
    pub cycles: TimingSample,
    /// The end timestamp was smaller than the start timestamp.
    pub flipped: bool,
}

pub fn raw_delta(
    start: TimingSample,
    end: TimingSample,
    policy: DeltaPolicy,
    width: CounterWidth,
) -> RawDelta {
    let flipped = end < start;
    let cycles = match policy {
        DeltaPolicy::Symmetric => start.abs_diff(end),
        DeltaPolicy::Directed => end.wrapping_sub(start) & width.mask(),
    };
    RawDelta { cycles, flipped }
}

/// Samples as collected, before overhead subtraction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawSamples(Vec<TimingSample>);

impl RawSamples {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, sample: TimingSample) {
        self.0.push(sample);
    }

    pub fn as_slice(&self) -> &[TimingSample] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Subtract `overhead` from every sample. Samples smaller than the
    /// overhead become zero and are counted in
    /// [`CorrectedSamples::num_clamped`].
    pub fn correct(self, overhead: TimingSample) -> CorrectedSamples {
        let mut samples = self.0;
        let mut num_clamped = 0;
        for x in samples.iter_mut() {
            if *x < overhead {
                num_clamped += 1;
            }
            *x = x.saturating_sub(overhead);
        }
        if num_clamped > 0 {
            log::debug!(
                "{num_clamped} sample(s) were smaller than the overhead baseline {overhead}"
            );
        }
        CorrectedSamples {
            samples,
            num_clamped,
        }
    }
}

impl From<Vec<TimingSample>> for RawSamples {
    fn from(x: Vec<TimingSample>) -> Self {
        Self(x)
    }
}

impl FromIterator<TimingSample> for RawSamples {
    fn from_iter<I: IntoIterator<Item = TimingSample>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Samples with the overhead baseline subtracted. Can only be obtained from
/// [`RawSamples::correct`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrectedSamples {
    samples: Vec<TimingSample>,
    num_clamped: usize,
}

impl CorrectedSamples {
    pub fn as_slice(&self) -> &[TimingSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The number of samples that were smaller than the subtracted overhead
    /// and were clamped to zero.
    pub fn num_clamped(&self) -> usize {
        self.num_clamped
    }
}

/// Summary statistics of a corrected sample set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub num_samples: usize,
    pub min: TimingSample,
    pub max: TimingSample,
    pub mean: f64,
    /// The sample variance (divided by `n - 1`). Zero for a single sample.
    pub variance: f64,
    pub stddev: f64,
    /// `stddev / mean × 100`. Zero if the mean is zero.
    pub stddev_pc: f64,
    /// The samples at [`PERCENTILES`].
    pub percentiles: [TimingSample; 5],
}

impl Summary {
    /// Compute the summary of `samples`. Returns `None` if `samples` is
    /// empty.
    pub fn of(samples: &CorrectedSamples) -> Option<Self> {
        let samples = samples.as_slice();
        let n = samples.len();
        if n == 0 {
            return None;
        }

        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        let min = sorted[0];
        let max = sorted[n - 1];

        // Extract percentiles
        let percentiles = PERCENTILES.map(|p| sorted[(n - 1) * p as usize / 100]);

        let sum: u128 = samples.iter().map(|&x| x as u128).sum();
        let mean = sum as f64 / n as f64;

        let variance = if n > 1 {
            let sq_sum: f64 = samples
                .iter()
                .map(|&x| {
                    let d = x as f64 - mean;
                    d * d
                })
                .sum();
            sq_sum / (n - 1) as f64
        } else {
            0.0
        };
        let stddev = variance.sqrt();
        let stddev_pc = if mean == 0.0 {
            0.0
        } else {
            stddev / mean * 100.0
        };

        Some(Self {
            num_samples: n,
            min,
            max,
            mean,
            variance,
            stddev,
            stddev_pc,
            percentiles,
        })
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "min = {}, max = {}, mean = {:.2}, variance = {:.2}, stddev = {:.2} ({:.2}%)",
            self.min, self.max, self.mean, self.variance, self.stddev, self.stddev_pc
        )
    }
}

/// The outcome of [`reduce`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reduced {
    pub samples: CorrectedSamples,
    /// `None` if there were no samples.
    pub summary: Option<Summary>,
    /// Whether the samples were stable before overhead subtraction.
    pub stable: bool,
}

/// Subtract `overhead` from `samples` and compute their statistics.
///
/// Stability is judged on the raw samples. Clamping can make distinct raw
/// samples equal after subtraction.
pub fn reduce(samples: RawSamples, overhead: TimingSample) -> Reduced {
    let stable = is_stable(samples.as_slice());
    let samples = samples.correct(overhead);
    let summary = Summary::of(&samples);
    Reduced {
        samples,
        summary,
        stable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn approx_eq(x: f64, y: f64) -> bool {
        (x - y).abs() < 1e-9 * y.abs().max(1.0)
    }

    #[test]
    fn stability_ignores_first_sample() {
        assert!(is_stable(&[]));
        assert!(is_stable(&[5]));
        assert!(is_stable(&[100, 7]));
        assert!(is_stable(&[100, 7, 7, 7]));
        assert!(!is_stable(&[7, 7, 8, 7]));
        assert!(!is_stable(&[7, 7, 7, 8]));
    }

    #[test]
    fn reduce_worked_example() {
        let reduced = reduce(vec![100, 50, 50, 50].into(), 10);
        assert_eq!(reduced.samples.as_slice(), &[90, 40, 40, 40]);
        assert!(reduced.stable);

        let summary = reduced.summary.unwrap();
        assert_eq!(summary.num_samples, 4);
        assert_eq!(summary.min, 40);
        assert_eq!(summary.max, 90);
        assert!(approx_eq(summary.mean, 52.5));
        assert!(approx_eq(summary.variance, 625.0));
        assert!(approx_eq(summary.stddev, 25.0));
        assert!(approx_eq(summary.stddev_pc, 25.0 / 52.5 * 100.0));
        assert_eq!(summary.percentiles, [40, 40, 40, 40, 90]);
    }

    #[test]
    fn empty_and_single() {
        assert_eq!(reduce(RawSamples::new(), 10).summary, None);

        let summary = reduce(vec![30].into(), 10).summary.unwrap();
        assert_eq!((summary.min, summary.max), (20, 20));
        assert_eq!(summary.variance, 0.0);
    }

    #[test]
    fn samples_below_overhead_saturate() {
        let corrected = RawSamples::from(vec![5, 20]).correct(10);
        assert_eq!(corrected.as_slice(), &[0, 10]);
        assert_eq!(corrected.num_clamped(), 1);

        assert_eq!(RawSamples::from(vec![10, 20]).correct(10).num_clamped(), 0);

        // A zero mean does not divide by zero
        let summary = reduce(vec![3, 3].into(), 10).summary.unwrap();
        assert_eq!(summary.stddev_pc, 0.0);
    }

    #[test]
    fn clamping_does_not_hide_instability() {
        let reduced = reduce(vec![100, 5, 8, 3].into(), 10);
        assert_eq!(reduced.samples.as_slice(), &[90, 0, 0, 0]);
        assert_eq!(reduced.samples.num_clamped(), 3);
        assert!(!reduced.stable);

        let reduced = reduce(vec![100, 5, 5, 5].into(), 10);
        assert!(reduced.stable);
    }

    #[test]
    fn percentiles_of_41_samples() {
        let samples: RawSamples = (0..41).rev().collect();
        let summary = reduce(samples, 0).summary.unwrap();
        assert_eq!(summary.percentiles, [0, 4, 20, 36, 40]);
    }

    #[test]
    fn symmetric_delta() {
        let w = CounterWidth::Bits64;
        assert_eq!(
            raw_delta(10, 25, DeltaPolicy::Symmetric, w),
            RawDelta {
                cycles: 15,
                flipped: false
            }
        );
        assert_eq!(
            raw_delta(25, 10, DeltaPolicy::Symmetric, w),
            RawDelta {
                cycles: 15,
                flipped: true
            }
        );
    }

    #[test]
    fn directed_delta_wraps_at_counter_width() {
        assert_eq!(
            raw_delta(0xffff_fff0, 0x10, DeltaPolicy::Directed, CounterWidth::Bits32),
            RawDelta {
                cycles: 0x20,
                flipped: true
            }
        );
        assert_eq!(
            raw_delta(0x10, 0x30, DeltaPolicy::Directed, CounterWidth::Bits32).cycles,
            0x20
        );
    }

    #[quickcheck]
    fn all_equal_has_no_deviation(x: u32, n: u8) -> bool {
        let n = n as usize % 32 + 1;
        let summary = reduce(vec![x as u64; n].into(), 0).summary.unwrap();
        summary.variance == 0.0 && summary.stddev_pc == 0.0 && summary.min == summary.max
    }

    #[quickcheck]
    fn summary_is_pure(samples: Vec<u32>, overhead: u16) -> bool {
        let raw: RawSamples = samples.into_iter().map(u64::from).collect();
        let corrected = raw.correct(overhead as u64);
        Summary::of(&corrected) == Summary::of(&corrected)
    }

    #[quickcheck]
    fn mean_is_bounded(samples: Vec<u32>) -> bool {
        let raw: RawSamples = samples.into_iter().map(u64::from).collect();
        match reduce(raw, 0).summary {
            Some(s) => s.min as f64 <= s.mean && s.mean <= s.max as f64,
            None => true,
        }
    }
}
