//! Writes results to the log.
use ipcbench::{
    harness::{Anomaly, ScenarioResult},
    stats::Summary,
    ResultReporter, ResultSet, TimingSample,
};
use itertools::Itertools;
use std::fmt;

/// A [`ResultReporter`] that writes every result to the log.
#[derive(Debug, Default)]
pub struct LogReporter {
    /// Also log the corrected samples of every scenario.
    pub verbose: bool,
}

impl ResultReporter for LogReporter {
    fn report(&mut self, results: &ResultSet) {
        log::info!("Overhead baselines [cycles]:");
        for overhead in results.calibration.samples.iter() {
            log::info!(
                "  {:16} {:6}{}",
                overhead.benchmark.as_str(),
                results.calibration.baselines.benchmark(overhead.benchmark),
                if overhead.stable {
                    String::new()
                } else {
                    format!(" (unstable after {} attempt(s))", overhead.attempts)
                },
            );
        }

        if let Some(null_syscall) = &results.null_syscall {
            log::info!("Null system call (overhead = {}):", null_syscall.overhead);
            match &null_syscall.result.summary {
                Some(summary) => log_summary(summary),
                None => log::warn!("  no samples"),
            }
        }

        for result in results.scenarios.iter() {
            self.report_scenario(result);
        }

        let unstable = results.unstable().map(|s| &s.descriptor.name).collect::<Vec<_>>();
        if !unstable.is_empty() {
            log::warn!(
                "{} scenario(s) were not stable: {}",
                unstable.len(),
                unstable.iter().format(", ")
            );
        }
    }
}

impl LogReporter {
    fn report_scenario(&self, result: &ScenarioResult) {
        let Some(summary) = &result.summary else {
            log::warn!("{}... no samples", result.descriptor.name);
            return;
        };

        log::warn!(
            "{}... mean = {:.2}, med = {} [cycles]",
            result.descriptor.name,
            summary.mean,
            summary.percentiles[2],
        );
        log::info!("  ({})", result.descriptor);
        log_summary(summary);

        if !result.stable {
            log::warn!(
                "  not stable; samples after subtracting {}: [{}]",
                result.overhead,
                result.samples.as_slice().iter().format(", ")
            );
        } else if self.verbose {
            log::info!(
                "  samples after subtracting {}: [{}]",
                result.overhead,
                result.samples.as_slice().iter().format(", ")
            );
        }

        for anomaly in result.anomalies.iter() {
            match anomaly {
                Anomaly::SignFlip { run, start, end } => {
                    log::warn!("  run {run}: end {end} precedes start {start}")
                }
                Anomaly::BelowOverhead { count } => {
                    log::warn!("  {count} sample(s) were clamped to zero")
                }
            }
        }
    }
}

fn log_summary(summary: &Summary) {
    log::info!("  {summary}");
    log::info!(
        "  (0/10/50/90/100th percentiles: {})",
        Percentiles(&summary.percentiles)
    );
}

/// Formats percentiles in the form `p0 ─ p10 ═ p50 ═ p90 ─ p100`.
struct Percentiles<'a>(&'a [TimingSample; 5]);

impl fmt::Display for Percentiles<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let [p0, p10, p50, p90, p100] = self.0;
        write!(f, "{p0} ─ {p10} ═ {p50} ═ {p90} ─ {p100}")
    }
}
