//! Run parameters.
use serde::Deserialize;

use crate::{
    calibrate::OverheadPolicy, channel::WordWidth, counter::CounterEvent, kernel::MSG_MAX_LENGTH,
    stats::DeltaPolicy,
};

/// The parameters of a benchmark run.
///
/// Every field has a default, so a configuration file only needs to name
/// the fields it changes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BenchConfig {
    /// The number of repetitions of every scenario and overhead benchmark.
    pub runs: usize,
    /// The number of iterations in one repetition. Only the last iteration
    /// is sampled.
    pub warmups: u32,
    /// The number of attempts at obtaining a stable overhead measurement.
    pub overhead_retries: u32,
    pub overhead_policy: OverheadPolicy,
    pub delta_policy: DeltaPolicy,
    /// Scenarios in which an end timestamp smaller than the start timestamp
    /// is not reported as an anomaly.
    pub expected_sign_flips: Vec<String>,
    /// Hardware events selected on the event counters.
    pub counter_events: Vec<CounterEvent>,
    pub word_width: WordWidth,
    /// The message length of long-message scenarios.
    pub long_message_length: usize,
    /// The time-slice of the scheduling budget given to every context.
    pub timeslice_us: u64,
    /// Also measure the null system call.
    pub null_syscall: bool,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            runs: 16,
            warmups: 16,
            overhead_retries: 4,
            overhead_policy: OverheadPolicy::Strict,
            delta_policy: DeltaPolicy::Symmetric,
            expected_sign_flips: Vec::new(),
            counter_events: Vec::new(),
            word_width: WordWidth::NATIVE,
            long_message_length: 10,
            timeslice_us: 1000,
            null_syscall: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("At least two runs are required to judge stability, but {0} was requested.")]
    TooFewRuns(usize),
    #[error("The number of warmup iterations must be nonzero.")]
    NoWarmups,
    #[error("The number of overhead measurement attempts must be nonzero.")]
    NoRetries,
    #[error("A long message of {length} words does not fit in {max} message registers.")]
    MessageTooLong { length: usize, max: usize },
    #[error("The scheduling time-slice must be nonzero.")]
    NoTimeslice,
}

impl BenchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runs < 2 {
            return Err(ConfigError::TooFewRuns(self.runs));
        }
        if self.warmups == 0 {
            return Err(ConfigError::NoWarmups);
        }
        if self.overhead_retries == 0 {
            return Err(ConfigError::NoRetries);
        }
        if self.long_message_length > MSG_MAX_LENGTH {
            return Err(ConfigError::MessageTooLong {
                length: self.long_message_length,
                max: MSG_MAX_LENGTH,
            });
        }
        if self.timeslice_us == 0 {
            return Err(ConfigError::NoTimeslice);
        }
        Ok(())
    }

    /// Returns `true` if a sign flip in `scenario` is expected.
    pub fn expects_sign_flip(&self, scenario: &str) -> bool {
        self.expected_sign_flips.iter().any(|x| x == scenario)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn default_is_valid() {
        BenchConfig::default().validate().unwrap();
    }

    #[test]
    fn invalid() {
        let base = BenchConfig::default();
        assert_matches!(
            BenchConfig {
                runs: 1,
                ..base.clone()
            }
            .validate(),
            Err(ConfigError::TooFewRuns(1))
        );
        assert_matches!(
            BenchConfig {
                warmups: 0,
                ..base.clone()
            }
            .validate(),
            Err(ConfigError::NoWarmups)
        );
        assert_matches!(
            BenchConfig {
                overhead_retries: 0,
                ..base.clone()
            }
            .validate(),
            Err(ConfigError::NoRetries)
        );
        assert_matches!(
            BenchConfig {
                long_message_length: MSG_MAX_LENGTH + 1,
                ..base.clone()
            }
            .validate(),
            Err(ConfigError::MessageTooLong { .. })
        );
        assert_matches!(
            BenchConfig {
                timeslice_us: 0,
                ..base
            }
            .validate(),
            Err(ConfigError::NoTimeslice)
        );
    }

    #[test]
    fn sign_flip_allow_list() {
        let config = BenchConfig {
            expected_sign_flips: vec!["Inter-AS Send".to_owned()],
            ..BenchConfig::default()
        };
        assert!(config.expects_sign_flip("Inter-AS Send"));
        assert!(!config.expects_sign_flip("Inter-AS Call"));
    }
}
