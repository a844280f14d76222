//! Measures the cost of the timing probe itself.
//!
//! Each overhead benchmark brackets the no-op stand-in of one primitive
//! ([`Ipc::invoke_nop`]) with the probe, exactly as the scenarios bracket the
//! real invocation. The minimum of a stable sample set is the baseline
//! subtracted from the scenarios of the corresponding [`OverheadClass`].
use core::fmt;
use serde::Deserialize;

use crate::{
    config::BenchConfig,
    counter::{fence, CycleCounter, Probe, TimingSample},
    kernel::{CPtr, Ipc, Message, Primitive},
    stats::{is_stable, raw_delta, RawSamples},
};

/// A no-op stand-in benchmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverheadBenchmark {
    Call,
    ReplyRecv,
    Send,
    Recv,
    /// [`Self::Call`] with a long message.
    CallLong,
    /// [`Self::ReplyRecv`] with a long message.
    ReplyRecvLong,
    Signal,
}

impl OverheadBenchmark {
    pub const ALL: [Self; 7] = [
        Self::Call,
        Self::ReplyRecv,
        Self::Send,
        Self::Recv,
        Self::CallLong,
        Self::ReplyRecvLong,
        Self::Signal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::ReplyRecv => "reply+recv",
            Self::Send => "send",
            Self::Recv => "recv",
            Self::CallLong => "call (long)",
            Self::ReplyRecvLong => "reply+recv (long)",
            Self::Signal => "signal",
        }
    }

    pub fn primitive(self) -> Primitive {
        match self {
            Self::Call | Self::CallLong => Primitive::Call,
            Self::ReplyRecv | Self::ReplyRecvLong => Primitive::ReplyRecv,
            Self::Send => Primitive::Send,
            Self::Recv => Primitive::Recv,
            Self::Signal => Primitive::Signal,
        }
    }

    /// The message length used by this benchmark.
    pub fn length(self, long_length: usize) -> usize {
        match self {
            Self::CallLong | Self::ReplyRecvLong => long_length,
            _ => 0,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for OverheadBenchmark {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A group of overhead benchmarks whose minimum is subtracted from the
/// scenarios of the class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverheadClass {
    CallReplyRecv,
    CallReplyRecv10,
    SendRecv,
    Signal,
}

impl OverheadClass {
    pub const ALL: [Self; 4] = [
        Self::CallReplyRecv,
        Self::CallReplyRecv10,
        Self::SendRecv,
        Self::Signal,
    ];

    pub fn benchmarks(self) -> &'static [OverheadBenchmark] {
        use OverheadBenchmark::*;
        match self {
            Self::CallReplyRecv => &[Call, ReplyRecv],
            Self::CallReplyRecv10 => &[CallLong, ReplyRecvLong],
            Self::SendRecv => &[Send, Recv],
            Self::Signal => &[Signal],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CallReplyRecv => "call+reply/recv",
            Self::CallReplyRecv10 => "call+reply/recv (long)",
            Self::SendRecv => "send+recv",
            Self::Signal => "signal",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for OverheadClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when an overhead measurement does not stabilize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverheadPolicy {
    /// Abort the run.
    #[default]
    Strict,
    /// Log a warning and use the unstable samples anyway. For platforms
    /// whose timing source is not cycle-exact.
    Tolerant,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CalibrationError {
    #[error(
        "Could not obtain a stable overhead measurement for '{benchmark}' \
        after {attempts} attempt(s). Last samples: {samples:?}"
    )]
    Unstable {
        benchmark: OverheadBenchmark,
        attempts: u32,
        samples: Vec<TimingSample>,
    },
}

/// The samples collected for one overhead benchmark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverheadSamples {
    pub benchmark: OverheadBenchmark,
    pub samples: RawSamples,
    pub stable: bool,
    /// The number of attempts it took to obtain `samples`.
    pub attempts: u32,
}

/// Per-benchmark and per-class baselines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Baselines {
    per_benchmark: [TimingSample; 7],
    per_class: [TimingSample; 4],
}

impl Baselines {
    /// Derive the per-class baselines from per-benchmark ones.
    pub fn from_benchmarks(per_benchmark: [TimingSample; 7]) -> Self {
        let per_class = OverheadClass::ALL.map(|class| {
            class
                .benchmarks()
                .iter()
                .map(|b| per_benchmark[b.index()])
                .min()
                .unwrap_or(0)
        });
        Self {
            per_benchmark,
            per_class,
        }
    }

    pub fn benchmark(&self, benchmark: OverheadBenchmark) -> TimingSample {
        self.per_benchmark[benchmark.index()]
    }

    pub fn class(&self, class: OverheadClass) -> TimingSample {
        self.per_class[class.index()]
    }
}

/// The outcome of [`calibrate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Calibration {
    pub samples: Vec<OverheadSamples>,
    pub baselines: Baselines,
}

/// Measure the baseline of every overhead benchmark.
///
/// `cap` is passed to the no-op invocations and is never actually used by
/// them.
pub fn calibrate<I: Ipc, C: CycleCounter>(
    ipc: &I,
    probe: &Probe<C>,
    cap: CPtr,
    config: &BenchConfig,
) -> Result<Calibration, CalibrationError> {
    let mut samples = Vec::with_capacity(OverheadBenchmark::ALL.len());
    let mut per_benchmark = [0; 7];

    for benchmark in OverheadBenchmark::ALL {
        log::debug!("measuring the overhead of {benchmark}");
        let measured = measure_until_stable(benchmark, config, || {
            measure_once(ipc, probe, benchmark, cap, config)
        })?;
        per_benchmark[benchmark.index()] =
            measured.samples.as_slice().iter().copied().min().unwrap_or(0);
        samples.push(measured);
    }

    let baselines = Baselines::from_benchmarks(per_benchmark);
    for class in OverheadClass::ALL {
        log::debug!("overhead baseline of {class}: {}", baselines.class(class));
    }

    Ok(Calibration { samples, baselines })
}

/// Collect `config.runs` samples from `measure`, retrying up to
/// `config.overhead_retries` times until they are stable.
pub(crate) fn measure_until_stable(
    benchmark: OverheadBenchmark,
    config: &BenchConfig,
    mut measure: impl FnMut() -> TimingSample,
) -> Result<OverheadSamples, CalibrationError> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let samples: RawSamples = (0..config.runs).map(|_| measure()).collect();

        if is_stable(samples.as_slice()) {
            return Ok(OverheadSamples {
                benchmark,
                samples,
                stable: true,
                attempts,
            });
        }

        log::warn!(
            "the overhead of {benchmark} is not stable (attempt {attempts}/{}): {:?}",
            config.overhead_retries,
            samples.as_slice(),
        );

        if attempts >= config.overhead_retries {
            return match config.overhead_policy {
                OverheadPolicy::Strict => Err(CalibrationError::Unstable {
                    benchmark,
                    attempts,
                    samples: samples.as_slice().to_vec(),
                }),
                OverheadPolicy::Tolerant => {
                    log::warn!("proceeding with an unstable overhead baseline for {benchmark}");
                    Ok(OverheadSamples {
                        benchmark,
                        samples,
                        stable: false,
                        attempts,
                    })
                }
            };
        }
    }
}

/// Run the no-op stand-in `config.warmups` times and return the duration of
/// the last iteration.
fn measure_once<I: Ipc, C: CycleCounter>(
    ipc: &I,
    probe: &Probe<C>,
    benchmark: OverheadBenchmark,
    cap: CPtr,
    config: &BenchConfig,
) -> TimingSample {
    let primitive = benchmark.primitive();
    let mut msg = Message::with_length(0, benchmark.length(config.long_message_length));
    let (mut start, mut end): (TimingSample, TimingSample) = (0, 0);

    fence();
    for _ in 0..config.warmups {
        start = probe.sample_before();
        ipc.invoke_nop(primitive, cap, &mut msg);
        end = probe.sample_after();
    }
    fence();

    raw_delta(start, end, config.delta_policy, probe.width()).cycles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{counter::tests::SteppingCounter, kernel::Terminated};
    use assert_matches::assert_matches;
    use std::cell::Cell;

    /// Advances the probe's counter by a scripted amount on every no-op.
    struct NopIpc<'a> {
        counter: &'a Cell<u64>,
        cost: Box<dyn Fn(Primitive, usize) -> u64 + 'a>,
    }

    impl Ipc for NopIpc<'_> {
        fn invoke(&self, _: Primitive, _: CPtr, _: &mut Message) -> Result<(), Terminated> {
            unreachable!()
        }

        fn invoke_nop(&self, primitive: Primitive, _: CPtr, msg: &mut Message) {
            self.counter
                .set(self.counter.get() + (self.cost)(primitive, msg.len()));
        }

        fn preempt_point(&self) -> Result<(), Terminated> {
            unreachable!()
        }
    }

    fn config() -> BenchConfig {
        BenchConfig {
            runs: 8,
            warmups: 4,
            ..BenchConfig::default()
        }
    }

    #[test]
    fn class_baselines_are_minimums() {
        let probe = Probe::init(SteppingCounter::new(0, 0, 0), &[]).unwrap();
        let ipc = NopIpc {
            counter: &probe.counter().now,
            cost: Box::new(|primitive, len| {
                let base = match primitive {
                    Primitive::Call => 30,
                    Primitive::ReplyRecv => 20,
                    Primitive::Send => 5,
                    Primitive::Recv => 7,
                    Primitive::Signal => 3,
                    _ => unreachable!(),
                };
                base + len as u64
            }),
        };

        let calibration = calibrate(&ipc, &probe, CPtr(1), &config()).unwrap();
        let b = calibration.baselines;
        assert_eq!(b.benchmark(OverheadBenchmark::Call), 30);
        assert_eq!(b.benchmark(OverheadBenchmark::CallLong), 40);
        assert_eq!(b.class(OverheadClass::CallReplyRecv), 20);
        assert_eq!(b.class(OverheadClass::CallReplyRecv10), 30);
        assert_eq!(b.class(OverheadClass::SendRecv), 5);
        assert_eq!(b.class(OverheadClass::Signal), 3);
        assert!(calibration.samples.iter().all(|s| s.stable && s.attempts == 1));
    }

    #[test]
    fn first_sample_may_differ() {
        let costs = [100, 9, 9, 9, 9, 9, 9, 9];
        let mut i = 0;
        let s = measure_until_stable(OverheadBenchmark::Send, &config(), || {
            i += 1;
            costs[i - 1]
        })
        .unwrap();
        assert!(s.stable);
        assert_eq!(s.attempts, 1);
    }

    #[test]
    fn retries_until_stable() {
        let mut calls = 0;
        let s = measure_until_stable(OverheadBenchmark::Send, &config(), || {
            calls += 1;
            // Unstable during the first attempt only
            if calls <= 8 {
                calls
            } else {
                12
            }
        })
        .unwrap();
        assert!(s.stable);
        assert_eq!(s.attempts, 2);
    }

    #[test]
    fn strict_policy_aborts() {
        let mut x = 0;
        assert_matches!(
            measure_until_stable(OverheadBenchmark::Recv, &config(), || {
                x += 1;
                x
            }),
            Err(CalibrationError::Unstable {
                benchmark: OverheadBenchmark::Recv,
                attempts: 4,
                ..
            })
        );
    }

    #[test]
    fn tolerant_policy_proceeds() {
        let config = BenchConfig {
            overhead_policy: OverheadPolicy::Tolerant,
            overhead_retries: 2,
            ..config()
        };
        let mut x = 0;
        let s = measure_until_stable(OverheadBenchmark::Recv, &config, || {
            x += 1;
            x
        })
        .unwrap();
        assert!(!s.stable);
        assert_eq!(s.attempts, 2);
        assert_eq!(s.samples.as_slice(), &[9, 10, 11, 12, 13, 14, 15, 16]);
    }
}
