//! Runs a matrix of scenarios on a port.
use crate::{
    calibrate::{calibrate, Calibration},
    config::BenchConfig,
    counter::{Probe, TimingSample},
    error::BenchError,
    hardware::{measure_null_syscall, NullSyscallResult},
    matrix::{Matrix, ScenarioDescriptor},
    orchestrator::{Orchestrator, SetupError, SharedObjects},
    port::Port,
    stats::{raw_delta, reduce, CorrectedSamples, RawSamples, Summary},
};

/// An irregularity observed while measuring a scenario. Anomalies do not
/// invalidate a result; they are reported alongside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anomaly {
    /// The end timestamp of run `run` was smaller than its start timestamp.
    SignFlip {
        run: usize,
        start: TimingSample,
        end: TimingSample,
    },
    /// `count` samples were smaller than the overhead baseline and were
    /// clamped to zero.
    BelowOverhead { count: usize },
}

/// The result of one scenario.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioResult {
    pub descriptor: ScenarioDescriptor,
    /// The samples before overhead subtraction.
    pub raw: RawSamples,
    pub samples: CorrectedSamples,
    /// `None` if no samples were collected.
    pub summary: Option<Summary>,
    pub stable: bool,
    /// The overhead baseline subtracted from `raw`.
    pub overhead: TimingSample,
    pub anomalies: Vec<Anomaly>,
}

/// The results of a whole run.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    pub scenarios: Vec<ScenarioResult>,
    pub calibration: Calibration,
    pub null_syscall: Option<NullSyscallResult>,
}

impl ResultSet {
    pub fn get(&self, name: &str) -> Option<&ScenarioResult> {
        self.scenarios.iter().find(|s| s.descriptor.name == name)
    }

    /// Iterate over the scenarios whose samples were not stable.
    pub fn unstable(&self) -> impl Iterator<Item = &ScenarioResult> + '_ {
        self.scenarios.iter().filter(|s| !s.stable)
    }
}

/// Consumes a finished [`ResultSet`].
pub trait ResultReporter {
    fn report(&mut self, results: &ResultSet);
}

impl<T: ResultReporter + ?Sized> ResultReporter for &mut T {
    fn report(&mut self, results: &ResultSet) {
        (**self).report(results)
    }
}

/// The benchmark harness.
#[derive(Debug)]
pub struct Harness<P> {
    port: P,
    config: BenchConfig,
}

impl<P: Port> Harness<P> {
    pub fn new(port: P, config: BenchConfig) -> Self {
        Self { port, config }
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn into_port(self) -> P {
        self.port
    }

    /// Calibrate, then measure every scenario of `matrix` `config.runs`
    /// times, then reduce the samples.
    pub fn run(&mut self, matrix: &Matrix) -> Result<ResultSet, BenchError> {
        let config = &self.config;
        config.validate()?;
        log::debug!("configuration: {config:?}");

        let probe = Probe::init(self.port.counter()?, &config.counter_events)?;

        let objects = SharedObjects {
            ep: self.port.alloc_endpoint().map_err(SetupError::Alloc)?,
            result_ep: self.port.alloc_endpoint().map_err(SetupError::Alloc)?,
            ntfn: self.port.alloc_notification().map_err(SetupError::Alloc)?,
        };
        log::trace!("shared objects: {objects:?}");

        log::info!("calibrating the instrumentation overhead");
        let calibration = calibrate(self.port.ipc(), &probe, objects.ep, config)?;

        let null_syscall = if config.null_syscall {
            log::info!("measuring the null system call");
            Some(measure_null_syscall(self.port.ipc(), &probe, config)?)
        } else {
            None
        };

        let mut raw = vec![RawSamples::new(); matrix.len()];
        let mut anomalies = vec![Vec::new(); matrix.len()];

        for run in 0..config.runs {
            log::info!("run {}/{}", run + 1, config.runs);

            for (i, scenario) in matrix.iter().enumerate() {
                log::trace!("{scenario}");
                let sample =
                    Orchestrator::new(&mut self.port, scenario, objects, &probe, config).run()?;

                let (start, end) = sample.start_end(scenario.direction);
                let delta = raw_delta(start, end, config.delta_policy, probe.width());
                if delta.flipped && !config.expects_sign_flip(&scenario.name) {
                    log::warn!(
                        "{}: the end timestamp {end} precedes the start timestamp {start} \
                         in run {run}",
                        scenario.name
                    );
                    anomalies[i].push(Anomaly::SignFlip { run, start, end });
                }
                raw[i].push(delta.cycles);
            }
        }

        let scenarios = matrix
            .iter()
            .zip(raw)
            .zip(anomalies)
            .map(|((descriptor, raw), mut anomalies)| {
                let overhead = calibration.baselines.class(descriptor.overhead);
                let reduced = reduce(raw.clone(), overhead);
                let count = reduced.samples.num_clamped();
                if count > 0 {
                    log::warn!(
                        "{}: {count} sample(s) are smaller than the overhead {overhead}",
                        descriptor.name
                    );
                    anomalies.push(Anomaly::BelowOverhead { count });
                }
                if !reduced.stable {
                    log::warn!(
                        "{} is not stable: {:?}",
                        descriptor.name,
                        reduced.samples.as_slice()
                    );
                }
                ScenarioResult {
                    descriptor: descriptor.clone(),
                    raw,
                    samples: reduced.samples,
                    summary: reduced.summary,
                    stable: reduced.stable,
                    overhead,
                    anomalies,
                }
            })
            .collect();

        Ok(ResultSet {
            scenarios,
            calibration,
            null_syscall,
        })
    }
}
