//! The null system call benchmark.
//!
//! Measures a bare kernel entry and exit from the harness context. Each run
//! brackets a single invocation; the overhead is measured the same way with
//! the no-op stand-in.
use crate::{
    config::BenchConfig,
    counter::{CycleCounter, Probe, TimingSample},
    error::BenchError,
    kernel::{CPtr, Ipc, Message, Primitive},
    stats::{is_stable, raw_delta, reduce, RawSamples, Reduced},
};

/// The outcome of [`measure_null_syscall`].
#[derive(Debug, Clone, PartialEq)]
pub struct NullSyscallResult {
    /// The no-op samples.
    pub overhead_samples: RawSamples,
    pub overhead_stable: bool,
    /// The minimum of `overhead_samples`.
    pub overhead: TimingSample,
    pub result: Reduced,
}

pub fn measure_null_syscall<I: Ipc, C: CycleCounter>(
    ipc: &I,
    probe: &Probe<C>,
    config: &BenchConfig,
) -> Result<NullSyscallResult, BenchError> {
    let mut msg = Message::new(0);
    let width = probe.width();

    let overhead_samples: RawSamples = (0..config.runs)
        .map(|_| {
            let start = probe.sample_before();
            ipc.invoke_nop(Primitive::Null, CPtr::NULL, &mut msg);
            let end = probe.sample_after();
            raw_delta(start, end, config.delta_policy, width).cycles
        })
        .collect();

    let overhead_stable = is_stable(overhead_samples.as_slice());
    if !overhead_stable {
        log::warn!(
            "the overhead of the null system call is not stable: {:?}",
            overhead_samples.as_slice()
        );
    }
    let overhead = overhead_samples.as_slice().iter().copied().min().unwrap_or(0);

    let mut samples = RawSamples::new();
    for _ in 0..config.runs {
        let start = probe.sample_before();
        ipc.invoke(Primitive::Null, CPtr::NULL, &mut msg)?;
        let end = probe.sample_after();
        samples.push(raw_delta(start, end, config.delta_policy, width).cycles);
    }

    let result = reduce(samples, overhead);
    if !result.stable {
        log::warn!(
            "the null system call is not stable: {:?}",
            result.samples.as_slice()
        );
    }

    Ok(NullSyscallResult {
        overhead_samples,
        overhead_stable,
        overhead,
        result,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{counter::tests::SteppingCounter, kernel::Terminated};
    use std::cell::Cell;

    struct NullIpc<'a>(&'a Cell<u64>);

    impl Ipc for NullIpc<'_> {
        fn invoke(&self, primitive: Primitive, _: CPtr, _: &mut Message) -> Result<(), Terminated> {
            assert_eq!(primitive, Primitive::Null);
            self.0.set(self.0.get() + 50);
            Ok(())
        }

        fn invoke_nop(&self, primitive: Primitive, _: CPtr, _: &mut Message) {
            assert_eq!(primitive, Primitive::Null);
            self.0.set(self.0.get() + 8);
        }

        fn preempt_point(&self) -> Result<(), Terminated> {
            unreachable!()
        }
    }

    #[test]
    fn overhead_is_subtracted() {
        let probe = Probe::init(SteppingCounter::new(0, 1, 0), &[]).unwrap();
        let ipc = NullIpc(&probe.counter().now);
        let config = BenchConfig {
            runs: 4,
            ..BenchConfig::default()
        };

        let r = measure_null_syscall(&ipc, &probe, &config).unwrap();
        // Every read advances the counter by one
        assert_eq!(r.overhead_samples.as_slice(), &[9, 9, 9, 9]);
        assert!(r.overhead_stable);
        assert_eq!(r.overhead, 9);
        assert_eq!(r.result.samples.as_slice(), &[42, 42, 42, 42]);
        assert!(r.result.stable);
    }
}
