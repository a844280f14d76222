//! The host cycle counter.
use ipcbench::{
    counter::{CounterEvent, CounterWidth, CycleCounter, ProbeError},
    TimingSample,
};

/// The time-stamp counter on x86_64 hosts, nanoseconds since construction
/// elsewhere. Has no event counters.
#[derive(Debug, Clone, Copy)]
pub struct TscCounter {
    #[cfg(not(target_arch = "x86_64"))]
    origin: std::time::Instant,
}

impl TscCounter {
    pub fn new() -> Self {
        Self {
            #[cfg(not(target_arch = "x86_64"))]
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for TscCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleCounter for TscCounter {
    const WIDTH: CounterWidth = CounterWidth::Bits64;

    fn num_event_counters(&self) -> usize {
        0
    }

    fn set_count_event(&mut self, _index: usize, event: CounterEvent) -> Result<(), ProbeError> {
        Err(ProbeError::UnsupportedEvent(event))
    }

    fn start_counters(&mut self, _mask: u32) {}

    fn reset_counters(&mut self, _mask: u32) {}

    #[cfg(target_arch = "x86_64")]
    #[inline(always)]
    fn read_cycles(&self) -> TimingSample {
        // Safety: `rdtsc` is available on every x86_64 processor
        unsafe { core::arch::x86_64::_rdtsc() }
    }

    /// Wait for preceding instructions to complete before reading the
    /// counter.
    #[cfg(target_arch = "x86_64")]
    #[inline(always)]
    fn read_cycles_before(&self) -> TimingSample {
        use core::arch::x86_64::{_mm_lfence, _rdtsc};
        // Safety: `lfence` and `rdtsc` are available on every x86_64
        // processor
        unsafe {
            _mm_lfence();
            let x = _rdtsc();
            _mm_lfence();
            x
        }
    }

    /// `rdtscp` waits for the measured code to complete; the trailing
    /// `lfence` keeps later code from starting early.
    #[cfg(target_arch = "x86_64")]
    #[inline(always)]
    fn read_cycles_after(&self) -> TimingSample {
        use core::arch::x86_64::{__rdtscp, _mm_lfence};
        let mut aux = 0;
        // Safety: `rdtscp` is available on every x86_64 processor we run
        // benchmarks on
        unsafe {
            let x = __rdtscp(&mut aux);
            _mm_lfence();
            x
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn read_cycles(&self) -> TimingSample {
        self.origin.elapsed().as_nanos() as TimingSample
    }
}
