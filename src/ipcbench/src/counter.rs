//! The timing probe.
//!
//! A [`Probe`] reads a free-running cycle counter immediately before and
//! after a primitive invocation. Both reads are surrounded by compiler fences
//! so that no code is moved across the measurement boundary. Whatever fixed
//! cost the probe has is measured by [`crate::calibrate`] and subtracted
//! later.
use core::sync::atomic::{compiler_fence, Ordering};
use serde::Deserialize;

/// A raw cycle counter reading or a difference of two readings.
///
/// Always stored in 64 bits. Values read from a narrower counter are masked
/// to [`CycleCounter::WIDTH`].
pub type TimingSample = u64;

/// The number of significant bits of a cycle counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterWidth {
    Bits32,
    Bits64,
}

impl CounterWidth {
    pub const fn bits(self) -> u32 {
        match self {
            Self::Bits32 => 32,
            Self::Bits64 => 64,
        }
    }

    /// The largest value representable by a counter of this width.
    pub const fn mask(self) -> TimingSample {
        match self {
            Self::Bits32 => u32::MAX as TimingSample,
            Self::Bits64 => u64::MAX,
        }
    }
}

/// A hardware event that can be assigned to an event counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterEvent {
    CacheL1dMiss,
    CacheL1iMiss,
    TlbDataMiss,
    BranchMispredict,
    InstructionsRetired,
}

/// A monotonic, free-running cycle counter provided by a port.
pub trait CycleCounter {
    /// The width of the values returned by [`Self::read_cycles`].
    const WIDTH: CounterWidth;

    /// The number of configurable event counters besides the cycle counter.
    fn num_event_counters(&self) -> usize;

    /// Assign `event` to the event counter `index`.
    fn set_count_event(&mut self, index: usize, event: CounterEvent) -> Result<(), ProbeError>;

    /// Start the event counters selected by the bit mask `mask`.
    fn start_counters(&mut self, mask: u32);

    /// Reset the event counters selected by the bit mask `mask`.
    fn reset_counters(&mut self, mask: u32);

    /// Read the cycle counter.
    fn read_cycles(&self) -> TimingSample;

    /// Read the cycle counter at the opening edge of a measurement. Ports
    /// override this when the target needs a serializing read sequence that
    /// differs between the two edges.
    #[inline(always)]
    fn read_cycles_before(&self) -> TimingSample {
        self.read_cycles()
    }

    /// Read the cycle counter at the closing edge of a measurement.
    #[inline(always)]
    fn read_cycles_after(&self) -> TimingSample {
        self.read_cycles()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("No supported cycle counter is available on this target.")]
    Unsupported,
    #[error("{requested} event counter(s) were requested, but only {available} are available.")]
    InsufficientCounters { requested: usize, available: usize },
    #[error("The event {0:?} cannot be counted on this target.")]
    UnsupportedEvent(CounterEvent),
}

/// Prevent the compiler from moving memory accesses across this point.
///
/// Placed around measured loops so that setup code is not scheduled into the
/// measured region.
#[inline(always)]
pub fn fence() {
    compiler_fence(Ordering::SeqCst);
}

/// An initialized timing probe.
#[derive(Debug, Clone)]
pub struct Probe<C> {
    counter: C,
    num_events: usize,
}

impl<C: CycleCounter> Probe<C> {
    /// Initialize the counter hardware and select `events` on the event
    /// counters, in order.
    ///
    /// This is the only place where event counters are configured. The
    /// returned probe can be cloned into every execution context of a run.
    pub fn init(mut counter: C, events: &[CounterEvent]) -> Result<Self, ProbeError> {
        // The counters are addressed by a 32-bit mask
        let available = counter.num_event_counters().min(u32::BITS as usize);
        if events.len() > available {
            return Err(ProbeError::InsufficientCounters {
                requested: events.len(),
                available,
            });
        }

        for (i, &event) in events.iter().enumerate() {
            counter.set_count_event(i, event)?;
        }

        if !events.is_empty() {
            let mask = u32::MAX >> (u32::BITS as usize - events.len());
            counter.start_counters(mask);
            counter.reset_counters(mask);
        }

        log::debug!("probe initialized with {} event counter(s)", events.len());

        Ok(Self {
            counter,
            num_events: events.len(),
        })
    }

    /// Take the opening timestamp of a measurement.
    #[inline(always)]
    pub fn sample_before(&self) -> TimingSample {
        fence();
        let sample = self.counter.read_cycles_before() & C::WIDTH.mask();
        fence();
        sample
    }

    /// Take the closing timestamp of a measurement.
    #[inline(always)]
    pub fn sample_after(&self) -> TimingSample {
        fence();
        let sample = self.counter.read_cycles_after() & C::WIDTH.mask();
        fence();
        sample
    }

    pub fn width(&self) -> CounterWidth {
        C::WIDTH
    }

    pub fn num_events(&self) -> usize {
        self.num_events
    }

    pub fn counter(&self) -> &C {
        &self.counter
    }
}
