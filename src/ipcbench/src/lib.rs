//! Measurement and orchestration engine for microkernel IPC latency
//! benchmarks.
//!
//! The engine measures the latency of a kernel's synchronous call/reply,
//! asynchronous signal, and raw send/receive primitives under a fixed matrix
//! of scenarios (shared or separate address spaces, equal or unequal
//! priorities, short or long messages, with or without scheduling budget
//! donation). It is split into the following layers:
//!
//!  - [`counter`]: the timing probe bracketing each primitive invocation.
//!  - [`calibrate`]: measures and validates the cost of the probe itself.
//!  - [`channel`]: the wire format used by benchmark contexts to report a
//!    sample back to the harness.
//!  - [`orchestrator`]: constructs, sequences, and tears down the execution
//!    contexts of one scenario.
//!  - [`matrix`]: the scenario table.
//!  - [`stats`]: stability checking and reduction of raw samples.
//!  - [`harness`]: ties the above together into a full run.
//!
//! The kernel itself is reached through two traits: [`kernel::Ipc`], which
//! benchmark contexts use to invoke primitives, and [`port::Port`], which the
//! harness uses to manage execution contexts. A port implements both for a
//! particular kernel and target.
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_debug_implementations)]

pub mod calibrate;
pub mod channel;
pub mod config;
pub mod counter;
pub mod error;
pub mod harness;
pub mod hardware;
pub mod kernel;
pub mod matrix;
pub mod orchestrator;
pub mod port;
pub mod roles;
pub mod stats;

pub use self::{
    config::BenchConfig,
    counter::{CycleCounter, Probe, TimingSample},
    error::BenchError,
    harness::{Harness, ResultReporter, ResultSet},
    kernel::Ipc,
    matrix::{Matrix, ScenarioDescriptor},
    port::Port,
};
