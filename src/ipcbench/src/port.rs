//! The harness-side kernel interface.
use crate::{
    counter::{CycleCounter, Probe, ProbeError},
    kernel::{CPtr, Ipc, Message},
    roles::{Role, RoleArgs, RoleFn},
};

/// The address space of a process being configured.
#[derive(Debug)]
pub enum AddressSpace<'a, P> {
    /// A new address space and capability space.
    Fresh,
    /// The address space and capability space of an existing process. The
    /// new process is a second thread in it.
    SharedWith(&'a P),
}

/// The configuration of a process. Every process is created with its own
/// scheduling budget.
#[derive(Debug)]
pub struct ProcessConfig<'a, P> {
    pub name: &'a str,
    pub role: Role,
    pub priority: u8,
    pub address_space: AddressSpace<'a, P>,
    /// The time-slice of the process's scheduling budget.
    pub timeslice_us: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("Out of kernel memory.")]
    NoMemory,
    #[error("The capability {0} does not designate a suitable object.")]
    InvalidCap(CPtr),
    #[error("The priority {0} exceeds the maximum priority available to benchmark contexts.")]
    BadPriority(u8),
    #[error("The object is still in use.")]
    InUse,
    #[error("The operation is not permitted in the current state: {0}")]
    BadState(&'static str),
    #[error("No execution context can make progress.")]
    Deadlock,
    #[error("The process has terminated.")]
    Terminated,
    #[error("Could not start the process: {0}")]
    Spawn(String),
}

/// The kernel and target support needed by the harness.
///
/// A port creates benchmark contexts, connects them to kernel objects, and
/// manipulates their scheduling. The harness itself runs as a context of
/// the port with a priority above every benchmark context.
pub trait Port {
    /// A handle to a configured process.
    type Process;
    /// The primitive interface of the harness context.
    type Ipc: Ipc;
    type Counter: CycleCounter + Clone;

    /// The highest priority a benchmark context may have.
    const MAX_PRIO: u8;

    /// The primitive interface of the harness context.
    fn ipc(&self) -> &Self::Ipc;

    /// Get the cycle counter of the target.
    fn counter(&self) -> Result<Self::Counter, ProbeError>;

    /// Create an endpoint in the harness's capability space.
    fn alloc_endpoint(&mut self) -> Result<CPtr, PortError>;

    /// Create a notification object in the harness's capability space.
    fn alloc_notification(&mut self) -> Result<CPtr, PortError>;

    /// Create a process. It does not run until [`Self::spawn`] is called.
    fn configure(
        &mut self,
        config: &ProcessConfig<'_, Self::Process>,
    ) -> Result<Self::Process, PortError>;

    /// Copy the capability `cap` of the harness into the capability space of
    /// `process`. Returns the index of the copy.
    fn copy_cap(&mut self, process: &Self::Process, cap: CPtr) -> Result<CPtr, PortError>;

    /// Start `process` at `entry`.
    fn spawn(
        &mut self,
        process: &Self::Process,
        entry: RoleFn,
        role: Role,
        args: &RoleArgs,
        probe: &Probe<Self::Counter>,
    ) -> Result<(), PortError>;

    /// Take the scheduling budget away from `process`. The process can then
    /// only run on a budget donated to it.
    fn unbind_budget(&mut self, process: &Self::Process) -> Result<(), PortError>;

    /// Give `process` its scheduling budget back.
    fn bind_budget(&mut self, process: &Self::Process) -> Result<(), PortError>;

    /// Make `process` the next context of its priority to run once the
    /// harness blocks.
    fn yield_to(&mut self, process: &Self::Process) -> Result<(), PortError>;

    /// Block the harness until a message arrives on `ep`.
    fn recv(&mut self, ep: CPtr) -> Result<Message, PortError>;

    /// Returns `true` if `process` has been started and has neither returned
    /// nor been destroyed.
    fn is_alive(&self, process: &Self::Process) -> bool;

    /// Stop `process` and release its resources.
    fn destroy(&mut self, process: Self::Process) -> Result<(), PortError>;
}
