//! Constructs, sequences, and tears down the execution contexts of one
//! scenario repetition.
//!
//! The harness side of a repetition is a linear sequence of [`Phase`]s.
//! Every step checks the transition it makes, so a port or a benchmark body
//! that reports out of order is caught instead of producing a silently
//! wrong sample.
use core::fmt;

use crate::{
    channel::{Report, SampleLayout},
    config::BenchConfig,
    counter::{Probe, TimingSample},
    error::BenchError,
    kernel::CPtr,
    matrix::{Direction, ScenarioDescriptor},
    port::{AddressSpace, Port, PortError, ProcessConfig},
    roles::{Role, RoleArgs, RoleFn},
};

/// The harness-side state of a scenario repetition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Configuring,
    ClientConfigured,
    ServerConfigured,
    DummyStarted,
    ServerStarted,
    ServerInitialized,
    BudgetStripped,
    ClientStarted,
    ClientResultReceived,
    BudgetRestored,
    ServerResultReceived,
    TornDown,
}

impl Phase {
    /// Returns `true` if `self → next` is a valid transition.
    pub fn can_advance_to(self, next: Self) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Configuring, ClientConfigured)
                | (ClientConfigured, ServerConfigured)
                | (ServerConfigured, DummyStarted | ServerStarted)
                | (DummyStarted, ServerStarted)
                | (ServerStarted, ServerInitialized)
                | (ServerInitialized, BudgetStripped | ClientStarted)
                | (BudgetStripped, ClientStarted)
                | (ClientStarted, ClientResultReceived)
                | (ClientResultReceived, BudgetRestored | ServerResultReceived)
                | (BudgetRestored, ServerResultReceived)
                | (ServerResultReceived, TornDown)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("Invalid transition from {from:?} to {to:?}.")]
    InvalidTransition { from: Phase, to: Phase },
    #[error("The server's result arrived before the client's.")]
    ServerBeforeClient,
    #[error("Expected a result from the {expected}, but got one from the {got}.")]
    UnexpectedRole { expected: Role, got: Role },
    #[error("Expected the readiness signal of the server, but got a message labeled {0}.")]
    BadReadySignal(u64),
    #[error("The dummy context is no longer running.")]
    DummyDied,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SetupError {
    #[error("Could not allocate a kernel object")]
    Alloc(#[source] PortError),
    #[error("Could not configure the {0}")]
    Configure(Role, #[source] PortError),
    #[error("Could not copy a capability to the {0}")]
    CopyCap(Role, #[source] PortError),
    #[error("Could not start the {0}")]
    Spawn(Role, #[source] PortError),
    #[error("Could not strip the server's scheduling budget")]
    StripBudget(#[source] PortError),
    #[error("Could not restore the server's scheduling budget")]
    RestoreBudget(#[source] PortError),
    #[error("Could not yield to the client")]
    YieldTo(#[source] PortError),
    #[error("Could not receive a message")]
    Receive(#[source] PortError),
    #[error("Could not destroy the {0}")]
    Destroy(Role, #[source] PortError),
}

/// The kernel objects shared by the harness and all contexts of a
/// scenario, as seen from the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedObjects {
    /// The endpoint benchmarked primitives are invoked on.
    pub ep: CPtr,
    /// The endpoint results are reported on.
    pub result_ep: CPtr,
    pub ntfn: CPtr,
}

/// The capabilities of a context, as seen from the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextCaps {
    pub ep: CPtr,
    pub result_ep: CPtr,
    pub ntfn: CPtr,
}

/// A constructed execution context.
#[derive(Debug)]
pub struct ExecutionContext<P> {
    pub role: Role,
    pub process: P,
    /// The context holds its own scheduling budget.
    pub owns_budget: bool,
    pub caps: ContextCaps,
}

/// The samples reported by both sides in one repetition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairSample {
    pub client: TimingSample,
    pub server: TimingSample,
}

impl PairSample {
    /// Returns `(start, end)`.
    pub fn start_end(&self, direction: Direction) -> (TimingSample, TimingSample) {
        match direction {
            Direction::ClientToServer => (self.client, self.server),
            Direction::ServerToClient => (self.server, self.client),
        }
    }
}

/// Drives one repetition of one scenario.
pub struct Orchestrator<'a, P: Port> {
    port: &'a mut P,
    scenario: &'a ScenarioDescriptor,
    objects: SharedObjects,
    probe: &'a Probe<P::Counter>,
    warmups: u32,
    layout: SampleLayout,
    timeslice_us: u64,
    phase: Phase,
    trace: Vec<Phase>,
}

impl<P: Port> fmt::Debug for Orchestrator<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("scenario", &self.scenario.name)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl<'a, P: Port> Orchestrator<'a, P> {
    pub fn new(
        port: &'a mut P,
        scenario: &'a ScenarioDescriptor,
        objects: SharedObjects,
        probe: &'a Probe<P::Counter>,
        config: &BenchConfig,
    ) -> Self {
        Self {
            port,
            scenario,
            objects,
            probe,
            warmups: config.warmups,
            layout: SampleLayout {
                counter: probe.width(),
                word: config.word_width,
            },
            timeslice_us: config.timeslice_us,
            phase: Phase::Configuring,
            trace: vec![Phase::Configuring],
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The phases visited so far.
    pub fn trace(&self) -> &[Phase] {
        &self.trace
    }

    fn advance(&mut self, next: Phase) -> Result<(), ProtocolViolation> {
        if !self.phase.can_advance_to(next) {
            return Err(ProtocolViolation::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        log::trace!("{}: {:?} -> {:?}", self.scenario.name, self.phase, next);
        self.phase = next;
        self.trace.push(next);
        Ok(())
    }

    /// Run the repetition to completion.
    pub fn run(&mut self) -> Result<PairSample, BenchError> {
        let scenario = self.scenario;

        // Configure the client
        let client = self.configure(Role::Client, scenario.client_prio, AddressSpace::Fresh)?;
        let client = ExecutionContext {
            role: Role::Client,
            caps: self.copy_caps(&client, Role::Client)?,
            process: client,
            owns_budget: true,
        };
        self.advance(Phase::ClientConfigured)?;

        // Configure the server, in the client's address space if requested
        let server = if scenario.same_vspace {
            self.configure(
                Role::Server,
                scenario.server_prio,
                AddressSpace::SharedWith(&client.process),
            )?
        } else {
            self.configure(Role::Server, scenario.server_prio, AddressSpace::Fresh)?
        };
        let server_caps = if scenario.same_vspace {
            // The capability space is shared; the copies made for the
            // client are already there
            client.caps
        } else {
            self.copy_caps(&server, Role::Server)?
        };
        let mut server = ExecutionContext {
            role: Role::Server,
            process: server,
            owns_budget: true,
            caps: server_caps,
        };
        self.advance(Phase::ServerConfigured)?;

        // Start the dummy before anything else runs
        let dummy = match scenario.dummy_prio {
            Some(prio) => {
                let process = self.configure(Role::Dummy, prio, AddressSpace::Fresh)?;
                let caps = ContextCaps {
                    ep: CPtr::NULL,
                    result_ep: CPtr::NULL,
                    ntfn: CPtr::NULL,
                };
                let dummy = ExecutionContext {
                    role: Role::Dummy,
                    process,
                    owns_budget: true,
                    caps,
                };
                self.spawn(&dummy, RoleFn::Idle)?;
                self.advance(Phase::DummyStarted)?;
                Some(dummy)
            }
            None => None,
        };

        // Start the server and wait until it's ready
        self.spawn(&server, scenario.server_fn)?;
        self.advance(Phase::ServerStarted)?;

        let ready = self
            .port
            .recv(self.objects.ep)
            .map_err(SetupError::Receive)?;
        if ready.label != Role::Server.label() {
            return Err(ProtocolViolation::BadReadySignal(ready.label).into());
        }
        self.advance(Phase::ServerInitialized)?;

        if scenario.same_sc {
            self.port
                .unbind_budget(&server.process)
                .map_err(SetupError::StripBudget)?;
            server.owns_budget = false;
            self.advance(Phase::BudgetStripped)?;
        }

        // Start the client
        self.spawn(&client, scenario.client_fn)?;
        self.advance(Phase::ClientStarted)?;
        self.port
            .yield_to(&client.process)
            .map_err(SetupError::YieldTo)?;

        let client_sample = self.receive(Role::Client)?;
        self.advance(Phase::ClientResultReceived)?;

        if !server.owns_budget {
            self.port
                .bind_budget(&server.process)
                .map_err(SetupError::RestoreBudget)?;
            server.owns_budget = true;
            self.advance(Phase::BudgetRestored)?;
        }

        let server_sample = self.receive(Role::Server)?;
        self.advance(Phase::ServerResultReceived)?;

        // Tear down the server first. It may be a thread in the client's
        // address space.
        self.destroy(server)?;
        self.destroy(client)?;
        if let Some(dummy) = dummy {
            if !self.port.is_alive(&dummy.process) {
                return Err(ProtocolViolation::DummyDied.into());
            }
            self.destroy(dummy)?;
        }
        self.advance(Phase::TornDown)?;

        Ok(PairSample {
            client: client_sample,
            server: server_sample,
        })
    }

    fn configure(
        &mut self,
        role: Role,
        priority: u8,
        address_space: AddressSpace<'_, P::Process>,
    ) -> Result<P::Process, SetupError> {
        let config = ProcessConfig {
            name: role.as_str(),
            role,
            priority,
            address_space,
            timeslice_us: self.timeslice_us,
        };
        log::trace!("{}: configuring the {role} at priority {priority}", self.scenario.name);
        self.port
            .configure(&config)
            .map_err(|e| SetupError::Configure(role, e))
    }

    fn copy_caps(&mut self, process: &P::Process, role: Role) -> Result<ContextCaps, SetupError> {
        let SharedObjects {
            ep,
            result_ep,
            ntfn,
        } = self.objects;
        let mut copy = |cap| {
            self.port
                .copy_cap(process, cap)
                .map_err(|e| SetupError::CopyCap(role, e))
        };
        Ok(ContextCaps {
            ep: copy(ep)?,
            result_ep: copy(result_ep)?,
            ntfn: copy(ntfn)?,
        })
    }

    fn spawn(
        &mut self,
        context: &ExecutionContext<P::Process>,
        entry: RoleFn,
    ) -> Result<(), SetupError> {
        let args = RoleArgs {
            ep: context.caps.ep,
            result_ep: context.caps.result_ep,
            ntfn: context.caps.ntfn,
            warmups: self.warmups,
            layout: self.layout,
        };
        log::trace!("{}: starting the {}", self.scenario.name, context.role);
        self.port
            .spawn(&context.process, entry, context.role, &args, self.probe)
            .map_err(|e| SetupError::Spawn(context.role, e))
    }

    /// Receive the result of `expected`.
    fn receive(&mut self, expected: Role) -> Result<TimingSample, BenchError> {
        let msg = self
            .port
            .recv(self.objects.result_ep)
            .map_err(SetupError::Receive)?;
        let report = Report::decode(&msg, self.layout.word)?;
        match (expected, report.role) {
            (a, b) if a == b => Ok(report.sample),
            (Role::Client, Role::Server) => Err(ProtocolViolation::ServerBeforeClient.into()),
            (expected, got) => Err(ProtocolViolation::UnexpectedRole { expected, got }.into()),
        }
    }

    fn destroy(&mut self, context: ExecutionContext<P::Process>) -> Result<(), SetupError> {
        log::trace!("{}: destroying the {}", self.scenario.name, context.role);
        self.port
            .destroy(context.process)
            .map_err(|e| SetupError::Destroy(context.role, e))
    }
}
