//! Hosted port of `ipcbench`.
//!
//! Runs the benchmark matrix on a simulated uniprocessor microkernel built
//! from host threads. The simulation implements endpoints, notifications,
//! fixed-priority preemptive scheduling, scheduling budgets with donation,
//! and capability spaces that can be shared between threads. It is meant
//! for exercising the harness and the benchmark bodies; the absolute numbers
//! it produces say little about any real kernel.
//!
//! The timing source is not cycle-exact, so runs on this port should use
//! [`OverheadPolicy::Tolerant`](ipcbench::calibrate::OverheadPolicy).
#![warn(missing_debug_implementations)]
use ipcbench::{
    counter::ProbeError,
    kernel::{CPtr, Ipc, Message, Primitive, Terminated},
    port::{AddressSpace, Port, PortError, ProcessConfig},
    roles::{self, Role, RoleArgs, RoleFn},
    Probe,
};
use std::{
    collections::HashMap,
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

mod kernel;
mod sched;
mod timing;

use kernel::{Kernel, NewCSpace, ThreadId};

pub use timing::TscCounter;

/// The primitive interface of a thread of the simulated kernel.
#[derive(Debug, Clone)]
pub struct ThreadIpc {
    kernel: Arc<Kernel>,
    tid: ThreadId,
}

impl Ipc for ThreadIpc {
    fn invoke(&self, primitive: Primitive, cap: CPtr, msg: &mut Message) -> Result<(), Terminated> {
        self.kernel.invoke(self.tid, primitive, cap, msg)
    }

    #[inline(never)]
    fn invoke_nop(&self, primitive: Primitive, cap: CPtr, msg: &mut Message) {
        // Same arguments, no kernel entry
        std::hint::black_box((self.tid, primitive, cap, msg));
    }

    fn preempt_point(&self) -> Result<(), Terminated> {
        self.kernel.preempt_point(self.tid)
    }
}

/// A process of the simulated kernel: a single thread and, unless it shares
/// another process's, its own capability space.
#[derive(Debug)]
pub struct StdProcess {
    tid: ThreadId,
}

/// The hosted port.
#[derive(Debug)]
pub struct StdPort {
    kernel: Arc<Kernel>,
    root_ipc: ThreadIpc,
    join_handles: HashMap<ThreadId, JoinHandle<()>>,
}

impl StdPort {
    /// Construct a simulated kernel. The calling thread becomes its
    /// harness thread.
    pub fn new() -> Self {
        let kernel = Arc::new(Kernel::new());
        let root_ipc = ThreadIpc {
            tid: kernel.root(),
            kernel: Arc::clone(&kernel),
        };
        Self {
            kernel,
            root_ipc,
            join_handles: HashMap::new(),
        }
    }
}

impl Default for StdPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StdPort {
    fn drop(&mut self) {
        log::trace!("shutting down {} thread(s)", self.join_handles.len());
        self.kernel.kill_all();
        for (tid, join_handle) in self.join_handles.drain() {
            if join_handle.join().is_err() {
                log::error!("thread {tid} panicked");
            }
        }
    }
}

/// The body of a benchmark thread.
fn thread_main(
    ipc: ThreadIpc,
    entry: RoleFn,
    role: Role,
    arg_words: [u64; RoleArgs::NUM_WORDS],
    probe: Probe<TscCounter>,
) {
    let result = ipc.kernel.enter(ipc.tid).and_then(|()| {
        // Arguments arrive in registers
        let Some(args) = RoleArgs::from_words(&arg_words) else {
            log::error!("{role}: malformed startup arguments {arg_words:?}");
            return Ok(());
        };
        roles::run(entry, role, &ipc, &probe, &args)
    });
    match result {
        Ok(()) => log::warn!("{role} returned"),
        Err(Terminated) => log::trace!("{role} terminated"),
    }
    ipc.kernel.exit(ipc.tid);
}

impl Port for StdPort {
    type Process = StdProcess;
    type Ipc = ThreadIpc;
    type Counter = TscCounter;

    const MAX_PRIO: u8 = kernel::ROOT_PRIO - 1;

    fn ipc(&self) -> &ThreadIpc {
        &self.root_ipc
    }

    fn counter(&self) -> Result<TscCounter, ProbeError> {
        Ok(TscCounter::new())
    }

    fn alloc_endpoint(&mut self) -> Result<CPtr, PortError> {
        Ok(self.kernel.alloc_endpoint())
    }

    fn alloc_notification(&mut self) -> Result<CPtr, PortError> {
        Ok(self.kernel.alloc_notification())
    }

    fn configure(
        &mut self,
        config: &ProcessConfig<'_, StdProcess>,
    ) -> Result<StdProcess, PortError> {
        if config.priority > Self::MAX_PRIO {
            return Err(PortError::BadPriority(config.priority));
        }
        let cspace = match config.address_space {
            AddressSpace::Fresh => NewCSpace::Fresh,
            AddressSpace::SharedWith(other) => NewCSpace::SharedWith(other.tid),
        };
        let tid = self.kernel.create_thread(
            config.name,
            config.priority,
            cspace,
            Duration::from_micros(config.timeslice_us),
        )?;
        Ok(StdProcess { tid })
    }

    fn copy_cap(&mut self, process: &StdProcess, cap: CPtr) -> Result<CPtr, PortError> {
        self.kernel.copy_cap(process.tid, cap)
    }

    fn spawn(
        &mut self,
        process: &StdProcess,
        entry: RoleFn,
        role: Role,
        args: &RoleArgs,
        probe: &Probe<TscCounter>,
    ) -> Result<(), PortError> {
        let ipc = ThreadIpc {
            kernel: Arc::clone(&self.kernel),
            tid: process.tid,
        };
        let arg_words = args.to_words();
        let probe = probe.clone();

        // The thread cannot be scheduled before the harness blocks, so it's
        // safe to make it ready before its host thread exists
        self.kernel.start(process.tid)?;

        match std::thread::Builder::new()
            .name(format!("{role} ({})", entry.as_str()))
            .spawn(move || thread_main(ipc, entry, role, arg_words, probe))
        {
            Ok(join_handle) => {
                self.join_handles.insert(process.tid, join_handle);
                Ok(())
            }
            Err(e) => {
                let _ = self.kernel.kill(process.tid);
                Err(PortError::Spawn(e.to_string()))
            }
        }
    }

    fn unbind_budget(&mut self, process: &StdProcess) -> Result<(), PortError> {
        self.kernel.set_budget(process.tid, false)
    }

    fn bind_budget(&mut self, process: &StdProcess) -> Result<(), PortError> {
        self.kernel.set_budget(process.tid, true)
    }

    fn yield_to(&mut self, process: &StdProcess) -> Result<(), PortError> {
        self.kernel.yield_to(process.tid)
    }

    fn recv(&mut self, ep: CPtr) -> Result<Message, PortError> {
        self.kernel.root_recv(ep)
    }

    fn is_alive(&self, process: &StdProcess) -> bool {
        self.kernel.is_alive(process.tid)
    }

    fn destroy(&mut self, process: StdProcess) -> Result<(), PortError> {
        let tid = process.tid;
        self.kernel.kill(tid)?;
        if let Some(join_handle) = self.join_handles.remove(&tid) {
            if join_handle.join().is_err() {
                log::error!("thread {tid} panicked");
            }
        }
        self.kernel.reap(tid);
        Ok(())
    }
}
