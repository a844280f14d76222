//! The benchmark bodies executed by client, server, and dummy contexts.
//!
//! Every pair of roles follows the same choreography:
//!
//! ```text
//!   harness              server                          client
//!     │ recv(ep)           │                               ┊
//!     │ ◀──── ready ────── │ (enters its wait state)       ┊
//!     │ ─────────── spawn + yield_to ──────────────────▶  │
//!     │                    │ ◀═══════ measured loop ════▶ │
//!     │ ◀──────────────────┼────────── client result ──── │
//!     │                    │ ◀────────── done ─────────── │
//!     │ ◀── server result ─│                               │
//!     ┊                  (blocks forever)            (blocks forever)
//! ```
//!
//! The server never reports before it has received the client's `done`
//! message, which is sent only after the client's own result. This is what
//! lets the harness insist on receiving the client's result first.
use core::fmt;

use crate::{
    channel::{send_result, SampleLayout, WordWidth},
    counter::{fence, CounterWidth, CycleCounter, Probe, TimingSample},
    kernel::{CPtr, Ipc, Message, Primitive, Terminated, Word},
};

/// The part an execution context plays in a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
    /// A background context that only occupies the ready queue. It never
    /// reports a result.
    Dummy,
}

impl Role {
    /// The message label identifying messages sent by this role.
    pub const fn label(self) -> Word {
        match self {
            Self::Client => 1,
            Self::Server => 2,
            Self::Dummy => 3,
        }
    }

    pub fn from_label(label: Word) -> Option<Self> {
        match label {
            1 => Some(Self::Client),
            2 => Some(Self::Server),
            3 => Some(Self::Dummy),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
            Self::Dummy => "dummy",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The leg of a call/reply round trip measured by a pair of roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Leg {
    /// From the client entering `Call` to the server returning from
    /// `ReplyRecv`. The client reports its start timestamp, the server its
    /// end timestamp.
    Call,
    /// From the server entering `ReplyRecv` to the client returning from
    /// `Call`. The server reports its start timestamp, the client its end
    /// timestamp.
    Reply,
}

/// How a waiter gets to run after the signaler signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Wake {
    /// The waiter has the higher priority and preempts the signaler.
    Preempt,
    /// The waiter has the lower priority and runs only once the signaler
    /// blocks. After every signal the signaler waits on the benchmark
    /// endpoint until the waiter hands control back.
    Handoff,
}

/// The entry point of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleFn {
    /// Repeatedly calls the benchmark endpoint with `length`-word messages.
    Caller { leg: Leg, length: usize },
    /// Replies to calls on the benchmark endpoint and waits for the next one
    /// in a single invocation.
    ReplyRecvServer { leg: Leg, length: usize },
    /// Repeatedly sends on the benchmark endpoint. Reports its start
    /// timestamp.
    Sender,
    /// Repeatedly receives on the benchmark endpoint. Reports its end
    /// timestamp.
    Receiver,
    /// Repeatedly signals the notification. Reports its start timestamp.
    Signaler { wake: Wake },
    /// Repeatedly waits on the notification. Reports its end timestamp.
    Waiter { wake: Wake },
    /// Spins forever.
    Idle,
}

impl RoleFn {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Caller { .. } => "caller",
            Self::ReplyRecvServer { .. } => "reply_recv_server",
            Self::Sender => "sender",
            Self::Receiver => "receiver",
            Self::Signaler { .. } => "signaler",
            Self::Waiter { .. } => "waiter",
            Self::Idle => "idle",
        }
    }
}

/// The startup arguments of a benchmark context.
///
/// Capabilities are indices into the context's own capability space. Ports
/// that start contexts with raw register arguments can use
/// [`Self::to_words`] and [`Self::from_words`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleArgs {
    /// The endpoint benchmarked primitives are invoked on.
    pub ep: CPtr,
    /// The endpoint results are reported on.
    pub result_ep: CPtr,
    /// The notification object used by the signal benchmark.
    pub ntfn: CPtr,
    /// The number of measured iterations per run. Only the last one is
    /// reported.
    pub warmups: u32,
    pub layout: SampleLayout,
}

impl RoleArgs {
    pub const NUM_WORDS: usize = 6;

    pub fn to_words(&self) -> [Word; Self::NUM_WORDS] {
        [
            self.ep.0 as Word,
            self.result_ep.0 as Word,
            self.ntfn.0 as Word,
            self.warmups as Word,
            self.layout.counter.bits() as Word,
            self.layout.word.bits() as Word,
        ]
    }

    pub fn from_words(words: &[Word]) -> Option<Self> {
        let &[ep, result_ep, ntfn, warmups, counter_bits, word_bits] = words else {
            return None;
        };
        let counter = match counter_bits {
            32 => CounterWidth::Bits32,
            64 => CounterWidth::Bits64,
            _ => return None,
        };
        let word = match word_bits {
            32 => WordWidth::Bits32,
            64 => WordWidth::Bits64,
            _ => return None,
        };
        Some(Self {
            ep: CPtr(ep.try_into().ok()?),
            result_ep: CPtr(result_ep.try_into().ok()?),
            ntfn: CPtr(ntfn.try_into().ok()?),
            warmups: warmups.try_into().ok()?,
            layout: SampleLayout { counter, word },
        })
    }
}

/// Execute `entry` as `role`.
///
/// Benchmark bodies never return on their own; they end by blocking on the
/// benchmark endpoint until the harness destroys them, at which point the
/// port makes the blocking invocation fail with [`Terminated`].
pub fn run<I: Ipc, C: CycleCounter>(
    entry: RoleFn,
    role: Role,
    ipc: &I,
    probe: &Probe<C>,
    args: &RoleArgs,
) -> Result<(), Terminated> {
    log::trace!("{role} context entering {}", entry.as_str());
    match entry {
        RoleFn::Caller { leg, length } => caller(leg, length, role, ipc, probe, args),
        RoleFn::ReplyRecvServer { leg, length } => {
            reply_recv_server(leg, length, role, ipc, probe, args)
        }
        RoleFn::Sender => sender(role, ipc, probe, args),
        RoleFn::Receiver => receiver(role, ipc, probe, args),
        RoleFn::Signaler { wake } => signaler(wake, role, ipc, probe, args),
        RoleFn::Waiter { wake } => waiter(wake, role, ipc, probe, args),
        RoleFn::Idle => idle(ipc),
    }
}

fn caller<I: Ipc, C: CycleCounter>(
    leg: Leg,
    length: usize,
    role: Role,
    ipc: &I,
    probe: &Probe<C>,
    args: &RoleArgs,
) -> Result<(), Terminated> {
    let mut msg = Message::with_length(0, length);
    let (mut start, mut end): (TimingSample, TimingSample) = (0, 0);

    if leg == Leg::Call {
        // The server's first `ReplyRecv` replies to this call, so that its
        // n-th `ReplyRecv` returns with our n-th measured call.
        ipc.invoke(Primitive::Call, args.ep, &mut msg)?;
    }

    fence();
    for _ in 0..args.warmups {
        start = probe.sample_before();
        ipc.invoke(Primitive::Call, args.ep, &mut msg)?;
        end = probe.sample_after();
    }
    fence();

    let sample = match leg {
        Leg::Call => start,
        Leg::Reply => end,
    };
    send_result(ipc, args.result_ep, role, sample, args.layout)?;

    // Let the server report
    ipc.invoke(Primitive::Send, args.ep, &mut Message::new(role.label()))?;
    block(ipc, args.ep)
}

fn reply_recv_server<I: Ipc, C: CycleCounter>(
    leg: Leg,
    length: usize,
    role: Role,
    ipc: &I,
    probe: &Probe<C>,
    args: &RoleArgs,
) -> Result<(), Terminated> {
    let (mut start, mut end): (TimingSample, TimingSample) = (0, 0);

    // Tell the harness we are ready and wait for the first call
    let mut msg = Message::new(role.label());
    ipc.invoke(Primitive::SignalRecv, args.ep, &mut msg)?;
    if msg.len() != length {
        log::warn!(
            "{role} expected {length}-word calls, got {} word(s)",
            msg.len()
        );
    }

    fence();
    for _ in 0..args.warmups {
        start = probe.sample_before();
        ipc.invoke(Primitive::ReplyRecv, args.ep, &mut msg)?;
        end = probe.sample_after();
    }
    fence();

    let sample = match leg {
        Leg::Call => {
            // We are holding the client's last call. Complete it and wait
            // until the client has reported.
            ipc.invoke(Primitive::Reply, args.ep, &mut msg)?;
            ipc.invoke(Primitive::Recv, args.ep, &mut msg)?;
            end
        }
        // The last `ReplyRecv` has already received the client's `done`
        Leg::Reply => start,
    };
    send_result(ipc, args.result_ep, role, sample, args.layout)?;
    block(ipc, args.ep)
}

fn sender<I: Ipc, C: CycleCounter>(
    role: Role,
    ipc: &I,
    probe: &Probe<C>,
    args: &RoleArgs,
) -> Result<(), Terminated> {
    let mut msg = Message::new(0);
    let mut start: TimingSample = 0;

    fence();
    for _ in 0..args.warmups {
        start = probe.sample_before();
        ipc.invoke(Primitive::Send, args.ep, &mut msg)?;
        let _ = probe.sample_after();
    }
    fence();

    send_result(ipc, args.result_ep, role, start, args.layout)?;

    // The receiver takes one more message before reporting
    ipc.invoke(Primitive::Send, args.ep, &mut Message::new(role.label()))?;
    block(ipc, args.ep)
}

fn receiver<I: Ipc, C: CycleCounter>(
    role: Role,
    ipc: &I,
    probe: &Probe<C>,
    args: &RoleArgs,
) -> Result<(), Terminated> {
    let mut msg = Message::new(role.label());
    let mut end: TimingSample = 0;

    ipc.invoke(Primitive::Send, args.ep, &mut msg)?;

    fence();
    for _ in 0..args.warmups {
        let _ = probe.sample_before();
        ipc.invoke(Primitive::Recv, args.ep, &mut msg)?;
        end = probe.sample_after();
    }
    fence();

    ipc.invoke(Primitive::Recv, args.ep, &mut msg)?;
    send_result(ipc, args.result_ep, role, end, args.layout)?;
    block(ipc, args.ep)
}

fn signaler<I: Ipc, C: CycleCounter>(
    wake: Wake,
    role: Role,
    ipc: &I,
    probe: &Probe<C>,
    args: &RoleArgs,
) -> Result<(), Terminated> {
    let mut msg = Message::new(0);
    let mut start: TimingSample = 0;

    fence();
    for _ in 0..args.warmups {
        start = probe.sample_before();
        ipc.invoke(Primitive::Signal, args.ntfn, &mut msg)?;
        let _ = probe.sample_after();
        if wake == Wake::Handoff {
            // Block so that the waiter can run
            ipc.invoke(Primitive::Recv, args.ep, &mut msg)?;
        }
    }
    fence();

    send_result(ipc, args.result_ep, role, start, args.layout)?;
    ipc.invoke(Primitive::Send, args.ep, &mut Message::new(role.label()))?;
    block(ipc, args.ep)
}

fn waiter<I: Ipc, C: CycleCounter>(
    wake: Wake,
    role: Role,
    ipc: &I,
    probe: &Probe<C>,
    args: &RoleArgs,
) -> Result<(), Terminated> {
    let mut msg = Message::new(role.label());
    let mut end: TimingSample = 0;

    ipc.invoke(Primitive::Send, args.ep, &mut msg)?;

    fence();
    for _ in 0..args.warmups {
        ipc.invoke(Primitive::Wait, args.ntfn, &mut msg)?;
        end = probe.sample_after();
        if wake == Wake::Handoff {
            ipc.invoke(Primitive::Send, args.ep, &mut msg)?;
        }
    }
    fence();

    ipc.invoke(Primitive::Recv, args.ep, &mut msg)?;
    send_result(ipc, args.result_ep, role, end, args.layout)?;
    block(ipc, args.ep)
}

fn idle<I: Ipc>(ipc: &I) -> Result<(), Terminated> {
    loop {
        ipc.preempt_point()?;
        core::hint::spin_loop();
    }
}

/// Block on `ep` until terminated so that the context never returns.
fn block<I: Ipc>(ipc: &I, ep: CPtr) -> Result<(), Terminated> {
    let mut msg = Message::new(0);
    loop {
        ipc.invoke(Primitive::Recv, ep, &mut msg)?;
        log::warn!("a finished benchmark context received a stray message");
    }
}
