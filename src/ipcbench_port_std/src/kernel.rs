//! The simulated kernel.
//!
//! Every execution context is backed by a host thread, but only one of them
//! (the *current* thread) executes user code at any time. All others are
//! parked on a condition variable until the scheduler selects them or they
//! are killed. Kernel state lives behind a single mutex; a primitive
//! invocation locks it, updates the objects involved, picks the next thread,
//! and then waits until the invoker is current again.
//!
//! The model follows a capability-based microkernel with scheduling
//! contexts:
//!
//!  - A thread can run only if it is ready and has a scheduling budget,
//!    either its own or one donated to it.
//!  - `Call` to a receiver without a budget lends the caller's budget to the
//!    receiver until the receiver replies.
//!  - A thread wakened by an invocation preempts the invoker only if its
//!    priority is strictly higher.
use ipcbench::{
    kernel::{CPtr, Message, Primitive, Terminated},
    port::PortError,
};
use slab::Slab;
use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use crate::sched::{self, Candidate, Stamps};


pub(crate) type ThreadId = usize;
type ObjectId = usize;
type CSpaceId = usize;

/// The priority of the harness thread. Above every benchmark context.
pub(crate) const ROOT_PRIO: u8 = 255;

#[derive(Debug)]
enum Object {
    Endpoint(Endpoint),
    Notification(Notification),
}

#[derive(Debug, Default)]
struct Endpoint {
    senders: VecDeque<ThreadId>,
    receivers: VecDeque<ThreadId>,
}

#[derive(Debug, Default)]
struct Notification {
    pending: bool,
    waiters: VecDeque<ThreadId>,
}

/// A capability space. Slot 0 is the null capability.
#[derive(Debug)]
struct CSpace {
    slots: Vec<Option<ObjectId>>,
}

/// Thread state machine
#[derive(Debug, Clone, PartialEq, Eq)]
enum ThreadState {
    /// Configured but not started.
    Inactive,
    /// Running or waiting to run.
    Ready,
    BlockedSend {
        ep: ObjectId,
        msg: Message,
        call: bool,
    },
    BlockedRecv {
        ep: ObjectId,
    },
    /// Waiting for a reply to a `Call`.
    BlockedReply,
    BlockedWait {
        ntfn: ObjectId,
    },
    /// Invoked an invalid capability. Never runs again.
    Faulted,
    /// Killed or returned. The backing host thread may still be winding
    /// down.
    Dead,
}

#[derive(Debug)]
struct Tcb {
    name: String,
    prio: u8,
    state: ThreadState,
    killed: bool,
    /// Holds its own scheduling budget.
    own_budget: bool,
    /// The thread whose budget this thread is running on.
    donor: Option<ThreadId>,
    /// The caller waiting for this thread's reply.
    reply_to: Option<ThreadId>,
    /// The last message delivered to this thread.
    inbox: Option<Message>,
    stamp: i64,
    cspace: CSpaceId,
    owns_cspace: bool,
    timeslice: Duration,
    slice_start: Instant,
}

impl Tcb {
    fn is_schedulable(&self) -> bool {
        self.state == ThreadState::Ready
            && !self.killed
            && (self.own_budget || self.donor.is_some())
    }
}

#[derive(Debug)]
pub(crate) struct KState {
    threads: Slab<Tcb>,
    objects: Slab<Object>,
    cspaces: Slab<CSpace>,
    current: Option<ThreadId>,
    stamps: Stamps,
    root: ThreadId,
}

#[derive(Debug)]
pub(crate) struct Kernel {
    state: Mutex<KState>,
    cv: Condvar,
}

/// The address space of a new thread.
#[derive(Debug, Clone, Copy)]
pub(crate) enum NewCSpace {
    Fresh,
    SharedWith(ThreadId),
}

impl Kernel {
    /// Construct a kernel whose only thread is the harness thread, which is
    /// current.
    pub(crate) fn new() -> Self {
        let mut cspaces = Slab::new();
        let cspace = cspaces.insert(CSpace { slots: vec![None] });
        let mut threads = Slab::new();
        let root = threads.insert(Tcb {
            name: "harness".to_owned(),
            prio: ROOT_PRIO,
            state: ThreadState::Ready,
            killed: false,
            own_budget: true,
            donor: None,
            reply_to: None,
            inbox: None,
            stamp: 0,
            cspace,
            owns_cspace: true,
            timeslice: Duration::MAX,
            slice_start: Instant::now(),
        });
        Self {
            state: Mutex::new(KState {
                threads,
                objects: Slab::new(),
                cspaces,
                current: Some(root),
                stamps: Stamps::new(),
                root,
            }),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, KState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn root(&self) -> ThreadId {
        self.lock().root
    }

    /// Wait until `tid` is current.
    fn wait_until_current<'a>(
        &'a self,
        mut st: MutexGuard<'a, KState>,
        tid: ThreadId,
    ) -> Result<MutexGuard<'a, KState>, Terminated> {
        loop {
            if st.threads[tid].killed {
                return Err(Terminated);
            }
            if st.current == Some(tid) {
                return Ok(st);
            }
            st = self.cv.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// [`Self::wait_until_current`] for the harness thread. Fails if no
    /// thread can run.
    fn root_wait_until_current<'a>(
        &'a self,
        mut st: MutexGuard<'a, KState>,
    ) -> Result<MutexGuard<'a, KState>, PortError> {
        let root = st.root;
        loop {
            if st.current == Some(root) {
                return Ok(st);
            }
            if st.current.is_none() {
                log::error!("no thread can run: {:#?}", st.threads);
                st.cancel_blocking(root);
                st.current = Some(root);
                return Err(PortError::Deadlock);
            }
            st = self.cv.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Reschedule after a state change and wake up parked threads.
    fn commit(&self, st: &mut KState) {
        st.reschedule();
        self.cv.notify_all();
    }

    /// Park the calling host thread until `tid` is scheduled for the first
    /// time.
    pub(crate) fn enter(&self, tid: ThreadId) -> Result<(), Terminated> {
        let st = self.lock();
        drop(self.wait_until_current(st, tid)?);
        log::trace!("thread {tid} entered");
        Ok(())
    }

    /// Called when the host thread backing `tid` is about to return.
    pub(crate) fn exit(&self, tid: ThreadId) {
        let mut st = self.lock();
        log::trace!("thread {tid} exiting");
        if st.threads[tid].state != ThreadState::Dead {
            st.dequeue(tid);
            st.threads[tid].state = ThreadState::Dead;
        }
        self.commit(&mut st);
    }

    /// Invoke `primitive` as `tid`.
    pub(crate) fn invoke(
        &self,
        tid: ThreadId,
        primitive: Primitive,
        cap: CPtr,
        msg: &mut Message,
    ) -> Result<(), Terminated> {
        let mut st = self.lock();
        if st.threads[tid].killed {
            return Err(Terminated);
        }
        debug_assert_eq!(st.current, Some(tid), "invocation by a thread that isn't current");

        log::trace!("thread {tid}: {primitive} {cap}");
        st.do_invoke(tid, primitive, cap, msg);
        self.commit(&mut st);

        let mut st = self.wait_until_current(st, tid)?;
        if let Some(received) = st.threads[tid].inbox.take() {
            *msg = received;
        }
        Ok(())
    }

    /// Let the current thread `tid` be preempted by a thread of the same
    /// priority if its time-slice has elapsed.
    pub(crate) fn preempt_point(&self, tid: ThreadId) -> Result<(), Terminated> {
        let mut st = self.lock();
        if st.threads[tid].killed {
            return Err(Terminated);
        }
        if st.current != Some(tid) {
            drop(self.wait_until_current(st, tid)?);
            return Ok(());
        }

        let tcb = &st.threads[tid];
        if tcb.slice_start.elapsed() < tcb.timeslice {
            return Ok(());
        }

        let prio = tcb.prio;
        match st.best_candidate(Some(tid)) {
            Some(next) if next.prio >= prio => {
                log::trace!("thread {tid}: time-slice expired, switching to {}", next.thread);
                st.threads[tid].stamp = st.stamps.back();
                st.switch_to(Some(next.thread));
                self.cv.notify_all();
                drop(self.wait_until_current(st, tid)?);
            }
            _ => st.threads[tid].slice_start = Instant::now(),
        }
        Ok(())
    }

    pub(crate) fn alloc_endpoint(&self) -> CPtr {
        self.alloc_object(Object::Endpoint(Endpoint::default()))
    }

    pub(crate) fn alloc_notification(&self) -> CPtr {
        self.alloc_object(Object::Notification(Notification::default()))
    }

    fn alloc_object(&self, object: Object) -> CPtr {
        let mut st = self.lock();
        let obj = st.objects.insert(object);
        let root = st.root;
        st.install(root, obj)
    }

    /// Create an inactive thread.
    pub(crate) fn create_thread(
        &self,
        name: &str,
        prio: u8,
        cspace: NewCSpace,
        timeslice: Duration,
    ) -> Result<ThreadId, PortError> {
        let mut st = self.lock();
        let (cspace, owns_cspace) = match cspace {
            NewCSpace::Fresh => (st.cspaces.insert(CSpace { slots: vec![None] }), true),
            NewCSpace::SharedWith(other) => match st.threads.get(other) {
                Some(tcb) if tcb.state != ThreadState::Dead => (tcb.cspace, false),
                _ => return Err(PortError::BadState("sharing the address space of a dead thread")),
            },
        };
        let tid = st.threads.insert(Tcb {
            name: name.to_owned(),
            prio,
            state: ThreadState::Inactive,
            killed: false,
            own_budget: true,
            donor: None,
            reply_to: None,
            inbox: None,
            stamp: 0,
            cspace,
            owns_cspace,
            timeslice,
            slice_start: Instant::now(),
        });
        log::trace!("created thread {tid} '{name}' at priority {prio} in cspace {cspace}");
        Ok(tid)
    }

    /// Copy the harness's capability `cap` into the capability space of
    /// `tid`.
    pub(crate) fn copy_cap(&self, tid: ThreadId, cap: CPtr) -> Result<CPtr, PortError> {
        let mut st = self.lock();
        let root = st.root;
        let obj = st.lookup(root, cap).ok_or(PortError::InvalidCap(cap))?;
        if !st.threads.contains(tid) {
            return Err(PortError::BadState("no such thread"));
        }
        Ok(st.install(tid, obj))
    }

    /// Make an inactive thread ready.
    pub(crate) fn start(&self, tid: ThreadId) -> Result<(), PortError> {
        let mut st = self.lock();
        let tcb = &mut st.threads[tid];
        if tcb.state != ThreadState::Inactive {
            return Err(PortError::BadState("the thread has already been started"));
        }
        tcb.state = ThreadState::Ready;
        st.threads[tid].stamp = st.stamps.back();
        log::trace!("started thread {tid}");
        self.commit(&mut st);
        Ok(())
    }

    pub(crate) fn set_budget(&self, tid: ThreadId, bound: bool) -> Result<(), PortError> {
        let mut st = self.lock();
        let tcb = st
            .threads
            .get_mut(tid)
            .ok_or(PortError::BadState("no such thread"))?;
        if tcb.own_budget == bound {
            return Err(PortError::BadState(if bound {
                "the budget is already bound"
            } else {
                "the budget is already unbound"
            }));
        }
        tcb.own_budget = bound;
        log::trace!("thread {tid}: budget {}", if bound { "bound" } else { "unbound" });
        self.commit(&mut st);
        Ok(())
    }

    /// Put `tid` at the front of its priority's ready queue.
    pub(crate) fn yield_to(&self, tid: ThreadId) -> Result<(), PortError> {
        let mut st = self.lock();
        if st.threads.get(tid).map_or(true, |t| t.state == ThreadState::Dead) {
            return Err(PortError::Terminated);
        }
        st.threads[tid].stamp = st.stamps.front();
        self.commit(&mut st);
        Ok(())
    }

    /// Block the harness thread until a message arrives on `cap`.
    pub(crate) fn root_recv(&self, cap: CPtr) -> Result<Message, PortError> {
        let mut st = self.lock();
        let root = st.root;
        if st.current != Some(root) {
            return Err(PortError::BadState("the harness is not running"));
        }
        let ep = st.endpoint(root, cap).ok_or(PortError::InvalidCap(cap))?;
        st.recv(root, ep);
        self.commit(&mut st);

        let mut st = self.root_wait_until_current(st)?;
        st.threads[root]
            .inbox
            .take()
            .ok_or(PortError::BadState("woken without a message"))
    }

    pub(crate) fn is_alive(&self, tid: ThreadId) -> bool {
        let st = self.lock();
        st.threads.get(tid).map_or(false, |t| {
            !t.killed && !matches!(t.state, ThreadState::Inactive | ThreadState::Dead)
        })
    }

    /// Kill `tid`. Its host thread wakes up and winds down; call
    /// [`Self::reap`] after joining it.
    pub(crate) fn kill(&self, tid: ThreadId) -> Result<(), PortError> {
        let mut st = self.lock();
        let tcb = st.threads.get(tid).ok_or(PortError::BadState("no such thread"))?;
        if tcb.owns_cspace {
            let cspace = tcb.cspace;
            let in_use = st
                .threads
                .iter()
                .any(|(i, t)| i != tid && t.cspace == cspace && t.state != ThreadState::Dead);
            if in_use {
                return Err(PortError::InUse);
            }
        }
        st.kill(tid);
        self.commit(&mut st);
        Ok(())
    }

    /// Kill every thread but the harness.
    pub(crate) fn kill_all(&self) {
        let mut st = self.lock();
        let root = st.root;
        let tids: Vec<_> = st.threads.iter().map(|(i, _)| i).filter(|&i| i != root).collect();
        for tid in tids {
            st.kill(tid);
        }
        st.current = Some(root);
        self.cv.notify_all();
    }

    /// Release a dead thread whose host thread has finished.
    pub(crate) fn reap(&self, tid: ThreadId) {
        let mut st = self.lock();
        if !st.threads.contains(tid) {
            return;
        }
        let tcb = st.threads.remove(tid);
        if tcb.owns_cspace {
            st.cspaces.remove(tcb.cspace);
        }
        log::trace!("reaped thread {tid} '{}'", tcb.name);
    }
}

impl KState {
    fn lookup(&self, tid: ThreadId, cap: CPtr) -> Option<ObjectId> {
        let cspace = self.cspaces.get(self.threads.get(tid)?.cspace)?;
        *cspace.slots.get(cap.0)?
    }

    fn endpoint(&self, tid: ThreadId, cap: CPtr) -> Option<ObjectId> {
        let obj = self.lookup(tid, cap)?;
        matches!(self.objects[obj], Object::Endpoint(_)).then_some(obj)
    }

    fn notification(&self, tid: ThreadId, cap: CPtr) -> Option<ObjectId> {
        let obj = self.lookup(tid, cap)?;
        matches!(self.objects[obj], Object::Notification(_)).then_some(obj)
    }

    fn install(&mut self, tid: ThreadId, obj: ObjectId) -> CPtr {
        let cspace = &mut self.cspaces[self.threads[tid].cspace];
        cspace.slots.push(Some(obj));
        CPtr(cspace.slots.len() - 1)
    }

    fn ep_mut(&mut self, ep: ObjectId) -> &mut Endpoint {
        match &mut self.objects[ep] {
            Object::Endpoint(x) => x,
            Object::Notification(_) => unreachable!(),
        }
    }

    fn ntfn_mut(&mut self, ntfn: ObjectId) -> &mut Notification {
        match &mut self.objects[ntfn] {
            Object::Notification(x) => x,
            Object::Endpoint(_) => unreachable!(),
        }
    }

    fn make_ready(&mut self, tid: ThreadId) {
        self.threads[tid].state = ThreadState::Ready;
        self.threads[tid].stamp = self.stamps.back();
    }

    fn fault(&mut self, tid: ThreadId, primitive: Primitive, cap: CPtr) {
        log::error!(
            "thread {tid} '{}' faulted: {primitive} on invalid capability {cap}",
            self.threads[tid].name
        );
        self.threads[tid].state = ThreadState::Faulted;
    }

    fn do_invoke(&mut self, tid: ThreadId, primitive: Primitive, cap: CPtr, msg: &Message) {
        match primitive {
            Primitive::Null => {}
            Primitive::Reply => self.reply(tid, msg.clone()),
            Primitive::Call | Primitive::Send | Primitive::Recv | Primitive::ReplyRecv
            | Primitive::SignalRecv => {
                let Some(ep) = self.endpoint(tid, cap) else {
                    return self.fault(tid, primitive, cap);
                };
                match primitive {
                    Primitive::Call => self.send(tid, ep, msg.clone(), SendKind::Call),
                    Primitive::Send => self.send(tid, ep, msg.clone(), SendKind::Blocking),
                    Primitive::Recv => self.recv(tid, ep),
                    Primitive::ReplyRecv => {
                        self.reply(tid, msg.clone());
                        self.recv(tid, ep);
                    }
                    _ => {
                        self.send(tid, ep, msg.clone(), SendKind::NonBlocking);
                        self.recv(tid, ep);
                    }
                }
            }
            Primitive::Signal | Primitive::Wait => {
                let Some(ntfn) = self.notification(tid, cap) else {
                    return self.fault(tid, primitive, cap);
                };
                if primitive == Primitive::Signal {
                    self.signal(ntfn);
                } else {
                    self.wait(tid, ntfn);
                }
            }
        }
    }

    fn send(&mut self, tid: ThreadId, ep: ObjectId, msg: Message, kind: SendKind) {
        if let Some(receiver) = self.ep_mut(ep).receivers.pop_front() {
            self.threads[receiver].inbox = Some(msg);
            self.make_ready(receiver);
            if kind == SendKind::Call {
                self.threads[receiver].reply_to = Some(tid);
                self.threads[tid].state = ThreadState::BlockedReply;
                let r = &mut self.threads[receiver];
                if !r.own_budget && r.donor.is_none() {
                    log::trace!("thread {tid} lends its budget to {receiver}");
                    r.donor = Some(tid);
                }
            }
        } else if kind != SendKind::NonBlocking {
            self.threads[tid].state = ThreadState::BlockedSend {
                ep,
                msg,
                call: kind == SendKind::Call,
            };
            self.ep_mut(ep).senders.push_back(tid);
        }
    }

    fn recv(&mut self, tid: ThreadId, ep: ObjectId) {
        if let Some(sender) = self.ep_mut(ep).senders.pop_front() {
            let (msg, call) =
                match std::mem::replace(&mut self.threads[sender].state, ThreadState::Ready) {
                    ThreadState::BlockedSend { msg, call, .. } => (msg, call),
                    state => unreachable!("queued sender {sender} is in state {state:?}"),
                };
            self.threads[tid].inbox = Some(msg);
            if call {
                self.threads[sender].state = ThreadState::BlockedReply;
                self.threads[tid].reply_to = Some(sender);
            } else {
                self.make_ready(sender);
            }
        } else {
            self.threads[tid].state = ThreadState::BlockedRecv { ep };
            self.ep_mut(ep).receivers.push_back(tid);
        }
    }

    fn reply(&mut self, tid: ThreadId, msg: Message) {
        let Some(caller) = self.threads[tid].reply_to.take() else {
            log::trace!("thread {tid}: nothing to reply to");
            return;
        };
        if self.threads[tid].donor == Some(caller) {
            log::trace!("thread {tid} returns the budget of {caller}");
            self.threads[tid].donor = None;
        }
        if let Some(c) = self.threads.get_mut(caller) {
            if c.state == ThreadState::BlockedReply && !c.killed {
                c.inbox = Some(msg);
                self.make_ready(caller);
            }
        }
    }

    fn signal(&mut self, ntfn: ObjectId) {
        match self.ntfn_mut(ntfn).waiters.pop_front() {
            Some(waiter) => self.make_ready(waiter),
            None => self.ntfn_mut(ntfn).pending = true,
        }
    }

    fn wait(&mut self, tid: ThreadId, ntfn: ObjectId) {
        let n = self.ntfn_mut(ntfn);
        if n.pending {
            n.pending = false;
        } else {
            n.waiters.push_back(tid);
            self.threads[tid].state = ThreadState::BlockedWait { ntfn };
        }
    }

    /// Remove `tid` from every wait queue it is in.
    fn dequeue(&mut self, tid: ThreadId) {
        match self.threads[tid].state {
            ThreadState::BlockedSend { ep, .. } => self.ep_mut(ep).senders.retain(|&t| t != tid),
            ThreadState::BlockedRecv { ep } => self.ep_mut(ep).receivers.retain(|&t| t != tid),
            ThreadState::BlockedWait { ntfn } => self.ntfn_mut(ntfn).waiters.retain(|&t| t != tid),
            _ => {}
        }
    }

    /// Abort the blocking invocation of `tid`, leaving it ready.
    fn cancel_blocking(&mut self, tid: ThreadId) {
        self.dequeue(tid);
        self.threads[tid].state = ThreadState::Ready;
    }

    fn kill(&mut self, tid: ThreadId) {
        if self.threads[tid].state != ThreadState::Dead {
            self.dequeue(tid);
        }
        let tcb = &mut self.threads[tid];
        tcb.killed = true;
        tcb.state = ThreadState::Dead;
        tcb.reply_to = None;
        tcb.donor = None;
        for (_, t) in self.threads.iter_mut() {
            if t.donor == Some(tid) {
                t.donor = None;
            }
        }
        if self.current == Some(tid) {
            self.current = None;
        }
        log::trace!("killed thread {tid}");
    }

    fn best_candidate(&self, exclude: Option<ThreadId>) -> Option<Candidate> {
        sched::choose(
            self.threads
                .iter()
                .filter(|&(i, t)| Some(i) != exclude && t.is_schedulable())
                .map(|(i, t)| Candidate {
                    thread: i,
                    prio: t.prio,
                    stamp: t.stamp,
                }),
        )
    }

    fn switch_to(&mut self, next: Option<ThreadId>) {
        if next != self.current {
            log::trace!("switch: {:?} -> {:?}", self.current, next);
        }
        self.current = next;
        if let Some(next) = next {
            self.threads[next].slice_start = Instant::now();
        }
    }

    /// Choose the thread to run after a state change.
    fn reschedule(&mut self) {
        let current = self
            .current
            .filter(|&c| self.threads.get(c).map_or(false, Tcb::is_schedulable));
        match (current, self.best_candidate(current)) {
            (Some(c), Some(best)) if sched::preempts(&best, self.threads[c].prio) => {
                // Preempted threads resume before their peers
                self.threads[c].stamp = self.stamps.front();
                self.switch_to(Some(best.thread));
            }
            (Some(_), _) => {}
            (None, best) => self.switch_to(best.map(|b| b.thread)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendKind {
    Call,
    Blocking,
    NonBlocking,
}
