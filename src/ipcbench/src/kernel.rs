//! The kernel primitive interface used by benchmark execution contexts.
//!
//! The engine never looks inside a primitive invocation. A port provides an
//! [`Ipc`] implementation per execution context; the benchmark roles in
//! [`crate::roles`] bracket its calls with the timing probe.
use arrayvec::ArrayVec;
use core::fmt;

/// A machine word as carried in a message register.
///
/// Ports for 32-bit targets only ever store values below `2^32`.
pub type Word = u64;

/// The maximum number of message registers in one message.
pub const MSG_MAX_LENGTH: usize = 120;

/// A capability index in the capability space of an execution context.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CPtr(pub usize);

impl CPtr {
    /// The null capability. Invoking it is only meaningful for
    /// [`Ipc::invoke_nop`].
    pub const NULL: Self = Self(0);
}

impl fmt::Debug for CPtr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CPtr({})", self.0)
    }
}

impl fmt::Display for CPtr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A kernel primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    /// Send a message and block until the receiver replies. Donates the
    /// caller's scheduling budget to a receiver that has none.
    Call,
    /// Send a message, blocking until a receiver takes it.
    Send,
    /// Block until a message arrives.
    Recv,
    /// Reply to the most recently received call. Never blocks.
    Reply,
    /// [`Self::Reply`] followed by [`Self::Recv`] in a single invocation.
    ReplyRecv,
    /// Non-blocking send followed by [`Self::Recv`] on the same endpoint.
    SignalRecv,
    /// Set the notification word of a notification object. Never blocks.
    Signal,
    /// Block until a notification object is signaled.
    Wait,
    /// Enter and leave the kernel without doing anything.
    Null,
}

impl Primitive {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Send => "send",
            Self::Recv => "recv",
            Self::Reply => "reply",
            Self::ReplyRecv => "reply+recv",
            Self::SignalRecv => "signal+recv",
            Self::Signal => "signal",
            Self::Wait => "wait",
            Self::Null => "null",
        }
    }

    /// Returns `true` if the primitive may block the invoker.
    pub fn may_block(self) -> bool {
        !matches!(self, Self::Reply | Self::Signal | Self::Null)
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The contents of the message registers plus the message label.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub label: Word,
    pub words: ArrayVec<Word, MSG_MAX_LENGTH>,
}

impl Message {
    pub fn new(label: Word) -> Self {
        Self {
            label,
            words: ArrayVec::new(),
        }
    }

    /// Construct a message carrying `length` words. The payload is
    /// irrelevant to the benchmarks; each register holds its own index.
    ///
    /// # Panics
    ///
    /// Panics if `length` exceeds [`MSG_MAX_LENGTH`].
    pub fn with_length(label: Word, length: usize) -> Self {
        assert!(length <= MSG_MAX_LENGTH, "message too long: {length}");
        Self {
            label,
            words: (0..length as Word).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// Returned by a blocking invocation when the calling execution context was
/// destroyed while blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("The execution context was terminated.")]
pub struct Terminated;

/// The primitive invocation interface of one execution context.
pub trait Ipc {
    /// Invoke `primitive` on the object designated by `cap`.
    ///
    /// `msg` carries the outgoing message and receives the incoming one for
    /// primitives that receive. Kernel-level failures of the invocation
    /// itself are not reported; a benchmark that misuses a primitive hangs.
    fn invoke(&self, primitive: Primitive, cap: CPtr, msg: &mut Message) -> Result<(), Terminated>;

    /// A stand-in for [`Self::invoke`] with the same argument setup and an
    /// inert trap. Used to measure instrumentation overhead.
    fn invoke_nop(&self, primitive: Primitive, cap: CPtr, msg: &mut Message);

    /// A point where an idle loop may be preempted or terminated. On a real
    /// kernel this does nothing and never fails.
    fn preempt_point(&self) -> Result<(), Terminated>;
}

impl<T: Ipc + ?Sized> Ipc for &T {
    #[inline(always)]
    fn invoke(&self, primitive: Primitive, cap: CPtr, msg: &mut Message) -> Result<(), Terminated> {
        (**self).invoke(primitive, cap, msg)
    }

    #[inline(always)]
    fn invoke_nop(&self, primitive: Primitive, cap: CPtr, msg: &mut Message) {
        (**self).invoke_nop(primitive, cap, msg)
    }

    #[inline(always)]
    fn preempt_point(&self) -> Result<(), Terminated> {
        (**self).preempt_point()
    }
}
