//! Thread selection for the simulated uniprocessor.
//!
//! The schedulable thread with the highest priority runs. Threads of equal
//! priority are ordered by a *stamp*: a thread entering the ready state is
//! stamped at the back of the queue, and a thread that is preempted or yielded
//! to is stamped at the front.

/// Issues queue positions.
#[derive(Debug)]
pub(crate) struct Stamps {
    front: i64,
    back: i64,
}

impl Stamps {
    pub(crate) const fn new() -> Self {
        Self { front: 0, back: 0 }
    }

    /// A position ahead of every position issued so far.
    pub(crate) fn front(&mut self) -> i64 {
        self.front -= 1;
        self.front
    }

    /// A position behind every position issued so far.
    pub(crate) fn back(&mut self) -> i64 {
        self.back += 1;
        self.back
    }
}

/// A schedulable thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Candidate {
    pub(crate) thread: usize,
    pub(crate) prio: u8,
    pub(crate) stamp: i64,
}

/// Choose the thread to run among `candidates`.
pub(crate) fn choose(candidates: impl IntoIterator<Item = Candidate>) -> Option<Candidate> {
    candidates
        .into_iter()
        .max_by(|a, b| a.prio.cmp(&b.prio).then(b.stamp.cmp(&a.stamp)))
}

/// Decide whether the running thread `current` should be preempted by
/// `best`. Only a strictly higher priority preempts.
pub(crate) fn preempts(best: &Candidate, current_prio: u8) -> bool {
    best.prio > current_prio
}
