//! The scenario table.
use core::fmt;

use crate::{
    calibrate::OverheadClass,
    roles::{Leg, RoleFn, Wake},
};

/// The priority of both contexts in equal-priority scenarios.
pub const DEFAULT_PRIO: u8 = 100;
/// The lower priority used by unequal-priority scenarios.
pub const LOW_PRIO: u8 = 50;
/// The priority of the waiter in the signal-to-higher-priority scenario.
pub const HIGH_PRIO: u8 = 200;
/// The priority of the dummy context, below both benchmark contexts.
pub const DUMMY_PRIO: u8 = 50;

/// Selects which side supplies the start and which the end timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The client supplies the start, the server the end timestamp.
    ClientToServer,
    /// The server supplies the start, the client the end timestamp.
    ServerToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::ClientToServer => "client --> server",
            Self::ServerToClient => "server --> client",
        })
    }
}

/// A scenario of the benchmark matrix. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioDescriptor {
    pub name: String,
    pub caption: &'static str,
    pub direction: Direction,
    pub client_fn: RoleFn,
    pub server_fn: RoleFn,
    /// The server shares the client's address space and capability space.
    pub same_vspace: bool,
    /// The server runs on the client's scheduling budget.
    pub same_sc: bool,
    pub client_prio: u8,
    pub server_prio: u8,
    /// Start an idle dummy context at this priority.
    pub dummy_prio: Option<u8>,
    /// The number of message words exchanged per invocation.
    pub length: usize,
    pub overhead: OverheadClass,
}

impl ScenarioDescriptor {
    /// An inter-AS call/reply scenario between equal-priority contexts.
    fn call(name: impl Into<String>, caption: &'static str, leg: Leg) -> Self {
        let direction = match leg {
            Leg::Call => Direction::ClientToServer,
            Leg::Reply => Direction::ServerToClient,
        };
        Self {
            name: name.into(),
            caption,
            direction,
            client_fn: RoleFn::Caller { leg, length: 0 },
            server_fn: RoleFn::ReplyRecvServer { leg, length: 0 },
            same_vspace: false,
            same_sc: false,
            client_prio: DEFAULT_PRIO,
            server_prio: DEFAULT_PRIO,
            dummy_prio: None,
            length: 0,
            overhead: OverheadClass::CallReplyRecv,
        }
    }

    /// A scenario in which the server waits on the notification signaled by
    /// the client.
    fn signal(name: impl Into<String>, server_prio: u8, wake: Wake) -> Self {
        Self {
            name: name.into(),
            caption: "Signal test",
            direction: Direction::ClientToServer,
            client_fn: RoleFn::Signaler { wake },
            server_fn: RoleFn::Waiter { wake },
            same_vspace: false,
            same_sc: false,
            client_prio: DEFAULT_PRIO,
            server_prio,
            dummy_prio: None,
            length: 0,
            overhead: OverheadClass::Signal,
        }
    }

    fn intra_as(self) -> Self {
        Self {
            same_vspace: true,
            ..self
        }
    }

    fn prios(self, client_prio: u8, server_prio: u8) -> Self {
        Self {
            client_prio,
            server_prio,
            ..self
        }
    }

    /// Exchange `length`-word messages.
    fn long(self, length: usize) -> Self {
        let (client_fn, server_fn) = match (self.client_fn, self.server_fn) {
            (RoleFn::Caller { leg, .. }, RoleFn::ReplyRecvServer { .. }) => (
                RoleFn::Caller { leg, length },
                RoleFn::ReplyRecvServer { leg, length },
            ),
            other => other,
        };
        Self {
            client_fn,
            server_fn,
            length,
            overhead: OverheadClass::CallReplyRecv10,
            ..self
        }
    }

    fn donating(self) -> Self {
        Self {
            same_sc: true,
            ..self
        }
    }

    fn with_dummy(self, prio: u8) -> Self {
        Self {
            dummy_prio: Some(prio),
            ..self
        }
    }

    pub fn is_long(&self) -> bool {
        self.length > 0
    }
}

impl fmt::Display for ScenarioDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}: IPC duration ({}), client prio: {:3} server prio {:3}, {} vspace, \
             {} sched context, length {:2}",
            self.name,
            self.direction,
            self.client_prio,
            self.server_prio,
            if self.same_vspace { "same" } else { "diff" },
            if self.same_sc { "same" } else { "diff" },
            self.length,
        )?;
        if let Some(prio) = self.dummy_prio {
            write!(f, ", dummy prio {prio:3}")?;
        }
        Ok(())
    }
}

/// An ordered set of scenarios.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matrix {
    scenarios: Vec<ScenarioDescriptor>,
}

impl Matrix {
    /// The standard scenario table. Long-message scenarios exchange
    /// `long_length` words.
    pub fn standard(long_length: usize) -> Self {
        use self::ScenarioDescriptor as S;
        use Leg::{Call, Reply};
        let (p, lo, hi) = (DEFAULT_PRIO, LOW_PRIO, HIGH_PRIO);
        let n = long_length;

        let scenarios = vec![
            S::call("Intra-AS Call", "Call+ReplyRecv Intra-AS test 1", Call).intra_as(),
            S::call("Intra-AS ReplyRecv", "Call+ReplyRecv Intra-AS test 2", Reply).intra_as(),
            S::call("Inter-AS Call", "Call+ReplyRecv Inter-AS test 1", Call),
            S::call("Inter-AS ReplyRecv", "Call+ReplyRecv Inter-AS test 2", Reply),
            S::call(
                "Inter-AS Call (Low to High)",
                "Call+ReplyRecv Different prio test 1",
                Call,
            )
            .prios(lo, p),
            S::call(
                "Inter-AS ReplyRecv (High to Low)",
                "Call+ReplyRecv Different prio test 4",
                Reply,
            )
            .prios(lo, p),
            S::call(
                "Inter-AS Call (High to Low)",
                "Call+ReplyRecv Different prio test 3",
                Call,
            )
            .prios(p, lo),
            S::call(
                "Inter-AS ReplyRecv (Low to High)",
                "Call+ReplyRecv Different prio test 2",
                Reply,
            )
            .prios(p, lo),
            S {
                name: "Inter-AS Send".into(),
                caption: "Send test",
                client_fn: RoleFn::Sender,
                server_fn: RoleFn::Receiver,
                overhead: OverheadClass::SendRecv,
                ..S::call("", "", Call)
            },
            S::call(
                format!("Inter-AS Call({n})"),
                "Call+ReplyRecv long message test 1",
                Call,
            )
            .long(n),
            S::call(
                format!("Inter-AS ReplyRecv({n})"),
                "Call+ReplyRecv long message test 2",
                Reply,
            )
            .long(n),
            S::call(
                "Intra-AS Call (same SC)",
                "Call+ReplyRecv donation test 1",
                Call,
            )
            .intra_as()
            .donating(),
            S::call(
                "Intra-AS ReplyRecv (same SC)",
                "Call+ReplyRecv donation test 2",
                Reply,
            )
            .intra_as()
            .donating(),
            S::call(
                "Inter-AS Call (same SC)",
                "Call+ReplyRecv donation test 3",
                Call,
            )
            .donating(),
            S::call(
                "Inter-AS ReplyRecv (same SC)",
                "Call+ReplyRecv donation test 4",
                Reply,
            )
            .donating(),
            S::call(
                "Inter-AS Call (same SC, dummy)",
                "Call+ReplyRecv donation with dummy test 1",
                Call,
            )
            .donating()
            .with_dummy(DUMMY_PRIO),
            S::call(
                "Inter-AS ReplyRecv (same SC, dummy)",
                "Call+ReplyRecv donation with dummy test 2",
                Reply,
            )
            .donating()
            .with_dummy(DUMMY_PRIO),
            S::signal("Signal to high prio thread", hi, Wake::Preempt),
            S::signal("Signal to low prio thread", lo, Wake::Handoff),
        ];

        Self { scenarios }
    }

    pub fn from_scenarios(scenarios: Vec<ScenarioDescriptor>) -> Self {
        Self { scenarios }
    }

    /// Keep only the scenarios for which `pred` returns `true`.
    pub fn filter(self, mut pred: impl FnMut(&ScenarioDescriptor) -> bool) -> Self {
        Self {
            scenarios: self.scenarios.into_iter().filter(|s| pred(s)).collect(),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ScenarioDescriptor> {
        self.scenarios.iter()
    }

    pub fn get(&self, index: usize) -> Option<&ScenarioDescriptor> {
        self.scenarios.get(index)
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}

impl<'a> IntoIterator for &'a Matrix {
    type Item = &'a ScenarioDescriptor;
    type IntoIter = std::slice::Iter<'a, ScenarioDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.scenarios.iter()
    }
}
