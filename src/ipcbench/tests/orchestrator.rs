//! Drives the harness against an instrumented fake port that records every
//! operation and plays back scripted results.
use assert_matches::assert_matches;
use ipcbench::{
    calibrate::OverheadClass,
    counter::{CounterEvent, CounterWidth, ProbeError},
    harness::Anomaly,
    kernel::{CPtr, Message, Primitive, Terminated},
    matrix::Matrix,
    orchestrator::{Orchestrator, Phase, ProtocolViolation, SharedObjects},
    port::{AddressSpace, PortError, ProcessConfig},
    roles::{Role, RoleArgs, RoleFn},
    BenchConfig, BenchError, CycleCounter, Harness, Ipc, Port, Probe, TimingSample,
};
use std::{cell::Cell, collections::VecDeque, rc::Rc};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone)]
struct FakeCounter(Rc<Cell<u64>>);

impl CycleCounter for FakeCounter {
    const WIDTH: CounterWidth = CounterWidth::Bits64;

    fn num_event_counters(&self) -> usize {
        0
    }

    fn set_count_event(&mut self, _: usize, event: CounterEvent) -> Result<(), ProbeError> {
        Err(ProbeError::UnsupportedEvent(event))
    }

    fn start_counters(&mut self, _: u32) {}

    fn reset_counters(&mut self, _: u32) {}

    fn read_cycles(&self) -> TimingSample {
        self.0.get()
    }
}

/// The harness's primitive interface. No-op invocations advance the counter
/// by a fixed cost per primitive.
#[derive(Debug)]
struct FakeIpc(Rc<Cell<u64>>);

fn nop_cost(primitive: Primitive) -> u64 {
    match primitive {
        Primitive::Call => 30,
        Primitive::ReplyRecv => 20,
        Primitive::Send => 5,
        Primitive::Recv => 7,
        Primitive::Signal => 3,
        Primitive::Null => 1,
        _ => unreachable!(),
    }
}

impl Ipc for FakeIpc {
    fn invoke(&self, primitive: Primitive, _: CPtr, _: &mut Message) -> Result<(), Terminated> {
        assert_eq!(primitive, Primitive::Null);
        self.0.set(self.0.get() + 2);
        Ok(())
    }

    fn invoke_nop(&self, primitive: Primitive, _: CPtr, msg: &mut Message) {
        self.0.set(self.0.get() + nop_cost(primitive) + msg.len() as u64);
    }

    fn preempt_point(&self) -> Result<(), Terminated> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Configure { role: Role, prio: u8, shared: bool },
    CopyCap(Role),
    Spawn(Role, RoleFn),
    Unbind(Role),
    Bind(Role),
    YieldTo(Role),
    RecvReady,
    RecvResult,
    Destroy(Role),
}

#[derive(Debug)]
struct FakePort {
    ipc: FakeIpc,
    counter: Rc<Cell<u64>>,
    events: Vec<Event>,
    processes: Vec<(Role, bool)>,
    next_cap: usize,
    objects: Option<SharedObjects>,
    results: VecDeque<Message>,
    client_sample: TimingSample,
    server_sample: TimingSample,
    server_first: bool,
    kill_dummy: bool,
}

impl FakePort {
    fn new(client_sample: TimingSample, server_sample: TimingSample) -> Self {
        let counter = Rc::new(Cell::new(0));
        Self {
            ipc: FakeIpc(Rc::clone(&counter)),
            counter,
            events: Vec::new(),
            processes: Vec::new(),
            next_cap: 1,
            objects: None,
            results: VecDeque::new(),
            client_sample,
            server_sample,
            server_first: false,
            kill_dummy: false,
        }
    }

    fn alloc_cap(&mut self) -> CPtr {
        self.next_cap += 1;
        CPtr(self.next_cap)
    }

    fn role(&self, process: &usize) -> Role {
        self.processes[*process].0
    }

    fn report(role: Role, sample: TimingSample) -> Message {
        let mut msg = Message::new(role.label());
        // 64-bit words, one register
        msg.words.push(sample);
        msg
    }
}

impl Port for FakePort {
    type Process = usize;
    type Ipc = FakeIpc;
    type Counter = FakeCounter;

    const MAX_PRIO: u8 = 254;

    fn ipc(&self) -> &FakeIpc {
        &self.ipc
    }

    fn counter(&self) -> Result<FakeCounter, ProbeError> {
        Ok(FakeCounter(Rc::clone(&self.counter)))
    }

    fn alloc_endpoint(&mut self) -> Result<CPtr, PortError> {
        Ok(self.alloc_cap())
    }

    fn alloc_notification(&mut self) -> Result<CPtr, PortError> {
        Ok(self.alloc_cap())
    }

    fn configure(&mut self, config: &ProcessConfig<'_, usize>) -> Result<usize, PortError> {
        self.events.push(Event::Configure {
            role: config.role,
            prio: config.priority,
            shared: matches!(config.address_space, AddressSpace::SharedWith(_)),
        });
        self.processes.push((config.role, false));
        Ok(self.processes.len() - 1)
    }

    fn copy_cap(&mut self, process: &usize, _: CPtr) -> Result<CPtr, PortError> {
        self.events.push(Event::CopyCap(self.role(process)));
        Ok(self.alloc_cap())
    }

    fn spawn(
        &mut self,
        process: &usize,
        entry: RoleFn,
        role: Role,
        _: &RoleArgs,
        _: &Probe<FakeCounter>,
    ) -> Result<(), PortError> {
        assert_eq!(self.role(process), role);
        self.events.push(Event::Spawn(role, entry));
        self.processes[*process].1 = !(role == Role::Dummy && self.kill_dummy);

        if role == Role::Client {
            let client = Self::report(Role::Client, self.client_sample);
            let server = Self::report(Role::Server, self.server_sample);
            if self.server_first {
                self.results.extend([server, client]);
            } else {
                self.results.extend([client, server]);
            }
        }
        Ok(())
    }

    fn unbind_budget(&mut self, process: &usize) -> Result<(), PortError> {
        self.events.push(Event::Unbind(self.role(process)));
        Ok(())
    }

    fn bind_budget(&mut self, process: &usize) -> Result<(), PortError> {
        self.events.push(Event::Bind(self.role(process)));
        Ok(())
    }

    fn yield_to(&mut self, process: &usize) -> Result<(), PortError> {
        self.events.push(Event::YieldTo(self.role(process)));
        Ok(())
    }

    fn recv(&mut self, ep: CPtr) -> Result<Message, PortError> {
        let objects = self.objects.expect("shared objects were not set");
        if ep == objects.ep {
            self.events.push(Event::RecvReady);
            Ok(Message::new(Role::Server.label()))
        } else if ep == objects.result_ep {
            self.events.push(Event::RecvResult);
            self.results.pop_front().ok_or(PortError::Deadlock)
        } else {
            Err(PortError::InvalidCap(ep))
        }
    }

    fn is_alive(&self, process: &usize) -> bool {
        self.processes[*process].1
    }

    fn destroy(&mut self, process: usize) -> Result<(), PortError> {
        self.events.push(Event::Destroy(self.role(&process)));
        self.processes[process].1 = false;
        Ok(())
    }
}

fn config(runs: usize) -> BenchConfig {
    BenchConfig {
        runs,
        warmups: 4,
        null_syscall: false,
        ..BenchConfig::default()
    }
}

/// Harness-side capabilities as allocated by `Harness::run` on a fresh
/// `FakePort`.
const OBJECTS: SharedObjects = SharedObjects {
    ep: CPtr(2),
    result_ep: CPtr(3),
    ntfn: CPtr(4),
};

fn run_matrix(
    port: FakePort,
    name: &str,
    runs: usize,
) -> (FakePort, Result<ipcbench::ResultSet, BenchError>) {
    init_logger();
    let mut port = port;
    port.objects = Some(OBJECTS);
    let matrix = Matrix::standard(10).filter(|s| s.name == name);
    assert_eq!(matrix.len(), 1, "no scenario named {name:?}");
    let mut harness = Harness::new(port, config(runs));
    let result = harness.run(&matrix);
    (harness.into_port(), result)
}

#[test]
fn donation_in_shared_address_space() {
    let (port, result) = run_matrix(FakePort::new(100, 160), "Intra-AS Call (same SC)", 3);
    let results = result.unwrap();

    let one_repetition = [
        Event::Configure {
            role: Role::Client,
            prio: 100,
            shared: false,
        },
        Event::CopyCap(Role::Client),
        Event::CopyCap(Role::Client),
        Event::CopyCap(Role::Client),
        Event::Configure {
            role: Role::Server,
            prio: 100,
            shared: true,
        },
        Event::Spawn(
            Role::Server,
            RoleFn::ReplyRecvServer {
                leg: ipcbench::roles::Leg::Call,
                length: 0,
            },
        ),
        Event::RecvReady,
        Event::Unbind(Role::Server),
        Event::Spawn(
            Role::Client,
            RoleFn::Caller {
                leg: ipcbench::roles::Leg::Call,
                length: 0,
            },
        ),
        Event::YieldTo(Role::Client),
        Event::RecvResult,
        Event::Bind(Role::Server),
        Event::RecvResult,
        Event::Destroy(Role::Server),
        Event::Destroy(Role::Client),
    ];
    let expected: Vec<Event> = one_repetition
        .iter()
        .copied()
        .cycle()
        .take(one_repetition.len() * 3)
        .collect();
    assert_eq!(port.events, expected);

    let result = &results.scenarios[0];
    let overhead = results.calibration.baselines.class(OverheadClass::CallReplyRecv);
    assert_eq!(overhead, 20);
    assert_eq!(result.overhead, overhead);
    assert_eq!(result.raw.as_slice(), &[60, 60, 60]);
    assert_eq!(result.samples.as_slice(), &[40, 40, 40]);
    assert!(result.stable);
    assert!(result.anomalies.is_empty());
}

#[test]
fn send_uses_send_recv_baseline() {
    let (_, result) = run_matrix(FakePort::new(1000, 1050), "Inter-AS Send", 2);
    let results = result.unwrap();
    let result = results.get("Inter-AS Send").unwrap();

    // min(send = 5, recv = 7)
    assert_eq!(result.overhead, 5);
    assert_eq!(result.samples.as_slice(), &[45, 45]);
    assert_eq!(result.summary.unwrap().min, 45);
}

#[test]
fn reply_direction_takes_start_from_server() {
    // The client reports the end timestamp
    let (_, result) = run_matrix(FakePort::new(500, 420), "Inter-AS ReplyRecv", 2);
    let results = result.unwrap();
    let result = &results.scenarios[0];
    assert_eq!(result.raw.as_slice(), &[80, 80]);
    assert!(result.anomalies.is_empty());
}

#[test]
fn long_scenario_uses_long_baseline() {
    let (_, result) = run_matrix(FakePort::new(0, 100), "Inter-AS Call(10)", 2);
    let results = result.unwrap();
    // min(call-10 = 40, reply+recv-10 = 30)
    assert_eq!(results.scenarios[0].overhead, 30);
    assert_eq!(results.scenarios[0].samples.as_slice(), &[70, 70]);
}

#[test]
fn sign_flip_is_reported() {
    let (_, result) = run_matrix(FakePort::new(500, 420), "Inter-AS Call", 2);
    let results = result.unwrap();
    let result = &results.scenarios[0];
    assert_eq!(result.raw.as_slice(), &[80, 80]);
    assert_eq!(
        result.anomalies,
        [
            Anomaly::SignFlip {
                run: 0,
                start: 500,
                end: 420
            },
            Anomaly::SignFlip {
                run: 1,
                start: 500,
                end: 420
            },
        ]
    );
}

#[test]
fn samples_below_overhead_are_reported() {
    let (_, result) = run_matrix(FakePort::new(100, 105), "Inter-AS Call", 2);
    let results = result.unwrap();
    let result = &results.scenarios[0];
    assert_eq!(result.overhead, 20);
    assert_eq!(result.raw.as_slice(), &[5, 5]);
    assert_eq!(result.samples.as_slice(), &[0, 0]);
    assert_eq!(result.anomalies, [Anomaly::BelowOverhead { count: 2 }]);
}

#[test]
fn expected_sign_flip_is_not_reported() {
    init_logger();
    let mut port = FakePort::new(500, 420);
    port.objects = Some(OBJECTS);
    let matrix = Matrix::standard(10).filter(|s| s.name == "Inter-AS Call");
    let mut harness = Harness::new(
        port,
        BenchConfig {
            expected_sign_flips: vec!["Inter-AS Call".to_owned()],
            ..config(2)
        },
    );
    let results = harness.run(&matrix).unwrap();
    assert!(results.scenarios[0].anomalies.is_empty());
}

#[test]
fn dummy_is_torn_down_last() {
    let (port, result) = run_matrix(FakePort::new(0, 10), "Inter-AS Call (same SC, dummy)", 2);
    result.unwrap();

    let spawns: Vec<_> = port
        .events
        .iter()
        .filter_map(|e| match e {
            Event::Spawn(role, _) => Some(*role),
            _ => None,
        })
        .take(3)
        .collect();
    assert_eq!(spawns, [Role::Dummy, Role::Server, Role::Client]);
    assert!(port.events.contains(&Event::Spawn(Role::Dummy, RoleFn::Idle)));

    let destroys: Vec<_> = port
        .events
        .iter()
        .filter_map(|e| match e {
            Event::Destroy(role) => Some(*role),
            _ => None,
        })
        .collect();
    assert_eq!(
        destroys,
        [
            Role::Server,
            Role::Client,
            Role::Dummy,
            Role::Server,
            Role::Client,
            Role::Dummy
        ]
    );
}

#[test]
fn dead_dummy_is_detected() {
    let mut port = FakePort::new(0, 10);
    port.kill_dummy = true;
    let (_, result) = run_matrix(port, "Inter-AS Call (same SC, dummy)", 2);
    assert_matches!(result, Err(BenchError::Protocol(ProtocolViolation::DummyDied)));
}

#[test]
fn server_result_first_is_a_violation() {
    init_logger();
    let mut port = FakePort::new(100, 160);
    port.server_first = true;
    port.objects = Some(OBJECTS);

    let matrix = Matrix::standard(10);
    let scenario = matrix.get(0).unwrap();
    let config = config(2);
    let probe = Probe::init(port.counter().unwrap(), &[]).unwrap();

    let mut orchestrator = Orchestrator::new(&mut port, scenario, OBJECTS, &probe, &config);
    assert_matches!(
        orchestrator.run(),
        Err(BenchError::Protocol(ProtocolViolation::ServerBeforeClient))
    );
    assert_eq!(orchestrator.phase(), Phase::ClientStarted);
    assert_eq!(
        orchestrator.trace(),
        [
            Phase::Configuring,
            Phase::ClientConfigured,
            Phase::ServerConfigured,
            Phase::ServerStarted,
            Phase::ServerInitialized,
            Phase::ClientStarted,
        ]
    );
}

#[test]
fn invalid_config_is_rejected_before_anything_runs() {
    let mut harness = Harness::new(FakePort::new(0, 0), config(1));
    assert_matches!(harness.run(&Matrix::standard(10)), Err(BenchError::Config(_)));
    assert!(harness.port().events.is_empty());
}
