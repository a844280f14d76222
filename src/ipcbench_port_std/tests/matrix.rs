//! Runs the benchmark matrix on the simulated kernel.
use assert_matches::assert_matches;
use ipcbench::{
    calibrate::OverheadPolicy,
    harness::Anomaly,
    port::{AddressSpace, Port, PortError, ProcessConfig},
    roles::Role,
    BenchConfig, Harness, Matrix,
};
use ipcbench_port_std::StdPort;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config() -> BenchConfig {
    BenchConfig {
        runs: 3,
        warmups: 4,
        overhead_policy: OverheadPolicy::Tolerant,
        ..BenchConfig::default()
    }
}

#[test]
fn full_matrix() {
    init_logger();
    let config = config();
    let matrix = Matrix::standard(config.long_message_length);
    let mut harness = Harness::new(StdPort::new(), config);

    let results = harness.run(&matrix).unwrap();

    assert_eq!(results.scenarios.len(), matrix.len());
    for (result, scenario) in results.scenarios.iter().zip(&matrix) {
        assert_eq!(result.descriptor, *scenario);
        assert_eq!(result.raw.len(), 3, "{}", scenario.name);
        assert_eq!(result.samples.len(), 3, "{}", scenario.name);
        let summary = result.summary.as_ref().unwrap();
        assert!(summary.min <= summary.max, "{}: {summary}", scenario.name);
        assert_eq!(
            result.overhead,
            results.calibration.baselines.class(scenario.overhead)
        );
    }

    let null_syscall = results.null_syscall.unwrap();
    assert_eq!(null_syscall.result.samples.len(), 3);
}

#[test]
fn harness_is_reusable() {
    init_logger();
    let config = BenchConfig {
        null_syscall: false,
        ..config()
    };
    let matrix = Matrix::standard(config.long_message_length)
        .filter(|s| s.name == "Inter-AS Call" || s.name == "Signal to high prio thread");
    assert_eq!(matrix.len(), 2);
    let mut harness = Harness::new(StdPort::new(), config);

    for _ in 0..2 {
        let results = harness.run(&matrix).unwrap();
        assert!(results.null_syscall.is_none());
        assert!(results.get("Inter-AS Call").is_some());
        assert!(results.get("Signal to high prio thread").is_some());
    }
}

#[test]
fn signal_to_lower_priority_waiter() {
    init_logger();
    let config = BenchConfig {
        null_syscall: false,
        ..config()
    };
    let matrix = Matrix::standard(config.long_message_length)
        .filter(|s| s.name.starts_with("Signal to"));
    assert_eq!(matrix.len(), 2);
    let results = Harness::new(StdPort::new(), config).run(&matrix).unwrap();

    let result = results.get("Signal to low prio thread").unwrap();
    assert!(result.descriptor.server_prio < result.descriptor.client_prio);
    assert_eq!(result.raw.len(), 3);
    assert!(result.summary.is_some());
    assert!(!result
        .anomalies
        .iter()
        .any(|a| matches!(a, Anomaly::SignFlip { .. })));
}

#[test]
fn donation_in_shared_address_space() {
    init_logger();
    let config = config();
    let matrix = Matrix::standard(config.long_message_length)
        .filter(|s| s.same_sc && s.same_vspace);
    assert!(!matrix.is_empty());
    let results = Harness::new(StdPort::new(), config).run(&matrix).unwrap();
    assert!(results.scenarios.iter().all(|s| s.summary.is_some()));
}

#[test]
fn priority_above_maximum() {
    let mut port = StdPort::new();
    let priority = StdPort::MAX_PRIO + 1;
    assert_matches!(
        port.configure(&ProcessConfig {
            name: "client",
            role: Role::Client,
            priority,
            address_space: AddressSpace::Fresh,
            timeslice_us: 1000,
        }),
        Err(PortError::BadPriority(p)) if p == priority
    );
}

#[test]
fn shared_address_space_teardown() {
    let mut port = StdPort::new();
    let client = port
        .configure(&ProcessConfig {
            name: "client",
            role: Role::Client,
            priority: 100,
            address_space: AddressSpace::Fresh,
            timeslice_us: 1000,
        })
        .unwrap();
    let server = port
        .configure(&ProcessConfig {
            name: "server",
            role: Role::Server,
            priority: 100,
            address_space: AddressSpace::SharedWith(&client),
            timeslice_us: 1000,
        })
        .unwrap();

    assert!(!port.is_alive(&client));
    port.destroy(server).unwrap();
    port.destroy(client).unwrap();
}
