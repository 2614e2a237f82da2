//! Integration tests for workers scheduled by a container.
//!
//! These tests verify that:
//! - A producer/consumer pipeline delivers every buffer in order
//! - A relay forwards input buffers to its output without copying
//! - Port callbacks run in place of the worker
//! - Round-robin circuits bind to several consumer workers
//! - Resetting a worker hands its buffers back
//! - Disconnecting a circuit unbinds its ports and releases its templates

use conduit::circuit::PortRef;
use conduit::prelude::*;
use parking_lot::Mutex;
use std::sync::Arc;

fn container(name: &str) -> Container {
    let ctx = TransportContext::with_pio(TransportConfig::default().with_smb_size(1 << 20));
    Container::new(name, ctx).unwrap()
}

/// Producer sending `count` buffers with opcode = index, then end-of-stream.
fn producer(count: u32) -> impl FnMut(&mut RunContext<'_>, bool) -> RunResult + Send + 'static {
    let mut sent = 0u32;
    move |ctx: &mut RunContext<'_>, _: bool| {
        if sent == count {
            return if ctx.end_of_stream(0) { RunResult::Done } else { RunResult::Ok };
        }
        let Some(buf) = ctx.output(0) else {
            return RunResult::Ok;
        };
        buf[..4].copy_from_slice(&sent.to_le_bytes());
        ctx.set_output(0, 4, sent);
        sent += 1;
        RunResult::Advance
    }
}

/// Consumer recording opcodes into `log` until end-of-stream.
fn consumer(log: &Arc<Mutex<Vec<u32>>>) -> impl FnMut(&mut RunContext<'_>, bool) -> RunResult + Send + 'static {
    let log = Arc::clone(log);
    move |ctx: &mut RunContext<'_>, _: bool| {
        let Some(meta) = ctx.input_metadata(0) else {
            return RunResult::Ok;
        };
        if meta.is_end_of_stream() {
            ctx.release(0);
            return RunResult::Done;
        }
        let payload = ctx.input(0).map(|d| d.to_vec()).unwrap_or_default();
        assert_eq!(payload, meta.opcode.to_le_bytes());
        log.lock().push(meta.opcode);
        RunResult::Advance
    }
}

#[test]
fn test_pipeline_delivers_in_order() {
    let mut c = container("pipeline");
    let log = Arc::new(Mutex::new(Vec::new()));
    let p = c
        .add_worker(WorkerSpec::new("producer").with_port(PortDecl::output("out")), producer(20))
        .unwrap();
    let q = c
        .add_worker(WorkerSpec::new("consumer").with_port(PortDecl::input("in")), consumer(&log))
        .unwrap();
    c.connect(p, 0, q, 0, &ConnectOptions::default().with_buffer_count(3).with_buffer_size(64))
        .unwrap();

    c.run_until_idle(1000).unwrap();
    assert_eq!(*log.lock(), (0..20).collect::<Vec<u32>>());
    assert_eq!(c.worker_state(p).unwrap(), WorkerState::Disabled);
    assert_eq!(c.worker_state(q).unwrap(), WorkerState::Disabled);
    // 20 payloads plus end-of-stream
    assert_eq!(c.circuit(CircuitId(0)).unwrap().stats().produced, 21);
}

#[test]
fn test_pipeline_respects_run_bound() {
    let mut c = container("bounded").with_config(SchedulerConfig::default().with_max_runs_per_call(2));
    let log = Arc::new(Mutex::new(Vec::new()));
    let p = c
        .add_worker(WorkerSpec::new("producer").with_port(PortDecl::output("out")), producer(50))
        .unwrap();
    let q = c
        .add_worker(WorkerSpec::new("consumer").with_port(PortDecl::input("in")), consumer(&log))
        .unwrap();
    c.connect(p, 0, q, 0, &ConnectOptions::default()).unwrap();

    assert!(c.run().unwrap());
    assert_eq!(c.last_passes(), 2);
    assert!(log.lock().len() < 50);

    let calls = c.run_until_idle(1000).unwrap();
    assert!(calls > 1);
    assert_eq!(log.lock().len(), 50);
}

#[test]
fn test_relay_forwards_without_copy() {
    let mut c = container("relay");
    let log = Arc::new(Mutex::new(Vec::new()));
    let p = c
        .add_worker(WorkerSpec::new("producer").with_port(PortDecl::output("out")), producer(10))
        .unwrap();
    let relay = c
        .add_worker(
            WorkerSpec::new("relay")
                .with_port(PortDecl::input("in"))
                .with_port(PortDecl::output("out")),
            |ctx: &mut RunContext<'_>, _: bool| {
                let Some(meta) = ctx.input_metadata(0) else {
                    return RunResult::Ok;
                };
                if meta.is_end_of_stream() {
                    ctx.release(0);
                    return if ctx.end_of_stream(1) { RunResult::Done } else { RunResult::Ok };
                }
                ctx.send(1, 0);
                RunResult::Ok
            },
        )
        .unwrap();
    let q = c
        .add_worker(WorkerSpec::new("consumer").with_port(PortDecl::input("in")), consumer(&log))
        .unwrap();
    let upstream = c.connect(p, 0, relay, 0, &ConnectOptions::default()).unwrap();
    let downstream = c.connect(relay, 1, q, 0, &ConnectOptions::default()).unwrap();

    c.run_until_idle(1000).unwrap();
    assert_eq!(*log.lock(), (0..10).collect::<Vec<u32>>());
    assert_eq!(c.circuit(downstream).unwrap().stats().forwarded, 10);
    // every forwarded input buffer went back to the producer
    let up = c.circuit(upstream).unwrap();
    assert_eq!(up.stats().released, 11);
    assert!(up.has_empty_output_buffer(0));
}

#[test]
fn test_port_callback_replaces_run() {
    let mut c = container("callbacks");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let p = c
        .add_worker(WorkerSpec::new("producer").with_port(PortDecl::output("out")), producer(5))
        .unwrap();
    let q = c
        .add_worker(
            WorkerSpec::new("consumer").with_port(PortDecl::input("in")),
            |_: &mut RunContext<'_>, _: bool| -> RunResult { panic!("run must not be called") },
        )
        .unwrap();
    c.connect(p, 0, q, 0, &ConnectOptions::default()).unwrap();

    let log = Arc::clone(&seen);
    c.set_port_callback(q, 0, move |ctx: &mut RunContext<'_>, port: usize| {
        if let Some(meta) = ctx.input_metadata(port) {
            if !meta.is_end_of_stream() {
                log.lock().push(meta.opcode);
            }
        }
        ctx.advance(port);
        RunResult::Ok
    })
    .unwrap();

    c.run_until_idle(1000).unwrap();
    assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    assert!(c.stats().callbacks >= 6);
    assert_eq!(c.worker_state(q).unwrap(), WorkerState::Enabled);
}

#[test]
fn test_round_robin_consumers() {
    let mut c = container("fan-out");
    let ep = c.endpoint().to_string();
    let p = c
        .add_worker(WorkerSpec::new("producer").with_port(PortDecl::output("out")), producer(9))
        .unwrap();
    let logs: Vec<_> = (0..3).map(|_| Arc::new(Mutex::new(Vec::new()))).collect();
    let consumers: Vec<_> = logs
        .iter()
        .enumerate()
        .map(|(k, log)| {
            let id = c
                .add_worker(
                    WorkerSpec::new(format!("consumer-{k}")).with_port(PortDecl::input("in")),
                    consumer(log),
                )
                .unwrap();
            (id, 0)
        })
        .collect();
    let spec = CircuitSpec::point_to_point(
        PortSetSpec::new(&ep, 2, 64),
        PortSetSpec::new(&ep, 2, 64)
            .with_ports(3)
            .with_distribution(Distribution::RoundRobin),
    );
    c.connect_spec(&spec, &[(p, 0)], &[consumers.clone()]).unwrap();

    c.run_until_idle(1000).unwrap();
    for (k, log) in logs.iter().enumerate() {
        let want: Vec<u32> = (0..9).filter(|i| i % 3 == k as u32).collect();
        assert_eq!(*log.lock(), want, "consumer {k}");
    }
    // end-of-stream reached every consumer
    for (id, _) in consumers {
        assert_eq!(c.worker_state(id).unwrap(), WorkerState::Disabled);
    }
}

#[test]
fn test_connect_spec_arity_checked() {
    let mut c = container("arity");
    let ep = c.endpoint().to_string();
    let p = c
        .add_worker(WorkerSpec::new("producer").with_port(PortDecl::output("out")), producer(1))
        .unwrap();
    let q = c
        .add_worker(WorkerSpec::new("consumer").with_port(PortDecl::input("in")), |_: &mut RunContext<'_>, _: bool| {
            RunResult::Ok
        })
        .unwrap();
    let spec = CircuitSpec::point_to_point(
        PortSetSpec::new(&ep, 2, 64),
        PortSetSpec::new(&ep, 2, 64).with_ports(2),
    );
    assert!(matches!(
        c.connect_spec(&spec, &[(p, 0)], &[vec![(q, 0)]]),
        Err(Error::UnsupportedTopology(_))
    ));
    assert!(matches!(
        c.connect_spec(&spec, &[(p, 0)], &[vec![(q, 0), (q, 0)]]),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn test_reset_worker_returns_held_buffers() {
    let mut c = container("reset");
    let p = c
        .add_worker(WorkerSpec::new("producer").with_port(PortDecl::output("out")), producer(4))
        .unwrap();
    // holds whatever the scheduler hands it and never advances
    let q = c
        .add_worker(WorkerSpec::new("hoarder").with_port(PortDecl::input("in")), |_: &mut RunContext<'_>, _: bool| {
            RunResult::Ok
        })
        .unwrap();
    let id = c
        .connect(p, 0, q, 0, &ConnectOptions::default().with_buffer_count(1).with_buffer_size(16))
        .unwrap();

    c.run().unwrap();
    assert_eq!(c.circuit(id).unwrap().stats().released, 0);

    c.reset_worker(q).unwrap();
    assert_eq!(c.worker_state(q).unwrap(), WorkerState::Disabled);
    assert_eq!(c.circuit(id).unwrap().stats().released, 1);
    assert_eq!(c.circuit(id).unwrap().stats().produced, 2);
}

#[test]
fn test_disconnect_releases_templates() {
    let mut c = container("disconnect");
    let log = Arc::new(Mutex::new(Vec::new()));
    let p = c
        .add_worker(WorkerSpec::new("producer").with_port(PortDecl::output("out")), producer(3))
        .unwrap();
    let q = c
        .add_worker(WorkerSpec::new("consumer").with_port(PortDecl::input("in")), consumer(&log))
        .unwrap();
    let id = c.connect(p, 0, q, 0, &ConnectOptions::default()).unwrap();
    assert_eq!(c.context().template_count(), 1);
    assert!(c.is_connected(p, 0).unwrap());

    c.disconnect(id).unwrap();
    assert!(c.circuit(id).is_none());
    assert_eq!(c.context().template_count(), 0);
    assert!(!c.is_connected(p, 0).unwrap());
    assert!(!c.is_connected(q, 0).unwrap());
    // required ports are unconnected: nothing runs
    assert!(!c.run().unwrap());
    assert!(matches!(c.disconnect(id), Err(Error::PortNotFound(_))));

    let again = c.connect(p, 0, q, 0, &ConnectOptions::default()).unwrap();
    assert_ne!(again, id);
    c.run_until_idle(100).unwrap();
    assert_eq!(*log.lock(), vec![0, 1, 2]);
}

#[test]
fn test_teardown_returns_lent_buffers() {
    let mut c = container("teardown");
    let ep = c.endpoint().to_string();
    let p = c
        .add_worker(WorkerSpec::new("producer").with_port(PortDecl::output("out")), producer(10))
        .unwrap();
    let relay = c
        .add_worker(
            WorkerSpec::new("relay")
                .with_port(PortDecl::input("in"))
                .with_port(PortDecl::output("out")),
            |ctx: &mut RunContext<'_>, _: bool| {
                if ctx.input_metadata(0).is_some() {
                    ctx.send(1, 0);
                }
                RunResult::Ok
            },
        )
        .unwrap();
    let q = c
        .add_worker(WorkerSpec::new("hoarder").with_port(PortDecl::input("in")), |_: &mut RunContext<'_>, _: bool| {
            RunResult::Ok
        })
        .unwrap();
    let upstream = c.connect(p, 0, relay, 0, &ConnectOptions::default()).unwrap();
    let downstream = c
        .connect(relay, 1, q, 0, &ConnectOptions::default().with_buffer_count(1))
        .unwrap();
    for _ in 0..3 {
        c.run().unwrap();
    }

    let lent = |c: &Container| {
        let port = c.circuit(upstream).unwrap().port(PortRef::input(0, 0)).unwrap();
        (0..port.buffer_count()).filter(|&tid| port.is_lent(tid)).count()
    };
    // second forward is queued behind the buffer the hoarder keeps
    assert!(c.circuit(downstream).unwrap().stats().blocked >= 1);
    assert_eq!(lent(&c), 1);
    assert_eq!(c.context().template_refs(&ep, &ep), 2);

    c.teardown_worker(q).unwrap();
    assert_eq!(lent(&c), 0);
    assert!(c.circuit(downstream).is_none());
    assert!(!c.is_connected(relay, 1).unwrap());
    assert!(c.is_connected(relay, 0).unwrap());
    assert_eq!(c.worker_state(q).unwrap(), WorkerState::Disabled);
    assert_eq!(c.context().template_refs(&ep, &ep), 1);
}
