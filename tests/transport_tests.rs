//! Integration tests for circuits over the PIO transport.
//!
//! These tests verify that:
//! - Buffers arrive once and in order under flow control
//! - Round-robin and fan-in controllers distribute fairly
//! - A produce/consume cycle restores every flag word to empty
//! - Ports refuse use before their handshake completes
//! - Data crosses endpoints

use conduit::circuit::{Circuit, CircuitId, CircuitSpec, Distribution, PortRef, PortSetSpec, ProduceOutcome};
use conduit::config::TransportConfig;
use conduit::descriptor::{DESCRIPTOR_SIZE, Descriptor};
use conduit::error::Error;
use conduit::port::{Direction, Port, PortMetaData};
use conduit::transfer::TransportContext;
use std::sync::Arc;

fn context() -> (Arc<TransportContext>, String) {
    let ctx = TransportContext::with_pio(TransportConfig::default().with_smb_size(1 << 20));
    let ep = ctx.allocate_endpoint("").unwrap();
    (ctx, ep)
}

fn produce(c: &mut Circuit, rank: usize, opcode: u32, payload: &[u8]) -> ProduceOutcome {
    let h = c.next_empty_output_buffer(rank).expect("free output buffer");
    c.output_buffer_mut(h)[..payload.len()].copy_from_slice(payload);
    c.advance(h, payload.len() as u32, opcode).unwrap()
}

/// Consume one buffer from `port` of set 0, returning its opcode and payload.
fn consume(c: &mut Circuit, port: usize) -> Option<(u32, Vec<u8>)> {
    let h = c.next_full_input_buffer(0, port)?;
    let opcode = c.input_metadata(h).opcode;
    let data = c.input_buffer(h).to_vec();
    c.release(h).unwrap();
    Some((opcode, data))
}

/// Every flag word of every port in the circuit.
fn flag_snapshot(c: &Circuit) -> Vec<u32> {
    let outputs = c.output_set().ports().iter();
    let inputs = c.input_sets().iter().flat_map(|s| s.ports().iter());
    outputs
        .chain(inputs)
        .flat_map(|p| {
            p.layout()
                .flag_words()
                .into_iter()
                .map(|off| p.region().load_flag(off).unwrap())
        })
        .collect()
}

#[test]
fn test_two_buffers_five_produces_in_order() {
    let (ctx, ep) = context();
    let spec = CircuitSpec::point_to_point(PortSetSpec::new(&ep, 2, 64), PortSetSpec::new(&ep, 2, 64));
    let mut c = Circuit::connect(&ctx, CircuitId(0), &spec).unwrap();

    let mut produced = 0u32;
    let mut sequences = Vec::new();
    let mut steps = 0;
    while sequences.len() < 5 {
        steps += 1;
        assert!(steps < 100, "no progress");
        if produced < 5 && c.has_empty_output_buffer(0) {
            produce(&mut c, 0, produced * 10, &[produced as u8; 4]);
            produced += 1;
            continue;
        }
        let h = c.next_full_input_buffer(0, 0).expect("a full input buffer");
        let meta = c.input_metadata(h);
        assert_eq!(meta.opcode, meta.sequence * 10);
        assert_eq!(c.input_buffer(h), &[meta.sequence as u8; 4]);
        sequences.push(meta.sequence);
        c.release(h).unwrap();
    }

    assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
    assert_eq!(c.stats().produced, 5);
    assert_eq!(c.stats().released, 5);
    assert!(!c.has_full_input_buffer(0, 0));
}

#[test]
fn test_round_robin_fairness() {
    let (ctx, ep) = context();
    let spec = CircuitSpec::point_to_point(
        PortSetSpec::new(&ep, 4, 32),
        PortSetSpec::new(&ep, 3, 32)
            .with_ports(3)
            .with_distribution(Distribution::RoundRobin),
    );
    let mut c = Circuit::connect(&ctx, CircuitId(0), &spec).unwrap();
    assert_eq!(c.controllers()[0].variant(), 2);

    for i in 0..9u32 {
        assert_eq!(produce(&mut c, 0, i, &[i as u8]), ProduceOutcome::Produced);
    }
    for port in 0..3 {
        let got: Vec<u32> = std::iter::from_fn(|| consume(&mut c, port).map(|(op, _)| op)).collect();
        let want: Vec<u32> = (0..9).filter(|i| i % 3 == port as u32).collect();
        assert_eq!(got, want, "port {port}");
    }
}

#[test]
fn test_fan_in_slots_per_producer() {
    let (ctx, ep) = context();
    let spec = CircuitSpec::point_to_point(
        PortSetSpec::new(&ep, 2, 32).with_ports(2),
        PortSetSpec::new(&ep, 2, 32),
    );
    let mut c = Circuit::connect(&ctx, CircuitId(0), &spec).unwrap();
    assert_eq!(c.controllers()[0].variant(), 3);

    // rank 0 holds the token first
    assert!(c.controllers()[0].have_source_barrier_token(0));
    assert_eq!(produce(&mut c, 0, 100, b"a"), ProduceOutcome::Produced);
    assert!(c.controllers()[0].have_source_barrier_token(1));
    assert_eq!(produce(&mut c, 1, 200, b"b"), ProduceOutcome::Produced);

    let input = c.port(PortRef::input(0, 0)).unwrap();
    assert!(input.input_slot(0, 0).is_full());
    assert!(input.input_slot(0, 1).is_empty());
    assert!(input.input_slot(1, 0).is_empty());
    assert!(input.input_slot(1, 1).is_full());
    assert_eq!(input.input_slot(1, 1).producer_tid(), Some(0));

    assert_eq!(consume(&mut c, 0), Some((100, b"a".to_vec())));
    assert_eq!(consume(&mut c, 0), Some((200, b"b".to_vec())));
    let input = c.port(PortRef::input(0, 0)).unwrap();
    assert!(!input.is_input_full(0));
    assert!(!input.is_input_full(1));
}

#[test]
fn test_fan_in_token_blocks_out_of_turn() {
    let (ctx, ep) = context();
    let spec = CircuitSpec::point_to_point(
        PortSetSpec::new(&ep, 2, 32).with_ports(2),
        PortSetSpec::new(&ep, 2, 32),
    );
    let mut c = Circuit::connect(&ctx, CircuitId(0), &spec).unwrap();

    // rank 1 queues until rank 0 has sent
    assert_eq!(produce(&mut c, 1, 2, b"y"), ProduceOutcome::Blocked);
    assert_eq!(produce(&mut c, 0, 1, b"x"), ProduceOutcome::Produced);
    c.dispatch().unwrap();
    assert_eq!(consume(&mut c, 0).map(|(op, _)| op), Some(1));
    assert_eq!(consume(&mut c, 0).map(|(op, _)| op), Some(2));
}

#[test]
fn test_cycle_restores_flag_words() {
    let (ctx, ep) = context();
    let spec = CircuitSpec::point_to_point(
        PortSetSpec::new(&ep, 2, 32),
        PortSetSpec::new(&ep, 2, 32)
            .with_ports(2)
            .with_distribution(Distribution::RoundRobin),
    );
    let mut c = Circuit::connect(&ctx, CircuitId(0), &spec).unwrap();
    let before = flag_snapshot(&c);
    assert!(before.iter().all(|&w| w == 0));

    for i in 0..3u32 {
        produce(&mut c, 0, i, b"data");
    }
    assert_ne!(flag_snapshot(&c), before);
    while consume(&mut c, 0).is_some() || consume(&mut c, 1).is_some() {}
    assert_eq!(flag_snapshot(&c), before);
}

#[test]
#[should_panic(expected = "used before its handshake completed")]
fn test_port_use_before_handshake_panics() {
    let (ctx, ep) = context();
    let resource = ctx.resources(&ep).unwrap();
    let port = Port::new(
        PortMetaData {
            ordinal: 0,
            direction: Direction::Output,
            buffer_count: 2,
            buffer_size: 64,
            rank: 0,
            shadow_row: 0,
            parts: 1,
            endpoint: ep.clone(),
        },
        resource,
    )
    .unwrap();
    port.has_empty_output_buffer();
}

#[test]
fn test_descriptor_wire_form() {
    let (ctx, ep) = context();
    let spec = CircuitSpec::point_to_point(PortSetSpec::new(&ep, 3, 64), PortSetSpec::new(&ep, 3, 64));
    let c = Circuit::connect(&ctx, CircuitId(0), &spec).unwrap();
    let input = c.port(PortRef::input(0, 0)).unwrap();

    let desc = input.descriptor();
    let wire = desc.encode().unwrap();
    assert_eq!(wire.len(), DESCRIPTOR_SIZE);
    assert_eq!(Descriptor::decode(&wire).unwrap(), desc);
    assert_eq!(desc.n_buffers, 3);
    assert_eq!(desc.endpoint, ep);

    assert!(matches!(Descriptor::decode(&wire[..100]), Err(Error::DescriptorMismatch(_))));
    let mut unterminated = wire;
    unterminated[112..240].fill(b'x');
    assert!(matches!(
        Descriptor::decode(&unterminated),
        Err(Error::DescriptorMismatch(_))
    ));

    // the output advertised for this input carries the same geometry
    let output = c.port(PortRef::output(0)).unwrap();
    let seen = output.peer(0).unwrap();
    assert_eq!(seen.data_buffer_base, desc.data_buffer_base);
    assert!(seen.validate_against(&output.descriptor()).is_ok());
}

#[test]
fn test_cross_endpoint_copy() {
    let (ctx, out_ep) = context();
    let in_ep = ctx.allocate_compatible_endpoint(&out_ep).unwrap();
    let spec = CircuitSpec::point_to_point(PortSetSpec::new(&out_ep, 2, 256), PortSetSpec::new(&in_ep, 2, 256));
    let mut c = Circuit::connect(&ctx, CircuitId(0), &spec).unwrap();
    assert_eq!(c.template_count(), 2);

    let payload: Vec<u8> = (0..=255).collect();
    assert_eq!(produce(&mut c, 0, 7, &payload), ProduceOutcome::Produced);
    let input = c.port(PortRef::input(0, 0)).unwrap();
    assert_eq!(input.endpoint_id(), in_ep);
    assert_eq!(consume(&mut c, 0), Some((7, payload)));
    assert!(c.has_empty_output_buffer(0));
}

#[test]
fn test_input_set_larger_than_limit_rejected() {
    let (ctx, ep) = context();
    let spec = CircuitSpec::point_to_point(
        PortSetSpec::new(&ep, 2, 32),
        PortSetSpec::new(&ep, 2, 32)
            .with_ports(17)
            .with_distribution(Distribution::RoundRobin),
    );
    assert!(matches!(
        Circuit::connect(&ctx, CircuitId(0), &spec),
        Err(Error::UnsupportedTopology(_))
    ));
}
