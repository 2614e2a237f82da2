//! Round-robin fan-out driven directly through the circuit API.
//!
//! Two producers share one set of three consumers. Only the producer
//! holding the barrier token may send, so buffers reach the consumers in
//! strict rank order: p0, p1, p0, p1, ...
//!
//! Run with: cargo run --example round_robin

use conduit::prelude::*;
use tracing::info;

fn main() -> conduit::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let ctx = TransportContext::with_pio(TransportConfig::from_env()?);
    let ep = ctx.allocate_endpoint("")?;
    let spec = CircuitSpec::point_to_point(
        PortSetSpec::new(&ep, 2, 64).with_ports(2),
        PortSetSpec::new(&ep, 4, 64)
            .with_ports(3)
            .with_distribution(Distribution::RoundRobin),
    );
    let mut circuit = Circuit::connect(&ctx, CircuitId(0), &spec)?;
    info!(variant = circuit.controllers()[0].variant(), "connected");

    for i in 0..6u32 {
        let rank = (i % 2) as usize;
        let Some(h) = circuit.next_empty_output_buffer(rank) else {
            info!(rank, "no free output buffer");
            continue;
        };
        circuit.output_buffer_mut(h)[0] = i as u8;
        let outcome = circuit.advance(h, 1, rank as u32)?;
        info!(buffer = i, rank, ?outcome, "produced");
    }

    for port in 0..3 {
        while let Some(h) = circuit.next_full_input_buffer(0, port) {
            let meta = circuit.input_metadata(h);
            info!(port, value = circuit.input_buffer(h)[0], producer = meta.opcode, "consumed");
            circuit.release(h)?;
        }
    }
    info!(stats = ?circuit.stats(), "done");
    Ok(())
}
