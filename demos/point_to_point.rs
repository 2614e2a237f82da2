//! Point-to-point: one producer, one consumer, one circuit.
//!
//! Run with: cargo run --example point_to_point

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
    let mut container = Container::new("point-to-point", ctx)?;

    let mut next = 0u32;
    let producer = container.add_worker(
        WorkerSpec::new("producer").with_port(PortDecl::output("out")),
        move |ctx: &mut RunContext<'_>, _: bool| {
            if next == 5 {
                return if ctx.end_of_stream(0) { RunResult::Done } else { RunResult::Ok };
            }
            let Some(buf) = ctx.output(0) else {
                return RunResult::Ok;
            };
            let msg = format!("message {next}");
            buf[..msg.len()].copy_from_slice(msg.as_bytes());
            ctx.set_output(0, msg.len() as u32, next);
            next += 1;
            RunResult::Advance
        },
    )?;

    let consumer = container.add_worker(
        WorkerSpec::new("consumer").with_port(PortDecl::input("in")),
        |ctx: &mut RunContext<'_>, _: bool| {
            let Some(meta) = ctx.input_metadata(0) else {
                return RunResult::Ok;
            };
            if meta.is_end_of_stream() {
                info!("end of stream");
                ctx.release(0);
                return RunResult::Done;
            }
            let text = ctx.input(0).map(|d| String::from_utf8_lossy(d).into_owned());
            info!(opcode = meta.opcode, sequence = meta.sequence, text = ?text, "received");
            RunResult::Advance
        },
    )?;

    let options = ConnectOptions::default().with_buffer_count(2).with_buffer_size(256);
    container.connect(producer, 0, consumer, 0, &options)?;

    let calls = container.run_until_idle(1000)?;
    let stats = container.stats();
    info!(calls, passes = stats.passes, runs = stats.worker_runs, "done");
    Ok(())
}
