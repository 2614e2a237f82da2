//! Transfer test harness.
//!
//! Runs one producer feeding `--inputs` consumers through a single circuit
//! and checks that every buffer arrives once, in order, with its payload
//! intact. Exits non-zero on any dropped, duplicated or corrupted buffer.
//!
//! ```text
//! conduit-xfer-test -n 4 -s 4096 -i 1000 --pattern round-robin --inputs 3
//! ```

use clap::{Parser, ValueEnum};
use conduit::prelude::*;
use parking_lot::Mutex;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Pattern {
    Whole,
    RoundRobin,
    Partitioned,
}

impl From<Pattern> for Distribution {
    fn from(p: Pattern) -> Self {
        match p {
            Pattern::Whole => Distribution::Whole,
            Pattern::RoundRobin => Distribution::RoundRobin,
            Pattern::Partitioned => Distribution::Partitioned,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "conduit-xfer-test")]
#[command(about = "Produce, transfer and verify buffers through a conduit circuit")]
struct Args {
    /// Buffers per port
    #[arg(short = 'n', long, default_value_t = 2)]
    buffers: u32,

    /// Buffer size in bytes
    #[arg(short = 's', long, default_value_t = 1024)]
    size: u32,

    /// Number of buffers to produce
    #[arg(short = 'i', long, default_value_t = 100)]
    iterations: u32,

    /// Producer endpoint (allocated if omitted)
    #[arg(long)]
    endpoint: Option<String>,

    /// Protocol for allocated endpoints (first registered driver if empty)
    #[arg(long, default_value = "")]
    protocol: String,

    /// How buffers are shared among the consumers
    #[arg(long, value_enum, default_value_t = Pattern::Whole)]
    pattern: Pattern,

    /// Number of consumers
    #[arg(long, default_value_t = 1)]
    inputs: usize,

    /// Increase log verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Default)]
struct Report {
    received: Vec<u64>,
    errors: Vec<String>,
}

/// Byte `j` of the payload of sequence `seq`.
fn pattern_byte(seq: u32, j: usize) -> u8 {
    (seq as usize).wrapping_add(j) as u8
}

/// Buffers consumer `k` should see.
fn expected_count(pattern: Pattern, iterations: u32, inputs: usize, k: usize) -> u64 {
    match pattern {
        Pattern::Whole | Pattern::Partitioned => u64::from(iterations),
        Pattern::RoundRobin => (0..iterations as usize).filter(|i| i % inputs == k).count() as u64,
    }
}

fn run(args: &Args) -> conduit::Result<bool> {
    let ctx = TransportContext::with_pio(TransportConfig::from_env()?);
    let out_ep = match &args.endpoint {
        Some(ep) => ep.clone(),
        None => ctx.allocate_endpoint(&args.protocol)?,
    };
    let in_ep = ctx.allocate_compatible_endpoint(&out_ep)?;
    info!(producer = %out_ep, consumer = %in_ep, pattern = ?args.pattern, inputs = args.inputs, "starting");

    let mut container = Container::with_endpoint("xfer-test", Arc::clone(&ctx), out_ep.clone())?;
    let size = args.size;
    let iterations = args.iterations;

    let mut produced = 0u32;
    let producer = container.add_worker(
        WorkerSpec::new("producer").with_port(PortDecl::output("out")),
        move |ctx: &mut RunContext<'_>, _: bool| {
            if produced == iterations {
                return if ctx.end_of_stream(0) { RunResult::Done } else { RunResult::Ok };
            }
            let Some(buf) = ctx.output(0) else {
                return RunResult::Ok;
            };
            for (j, b) in buf[..size as usize].iter_mut().enumerate() {
                *b = pattern_byte(produced, j);
            }
            ctx.set_output(0, size, produced);
            produced += 1;
            RunResult::Advance
        },
    )?;

    let report = Arc::new(Mutex::new(Report {
        received: vec![0; args.inputs],
        errors: Vec::new(),
    }));
    let part_len = size.div_ceil(args.inputs as u32) as usize;
    let mut consumers = Vec::with_capacity(args.inputs);
    for k in 0..args.inputs {
        let report = Arc::clone(&report);
        let pattern = args.pattern;
        let inputs = args.inputs as u32;
        let mut expected = match pattern {
            Pattern::RoundRobin => k as u32,
            _ => 0,
        };
        let id = container.add_worker(
            WorkerSpec::new(format!("consumer-{k}")).with_port(PortDecl::input("in")),
            move |ctx: &mut RunContext<'_>, _: bool| {
                let Some(meta) = ctx.input_metadata(0) else {
                    return RunResult::Ok;
                };
                if meta.is_end_of_stream() {
                    ctx.release(0);
                    return RunResult::Done;
                }
                let data = ctx.input(0).unwrap_or_default();
                let mut report = report.lock();
                if meta.opcode != expected {
                    report
                        .errors
                        .push(format!("consumer {k}: got buffer {}, expected {expected}", meta.opcode));
                }
                let offset = match pattern {
                    Pattern::Partitioned => k * part_len,
                    _ => 0,
                };
                if let Some(j) = (0..data.len()).find(|&j| data[j] != pattern_byte(meta.opcode, offset + j)) {
                    report
                        .errors
                        .push(format!("consumer {k}: buffer {} corrupt at byte {j}", meta.opcode));
                }
                report.received[k] += 1;
                expected = meta.opcode + if pattern == Pattern::RoundRobin { inputs } else { 1 };
                RunResult::Advance
            },
        )?;
        consumers.push((id, 0));
    }

    let in_size = match args.pattern {
        Pattern::Partitioned => part_len as u32,
        _ => size,
    };
    let spec = CircuitSpec::point_to_point(
        PortSetSpec::new(&out_ep, args.buffers, size),
        PortSetSpec::new(&in_ep, args.buffers, in_size)
            .with_ports(args.inputs)
            .with_distribution(args.pattern.into()),
    );
    container.connect_spec(&spec, &[(producer, 0)], &[consumers])?;

    let started = Instant::now();
    let calls = container.run_until_idle(usize::MAX)?;
    let elapsed = started.elapsed();

    let report = report.lock();
    let mut ok = report.errors.is_empty();
    for e in &report.errors {
        error!("{e}");
    }
    for (k, &got) in report.received.iter().enumerate() {
        let want = expected_count(args.pattern, iterations, args.inputs, k);
        if got != want {
            error!(consumer = k, received = got, expected = want, "dropped buffers");
            ok = false;
        }
    }
    let stats = container.stats();
    info!(
        produced = iterations,
        received = report.received.iter().sum::<u64>(),
        calls,
        passes = stats.passes,
        worker_runs = stats.worker_runs,
        elapsed_ms = elapsed.as_millis() as u64,
        "finished"
    );
    Ok(ok)
}

fn main() -> ExitCode {
    let args = Args::parse();
    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    if args.inputs == 0 || args.size == 0 || args.buffers == 0 {
        error!("--inputs, --size and --buffers must be positive");
        return ExitCode::FAILURE;
    }
    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
