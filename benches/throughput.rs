//! Throughput benchmarks for conduit circuits and containers.

use conduit::observability::TracingConfig;
use conduit::prelude::*;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;

fn context() -> (Arc<TransportContext>, String) {
    let ctx = TransportContext::with_pio(TransportConfig::default().with_smb_size(16 << 20));
    let ep = ctx.allocate_endpoint("").unwrap();
    (ctx, ep)
}

/// Produce one buffer and consume it on every input port.
fn cycle(c: &mut Circuit, len: usize, ports: usize) {
    let h = c.next_empty_output_buffer(0).unwrap();
    c.output_buffer_mut(h)[..len].fill(0xa5);
    c.advance(h, len as u32, 0).unwrap();
    for port in 0..ports {
        if let Some(h) = c.next_full_input_buffer(0, port) {
            black_box(c.input_buffer(h));
            c.release(h).unwrap();
        }
    }
}

fn bench_point_to_point(c: &mut Criterion) {
    let mut group = c.benchmark_group("point_to_point");

    for size in [64usize, 1024, 64 * 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let (ctx, ep) = context();
            let spec = CircuitSpec::point_to_point(
                PortSetSpec::new(&ep, 4, size as u32),
                PortSetSpec::new(&ep, 4, size as u32),
            );
            let mut circuit = Circuit::connect(&ctx, CircuitId(0), &spec).unwrap();
            b.iter(|| cycle(&mut circuit, size, 1));
        });
    }

    group.finish();
}

fn bench_cross_endpoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("cross_endpoint");

    for size in [1024usize, 64 * 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let (ctx, out_ep) = context();
            let in_ep = ctx.allocate_compatible_endpoint(&out_ep).unwrap();
            let spec = CircuitSpec::point_to_point(
                PortSetSpec::new(&out_ep, 4, size as u32),
                PortSetSpec::new(&in_ep, 4, size as u32),
            );
            let mut circuit = Circuit::connect(&ctx, CircuitId(0), &spec).unwrap();
            b.iter(|| cycle(&mut circuit, size, 1));
        });
    }

    group.finish();
}

fn bench_distribution(c: &mut Criterion) {
    let mut group = c.benchmark_group("distribution");
    let size = 4096usize;
    group.throughput(Throughput::Bytes(size as u64));

    for (name, distribution) in [
        ("whole", Distribution::Whole),
        ("round_robin", Distribution::RoundRobin),
        ("partitioned", Distribution::Partitioned),
    ] {
        group.bench_function(name, |b| {
            let (ctx, ep) = context();
            let spec = CircuitSpec::point_to_point(
                PortSetSpec::new(&ep, 4, size as u32),
                PortSetSpec::new(&ep, 4, size as u32)
                    .with_ports(4)
                    .with_distribution(distribution),
            );
            let mut circuit = Circuit::connect(&ctx, CircuitId(0), &spec).unwrap();
            b.iter(|| cycle(&mut circuit, size, 4));
        });
    }

    group.finish();
}

fn bench_container_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("container_pipeline");

    for buffer_count in [100u32, 1000].iter() {
        group.throughput(Throughput::Elements(u64::from(*buffer_count)));
        group.bench_with_input(
            BenchmarkId::from_parameter(buffer_count),
            buffer_count,
            |b, &buffer_count| {
                b.iter(|| {
                    let ctx = TransportContext::with_pio(TransportConfig::default().with_smb_size(1 << 20));
                    let mut container = Container::new("bench", ctx)
                        .unwrap()
                        .with_tracing(TracingConfig::quiet());
                    let mut sent = 0u32;
                    let p = container
                        .add_worker(
                            WorkerSpec::new("producer").with_port(PortDecl::output("out")),
                            move |ctx: &mut RunContext<'_>, _: bool| {
                                if sent == buffer_count {
                                    return RunResult::Done;
                                }
                                ctx.set_output(0, 64, sent);
                                sent += 1;
                                RunResult::Advance
                            },
                        )
                        .unwrap();
                    let q = container
                        .add_worker(
                            WorkerSpec::new("consumer").with_port(PortDecl::input("in")),
                            |ctx: &mut RunContext<'_>, _: bool| {
                                black_box(ctx.input(0));
                                RunResult::Advance
                            },
                        )
                        .unwrap();
                    container
                        .connect(p, 0, q, 0, &ConnectOptions::default().with_buffer_count(8))
                        .unwrap();
                    black_box(container.run_until_idle(usize::MAX).unwrap())
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_point_to_point,
    bench_cross_endpoint,
    bench_distribution,
    bench_container_pipeline,
);

criterion_main!(benches);
