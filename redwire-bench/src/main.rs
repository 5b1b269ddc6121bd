//! # Client Benchmark Harness
//!
//! Purpose: Measure round-trip cost against a live RESP server, comparing
//! one-command-per-round-trip against pipelined batches and concurrent
//! async callers sharing one connection.
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: Keys and values are pre-built from fixed seeds.
//! 2. **Allocation Control**: Commands are built before the timed loop starts.
//! 3. **Same Engine Everywhere**: Every phase goes through the public client API.
//!
//! Usage: `redwire-bench [endpoint] [ops] [batch] [value_size]`

use std::env;
use std::hint::black_box;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use redwire_client::{AsyncClient, ClientConfig, Command, SyncClient};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_ENDPOINT: &str = "127.0.0.1:6379";
const DEFAULT_OP_COUNT: usize = 100_000;
const DEFAULT_BATCH_SIZE: usize = 64;
const DEFAULT_VALUE_SIZE: usize = 128;
const KEY_COUNT: usize = 1 << 12;

struct BenchConfig {
    endpoint: String,
    op_count: usize,
    batch_size: usize,
    value_size: usize,
}

impl BenchConfig {
    fn from_args() -> Self {
        let mut args = env::args().skip(1);
        let endpoint = args.next().unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let op_count = parse_usize(args.next(), DEFAULT_OP_COUNT);
        let batch_size = parse_usize(args.next(), DEFAULT_BATCH_SIZE).max(1);
        let value_size = parse_usize(args.next(), DEFAULT_VALUE_SIZE);

        BenchConfig {
            endpoint,
            op_count,
            batch_size,
            value_size,
        }
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

fn build_buffers(count: usize, size: usize, seed: u64) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| {
            let mut buffer = vec![b'x'; size];
            let stamp = format!("{:016x}", seed ^ (i as u64));
            let copy_len = buffer.len().min(stamp.len());
            buffer[..copy_len].copy_from_slice(&stamp.as_bytes()[..copy_len]);
            buffer
        })
        .collect()
}

fn report(label: &str, ops: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let ops_per_sec = (ops as f64) / secs;
    let micros_per_op = (secs * 1e6) / (ops as f64);
    println!("{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {micros_per_op:.2} us/op)");
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_target(true).init();

    if let Err(err) = run() {
        eprintln!("redwire-bench failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let bench = BenchConfig::from_args();
    let config = ClientConfig::new(bench.endpoint.clone())
        .with_connect_timeout(Duration::from_secs(2))
        .with_command_timeout(Duration::from_secs(5));

    let keys = build_buffers(KEY_COUNT, 16, 0xA5A5_A5A5_A5A5_A5A5);
    let values = build_buffers(KEY_COUNT, bench.value_size, 0x5A5A_5A5A_5A5A_5A5A);
    let sets: Vec<Command> = (0..bench.op_count)
        .map(|i| {
            let idx = i % KEY_COUNT;
            Command::new("SET").arg(&keys[idx]).arg(&values[idx])
        })
        .collect();
    let gets: Vec<Command> = (0..bench.op_count)
        .map(|i| Command::new("GET").arg(&keys[i % KEY_COUNT]))
        .collect();

    info!(endpoint = %bench.endpoint, ops = bench.op_count, batch = bench.batch_size, "starting");
    println!(
        "endpoint={}, ops={}, batch={}, value_size={}",
        bench.endpoint, bench.op_count, bench.batch_size, bench.value_size
    );

    let mut client = SyncClient::with_config(config.clone())
        .with_context(|| format!("connecting to {}", bench.endpoint))?;
    client.install_error_handler(|err| warn!(error = %err, "client error"));

    let start = Instant::now();
    for command in &sets {
        let reply = client.command(command.clone())?;
        if reply.is_error() {
            bail!("SET rejected: {}", reply);
        }
    }
    report("SET sequential", sets.len(), start.elapsed());

    let start = Instant::now();
    for command in &gets {
        black_box(client.command(command.clone())?);
    }
    report("GET sequential", gets.len(), start.elapsed());

    let start = Instant::now();
    for batch in gets.chunks(bench.batch_size) {
        let reply = client.pipelined(batch.to_vec())?;
        black_box(reply);
    }
    report("GET pipelined", gets.len(), start.elapsed());
    client.disconnect();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    runtime.block_on(run_async(config, gets, bench.batch_size))
}

/// `batch` concurrent callers share one async connection.
async fn run_async(config: ClientConfig, gets: Vec<Command>, batch: usize) -> Result<()> {
    let client = AsyncClient::open(config).await.context("async connect")?;
    client.install_error_handler(|err| warn!(error = %err, "client error"));

    let start = Instant::now();
    for chunk in gets.chunks(batch) {
        let mut waiting = Vec::with_capacity(chunk.len());
        for command in chunk {
            let client = client.clone();
            let command = command.clone();
            waiting.push(tokio::spawn(async move { client.command(command).await }));
        }
        for task in waiting {
            black_box(task.await.context("joining caller")??);
        }
    }
    report("GET async concurrent", gets.len(), start.elapsed());
    client.disconnect();
    Ok(())
}
