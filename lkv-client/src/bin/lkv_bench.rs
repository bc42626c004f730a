//! # Client Benchmark Harness
//!
//! Purpose: Drive a RESP2 server through the pooled client so single-command,
//! pipelined and transactional throughput can be compared over time.
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: Use a fixed PRNG seed per worker for stable
//!    comparisons.
//! 2. **Allocation Control**: Pre-build keys/values to keep setup costs off the
//!    hot path.
//! 3. **Shared Pool**: Workers share one `Client`, so the numbers include pool
//!    contention.
//!
//! Usage: `lkv-bench [addr] [threads] [ops_per_thread] [batch] [capacity]`.
//! `LKV_CONFIG=path.json` loads a `ClientConfig` instead of the defaults.

use std::env;
use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use lkv_client::{Client, ClientConfig, ClientError, Command, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "127.0.0.1:6379";
const DEFAULT_THREADS: usize = 4;
const DEFAULT_OPS: usize = 10_000;
const DEFAULT_BATCH: usize = 32;
const DEFAULT_KEY_COUNT: usize = 1024;
const DEFAULT_VALUE_SIZE: usize = 64;

struct BenchConfig {
    client: ClientConfig,
    threads: usize,
    ops: usize,
    batch: usize,
}

impl BenchConfig {
    fn from_args() -> anyhow::Result<Self> {
        let mut client = match env::var("LKV_CONFIG") {
            Ok(path) => {
                let json = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
                ClientConfig::from_json(&json)?
            }
            Err(_) => ClientConfig::default(),
        };

        let mut args = env::args().skip(1);
        client.addr = args.next().unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let threads = parse_usize(args.next(), DEFAULT_THREADS).max(1);
        let ops = parse_usize(args.next(), DEFAULT_OPS);
        let batch = parse_usize(args.next(), DEFAULT_BATCH).max(1);
        client.capacity = parse_usize(args.next(), threads);
        client.prewarm = client.capacity;

        Ok(BenchConfig {
            client,
            threads,
            ops,
            batch,
        })
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

/// Tiny deterministic PRNG so workloads are reproducible.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_index(&mut self, len: usize) -> usize {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        (x % len as u64) as usize
    }
}

fn report(label: &str, ops: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let ops_per_sec = (ops as f64) / secs;
    let micros_per_op = (secs * 1e6) / (ops as f64);
    println!("{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {micros_per_op:.1} us/op)");
}

/// Runs `work` on every worker thread and reports aggregate throughput.
fn run_phase<F>(label: &str, config: &BenchConfig, client: &Client, work: F) -> anyhow::Result<()>
where
    F: Fn(&Client, &mut XorShift64) -> Result<(), ClientError> + Send + Sync + Copy + 'static,
{
    let start = Instant::now();
    let handles: Vec<_> = (0..config.threads)
        .map(|worker| {
            let client = client.clone();
            let ops = config.ops;
            thread::spawn(move || {
                let mut rng = XorShift64::new(0x9E37_79B9_7F4A_7C15 ^ worker as u64);
                for _ in 0..ops {
                    work(&client, &mut rng)?;
                }
                Ok::<(), ClientError>(())
            })
        })
        .collect();

    for handle in handles {
        match handle.join() {
            Ok(result) => result?,
            Err(_) => bail!("{label} worker panicked"),
        }
    }
    report(label, config.ops * config.threads, start.elapsed());
    Ok(())
}

fn key(idx: usize) -> String {
    format!("bench:{idx}")
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = BenchConfig::from_args()?;
    let client = Client::with_config(config.client.clone())
        .with_context(|| format!("connecting to {}", config.client.addr))?;
    info!(
        addr = %config.client.addr,
        threads = config.threads,
        ops = config.ops,
        batch = config.batch,
        capacity = client.pool().capacity(),
        "starting benchmark"
    );

    let value = vec![b'x'; DEFAULT_VALUE_SIZE];
    client.pipeline(|p| {
        for idx in 0..DEFAULT_KEY_COUNT {
            p.send(Command::from(["SET"]).arg(key(idx).as_str()).arg(&value))?;
        }
        Ok::<(), ClientError>(())
    })?;

    if client.send("PING")? != Value::simple("PONG") {
        bail!("server did not answer PING with PONG");
    }

    run_phase("GET", &config, &client, |client, rng| {
        let key = key(rng.next_index(DEFAULT_KEY_COUNT));
        client.send(["GET", key.as_str()]).map(drop)
    })?;

    // Each op is one pipelined batch; throughput below counts commands.
    let batch = config.batch;
    let pipelined = BenchConfig {
        client: config.client.clone(),
        threads: config.threads,
        ops: config.ops / batch,
        batch,
    };
    run_phase("PIPELINE batch", &pipelined, &client, move |client, rng| {
        let keys: Vec<String> = (0..batch)
            .map(|_| key(rng.next_index(DEFAULT_KEY_COUNT)))
            .collect();
        client
            .pipeline(|p| {
                for key in &keys {
                    p.send(["GET", key.as_str()])?;
                }
                Ok::<(), ClientError>(())
            })
            .map(drop)
    })?;
    println!("  ({} commands per batch)", batch);

    run_phase("MULTI/EXEC INCR", &config, &client, |client, rng| {
        let key = key(rng.next_index(DEFAULT_KEY_COUNT));
        client
            .transaction(|tx| {
                tx.send(["INCR", "bench:counter"])?;
                tx.send(["EXISTS", key.as_str()])
            })
            .map(drop)
    })?;

    Ok(())
}
