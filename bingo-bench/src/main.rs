// Copyright 2026 bingo Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Simulated traffic against an in-process split testing engine.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bingo::{Bingo, BingoBuilder, Compression, Environment, ExperimentSpec, TokioScheduler};
use clap::Parser;
use hdrhistogram::Histogram;
use itertools::Itertools;
use parking_lot::RwLock;
use rand::Rng;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Args {
    /// Distinct identities sending requests.
    #[arg(long, default_value_t = 10000)]
    users: usize,

    /// Experiment families.
    #[arg(long, default_value_t = 4)]
    experiments: usize,

    /// Alternatives per experiment.
    #[arg(long, default_value_t = 3)]
    alternatives: usize,

    /// Concurrent workers.
    #[arg(long, default_value_t = 16)]
    workers: usize,

    /// Chance that a request converts.
    #[arg(long, default_value_t = 0.1)]
    conversion_rate: f64,

    /// Total runtime.
    #[arg(long, default_value = "10s")]
    time: humantime::Duration,

    /// Interval between reconciliation runs.
    #[arg(long, default_value = "1s")]
    persist_interval: humantime::Duration,

    /// Catalog snapshot compression.
    #[arg(long, value_enum, default_value_t = Compression::Zstd)]
    compression: Compression,

    /// Development disables the reconciliation loop.
    #[arg(long, value_enum, default_value_t = Environment::Production)]
    environment: Environment,

    /// Identity buckets.
    #[arg(long, default_value_t = 51)]
    identity_buckets: usize,
}

#[derive(Debug)]
struct Metrics {
    assign_lats: RwLock<Histogram<u64>>,
    convert_lats: RwLock<Histogram<u64>>,
}

impl Metrics {
    fn new() -> anyhow::Result<Self> {
        Ok(Self {
            assign_lats: RwLock::new(Histogram::new_with_bounds(1, 10_000_000, 2)?),
            convert_lats: RwLock::new(Histogram::new_with_bounds(1, 10_000_000, 2)?),
        })
    }
}

fn init_logger() {
    use tracing_subscriber::{prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_line_number(true))
        .with(EnvFilter::from_default_env())
        .init();
}

fn spec(args: &Args, index: usize) -> ExperimentSpec {
    let name = format!("experiment-{index}");
    ExperimentSpec::binary(&name, (0..args.alternatives).map(|number| format!("{name}/{number}")))
}

async fn worker(bingo: Bingo, args: Arc<Args>, specs: Arc<Vec<ExperimentSpec>>, metrics: Arc<Metrics>, stop: Instant) {
    while Instant::now() < stop {
        let (user, spec, convert) = {
            let mut rng = rand::rng();
            (
                rng.random_range(0..args.users),
                &specs[rng.random_range(0..specs.len())],
                rng.random_bool(args.conversion_rate),
            )
        };

        let mut ctx = bingo.context(format!("user-{user}"));

        let now = Instant::now();
        if let Err(e) = bingo.ab_test(&mut ctx, spec).await {
            tracing::error!("[bench]: assign error: {e}");
            continue;
        }
        let lat = now.elapsed().as_micros() as u64;
        if let Err(e) = metrics.assign_lats.write().record(lat) {
            tracing::error!("metrics error: {:?}, value: {}", e, lat);
        }

        if convert {
            let now = Instant::now();
            if let Err(e) = bingo.record_conversion(&mut ctx, &[spec.name.as_str()]).await {
                tracing::error!("[bench]: conversion error: {e}");
            }
            let lat = now.elapsed().as_micros() as u64;
            if let Err(e) = metrics.convert_lats.write().record(lat) {
                tracing::error!("metrics error: {:?}, value: {}", e, lat);
            }
        }

        if let Err(e) = ctx.finish().await {
            tracing::error!("[bench]: finish error: {e}");
        }
    }
}

fn report(name: &str, histogram: &Histogram<u64>) {
    println!(
        "{name:<10} count: {:>10}, p50: {:>6}us, p90: {:>6}us, p99: {:>6}us, p999: {:>6}us, max: {:>6}us",
        histogram.len(),
        histogram.value_at_quantile(0.5),
        histogram.value_at_quantile(0.9),
        histogram.value_at_quantile(0.99),
        histogram.value_at_quantile(0.999),
        histogram.max(),
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    #[cfg(feature = "deadlock")]
    {
        std::thread::spawn(move || loop {
            std::thread::sleep(Duration::from_secs(1));
            let deadlocks = parking_lot::deadlock::check_deadlock();
            if deadlocks.is_empty() {
                continue;
            }

            println!("{} deadlocks detected", deadlocks.len());
            for (i, threads) in deadlocks.iter().enumerate() {
                println!("Deadlock #{}", i);
                for t in threads {
                    println!("Thread Id {:#?}", t.thread_id());
                    println!("{:#?}", t.backtrace());
                }
            }
            panic!()
        });
    }

    let args = Args::parse();
    println!("{:#?}", args);
    anyhow::ensure!(args.users > 0, "\"--users\" value must be greater than 0");
    anyhow::ensure!(args.experiments > 0, "\"--experiments\" value must be greater than 0");
    anyhow::ensure!(
        (0.0..=1.0).contains(&args.conversion_rate),
        "\"--conversion-rate\" value must be within [0, 1]"
    );

    let scheduler = Arc::new(TokioScheduler::current()?);
    let bingo = BingoBuilder::new()
        .with_name("bench")
        .with_scheduler(scheduler.clone())
        .with_compression(args.compression)
        .with_environment(args.environment)
        .with_persist_interval(args.persist_interval.into())
        .with_identity_buckets(args.identity_buckets)
        .build()?;
    if args.environment == Environment::Production {
        bingo.watchdog()?;
    }

    let args = Arc::new(args);
    let specs = Arc::new((0..args.experiments).map(|index| spec(&args, index)).collect_vec());
    let metrics = Arc::new(Metrics::new()?);

    let start = Instant::now();
    let stop = start + Duration::from(args.time);
    let handles = (0..args.workers)
        .map(|_| {
            tokio::spawn(worker(
                bingo.clone(),
                args.clone(),
                specs.clone(),
                metrics.clone(),
                stop,
            ))
        })
        .collect_vec();
    for handle in handles {
        handle.await?;
    }
    let elapsed = start.elapsed();

    scheduler.close();
    let reconciled = bingo.persist_now().await?;
    println!("\nElapsed: {}", humantime::format_duration(Duration::from_millis(elapsed.as_millis() as u64)));
    println!("Reconciled: {reconciled:?}\n");

    for spec in specs.iter() {
        let totals = bingo.live_totals(&spec.name).await?;
        println!("{} [{:?}]", totals.experiment, totals.state);
        for alternative in totals.alternatives.iter() {
            let rate = match alternative.participants {
                0 => 0.0,
                participants => alternative.conversions as f64 / participants as f64 * 100.0,
            };
            println!(
                "  #{} {:<20} participants: {:>8}, conversions: {:>8}, rate: {:>6.2}%",
                alternative.number, alternative.content, alternative.participants, alternative.conversions, rate
            );
        }
    }

    println!();
    report("assign", &metrics.assign_lats.read());
    report("convert", &metrics.convert_lats.read());

    Ok(())
}
