//! swarmcastd — runs a publisher and a mesh of distributors in one process,
//! publishes a message and checks that every distributor reassembles it.
//!
//! Usage: swarmcastd [MESSAGE] [--distributors N] [--throttle]
//!
//! `--throttle` makes every node share one read bucket and one write bucket
//! (1 KiB burst, 32 B/s) so the pacing is visible in the logs.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;

use swarmcast_core::config::SwarmcastConfig;
use swarmcast_core::crypto::content_hash;
use swarmcast_services::{throttle_reading, throttle_writing, Bucket, NodeOptions};

mod mesh;

use mesh::Mesh;

const DEFAULT_MESSAGE: &str = "helloworldworks";
const DEFAULT_DISTRIBUTORS: usize = 3;
const DEMO_BUCKET_CAPACITY: u64 = 1024;
const DEMO_BUCKET_RATE: u64 = 32;
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(120);

struct Args {
    message: String,
    distributors: usize,
    throttle: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        message: DEFAULT_MESSAGE.to_string(),
        distributors: DEFAULT_DISTRIBUTORS,
        throttle: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--distributors" | "-n" => {
                let value = iter.next().context("--distributors needs a value")?;
                args.distributors = value
                    .parse()
                    .with_context(|| format!("invalid distributor count {value:?}"))?;
            }
            "--throttle" => args.throttle = true,
            _ => args.message = arg,
        }
    }
    if args.distributors == 0 {
        bail!("need at least one distributor");
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = parse_args()?;

    if let Err(e) = SwarmcastConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = SwarmcastConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        SwarmcastConfig::default()
    });

    // Config throttles are per node; the demo buckets are shared by all.
    let demo_buckets = args.throttle.then(|| {
        (
            Bucket::new(DEMO_BUCKET_CAPACITY, DEMO_BUCKET_RATE),
            Bucket::new(DEMO_BUCKET_CAPACITY, DEMO_BUCKET_RATE),
        )
    });
    let node_options = || {
        let options = NodeOptions::from_config(&config);
        match &demo_buckets {
            Some((read, write)) => options
                .with_throttle([throttle_reading(read.clone()), throttle_writing(write.clone())]),
            None => options,
        }
    };

    tracing::info!(
        distributors = args.distributors,
        bytes = args.message.len(),
        throttle = args.throttle,
        repair = ?config.repair.strategy,
        "swarmcastd starting"
    );

    let mesh = Mesh::build(args.distributors, node_options).await?;
    let result = run(&mesh, Bytes::from(args.message)).await;
    mesh.close().await?;
    result
}

async fn run(mesh: &Mesh, message: Bytes) -> Result<()> {
    let hash = content_hash(&message);

    let report = mesh.publisher.publish(message.clone()).await?;
    tracing::info!(
        hash = %hash,
        delivered = report.delivered.len(),
        rounds = report.rounds,
        "published"
    );

    let mut mismatches = 0;
    for (i, distributor) in mesh.distributors.iter().enumerate() {
        let merged = tokio::time::timeout(LOOKUP_TIMEOUT, distributor.lookup(&hash))
            .await
            .with_context(|| format!("distributor {i} lookup timed out"))??;
        let stats = distributor.stats().await?;
        if merged == message {
            tracing::info!(
                distributor = i,
                content = %String::from_utf8_lossy(&merged),
                datasets = stats.datasets,
                "lookup ok"
            );
        } else {
            mismatches += 1;
            tracing::error!(distributor = i, "lookup returned different bytes");
        }
    }

    if mismatches > 0 {
        bail!("{mismatches} distributor(s) returned the wrong content");
    }
    Ok(())
}
