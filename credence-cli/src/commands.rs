use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use credence_config::CredenceConfig;
use credence_core::{
    BalanceObserver, BalanceTracker, CallbackKind, Clock, ConnectionEvents, MemoryStore, NodeId,
    SimulatedClock,
};
use credence_telemetry::EventLogger;

#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a deterministic connection churn simulation
    Simulate(SimulateArgs),
    /// Print the effective configuration as YAML
    Config(ConfigArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Number of distinct peers that come and go
    #[arg(long, default_value_t = 100)]
    pub nodes: u64,
    /// Simulated seconds to run
    #[arg(long, default_value_t = 600)]
    pub seconds: u64,
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
    /// Configuration file; defaults and environment are used otherwise
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    #[arg(short, long)]
    pub path: Option<PathBuf>,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<CredenceConfig> {
    let config = match path {
        Some(path) => CredenceConfig::load_from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CredenceConfig::load().context("loading configuration")?,
    };
    Ok(config)
}

#[derive(Default)]
struct StatusCounter {
    gained: AtomicU64,
    lost: AtomicU64,
}

impl BalanceObserver for StatusCounter {
    fn priority_gained(&self, _id: &NodeId) {
        self.gained.fetch_add(1, Ordering::Relaxed);
    }

    fn priority_lost(&self, _id: &NodeId) {
        self.lost.fetch_add(1, Ordering::Relaxed);
    }
}

/// Disconnects a peer whose credit ran out. The balance stays in memory
/// when it cannot be persisted, so the failure is only logged.
fn drop_exhausted(tracker: &BalanceTracker, id: &NodeId) {
    if let Err(err) = tracker.on_disconnect(id) {
        warn!(node = %id, error = %err, "Failed to persist exhausted node");
    }
}

/// Every simulated second each peer may connect, top up, be served or
/// leave. Peers that run out of credit are dropped by their exhaustion
/// callback, the way a server would evict them.
pub fn run_simulation(args: SimulateArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_ref())?;
    EventLogger::init(&config.telemetry.log_level);

    let clock = SimulatedClock::new(0);
    let store = Arc::new(MemoryStore::new());
    let observer = Arc::new(StatusCounter::default());
    let tracker = Arc::new(BalanceTracker::with_observer(
        Arc::new(clock.clone()),
        store.clone(),
        &config.tracker,
        observer.clone(),
    ));
    let mut rng = StdRng::seed_from_u64(args.seed);

    info!(nodes = args.nodes, seconds = args.seconds, seed = args.seed, "Simulation started");
    for _ in 0..args.seconds {
        for index in 0..args.nodes {
            let id = NodeId::from_index(index);
            match (tracker.node(&id), rng.random_range(0..100u32)) {
                (None, 0..=9) => {
                    let node = tracker.on_connect(id, rng.random_range(1..=10u64));
                    node.add_balance(rng.random_range(1_000_000..10_000_000i64))?;
                    let evict = Arc::downgrade(&tracker);
                    node.add_callback(
                        CallbackKind::Exhausted,
                        0,
                        Box::new(move || {
                            if let Some(tracker) = evict.upgrade() {
                                drop_exhausted(&tracker, &id);
                            }
                        }),
                    );
                }
                (Some(node), 0..=4) => {
                    node.add_balance(rng.random_range(1_000_000..100_000_000i64))?;
                }
                (Some(node), 5..=59) => {
                    node.request_served(rng.random_range(1_000..1_000_000u64));
                }
                (Some(_), 60..=61) => tracker.on_disconnect(&id)?,
                (Some(_), 62) => tracker.on_capacity_changed(&id, rng.random_range(0..=10u64)),
                _ => {}
            }
        }
        clock.advance(Duration::from_secs(1));
    }

    println!("simulated time:     {}", clock.now());
    println!("tracked nodes:      {}", tracker.tracked_count());
    println!("total token amount: {}", tracker.total_token_amount());
    println!(
        "priority gained/lost: {}/{}",
        observer.gained.load(Ordering::Relaxed),
        observer.lost.load(Ordering::Relaxed)
    );
    if config.telemetry.metrics_enabled {
        println!("{}", tracker.metrics().gather_metrics()?);
    }

    tracker.stop()?;
    let persisted = tracker.positive_balance_ids(&NodeId::default(), None, usize::MAX)?;
    println!("persisted positive balances: {}", persisted.len());
    info!(stored_keys = store.len(), "Simulation finished");
    Ok(())
}

pub fn show_config(args: ConfigArgs) -> anyhow::Result<()> {
    let config = load_config(args.path.as_ref())?;
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}
