//! Controller entry point.

use clap::Parser;
use tracing::info;

use bundler::controller::{self, Options};
use bundler::observability::metrics;

/// Run the bundler controller.
#[derive(Parser)]
#[command(name = "bundler", about = "Run the bundler instance controller")]
struct Cli {
    /// The address the metric endpoint binds to.
    #[arg(long = "metrics-addr", default_value = ":9090")]
    metrics_addr: String,

    /// The address the probe endpoint binds to.
    #[arg(long = "probe-addr", default_value = ":8081")]
    probe_addr: String,

    /// Enable leader election for the controller manager.
    #[arg(long = "leader-elect", default_value_t = false)]
    leader_elect: bool,

    /// The ID to use for leader election.
    #[arg(long = "leader-elect-id", default_value = "bundler-leader-election")]
    leader_elect_id: String,

    /// Directory used to cache downloaded packages.
    #[arg(long = "cache-dir")]
    cache_dir: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bundler=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let defaults = Options::default();
    let options = Options {
        metrics_addr: cli.metrics_addr,
        probe_addr: cli.probe_addr,
        leader_election: cli.leader_elect,
        leader_election_id: cli.leader_elect_id,
        cache_dir: cli.cache_dir.unwrap_or(defaults.cache_dir),
    };

    if let Err(e) = metrics::register_metrics() {
        eprintln!("{e:#}");
        std::process::exit(1);
    }

    info!("starting bundler controller");
    if let Err(e) = controller::run(options).await {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}
