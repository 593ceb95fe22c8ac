//! Broker Demo
//!
//! Command-line driver for the in-process broker. Each subcommand builds a
//! small topology on a fresh [`Broker`], publishes, consumes and logs what
//! happened.
//!
//! ## Scenarios
//!
//! ```text
//! basics              direct exchange, two queues, one key each
//! alternate-exchange  unroutable messages fall back to a fanout exchange
//! dead-letter         reject(requeue=false) lands in the DLX queue with x-death
//! prefetch            at most N unacknowledged deliveries per consumer
//! stream              replay a stream queue from first / an offset / the tail
//! retry               DLX queue republishes through a retry exchange
//! worker              long-running ConsumerWorker until Ctrl+C
//! ```

use broker::{Broker, BrokerConfig};
use clap::{Parser, Subcommand};
use core_config::tracing::{init_tracing, install_color_eyre};
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

mod scenarios;
mod worker;

#[derive(Parser)]
#[command(name = "broker-demo")]
#[command(about = "Run broker demonstration scenarios against an in-process broker")]
struct Cli {
    /// Print a Prometheus snapshot of the broker metrics before exiting
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    scenario: Scenario,
}

#[derive(Debug, Clone, Copy, Subcommand, strum::Display)]
#[strum(serialize_all = "kebab-case")]
enum Scenario {
    /// Direct routing to two queues
    Basics,
    /// Fallback routing through an alternate exchange
    AlternateExchange,
    /// Rejected messages routed to a dead-letter exchange
    DeadLetter,
    /// Prefetch-limited consumption
    Prefetch,
    /// Stream queue replay from different offsets
    Stream,
    /// Bounded retries through a retry exchange
    Retry,
    /// Every scenario above, one after the other
    All,
    /// Run a consumer worker until interrupted
    Worker {
        /// Messages to publish before starting the worker
        #[arg(short, long, default_value_t = 20)]
        messages: usize,
    },
}

const DEMOS: [Scenario; 6] = [
    Scenario::Basics,
    Scenario::AlternateExchange,
    Scenario::DeadLetter,
    Scenario::Prefetch,
    Scenario::Stream,
    Scenario::Retry,
];

async fn run_scenario(scenario: Scenario, broker: &Broker) -> Result<()> {
    match scenario {
        Scenario::Basics => scenarios::basics(broker).await,
        Scenario::AlternateExchange => scenarios::alternate_exchange(broker).await,
        Scenario::DeadLetter => scenarios::dead_letter(broker).await,
        Scenario::Prefetch => scenarios::prefetch(broker).await,
        Scenario::Stream => scenarios::stream(broker).await,
        Scenario::Retry => scenarios::retry(broker).await,
        Scenario::Worker { messages } => worker::run(broker, messages).await,
        Scenario::All => Err(eyre::eyre!("'all' is not a single scenario")),
    }
}

/// Run the demo
///
/// 1. Sets up structured logging (env-aware: JSON for prod, pretty for dev)
/// 2. Optionally installs a Prometheus recorder
/// 3. Loads [`BrokerConfig`] from the environment
/// 4. Runs the selected scenario(s), each on its own broker
///
/// # Errors
///
/// Returns an error if the configuration is invalid or a scenario does not
/// observe the expected broker behaviour.
pub async fn run() -> Result<()> {
    install_color_eyre();
    let environment = Environment::from_env();
    init_tracing(&environment);

    let cli = Cli::parse();

    let prometheus = if cli.metrics {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .wrap_err("Failed to install Prometheus recorder")?;
        Some(handle)
    } else {
        None
    };

    let config = BrokerConfig::from_env().wrap_err("Failed to load broker configuration")?;
    info!(
        scenario = %cli.scenario,
        environment = ?environment,
        sweep_interval_ms = config.retention_sweep_interval.as_millis() as u64,
        "Starting broker demo"
    );

    let selected: Vec<Scenario> = match cli.scenario {
        Scenario::All => DEMOS.to_vec(),
        one => vec![one],
    };
    for scenario in selected {
        info!(scenario = %scenario, "Running scenario");
        let broker = Broker::new(config.clone());
        run_scenario(scenario, &broker)
            .await
            .wrap_err_with(|| format!("Scenario '{scenario}' failed"))?;
    }

    if let Some(handle) = prometheus {
        println!("{}", handle.render());
    }

    info!("Broker demo finished");
    Ok(())
}
