//! Runs the coordinator and a set of in-process clients without networking.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use federated_regression::client::{ClientRuntime, ClientSession};
use federated_regression::client_manager::ClientManager;
use federated_regression::common::{ClientId, TEST_METRICS_FILE, TRAIN_METRICS_FILE};
use federated_regression::config::{ClientConfig, ServerConfig, StrategyConfig};
use federated_regression::data::{load_partition, synthetic_partition};
use federated_regression::metrics::MetricsLog;
use federated_regression::model::build_model;
use federated_regression::orchestrator::RoundOrchestrator;
use federated_regression::proxy::LocalClientProxy;
use log::info;

#[derive(Parser)]
#[command(name = "federated-simulation")]
#[command(about = "Federated averaging with in-process clients")]
struct Args {
    #[arg(long, default_value = "3")]
    clients: ClientId,

    #[arg(long, default_value = "2")]
    rounds: u64,

    /// Minimum clients per phase; defaults to all of them
    #[arg(long)]
    min_clients: Option<usize>,

    /// Generate partitions instead of reading `data{ID}.csv`
    #[arg(long)]
    synthetic: bool,

    /// Rows per generated partition
    #[arg(long, default_value = "15")]
    rows: usize,

    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Directory receiving the train/test metrics logs
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    #[arg(long, default_value = "42")]
    seed: u64,

    #[arg(long)]
    save_model: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let base = ClientConfig {
        data_dir: args.data_dir.clone(),
        train_metrics: args.out_dir.join(TRAIN_METRICS_FILE),
        test_metrics: args.out_dir.join(TEST_METRICS_FILE),
        seed: args.seed,
        ..ClientConfig::default()
    };
    base.validate()?;
    let train_log = MetricsLog::new(base.train_metrics.clone());
    let test_log = MetricsLog::new(base.test_metrics.clone());

    let manager = Arc::new(ClientManager::new());
    for id in 1..=args.clients {
        let partition = if args.synthetic {
            synthetic_partition(id, args.rows, args.seed)
        } else {
            load_partition(&args.data_dir, id).with_context(|| format!("client {id}"))?
        };
        let config = ClientConfig {
            seed: args.seed.wrapping_add(u64::from(id)),
            ..base.clone()
        };
        let model = build_model(partition.input_dim(), partition.output_dim(), &config);
        let session = ClientSession::new(id, model, &partition, &config)
            .with_logs(train_log.clone(), test_log.clone());
        manager.register(Arc::new(LocalClientProxy::new(ClientRuntime::new(session))));
    }

    let min = args.min_clients.unwrap_or(args.clients as usize);
    let config = ServerConfig {
        num_rounds: args.rounds,
        availability_timeout_secs: 0,
        seed: Some(args.seed),
        strategy: StrategyConfig::with_min_clients(min),
        ..ServerConfig::default()
    };
    config.validate()?;

    let orchestrator = RoundOrchestrator::new(config, manager);
    let mut state = orchestrator.start(None).await?;
    orchestrator.run(&mut state).await?;

    for summary in state.history() {
        println!("{summary}");
    }
    info!(
        "Metrics written to {} and {}",
        train_log.path().display(),
        test_log.path().display()
    );
    if let Some(path) = &args.save_model {
        state.global().save_json(path)?;
        info!("Saved global parameters to {}", path.display());
    }
    Ok(())
}
