use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use federated_regression::client_manager::ClientManager;
use federated_regression::common::ParameterSet;
use federated_regression::config::ServerConfig;
use federated_regression::error::RunError;
use federated_regression::orchestrator::{RoundOrchestrator, ServerStatus};
use federated_regression::server::{serve_coordinator, ParameterServerService};
use log::{info, warn};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};

#[derive(Parser)]
#[command(name = "federated-server")]
#[command(about = "Coordinator for federated averaging rounds")]
struct Args {
    #[arg(long, env = "FL_SERVER_ADDRESS", default_value = "0.0.0.0:8080")]
    address: String,

    /// JSON server config; flags below override its values
    #[arg(long, env = "FL_SERVER_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    rounds: Option<u64>,

    #[arg(long)]
    min_fit_clients: Option<usize>,

    #[arg(long)]
    min_evaluate_clients: Option<usize>,

    #[arg(long)]
    min_available_clients: Option<usize>,

    #[arg(long)]
    fraction_fit: Option<f64>,

    #[arg(long)]
    fraction_evaluate: Option<f64>,

    #[arg(long)]
    round_timeout_secs: Option<u64>,

    #[arg(long)]
    max_retries: Option<u32>,

    /// Starting global parameters (JSON); otherwise taken from one client
    #[arg(long)]
    initial_model: Option<PathBuf>,

    /// Where to write the final global parameters (JSON)
    #[arg(long)]
    save_model: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,
}

impl Args {
    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_json(path)?,
            None => ServerConfig::default(),
        };
        if let Some(v) = self.rounds {
            config.num_rounds = v;
        }
        if let Some(v) = self.min_fit_clients {
            config.strategy.min_fit_clients = v;
        }
        if let Some(v) = self.min_evaluate_clients {
            config.strategy.min_evaluate_clients = v;
        }
        if let Some(v) = self.min_available_clients {
            config.strategy.min_available_clients = v;
        }
        if let Some(v) = self.fraction_fit {
            config.strategy.fraction_fit = v;
        }
        if let Some(v) = self.fraction_evaluate {
            config.strategy.fraction_evaluate = v;
        }
        if let Some(v) = self.round_timeout_secs {
            config.round_timeout_secs = v;
        }
        if let Some(v) = self.max_retries {
            config.retry.max_retries = v;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.server_config()?;
    let initial = args
        .initial_model
        .as_deref()
        .map(ParameterSet::load_json)
        .transpose()?;

    let clients = Arc::new(ClientManager::new());
    let (status_tx, status_rx) = watch::channel(ServerStatus::default());

    let listener = TcpListener::bind(&args.address)
        .await
        .with_context(|| format!("cannot bind {}", args.address))?;
    info!("Coordinator listening on {}", listener.local_addr()?);

    let service =
        ParameterServerService::new(Arc::clone(&clients), status_rx, config.round_timeout());
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let endpoint = tokio::spawn(serve_coordinator(listener, service, async {
        let _ = stop_rx.await;
    }));

    info!(
        "Running {} rounds (min fit {}, min available {})",
        config.num_rounds, config.strategy.min_fit_clients, config.strategy.min_available_clients
    );
    let orchestrator = RoundOrchestrator::new(config, clients).with_status(status_tx);
    let training = async {
        let mut state = orchestrator.start(initial).await?;
        orchestrator.run(&mut state).await?;
        Ok::<_, RunError>(state)
    };
    let outcome = tokio::select! {
        result = training => result.map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted");
            Err(anyhow!("interrupted before the last round"))
        }
    };

    orchestrator.shutdown_clients("training finished").await;
    let _ = stop_tx.send(());
    endpoint.await??;

    let state = outcome?;
    for summary in state.history() {
        info!("{}", summary);
    }
    if let Some(path) = &args.save_model {
        state.global().save_json(path)?;
        info!("Saved global parameters to {}", path.display());
    }
    Ok(())
}
