use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use federated_regression::client::{
    register_with_server, serve_client, ClientRuntime, ClientSession,
};
use federated_regression::common::ClientId;
use federated_regression::config::ClientConfig;
use federated_regression::data::{load_partition, synthetic_partition};
use federated_regression::model::build_model;
use log::info;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "federated-client")]
#[command(about = "A federated learning client holding one private partition")]
struct Args {
    /// Selects `data{ID}.csv` and tags every metrics row
    #[arg(long, env = "FL_CLIENT_ID")]
    client_id: ClientId,

    #[arg(long, env = "FL_SERVER_ADDRESS", default_value = "localhost:8080")]
    server_address: String,

    /// Address this client's endpoint binds to
    #[arg(long, default_value = "127.0.0.1:0")]
    listen: String,

    /// Address announced to the coordinator; defaults to the bound address
    #[arg(long)]
    advertise: Option<String>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    train_metrics: Option<PathBuf>,

    #[arg(long)]
    test_metrics: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,

    /// Use a generated partition of this many rows instead of a CSV file
    #[arg(long)]
    synthetic: Option<usize>,

    /// JSON client config; flags above override its values
    #[arg(long, env = "FL_CLIENT_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, default_value = "30")]
    register_attempts: u32,
}

impl Args {
    fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::from_json(path)?,
            None => ClientConfig::default(),
        };
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(path) = &self.train_metrics {
            config.train_metrics = path.clone();
        }
        if let Some(path) = &self.test_metrics {
            config.test_metrics = path.clone();
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.client_config()?;
    let partition = match args.synthetic {
        Some(rows) => synthetic_partition(args.client_id, rows, config.seed),
        None => load_partition(&config.data_dir, args.client_id)
            .with_context(|| format!("client {}", args.client_id))?,
    };

    let model = build_model(partition.input_dim(), partition.output_dim(), &config);
    let session = ClientSession::new(args.client_id, model, &partition, &config);
    info!(
        "Client {}: {} training rows, {} held-out rows",
        args.client_id,
        session.num_train(),
        session.num_test()
    );
    let runtime = ClientRuntime::new(session);

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("cannot bind {}", args.listen))?;
    let local = listener.local_addr()?;
    let advertise = args.advertise.clone().unwrap_or_else(|| local.to_string());
    info!("Client {} serving on {}", args.client_id, local);

    let serving = tokio::spawn(serve_client(listener, runtime, async {
        let _ = tokio::signal::ctrl_c().await;
    }));
    register_with_server(
        &args.server_address,
        args.client_id,
        &advertise,
        args.register_attempts,
        Duration::from_secs(1),
    )
    .await?;

    serving.await??;
    info!("Client {} stopped", args.client_id);
    Ok(())
}
