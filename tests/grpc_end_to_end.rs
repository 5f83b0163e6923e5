use std::sync::Arc;
use std::time::Duration;

use federated_regression::client::{
    register_with_server, serve_client, ClientRuntime, ClientSession,
};
use federated_regression::client_manager::ClientManager;
use federated_regression::common::ParameterSet;
use federated_regression::config::{ClientConfig, ServerConfig, StrategyConfig};
use federated_regression::data::synthetic_partition;
use federated_regression::federated_learning::parameter_server_client::ParameterServerClient;
use federated_regression::federated_learning::{GetModelRequest, RoundPhase as WirePhase};
use federated_regression::metrics::MetricsLog;
use federated_regression::model::build_model;
use federated_regression::orchestrator::{RoundOrchestrator, ServerStatus};
use federated_regression::server::{serve_coordinator, ParameterServerService};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn clients_register_train_and_shut_down_over_grpc() {
    let dir = tempfile::tempdir().unwrap();

    let clients = Arc::new(ClientManager::new());
    let (status_tx, status_rx) = watch::channel(ServerStatus::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap().to_string();
    let service =
        ParameterServerService::new(Arc::clone(&clients), status_rx, Duration::from_secs(30));
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let coordinator = tokio::spawn(serve_coordinator(listener, service, async {
        let _ = stop_rx.await;
    }));

    let config = ClientConfig {
        train_metrics: dir.path().join("train_metrics.csv"),
        test_metrics: dir.path().join("test_metrics.csv"),
        ..ClientConfig::default()
    };
    let train_log = MetricsLog::new(config.train_metrics.clone());
    let test_log = MetricsLog::new(config.test_metrics.clone());
    let mut serving = Vec::new();
    for id in 1..=3 {
        let partition = synthetic_partition(id, 15, 99);
        let model = build_model(partition.input_dim(), partition.output_dim(), &config);
        let session = ClientSession::new(id, model, &partition, &config)
            .with_logs(train_log.clone(), test_log.clone());
        let runtime = ClientRuntime::new(session);
        let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let advertise = client_listener.local_addr().unwrap().to_string();
        serving.push(tokio::spawn(serve_client(
            client_listener,
            runtime,
            std::future::pending::<()>(),
        )));
        register_with_server(&server_addr, id, &advertise, 10, Duration::from_millis(50))
            .await
            .unwrap();
    }

    let duplicate =
        register_with_server(&server_addr, 2, "127.0.0.1:9", 1, Duration::from_millis(10)).await;
    assert!(duplicate.is_err());
    assert_eq!(clients.num_available(), 3);

    let server_config = ServerConfig {
        num_rounds: 1,
        round_timeout_secs: 30,
        availability_timeout_secs: 5,
        seed: Some(3),
        strategy: StrategyConfig::with_min_clients(3),
        ..ServerConfig::default()
    };
    let orchestrator =
        RoundOrchestrator::new(server_config, Arc::clone(&clients)).with_status(status_tx);
    let mut state = orchestrator.start(None).await.unwrap();
    orchestrator.run(&mut state).await.unwrap();

    let summary = &state.history()[0];
    assert_eq!(summary.fit.participants.len(), 3);
    assert_eq!(summary.fit.num_examples, 24);
    assert_eq!(summary.evaluation.as_ref().unwrap().participants.len(), 3);

    let mut observer = ParameterServerClient::connect(format!("http://{server_addr}"))
        .await
        .unwrap();
    let model = observer.get_model(GetModelRequest {}).await.unwrap().into_inner();
    assert_eq!(model.round, 1);
    assert_eq!(model.phase, WirePhase::Finished as i32);
    assert_eq!(model.available_clients, 3);
    let published = ParameterSet::try_from(model.parameters.unwrap()).unwrap();
    assert_eq!(&published, state.global());

    drop(observer);
    assert_eq!(test_log.read_rows().unwrap().len(), 3);

    orchestrator.shutdown_clients("test finished").await;
    for handle in serving {
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("client did not stop")
            .unwrap()
            .unwrap();
    }

    let _ = stop_tx.send(());
    coordinator.await.unwrap().unwrap();
}
