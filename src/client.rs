//! Client side of the protocol.
//!
//! [`ClientSession`] owns the local model and the private partition and
//! performs local training and evaluation. [`ClientRuntime`] puts a session
//! behind the `FederatedClient` gRPC service.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use crate::common::{ClientId, EvaluateIns, EvaluateRes, FitIns, FitRes, ParameterSet};
use crate::config::ClientConfig;
use crate::data::DataPartition;
use crate::error::ClientError;
use crate::federated_learning::federated_client_server::{FederatedClient, FederatedClientServer};
use crate::federated_learning::parameter_server_client::ParameterServerClient;
use crate::federated_learning::{
    EvaluateRequest, EvaluateResponse, FitRequest, FitResponse, GetParametersRequest,
    GetParametersResponse, RegisterRequest, ShutdownRequest, ShutdownResponse,
};
use crate::metrics::{MetricsLog, MetricsRecord};
use crate::model::Model;

fn model_err(e: anyhow::Error) -> ClientError {
    ClientError::Model(format!("{e:#}"))
}

/// One client's local state across Fit and Evaluate calls.
pub struct ClientSession<M: Model> {
    client_id: ClientId,
    model: M,
    train: DataPartition,
    test: DataPartition,
    train_log: MetricsLog,
    test_log: MetricsLog,
    epochs: usize,
    batch_size: usize,
}

impl<M: Model> ClientSession<M> {
    /// Splits `partition` at `config.train_rows` and logs to the configured files.
    pub fn new(
        client_id: ClientId,
        model: M,
        partition: &DataPartition,
        config: &ClientConfig,
    ) -> Self {
        let (train, test) = partition.split_at(config.train_rows);
        Self {
            client_id,
            model,
            train,
            test,
            train_log: MetricsLog::new(config.train_metrics.clone()),
            test_log: MetricsLog::new(config.test_metrics.clone()),
            epochs: config.local_epochs,
            batch_size: config.batch_size,
        }
    }

    /// Shares log handles with other sessions of the same process.
    pub fn with_logs(mut self, train_log: MetricsLog, test_log: MetricsLog) -> Self {
        self.train_log = train_log;
        self.test_log = test_log;
        self
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn num_train(&self) -> usize {
        self.train.rows()
    }

    pub fn num_test(&self) -> usize {
        self.test.rows()
    }

    pub fn get_parameters(&self) -> ParameterSet {
        self.model.get_weights()
    }

    /// Overwrites the local model with `params`. A layout mismatch leaves the
    /// local model untouched.
    pub fn load_global(&mut self, params: &ParameterSet) -> Result<(), ClientError> {
        self.model.get_weights().ensure_same_shape(params)?;
        self.model.set_weights(params).map_err(model_err)
    }

    pub fn fit(&mut self, ins: &FitIns) -> Result<FitRes, ClientError> {
        if self.train.is_empty() {
            return Err(ClientError::EmptyTrainingPartition);
        }
        self.load_global(&ins.parameters)?;
        self.model
            .fit(&self.train.features, &self.train.targets, self.epochs, self.batch_size)
            .map_err(model_err)?;

        let predictions = self.model.predict(&self.train.features).map_err(model_err)?;
        let metrics = MetricsRecord::compute(&self.train.targets, &predictions)?;
        let audit_error = self.record(&self.train_log, &metrics);
        info!(
            "Client {} round {} fit on {} rows: {}",
            self.client_id,
            ins.server_round,
            self.train.rows(),
            metrics.summary()
        );

        Ok(FitRes {
            parameters: self.model.get_weights(),
            num_examples: self.train.rows() as u64,
            metrics: Some(metrics),
            audit_error,
        })
    }

    /// Evaluates `ins.parameters` on the held-out rows without training.
    ///
    /// An empty held-out partition yields zero examples, no metrics and no
    /// log row.
    pub fn evaluate(&mut self, ins: &EvaluateIns) -> Result<EvaluateRes, ClientError> {
        self.load_global(&ins.parameters)?;
        if self.test.is_empty() {
            debug!("Client {} has no held-out rows", self.client_id);
            return Ok(EvaluateRes {
                loss: 0.0,
                num_examples: 0,
                metrics: None,
                audit_error: None,
            });
        }

        let predictions = self.model.predict(&self.test.features).map_err(model_err)?;
        let metrics = MetricsRecord::compute(&self.test.targets, &predictions)?;
        let audit_error = self.record(&self.test_log, &metrics);
        info!(
            "Client {} round {} evaluate on {} rows: {}",
            self.client_id,
            ins.server_round,
            self.test.rows(),
            metrics.summary()
        );

        Ok(EvaluateRes {
            loss: metrics.mse,
            num_examples: self.test.rows() as u64,
            metrics: Some(metrics),
            audit_error,
        })
    }

    fn record(&self, log: &MetricsLog, metrics: &MetricsRecord) -> Option<String> {
        match log.append(self.client_id, metrics) {
            Ok(()) => None,
            Err(e) => {
                warn!("Client {}: {}", self.client_id, e);
                Some(e.to_string())
            }
        }
    }
}

/// A session shared between RPC handlers. Local work runs on the blocking
/// pool, one call at a time.
pub struct ClientRuntime<M: Model> {
    client_id: ClientId,
    session: Arc<Mutex<ClientSession<M>>>,
    shutdown: Arc<Notify>,
}

impl<M: Model> Clone for ClientRuntime<M> {
    fn clone(&self) -> Self {
        Self {
            client_id: self.client_id,
            session: Arc::clone(&self.session),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl<M: Model> ClientRuntime<M> {
    pub fn new(session: ClientSession<M>) -> Self {
        Self {
            client_id: session.client_id(),
            session: Arc::new(Mutex::new(session)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T, ClientError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ClientSession<M>) -> Result<T, ClientError> + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        tokio::task::spawn_blocking(move || {
            let mut session = session.lock();
            f(&mut *session)
        })
        .await
        .map_err(|e| ClientError::Join(e.to_string()))?
    }

    pub async fn current_parameters(&self) -> Result<ParameterSet, ClientError> {
        self.run_blocking(|s| Ok(s.get_parameters())).await
    }

    pub async fn run_fit(&self, ins: FitIns) -> Result<FitRes, ClientError> {
        self.run_blocking(move |s| s.fit(&ins)).await
    }

    pub async fn run_evaluate(&self, ins: EvaluateIns) -> Result<EvaluateRes, ClientError> {
        self.run_blocking(move |s| s.evaluate(&ins)).await
    }

    pub fn request_shutdown(&self, reason: &str) {
        info!("Client {} shutting down: {}", self.client_id, reason);
        self.shutdown.notify_one();
    }

    /// Resolves once a shutdown has been requested.
    pub async fn stopped(&self) {
        self.shutdown.notified().await
    }
}

#[tonic::async_trait]
impl<M: Model> FederatedClient for ClientRuntime<M> {
    async fn get_parameters(
        &self,
        _request: Request<GetParametersRequest>,
    ) -> Result<Response<GetParametersResponse>, Status> {
        let params = self.current_parameters().await?;
        Ok(Response::new(GetParametersResponse {
            parameters: Some((&params).into()),
        }))
    }

    async fn fit(&self, request: Request<FitRequest>) -> Result<Response<FitResponse>, Status> {
        let ins = FitIns::try_from(request.into_inner()).map_err(ClientError::from)?;
        debug!("Client {} received fit for round {}", self.client_id, ins.server_round);
        let res = self.run_fit(ins).await.map_err(|e| {
            warn!("Client {} fit failed: {}", self.client_id, e);
            e
        })?;
        Ok(Response::new((&res).into()))
    }

    async fn evaluate(
        &self,
        request: Request<EvaluateRequest>,
    ) -> Result<Response<EvaluateResponse>, Status> {
        let ins = EvaluateIns::try_from(request.into_inner()).map_err(ClientError::from)?;
        debug!("Client {} received evaluate for round {}", self.client_id, ins.server_round);
        let res = self.run_evaluate(ins).await.map_err(|e| {
            warn!("Client {} evaluate failed: {}", self.client_id, e);
            e
        })?;
        Ok(Response::new((&res).into()))
    }

    async fn shutdown(
        &self,
        request: Request<ShutdownRequest>,
    ) -> Result<Response<ShutdownResponse>, Status> {
        self.request_shutdown(&request.into_inner().reason);
        Ok(Response::new(ShutdownResponse {}))
    }
}

/// Serves `runtime` on `listener` until the coordinator sends `Shutdown` or
/// `signal` resolves.
pub async fn serve_client<M, F>(
    listener: TcpListener,
    runtime: ClientRuntime<M>,
    signal: F,
) -> Result<(), ClientError>
where
    M: Model,
    F: Future<Output = ()> + Send,
{
    let stop_on = runtime.clone();
    let stop = async move {
        tokio::select! {
            _ = stop_on.stopped() => {}
            _ = signal => {}
        }
    };
    Server::builder()
        .add_service(FederatedClientServer::new(runtime))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), stop)
        .await?;
    Ok(())
}

/// Announces this client's endpoint to the coordinator, retrying the
/// connection while the coordinator comes up.
pub async fn register_with_server(
    server_address: &str,
    client_id: ClientId,
    advertise: &str,
    attempts: u32,
    delay: Duration,
) -> Result<(), ClientError> {
    let endpoint = format!("http://{server_address}");
    let mut attempt = 0;
    let mut server = loop {
        attempt += 1;
        match ParameterServerClient::connect(endpoint.clone()).await {
            Ok(server) => break server,
            Err(e) if attempt < attempts => {
                warn!(
                    "Coordinator at {} not reachable (attempt {}/{}): {}",
                    server_address, attempt, attempts, e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e.into()),
        }
    };

    let reply = server
        .register(RegisterRequest {
            client_id,
            address: advertise.to_string(),
        })
        .await?
        .into_inner();
    if !reply.accepted {
        return Err(Status::already_exists(reply.message).into());
    }
    info!("Client {} registered at {} as {}", client_id, server_address, advertise);
    Ok(())
}
