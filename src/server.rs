//! Coordinator-side gRPC endpoint.
//!
//! Clients announce themselves through `Register`; observers poll `GetModel`
//! for the round, phase and current global parameters.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use crate::client_manager::ClientManager;
use crate::federated_learning as proto;
use crate::federated_learning::parameter_server_server::{ParameterServer, ParameterServerServer};
use crate::orchestrator::ServerStatus;
use crate::proxy::GrpcClientProxy;

pub struct ParameterServerService {
    clients: Arc<ClientManager>,
    status: watch::Receiver<ServerStatus>,
    call_timeout: Duration,
}

impl ParameterServerService {
    /// `call_timeout` bounds connection setup and every call to a registered client.
    pub fn new(
        clients: Arc<ClientManager>,
        status: watch::Receiver<ServerStatus>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            clients,
            status,
            call_timeout,
        }
    }
}

#[tonic::async_trait]
impl ParameterServer for ParameterServerService {
    async fn register(
        &self,
        request: Request<proto::RegisterRequest>,
    ) -> Result<Response<proto::RegisterResponse>, Status> {
        let req = request.into_inner();
        if req.address.trim().is_empty() {
            return Err(Status::invalid_argument("client address is empty"));
        }
        info!("Registration request from client {} at {}", req.client_id, req.address);

        let proxy = GrpcClientProxy::connect_lazy(req.client_id, &req.address, self.call_timeout)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        if !self.clients.register(Arc::new(proxy)) {
            warn!("Client {} is already registered", req.client_id);
            return Ok(Response::new(proto::RegisterResponse {
                accepted: false,
                message: format!("client {} is already registered", req.client_id),
            }));
        }

        Ok(Response::new(proto::RegisterResponse {
            accepted: true,
            message: format!("client {} registered", req.client_id),
        }))
    }

    async fn get_model(
        &self,
        _request: Request<proto::GetModelRequest>,
    ) -> Result<Response<proto::GetModelResponse>, Status> {
        let status = self.status.borrow().clone();
        Ok(Response::new(proto::GetModelResponse {
            round: status.round,
            phase: proto::RoundPhase::from(status.phase) as i32,
            parameters: status.global.as_ref().map(Into::into),
            available_clients: self.clients.num_available() as u32,
        }))
    }
}

/// Serves the coordinator endpoint on `listener` until `signal` resolves.
pub async fn serve_coordinator<F>(
    listener: TcpListener,
    service: ParameterServerService,
    signal: F,
) -> Result<(), tonic::transport::Error>
where
    F: Future<Output = ()> + Send,
{
    Server::builder()
        .add_service(ParameterServerServer::new(service))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
        .await
}
