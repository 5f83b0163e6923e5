//! The coordinator's handle on a client.

use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

use crate::client::ClientRuntime;
use crate::common::{
    decode_parameters, ClientId, EvaluateIns, EvaluateRes, FitIns, FitRes, ParameterSet,
};
use crate::error::ClientError;
use crate::federated_learning as proto;
use crate::federated_learning::federated_client_client::FederatedClientClient;
use crate::model::Model;

/// Remote procedure surface of one client, independent of transport.
///
/// Calls carry no deadline of their own; the orchestrator bounds each one.
#[tonic::async_trait]
pub trait ClientProxy: Send + Sync {
    fn client_id(&self) -> ClientId;

    async fn get_parameters(&self) -> Result<ParameterSet, ClientError>;

    async fn fit(&self, ins: FitIns) -> Result<FitRes, ClientError>;

    async fn evaluate(&self, ins: EvaluateIns) -> Result<EvaluateRes, ClientError>;

    async fn shutdown(&self, reason: &str) -> Result<(), ClientError>;
}

/// A client reached over gRPC at the address it registered with.
pub struct GrpcClientProxy {
    client_id: ClientId,
    address: String,
    client: FederatedClientClient<Channel>,
}

impl GrpcClientProxy {
    /// Builds the channel without dialling; the first call connects.
    pub fn connect_lazy(
        client_id: ClientId,
        address: &str,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let channel = Endpoint::from_shared(format!("http://{address}"))?
            .connect_timeout(timeout)
            .timeout(timeout)
            .connect_lazy();
        Ok(Self {
            client_id,
            address: address.to_string(),
            client: FederatedClientClient::new(channel),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[tonic::async_trait]
impl ClientProxy for GrpcClientProxy {
    fn client_id(&self) -> ClientId {
        self.client_id
    }

    async fn get_parameters(&self) -> Result<ParameterSet, ClientError> {
        let mut client = self.client.clone();
        let reply = client
            .get_parameters(proto::GetParametersRequest {})
            .await?
            .into_inner();
        Ok(decode_parameters(reply.parameters)?)
    }

    async fn fit(&self, ins: FitIns) -> Result<FitRes, ClientError> {
        let mut client = self.client.clone();
        let reply = client.fit(proto::FitRequest::from(&ins)).await?.into_inner();
        Ok(FitRes::try_from(reply)?)
    }

    async fn evaluate(&self, ins: EvaluateIns) -> Result<EvaluateRes, ClientError> {
        let mut client = self.client.clone();
        let reply = client
            .evaluate(proto::EvaluateRequest::from(&ins))
            .await?
            .into_inner();
        Ok(reply.into())
    }

    async fn shutdown(&self, reason: &str) -> Result<(), ClientError> {
        let mut client = self.client.clone();
        client
            .shutdown(proto::ShutdownRequest {
                reason: reason.to_string(),
            })
            .await?;
        Ok(())
    }
}

/// A client living in the coordinator's process, used by simulations.
pub struct LocalClientProxy<M: Model> {
    runtime: ClientRuntime<M>,
}

impl<M: Model> LocalClientProxy<M> {
    pub fn new(runtime: ClientRuntime<M>) -> Self {
        Self { runtime }
    }
}

#[tonic::async_trait]
impl<M: Model> ClientProxy for LocalClientProxy<M> {
    fn client_id(&self) -> ClientId {
        self.runtime.client_id()
    }

    async fn get_parameters(&self) -> Result<ParameterSet, ClientError> {
        self.runtime.current_parameters().await
    }

    async fn fit(&self, ins: FitIns) -> Result<FitRes, ClientError> {
        self.runtime.run_fit(ins).await
    }

    async fn evaluate(&self, ins: EvaluateIns) -> Result<EvaluateRes, ClientError> {
        self.runtime.run_evaluate(ins).await
    }

    async fn shutdown(&self, reason: &str) -> Result<(), ClientError> {
        self.runtime.request_shutdown(reason);
        Ok(())
    }
}
