//! Federated averaging of a shared regression model.
//!
//! A coordinator drives synchronous rounds over a set of clients. Each round
//! broadcasts the global parameters, lets every selected client fine-tune on
//! its private partition, averages the returned parameters weighted by
//! example count, and evaluates the new global model on the clients'
//! held-out rows.

pub mod federated_learning {
    tonic::include_proto!("federated_learning");
}

pub mod aggregate;
pub mod client;
pub mod client_manager;
pub mod common;
pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod proxy;
pub mod server;
