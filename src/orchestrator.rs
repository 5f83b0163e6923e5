//! Round orchestration.
//!
//! A run is a sequence of synchronous rounds. Each round samples clients,
//! broadcasts the global parameters for local training, averages the usable
//! contributions into the next global parameters and then evaluates that
//! result on a second sample. All mutable run state lives in [`RunState`],
//! which the caller owns and passes into every round.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::watch;

use crate::aggregate::{aggregate_metrics, aggregate_params, weighted_mean};
use crate::client_manager::ClientManager;
use crate::common::{ClientId, EvaluateIns, EvaluateRes, FitIns, FitRes, ParameterSet};
use crate::config::ServerConfig;
use crate::error::{ClientError, Phase, RoundError, RunError};
use crate::federated_learning as proto;
use crate::metrics::MetricsRecord;
use crate::proxy::ClientProxy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoundPhase {
    #[default]
    Idle,
    Fit,
    Evaluate,
    Complete,
    Finished,
}

impl From<RoundPhase> for proto::RoundPhase {
    fn from(phase: RoundPhase) -> Self {
        match phase {
            RoundPhase::Idle => proto::RoundPhase::Idle,
            RoundPhase::Fit => proto::RoundPhase::Fit,
            RoundPhase::Evaluate => proto::RoundPhase::Evaluate,
            RoundPhase::Complete => proto::RoundPhase::Complete,
            RoundPhase::Finished => proto::RoundPhase::Finished,
        }
    }
}

/// Snapshot published to observers after every phase change.
#[derive(Debug, Clone, Default)]
pub struct ServerStatus {
    pub round: u64,
    pub phase: RoundPhase,
    pub global: Option<ParameterSet>,
}

/// Everything that changes over a run.
#[derive(Debug)]
pub struct RunState {
    current_round: u64,
    phase: RoundPhase,
    global: ParameterSet,
    history: Vec<RoundSummary>,
    rng: StdRng,
}

impl RunState {
    /// A fresh run starting from `global`. `seed` fixes client sampling.
    pub fn new(global: ParameterSet, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            current_round: 0,
            phase: RoundPhase::Idle,
            global,
            history: Vec::new(),
            rng,
        }
    }

    /// Last completed round; 0 before the first.
    pub fn current_round(&self) -> u64 {
        self.current_round
    }

    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    pub fn global(&self) -> &ParameterSet {
        &self.global
    }

    pub fn history(&self) -> &[RoundSummary] {
        &self.history
    }

    pub fn into_global(self) -> ParameterSet {
        self.global
    }
}

#[derive(Debug, Clone, Default)]
pub struct FitSummary {
    /// Clients whose parameters went into the new global model.
    pub participants: Vec<ClientId>,
    /// Clients that answered with zero training examples.
    pub rejected: Vec<ClientId>,
    /// Clients that failed, timed out or sent unusable parameters.
    pub failures: Vec<(ClientId, String)>,
    pub num_examples: u64,
    /// Training metrics weighted by training rows.
    pub metrics: Option<MetricsRecord>,
}

#[derive(Debug, Clone)]
pub struct EvaluationSummary {
    /// Weighted mean of the clients' losses.
    pub loss: f64,
    pub metrics: Option<MetricsRecord>,
    pub participants: Vec<ClientId>,
    pub num_examples: u64,
}

#[derive(Debug, Clone)]
pub struct RoundSummary {
    pub round: u64,
    pub fit: FitSummary,
    /// Absent when too few clients could evaluate.
    pub evaluation: Option<EvaluationSummary>,
    /// Clients whose metrics log append failed this round.
    pub audit_incomplete: Vec<ClientId>,
}

impl fmt::Display for RoundSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "round {}: fit {} clients / {} examples",
            self.round,
            self.fit.participants.len(),
            self.fit.num_examples
        )?;
        if let Some(m) = &self.fit.metrics {
            write!(f, " [{}]", m.summary())?;
        }
        match &self.evaluation {
            Some(eval) => {
                write!(
                    f,
                    "; evaluate {} clients, loss {:.4}",
                    eval.participants.len(),
                    eval.loss
                )?;
                if let Some(m) = &eval.metrics {
                    write!(f, " [{}]", m.summary())?;
                }
            }
            None => write!(f, "; no evaluation")?,
        }
        if !self.audit_incomplete.is_empty() {
            write!(f, "; incomplete audit trail for {:?}", self.audit_incomplete)?;
        }
        Ok(())
    }
}

async fn bounded<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, ClientError>>,
) -> Result<T, ClientError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Timeout(timeout)),
    }
}

/// Drives rounds against the clients in a [`ClientManager`].
pub struct RoundOrchestrator {
    config: ServerConfig,
    clients: Arc<ClientManager>,
    status: Option<watch::Sender<ServerStatus>>,
}

impl RoundOrchestrator {
    pub fn new(config: ServerConfig, clients: Arc<ClientManager>) -> Self {
        Self {
            config,
            clients,
            status: None,
        }
    }

    /// Publishes a [`ServerStatus`] on every phase change.
    pub fn with_status(mut self, status: watch::Sender<ServerStatus>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn clients(&self) -> &Arc<ClientManager> {
        &self.clients
    }

    fn publish(&self, state: &RunState) {
        if let Some(tx) = &self.status {
            tx.send_replace(ServerStatus {
                round: state.current_round,
                phase: state.phase,
                global: Some(state.global.clone()),
            });
        }
    }

    fn enter(&self, state: &mut RunState, phase: RoundPhase) {
        state.phase = phase;
        self.publish(state);
    }

    /// Creates the run state, seeding the global model either from `provided`
    /// or from one randomly chosen client's freshly initialised model.
    pub async fn start(&self, provided: Option<ParameterSet>) -> Result<RunState, RunError> {
        let mut state = RunState::new(ParameterSet::new(Vec::new()), self.config.seed);
        state.global = match provided {
            Some(params) => {
                info!("Using provided initial parameters ({} tensors)", params.len());
                params
            }
            None => self.parameters_from_client(&mut state.rng).await?,
        };
        self.publish(&state);
        Ok(state)
    }

    async fn parameters_from_client(&self, rng: &mut StdRng) -> Result<ParameterSet, RunError> {
        info!("Requesting initial parameters from one random client");
        if !self
            .clients
            .wait_for(1, self.config.availability_timeout())
            .await
        {
            return Err(RunError::NoInitialParameters(
                "no client became available".to_string(),
            ));
        }
        let client = self
            .clients
            .sample(1, rng)
            .pop()
            .ok_or_else(|| RunError::NoInitialParameters("no client available".to_string()))?;
        let params = bounded(self.config.round_timeout(), client.get_parameters())
            .await
            .map_err(|e| {
                RunError::NoInitialParameters(format!("client {}: {}", client.client_id(), e))
            })?;
        info!(
            "Received initial parameters from client {} ({} tensors)",
            client.client_id(),
            params.len()
        );
        Ok(params)
    }

    async fn select(
        &self,
        round: u64,
        phase: Phase,
        rng: &mut StdRng,
    ) -> Result<Vec<Arc<dyn ClientProxy>>, RoundError> {
        let strategy = &self.config.strategy;
        let required = strategy.min_available_clients;
        if !self
            .clients
            .wait_for(required, self.config.availability_timeout())
            .await
        {
            return Err(RoundError::InsufficientClients {
                round,
                available: self.clients.num_available(),
                required,
            });
        }

        let available = self.clients.num_available();
        let wanted = match phase {
            Phase::Fit => strategy.num_fit_clients(available),
            Phase::Evaluate => strategy.num_evaluate_clients(available),
        };
        let sample = self.clients.sample(wanted, rng);
        if sample.len() < wanted {
            return Err(RoundError::InsufficientClients {
                round,
                available: sample.len(),
                required: wanted,
            });
        }
        debug!(
            "Round {} {}: sampled {} of {} clients",
            round,
            phase,
            sample.len(),
            available
        );
        Ok(sample)
    }

    /// Runs round `state.current_round() + 1`.
    ///
    /// On error the global parameters and the round counter are unchanged and
    /// the state returns to `Idle`.
    pub async fn run_round(&self, state: &mut RunState) -> Result<RoundSummary, RoundError> {
        match self.execute_round(state).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                self.enter(state, RoundPhase::Idle);
                Err(e)
            }
        }
    }

    async fn execute_round(&self, state: &mut RunState) -> Result<RoundSummary, RoundError> {
        let round = state.current_round + 1;
        let timeout = self.config.round_timeout();
        info!("Round {}: fit phase", round);
        self.enter(state, RoundPhase::Fit);

        let selected = self.select(round, Phase::Fit, &mut state.rng).await?;
        let ins = FitIns {
            parameters: state.global.clone(),
            server_round: round,
        };
        let replies = join_all(
            selected
                .iter()
                .map(|client| bounded(timeout, client.fit(ins.clone()))),
        )
        .await;

        let mut fit = FitSummary::default();
        let mut audit_incomplete = Vec::new();
        let mut usable: Vec<(ClientId, FitRes)> = Vec::new();
        for (client, reply) in selected.iter().zip(replies) {
            let id = client.client_id();
            match reply {
                Ok(res) => match state.global.ensure_same_shape(&res.parameters) {
                    Ok(()) => usable.push((id, res)),
                    Err(e) => {
                        warn!("Round {}: client {} sent unusable parameters: {}", round, id, e);
                        fit.failures.push((id, e.to_string()));
                    }
                },
                Err(e) => {
                    warn!("Round {}: client {} fit failed: {}", round, id, e);
                    fit.failures.push((id, e.to_string()));
                }
            }
        }

        let required = self.config.strategy.min_fit_clients;
        if usable.len() < required {
            return Err(RoundError::InsufficientParticipation {
                round,
                phase: Phase::Fit,
                accepted: usable.len(),
                required,
            });
        }

        let contributions: Vec<(ClientId, &ParameterSet, u64)> = usable
            .iter()
            .map(|(id, res)| (*id, &res.parameters, res.num_examples))
            .collect();
        let next_global = aggregate_params(&contributions)
            .map_err(|source| RoundError::Aggregation { round, source })?;

        for (id, res) in &usable {
            if res.num_examples == 0 {
                warn!("Round {}: client {} trained on zero examples, rejected", round, id);
                fit.rejected.push(*id);
            } else {
                fit.participants.push(*id);
                fit.num_examples += res.num_examples;
            }
            if let Some(audit) = &res.audit_error {
                warn!("Round {}: client {} audit trail incomplete: {}", round, id, audit);
                audit_incomplete.push(*id);
            }
        }
        if fit.participants.len() < required {
            return Err(RoundError::InsufficientParticipation {
                round,
                phase: Phase::Fit,
                accepted: fit.participants.len(),
                required,
            });
        }

        let train_metrics: Vec<(MetricsRecord, u64)> = usable
            .iter()
            .filter(|(_, res)| res.num_examples > 0)
            .filter_map(|(_, res)| res.metrics.map(|m| (m, res.num_examples)))
            .collect();
        if !train_metrics.is_empty() {
            fit.metrics = aggregate_metrics(&train_metrics).ok();
        }

        state.global = next_global;
        info!(
            "Round {}: aggregated {} contributions over {} examples",
            round,
            fit.participants.len(),
            fit.num_examples
        );

        let evaluation = if self.config.strategy.evaluation_enabled() {
            self.enter(state, RoundPhase::Evaluate);
            self.evaluate_phase(round, state, &mut audit_incomplete).await
        } else {
            None
        };

        let summary = RoundSummary {
            round,
            fit,
            evaluation,
            audit_incomplete,
        };
        state.current_round = round;
        state.history.push(summary.clone());
        self.enter(state, RoundPhase::Complete);
        info!("{}", summary);
        Ok(summary)
    }

    /// Evaluates the new global model. Shortfalls are logged and yield `None`.
    async fn evaluate_phase(
        &self,
        round: u64,
        state: &mut RunState,
        audit_incomplete: &mut Vec<ClientId>,
    ) -> Option<EvaluationSummary> {
        info!("Round {}: evaluate phase", round);
        let selected = match self.select(round, Phase::Evaluate, &mut state.rng).await {
            Ok(selected) => selected,
            Err(e) => {
                warn!("Round {}: skipping evaluation: {}", round, e);
                return None;
            }
        };

        let timeout = self.config.round_timeout();
        let ins = EvaluateIns {
            parameters: state.global.clone(),
            server_round: round,
        };
        let replies = join_all(
            selected
                .iter()
                .map(|client| bounded(timeout, client.evaluate(ins.clone()))),
        )
        .await;

        let mut usable: Vec<(ClientId, EvaluateRes)> = Vec::new();
        for (client, reply) in selected.iter().zip(replies) {
            let id = client.client_id();
            match reply {
                Ok(res) => {
                    if let Some(audit) = &res.audit_error {
                        warn!("Round {}: client {} audit trail incomplete: {}", round, id, audit);
                        if !audit_incomplete.contains(&id) {
                            audit_incomplete.push(id);
                        }
                    }
                    if res.num_examples == 0 {
                        debug!("Round {}: client {} has nothing to evaluate", round, id);
                    } else {
                        usable.push((id, res));
                    }
                }
                Err(e) => warn!("Round {}: client {} evaluate failed: {}", round, id, e),
            }
        }

        if usable.is_empty() {
            warn!("Round {}: no evaluation results to aggregate", round);
            return None;
        }

        let loss = match weighted_mean(usable.iter().map(|(_, r)| (r.loss, r.num_examples))) {
            Ok(loss) => loss,
            Err(e) => {
                warn!("Round {}: cannot aggregate evaluation loss: {}", round, e);
                return None;
            }
        };
        let metrics: Vec<(MetricsRecord, u64)> = usable
            .iter()
            .filter_map(|(_, r)| r.metrics.map(|m| (m, r.num_examples)))
            .collect();
        let metrics = if metrics.is_empty() {
            None
        } else {
            aggregate_metrics(&metrics).ok()
        };

        Some(EvaluationSummary {
            loss,
            metrics,
            num_examples: usable.iter().map(|(_, r)| r.num_examples).sum(),
            participants: usable.into_iter().map(|(id, _)| id).collect(),
        })
    }

    /// Runs rounds until `num_rounds` have completed.
    ///
    /// A retryable round failure is retried up to `retry.max_retries` times
    /// without advancing the round counter. Any other failure, or running out
    /// of retries, stops the run with the state left at the last completed
    /// round.
    pub async fn run(&self, state: &mut RunState) -> Result<(), RunError> {
        let policy = &self.config.retry;
        while state.current_round < self.config.num_rounds {
            let round = state.current_round + 1;
            let mut attempts = 0u32;
            loop {
                attempts += 1;
                match self.run_round(state).await {
                    Ok(_) => break,
                    Err(e) if e.is_retryable() && attempts <= policy.max_retries => {
                        warn!(
                            "{} (attempt {}/{}), retrying in {:?}",
                            e,
                            attempts,
                            policy.max_retries + 1,
                            policy.backoff()
                        );
                        tokio::time::sleep(policy.backoff()).await;
                    }
                    Err(source) => {
                        error!("Run stopped: {}", source);
                        return Err(RunError::Round {
                            round,
                            attempts,
                            source,
                        });
                    }
                }
            }
        }
        self.enter(state, RoundPhase::Finished);
        info!("Run finished after {} rounds", state.current_round);
        Ok(())
    }

    /// Tells every registered client to stop serving.
    pub async fn shutdown_clients(&self, reason: &str) {
        let clients = self.clients.all();
        let replies = join_all(clients.iter().map(|c| c.shutdown(reason))).await;
        for (client, reply) in clients.iter().zip(replies) {
            if let Err(e) = reply {
                warn!("Shutdown of client {} failed: {}", client.client_id(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyConfig;
    use ndarray::arr1;

    /// Answers every call from a fixed script.
    struct Scripted {
        id: ClientId,
        value: f32,
        examples: u64,
        fail_fit: bool,
        /// Replies with a three-value tensor instead of the two-value layout.
        wrong_shape: bool,
    }

    #[tonic::async_trait]
    impl ClientProxy for Scripted {
        fn client_id(&self) -> ClientId {
            self.id
        }
        async fn get_parameters(&self) -> Result<ParameterSet, ClientError> {
            Ok(ParameterSet::new(vec![arr1(&[0.0f32, 0.0]).into_dyn()]))
        }
        async fn fit(&self, _ins: FitIns) -> Result<FitRes, ClientError> {
            if self.fail_fit {
                return Err(ClientError::Model("scripted failure".into()));
            }
            if self.wrong_shape {
                return Ok(FitRes {
                    parameters: ParameterSet::new(vec![arr1(&[self.value; 3]).into_dyn()]),
                    num_examples: self.examples,
                    metrics: None,
                    audit_error: None,
                });
            }
            Ok(FitRes {
                parameters: ParameterSet::new(vec![arr1(&[self.value, -self.value]).into_dyn()]),
                num_examples: self.examples,
                metrics: None,
                audit_error: None,
            })
        }
        async fn evaluate(&self, _ins: EvaluateIns) -> Result<EvaluateRes, ClientError> {
            Ok(EvaluateRes {
                loss: f64::from(self.value),
                num_examples: self.examples,
                metrics: None,
                audit_error: None,
            })
        }
        async fn shutdown(&self, _reason: &str) -> Result<(), ClientError> {
            Ok(())
        }
    }

    fn scripted(id: ClientId, value: f32, examples: u64) -> Arc<dyn ClientProxy> {
        Arc::new(Scripted {
            id,
            value,
            examples,
            fail_fit: false,
            wrong_shape: false,
        })
    }

    fn misshapen(id: ClientId, value: f32, examples: u64) -> Arc<dyn ClientProxy> {
        Arc::new(Scripted {
            id,
            value,
            examples,
            fail_fit: false,
            wrong_shape: true,
        })
    }

    fn orchestrator(min: usize, clients: Vec<Arc<dyn ClientProxy>>) -> RoundOrchestrator {
        let manager = Arc::new(ClientManager::new());
        for c in clients {
            manager.register(c);
        }
        let config = ServerConfig {
            num_rounds: 2,
            round_timeout_secs: 5,
            availability_timeout_secs: 0,
            seed: Some(1),
            strategy: StrategyConfig::with_min_clients(min),
            ..ServerConfig::default()
        };
        RoundOrchestrator::new(config, manager)
    }

    fn seed_params() -> ParameterSet {
        ParameterSet::new(vec![arr1(&[0.0f32, 0.0]).into_dyn()])
    }

    #[tokio::test]
    async fn round_averages_by_example_count() {
        let orch = orchestrator(2, vec![scripted(1, 1.0, 1), scripted(2, 4.0, 3)]);
        let mut state = RunState::new(seed_params(), Some(1));
        let summary = orch.run_round(&mut state).await.unwrap();
        assert_eq!(state.current_round(), 1);
        assert_eq!(state.phase(), RoundPhase::Complete);
        assert_eq!(state.global().tensors()[0], arr1(&[3.25f32, -3.25]).into_dyn());
        let eval = summary.evaluation.unwrap();
        assert!((eval.loss - 3.25).abs() < 1e-9);
        assert_eq!(eval.num_examples, 4);
    }

    #[tokio::test]
    async fn zero_weight_client_is_rejected_not_averaged() {
        let orch = orchestrator(
            2,
            vec![scripted(1, 2.0, 5), scripted(2, 100.0, 0), scripted(3, 4.0, 5)],
        );
        let mut state = RunState::new(seed_params(), Some(1));
        let summary = orch.run_round(&mut state).await.unwrap();
        assert_eq!(summary.fit.rejected, vec![2]);
        assert_eq!(state.global().tensors()[0], arr1(&[3.0f32, -3.0]).into_dyn());
    }

    #[tokio::test]
    async fn zero_weight_below_minimum_fails_the_round() {
        let orch = orchestrator(2, vec![scripted(1, 2.0, 5), scripted(2, 100.0, 0)]);
        let mut state = RunState::new(seed_params(), Some(1));
        let err = orch.run_round(&mut state).await.unwrap_err();
        assert!(matches!(
            err,
            RoundError::InsufficientParticipation { accepted: 1, required: 2, .. }
        ));
        assert_eq!(state.global(), &seed_params());
        assert_eq!(state.current_round(), 0);
        assert_eq!(state.phase(), RoundPhase::Idle);
    }

    #[tokio::test]
    async fn misshapen_reply_is_a_failure_and_left_out_of_the_average() {
        let orch = orchestrator(
            2,
            vec![scripted(1, 2.0, 5), misshapen(2, 100.0, 50), scripted(3, 4.0, 5)],
        );
        let mut state = RunState::new(seed_params(), Some(1));
        let summary = orch.run_round(&mut state).await.unwrap();
        assert_eq!(summary.fit.failures.len(), 1);
        assert_eq!(summary.fit.failures[0].0, 2);
        assert!(summary.fit.rejected.is_empty());
        let mut participants = summary.fit.participants.clone();
        participants.sort_unstable();
        assert_eq!(participants, vec![1, 3]);
        assert_eq!(summary.fit.num_examples, 10);
        assert_eq!(state.global().tensors()[0], arr1(&[3.0f32, -3.0]).into_dyn());
    }

    #[tokio::test]
    async fn misshapen_reply_counts_against_the_minimum() {
        let orch = orchestrator(2, vec![scripted(1, 2.0, 5), misshapen(2, 100.0, 50)]);
        let mut state = RunState::new(seed_params(), Some(1));
        let err = orch.run_round(&mut state).await.unwrap_err();
        assert!(matches!(
            err,
            RoundError::InsufficientParticipation {
                phase: Phase::Fit,
                accepted: 1,
                required: 2,
                ..
            }
        ));
        assert_eq!(state.global(), &seed_params());
        assert_eq!(state.current_round(), 0);
    }

    #[tokio::test]
    async fn failed_client_below_minimum_fails_the_round() {
        let failing: Arc<dyn ClientProxy> = Arc::new(Scripted {
            id: 2,
            value: 1.0,
            examples: 8,
            fail_fit: true,
            wrong_shape: false,
        });
        let orch = orchestrator(2, vec![scripted(1, 1.0, 8), failing]);
        let mut state = RunState::new(seed_params(), Some(1));
        let err = orch.run(&mut state).await.unwrap_err();
        match err {
            RunError::Round { round, attempts, source } => {
                assert_eq!(round, 1);
                assert_eq!(attempts, 1);
                assert!(source.is_retryable());
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(state.global(), &seed_params());
    }

    #[tokio::test]
    async fn missing_clients_fail_fast() {
        let orch = orchestrator(3, vec![scripted(1, 1.0, 8)]);
        let mut state = RunState::new(seed_params(), Some(1));
        let err = orch.run_round(&mut state).await.unwrap_err();
        assert!(matches!(
            err,
            RoundError::InsufficientClients { available: 1, required: 3, .. }
        ));
    }

    #[tokio::test]
    async fn start_takes_parameters_from_a_client() {
        let orch = orchestrator(1, vec![scripted(4, 1.0, 8)]);
        let state = orch.start(None).await.unwrap();
        assert_eq!(state.global(), &seed_params());
        assert_eq!(state.current_round(), 0);
    }

    #[tokio::test]
    async fn status_follows_the_run() {
        let (tx, rx) = watch::channel(ServerStatus::default());
        let orch = orchestrator(1, vec![scripted(1, 2.0, 8)]).with_status(tx);
        let mut state = RunState::new(seed_params(), Some(1));
        orch.run(&mut state).await.unwrap();
        let status = rx.borrow().clone();
        assert_eq!(status.round, 2);
        assert_eq!(status.phase, RoundPhase::Finished);
        assert_eq!(state.history().len(), 2);
    }
}
