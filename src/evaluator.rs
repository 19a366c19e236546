//! Drives one experiment through the external simulation service, scores
//! the result, and persists fitness. A failure on any single experiment is
//! absorbed: the experiment is marked failed with the error captured in its
//! insights field and the batch moves on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

use crate::experiment::ExperimentStatus;
use crate::genome::{StrategyFitness, StrategyGenome};
use crate::repository::{ExperimentRepository, ExperimentSort, StoreError, StrategyRepository};

/// Composite score weights applied when a simulation does not supply one
const W_ROI: f64 = 0.6;
const W_SHARPE: f64 = 0.4;
const W_STABILITY: f64 = 0.2;
const W_DRAWDOWN: f64 = 0.3;

#[derive(Debug, thiserror::Error)]
pub enum SimulatorError {
    #[error("simulation failed to start: {0}")]
    RunFailed(String),
    #[error("simulation result missing for run {0}")]
    ResultMissing(String),
    #[error("simulator unavailable: {0}")]
    Unavailable(String),
}

/// Request to the external simulation collaborator. The config map carries
/// flattened genome params plus candidate metadata; the collaborator must
/// tolerate unknown extra keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationRequest {
    pub symbol: String,
    pub interval: String,
    pub strategy_config: HashMap<String, serde_json::Value>,
    pub genome: StrategyGenome,
    pub horizon: String,
    #[serde(default)]
    pub window: Option<u32>,
}

/// Result document for one completed simulation run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulationRun {
    /// Named metrics: roi, sharpe, max_drawdown, stability, optionally composite
    #[serde(default)]
    pub results: HashMap<String, f64>,
    #[serde(default)]
    pub trades: Vec<serde_json::Value>,
    #[serde(default)]
    pub equity_curve: Vec<f64>,
}

/// External black-box simulation service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Simulator: Send + Sync {
    /// Start a run, returning its id
    async fn run(&self, request: SimulationRequest) -> Result<String, SimulatorError>;

    /// Load the result document of a finished run
    async fn load_run(&self, run_id: &str) -> Result<SimulationRun, SimulatorError>;
}

/// Outcome of evaluating one experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationOutcome {
    pub experiment_id: String,
    pub strategy_id: String,
    pub completed: bool,
    pub score: f64,
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Evaluates pending experiments against the simulator
pub struct Evaluator {
    experiments: Arc<ExperimentRepository>,
    strategies: Arc<StrategyRepository>,
    simulator: Arc<dyn Simulator>,
    symbol: String,
    interval: String,
}

impl Evaluator {
    pub fn new(
        experiments: Arc<ExperimentRepository>,
        strategies: Arc<StrategyRepository>,
        simulator: Arc<dyn Simulator>,
        symbol: &str,
        interval: &str,
    ) -> Self {
        Self {
            experiments,
            strategies,
            simulator,
            symbol: symbol.to_string(),
            interval: interval.to_string(),
        }
    }

    /// Evaluate one experiment end to end. Failures along the path mark the
    /// experiment failed and are reported in the outcome, not propagated.
    pub async fn evaluate(&self, experiment_id: &str) -> Result<EvaluationOutcome, StoreError> {
        let experiment = self.experiments.load(experiment_id).await?;
        let strategy_id = experiment.strategy_id().to_string();

        self.experiments
            .transition(experiment_id, ExperimentStatus::Running)
            .await?;

        match self.try_evaluate(experiment_id).await {
            Ok((score, metrics)) => {
                info!(
                    experiment_id = experiment_id,
                    strategy_id = %strategy_id,
                    score = score,
                    "experiment evaluated"
                );
                Ok(EvaluationOutcome {
                    experiment_id: experiment_id.to_string(),
                    strategy_id,
                    completed: true,
                    score,
                    metrics,
                    error: None,
                })
            }
            Err(reason) => {
                error!(
                    experiment_id = experiment_id,
                    error = %reason,
                    "evaluation failed"
                );
                let captured = reason.clone();
                self.experiments
                    .update_fields(experiment_id, move |exp| {
                        exp.insights = Some(captured);
                    })
                    .await?;
                self.experiments
                    .transition(experiment_id, ExperimentStatus::Failed)
                    .await?;
                Ok(EvaluationOutcome {
                    experiment_id: experiment_id.to_string(),
                    strategy_id,
                    completed: false,
                    score: 0.0,
                    metrics: HashMap::new(),
                    error: Some(reason),
                })
            }
        }
    }

    /// Evaluate a capped-size slice of pending experiments sequentially.
    /// `max_concurrent` is a batch-size cap, not a thread-pool size.
    pub async fn evaluate_batch(&self, max_concurrent: usize) -> Vec<EvaluationOutcome> {
        let pending = self
            .experiments
            .list(Some(ExperimentStatus::Pending), ExperimentSort::Priority, max_concurrent)
            .await;

        let mut outcomes = Vec::with_capacity(pending.len());
        for experiment in pending {
            match self.evaluate(&experiment.experiment_id).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    // Repository-level failure on one item; keep going
                    error!(
                        experiment_id = %experiment.experiment_id,
                        error = %e,
                        "could not evaluate experiment"
                    );
                }
            }
        }
        outcomes
    }

    /// The fallible part of evaluation, run after the experiment is Running
    async fn try_evaluate(
        &self,
        experiment_id: &str,
    ) -> Result<(f64, HashMap<String, f64>), String> {
        let experiment = self
            .experiments
            .load(experiment_id)
            .await
            .map_err(|e| e.to_string())?;
        let genome = &experiment.candidate.genome;
        if genome.params.is_empty() {
            return Err("experiment has no strategy genome parameters".to_string());
        }

        let request = SimulationRequest {
            symbol: self.symbol.clone(),
            interval: self.interval.clone(),
            strategy_config: flatten_config(&experiment.candidate),
            genome: genome.clone(),
            horizon: experiment
                .candidate
                .horizon
                .clone()
                .unwrap_or_else(|| genome.metadata.horizon.clone()),
            window: None,
        };

        let run_id = self
            .simulator
            .run(request)
            .await
            .map_err(|e| e.to_string())?;
        let run = self
            .simulator
            .load_run(&run_id)
            .await
            .map_err(|e| e.to_string())?;

        let metrics = run.results.clone();
        let score = composite_score(&metrics);

        let fitness = StrategyFitness {
            roi: metric(&metrics, "roi"),
            sharpe: metric(&metrics, "sharpe"),
            max_drawdown: metric(&metrics, "max_drawdown"),
            forecast_alignment: metric(&metrics, "forecast_alignment"),
            stability: metric(&metrics, "stability"),
            composite: score,
        };

        // Persist fitness keyed by strategy id; the genome may not be in the
        // strategy store yet when it was spawned this cycle
        let mut genome = genome.clone();
        genome.fitness = fitness;
        self.strategies.upsert(genome).await;

        let committed_metrics = metrics.clone();
        self.experiments
            .update_fields(experiment_id, move |exp| {
                exp.metrics = committed_metrics;
                exp.score = score;
            })
            .await
            .map_err(|e| e.to_string())?;
        self.experiments
            .transition(experiment_id, ExperimentStatus::Completed)
            .await
            .map_err(|e| e.to_string())?;

        Ok((score, metrics))
    }
}

/// Composite score: the sim's own composite wins when present, otherwise
/// `0.6·roi + 0.4·sharpe + 0.2·stability − 0.3·max_drawdown`
pub fn composite_score(metrics: &HashMap<String, f64>) -> f64 {
    if let Some(&composite) = metrics.get("composite") {
        return composite;
    }
    W_ROI * metric(metrics, "roi") + W_SHARPE * metric(metrics, "sharpe")
        + W_STABILITY * metric(metrics, "stability")
        - W_DRAWDOWN * metric(metrics, "max_drawdown")
}

fn metric(metrics: &HashMap<String, f64>, name: &str) -> f64 {
    metrics.get(name).copied().unwrap_or(0.0)
}

/// Flatten genome params and candidate metadata into the strategy config map
fn flatten_config(candidate: &crate::experiment::EvolutionCandidate) -> HashMap<String, serde_json::Value> {
    let mut config = HashMap::new();
    for (name, &value) in &candidate.genome.params {
        config.insert(name.clone(), serde_json::json!(value));
    }
    let features = if candidate.features.is_empty() {
        &candidate.genome.metadata.features
    } else {
        &candidate.features
    };
    config.insert("features".to_string(), serde_json::json!(features));
    config.insert(
        "model_type".to_string(),
        serde_json::json!(candidate
            .model_type
            .clone()
            .unwrap_or_else(|| candidate.genome.metadata.model_type.clone())),
    );
    config.insert(
        "horizon".to_string(),
        serde_json::json!(candidate
            .horizon
            .clone()
            .unwrap_or_else(|| candidate.genome.metadata.horizon.clone())),
    );
    config.insert(
        "uses_forecast".to_string(),
        serde_json::json!(candidate.genome.uses_forecast),
    );
    config
}
