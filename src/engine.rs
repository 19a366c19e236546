//! Evolution engine: one cycle selects champion parents, spawns mutants,
//! evaluates them as experiments, and applies promotion decisions. All
//! collaborators are explicit fields so a cycle is reproducible from its
//! inputs alone.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::evaluator::{EvaluationOutcome, Evaluator, Simulator};
use crate::experiment::ExperimentStatus;
use crate::mutation::MutationEngine;
use crate::promotion::{PromotionDecision, Promoter};
use crate::repository::{ExperimentRepository, StrategyRepository};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no champion genomes to evolve from")]
    NoChampions,
}

/// What one cycle did, for operators and for the knowledge log
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleSummary {
    pub parents: usize,
    pub candidates: usize,
    pub experiments_created: usize,
    pub evaluated: usize,
    pub promoted: usize,
    pub rejected: usize,
    pub failed: usize,
    pub knowledge_recorded: bool,
}

/// Sink for what a cycle learned: the per-experiment evaluation outcomes
/// and the promotion decisions made from them. Recording is best-effort: a
/// sink failure is logged and flagged on the summary, never fails the cycle.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait KnowledgeRecorder: Send + Sync {
    async fn record_cycle(
        &self,
        evaluations: &[EvaluationOutcome],
        decisions: &[PromotionDecision],
    ) -> Result<(), String>;
}

pub struct EvolutionEngine {
    experiments: Arc<ExperimentRepository>,
    strategies: Arc<StrategyRepository>,
    evaluator: Evaluator,
    promoter: Promoter,
    mutation: MutationEngine,
    knowledge: Option<Arc<dyn KnowledgeRecorder>>,
    max_parents: usize,
    max_concurrent: usize,
}

impl EvolutionEngine {
    pub fn new(
        config: &Config,
        experiments: Arc<ExperimentRepository>,
        strategies: Arc<StrategyRepository>,
        simulator: Arc<dyn Simulator>,
        mutation: MutationEngine,
    ) -> Self {
        let evaluator = Evaluator::new(
            experiments.clone(),
            strategies.clone(),
            simulator,
            &config.cohort.symbol,
            &config.cohort.interval,
        );
        let promoter = Promoter::new(
            experiments.clone(),
            strategies.clone(),
            config.promotion.clone(),
        );
        Self {
            experiments,
            strategies,
            evaluator,
            promoter,
            mutation,
            knowledge: None,
            max_parents: config.engine.max_parents,
            max_concurrent: config.engine.max_concurrent,
        }
    }

    pub fn with_knowledge(mut self, recorder: Arc<dyn KnowledgeRecorder>) -> Self {
        self.knowledge = Some(recorder);
        self
    }

    /// One full evolution cycle: spawn, evaluate, promote.
    pub async fn run_cycle(&mut self) -> Result<CycleSummary, EngineError> {
        let parents = self.strategies.champions(self.max_parents).await;
        if parents.is_empty() {
            return Err(EngineError::NoChampions);
        }
        info!(parents = parents.len(), "cycle start");

        let candidates = self.mutation.spawn_variants(&parents);
        let experiments = self.experiments.create_batch(candidates.clone()).await;
        let outcomes = self.evaluator.evaluate_batch(self.max_concurrent).await;

        let mut summary = CycleSummary {
            parents: parents.len(),
            candidates: candidates.len(),
            experiments_created: experiments.len(),
            evaluated: outcomes.len(),
            ..Default::default()
        };

        let mut decisions = Vec::new();
        for outcome in &outcomes {
            if !outcome.completed {
                summary.failed += 1;
                continue;
            }
            let experiment = match self.experiments.load(&outcome.experiment_id).await {
                Ok(exp) => exp,
                Err(e) => {
                    warn!(experiment_id = %outcome.experiment_id, error = %e, "lost experiment after evaluation");
                    summary.failed += 1;
                    continue;
                }
            };
            let decision = self.promoter.decide_promotion(&experiment).await;
            if let Err(e) = self
                .promoter
                .apply_decision(&experiment.experiment_id, &decision)
                .await
            {
                warn!(experiment_id = %experiment.experiment_id, error = %e, "could not apply promotion decision");
                summary.failed += 1;
                continue;
            }
            if decision.approved {
                summary.promoted += 1;
            } else {
                summary.rejected += 1;
            }
            info!(
                experiment_id = %experiment.experiment_id,
                strategy_id = %decision.strategy_id,
                approved = decision.approved,
                reason = ?decision.reason,
                "promotion decided"
            );
            decisions.push(decision);
        }

        if let Some(recorder) = &self.knowledge {
            match recorder.record_cycle(&outcomes, &decisions).await {
                Ok(()) => summary.knowledge_recorded = true,
                Err(e) => {
                    warn!(error = %e, "knowledge recording failed");
                    summary.knowledge_recorded = false;
                }
            }
        }

        info!(
            candidates = summary.candidates,
            promoted = summary.promoted,
            rejected = summary.rejected,
            failed = summary.failed,
            "cycle complete"
        );
        Ok(summary)
    }

    /// Experiments still waiting on evaluation
    pub async fn pending_backlog(&self) -> usize {
        self.experiments
            .list(
                Some(ExperimentStatus::Pending),
                crate::repository::ExperimentSort::CreatedAt,
                usize::MAX,
            )
            .await
            .len()
    }
}
