//! Cohort orchestrator: runs many agents concurrently-simulated against one
//! shared bankroll, under the parent wallet's exposure and leverage guard
//! rails. One agent failing degrades gracefully: its allocation settles
//! back unchanged and the cohort continues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::CohortConfig;
use crate::evaluator::{SimulationRequest, Simulator};
use crate::genome::StrategyGenome;
use crate::mutation::MutationEngine;
use crate::repository::{KeyedStore, StrategyRepository};
use crate::wallet::{LedgerError, ParentWallet, VirtualAccount};

#[derive(Debug, thiserror::Error)]
pub enum CohortError {
    #[error("invalid cohort request: {0}")]
    InvalidRequest(String),
    #[error("no champion genomes available to seed a cohort")]
    NoAgentsAvailable,
}

/// How the bankroll is split across agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    Equal,
    RiskWeighted,
}

impl FromStr for AllocationPolicy {
    type Err = CohortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "equal" => Ok(AllocationPolicy::Equal),
            "risk-weighted" | "risk_weighted" => Ok(AllocationPolicy::RiskWeighted),
            other => Err(CohortError::InvalidRequest(format!(
                "unknown allocation policy: {}",
                other
            ))),
        }
    }
}

/// Request to launch one cohort
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortRequest {
    pub bankroll: f64,
    pub agent_count: usize,
    pub allocation_policy: AllocationPolicy,
    pub symbol: String,
    pub interval: String,
}

impl CohortRequest {
    /// Validation errors reject the unit before it starts
    pub fn validate(&self) -> Result<(), CohortError> {
        if self.bankroll <= 0.0 {
            return Err(CohortError::InvalidRequest(format!(
                "bankroll must be positive, got {}",
                self.bankroll
            )));
        }
        if self.agent_count == 0 {
            return Err(CohortError::InvalidRequest(
                "agent_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Guard-rail alert kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    AllocationFailed,
    SimulationFailed,
    ResultMissing,
    ExposureLimit,
    LeverageBreach,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortAlert {
    pub timestamp: DateTime<Utc>,
    pub kind: AlertKind,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub message: String,
}

/// Per-agent outcome within a cohort
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub strategy_id: String,
    pub allocation: f64,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
    pub final_equity: f64,
    pub pnl: f64,
    #[serde(default)]
    pub leverage_breach: bool,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub alerts: Vec<CohortAlert>,
    pub account: VirtualAccount,
}

/// Aggregate statistics over a finished cohort
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CohortSummary {
    pub total_pnl: f64,
    pub total_roi: f64,
    pub bankroll_utilization: f64,
    #[serde(default)]
    pub best_agent: Option<String>,
    #[serde(default)]
    pub worst_agent: Option<String>,
    pub total_trades: u64,
    pub confidence: f64,
}

/// Immutable snapshot of one cohort run. A re-run produces a new cohort id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cohort {
    pub cohort_id: String,
    pub bankroll: f64,
    pub allocation_policy: AllocationPolicy,
    pub agents: Vec<AgentRecord>,
    pub wallet: ParentWallet,
    #[serde(default)]
    pub alerts: Vec<CohortAlert>,
    pub summary: CohortSummary,
    pub failed_agents: usize,
    pub started_at: DateTime<Utc>,
    pub runtime_secs: f64,
}

/// Builds and drives multi-agent cohorts against the shared wallet
pub struct CohortOrchestrator {
    strategies: Arc<StrategyRepository>,
    simulator: Arc<dyn Simulator>,
    cohorts: Arc<dyn KeyedStore<Cohort>>,
    mutation: MutationEngine,
    config: CohortConfig,
}

impl CohortOrchestrator {
    pub fn new(
        strategies: Arc<StrategyRepository>,
        simulator: Arc<dyn Simulator>,
        cohorts: Arc<dyn KeyedStore<Cohort>>,
        mutation: MutationEngine,
        config: CohortConfig,
    ) -> Self {
        Self {
            strategies,
            simulator,
            cohorts,
            mutation,
            config,
        }
    }

    /// Launch one cohort end to end and persist the immutable snapshot
    pub async fn run(&mut self, request: CohortRequest) -> Result<Cohort, CohortError> {
        request.validate()?;
        let started_at = Utc::now();
        let start = std::time::Instant::now();

        let genomes = self.select_agents(request.agent_count).await?;
        let allocations = compute_allocations(request.bankroll, &genomes, request.allocation_policy);

        let mut wallet = ParentWallet::new(request.bankroll, Some(self.config.leverage_ceiling))
            .with_exposure_limit(request.bankroll * self.config.exposure_limit_factor);
        let mut agents = Vec::with_capacity(genomes.len());
        let mut cohort_alerts = Vec::new();
        let mut failed_agents = 0usize;

        for (index, (genome, allocation)) in genomes.iter().zip(allocations.iter()).enumerate() {
            let agent_id = format!("agent-{}", index);
            let record = self
                .run_agent(&agent_id, genome, *allocation, &request, &mut wallet)
                .await;
            if record.failed {
                failed_agents += 1;
            }
            cohort_alerts.extend(record.alerts.clone());
            info!(
                agent_id = %agent_id,
                strategy_id = %record.strategy_id,
                allocation = record.allocation,
                pnl = record.pnl,
                failed = record.failed,
                "agent finished"
            );
            agents.push(record);
        }

        let summary = summarize(request.bankroll, &agents, &wallet);
        let cohort = Cohort {
            cohort_id: Uuid::new_v4().to_string(),
            bankroll: request.bankroll,
            allocation_policy: request.allocation_policy,
            agents,
            wallet,
            alerts: cohort_alerts,
            summary,
            failed_agents,
            started_at,
            runtime_secs: start.elapsed().as_secs_f64(),
        };

        self.cohorts.put(&cohort.cohort_id, cohort.clone()).await;
        info!(
            cohort_id = %cohort.cohort_id,
            agents = cohort.agents.len(),
            failed_agents = cohort.failed_agents,
            total_pnl = cohort.summary.total_pnl,
            "cohort complete"
        );
        Ok(cohort)
    }

    /// Prefer freshly spawned mutants; fall back to champions to fill any
    /// shortfall.
    async fn select_agents(&mut self, agent_count: usize) -> Result<Vec<StrategyGenome>, CohortError> {
        let champions = self.strategies.champions(agent_count).await;
        if champions.is_empty() {
            return Err(CohortError::NoAgentsAvailable);
        }

        let mut selected: Vec<StrategyGenome> = self
            .mutation
            .spawn_variants(&champions)
            .into_iter()
            .map(|c| c.genome)
            .take(agent_count)
            .collect();
        for champion in champions {
            if selected.len() >= agent_count {
                break;
            }
            selected.push(champion);
        }
        Ok(selected)
    }

    /// Run one agent: allocate, simulate, track exposure, settle. Every
    /// failure path settles the allocation back unchanged.
    async fn run_agent(
        &self,
        agent_id: &str,
        genome: &StrategyGenome,
        allocation: f64,
        request: &CohortRequest,
        wallet: &mut ParentWallet,
    ) -> AgentRecord {
        let mut record = AgentRecord {
            agent_id: agent_id.to_string(),
            strategy_id: genome.id.clone(),
            allocation,
            run_id: None,
            metrics: HashMap::new(),
            final_equity: allocation,
            pnl: 0.0,
            leverage_breach: false,
            failed: false,
            alerts: Vec::new(),
            account: VirtualAccount::new(agent_id, allocation, Some(self.config.leverage_ceiling)),
        };

        if let Err(e) = wallet.allocate(agent_id, allocation) {
            alert(&mut record, AlertKind::AllocationFailed, &e.to_string());
            record.failed = true;
            return record;
        }

        let sim_request = SimulationRequest {
            symbol: request.symbol.clone(),
            interval: request.interval.clone(),
            strategy_config: genome
                .params
                .iter()
                .map(|(k, &v)| (k.clone(), serde_json::json!(v)))
                .collect(),
            genome: genome.clone(),
            horizon: genome.metadata.horizon.clone(),
            window: None,
        };

        let run_id = match self.simulator.run(sim_request).await {
            Ok(id) => id,
            Err(e) => {
                alert(&mut record, AlertKind::SimulationFailed, &e.to_string());
                return self.settle_failed(record, wallet, agent_id, allocation);
            }
        };
        record.run_id = Some(run_id.clone());

        let run = match self.simulator.load_run(&run_id).await {
            Ok(run) => run,
            Err(e) => {
                alert(&mut record, AlertKind::ResultMissing, &e.to_string());
                return self.settle_failed(record, wallet, agent_id, allocation);
            }
        };

        record.metrics = run.results.clone();
        let roi = run.results.get("roi").copied().unwrap_or(0.0);
        let final_equity = (allocation * (1.0 + roi)).max(0.0);
        let exposure = run
            .results
            .get("max_exposure")
            .copied()
            .unwrap_or(allocation);

        // Realized leverage check against this agent's own allocation
        if exposure > allocation * self.config.leverage_ceiling {
            record.leverage_breach = true;
            alert(
                &mut record,
                AlertKind::LeverageBreach,
                &format!(
                    "exposure {} exceeds allocation {} x ceiling {}",
                    exposure, allocation, self.config.leverage_ceiling
                ),
            );
        }

        // Wallet-level exposure tracking; a typed rejection becomes an alert
        if let Err(e) = wallet.update_exposure(agent_id, exposure) {
            let kind = match e {
                LedgerError::LeverageExceeded { .. } => AlertKind::LeverageBreach,
                _ => AlertKind::ExposureLimit,
            };
            alert(&mut record, kind, &e.to_string());
        }

        for trade in &run.trades {
            let pnl = trade.get("pnl").and_then(|v| v.as_f64()).unwrap_or(0.0);
            let notional = trade.get("notional").and_then(|v| v.as_f64()).unwrap_or(0.0);
            let symbol = trade
                .get("symbol")
                .and_then(|v| v.as_str())
                .unwrap_or(&request.symbol);
            let side = trade.get("side").and_then(|v| v.as_str()).unwrap_or("long");
            record.account.record_trade(symbol, side, notional, pnl);
        }

        match wallet.settle(agent_id, final_equity) {
            Ok(pnl) => {
                record.final_equity = final_equity;
                record.pnl = pnl;
            }
            Err(e) => {
                // Settlement can only fail on malformed equity; treat as agent failure
                warn!(agent_id = agent_id, error = %e, "settlement failed");
                alert(&mut record, AlertKind::AllocationFailed, &e.to_string());
                record.failed = true;
            }
        }
        record
    }

    /// Settle a failed agent's allocation back to the wallet unchanged
    fn settle_failed(
        &self,
        mut record: AgentRecord,
        wallet: &mut ParentWallet,
        agent_id: &str,
        allocation: f64,
    ) -> AgentRecord {
        record.failed = true;
        if let Err(e) = wallet.settle(agent_id, allocation) {
            warn!(agent_id = agent_id, error = %e, "failed-agent settlement error");
        }
        record.final_equity = allocation;
        record.pnl = 0.0;
        record
    }
}

fn alert(record: &mut AgentRecord, kind: AlertKind, message: &str) {
    warn!(agent_id = %record.agent_id, kind = ?kind, message = message, "cohort alert");
    record.alerts.push(CohortAlert {
        timestamp: Utc::now(),
        kind,
        agent_id: Some(record.agent_id.clone()),
        message: message.to_string(),
    });
}

/// Split the bankroll across agents. Totals reconcile exactly: amounts are
/// rounded to cents and the remainder lands on the last agent.
pub fn compute_allocations(
    bankroll: f64,
    genomes: &[StrategyGenome],
    policy: AllocationPolicy,
) -> Vec<f64> {
    let n = genomes.len();
    if n == 0 {
        return Vec::new();
    }

    let raw: Vec<f64> = match policy {
        AllocationPolicy::Equal => vec![bankroll / n as f64; n],
        AllocationPolicy::RiskWeighted => {
            let weights: Vec<f64> = genomes
                .iter()
                .map(|g| (g.fitness.sharpe + g.fitness.roi).max(0.01))
                .collect();
            let total: f64 = weights.iter().sum();
            weights.iter().map(|w| bankroll * w / total).collect()
        }
    };

    let mut allocations: Vec<f64> = raw.iter().map(|a| (a * 100.0).floor() / 100.0).collect();
    let assigned: f64 = allocations[..n - 1].iter().sum();
    allocations[n - 1] = bankroll - assigned;
    allocations
}

fn summarize(bankroll: f64, agents: &[AgentRecord], wallet: &ParentWallet) -> CohortSummary {
    let total_pnl = wallet.realized_pnl;
    let total_allocated: f64 = agents.iter().map(|a| a.allocation).sum();
    let total_trades: u64 = agents.iter().map(|a| a.account.trades.len() as u64).sum();

    let best_agent = agents
        .iter()
        .max_by(|a, b| a.pnl.partial_cmp(&b.pnl).unwrap_or(std::cmp::Ordering::Equal))
        .map(|a| a.agent_id.clone());
    let worst_agent = agents
        .iter()
        .min_by(|a, b| a.pnl.partial_cmp(&b.pnl).unwrap_or(std::cmp::Ordering::Equal))
        .map(|a| a.agent_id.clone());

    let succeeded = agents.iter().filter(|a| !a.failed).count();
    let confidence = if agents.is_empty() || succeeded == 0 {
        0.0
    } else {
        let success_fraction = succeeded as f64 / agents.len() as f64;
        let profitable = agents.iter().filter(|a| !a.failed && a.pnl > 0.0).count();
        let profit_fraction = profitable as f64 / succeeded as f64;
        success_fraction * 0.6 + profit_fraction * 0.4
    };

    CohortSummary {
        total_pnl,
        total_roi: if bankroll > 0.0 { total_pnl / bankroll } else { 0.0 },
        bankroll_utilization: if bankroll > 0.0 {
            total_allocated / bankroll
        } else {
            0.0
        },
        best_agent,
        worst_agent,
        total_trades,
        confidence,
    }
}
