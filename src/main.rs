use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;

use evoforge::cohort::{AllocationPolicy, CohortOrchestrator, CohortRequest};
use evoforge::config::Config;
use evoforge::engine::EvolutionEngine;
use evoforge::evaluator::{SimulationRequest, SimulationRun, Simulator, SimulatorError};
use evoforge::genome::{GenomeStatus, ParamBounds, StrategyGenome};
use evoforge::mutation::MutationEngine;
use evoforge::repository::{ExperimentRepository, MemoryStore, StrategyRepository};
use evoforge::scheduler::{Scheduler, TaskHandle, TaskQueue, TaskStatus};

/// EvoForge - strategy evolution worker
#[derive(Parser, Debug)]
#[command(name = "evoforge", version, about)]
struct Args {
    /// Path to TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one evolution cycle: mutate, evaluate, promote
    RunCycle,

    /// Run a multi-agent cohort against a shared bankroll
    RunCohort {
        #[arg(long, default_value_t = 900.0)]
        bankroll: f64,

        #[arg(long, default_value_t = 3)]
        agents: usize,

        /// equal or risk-weighted
        #[arg(long, default_value = "equal")]
        policy: String,
    },

    /// Inspect or change the scheduler record
    Scheduler {
        #[command(subcommand)]
        action: SchedulerAction,
    },
}

#[derive(Subcommand, Debug)]
enum SchedulerAction {
    Status,
    Enable,
    Disable,
    SetCron { cron: String },
}

/// Demonstration simulator: returns deterministic pseudo-results derived
/// from the genome, so the worker can be exercised without a market-data
/// backend.
struct DemoSimulator {
    rng: Mutex<StdRng>,
    runs: Mutex<HashMap<String, SimulationRun>>,
}

impl DemoSimulator {
    fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            runs: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait::async_trait]
impl Simulator for DemoSimulator {
    async fn run(&self, request: SimulationRequest) -> Result<String, SimulatorError> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|e| SimulatorError::Unavailable(e.to_string()))?;

        // Param sum gives each genome a stable bias, noise on top
        let bias: f64 = request.genome.params.values().sum::<f64>() % 7.0 / 100.0;
        let roi = bias + rng.gen_range(-0.05..0.15);
        let sharpe = (roi * 20.0 + rng.gen_range(-0.5..0.5)).max(-3.0);
        let drawdown = rng.gen_range(0.01..0.2);

        let mut results = HashMap::new();
        results.insert("roi".to_string(), roi);
        results.insert("sharpe".to_string(), sharpe);
        results.insert("max_drawdown".to_string(), drawdown);
        results.insert("stability".to_string(), rng.gen_range(0.3..0.9));

        let run_id = uuid::Uuid::new_v4().to_string();
        let run = SimulationRun {
            results,
            trades: vec![],
            equity_curve: vec![1.0, 1.0 + roi],
        };
        self.runs
            .lock()
            .map_err(|e| SimulatorError::Unavailable(e.to_string()))?
            .insert(run_id.clone(), run);
        Ok(run_id)
    }

    async fn load_run(&self, run_id: &str) -> Result<SimulationRun, SimulatorError> {
        self.runs
            .lock()
            .map_err(|e| SimulatorError::Unavailable(e.to_string()))?
            .get(run_id)
            .cloned()
            .ok_or_else(|| SimulatorError::ResultMissing(run_id.to_string()))
    }
}

/// In-process queue stand-in: accepts tasks and reports them pending
struct LocalQueue;

#[async_trait::async_trait]
impl TaskQueue for LocalQueue {
    async fn submit(
        &self,
        name: &str,
        _payload: serde_json::Value,
    ) -> Result<TaskHandle, String> {
        Ok(TaskHandle::pending(name))
    }

    async fn status(&self, _task_id: &str) -> Option<TaskStatus> {
        Some(TaskStatus::Pending)
    }
}

fn seed_champion() -> StrategyGenome {
    let mut params = HashMap::new();
    params.insert("ema_short".to_string(), 12.0);
    params.insert("ema_long".to_string(), 26.0);
    params.insert("stop_loss_pct".to_string(), 0.03);
    params.insert("take_profit_pct".to_string(), 0.06);
    params.insert("position_fraction".to_string(), 0.25);

    let mut genome = StrategyGenome::new("trend", params);
    genome.status = GenomeStatus::Champion;
    genome.fitness.roi = 0.02;
    genome.fitness.sharpe = 0.8;
    genome.fitness.composite = 0.3;
    genome.metadata.horizon = "1h".to_string();
    genome.metadata.model_type = "ema_cross".to_string();
    genome.metadata.features = vec!["close".to_string(), "volume".to_string()];
    genome
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let strategies = Arc::new(StrategyRepository::in_memory());
    strategies.upsert(seed_champion()).await;
    let simulator = Arc::new(DemoSimulator::new(config.engine.seed));
    let mutation = MutationEngine::new(
        config.mutation.clone(),
        ParamBounds::default(),
        config.engine.seed,
    );

    match args.command {
        Command::RunCycle => {
            let experiments = Arc::new(ExperimentRepository::in_memory());
            let mut engine =
                EvolutionEngine::new(&config, experiments, strategies, simulator, mutation);
            let summary = engine.run_cycle().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::RunCohort {
            bankroll,
            agents,
            policy,
        } => {
            let policy: AllocationPolicy = policy.parse()?;
            let mut orchestrator = CohortOrchestrator::new(
                strategies,
                simulator,
                Arc::new(MemoryStore::new()),
                mutation,
                config.cohort.clone(),
            );
            let cohort = orchestrator
                .run(CohortRequest {
                    bankroll,
                    agent_count: agents,
                    allocation_policy: policy,
                    symbol: config.cohort.symbol.clone(),
                    interval: config.cohort.interval.clone(),
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&cohort.summary)?);
        }
        Command::Scheduler { action } => {
            let scheduler = Scheduler::new(Arc::new(MemoryStore::new()), Arc::new(LocalQueue));
            let state = match action {
                SchedulerAction::Status => scheduler.state().await,
                SchedulerAction::Enable => scheduler.enable().await?,
                SchedulerAction::Disable => scheduler.disable().await?,
                SchedulerAction::SetCron { cron } => scheduler.update_cron(&cron).await?,
            };
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
    }

    info!("done");
    Ok(())
}
