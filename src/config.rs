use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Top-level worker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub mutation: MutationConfig,

    #[serde(default)]
    pub promotion: PromotionPolicy,

    #[serde(default)]
    pub cohort: CohortConfig,
}

/// Evolution engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Max champion genomes selected as parents per cycle
    #[serde(default = "default_max_parents")]
    pub max_parents: usize,

    /// Evaluation batch-size cap per cycle
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Seed for the mutation RNG; same seed reproduces a generation
    #[serde(default)]
    pub seed: u64,
}

/// Mutation/crossover engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationConfig {
    /// Per-parameter probability of applying jitter
    #[serde(default = "default_mutation_rate")]
    pub mutation_rate: f64,

    /// Jitter is multiplicative, drawn uniformly from [1-scale, 1+scale]
    #[serde(default = "default_mutation_scale")]
    pub mutation_scale: f64,

    #[serde(default = "default_mutations_per_parent")]
    pub mutations_per_parent: usize,

    /// Probability of dropping one existing feature
    #[serde(default = "default_drop_feature_prob")]
    pub drop_feature_prob: f64,

    /// Probability of adding one feature from the library
    #[serde(default = "default_add_feature_prob")]
    pub add_feature_prob: f64,

    #[serde(default = "default_feature_library")]
    pub feature_library: Vec<String>,

    #[serde(default = "default_horizons")]
    pub allowed_horizons: Vec<String>,

    #[serde(default = "default_model_types")]
    pub allowed_model_types: Vec<String>,
}

/// Promotion thresholds and guard rails
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionPolicy {
    #[serde(default = "default_min_roi")]
    pub min_roi: f64,

    #[serde(default = "default_min_sharpe")]
    pub min_sharpe: f64,

    #[serde(default = "default_max_drawdown")]
    pub max_drawdown: f64,

    /// Minimum relative composite-score gain over the parent
    #[serde(default = "default_min_score_gain")]
    pub min_score_gain: f64,

    /// Minimum paper-trading age before promotion (skipped when the
    /// experiment carries no paper_days metric)
    #[serde(default)]
    pub min_paper_days: f64,

    #[serde(default = "default_require_parent_score")]
    pub require_parent_score: bool,
}

/// Cohort launch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortConfig {
    #[serde(default = "default_leverage_ceiling")]
    pub leverage_ceiling: f64,

    /// Aggregate exposure limit as a fraction of the bankroll
    #[serde(default = "default_exposure_limit_factor")]
    pub exposure_limit_factor: f64,

    #[serde(default = "default_symbol")]
    pub symbol: String,

    #[serde(default = "default_interval")]
    pub interval: String,
}

fn default_max_parents() -> usize {
    5
}

fn default_max_concurrent() -> usize {
    10
}

fn default_mutation_rate() -> f64 {
    0.35
}

fn default_mutation_scale() -> f64 {
    0.2
}

fn default_mutations_per_parent() -> usize {
    3
}

fn default_drop_feature_prob() -> f64 {
    0.2
}

fn default_add_feature_prob() -> f64 {
    0.3
}

fn default_feature_library() -> Vec<String> {
    [
        "ema_cross",
        "rsi",
        "macd",
        "bollinger",
        "atr",
        "volume_profile",
        "funding_rate",
        "orderbook_imbalance",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_horizons() -> Vec<String> {
    ["1h", "4h", "1d"].iter().map(|s| s.to_string()).collect()
}

fn default_model_types() -> Vec<String> {
    ["gradient_boost", "ridge", "lstm"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_min_roi() -> f64 {
    0.02
}

fn default_min_sharpe() -> f64 {
    1.0
}

fn default_max_drawdown() -> f64 {
    0.15
}

fn default_min_score_gain() -> f64 {
    0.05
}

fn default_require_parent_score() -> bool {
    true
}

fn default_leverage_ceiling() -> f64 {
    3.0
}

fn default_exposure_limit_factor() -> f64 {
    1.0
}

fn default_symbol() -> String {
    "BTC".to_string()
}

fn default_interval() -> String {
    "1h".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parents: default_max_parents(),
            max_concurrent: default_max_concurrent(),
            seed: 0,
        }
    }
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            mutation_rate: default_mutation_rate(),
            mutation_scale: default_mutation_scale(),
            mutations_per_parent: default_mutations_per_parent(),
            drop_feature_prob: default_drop_feature_prob(),
            add_feature_prob: default_add_feature_prob(),
            feature_library: default_feature_library(),
            allowed_horizons: default_horizons(),
            allowed_model_types: default_model_types(),
        }
    }
}

impl Default for PromotionPolicy {
    fn default() -> Self {
        Self {
            min_roi: default_min_roi(),
            min_sharpe: default_min_sharpe(),
            max_drawdown: default_max_drawdown(),
            min_score_gain: default_min_score_gain(),
            min_paper_days: 0.0,
            require_parent_score: default_require_parent_score(),
        }
    }
}

impl Default for CohortConfig {
    fn default() -> Self {
        Self {
            leverage_ceiling: default_leverage_ceiling(),
            exposure_limit_factor: default_exposure_limit_factor(),
            symbol: default_symbol(),
            interval: default_interval(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(
            max_parents = config.engine.max_parents,
            mutation_rate = config.mutation.mutation_rate,
            "configuration loaded"
        );
        Ok(config)
    }
}
