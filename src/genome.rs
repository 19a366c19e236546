//! Strategy genome model: the evolvable parameter set for one trading
//! strategy, plus the bounds table used to keep mutated values sane.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Fitness metrics attached to a genome after evaluation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyFitness {
    pub roi: f64,
    pub sharpe: f64,
    pub max_drawdown: f64,
    pub forecast_alignment: f64,
    pub stability: f64,
    pub composite: f64,
}

/// Lifecycle status of a genome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenomeStatus {
    Candidate,
    Champion,
    Archived,
}

/// Non-parameter metadata carried alongside the genome
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenomeMetadata {
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub horizon: String,
    #[serde(default)]
    pub model_type: String,
}

/// A single evolvable trading strategy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyGenome {
    pub id: String,
    pub family: String,
    pub params: HashMap<String, f64>,
    #[serde(default)]
    pub uses_forecast: bool,
    #[serde(default)]
    pub forecast_weight: f64,
    /// Weak reference to the ancestor genome id (lookup only)
    #[serde(default)]
    pub mutation_parent: Option<String>,
    #[serde(default)]
    pub generation: u32,
    pub status: GenomeStatus,
    #[serde(default)]
    pub fitness: StrategyFitness,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: GenomeMetadata,
    pub created_at: DateTime<Utc>,
}

/// Inclusive [lower, upper] bound for one parameter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamBound {
    pub lower: f64,
    pub upper: f64,
}

/// Bounds table: parameter name → allowed range
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamBounds {
    pub bounds: HashMap<String, ParamBound>,
}

impl Default for ParamBounds {
    fn default() -> Self {
        let mut bounds = HashMap::new();
        bounds.insert("ema_short".to_string(), ParamBound { lower: 2.0, upper: 50.0 });
        bounds.insert("ema_long".to_string(), ParamBound { lower: 10.0, upper: 200.0 });
        bounds.insert("rsi_period".to_string(), ParamBound { lower: 2.0, upper: 50.0 });
        bounds.insert("rsi_oversold".to_string(), ParamBound { lower: 10.0, upper: 45.0 });
        bounds.insert("rsi_overbought".to_string(), ParamBound { lower: 55.0, upper: 90.0 });
        bounds.insert("stop_loss_pct".to_string(), ParamBound { lower: 0.002, upper: 0.2 });
        bounds.insert("take_profit_pct".to_string(), ParamBound { lower: 0.002, upper: 0.5 });
        bounds.insert("position_fraction".to_string(), ParamBound { lower: 0.01, upper: 1.0 });
        Self { bounds }
    }
}

impl ParamBounds {
    pub fn get(&self, name: &str) -> Option<ParamBound> {
        self.bounds.get(name).copied()
    }

    /// Clamp a value into the bound for `name`, if one is configured
    pub fn clamp(&self, name: &str, value: f64) -> f64 {
        match self.bounds.get(name) {
            Some(b) => value.clamp(b.lower, b.upper),
            None => value,
        }
    }
}

impl StrategyGenome {
    /// Create a fresh candidate genome with the given params
    pub fn new(family: &str, params: HashMap<String, f64>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            family: family.to_string(),
            params,
            uses_forecast: false,
            forecast_weight: 0.0,
            mutation_parent: None,
            generation: 0,
            status: GenomeStatus::Candidate,
            fitness: StrategyFitness::default(),
            tags: Vec::new(),
            metadata: GenomeMetadata::default(),
            created_at: Utc::now(),
        }
    }

    /// Get a parameter value
    pub fn param(&self, name: &str) -> Option<f64> {
        self.params.get(name).copied()
    }

    /// Clamp every parameter into its configured bound and enforce the
    /// moving-average ordering: after normalization `ema_short` is strictly
    /// less than `ema_long` (values are swapped if inverted, and nudged
    /// apart if clamping made them equal).
    pub fn normalize(&mut self, bounds: &ParamBounds) {
        for (name, value) in self.params.iter_mut() {
            *value = bounds.clamp(name, *value);
        }

        let short = self.params.get("ema_short").copied();
        let long = self.params.get("ema_long").copied();
        if let (Some(mut s), Some(mut l)) = (short, long) {
            if s > l {
                std::mem::swap(&mut s, &mut l);
            }
            if s >= l {
                // Equal after clamping: push the short leg just below the long
                let floor = bounds.get("ema_short").map(|b| b.lower).unwrap_or(1.0);
                s = (l - 1.0).max(floor);
                if s >= l {
                    s = l * 0.99;
                }
            }
            self.params.insert("ema_short".to_string(), s);
            self.params.insert("ema_long".to_string(), l);
        }
    }

    /// Check that every parameter sits inside its configured bound
    pub fn validate(&self, bounds: &ParamBounds) -> Result<(), String> {
        for (name, &value) in &self.params {
            if let Some(b) = bounds.get(name) {
                if value < b.lower || value > b.upper {
                    return Err(format!(
                        "param {} = {} outside [{}, {}]",
                        name, value, b.lower, b.upper
                    ));
                }
            }
        }
        if let (Some(s), Some(l)) = (self.param("ema_short"), self.param("ema_long")) {
            if s >= l {
                return Err(format!("ema_short {} must be < ema_long {}", s, l));
            }
        }
        Ok(())
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}
