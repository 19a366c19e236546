//! Mutation and crossover operators over strategy genomes.
//!
//! All randomness flows through one seeded `StdRng`, so a given seed
//! reproduces an identical generation.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use crate::config::MutationConfig;
use crate::experiment::EvolutionCandidate;
use crate::genome::{GenomeStatus, ParamBounds, StrategyFitness, StrategyGenome};

const HORIZON_SWAP_PROB: f64 = 0.4;
const MODEL_SWAP_PROB: f64 = 0.35;

/// Produces new genome candidates from champion pools
pub struct MutationEngine {
    config: MutationConfig,
    bounds: ParamBounds,
    rng: StdRng,
}

impl MutationEngine {
    pub fn new(config: MutationConfig, bounds: ParamBounds, seed: u64) -> Self {
        Self {
            config,
            bounds,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Mutate a single parent genome into a fresh candidate
    pub fn mutate(&mut self, parent: &StrategyGenome) -> EvolutionCandidate {
        let mut operations = Vec::new();
        let mut child = parent.clone();
        child.id = Uuid::new_v4().to_string();
        child.mutation_parent = Some(parent.id.clone());
        child.generation = parent.generation + 1;
        child.status = GenomeStatus::Candidate;
        child.fitness = StrategyFitness::default();
        child.created_at = chrono::Utc::now();
        if !child.has_tag("mutation") {
            child.tags.push("mutation".to_string());
        }

        // Per-parameter multiplicative jitter. Iterate keys in sorted order
        // so the RNG consumption is deterministic for a given seed.
        let mut names: Vec<String> = child.params.keys().cloned().collect();
        names.sort();
        for name in names {
            if self.rng.gen::<f64>() < self.config.mutation_rate {
                let scale = self.config.mutation_scale;
                let factor = self.rng.gen_range(1.0 - scale..=1.0 + scale);
                if let Some(value) = child.params.get_mut(&name) {
                    *value *= factor;
                }
                operations.push(format!("jitter:{}", name));
            }
        }
        child.normalize(&self.bounds);

        // Feature-set mutation: optionally drop one, optionally add one
        if !child.metadata.features.is_empty() && self.rng.gen::<f64>() < self.config.drop_feature_prob
        {
            let idx = self.rng.gen_range(0..child.metadata.features.len());
            let removed = child.metadata.features.remove(idx);
            operations.push(format!("drop_feature:{}", removed));
        }
        if self.rng.gen::<f64>() < self.config.add_feature_prob {
            let missing: Vec<&String> = self
                .config
                .feature_library
                .iter()
                .filter(|f| !child.metadata.features.contains(f))
                .collect();
            if !missing.is_empty() {
                let idx = self.rng.gen_range(0..missing.len());
                let added = missing[idx].clone();
                child.metadata.features.push(added.clone());
                operations.push(format!("add_feature:{}", added));
            }
        }

        // Horizon / model-type swaps to a different allowed value
        if self.rng.gen::<f64>() < HORIZON_SWAP_PROB {
            let horizons = self.config.allowed_horizons.clone();
            if let Some(horizon) = self.pick_other(&horizons, &child.metadata.horizon) {
                child.metadata.horizon = horizon.clone();
                operations.push(format!("horizon:{}", horizon));
            }
        }
        if self.rng.gen::<f64>() < MODEL_SWAP_PROB {
            let models = self.config.allowed_model_types.clone();
            if let Some(model) = self.pick_other(&models, &child.metadata.model_type) {
                child.metadata.model_type = model.clone();
                operations.push(format!("model:{}", model));
            }
        }

        debug!(
            parent = %parent.id,
            child = %child.id,
            generation = child.generation,
            operations = operations.len(),
            "mutated genome"
        );

        EvolutionCandidate {
            parent_id: Some(parent.id.clone()),
            horizon: Some(child.metadata.horizon.clone()),
            model_type: Some(child.metadata.model_type.clone()),
            features: child.metadata.features.clone(),
            metadata: HashMap::new(),
            operations,
            genome: child,
        }
    }

    /// Blend two parents into a crossover candidate
    pub fn crossover(&mut self, a: &StrategyGenome, b: &StrategyGenome) -> EvolutionCandidate {
        let mut params = HashMap::new();
        let mut keys: Vec<String> = a.params.keys().chain(b.params.keys()).cloned().collect();
        keys.sort();
        keys.dedup();

        for key in keys {
            let value = match (a.params.get(&key), b.params.get(&key)) {
                (Some(&va), Some(&vb)) => {
                    let w = self.rng.gen::<f64>();
                    va * w + vb * (1.0 - w)
                }
                (Some(&va), None) => va,
                (None, Some(&vb)) => vb,
                (None, None) => continue,
            };
            params.insert(key, value);
        }

        let mut child = StrategyGenome::new(&a.family, params);
        child.mutation_parent = Some(a.id.clone());
        child.generation = a.generation.max(b.generation) + 1;
        child.tags.push("crossover".to_string());
        child.uses_forecast = a.uses_forecast || b.uses_forecast;
        child.forecast_weight = (a.forecast_weight + b.forecast_weight) / 2.0;

        // Feature set is the union of both parents
        let mut features = a.metadata.features.clone();
        for f in &b.metadata.features {
            if !features.contains(f) {
                features.push(f.clone());
            }
        }
        child.metadata.features = features;
        child.metadata.horizon = if self.rng.gen::<bool>() {
            a.metadata.horizon.clone()
        } else {
            b.metadata.horizon.clone()
        };
        child.metadata.model_type = if self.rng.gen::<bool>() {
            a.metadata.model_type.clone()
        } else {
            b.metadata.model_type.clone()
        };
        child.normalize(&self.bounds);

        debug!(
            parent_a = %a.id,
            parent_b = %b.id,
            child = %child.id,
            generation = child.generation,
            "crossover genome"
        );

        EvolutionCandidate {
            parent_id: Some(a.id.clone()),
            operations: vec![format!("crossover:{}", b.id)],
            horizon: Some(child.metadata.horizon.clone()),
            model_type: Some(child.metadata.model_type.clone()),
            features: child.metadata.features.clone(),
            metadata: HashMap::new(),
            genome: child,
        }
    }

    /// Produce `mutations_per_parent` mutants per champion plus one
    /// crossover per adjacent champion pair in the input ordering.
    pub fn spawn_variants(&mut self, champions: &[StrategyGenome]) -> Vec<EvolutionCandidate> {
        let mut candidates = Vec::new();
        for champion in champions {
            for _ in 0..self.config.mutations_per_parent {
                candidates.push(self.mutate(champion));
            }
        }
        for pair in champions.windows(2) {
            candidates.push(self.crossover(&pair[0], &pair[1]));
        }
        candidates
    }

    /// Pick a value from `allowed` different from `current`, if possible
    fn pick_other(&mut self, allowed: &[String], current: &str) -> Option<String> {
        let others: Vec<&String> = allowed.iter().filter(|v| v.as_str() != current).collect();
        if others.is_empty() {
            return None;
        }
        let idx = self.rng.gen_range(0..others.len());
        Some(others[idx].clone())
    }
}
