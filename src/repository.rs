//! Keyed document repositories.
//!
//! Storage is modeled as a generic keyed interface (get / put / find /
//! update / delete) with create-or-replace upsert semantics, so the backing
//! technology is swappable. `update` is an atomic read-modify-write at the
//! single-document level: the closure either commits as a whole or the
//! document is left untouched. `MemoryStore` is the in-process reference
//! implementation used by the engine and tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::experiment::{EvolutionCandidate, Experiment, ExperimentStatus};
use crate::genome::{GenomeStatus, StrategyFitness, StrategyGenome};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("update rejected: {0}")]
    Rejected(String),
}

/// Mutation applied under the store's single-document atomicity guarantee.
/// Returning Err aborts the update and leaves the document unchanged.
pub type UpdateFn<T> = Box<dyn FnOnce(&mut T) -> Result<(), String> + Send>;

/// Generic keyed document store with upsert semantics
#[async_trait]
pub trait KeyedStore<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<T>;

    /// Create-or-replace by natural key
    async fn put(&self, key: &str, doc: T);

    async fn find(&self, predicate: Box<dyn for<'a> Fn(&'a T) -> bool + Send + 'static>) -> Vec<T>;

    /// Atomic read-modify-write on one document
    async fn update(&self, key: &str, apply: UpdateFn<T>) -> Result<T, StoreError>;

    async fn delete(&self, key: &str) -> bool;
}

/// In-memory keyed store backed by a RwLock'd map
pub struct MemoryStore<T> {
    docs: RwLock<HashMap<String, T>>,
}

impl<T> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> KeyedStore<T> for MemoryStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<T> {
        self.docs.read().await.get(key).cloned()
    }

    async fn put(&self, key: &str, doc: T) {
        self.docs.write().await.insert(key.to_string(), doc);
    }

    async fn find(&self, predicate: Box<dyn for<'a> Fn(&'a T) -> bool + Send + 'static>) -> Vec<T> {
        let docs = self.docs.read().await;
        docs.values().filter(|doc| predicate(doc)).cloned().collect()
    }

    async fn update(&self, key: &str, apply: UpdateFn<T>) -> Result<T, StoreError> {
        let mut docs = self.docs.write().await;
        let doc = docs
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        // Work on a copy so a rejected update cannot leave a half-applied doc
        let mut updated = doc.clone();
        apply(&mut updated).map_err(StoreError::Rejected)?;
        docs.insert(key.to_string(), updated.clone());
        Ok(updated)
    }

    async fn delete(&self, key: &str) -> bool {
        self.docs.write().await.remove(key).is_some()
    }
}

/// Field used to order experiment listings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentSort {
    /// Oldest first
    CreatedAt,
    /// Lowest priority number first
    Priority,
    /// Highest score first
    Score,
}

/// Repository of experiments, keyed by experiment_id
pub struct ExperimentRepository {
    store: Arc<dyn KeyedStore<Experiment>>,
}

impl ExperimentRepository {
    pub fn new(store: Arc<dyn KeyedStore<Experiment>>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Batch-insert candidates as pending experiments with fresh ids and
    /// empty lineage/notes
    pub async fn create_batch(&self, candidates: Vec<EvolutionCandidate>) -> Vec<Experiment> {
        let mut experiments = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let experiment = Experiment::from_candidate(candidate);
            self.store
                .put(&experiment.experiment_id.clone(), experiment.clone())
                .await;
            experiments.push(experiment);
        }
        debug!(count = experiments.len(), "experiments created");
        experiments
    }

    pub async fn load(&self, experiment_id: &str) -> Result<Experiment, StoreError> {
        self.store
            .get(experiment_id)
            .await
            .ok_or_else(|| StoreError::NotFound(experiment_id.to_string()))
    }

    /// List experiments, optionally filtered by status, sorted by the
    /// chosen field and capped at `limit`
    pub async fn list(
        &self,
        status: Option<ExperimentStatus>,
        sort: ExperimentSort,
        limit: usize,
    ) -> Vec<Experiment> {
        let mut experiments = self
            .store
            .find(Box::new(move |e: &Experiment| {
                status.map_or(true, |s| e.status == s)
            }))
            .await;

        match sort {
            ExperimentSort::CreatedAt => experiments.sort_by_key(|e| e.created_at),
            ExperimentSort::Priority => experiments.sort_by_key(|e| e.priority),
            ExperimentSort::Score => experiments.sort_by(|a, b| {
                b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
            }),
        }
        experiments.truncate(limit);
        experiments
    }

    /// Apply a field patch under single-document atomicity, always stamping
    /// updated_at
    pub async fn update_fields<F>(&self, experiment_id: &str, patch: F) -> Result<Experiment, StoreError>
    where
        F: FnOnce(&mut Experiment) + Send + 'static,
    {
        self.store
            .update(
                experiment_id,
                Box::new(move |exp| {
                    patch(exp);
                    exp.updated_at = Utc::now();
                    Ok(())
                }),
            )
            .await
    }

    /// Push a note onto the ordered note list without clobbering other fields
    pub async fn append_note(&self, experiment_id: &str, text: &str) -> Result<Experiment, StoreError> {
        let text = text.to_string();
        self.store
            .update(
                experiment_id,
                Box::new(move |exp| {
                    exp.push_note(&text);
                    Ok(())
                }),
            )
            .await
    }

    /// Validated status transition persisted through the store
    pub async fn transition(
        &self,
        experiment_id: &str,
        to: ExperimentStatus,
    ) -> Result<Experiment, StoreError> {
        self.store
            .update(
                experiment_id,
                Box::new(move |exp| exp.transition(to).map_err(|e| e.to_string())),
            )
            .await
    }

    /// Assign new integer priorities in the caller-supplied order
    pub async fn reprioritize(&self, ordered_ids: &[String]) -> Result<(), StoreError> {
        for (index, experiment_id) in ordered_ids.iter().enumerate() {
            let priority = index as i64;
            self.store
                .update(
                    experiment_id,
                    Box::new(move |exp| {
                        exp.priority = priority;
                        exp.updated_at = Utc::now();
                        Ok(())
                    }),
                )
                .await?;
        }
        Ok(())
    }
}

/// Repository of strategy genomes, keyed by genome id
pub struct StrategyRepository {
    store: Arc<dyn KeyedStore<StrategyGenome>>,
}

impl StrategyRepository {
    pub fn new(store: Arc<dyn KeyedStore<StrategyGenome>>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub async fn upsert(&self, genome: StrategyGenome) {
        self.store.put(&genome.id.clone(), genome).await;
    }

    pub async fn get(&self, strategy_id: &str) -> Option<StrategyGenome> {
        self.store.get(strategy_id).await
    }

    pub async fn set_status(
        &self,
        strategy_id: &str,
        status: GenomeStatus,
    ) -> Result<StrategyGenome, StoreError> {
        self.store
            .update(
                strategy_id,
                Box::new(move |genome| {
                    genome.status = status;
                    Ok(())
                }),
            )
            .await
    }

    pub async fn update_fitness(
        &self,
        strategy_id: &str,
        fitness: StrategyFitness,
    ) -> Result<StrategyGenome, StoreError> {
        self.store
            .update(
                strategy_id,
                Box::new(move |genome| {
                    genome.fitness = fitness;
                    Ok(())
                }),
            )
            .await
    }

    /// Champions ordered by composite fitness, best first
    pub async fn champions(&self, limit: usize) -> Vec<StrategyGenome> {
        let mut champions = self
            .store
            .find(Box::new(|g: &StrategyGenome| g.status == GenomeStatus::Champion))
            .await;
        champions.sort_by(|a, b| {
            b.fitness
                .composite
                .partial_cmp(&a.fitness.composite)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        champions.truncate(limit);
        champions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn candidate(family: &str) -> EvolutionCandidate {
        let mut params = HashMap::new();
        params.insert("ema_short".to_string(), 10.0);
        params.insert("ema_long".to_string(), 30.0);
        EvolutionCandidate {
            genome: StrategyGenome::new(family, params),
            parent_id: None,
            operations: vec![],
            horizon: None,
            model_type: None,
            features: vec![],
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_memory_store_upsert() {
        let store: MemoryStore<String> = MemoryStore::new();
        store.put("k", "v1".to_string()).await;
        store.put("k", "v2".to_string()).await;
        assert_eq!(store.get("k").await, Some("v2".to_string()));
    }

    #[tokio::test]
    async fn test_memory_store_update_missing() {
        let store: MemoryStore<String> = MemoryStore::new();
        let err = store.update("nope", Box::new(|_| Ok(()))).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_memory_store_rejected_update_leaves_doc() {
        let store: MemoryStore<String> = MemoryStore::new();
        store.put("k", "original".to_string()).await;

        let err = store
            .update(
                "k",
                Box::new(|doc| {
                    *doc = "half-applied".to_string();
                    Err("validation failed".to_string())
                }),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Rejected(_)));
        assert_eq!(store.get("k").await, Some("original".to_string()));
    }

    #[tokio::test]
    async fn test_create_batch_pending() {
        let repo = ExperimentRepository::in_memory();
        let created = repo
            .create_batch(vec![candidate("a"), candidate("b"), candidate("c")])
            .await;

        assert_eq!(created.len(), 3);
        for exp in &created {
            assert_eq!(exp.status, ExperimentStatus::Pending);
            assert!(exp.lineage.is_empty());
            assert!(exp.notes.is_empty());
            let loaded = repo.load(&exp.experiment_id).await.unwrap();
            assert_eq!(loaded.experiment_id, exp.experiment_id);
        }
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let repo = ExperimentRepository::in_memory();
        let created = repo.create_batch(vec![candidate("a"), candidate("b")]).await;
        repo.transition(&created[0].experiment_id, ExperimentStatus::Running)
            .await
            .unwrap();

        let pending = repo
            .list(Some(ExperimentStatus::Pending), ExperimentSort::CreatedAt, 10)
            .await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].experiment_id, created[1].experiment_id);

        let all = repo.list(None, ExperimentSort::CreatedAt, 10).await;
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_list_caps_limit() {
        let repo = ExperimentRepository::in_memory();
        repo.create_batch((0..5).map(|_| candidate("a")).collect())
            .await;
        let listed = repo.list(None, ExperimentSort::CreatedAt, 3).await;
        assert_eq!(listed.len(), 3);
    }

    #[tokio::test]
    async fn test_list_sorts_by_score() {
        let repo = ExperimentRepository::in_memory();
        let created = repo.create_batch(vec![candidate("a"), candidate("b")]).await;
        repo.update_fields(&created[0].experiment_id, |e| e.score = 0.1)
            .await
            .unwrap();
        repo.update_fields(&created[1].experiment_id, |e| e.score = 0.9)
            .await
            .unwrap();

        let listed = repo.list(None, ExperimentSort::Score, 10).await;
        assert_eq!(listed[0].score, 0.9);
        assert_eq!(listed[1].score, 0.1);
    }

    #[tokio::test]
    async fn test_update_fields_stamps_updated_at() {
        let repo = ExperimentRepository::in_memory();
        let created = repo.create_batch(vec![candidate("a")]).await;
        let before = created[0].updated_at;

        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let updated = repo
            .update_fields(&created[0].experiment_id, |e| e.score = 1.5)
            .await
            .unwrap();

        assert_eq!(updated.score, 1.5);
        assert!(updated.updated_at > before);
    }

    #[tokio::test]
    async fn test_append_note_preserves_other_fields() {
        let repo = ExperimentRepository::in_memory();
        let created = repo.create_batch(vec![candidate("a")]).await;
        repo.update_fields(&created[0].experiment_id, |e| e.score = 2.0)
            .await
            .unwrap();

        let updated = repo
            .append_note(&created[0].experiment_id, "first note")
            .await
            .unwrap();

        assert_eq!(updated.notes.len(), 1);
        assert_eq!(updated.notes[0].text, "first note");
        assert_eq!(updated.score, 2.0);
    }

    #[tokio::test]
    async fn test_transition_rejects_invalid() {
        let repo = ExperimentRepository::in_memory();
        let created = repo.create_batch(vec![candidate("a")]).await;
        let id = created[0].experiment_id.clone();

        let err = repo.transition(&id, ExperimentStatus::Promoted).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));

        // Status untouched after the rejected transition
        let loaded = repo.load(&id).await.unwrap();
        assert_eq!(loaded.status, ExperimentStatus::Pending);
    }

    #[tokio::test]
    async fn test_reprioritize_assigns_order() {
        let repo = ExperimentRepository::in_memory();
        let created = repo
            .create_batch(vec![candidate("a"), candidate("b"), candidate("c")])
            .await;
        let order: Vec<String> = vec![
            created[2].experiment_id.clone(),
            created[0].experiment_id.clone(),
            created[1].experiment_id.clone(),
        ];

        repo.reprioritize(&order).await.unwrap();

        let listed = repo.list(None, ExperimentSort::Priority, 10).await;
        assert_eq!(listed[0].experiment_id, created[2].experiment_id);
        assert_eq!(listed[1].experiment_id, created[0].experiment_id);
        assert_eq!(listed[2].experiment_id, created[1].experiment_id);
    }

    #[tokio::test]
    async fn test_strategy_repository_upsert_and_status() {
        let repo = StrategyRepository::in_memory();
        let mut params = HashMap::new();
        params.insert("ema_short".to_string(), 10.0);
        params.insert("ema_long".to_string(), 30.0);
        let genome = StrategyGenome::new("trend", params);
        let id = genome.id.clone();

        repo.upsert(genome).await;
        assert!(repo.get(&id).await.is_some());

        repo.set_status(&id, GenomeStatus::Champion).await.unwrap();
        assert_eq!(repo.get(&id).await.unwrap().status, GenomeStatus::Champion);
    }

    #[tokio::test]
    async fn test_champions_sorted_by_composite() {
        let repo = StrategyRepository::in_memory();
        for composite in [0.2, 0.8, 0.5] {
            let mut genome = StrategyGenome::new("trend", HashMap::new());
            genome.status = GenomeStatus::Champion;
            genome.fitness.composite = composite;
            repo.upsert(genome).await;
        }
        let mut archived = StrategyGenome::new("trend", HashMap::new());
        archived.status = GenomeStatus::Archived;
        archived.fitness.composite = 9.9;
        repo.upsert(archived).await;

        let champions = repo.champions(2).await;
        assert_eq!(champions.len(), 2);
        assert_eq!(champions[0].fitness.composite, 0.8);
        assert_eq!(champions[1].fitness.composite, 0.5);
    }

    #[tokio::test]
    async fn test_update_fitness() {
        let repo = StrategyRepository::in_memory();
        let genome = StrategyGenome::new("trend", HashMap::new());
        let id = genome.id.clone();
        repo.upsert(genome).await;

        let fitness = StrategyFitness {
            roi: 0.1,
            sharpe: 1.2,
            composite: 0.55,
            ..StrategyFitness::default()
        };
        repo.update_fitness(&id, fitness.clone()).await.unwrap();
        assert_eq!(repo.get(&id).await.unwrap().fitness, fitness);
    }
}
