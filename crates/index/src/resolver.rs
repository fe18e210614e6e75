//! Entity resolution: normalize a mention, find candidates, score them and decide
//! whether to create a new entity, merge into an existing one or link to a near match.

use dashmap::DashMap;
use extract::{EntityNormalizer, EntityType, ExtractedEntity, RelationType};
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::embeddings::{Embedder, cosine_similarity};
use crate::error::Result;
use crate::store::{EntityCandidate, EntityGraph, MatchKind, ResolvedEntity};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub merge_threshold: f32,
    pub link_threshold: f32,
    pub embedding_weight: f32,
    pub context_weight: f32,
    /// Fuzzy candidates must be strictly closer than this edit distance.
    pub fuzzy_max_distance: usize,
    pub candidate_limit: usize,
    pub batch_concurrency: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            merge_threshold: 0.85,
            link_threshold: 0.70,
            embedding_weight: 0.6,
            context_weight: 0.4,
            fuzzy_max_distance: 3,
            candidate_limit: 5,
            batch_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionAction {
    Create,
    Merge,
    Link,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionResult {
    pub action: ResolutionAction,
    pub entity_id: String,
    pub link_to: Option<String>,
    pub confidence: f32,
    pub rationale: String,
    /// Entity to write for CREATE and LINK.
    pub canonical: Option<ResolvedEntity>,
}

#[derive(Debug, Clone)]
pub struct NormalizedEntity {
    pub canonical_name: String,
    pub original_name: String,
    pub entity_type: EntityType,
    pub embedding: Vec<f32>,
}

pub struct EntityResolver {
    graph: Arc<dyn EntityGraph>,
    embedder: Arc<dyn Embedder>,
    normalizer: EntityNormalizer,
    config: ResolverConfig,
    // One lock per canonical name serializes create decisions for the same name.
    name_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl EntityResolver {
    pub fn new(
        graph: Arc<dyn EntityGraph>,
        embedder: Arc<dyn Embedder>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            graph,
            embedder,
            normalizer: EntityNormalizer::new(),
            config,
            name_locks: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn canonical_name(&self, entity: &ExtractedEntity) -> String {
        self.normalizer.canonical_name(&entity.name, entity.entity_type)
    }

    pub async fn normalize(&self, entity: &ExtractedEntity) -> Result<NormalizedEntity> {
        let canonical_name = self.canonical_name(entity);
        let embedding = self.embedder.embed_passage(&canonical_name).await?;

        Ok(NormalizedEntity {
            canonical_name,
            original_name: entity.name.clone(),
            entity_type: entity.entity_type,
            embedding,
        })
    }

    /// All exact canonical matches first; fuzzy matches only when there are none.
    ///
    /// A name can exist under several types after a LINK, so every exact match is scored.
    pub async fn find_candidates(&self, normalized: &NormalizedEntity) -> Result<Vec<EntityCandidate>> {
        let exact = self
            .graph
            .find_exact(&normalized.canonical_name, self.config.candidate_limit)
            .await?;
        if !exact.is_empty() {
            return Ok(exact);
        }

        self.graph
            .find_fuzzy(
                &normalized.canonical_name,
                self.config.fuzzy_max_distance,
                self.config.candidate_limit,
            )
            .await
    }

    /// Type agreement plus how closely the names matched, in [0, 1].
    pub fn context_similarity(&self, normalized: &NormalizedEntity, candidate: &EntityCandidate) -> f32 {
        let type_match = if normalized.entity_type == candidate.entity_type { 1.0 } else { 0.0 };
        let name_match = match candidate.match_kind {
            MatchKind::Exact => 1.0,
            MatchKind::Fuzzy { distance } => {
                let len = normalized.canonical_name.chars().count().max(1);
                (1.0 - distance as f32 / len as f32).max(0.0)
            }
        };

        (0.5 * type_match + 0.5 * name_match).min(1.0)
    }

    pub fn score(&self, normalized: &NormalizedEntity, candidate: &EntityCandidate) -> f32 {
        let embedding = cosine_similarity(&normalized.embedding, &candidate.embedding).max(0.0);
        let context = self.context_similarity(normalized, candidate);

        self.config.embedding_weight * embedding + self.config.context_weight * context
    }

    fn new_entity(&self, normalized: &NormalizedEntity) -> ResolvedEntity {
        ResolvedEntity {
            id: Uuid::new_v4().to_string(),
            canonical_name: normalized.canonical_name.clone(),
            original_names: vec![normalized.original_name.clone()],
            entity_type: normalized.entity_type,
            embedding: normalized.embedding.clone(),
        }
    }

    /// Decide using the single best candidate.
    pub fn decide(&self, normalized: &NormalizedEntity, candidates: &[EntityCandidate]) -> ResolutionResult {
        let best = candidates
            .iter()
            .map(|c| (self.score(normalized, c), c))
            .fold(None::<(f32, &EntityCandidate)>, |best, (score, c)| match best {
                Some((top, _)) if top >= score => best,
                _ => Some((score, c)),
            });

        let Some((score, candidate)) = best else {
            let entity = self.new_entity(normalized);
            return ResolutionResult {
                action: ResolutionAction::Create,
                entity_id: entity.id.clone(),
                link_to: None,
                confidence: 1.0,
                rationale: "no candidates found".to_string(),
                canonical: Some(entity),
            };
        };

        if score >= self.config.merge_threshold {
            ResolutionResult {
                action: ResolutionAction::Merge,
                entity_id: candidate.id.clone(),
                link_to: None,
                confidence: score,
                rationale: format!(
                    "score {:.3} >= merge threshold, merged into '{}'",
                    score, candidate.canonical_name
                ),
                canonical: None,
            }
        } else if score >= self.config.link_threshold {
            let entity = self.new_entity(normalized);
            ResolutionResult {
                action: ResolutionAction::Link,
                entity_id: entity.id.clone(),
                link_to: Some(candidate.id.clone()),
                confidence: score,
                rationale: format!(
                    "score {:.3} >= link threshold, related to '{}'",
                    score, candidate.canonical_name
                ),
                canonical: Some(entity),
            }
        } else {
            let entity = self.new_entity(normalized);
            ResolutionResult {
                action: ResolutionAction::Create,
                entity_id: entity.id.clone(),
                link_to: None,
                confidence: 1.0 - score,
                rationale: format!("best score {:.3} below link threshold", score),
                canonical: Some(entity),
            }
        }
    }

    /// Resolve without writing anything.
    pub async fn resolve(&self, entity: &ExtractedEntity) -> Result<ResolutionResult> {
        let normalized = self.normalize(entity).await?;
        let candidates = self.find_candidates(&normalized).await?;
        let result = self.decide(&normalized, &candidates);

        debug!(
            name = %entity.name,
            canonical = %normalized.canonical_name,
            candidates = candidates.len(),
            action = ?result.action,
            confidence = result.confidence,
            "Resolved entity"
        );
        Ok(result)
    }

    /// Write the outcome of a decision to the graph.
    pub async fn apply(&self, entity: &ExtractedEntity, result: &ResolutionResult) -> Result<()> {
        match result.action {
            ResolutionAction::Merge => {
                self.graph.add_alias(&result.entity_id, &entity.name).await?;
            }
            ResolutionAction::Create | ResolutionAction::Link => {
                if let Some(canonical) = &result.canonical {
                    self.graph.upsert_entity(canonical).await?;
                }
                if let Some(target) = &result.link_to {
                    self.graph
                        .create_relationship(
                            &result.entity_id,
                            target,
                            RelationType::RelatedTo,
                            result.confidence,
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Resolve and write, holding the lock for this canonical name throughout.
    pub async fn resolve_and_apply(&self, entity: &ExtractedEntity) -> Result<ResolutionResult> {
        let canonical_name = self.canonical_name(entity);
        let lock = self
            .name_locks
            .entry(canonical_name.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let outcome = {
            let _guard = lock.lock().await;
            match self.resolve(entity).await {
                Ok(result) => self.apply(entity, &result).await.map(|()| result),
                Err(e) => Err(e),
            }
        };

        // Only the map holds the lock once every waiter is done with it.
        drop(lock);
        self.name_locks
            .remove_if(&canonical_name, |_, lock| Arc::strong_count(lock) == 1);

        outcome
    }

    /// Resolve a batch with bounded concurrency. Results keep input order.
    pub async fn resolve_batch(&self, entities: &[ExtractedEntity]) -> Vec<Result<ResolutionResult>> {
        let pending: Vec<_> = entities
            .iter()
            .map(|entity| self.resolve_and_apply(entity).boxed())
            .collect();
        let results: Vec<Result<ResolutionResult>> = futures::stream::iter(pending)
            .buffered(self.config.batch_concurrency.max(1))
            .collect()
            .await;

        let created = results
            .iter()
            .filter(|r| matches!(r, Ok(r) if r.action == ResolutionAction::Create))
            .count();
        info!(entities = entities.len(), created, "Resolved entity batch");

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashingEmbedder;
    use crate::memory::InMemoryGraphStore;
    use crate::store::GraphStore;

    fn resolver(graph: Arc<InMemoryGraphStore>) -> EntityResolver {
        EntityResolver::new(graph, Arc::new(HashingEmbedder::new(128)), ResolverConfig::default())
    }

    #[tokio::test]
    async fn test_unknown_entity_is_created() {
        let graph = Arc::new(InMemoryGraphStore::new());
        let resolver = resolver(graph.clone());

        let result = resolver
            .resolve_and_apply(&ExtractedEntity::new("p 101 a", EntityType::Asset, 0.9))
            .await
            .unwrap();

        assert_eq!(result.action, ResolutionAction::Create);
        let node = graph.get_node(&result.entity_id).await.unwrap().unwrap();
        assert_eq!(node.name, "P-101A");
        assert_eq!(node.label, "Asset");
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let graph = Arc::new(InMemoryGraphStore::new());
        let resolver = resolver(graph.clone());
        let entity = ExtractedEntity::new("Mechanical Seal", EntityType::Component, 0.8);

        let created = resolver.resolve_and_apply(&entity).await.unwrap();

        let first = resolver.resolve(&entity).await.unwrap();
        let second = resolver.resolve(&entity).await.unwrap();

        assert_eq!(first.action, ResolutionAction::Merge);
        assert_eq!(second.action, ResolutionAction::Merge);
        assert_eq!(first.entity_id, created.entity_id);
        assert_eq!(second.entity_id, created.entity_id);
    }

    #[tokio::test]
    async fn test_type_mismatch_links_instead_of_merging() {
        let graph = Arc::new(InMemoryGraphStore::new());
        let resolver = resolver(graph.clone());

        let seal = resolver
            .resolve_and_apply(&ExtractedEntity::new("seal flush", EntityType::Component, 0.8))
            .await
            .unwrap();
        let linked = resolver
            .resolve_and_apply(&ExtractedEntity::new("seal flush", EntityType::Procedure, 0.8))
            .await
            .unwrap();

        // 0.6 * 1.0 + 0.4 * 0.5
        assert_eq!(linked.action, ResolutionAction::Link);
        assert_eq!(linked.link_to.as_deref(), Some(seal.entity_id.as_str()));
        assert_ne!(linked.entity_id, seal.entity_id);

        let stats = graph.stats().await.unwrap();
        assert_eq!(stats.entity_count, 2);
        assert_eq!(stats.relation_count, 1);
    }

    #[tokio::test]
    async fn test_candidates_without_embeddings_do_not_merge() {
        let graph = Arc::new(InMemoryGraphStore::new());
        graph.add_node("seeded", EntityType::Tool, "torque wrench").await;
        let resolver = resolver(graph.clone());

        let result = resolver
            .resolve(&ExtractedEntity::new("Torque Wrench", EntityType::Tool, 0.9))
            .await
            .unwrap();

        // Only the context half contributes: 0.4 * 1.0
        assert_eq!(result.action, ResolutionAction::Create);
        assert!((result.confidence - 0.6).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_concurrent_mentions_create_one_entity() {
        let graph = Arc::new(InMemoryGraphStore::new());
        let resolver = resolver(graph.clone());
        let mentions = vec![
            ExtractedEntity::new("LOTO", EntityType::SafetyRule, 0.9),
            ExtractedEntity::new("lockout tagout", EntityType::SafetyRule, 0.9),
            ExtractedEntity::new("Lockout  Tagout!", EntityType::SafetyRule, 0.9),
        ];

        let results = resolver.resolve_batch(&mentions).await;

        let actions: Vec<ResolutionAction> = results.iter().map(|r| r.as_ref().unwrap().action).collect();
        assert_eq!(
            actions.iter().filter(|a| **a == ResolutionAction::Create).count(),
            1
        );
        assert_eq!(graph.stats().await.unwrap().entity_count, 1);

        let id = &results[0].as_ref().unwrap().entity_id;
        let entity = graph.entity(id).await.unwrap();
        assert_eq!(entity.canonical_name, "lockout tagout");
        assert_eq!(entity.original_names.len(), 3);
    }

    #[tokio::test]
    async fn test_same_type_mention_merges_after_link() {
        let graph = Arc::new(InMemoryGraphStore::new());
        let resolver = resolver(graph.clone());
        let component = ExtractedEntity::new("seal flush", EntityType::Component, 0.8);

        let procedure = resolver
            .resolve_and_apply(&ExtractedEntity::new("seal flush", EntityType::Procedure, 0.8))
            .await
            .unwrap();
        let first = resolver.resolve_and_apply(&component).await.unwrap();
        let second = resolver.resolve_and_apply(&component).await.unwrap();
        let third = resolver.resolve_and_apply(&component).await.unwrap();

        assert_eq!(procedure.action, ResolutionAction::Create);
        assert_eq!(first.action, ResolutionAction::Link);
        assert_eq!(second.action, ResolutionAction::Merge);
        assert_eq!(second.entity_id, first.entity_id);
        assert_eq!(third.action, ResolutionAction::Merge);
        assert_eq!(third.entity_id, first.entity_id);
        assert_eq!(graph.stats().await.unwrap().entity_count, 2);
    }

    #[tokio::test]
    async fn test_name_locks_are_released_after_batch() {
        let graph = Arc::new(InMemoryGraphStore::new());
        let resolver = Arc::new(resolver(graph.clone()));
        let mentions = vec![
            ExtractedEntity::new("V-201", EntityType::Asset, 0.9),
            ExtractedEntity::new("v 201", EntityType::Asset, 0.9),
            ExtractedEntity::new("gasket", EntityType::Component, 0.8),
        ];

        // Spawned on the runtime, so the batch future has to be Send.
        let batch = tokio::spawn({
            let resolver = resolver.clone();
            async move { resolver.resolve_batch(&mentions).await }
        });
        let results = batch.await.unwrap();

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(graph.stats().await.unwrap().entity_count, 2);
        assert!(resolver.name_locks.is_empty());
    }
}
