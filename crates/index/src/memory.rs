//! Process-local stores for tests and offline runs.

use async_trait::async_trait;
use extract::{EntityType, RelationType};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::RwLock;

use crate::embeddings::cosine_similarity;
use crate::error::Result;
use crate::store::{
    EntityCandidate, EntityGraph, GraphNode, GraphPath, GraphStats, GraphStore, MatchKind,
    ResolvedEntity, VectorCandidate, VectorFilter, VectorStore, payload_matches,
};

struct StoredPoint {
    chunk_id: String,
    vector: Vec<f32>,
    payload: HashMap<String, Value>,
}

/// Brute-force cosine search. Ties keep insertion order.
#[derive(Default)]
pub struct InMemoryVectorStore {
    points: RwLock<Vec<StoredPoint>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a point by the payload's `chunk_id`.
    pub async fn insert(&self, vector: Vec<f32>, payload: HashMap<String, Value>) {
        let chunk_id = payload
            .get("chunk_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let mut points = self.points.write().await;

        match points.iter_mut().find(|p| p.chunk_id == chunk_id) {
            Some(existing) => {
                existing.vector = vector;
                existing.payload = payload;
            }
            None => points.push(StoredPoint { chunk_id, vector, payload }),
        }
    }

    pub async fn len(&self) -> usize {
        self.points.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.points.read().await.is_empty()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&VectorFilter>,
    ) -> Result<Vec<VectorCandidate>> {
        let points = self.points.read().await;

        let mut scored: Vec<(f32, &StoredPoint)> = points
            .iter()
            .filter(|p| filter.is_none_or(|f| payload_matches(&p.payload, f)))
            .map(|p| (cosine_similarity(vector, &p.vector), p))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(score, p)| VectorCandidate::from_payload(p.payload.clone(), score))
            .collect())
    }

    async fn upsert_chunk(&self, chunk: &ingest::Chunk, vector: Vec<f32>) -> Result<()> {
        self.insert(vector, chunk.payload()).await;
        Ok(())
    }

    async fn delete_document(&self, doc_id: &str) -> Result<()> {
        self.points
            .write()
            .await
            .retain(|p| p.payload.get("doc_id").and_then(|v| v.as_str()) != Some(doc_id));
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Edge {
    from: String,
    to: String,
    relation: RelationType,
}

#[derive(Default)]
struct GraphData {
    order: Vec<String>,
    nodes: HashMap<String, ResolvedEntity>,
    edges: Vec<Edge>,
}

impl GraphData {
    fn iter(&self) -> impl Iterator<Item = &ResolvedEntity> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    fn node(&self, id: &str) -> Option<GraphNode> {
        self.nodes.get(id).map(to_graph_node)
    }
}

fn to_graph_node(entity: &ResolvedEntity) -> GraphNode {
    GraphNode {
        id: entity.id.clone(),
        label: entity.entity_type.label().to_string(),
        name: entity.canonical_name.clone(),
    }
}

fn to_candidate(entity: &ResolvedEntity, match_kind: MatchKind) -> EntityCandidate {
    EntityCandidate {
        id: entity.id.clone(),
        canonical_name: entity.canonical_name.clone(),
        entity_type: entity.entity_type,
        embedding: entity.embedding.clone(),
        match_kind,
    }
}

/// Labelled property graph held in memory. Traversal ignores edge direction.
#[derive(Default)]
pub struct InMemoryGraphStore {
    data: RwLock<GraphData>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a node without an embedding.
    pub async fn add_node(&self, id: &str, entity_type: EntityType, name: &str) {
        let entity = ResolvedEntity {
            id: id.to_string(),
            canonical_name: name.to_string(),
            original_names: vec![name.to_string()],
            entity_type,
            embedding: Vec::new(),
        };
        // Infallible for the in-memory store
        let _ = self.upsert_entity(&entity).await;
    }

    pub async fn add_edge(&self, from_id: &str, to_id: &str, relation: RelationType) {
        let _ = self.create_relationship(from_id, to_id, relation, 1.0).await;
    }

    pub async fn entity(&self, id: &str) -> Option<ResolvedEntity> {
        self.data.read().await.nodes.get(id).cloned()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn get_node(&self, id: &str) -> Result<Option<GraphNode>> {
        Ok(self.data.read().await.node(id))
    }

    async fn find_node_by_name(&self, canonical_name: &str) -> Result<Option<GraphNode>> {
        let data = self.data.read().await;
        Ok(data
            .iter()
            .find(|e| {
                e.canonical_name == canonical_name
                    || e.original_names.iter().any(|n| n == canonical_name)
            })
            .map(to_graph_node))
    }

    async fn traverse(
        &self,
        start_id: &str,
        edge_types: &[RelationType],
        max_hops: usize,
        limit: usize,
    ) -> Result<Vec<GraphPath>> {
        let data = self.data.read().await;
        if !data.nodes.contains_key(start_id) {
            return Ok(Vec::new());
        }

        let allowed: HashSet<RelationType> = edge_types.iter().copied().collect();
        let mut paths = Vec::new();
        let mut queue: VecDeque<(Vec<String>, Vec<String>)> =
            VecDeque::from([(vec![start_id.to_string()], Vec::new())]);

        // Breadth first, so shorter paths come out first
        while let Some((node_ids, relations)) = queue.pop_front() {
            if relations.len() >= max_hops.max(1) {
                continue;
            }
            let Some(current) = node_ids.last() else {
                continue;
            };

            for edge in &data.edges {
                if !allowed.is_empty() && !allowed.contains(&edge.relation) {
                    continue;
                }
                let next = if edge.from == *current {
                    &edge.to
                } else if edge.to == *current {
                    &edge.from
                } else {
                    continue;
                };
                if node_ids.contains(next) {
                    continue;
                }

                let mut next_ids = node_ids.clone();
                next_ids.push(next.clone());
                let mut next_relations = relations.clone();
                next_relations.push(edge.relation.as_str().to_string());

                paths.push(GraphPath {
                    nodes: next_ids.iter().filter_map(|id| data.node(id)).collect(),
                    relations: next_relations.clone(),
                });
                if paths.len() >= limit {
                    return Ok(paths);
                }
                queue.push_back((next_ids, next_relations));
            }
        }

        Ok(paths)
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl EntityGraph for InMemoryGraphStore {
    async fn find_exact(&self, canonical_name: &str, limit: usize) -> Result<Vec<EntityCandidate>> {
        let data = self.data.read().await;
        Ok(data
            .iter()
            .filter(|e| e.canonical_name == canonical_name)
            .take(limit)
            .map(|e| to_candidate(e, MatchKind::Exact))
            .collect())
    }

    async fn find_fuzzy(
        &self,
        canonical_name: &str,
        max_distance: usize,
        limit: usize,
    ) -> Result<Vec<EntityCandidate>> {
        let data = self.data.read().await;
        let mut matches: Vec<(usize, &ResolvedEntity)> = data
            .iter()
            .map(|e| (strsim::levenshtein(&e.canonical_name, canonical_name), e))
            .filter(|(distance, _)| *distance < max_distance)
            .collect();
        matches.sort_by_key(|(distance, _)| *distance);

        Ok(matches
            .into_iter()
            .take(limit)
            .map(|(distance, e)| to_candidate(e, MatchKind::Fuzzy { distance }))
            .collect())
    }

    async fn upsert_entity(&self, entity: &ResolvedEntity) -> Result<()> {
        let mut guard = self.data.write().await;
        let data = &mut *guard;

        match data.nodes.get_mut(&entity.id) {
            Some(existing) => {
                existing.canonical_name = entity.canonical_name.clone();
                existing.entity_type = entity.entity_type;
                existing.embedding = entity.embedding.clone();
                for name in &entity.original_names {
                    if !existing.original_names.contains(name) {
                        existing.original_names.push(name.clone());
                    }
                }
            }
            None => {
                data.order.push(entity.id.clone());
                data.nodes.insert(entity.id.clone(), entity.clone());
            }
        }
        Ok(())
    }

    async fn add_alias(&self, id: &str, alias: &str) -> Result<()> {
        let mut data = self.data.write().await;
        if let Some(entity) = data.nodes.get_mut(id) {
            if !entity.original_names.iter().any(|n| n == alias) {
                entity.original_names.push(alias.to_string());
            }
        }
        Ok(())
    }

    async fn create_relationship(
        &self,
        from_id: &str,
        to_id: &str,
        relation: RelationType,
        _confidence: f32,
    ) -> Result<()> {
        let relation = match relation {
            RelationType::Unknown => RelationType::RelatedTo,
            other => other,
        };
        let mut data = self.data.write().await;

        if !data.nodes.contains_key(from_id) || !data.nodes.contains_key(to_id) {
            return Ok(());
        }
        let exists = data
            .edges
            .iter()
            .any(|e| e.from == from_id && e.to == to_id && e.relation == relation);
        if !exists {
            data.edges.push(Edge {
                from: from_id.to_string(),
                to: to_id.to_string(),
                relation,
            });
        }
        Ok(())
    }

    async fn stats(&self) -> Result<GraphStats> {
        let data = self.data.read().await;
        Ok(GraphStats {
            entity_count: data.nodes.len(),
            relation_count: data.edges.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(chunk_id: &str, doc_type: &str) -> HashMap<String, Value> {
        HashMap::from([
            ("chunk_id".to_string(), json!(chunk_id)),
            ("doc_id".to_string(), json!(format!("doc-{}", chunk_id))),
            ("content".to_string(), json!("text")),
            ("doc_type".to_string(), json!(doc_type)),
        ])
    }

    #[tokio::test]
    async fn test_vector_search_orders_and_filters() {
        let store = InMemoryVectorStore::new();
        store.insert(vec![1.0, 0.0], payload("a", "SOP")).await;
        store.insert(vec![0.6, 0.8], payload("b", "RCA")).await;
        store.insert(vec![0.0, 1.0], payload("c", "SOP")).await;

        let results = store.search(&[1.0, 0.0], 10, None).await.unwrap();
        let ids: Vec<&str> = results.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let mut filter = VectorFilter::new();
        filter.insert("doc_type".into(), crate::store::FilterValue::Exact("SOP".into()));
        let filtered = store.search(&[1.0, 0.0], 10, Some(&filter)).await.unwrap();
        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().all(|c| c.metadata_str("doc_type") == Some("SOP")));
    }

    #[tokio::test]
    async fn test_traverse_respects_edge_types_and_hops() {
        let graph = InMemoryGraphStore::new();
        graph.add_node("v201", EntityType::Asset, "V-201").await;
        graph.add_node("loto", EntityType::SafetyRule, "lockout tagout").await;
        graph.add_node("ppe", EntityType::SafetyRule, "personal protective equipment").await;
        graph.add_node("seal", EntityType::Component, "seal").await;
        graph.add_edge("v201", "loto", RelationType::HasSafetyRule).await;
        graph.add_edge("loto", "ppe", RelationType::Requires).await;
        graph.add_edge("v201", "seal", RelationType::HasComponent).await;

        let one_hop = graph
            .traverse("v201", &[RelationType::HasSafetyRule, RelationType::Requires], 1, 20)
            .await
            .unwrap();
        assert_eq!(one_hop.len(), 1);
        assert_eq!(one_hop[0].relations, vec!["HAS_SAFETY_RULE"]);

        let two_hops = graph
            .traverse("v201", &[RelationType::HasSafetyRule, RelationType::Requires], 2, 20)
            .await
            .unwrap();
        assert_eq!(two_hops.len(), 2);
        assert_eq!(two_hops[1].end().unwrap().name, "personal protective equipment");

        // Incoming edges are followed too
        let reverse = graph.traverse("seal", &[RelationType::HasComponent], 1, 20).await.unwrap();
        assert_eq!(reverse[0].end().unwrap().id, "v201");

        assert!(graph.traverse("missing", &[], 2, 20).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fuzzy_candidates_sorted_by_distance() {
        let graph = InMemoryGraphStore::new();
        graph.add_node("1", EntityType::Component, "mechanical seals").await;
        graph.add_node("2", EntityType::Component, "mechanical seal").await;
        graph.add_node("3", EntityType::Component, "gearbox").await;

        let candidates = graph.find_fuzzy("mechanical seal", 3, 5).await.unwrap();
        let ids: Vec<&str> = candidates.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "1"]);
        assert_eq!(candidates[0].match_kind, MatchKind::Fuzzy { distance: 0 });
    }

    #[tokio::test]
    async fn test_upsert_merges_original_names() {
        let graph = InMemoryGraphStore::new();
        graph.add_node("p101", EntityType::Asset, "P-101").await;
        graph.add_alias("p101", "pump p101").await.unwrap();
        graph.add_alias("p101", "pump p101").await.unwrap();

        let entity = graph.entity("p101").await.unwrap();
        assert_eq!(entity.original_names, vec!["P-101", "pump p101"]);
        assert_eq!(graph.stats().await.unwrap().entity_count, 1);
    }
}
