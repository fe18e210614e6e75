//! Gateway contracts for the vector store and the knowledge graph.
//!
//! The retrieval pipeline only sees [`VectorStore`] and [`GraphStore`]. The write side of the
//! graph ([`EntityGraph`]) belongs to ingestion and entity resolution.

use async_trait::async_trait;
use extract::{EntityType, RelationType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Exact(String),
    AnyOf(Vec<String>),
}

impl FilterValue {
    pub fn matches(&self, value: &Value) -> bool {
        let Some(value) = value.as_str() else {
            return false;
        };
        match self {
            FilterValue::Exact(expected) => expected == value,
            FilterValue::AnyOf(allowed) => allowed.iter().any(|a| a == value),
        }
    }
}

/// Payload field to value/membership equality, all conditions must hold.
pub type VectorFilter = BTreeMap<String, FilterValue>;

pub fn payload_matches(payload: &HashMap<String, Value>, filter: &VectorFilter) -> bool {
    filter
        .iter()
        .all(|(field, expected)| payload.get(field).is_some_and(|v| expected.matches(v)))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorCandidate {
    pub chunk_id: String,
    pub doc_id: String,
    pub content: String,
    /// Relevance in [0, 1].
    pub score: f32,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl VectorCandidate {
    /// Build from a stored payload. Identity fields are lifted out; everything else is metadata.
    pub fn from_payload(mut payload: HashMap<String, Value>, score: f32) -> Self {
        let mut take = |key: &str| {
            payload
                .remove(key)
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default()
        };
        let chunk_id = take("chunk_id");
        let doc_id = take("doc_id");
        let content = take("content");

        Self {
            chunk_id,
            doc_id,
            content,
            score: score.clamp(0.0, 1.0),
            metadata: payload,
        }
    }

    /// Same identity, new score.
    pub fn with_score(&self, score: f32) -> Self {
        Self { score: score.clamp(0.0, 1.0), ..self.clone() }
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Nearest neighbours by descending similarity.
    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&VectorFilter>,
    ) -> Result<Vec<VectorCandidate>>;

    async fn upsert_chunk(&self, chunk: &ingest::Chunk, vector: Vec<f32>) -> Result<()>;

    async fn delete_document(&self, doc_id: &str) -> Result<()>;

    async fn health(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    pub name: String,
}

/// Ordered nodes and the relation types between consecutive nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphPath {
    pub nodes: Vec<GraphNode>,
    pub relations: Vec<String>,
}

impl GraphPath {
    pub fn start(&self) -> Option<&GraphNode> {
        self.nodes.first()
    }

    pub fn end(&self) -> Option<&GraphNode> {
        self.nodes.last()
    }
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn get_node(&self, id: &str) -> Result<Option<GraphNode>>;

    async fn find_node_by_name(&self, canonical_name: &str) -> Result<Option<GraphNode>>;

    /// Paths of 1..=`max_hops` edges from `start_id` using only `edge_types`, in either direction.
    async fn traverse(
        &self,
        start_id: &str,
        edge_types: &[RelationType],
        max_hops: usize,
        limit: usize,
    ) -> Result<Vec<GraphPath>>;

    async fn health(&self) -> Result<()>;
}

/// Entity persisted in the graph, the unit of create/merge/link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedEntity {
    pub id: String,
    pub canonical_name: String,
    pub original_names: Vec<String>,
    pub entity_type: EntityType,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Fuzzy { distance: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCandidate {
    pub id: String,
    pub canonical_name: String,
    pub entity_type: EntityType,
    pub embedding: Vec<f32>,
    pub match_kind: MatchKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub entity_count: usize,
    pub relation_count: usize,
}

#[async_trait]
pub trait EntityGraph: GraphStore {
    /// Every entity carrying this canonical name, whatever its type.
    async fn find_exact(&self, canonical_name: &str, limit: usize) -> Result<Vec<EntityCandidate>>;

    /// Candidates within `max_distance` (exclusive) edits, closest first.
    async fn find_fuzzy(
        &self,
        canonical_name: &str,
        max_distance: usize,
        limit: usize,
    ) -> Result<Vec<EntityCandidate>>;

    /// Insert or update by id; original names are unioned.
    async fn upsert_entity(&self, entity: &ResolvedEntity) -> Result<()>;

    async fn add_alias(&self, id: &str, alias: &str) -> Result<()>;

    async fn create_relationship(
        &self,
        from_id: &str,
        to_id: &str,
        relation: RelationType,
        confidence: f32,
    ) -> Result<()>;

    async fn stats(&self) -> Result<GraphStats>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> HashMap<String, Value> {
        HashMap::from([
            ("chunk_id".to_string(), json!("c1")),
            ("doc_id".to_string(), json!("d1")),
            ("content".to_string(), json!("Apply lockout before work.")),
            ("doc_type".to_string(), json!("SOP")),
            ("classification".to_string(), json!("internal")),
        ])
    }

    #[test]
    fn test_filters_support_exact_and_membership() {
        let mut filter = VectorFilter::new();
        filter.insert("doc_type".into(), FilterValue::AnyOf(vec!["SOP".into(), "STANDARD".into()]));
        filter.insert("classification".into(), FilterValue::Exact("internal".into()));
        assert!(payload_matches(&payload(), &filter));

        filter.insert("doc_type".into(), FilterValue::Exact("RCA".into()));
        assert!(!payload_matches(&payload(), &filter));

        let mut missing = VectorFilter::new();
        missing.insert("title".into(), FilterValue::Exact("x".into()));
        assert!(!payload_matches(&payload(), &missing));
    }

    #[test]
    fn test_candidate_from_payload_lifts_identity() {
        let candidate = VectorCandidate::from_payload(payload(), 1.4);

        assert_eq!(candidate.chunk_id, "c1");
        assert_eq!(candidate.doc_id, "d1");
        assert_eq!(candidate.score, 1.0);
        assert_eq!(candidate.metadata_str("doc_type"), Some("SOP"));
        assert!(!candidate.metadata.contains_key("content"));

        let rescored = candidate.with_score(0.25);
        assert_eq!(rescored.chunk_id, candidate.chunk_id);
        assert_eq!(rescored.score, 0.25);
    }
}
