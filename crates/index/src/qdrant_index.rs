use async_trait::async_trait;
use extract::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{IndexError, Result};
use crate::store::{FilterValue, VectorCandidate, VectorFilter, VectorStore};

/// Qdrant over its REST API.
pub struct QdrantStore {
    base_url: String,
    client: reqwest::Client,
    collection_name: String,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct CreateCollection {
    vectors: VectorParams,
}

#[derive(Serialize)]
struct VectorParams {
    size: usize,
    distance: &'static str,
}

#[derive(Serialize)]
struct UpsertPoints {
    points: Vec<Point>,
}

#[derive(Serialize)]
struct Point {
    id: u64,
    vector: Vec<f32>,
    payload: HashMap<String, Value>,
}

#[derive(Serialize)]
struct SearchRequest {
    vector: Vec<f32>,
    limit: usize,
    with_payload: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<Value>,
}

#[derive(Deserialize)]
struct SearchResponse {
    result: Vec<ScoredPoint>,
}

#[derive(Deserialize)]
struct ScoredPoint {
    score: f32,
    #[serde(default)]
    payload: HashMap<String, Value>,
}

#[derive(Deserialize)]
struct CollectionList {
    result: CollectionListResult,
}

#[derive(Deserialize)]
struct CollectionListResult {
    collections: Vec<CollectionName>,
}

#[derive(Deserialize)]
struct CollectionName {
    name: String,
}

/// Qdrant `must` filter: `match.value` for one value, `match.any` for a set.
pub fn qdrant_filter(filter: &VectorFilter) -> Value {
    let must: Vec<Value> = filter
        .iter()
        .map(|(key, value)| match value {
            FilterValue::Exact(v) => json!({"key": key, "match": {"value": v}}),
            FilterValue::AnyOf(vs) => json!({"key": key, "match": {"any": vs}}),
        })
        .collect();
    json!({ "must": must })
}

/// Stable u64 point id from the first 8 bytes of the chunk id's SHA-256.
pub fn point_id(chunk_id: &str) -> u64 {
    let digest = Sha256::digest(chunk_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

impl QdrantStore {
    pub fn new(
        base_url: &str,
        collection_name: &str,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            collection_name: collection_name.to_string(),
            retry,
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(IndexError::Status { status, body });
        }
        Ok(response)
    }

    /// Create the collection with cosine distance if it does not exist yet.
    pub async fn ensure_collection(&self, dimension: usize) -> Result<()> {
        let url = format!("{}/collections", self.base_url);
        let response = Self::check(self.client.get(&url).send().await?).await?;

        let list: CollectionList = response.json().await?;
        if list.result.collections.iter().any(|c| c.name == self.collection_name) {
            debug!(collection = %self.collection_name, "Collection already exists");
            return Ok(());
        }

        let url = format!("{}/collections/{}", self.base_url, self.collection_name);
        let request = CreateCollection {
            vectors: VectorParams { size: dimension, distance: "Cosine" },
        };
        Self::check(self.client.put(&url).json(&request).send().await?).await?;

        info!(collection = %self.collection_name, dimension, "Created collection");
        Ok(())
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&VectorFilter>,
    ) -> Result<Vec<VectorCandidate>> {
        let url = format!(
            "{}/collections/{}/points/search",
            self.base_url, self.collection_name
        );
        let request = SearchRequest {
            vector: vector.to_vec(),
            limit: top_k,
            with_payload: true,
            filter: filter.filter(|f| !f.is_empty()).map(qdrant_filter),
        };

        let parsed: SearchResponse = self
            .retry
            .retry("qdrant_search", || async {
                let response = Self::check(self.client.post(&url).json(&request).send().await?).await?;
                Ok::<_, IndexError>(response.json::<SearchResponse>().await?)
            })
            .await?;

        Ok(parsed
            .result
            .into_iter()
            .map(|p| VectorCandidate::from_payload(p.payload, p.score))
            .collect())
    }

    async fn upsert_chunk(&self, chunk: &ingest::Chunk, vector: Vec<f32>) -> Result<()> {
        let url = format!(
            "{}/collections/{}/points?wait=true",
            self.base_url, self.collection_name
        );
        let request = UpsertPoints {
            points: vec![Point {
                id: point_id(&chunk.chunk_id),
                vector,
                payload: chunk.payload(),
            }],
        };

        self.retry
            .retry("qdrant_upsert", || async {
                Self::check(self.client.put(&url).json(&request).send().await?).await?;
                Ok::<_, IndexError>(())
            })
            .await
    }

    async fn delete_document(&self, doc_id: &str) -> Result<()> {
        let url = format!(
            "{}/collections/{}/points/delete?wait=true",
            self.base_url, self.collection_name
        );
        let mut filter = VectorFilter::new();
        filter.insert("doc_id".to_string(), FilterValue::Exact(doc_id.to_string()));
        let body = json!({ "filter": qdrant_filter(&filter) });

        Self::check(self.client.post(&url).json(&body).send().await?).await?;
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        let url = format!("{}/collections/{}", self.base_url, self.collection_name);
        Self::check(self.client.get(&url).send().await?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_uses_value_and_any() {
        let mut filter = VectorFilter::new();
        filter.insert("classification".into(), FilterValue::AnyOf(vec!["public".into(), "internal".into()]));
        filter.insert("doc_type".into(), FilterValue::Exact("SOP".into()));

        let value = qdrant_filter(&filter);
        let must = value["must"].as_array().unwrap();

        // BTreeMap keeps keys ordered
        assert_eq!(must[0]["key"], "classification");
        assert_eq!(must[0]["match"]["any"], json!(["public", "internal"]));
        assert_eq!(must[1]["match"]["value"], "SOP");
    }

    #[test]
    fn test_point_id_is_stable() {
        assert_eq!(point_id("chunk-1"), point_id("chunk-1"));
        assert_ne!(point_id("chunk-1"), point_id("chunk-2"));
    }
}
