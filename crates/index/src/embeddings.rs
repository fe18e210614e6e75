use async_trait::async_trait;
use extract::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{IndexError, Result};

/// Text to fixed-size, L2-normalized vectors. Queries and passages are embedded differently.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_passage(&self, text: &str) -> Result<Vec<f32>>;
}

/// Cosine similarity. Mismatched or zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

#[derive(Clone)]
pub struct OllamaEmbedder {
    base_url: String,
    model: String,
    dimension: usize,
    client: reqwest::Client,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: String,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl OllamaEmbedder {
    pub fn new(
        base_url: &str,
        model: &str,
        dimension: usize,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dimension,
            client,
            retry,
        })
    }

    /// E5-style models expect `query: ` / `passage: ` prefixes.
    async fn embed(&self, prefixed: String) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url);
        let request = EmbeddingRequest { model: &self.model, prompt: prefixed };

        let embedding = self
            .retry
            .retry("ollama_embed", || async {
                let response = self.client.post(&url).json(&request).send().await?;

                if !response.status().is_success() {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    return Err(IndexError::Status { status, body });
                }

                let parsed: EmbeddingResponse = response.json().await?;
                Ok::<_, IndexError>(parsed.embedding)
            })
            .await?;

        if embedding.len() != self.dimension {
            return Err(IndexError::Embedding(format!(
                "expected {} dimensions, got {}",
                self.dimension,
                embedding.len()
            )));
        }

        Ok(l2_normalize(embedding))
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(format!("query: {}", text)).await
    }

    async fn embed_passage(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(format!("passage: {}", text)).await
    }
}

/// Deterministic feature-hashing embedder. Texts sharing words get similar vectors,
/// which is enough for tests and offline runs.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dim: dimension.max(1) }
    }

    fn project(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim];

        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric() && c != '-')
            .filter(|t| !t.is_empty())
        {
            // djb2
            let mut hash: u32 = 5381;
            for b in token.as_bytes() {
                hash = hash.wrapping_mul(33).wrapping_add(*b as u32);
            }
            let bucket = hash as usize % self.dim;
            let sign = if hash & 0x8000_0000 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }

        l2_normalize(v)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dim
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.project(text))
    }

    async fn embed_passage(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.project(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_hashing_embedder_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(64);

        let a = embedder.embed_passage("isolate valve V-201").await.unwrap();
        let b = embedder.embed_passage("isolate valve V-201").await.unwrap();
        assert_eq!(a, b);

        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_shared_words_raise_similarity() {
        let embedder = HashingEmbedder::new(256);

        let query = embedder.embed_query("lockout valve V-201").await.unwrap();
        let related = embedder.embed_passage("apply lockout to valve V-201").await.unwrap();
        let unrelated = embedder.embed_passage("gearbox oil change interval").await.unwrap();

        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }
}
