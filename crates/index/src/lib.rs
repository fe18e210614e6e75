pub mod embeddings;
pub mod error;
pub mod memory;
pub mod neo4j_index;
pub mod qdrant_index;
pub mod resolver;
pub mod store;

pub use embeddings::{Embedder, HashingEmbedder, OllamaEmbedder, cosine_similarity};
pub use error::IndexError;
pub use memory::{InMemoryGraphStore, InMemoryVectorStore};
pub use neo4j_index::Neo4jStore;
pub use qdrant_index::QdrantStore;
pub use resolver::{EntityResolver, ResolutionAction, ResolutionResult, ResolverConfig};
pub use store::{
    EntityCandidate, EntityGraph, FilterValue, GraphNode, GraphPath, GraphStats, GraphStore,
    MatchKind, ResolvedEntity, VectorCandidate, VectorFilter, VectorStore,
};

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;

/// Write path: chunk vectors into the vector store, resolved entities and relations into the graph.
pub struct Indexer {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
    graph: Arc<dyn EntityGraph>,
    resolver: EntityResolver,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub created: usize,
    pub merged: usize,
    pub linked: usize,
    pub relations: usize,
}

impl IndexReport {
    pub fn absorb(&mut self, other: IndexReport) {
        self.created += other.created;
        self.merged += other.merged;
        self.linked += other.linked;
        self.relations += other.relations;
    }
}

#[derive(Debug, Serialize)]
pub struct IndexStats {
    pub entities: usize,
    pub relations: usize,
}

impl Indexer {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorStore>,
        graph: Arc<dyn EntityGraph>,
        config: ResolverConfig,
    ) -> Self {
        let resolver = EntityResolver::new(graph.clone(), embedder.clone(), config);
        Self { embedder, vectors, graph, resolver }
    }

    pub fn resolver(&self) -> &EntityResolver {
        &self.resolver
    }

    /// Index a single extracted chunk
    pub async fn index_extracted_chunk(
        &self,
        chunk: &ingest::Chunk,
        extracted: &extract::ExtractedChunk,
    ) -> Result<IndexReport> {
        let vector = self.embedder.embed_passage(&chunk.text).await?;
        self.vectors.upsert_chunk(chunk, vector).await?;
        self.index_graph(chunk, extracted).await
    }

    /// Swap a document's chunks for a fresh extraction.
    ///
    /// Every passage is embedded before the old points are deleted, so an embedding
    /// failure leaves the previous version searchable.
    pub async fn replace_document(
        &self,
        doc_id: &str,
        chunks: &[(ingest::Chunk, extract::ExtractedChunk)],
    ) -> Result<IndexReport> {
        let mut vectors = Vec::with_capacity(chunks.len());
        for (chunk, _) in chunks {
            vectors.push(self.embedder.embed_passage(&chunk.text).await?);
        }

        self.vectors.delete_document(doc_id).await?;

        let mut report = IndexReport::default();
        for ((chunk, extracted), vector) in chunks.iter().zip(vectors) {
            self.vectors.upsert_chunk(chunk, vector).await?;
            report.absorb(self.index_graph(chunk, extracted).await?);
        }
        debug!(doc_id, chunks = chunks.len(), ?report, "Replaced document");
        Ok(report)
    }

    /// Resolve a chunk's entities and write the relations between them.
    async fn index_graph(
        &self,
        chunk: &ingest::Chunk,
        extracted: &extract::ExtractedChunk,
    ) -> Result<IndexReport> {
        let entities = &extracted.extraction.entities;
        let mut report = IndexReport::default();
        // Mention name -> resolved entity id, for wiring relations
        let mut resolved: HashMap<String, String> = HashMap::new();

        for (entity, result) in entities.iter().zip(self.resolver.resolve_batch(entities).await) {
            let result = result?;
            match result.action {
                ResolutionAction::Create => report.created += 1,
                ResolutionAction::Merge => report.merged += 1,
                ResolutionAction::Link => report.linked += 1,
            }
            resolved.insert(entity.name.to_lowercase(), result.entity_id);
        }

        for relation in &extracted.extraction.relations {
            let (Some(from), Some(to)) = (
                resolved.get(&relation.subject.to_lowercase()),
                resolved.get(&relation.object.to_lowercase()),
            ) else {
                warn!(
                    subject = %relation.subject,
                    object = %relation.object,
                    "Relation endpoint was not resolved, skipping"
                );
                continue;
            };
            if from == to {
                continue;
            }
            self.graph
                .create_relationship(from, to, relation.predicate, relation.confidence)
                .await?;
            report.relations += 1;
        }

        debug!(chunk_id = %chunk.chunk_id, ?report, "Indexed chunk");
        Ok(report)
    }

    pub async fn get_stats(&self) -> Result<IndexStats> {
        let graph_stats = self.graph.stats().await?;

        Ok(IndexStats {
            entities: graph_stats.entity_count,
            relations: graph_stats.relation_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extract::{
        EntityType, ExtractedChunk, ExtractedEntity, ExtractedRelation, ExtractionOutput,
        RelationType,
    };
    use ingest::{Chunk, DocumentMetadata, DocumentType};

    fn chunk() -> Chunk {
        let metadata = DocumentMetadata {
            doc_type: Some(DocumentType::Sop),
            title: Some("Valve isolation".to_string()),
            ..Default::default()
        };
        Chunk::new(
            "doc-1".to_string(),
            "Before opening V-201 apply lockout tagout.".to_string(),
            "sop.md".to_string(),
            (0, 42),
            metadata,
        )
    }

    #[tokio::test]
    async fn test_index_chunk_writes_vectors_entities_and_relations() {
        let vectors = Arc::new(InMemoryVectorStore::new());
        let graph = Arc::new(InMemoryGraphStore::new());
        let indexer = Indexer::new(
            Arc::new(HashingEmbedder::new(64)),
            vectors.clone(),
            graph.clone(),
            ResolverConfig::default(),
        );

        let chunk = chunk();
        let extracted = ExtractedChunk {
            chunk_id: chunk.chunk_id.clone(),
            doc_id: chunk.doc_id.clone(),
            extraction: ExtractionOutput {
                entities: vec![
                    ExtractedEntity::new("V-201", EntityType::Asset, 0.95),
                    ExtractedEntity::new("LOTO", EntityType::SafetyRule, 0.9),
                ],
                relations: vec![
                    ExtractedRelation {
                        subject: "V-201".to_string(),
                        predicate: RelationType::HasSafetyRule,
                        object: "LOTO".to_string(),
                        confidence: 0.9,
                    },
                    ExtractedRelation {
                        subject: "V-201".to_string(),
                        predicate: RelationType::HasComponent,
                        object: "actuator".to_string(),
                        confidence: 0.9,
                    },
                ],
            },
        };

        let report = indexer.index_extracted_chunk(&chunk, &extracted).await.unwrap();
        assert_eq!(report, IndexReport { created: 2, merged: 0, linked: 0, relations: 1 });
        assert_eq!(vectors.len().await, 1);

        // Indexing the same chunk again merges instead of duplicating
        let again = indexer.index_extracted_chunk(&chunk, &extracted).await.unwrap();
        assert_eq!(again.merged, 2);
        assert_eq!(vectors.len().await, 1);

        let stats = indexer.get_stats().await.unwrap();
        assert_eq!(stats.entities, 2);
        assert_eq!(stats.relations, 1);

        let asset = graph.find_node_by_name("V-201").await.unwrap().unwrap();
        let paths = graph.traverse(&asset.id, &[RelationType::HasSafetyRule], 1, 10).await.unwrap();
        assert_eq!(paths[0].end().unwrap().name, "lockout tagout");
    }

    /// Embeds nothing after it has been switched off.
    struct SwitchableEmbedder {
        inner: HashingEmbedder,
        down: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl Embedder for SwitchableEmbedder {
        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
            self.inner.embed_query(text).await
        }

        async fn embed_passage(&self, text: &str) -> Result<Vec<f32>> {
            if self.down.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(IndexError::Status { status: 503, body: "unavailable".to_string() });
            }
            self.inner.embed_passage(text).await
        }
    }

    #[tokio::test]
    async fn test_failed_replace_keeps_previous_version() {
        let vectors = Arc::new(InMemoryVectorStore::new());
        let embedder = Arc::new(SwitchableEmbedder {
            inner: HashingEmbedder::new(64),
            down: std::sync::atomic::AtomicBool::new(false),
        });
        let indexer = Indexer::new(
            embedder.clone(),
            vectors.clone(),
            Arc::new(InMemoryGraphStore::new()),
            ResolverConfig::default(),
        );

        let chunk = chunk();
        let extracted = ExtractedChunk {
            chunk_id: chunk.chunk_id.clone(),
            doc_id: chunk.doc_id.clone(),
            extraction: ExtractionOutput {
                entities: vec![ExtractedEntity::new("V-201", EntityType::Asset, 0.95)],
                relations: Vec::new(),
            },
        };
        let batch = vec![(chunk, extracted)];

        let first = indexer.replace_document("doc-1", &batch).await.unwrap();
        assert_eq!(first.created, 1);
        assert_eq!(vectors.len().await, 1);

        embedder.down.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(indexer.replace_document("doc-1", &batch).await.is_err());
        assert_eq!(vectors.len().await, 1);

        embedder.down.store(false, std::sync::atomic::Ordering::SeqCst);
        let again = indexer.replace_document("doc-1", &batch).await.unwrap();
        assert_eq!(again.merged, 1);
        assert_eq!(vectors.len().await, 1);
    }
}
