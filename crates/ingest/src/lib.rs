pub mod chunk;
pub mod chunker;
pub mod reader;

pub use chunk::{Chunk, ClassificationLevel, DocumentMetadata, DocumentType};
pub use chunker::{Chunker, ChunkerConfig};
pub use reader::{Document, FileReader};

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Generate a stable document ID from file path
pub fn generate_doc_id(path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..16])
}

fn chunk_document(chunker: &Chunker, document: &Document) -> Vec<Chunk> {
    let doc_id = document
        .metadata
        .doc_id
        .clone()
        .unwrap_or_else(|| generate_doc_id(&document.source));
    chunker.chunk_text(&doc_id, &document.text, &document.source, &document.metadata)
}

/// Read and chunk a single file
pub async fn ingest_file(file_path: &Path) -> Result<Vec<Chunk>> {
    let document = FileReader::read_file(file_path).await?;
    let chunker = Chunker::new(ChunkerConfig::default());

    let chunks = chunk_document(&chunker, &document);
    tracing::debug!(source = %document.source, chunks = chunks.len(), "Chunked document");

    Ok(chunks)
}

/// Read and chunk every supported file below a directory
pub async fn ingest_directory(dir_path: &Path) -> Result<Vec<Chunk>> {
    let documents = FileReader::read_directory(dir_path).await?;
    let chunker = Chunker::new(ChunkerConfig::default());

    let mut all_chunks = Vec::new();
    for document in &documents {
        all_chunks.extend(chunk_document(&chunker, document));
    }

    tracing::info!(
        documents = documents.len(),
        chunks = all_chunks.len(),
        "Chunked directory"
    );

    Ok(all_chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_declared_doc_id_overrides_path_hash() {
        let dir = tempfile::tempdir().unwrap();
        let declared = dir.path().join("seal-v2.md");
        let undeclared = dir.path().join("seal-v1.md");
        std::fs::write(
            &declared,
            "+++\ndoc_id = \"sop-seal-v2\"\nsupersedes = \"sop-seal-v1\"\n+++\nTorque the gland bolts to 45 Nm.\n",
        )
        .unwrap();
        std::fs::write(&undeclared, "Torque the gland bolts to 40 Nm.\n").unwrap();

        let chunks = ingest_file(&declared).await.unwrap();
        assert_eq!(chunks[0].doc_id, "sop-seal-v2");
        assert_eq!(chunks[0].payload()["supersedes"], "sop-seal-v1");

        let chunks = ingest_file(&undeclared).await.unwrap();
        assert_eq!(chunks[0].doc_id, generate_doc_id(&chunks[0].source));
    }
}
