use index::VectorCandidate;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

use crate::config::FusionWeights;
use crate::state::{FusedItem, FusedSource, GraphFact};

/// First 16 hex characters of the content's SHA-256.
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    hex::encode(&digest[..8])
}

/// Merge the three skip buffers.
///
/// Buffers are read in the order vector, graph, rerank and the first item with a given
/// content hash wins. Scores are scaled by the buffer weight before the final sort.
pub fn fuse(
    skip_vector: &[VectorCandidate],
    skip_graph: &[GraphFact],
    skip_rerank: &[VectorCandidate],
    weights: FusionWeights,
    top_k: usize,
) -> Vec<FusedItem> {
    let mut seen = HashSet::new();
    let mut fused = Vec::new();

    let passage = |c: &VectorCandidate, source: FusedSource, weight: f32| FusedItem {
        content: c.content.clone(),
        score: c.score * weight,
        source,
        doc_id: Some(c.doc_id.clone()),
        nodes: Vec::new(),
    };

    for item in skip_vector {
        if seen.insert(content_hash(&item.content)) {
            fused.push(passage(item, FusedSource::Vector, weights.vector));
        }
    }
    for fact in skip_graph {
        if seen.insert(content_hash(&fact.fact)) {
            fused.push(FusedItem {
                content: fact.fact.clone(),
                score: fact.confidence * weights.graph,
                source: FusedSource::Graph,
                doc_id: None,
                nodes: fact.source_nodes.clone(),
            });
        }
    }
    for item in skip_rerank {
        if seen.insert(content_hash(&item.content)) {
            fused.push(passage(item, FusedSource::Rerank, weights.rerank));
        }
    }

    fused.sort_by(|a, b| b.score.total_cmp(&a.score));
    fused.truncate(top_k);
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use index::GraphPath;
    use std::collections::HashMap;

    fn candidate(doc_id: &str, content: &str, score: f32) -> VectorCandidate {
        VectorCandidate {
            chunk_id: format!("{}-c", doc_id),
            doc_id: doc_id.into(),
            content: content.into(),
            score,
            metadata: HashMap::new(),
        }
    }

    fn fact(text: &str) -> GraphFact {
        GraphFact {
            fact: text.into(),
            source_nodes: vec!["n1".into()],
            path: GraphPath { nodes: vec![], relations: vec![] },
            confidence: 0.9,
        }
    }

    #[test]
    fn test_content_hash_prefix() {
        let hash = content_hash("lockout");
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, content_hash("lockout"));
        assert_ne!(hash, content_hash("Lockout"));
    }

    #[test]
    fn test_duplicate_content_attributed_to_first_buffer() {
        let shared = "Apply lockout before opening V-201.";
        let vector = vec![candidate("d1", shared, 0.5)];
        let graph = vec![fact(shared), fact("V-201 has safety rule lockout tagout")];
        let rerank = vec![candidate("d1", shared, 0.9), candidate("d2", "Wear gloves.", 0.8)];

        let fused = fuse(&vector, &graph, &rerank, FusionWeights::default(), 20);

        let shared_items: Vec<&FusedItem> = fused.iter().filter(|i| i.content == shared).collect();
        assert_eq!(shared_items.len(), 1);
        assert_eq!(shared_items[0].source, FusedSource::Vector);
        assert_eq!(fused.len(), 3);
    }

    #[test]
    fn test_weighted_sort_and_cap() {
        let vector = vec![candidate("d1", "a", 1.0)];
        let graph = vec![fact("b")];
        let rerank = vec![candidate("d2", "c", 0.5)];

        let fused = fuse(&vector, &graph, &rerank, FusionWeights::default(), 2);
        let contents: Vec<&str> = fused.iter().map(|i| i.content.as_str()).collect();

        // 0.9 * 0.4 = 0.36 beats 1.0 * 0.3 and 0.5 * 0.3
        assert_eq!(contents, vec!["b", "a"]);
        assert_eq!(fused[0].nodes, vec!["n1"]);
        assert!(fused[0].doc_id.is_none());
    }
}
