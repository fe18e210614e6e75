use extract::{EntityNormalizer, ExtractedEntity};
use futures::FutureExt;
use futures::stream::{self, StreamExt};
use index::{GraphNode, GraphPath, GraphStore};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::intent::IntentPolicy;
use crate::state::GraphFact;

/// Confidence of a fact read straight off a stored path.
pub const PATH_FACT_CONFIDENCE: f32 = 0.9;

/// Intent-conditioned traversal from the entities found in the query and top passages.
pub struct GraphExpander {
    graph: Arc<dyn GraphStore>,
    normalizer: EntityNormalizer,
}

fn node_label(node: &GraphNode) -> &str {
    if node.name.is_empty() { &node.id } else { &node.name }
}

/// `<start> <first relation, lowercase, spaced> <end>`
pub fn fact_text(path: &GraphPath) -> Option<String> {
    let (start, end) = (path.start()?, path.end()?);
    if path.nodes.len() < 2 {
        return None;
    }

    let mut text = format!("{} ", node_label(start));
    if let Some(relation) = path.relations.first() {
        text.push_str(&relation.replace('_', " ").to_lowercase());
        text.push(' ');
    }
    text.push_str(node_label(end));
    Some(text)
}

/// Cap in discovery order, then drop repeated fact text keeping the first.
pub fn cap_and_dedupe(facts: Vec<GraphFact>, cap: usize) -> Vec<GraphFact> {
    let mut seen = HashSet::new();
    facts
        .into_iter()
        .take(cap)
        .filter(|f| seen.insert(f.fact.clone()))
        .collect()
}

impl GraphExpander {
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self { graph, normalizer: EntityNormalizer::new() }
    }

    /// Traverse from up to `max_seed_entities` entities with bounded concurrency.
    ///
    /// A seed that cannot be found, errors or times out contributes no facts.
    pub async fn expand(
        &self,
        entities: &[ExtractedEntity],
        policy: IntentPolicy,
        config: &PipelineConfig,
    ) -> Vec<GraphFact> {
        let timeout = config.traversal_timeout();

        // Boxed up front so the combined future stays Send.
        let traversals: Vec<_> = entities
            .iter()
            .take(config.max_seed_entities)
            .map(|entity| {
                self.expand_entity(entity, policy, config.traversal_path_limit, timeout)
                    .boxed()
            })
            .collect();

        let per_entity: Vec<Vec<GraphFact>> = stream::iter(traversals)
            .buffered(config.traversal_concurrency.max(1))
            .collect()
            .await;

        let facts: Vec<GraphFact> = per_entity.into_iter().flatten().collect();
        let discovered = facts.len();
        let facts = cap_and_dedupe(facts, config.max_graph_facts);

        debug!(seeds = entities.len(), discovered, kept = facts.len(), "Graph expansion finished");
        facts
    }

    async fn seed(&self, entity: &ExtractedEntity) -> index::error::Result<Option<GraphNode>> {
        if let Some(node) = self.graph.get_node(&entity.name).await? {
            return Ok(Some(node));
        }
        let canonical = self.normalizer.canonical_name(&entity.name, entity.entity_type);
        self.graph.find_node_by_name(&canonical).await
    }

    async fn expand_entity(
        &self,
        entity: &ExtractedEntity,
        policy: IntentPolicy,
        path_limit: usize,
        timeout: Duration,
    ) -> Vec<GraphFact> {
        let traversal = async {
            let Some(node) = self.seed(entity).await? else {
                debug!(entity = %entity.name, "Entity not in graph");
                return Ok(Vec::new());
            };
            self.graph
                .traverse(&node.id, policy.edge_types, policy.max_hops, path_limit)
                .await
        };

        let paths = match tokio::time::timeout(timeout, traversal).await {
            Ok(Ok(paths)) => paths,
            Ok(Err(e)) => {
                warn!(entity = %entity.name, error = %e, "Traversal failed, skipping entity");
                return Vec::new();
            }
            Err(_) => {
                warn!(entity = %entity.name, timeout_ms = timeout.as_millis() as u64, "Traversal timed out, skipping entity");
                return Vec::new();
            }
        };

        paths
            .into_iter()
            .filter_map(|path| {
                let fact = fact_text(&path)?;
                Some(GraphFact {
                    fact,
                    source_nodes: path.nodes.iter().map(|n| n.id.clone()).collect(),
                    path,
                    confidence: PATH_FACT_CONFIDENCE,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::Intent;
    use async_trait::async_trait;
    use extract::{EntityType, RelationType};
    use index::{IndexError, InMemoryGraphStore};

    fn node(id: &str, name: &str) -> GraphNode {
        GraphNode { id: id.into(), label: "Asset".into(), name: name.into() }
    }

    fn fact(text: &str) -> GraphFact {
        GraphFact {
            fact: text.into(),
            source_nodes: vec![],
            path: GraphPath { nodes: vec![], relations: vec![] },
            confidence: PATH_FACT_CONFIDENCE,
        }
    }

    async fn valve_graph() -> Arc<InMemoryGraphStore> {
        let graph = Arc::new(InMemoryGraphStore::new());
        graph.add_node("asset-v201", EntityType::Asset, "V-201").await;
        graph.add_node("rule-loto", EntityType::SafetyRule, "lockout tagout").await;
        graph.add_node("ppe-gloves", EntityType::SafetyRule, "chemical gloves").await;
        graph.add_node("proc-isolate", EntityType::Procedure, "valve isolation").await;
        graph.add_edge("asset-v201", "rule-loto", RelationType::HasSafetyRule).await;
        graph.add_edge("asset-v201", "ppe-gloves", RelationType::HasSafetyRule).await;
        graph.add_edge("asset-v201", "proc-isolate", RelationType::HasProcedure).await;
        graph
    }

    #[test]
    fn test_fact_text_uses_first_relation() {
        let path = GraphPath {
            nodes: vec![node("a", "P-101"), node("b", ""), node("c", "bearing")],
            relations: vec!["HAS_COMPONENT".into(), "PART_OF".into()],
        };
        assert_eq!(fact_text(&path).unwrap(), "P-101 has component bearing");

        let single = GraphPath { nodes: vec![node("a", "P-101")], relations: vec![] };
        assert!(fact_text(&single).is_none());
    }

    #[test]
    fn test_cap_applies_before_dedupe() {
        let facts = vec![fact("a"), fact("b"), fact("a"), fact("c")];

        let kept: Vec<String> = cap_and_dedupe(facts.clone(), 3).into_iter().map(|f| f.fact).collect();
        assert_eq!(kept, vec!["a", "b"]);

        let kept: Vec<String> = cap_and_dedupe(facts, 10).into_iter().map(|f| f.fact).collect();
        assert_eq!(kept, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_expansion_follows_intent_edges() {
        let expander = GraphExpander::new(valve_graph().await);
        let entities = vec![ExtractedEntity::new("v-201", EntityType::Asset, 0.9)];

        let facts = expander
            .expand(&entities, Intent::Safety.policy(), &PipelineConfig::default())
            .await;
        let texts: Vec<&str> = facts.iter().map(|f| f.fact.as_str()).collect();

        assert_eq!(texts, vec!["V-201 has safety rule lockout tagout", "V-201 has safety rule chemical gloves"]);
        assert_eq!(facts[0].source_nodes, vec!["asset-v201", "rule-loto"]);
    }

    struct FlakyGraph {
        inner: Arc<InMemoryGraphStore>,
    }

    #[async_trait]
    impl GraphStore for FlakyGraph {
        async fn get_node(&self, id: &str) -> index::error::Result<Option<GraphNode>> {
            self.inner.get_node(id).await
        }

        async fn find_node_by_name(&self, name: &str) -> index::error::Result<Option<GraphNode>> {
            self.inner.find_node_by_name(name).await
        }

        async fn traverse(
            &self,
            start_id: &str,
            edge_types: &[RelationType],
            max_hops: usize,
            limit: usize,
        ) -> index::error::Result<Vec<GraphPath>> {
            match start_id {
                "rule-loto" => Err(IndexError::Malformed("broken path".into())),
                "proc-isolate" => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Vec::new())
                }
                _ => self.inner.traverse(start_id, edge_types, max_hops, limit).await,
            }
        }

        async fn health(&self) -> index::error::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_and_slow_traversals_are_skipped() {
        let graph = FlakyGraph { inner: valve_graph().await };
        let expander = GraphExpander::new(Arc::new(graph));
        let config = PipelineConfig { traversal_timeout_ms: 50, ..Default::default() };
        let entities = vec![
            ExtractedEntity::new("lockout tagout", EntityType::SafetyRule, 0.9),
            ExtractedEntity::new("valve isolation", EntityType::Procedure, 0.9),
            ExtractedEntity::new("unknown widget", EntityType::Component, 0.9),
            ExtractedEntity::new("V-201", EntityType::Asset, 0.9),
        ];

        let facts = expander.expand(&entities, Intent::Safety.policy(), &config).await;

        assert_eq!(facts.len(), 2);
        assert!(facts.iter().all(|f| f.fact.starts_with("V-201")));
    }
}
