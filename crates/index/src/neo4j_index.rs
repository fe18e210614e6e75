use async_trait::async_trait;
use extract::{EntityType, RelationType};
use neo4rs::{Graph, Query};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::{
    EntityCandidate, EntityGraph, GraphNode, GraphPath, GraphStats, GraphStore, MatchKind,
    ResolvedEntity,
};

/// Knowledge graph in Neo4j. Entities are labelled by type and keyed by `id`.
#[derive(Clone)]
pub struct Neo4jStore {
    graph: Graph,
}

fn entity_labels() -> Vec<String> {
    EntityType::labels().into_iter().map(str::to_string).collect()
}

/// Relationship types are interpolated into Cypher, so only the closed enum reaches here.
fn relation_clause(edge_types: &[RelationType]) -> String {
    let names: Vec<&str> = edge_types
        .iter()
        .filter(|t| **t != RelationType::Unknown)
        .map(|t| t.as_str())
        .collect();
    if names.is_empty() {
        String::new()
    } else {
        format!(":{}", names.join("|"))
    }
}

impl Neo4jStore {
    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self> {
        let graph = Graph::new(uri, user, password).await?;
        Ok(Self { graph })
    }

    pub fn new(graph: Graph) -> Self {
        Self { graph }
    }

    /// Indexes on `id` and `canonical_name` for every entity label.
    pub async fn init_schema(&self) -> Result<()> {
        for label in EntityType::labels() {
            let lower = label.to_lowercase();
            for property in ["id", "canonical_name"] {
                let query = Query::new(format!(
                    "CREATE INDEX {lower}_{property}_index IF NOT EXISTS FOR (n:{label}) ON (n.{property})"
                ));
                self.graph.run(query).await?;
            }
        }

        info!("Neo4j indexes created");
        Ok(())
    }

    async fn single_node(&self, query: Query) -> Result<Option<GraphNode>> {
        let mut result = self.graph.execute(query).await?;

        if let Some(row) = result.next().await? {
            let id: String = row.get("id").unwrap_or_default();
            if id.is_empty() {
                return Ok(None);
            }
            return Ok(Some(GraphNode {
                id,
                label: row.get("label").unwrap_or_default(),
                name: row.get("name").unwrap_or_default(),
            }));
        }
        Ok(None)
    }

    async fn candidates(&self, query: Query, exact: bool) -> Result<Vec<EntityCandidate>> {
        let mut result = self.graph.execute(query).await?;
        let mut candidates = Vec::new();

        while let Some(row) = result.next().await? {
            let label: String = row.get("label").unwrap_or_default();
            let Some(entity_type) = EntityType::from_label(&label) else {
                continue;
            };
            let embedding: Vec<f64> = row.get("embedding").unwrap_or_default();
            let distance: i64 = row.get("distance").unwrap_or(0);

            candidates.push(EntityCandidate {
                id: row.get("id").unwrap_or_default(),
                canonical_name: row.get("name").unwrap_or_default(),
                entity_type,
                embedding: embedding.into_iter().map(|x| x as f32).collect(),
                match_kind: if exact {
                    MatchKind::Exact
                } else {
                    MatchKind::Fuzzy { distance: distance.max(0) as usize }
                },
            });
        }

        Ok(candidates)
    }

    async fn count(&self, cypher: &str) -> Result<usize> {
        let query = Query::new(cypher.to_string()).param("labels", entity_labels());
        let mut result = self.graph.execute(query).await?;
        let count = match result.next().await? {
            Some(row) => row.get::<i64>("count").unwrap_or(0),
            None => 0,
        };
        Ok(count.max(0) as usize)
    }
}

#[async_trait]
impl GraphStore for Neo4jStore {
    async fn get_node(&self, id: &str) -> Result<Option<GraphNode>> {
        let query = Query::new(
            r#"
            MATCH (n {id: $id})
            RETURN n.id AS id, labels(n)[0] AS label,
                   coalesce(n.canonical_name, n.name, n.id) AS name
            LIMIT 1
            "#
            .to_string(),
        )
        .param("id", id.to_string());

        self.single_node(query).await
    }

    async fn find_node_by_name(&self, canonical_name: &str) -> Result<Option<GraphNode>> {
        let query = Query::new(
            r#"
            MATCH (n)
            WHERE labels(n)[0] IN $labels
              AND (n.canonical_name = $name OR $name IN coalesce(n.original_names, []))
            RETURN n.id AS id, labels(n)[0] AS label,
                   coalesce(n.canonical_name, n.name, n.id) AS name
            LIMIT 1
            "#
            .to_string(),
        )
        .param("labels", entity_labels())
        .param("name", canonical_name.to_string());

        self.single_node(query).await
    }

    async fn traverse(
        &self,
        start_id: &str,
        edge_types: &[RelationType],
        max_hops: usize,
        limit: usize,
    ) -> Result<Vec<GraphPath>> {
        let hops = max_hops.max(1);
        let query = Query::new(format!(
            r#"
            MATCH path = (origin {{id: $start_id}})-[{rels}*1..{hops}]-(target)
            WHERE target <> origin
            RETURN [n IN nodes(path) | n.id] AS ids,
                   [n IN nodes(path) | coalesce(labels(n)[0], '')] AS labels,
                   [n IN nodes(path) | coalesce(n.canonical_name, n.name, n.id)] AS names,
                   [r IN relationships(path) | type(r)] AS rels
            LIMIT $limit
            "#,
            rels = relation_clause(edge_types),
        ))
        .param("start_id", start_id.to_string())
        .param("limit", limit as i64);

        let mut result = self.graph.execute(query).await?;
        let mut paths = Vec::new();

        while let Some(row) = result.next().await? {
            let ids: Vec<String> = row.get("ids").unwrap_or_default();
            let labels: Vec<String> = row.get("labels").unwrap_or_default();
            let names: Vec<String> = row.get("names").unwrap_or_default();
            let relations: Vec<String> = row.get("rels").unwrap_or_default();

            let nodes = ids
                .into_iter()
                .zip(labels)
                .zip(names)
                .map(|((id, label), name)| GraphNode { id, label, name })
                .collect();
            paths.push(GraphPath { nodes, relations });
        }

        debug!(start_id, paths = paths.len(), "Traversed graph");
        Ok(paths)
    }

    async fn health(&self) -> Result<()> {
        self.graph.run(Query::new("RETURN 1".to_string())).await?;
        Ok(())
    }
}

#[async_trait]
impl EntityGraph for Neo4jStore {
    async fn find_exact(&self, canonical_name: &str, limit: usize) -> Result<Vec<EntityCandidate>> {
        let query = Query::new(
            r#"
            MATCH (n {canonical_name: $name})
            WHERE labels(n)[0] IN $labels
            RETURN n.id AS id, n.canonical_name AS name, labels(n)[0] AS label,
                   coalesce(n.embedding, []) AS embedding
            LIMIT $limit
            "#
            .to_string(),
        )
        .param("labels", entity_labels())
        .param("name", canonical_name.to_string())
        .param("limit", limit as i64);

        self.candidates(query, true).await
    }

    async fn find_fuzzy(
        &self,
        canonical_name: &str,
        max_distance: usize,
        limit: usize,
    ) -> Result<Vec<EntityCandidate>> {
        let query = Query::new(
            r#"
            MATCH (n)
            WHERE labels(n)[0] IN $labels AND n.canonical_name IS NOT NULL
            WITH n, apoc.text.levenshteinDistance(n.canonical_name, $name) AS distance
            WHERE distance < $max_distance
            RETURN n.id AS id, n.canonical_name AS name, labels(n)[0] AS label,
                   coalesce(n.embedding, []) AS embedding, distance
            ORDER BY distance
            LIMIT $limit
            "#
            .to_string(),
        )
        .param("labels", entity_labels())
        .param("name", canonical_name.to_string())
        .param("max_distance", max_distance as i64)
        .param("limit", limit as i64);

        match self.candidates(query, false).await {
            Ok(candidates) => Ok(candidates),
            Err(e) => {
                // APOC missing or disabled
                warn!(error = %e, "Fuzzy candidate search unavailable");
                Ok(Vec::new())
            }
        }
    }

    async fn upsert_entity(&self, entity: &ResolvedEntity) -> Result<()> {
        let query = Query::new(format!(
            r#"
            MERGE (n:{label} {{id: $id}})
            SET n.canonical_name = $name,
                n.type = $type,
                n.embedding = $embedding,
                n.original_names = coalesce(n.original_names, [])
                    + [x IN $names WHERE NOT x IN coalesce(n.original_names, [])]
            "#,
            label = entity.entity_type.label(),
        ))
        .param("id", entity.id.clone())
        .param("name", entity.canonical_name.clone())
        .param("type", entity.entity_type.as_str().to_string())
        .param(
            "embedding",
            entity.embedding.iter().map(|x| *x as f64).collect::<Vec<f64>>(),
        )
        .param("names", entity.original_names.clone());

        self.graph.run(query).await?;
        Ok(())
    }

    async fn add_alias(&self, id: &str, alias: &str) -> Result<()> {
        let query = Query::new(
            r#"
            MATCH (n {id: $id})
            SET n.original_names = coalesce(n.original_names, [])
                + CASE WHEN $alias IN coalesce(n.original_names, []) THEN [] ELSE [$alias] END
            "#
            .to_string(),
        )
        .param("id", id.to_string())
        .param("alias", alias.to_string());

        self.graph.run(query).await?;
        Ok(())
    }

    async fn create_relationship(
        &self,
        from_id: &str,
        to_id: &str,
        relation: RelationType,
        confidence: f32,
    ) -> Result<()> {
        let relation = match relation {
            RelationType::Unknown => RelationType::RelatedTo,
            other => other,
        };
        let query = Query::new(format!(
            r#"
            MATCH (a {{id: $from_id}})
            MATCH (b {{id: $to_id}})
            MERGE (a)-[r:{rel}]->(b)
            SET r.confidence = $confidence
            "#,
            rel = relation.as_str(),
        ))
        .param("from_id", from_id.to_string())
        .param("to_id", to_id.to_string())
        .param("confidence", confidence as f64);

        self.graph.run(query).await?;
        Ok(())
    }

    async fn stats(&self) -> Result<GraphStats> {
        let entity_count = self
            .count("MATCH (n) WHERE labels(n)[0] IN $labels RETURN count(n) AS count")
            .await?;
        let relation_count = self
            .count(
                "MATCH (a)-[r]->(b) WHERE labels(a)[0] IN $labels AND labels(b)[0] IN $labels \
                 RETURN count(r) AS count",
            )
            .await?;

        Ok(GraphStats { entity_count, relation_count })
    }
}
