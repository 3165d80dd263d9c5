//! Knowledge store: chunks (atomic memory units) and typed edges.
//!
//! Chunks carry a derived decay score maintained by the decay engine; edges
//! are owned jointly by the two chunks they connect and die with either one.

use crate::error::{Result, WardenError};
use crate::store::WardenStore;

use chrono::{DateTime, Utc};
use sqlx::Row;

use std::sync::Arc;

// ---------------------------------------------------------------------------
// Closed sets
// ---------------------------------------------------------------------------

/// Provenance of a knowledge chunk. Drives the per-source decay rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// Ephemeral conversational exchanges; decays fastest.
    Conversation,
    /// Raw observations captured by the agent.
    Observation,
    /// Distilled from consolidated episodes.
    Episode,
    /// Ingested documents.
    Document,
    /// Curated knowledge authored by an operator; effectively permanent.
    Curated,
}

impl SourceType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "conversation" => Some(Self::Conversation),
            "observation" => Some(Self::Observation),
            "episode" => Some(Self::Episode),
            "document" => Some(Self::Document),
            "curated" => Some(Self::Curated),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conversation => write!(f, "conversation"),
            Self::Observation => write!(f, "observation"),
            Self::Episode => write!(f, "episode"),
            Self::Document => write!(f, "document"),
            Self::Curated => write!(f, "curated"),
        }
    }
}

/// Relationship carried by an edge between two chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    Supports,
    Contradicts,
    DerivedFrom,
    RelatesTo,
}

impl EdgeType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "supports" => Some(Self::Supports),
            "contradicts" => Some(Self::Contradicts),
            "derived_from" => Some(Self::DerivedFrom),
            "relates_to" => Some(Self::RelatesTo),
            _ => None,
        }
    }
}

impl std::fmt::Display for EdgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Supports => write!(f, "supports"),
            Self::Contradicts => write!(f, "contradicts"),
            Self::DerivedFrom => write!(f, "derived_from"),
            Self::RelatesTo => write!(f, "relates_to"),
        }
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// Atomic memory unit.
#[derive(Debug, Clone)]
pub struct KnowledgeChunk {
    pub id: String,
    pub source_type: SourceType,
    pub source_id: Option<String>,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    /// Author-assigned or inherited, in [0, 1].
    pub importance: f64,
    /// Derived relevance weight; recomputed by the decay engine, never
    /// directly authored.
    pub decay_score: f64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

/// Typed edge between two distinct chunks.
#[derive(Debug, Clone)]
pub struct KnowledgeEdge {
    pub id: String,
    pub from_chunk: String,
    pub to_chunk: String,
    pub edge_type: EdgeType,
    pub weight: f64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// KnowledgeStore
// ---------------------------------------------------------------------------

/// CRUD surface over chunks and edges.
pub struct KnowledgeStore {
    store: Arc<WardenStore>,
}

impl KnowledgeStore {
    pub fn new(store: Arc<WardenStore>) -> Self {
        Self { store }
    }

    /// Insert a chunk. The initial decay score equals the importance: a
    /// zero-age chunk has not decayed yet.
    pub async fn insert_chunk(
        &self,
        source_type: SourceType,
        source_id: Option<&str>,
        content: &str,
        embedding: Option<&[f32]>,
        importance: f64,
        now: DateTime<Utc>,
    ) -> Result<KnowledgeChunk> {
        if !importance.is_finite() || !(0.0..=1.0).contains(&importance) {
            return Err(WardenError::Validation(format!(
                "importance must be in [0, 1], got {importance}"
            )));
        }

        let chunk = KnowledgeChunk {
            id: uuid::Uuid::new_v4().to_string(),
            source_type,
            source_id: source_id.map(String::from),
            content: content.to_owned(),
            embedding: embedding.map(<[f32]>::to_vec),
            importance,
            decay_score: importance,
            created_at: now,
            last_accessed_at: now,
        };

        let embedding_json = chunk
            .embedding
            .as_ref()
            .map(|v| serde_json::to_string(v))
            .transpose()
            .map_err(|error| WardenError::Validation(format!("unencodable embedding: {error}")))?;

        sqlx::query(
            "INSERT INTO knowledge_chunks (id, source_type, source_id, content, embedding, \
             importance, decay_score, created_at, last_accessed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(chunk.source_type.to_string())
        .bind(&chunk.source_id)
        .bind(&chunk.content)
        .bind(&embedding_json)
        .bind(chunk.importance)
        .bind(chunk.decay_score)
        .bind(chunk.created_at)
        .bind(chunk.last_accessed_at)
        .execute(self.store.pool())
        .await?;

        Ok(chunk)
    }

    pub async fn get_chunk(&self, id: &str) -> Result<KnowledgeChunk> {
        let row = sqlx::query("SELECT * FROM knowledge_chunks WHERE id = ?")
            .bind(id)
            .fetch_optional(self.store.pool())
            .await?
            .ok_or_else(|| WardenError::not_found("knowledge chunk", id))?;
        parse_chunk_row(&row)
    }

    /// Delete a chunk. Edges touching it go with it.
    pub async fn delete_chunk(&self, id: &str) -> Result<()> {
        // The cascade relies on foreign keys being on; delete edges explicitly
        // as well so the invariant holds even against a pool that lost the
        // pragma.
        let mut tx = self.store.pool().begin().await?;
        sqlx::query("DELETE FROM knowledge_edges WHERE from_chunk = ? OR to_chunk = ?")
            .bind(id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM knowledge_chunks WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if result.rows_affected() == 0 {
            return Err(WardenError::not_found("knowledge chunk", id));
        }
        Ok(())
    }

    /// Create a typed edge between two distinct chunks.
    pub async fn link(
        &self,
        from_chunk: &str,
        to_chunk: &str,
        edge_type: EdgeType,
        weight: f64,
        now: DateTime<Utc>,
    ) -> Result<KnowledgeEdge> {
        if from_chunk == to_chunk {
            return Err(WardenError::Validation(
                "self-loop edges are not allowed".into(),
            ));
        }
        if !weight.is_finite() || weight < 0.0 {
            return Err(WardenError::Validation(format!(
                "edge weight must be >= 0, got {weight}"
            )));
        }

        let edge = KnowledgeEdge {
            id: uuid::Uuid::new_v4().to_string(),
            from_chunk: from_chunk.to_owned(),
            to_chunk: to_chunk.to_owned(),
            edge_type,
            weight,
            created_at: now,
        };

        sqlx::query(
            "INSERT INTO knowledge_edges (id, from_chunk, to_chunk, edge_type, weight, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&edge.id)
        .bind(&edge.from_chunk)
        .bind(&edge.to_chunk)
        .bind(edge.edge_type.to_string())
        .bind(edge.weight)
        .bind(edge.created_at)
        .execute(self.store.pool())
        .await
        .map_err(|error| {
            if let sqlx::Error::Database(db) = &error {
                if db.message().contains("FOREIGN KEY") {
                    return WardenError::Validation(
                        "edge endpoints must be existing chunks".into(),
                    );
                }
            }
            WardenError::Database(error)
        })?;

        Ok(edge)
    }

    /// All edges touching a chunk, in either direction.
    pub async fn edges_of(&self, chunk_id: &str) -> Result<Vec<KnowledgeEdge>> {
        let rows = sqlx::query(
            "SELECT * FROM knowledge_edges WHERE from_chunk = ? OR to_chunk = ? \
             ORDER BY created_at ASC, id ASC",
        )
        .bind(chunk_id)
        .bind(chunk_id)
        .fetch_all(self.store.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            match parse_edge_row(&row) {
                Ok(edge) => out.push(edge),
                Err(error) => tracing::warn!(%error, "skipping malformed edge row"),
            }
        }
        Ok(out)
    }

    /// Reinforce a chunk on a retrieval hit: bump `last_accessed_at` (which
    /// resets the effective age the next decay pass sees) and partially
    /// restore the stored score toward 1. May race with the decay batch;
    /// last-writer-wins is acceptable for an approximate relevance signal.
    pub async fn record_access(
        &self,
        id: &str,
        restore_factor: f64,
        now: DateTime<Utc>,
    ) -> Result<f64> {
        let chunk = self.get_chunk(id).await?;
        let restored =
            (chunk.decay_score + (1.0 - chunk.decay_score) * restore_factor).clamp(0.0, 1.0);

        sqlx::query(
            "UPDATE knowledge_chunks SET decay_score = ?, last_accessed_at = ? WHERE id = ?",
        )
        .bind(restored)
        .bind(now)
        .bind(id)
        .execute(self.store.pool())
        .await?;

        Ok(restored)
    }
}

impl std::fmt::Debug for KnowledgeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeStore").finish_non_exhaustive()
    }
}

pub(crate) fn parse_chunk_row(row: &sqlx::sqlite::SqliteRow) -> Result<KnowledgeChunk> {
    let source_raw: String = row.try_get("source_type")?;
    let source_type = SourceType::parse(&source_raw)
        .ok_or_else(|| WardenError::Validation(format!("unknown source type: {source_raw}")))?;

    let embedding_json: Option<String> = row.try_get("embedding")?;
    let embedding = embedding_json
        .map(|json| serde_json::from_str::<Vec<f32>>(&json))
        .transpose()
        .map_err(|error| WardenError::Validation(format!("corrupt embedding: {error}")))?;

    Ok(KnowledgeChunk {
        id: row.try_get("id")?,
        source_type,
        source_id: row.try_get("source_id")?,
        content: row.try_get("content")?,
        embedding,
        importance: row.try_get("importance")?,
        decay_score: row.try_get("decay_score")?,
        created_at: row.try_get("created_at")?,
        last_accessed_at: row.try_get("last_accessed_at")?,
    })
}

fn parse_edge_row(row: &sqlx::sqlite::SqliteRow) -> Result<KnowledgeEdge> {
    let type_raw: String = row.try_get("edge_type")?;
    let edge_type = EdgeType::parse(&type_raw)
        .ok_or_else(|| WardenError::Validation(format!("unknown edge type: {type_raw}")))?;

    Ok(KnowledgeEdge {
        id: row.try_get("id")?,
        from_chunk: row.try_get("from_chunk")?,
        to_chunk: row.try_get("to_chunk")?,
        edge_type,
        weight: row.try_get("weight")?,
        created_at: row.try_get("created_at")?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
