//! SQLite-backed repositories for knowledge spaces, agents and
//! conversation turns.
//!
//! List-valued fields (sources, linked knowledge spaces, cited URLs) are
//! stored as JSON text columns. Timestamps are RFC 3339 strings. Every
//! database error surfaces as [`RagError::Persistence`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use rag_chat_core::error::{RagError, Result};
use rag_chat_core::models::{
    Agent, ConversationTurn, IngestionStatus, KnowledgeSpace, SourceState,
};
use rag_chat_core::store::{AgentRepository, ConversationRepository, KnowledgeSpaceRepository};

#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| RagError::persistence(format!("bad timestamp '{}': {}", raw, e)))
}

fn parse_status(raw: &str) -> Result<IngestionStatus> {
    match raw {
        "pending" => Ok(IngestionStatus::Pending),
        "partial" => Ok(IngestionStatus::Partial),
        "complete" => Ok(IngestionStatus::Complete),
        "failed" => Ok(IngestionStatus::Failed),
        other => Err(RagError::persistence(format!(
            "unknown ingestion status '{}'",
            other
        ))),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(RagError::persistence)
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(RagError::persistence)
}

fn space_from_row(row: &SqliteRow) -> Result<KnowledgeSpace> {
    let sources: Vec<SourceState> = from_json(&row.get::<String, _>("sources_json"))?;
    Ok(KnowledgeSpace {
        tenant_id: row.get("tenant_id"),
        id: row.get("id"),
        name: row.get("name"),
        version: row.get("version"),
        sources,
        status: parse_status(&row.get::<String, _>("status"))?,
        created_at: parse_time(&row.get::<String, _>("created_at"))?,
    })
}

#[async_trait]
impl KnowledgeSpaceRepository for SqliteRepository {
    async fn get(&self, tenant_id: &str, id: &str) -> Result<Option<KnowledgeSpace>> {
        let row = sqlx::query(
            "SELECT tenant_id, id, name, version, sources_json, status, created_at FROM knowledge_spaces WHERE tenant_id = ? AND id = ?",
        )
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(RagError::persistence)?;

        row.as_ref().map(space_from_row).transpose()
    }

    async fn save(&self, space: &KnowledgeSpace) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO knowledge_spaces (tenant_id, id, name, version, sources_json, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(tenant_id, id) DO UPDATE SET
                name = excluded.name,
                sources_json = excluded.sources_json,
                status = excluded.status
            "#,
        )
        .bind(&space.tenant_id)
        .bind(&space.id)
        .bind(&space.name)
        .bind(&space.version)
        .bind(to_json(&space.sources)?)
        .bind(space.status.as_str())
        .bind(space.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(RagError::persistence)?;
        Ok(())
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<KnowledgeSpace>> {
        let rows = sqlx::query(
            "SELECT tenant_id, id, name, version, sources_json, status, created_at FROM knowledge_spaces WHERE tenant_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(RagError::persistence)?;

        rows.iter().map(space_from_row).collect()
    }
}

#[async_trait]
impl AgentRepository for SqliteRepository {
    async fn get(&self, tenant_id: &str, id: &str) -> Result<Option<Agent>> {
        let row = sqlx::query(
            "SELECT tenant_id, id, name, knowledge_space_ids_json, strict_grounding, created_at FROM agents WHERE tenant_id = ? AND id = ?",
        )
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(RagError::persistence)?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Agent {
            tenant_id: row.get("tenant_id"),
            id: row.get("id"),
            name: row.get("name"),
            knowledge_space_ids: from_json(&row.get::<String, _>("knowledge_space_ids_json"))?,
            strict_grounding: row.get::<i64, _>("strict_grounding") != 0,
            created_at: parse_time(&row.get::<String, _>("created_at"))?,
        }))
    }

    async fn save(&self, agent: &Agent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agents (tenant_id, id, name, knowledge_space_ids_json, strict_grounding, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&agent.tenant_id)
        .bind(&agent.id)
        .bind(&agent.name)
        .bind(to_json(&agent.knowledge_space_ids)?)
        .bind(agent.strict_grounding as i64)
        .bind(agent.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(RagError::persistence)?;
        Ok(())
    }
}

#[async_trait]
impl ConversationRepository for SqliteRepository {
    async fn save(&self, turn: &ConversationTurn) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conversations (id, tenant_id, agent_id, user_id, user_message, assistant_message, cited_urls_json, grounded, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&turn.id)
        .bind(&turn.tenant_id)
        .bind(&turn.agent_id)
        .bind(&turn.user_id)
        .bind(&turn.user_message)
        .bind(&turn.assistant_message)
        .bind(to_json(&turn.cited_urls)?)
        .bind(turn.grounded as i64)
        .bind(turn.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(RagError::persistence)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rag_chat_core::models::SourceStatus;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn repo() -> SqliteRepository {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        SqliteRepository::new(pool)
    }

    fn created() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_knowledge_space_roundtrip_and_update() {
        let repo = repo().await;
        let urls = vec!["https://a.example".to_string(), "https://b.example".to_string()];
        let mut ks = KnowledgeSpace::new("acme", "ks_1", "Docs", &urls, created());
        KnowledgeSpaceRepository::save(&repo, &ks).await.unwrap();

        ks.set_source_status("https://a.example", SourceStatus::Complete);
        ks.set_source_status("https://b.example", SourceStatus::Failed);
        KnowledgeSpaceRepository::save(&repo, &ks).await.unwrap();

        let loaded = KnowledgeSpaceRepository::get(&repo, "acme", "ks_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, IngestionStatus::Partial);
        assert_eq!(loaded.sources, ks.sources);
        assert_eq!(loaded.namespace(), "t_acme_ks_ks_1_2024-03-05");
        assert_eq!(loaded.created_at, created());
    }

    #[tokio::test]
    async fn test_lookups_are_tenant_scoped() {
        let repo = repo().await;
        let ks = KnowledgeSpace::new("acme", "ks_1", "Docs", &[], created());
        KnowledgeSpaceRepository::save(&repo, &ks).await.unwrap();

        assert!(KnowledgeSpaceRepository::get(&repo, "other", "ks_1")
            .await
            .unwrap()
            .is_none());
        assert_eq!(KnowledgeSpaceRepository::list(&repo, "acme").await.unwrap().len(), 1);
        assert!(KnowledgeSpaceRepository::list(&repo, "other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_agent_roundtrip() {
        let repo = repo().await;
        let agent = Agent {
            tenant_id: "acme".into(),
            id: "agent_1".into(),
            name: "Support".into(),
            knowledge_space_ids: vec!["ks_1".into(), "ks_2".into()],
            strict_grounding: true,
            created_at: created(),
        };
        AgentRepository::save(&repo, &agent).await.unwrap();
        let loaded = AgentRepository::get(&repo, "acme", "agent_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.knowledge_space_ids, agent.knowledge_space_ids);
        assert!(loaded.strict_grounding);

        // Agents are immutable: a second insert with the same id fails.
        let err = AgentRepository::save(&repo, &agent).await.unwrap_err();
        assert!(matches!(err, RagError::Persistence(_)));
    }

    #[tokio::test]
    async fn test_conversation_saved() {
        let repo = repo().await;
        let turn = ConversationTurn {
            id: "conv_1".into(),
            tenant_id: "acme".into(),
            agent_id: "agent_1".into(),
            user_id: "u1".into(),
            user_message: "hi".into(),
            assistant_message: "hello".into(),
            cited_urls: vec!["https://a.example".into()],
            grounded: true,
            created_at: created(),
        };
        ConversationRepository::save(&repo, &turn).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversations")
            .fetch_one(&repo.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
