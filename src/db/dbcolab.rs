use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Error as SqlxError, Row};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use super::{CommentRow, CommentStore, DocumentRow, DocumentStore, SnapshotRow, StreamStore, UpdateRow, UserRow};
use crate::models::{DocKind, PersistenceError};

const SCHEMA_SQL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        email TEXT UNIQUE
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id UUID PRIMARY KEY,
        owner_id TEXT NOT NULL,
        title TEXT NOT NULL,
        kind TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS document_collaborators (
        document UUID NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
        user_id TEXT NOT NULL,
        PRIMARY KEY (document, user_id)
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS document_snapshots (
        document UUID PRIMARY KEY REFERENCES documents(id) ON DELETE CASCADE,
        content BYTEA NOT NULL,
        upto_seq BIGINT NOT NULL,
        revision BIGINT NOT NULL DEFAULT 0,
        size BIGINT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"
    CREATE TABLE IF NOT EXISTS document_updates (
        seq BIGSERIAL PRIMARY KEY,
        document UUID NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
        payload BYTEA NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    "CREATE INDEX IF NOT EXISTS document_updates_document_seq ON document_updates(document, seq)",
    "ALTER TABLE document_snapshots ADD COLUMN IF NOT EXISTS revision BIGINT NOT NULL DEFAULT 0",
    r#"
    CREATE TABLE IF NOT EXISTS comments (
        ord BIGSERIAL,
        id UUID PRIMARY KEY,
        document UUID NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
        author_id TEXT NOT NULL,
        author_name TEXT NOT NULL,
        text TEXT NOT NULL,
        range_start INTEGER NOT NULL,
        range_end INTEGER NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS comments_document ON comments(document, created_at)",
];

const SELECT_DOCUMENT_SQL: &str = r#"
    SELECT
        d.id,
        d.owner_id,
        d.title,
        d.kind,
        d.created_at,
        d.updated_at,
        COALESCE(
            (SELECT array_agg(dc.user_id) FROM document_collaborators dc WHERE dc.document = d.id),
            ARRAY[]::TEXT[]
        ) AS collaborator_ids
    FROM documents d
"#;

/// Database connection pool
pub struct DbColab {
    pool: PgPool,
}

impl DbColab {
    /// Create a new database connection pool
    pub async fn new(database_url: &str) -> Result<Self, SqlxError> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(database_url)
            .await?;

        info!("Database connection pool created successfully");

        Ok(Self { pool })
    }

    /// Create the tables this service owns if they do not exist yet
    pub async fn migrate(&self) -> Result<(), SqlxError> {
        for statement in SCHEMA_SQL {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Database schema verified");
        Ok(())
    }

    fn log_pool(&self, action: &str, document_id: Uuid) {
        let pool_idle = self.pool.num_idle() as u32;
        let pool_size = self.pool.size();
        info!(
            "{} document {}. Pool connections: {} idle, {} in use",
            action,
            document_id,
            pool_idle,
            pool_size.saturating_sub(pool_idle)
        );
    }

    async fn begin(&self) -> Result<sqlx::Transaction<'_, sqlx::Postgres>, SqlxError> {
        match self.pool.begin().await {
            Ok(tx) => Ok(tx),
            Err(e) => {
                error!(
                    "Failed to acquire connection from pool: {}. Pool state: {} idle, {} total",
                    e,
                    self.pool.num_idle(),
                    self.pool.size()
                );
                Err(e)
            }
        }
    }
}

fn document_from_row(row: &sqlx::postgres::PgRow) -> Result<DocumentRow, SqlxError> {
    let kind: String = row.try_get("kind")?;
    let kind = DocKind::parse(&kind)
        .ok_or_else(|| SqlxError::Decode(format!("unknown document kind '{}'", kind).into()))?;
    let collaborators: Vec<String> = row.try_get("collaborator_ids")?;
    let owner_id: String = row.try_get("owner_id")?;
    let mut collaborator_ids: BTreeSet<String> = collaborators.into_iter().collect();
    collaborator_ids.insert(owner_id.clone());
    Ok(DocumentRow {
        id: row.try_get("id")?,
        owner_id,
        title: row.try_get("title")?,
        kind,
        collaborator_ids,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl DocumentStore for DbColab {
    async fn insert_document(&self, doc: &DocumentRow) -> Result<(), PersistenceError> {
        self.log_pool("Creating", doc.id);
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents(id, owner_id, title, kind, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(doc.id)
        .bind(&doc.owner_id)
        .bind(&doc.title)
        .bind(doc.kind.as_str())
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&mut *tx)
        .await?;

        for user_id in &doc.collaborator_ids {
            sqlx::query("INSERT INTO document_collaborators(document, user_id) VALUES ($1, $2)")
                .bind(doc.id)
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        info!("Document '{}' created for owner '{}'", doc.id, doc.owner_id);
        Ok(())
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<DocumentRow>, PersistenceError> {
        let query_sql = format!("{} WHERE d.id = $1", SELECT_DOCUMENT_SQL);
        let row = sqlx::query(&query_sql).bind(id).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(document_from_row).transpose()?)
    }

    async fn list_documents_for(&self, user_id: &str) -> Result<Vec<DocumentRow>, PersistenceError> {
        let query_sql = format!(
            r#"{}
            WHERE d.owner_id = $1
                OR EXISTS (SELECT 1 FROM document_collaborators dc WHERE dc.document = d.id AND dc.user_id = $1)
            ORDER BY d.updated_at DESC
            "#,
            SELECT_DOCUMENT_SQL
        );
        let rows = sqlx::query(&query_sql).bind(user_id).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(document_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn rename_document(&self, id: Uuid, title: &str) -> Result<Option<DocumentRow>, PersistenceError> {
        let updated = sqlx::query("UPDATE documents SET title = $1, updated_at = NOW() WHERE id = $2")
            .bind(title)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_document(id).await
    }

    async fn add_collaborator(&self, id: Uuid, user_id: &str) -> Result<Option<DocumentRow>, PersistenceError> {
        let mut tx = self.begin().await?;
        let exists = sqlx::query("SELECT 1 FROM documents WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Ok(None);
        }
        let inserted = sqlx::query(
            "INSERT INTO document_collaborators(document, user_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() > 0 {
            sqlx::query("UPDATE documents SET updated_at = NOW() WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        self.get_document(id).await
    }

    async fn delete_document(&self, id: Uuid) -> Result<bool, PersistenceError> {
        self.log_pool("Deleting", id);
        let deleted = sqlx::query("DELETE FROM documents WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected() > 0)
    }

    async fn touch_document(&self, id: Uuid) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE documents SET updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_user(&self, user: &UserRow) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO users(id, name, email) VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, email = COALESCE(EXCLUDED.email, users.email)
            "#,
        )
        .bind(&user.id)
        .bind(&user.name)
        .bind(user.email.as_deref().map(str::to_lowercase))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRow>, PersistenceError> {
        let row = sqlx::query("SELECT id, name, email FROM users WHERE email = $1")
            .bind(email.trim().to_lowercase())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(UserRow {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                email: row.try_get("email")?,
            })),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl StreamStore for DbColab {
    async fn load_snapshot(&self, doc_id: Uuid) -> Result<Option<SnapshotRow>, PersistenceError> {
        self.log_pool("Loading snapshot for", doc_id);
        let row = sqlx::query("SELECT content, upto_seq, revision FROM document_snapshots WHERE document = $1")
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(SnapshotRow {
                content: row.try_get("content")?,
                upto_seq: row.try_get("upto_seq")?,
                revision: row.try_get("revision")?,
            })),
            None => Ok(None),
        }
    }

    async fn updates_since(&self, doc_id: Uuid, after_seq: i64) -> Result<Vec<UpdateRow>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT seq, payload FROM document_updates WHERE document = $1 AND seq > $2 ORDER BY seq ASC",
        )
        .bind(doc_id)
        .bind(after_seq)
        .fetch_all(&self.pool)
        .await?;
        let mut updates = Vec::with_capacity(rows.len());
        for row in rows {
            updates.push(UpdateRow {
                seq: row.try_get("seq")?,
                payload: row.try_get("payload")?,
            });
        }
        Ok(updates)
    }

    async fn append_update(&self, doc_id: Uuid, payload: &[u8]) -> Result<i64, PersistenceError> {
        let row = sqlx::query("INSERT INTO document_updates(document, payload) VALUES ($1, $2) RETURNING seq")
            .bind(doc_id)
            .bind(payload)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("seq")?)
    }

    async fn save_snapshot(&self, doc_id: Uuid, snapshot: &SnapshotRow) -> Result<bool, PersistenceError> {
        self.log_pool("Checkpointing", doc_id);
        let mut tx = self.begin().await?;

        // The row lock taken by the upsert orders concurrent writers
        let written = sqlx::query(
            r#"
            INSERT INTO document_snapshots(document, content, upto_seq, revision, size, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (document) DO UPDATE
                SET content = EXCLUDED.content,
                    upto_seq = EXCLUDED.upto_seq,
                    revision = EXCLUDED.revision,
                    size = EXCLUDED.size,
                    updated_at = NOW()
                WHERE (document_snapshots.upto_seq, document_snapshots.revision)
                    <= (EXCLUDED.upto_seq, EXCLUDED.revision)
            "#,
        )
        .bind(doc_id)
        .bind(&snapshot.content)
        .bind(snapshot.upto_seq)
        .bind(snapshot.revision)
        .bind(snapshot.content.len() as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if written == 0 {
            tx.rollback().await?;
            info!(
                "Snapshot for document {} up to seq {} is older than the stored one, skipped",
                doc_id, snapshot.upto_seq
            );
            return Ok(false);
        }

        sqlx::query("DELETE FROM document_updates WHERE document = $1 AND seq <= $2")
            .bind(doc_id)
            .bind(snapshot.upto_seq)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(
            "Snapshot for document {} saved ({} bytes, up to seq {})",
            doc_id,
            snapshot.content.len(),
            snapshot.upto_seq
        );
        Ok(true)
    }

    async fn delete_streams(&self, doc_id: Uuid) -> Result<(), PersistenceError> {
        let mut tx = self.begin().await?;
        sqlx::query("DELETE FROM document_updates WHERE document = $1")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM document_snapshots WHERE document = $1")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl CommentStore for DbColab {
    async fn insert_comment(&self, comment: &CommentRow) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO comments(id, document, author_id, author_name, text, range_start, range_end, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(comment.id)
        .bind(comment.document_id)
        .bind(&comment.author_id)
        .bind(&comment.author_name)
        .bind(&comment.text)
        .bind(comment.range_start as i32)
        .bind(comment.range_end as i32)
        .bind(comment.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_comments(&self, doc_id: Uuid) -> Result<Vec<CommentRow>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT id, document, author_id, author_name, text, range_start, range_end, created_at
            FROM comments
            WHERE document = $1
            ORDER BY created_at ASC, ord ASC
            "#,
        )
        .bind(doc_id)
        .fetch_all(&self.pool)
        .await?;

        let mut comments = Vec::with_capacity(rows.len());
        for row in rows {
            let range_start: i32 = row.try_get("range_start")?;
            let range_end: i32 = row.try_get("range_end")?;
            let created_at: DateTime<Utc> = row.try_get("created_at")?;
            comments.push(CommentRow {
                id: row.try_get("id")?,
                document_id: row.try_get("document")?,
                author_id: row.try_get("author_id")?,
                author_name: row.try_get("author_name")?,
                text: row.try_get("text")?,
                range_start: range_start.max(0) as u32,
                range_end: range_end.max(0) as u32,
                created_at,
            });
        }
        Ok(comments)
    }

    async fn delete_comments(&self, doc_id: Uuid) -> Result<(), PersistenceError> {
        sqlx::query("DELETE FROM comments WHERE document = $1")
            .bind(doc_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
