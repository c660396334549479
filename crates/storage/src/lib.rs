use anyhow::{Context, Result};
use serde_json::{Map, Value};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::warn;
use uuid::Uuid;

use shared::{domain::Document, protocol::ChangeEvent};

const CHANGE_FEED_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document update conflict for '{id}': stale or missing revision")]
    Conflict { id: String },
    #[error("invalid document: {0}")]
    InvalidDocument(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("document body is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Revisioned JSON document store with a live change feed.
///
/// Writes go through a single gate so that change events are published in
/// commit order and `seq` strictly increases.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    changes: broadcast::Sender<ChangeEvent>,
    write_gate: Arc<Mutex<i64>>,
}

/// Subscription to every write committed after it was created.
pub struct ChangeFeed {
    receiver: broadcast::Receiver<ChangeEvent>,
}

impl ChangeFeed {
    /// Next change in commit order. Returns `None` once the store is gone.
    ///
    /// A subscriber that falls more than the feed capacity behind skips the
    /// oldest events; the gap is logged and delivery resumes.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "change feed subscriber lagged; oldest changes dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_inner(self) -> broadcast::Receiver<ChangeEvent> {
        self.receiver
    }
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        let last_seq: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM documents")
            .fetch_one(&pool)
            .await
            .context("failed to read last change sequence")?;
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);

        Ok(Self {
            pool,
            changes,
            write_gate: Arc::new(Mutex::new(last_seq)),
        })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Live document by id. Deleted documents read as absent.
    pub async fn get(&self, id: &str) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query("SELECT rev, body FROM documents WHERE id = ? AND deleted = 0")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let body: String = row.get("body");
        let fields: Map<String, Value> = serde_json::from_str(&body)?;
        Ok(Some(Document {
            id: id.to_string(),
            rev: Some(row.get("rev")),
            deleted: false,
            fields,
        }))
    }

    /// Create or update a document and return its new revision.
    ///
    /// Updating a live document requires its current `_rev`. New documents,
    /// and documents whose latest revision is a tombstone, may be written
    /// without one.
    pub async fn put(&self, mut doc: Document) -> Result<String, StoreError> {
        if doc.id.trim().is_empty() {
            return Err(StoreError::InvalidDocument(
                "document id must not be empty".into(),
            ));
        }
        let body = serde_json::to_string(&doc.fields)?;

        let mut last_seq = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query("SELECT rev, generation, deleted FROM documents WHERE id = ?")
            .bind(&doc.id)
            .fetch_optional(&mut *tx)
            .await?;
        let generation = match current {
            Some(row) => {
                let current_rev: String = row.get("rev");
                let current_generation: i64 = row.get("generation");
                let tombstone: bool = row.get("deleted");
                let rev_matches = doc.rev.as_deref() == Some(current_rev.as_str());
                if !rev_matches && !(tombstone && doc.rev.is_none()) {
                    return Err(StoreError::Conflict { id: doc.id });
                }
                current_generation + 1
            }
            None if doc.rev.is_some() => return Err(StoreError::Conflict { id: doc.id }),
            None => 1,
        };

        let rev = format!("{generation}-{}", Uuid::new_v4().simple());
        let seq = *last_seq + 1;
        sqlx::query(
            "INSERT INTO documents (id, rev, generation, seq, deleted, body)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                rev = excluded.rev,
                generation = excluded.generation,
                seq = excluded.seq,
                deleted = excluded.deleted,
                body = excluded.body,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(&doc.id)
        .bind(&rev)
        .bind(generation)
        .bind(seq)
        .bind(doc.deleted)
        .bind(&body)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        *last_seq = seq;

        doc.rev = Some(rev.clone());
        let _ = self.changes.send(ChangeEvent {
            seq,
            id: doc.id.clone(),
            deleted: doc.deleted,
            doc: Some(doc),
        });
        Ok(rev)
    }

    /// Write a tombstone over the current revision. Returns `false` when
    /// there was nothing to delete.
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let Some(mut doc) = self.get(id).await? else {
            return Ok(false);
        };
        doc.deleted = true;
        self.put(doc).await?;
        Ok(true)
    }

    /// Subscribe to changes committed from now on.
    pub fn subscribe(&self) -> ChangeFeed {
        ChangeFeed {
            receiver: self.changes.subscribe(),
        }
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
