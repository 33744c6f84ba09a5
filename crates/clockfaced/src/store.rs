use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clockface_core::{Embedding, IdentityStore, StoreError, StoredIdentity};
use rusqlite::OptionalExtension;
use std::path::Path;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    identity_id   TEXT PRIMARY KEY,
    embedding     BLOB NOT NULL,
    model_version TEXT,
    registered_at TEXT NOT NULL
);
";

/// Reference embeddings persisted in SQLite. Embeddings are stored as
/// little-endian `f32` blobs.
pub struct SqliteIdentityStore {
    conn: Connection,
}

impl SqliteIdentityStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Backend(format!("creating {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path).await.map_err(backend)?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await.map_err(backend)?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|c| {
            c.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(backend)?;
        Ok(Self { conn })
    }

    /// Insert or replace the reference for `identity`.
    pub async fn save(&self, identity: &str, embedding: &Embedding) -> Result<StoredIdentity, StoreError> {
        let record = StoredIdentity {
            identity_id: identity.to_string(),
            reference_embedding: embedding.clone(),
            registered_at: Utc::now(),
        };

        let id = record.identity_id.clone();
        let blob = encode_embedding(&record.reference_embedding);
        let model_version = record.reference_embedding.model_version.clone();
        let registered_at = record.registered_at.to_rfc3339();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO identities (identity_id, embedding, model_version, registered_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(identity_id) DO UPDATE SET
                         embedding = excluded.embedding,
                         model_version = excluded.model_version,
                         registered_at = excluded.registered_at",
                    rusqlite::params![id, blob, model_version, registered_at],
                )?;
                Ok(())
            })
            .await
            .map_err(backend)?;

        tracing::info!(identity, dimensions = embedding.len(), "reference embedding saved");
        Ok(record)
    }

    pub async fn get(&self, identity: &str) -> Result<Option<StoredIdentity>, StoreError> {
        let id = identity.to_string();
        let row = self
            .conn
            .call(move |c| {
                let row = c
                    .query_row(
                        "SELECT embedding, model_version, registered_at
                         FROM identities WHERE identity_id = ?1",
                        rusqlite::params![id],
                        |r| {
                            Ok((
                                r.get::<_, Vec<u8>>(0)?,
                                r.get::<_, Option<String>>(1)?,
                                r.get::<_, String>(2)?,
                            ))
                        },
                    )
                    .optional()?;
                Ok(row)
            })
            .await
            .map_err(backend)?;

        let Some((blob, model_version, registered_at)) = row else {
            return Ok(None);
        };

        let corrupt = |detail: String| StoreError::Corrupt {
            identity: identity.to_string(),
            detail,
        };
        let mut embedding = decode_embedding(&blob).map_err(corrupt)?;
        embedding.model_version = model_version;
        let registered_at = DateTime::parse_from_rfc3339(&registered_at)
            .map_err(|e| corrupt(format!("registered_at: {e}")))?
            .with_timezone(&Utc);

        Ok(Some(StoredIdentity {
            identity_id: identity.to_string(),
            reference_embedding: embedding,
            registered_at,
        }))
    }

    /// Returns whether a row was deleted.
    pub async fn remove(&self, identity: &str) -> Result<bool, StoreError> {
        let id = identity.to_string();
        let deleted = self
            .conn
            .call(move |c| Ok(c.execute("DELETE FROM identities WHERE identity_id = ?1", [id])?))
            .await
            .map_err(backend)?;
        Ok(deleted > 0)
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        let n = self
            .conn
            .call(|c| Ok(c.query_row("SELECT COUNT(*) FROM identities", [], |r| r.get::<_, i64>(0))?))
            .await
            .map_err(backend)?;
        Ok(usize::try_from(n).unwrap_or(0))
    }
}

#[async_trait]
impl IdentityStore for SqliteIdentityStore {
    async fn reference_embedding(&self, identity: &str) -> Result<Option<Embedding>, StoreError> {
        Ok(self.get(identity).await?.map(|r| r.reference_embedding))
    }
}

fn backend(e: tokio_rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn encode_embedding(embedding: &Embedding) -> Vec<u8> {
    embedding.values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8]) -> Result<Embedding, String> {
    if blob.is_empty() || blob.len() % 4 != 0 {
        return Err(format!("embedding blob of {} bytes", blob.len()));
    }
    let values = blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(Embedding::new(values))
}
