//! Read access to registered reference embeddings.

use crate::types::{Embedding, StoredIdentity};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity store backend failed: {0}")]
    Backend(String),
    #[error("stored embedding for {identity} is corrupt: {detail}")]
    Corrupt { identity: String, detail: String },
}

/// Source of truth for reference embeddings. The pipeline only reads from it.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// `Ok(None)` when the identity has never been registered.
    async fn reference_embedding(&self, identity: &str) -> Result<Option<Embedding>, StoreError>;
}

/// In-process store, for tests and single-node deployments without a database.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    identities: RwLock<HashMap<String, StoredIdentity>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, identity: &str, embedding: Embedding) {
        let record = StoredIdentity {
            identity_id: identity.to_string(),
            reference_embedding: embedding,
            registered_at: Utc::now(),
        };
        self.identities
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(identity.to_string(), record);
    }

    pub fn get(&self, identity: &str) -> Option<StoredIdentity> {
        self.identities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(identity)
            .cloned()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn reference_embedding(&self, identity: &str) -> Result<Option<Embedding>, StoreError> {
        Ok(self.get(identity).map(|r| r.reference_embedding))
    }
}
