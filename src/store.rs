//! The shared key-value store: the only rendezvous between tracker and submitter.
//!
//! Every operation is atomic at the key and nothing more; there is no
//! compare-and-swap, concurrent writers to one key simply overwrite each other.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::STORE_TIMEOUT;
use crate::error::{Error, Result};

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Process-local store, the backing map of the HTTP service.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.entries.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Client for the `/kv` routes of the store service.
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(STORE_TIMEOUT)
            .build()
            .map_err(|e| Error::StoreReadFailed(e.to_string()))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn key_url(&self, key: &str) -> String {
        format!("{}/kv/{}", self.base_url, key)
    }
}

#[async_trait]
impl KvStore for HttpStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let resp = self
            .client
            .get(self.key_url(key))
            .send()
            .await
            .map_err(|e| Error::StoreReadFailed(e.to_string()))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Error::StoreReadFailed(format!("GET {} returned {}", key, resp.status())));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| Error::StoreReadFailed(e.to_string()))?;
        debug!(key, len = body.len(), "store read");
        Ok(Some(body))
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let resp = self
            .client
            .put(self.key_url(key))
            .body(value)
            .send()
            .await
            .map_err(|e| Error::StoreWriteFailed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Error::StoreWriteFailed(format!("PUT {} returned {}", key, resp.status())));
        }
        debug!(key, "store write");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.key_url(key))
            .send()
            .await
            .map_err(|e| Error::StoreWriteFailed(e.to_string()))?;

        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(Error::StoreWriteFailed(format!(
                "DELETE {} returned {}",
                key,
                resp.status()
            )));
        }
        Ok(())
    }
}
