#[cfg(feature = "redis")]
use async_trait::async_trait;
#[cfg(feature = "redis")]
use redis::AsyncCommands;

#[cfg(feature = "redis")]
use crate::error::LedgerError;
#[cfg(feature = "redis")]
use crate::storage::PayloadBlobStore;

/// Payload blobs kept as plain Redis strings under `<prefix>:<key>`.
#[cfg(feature = "redis")]
pub struct RedisBlobStore {
    client: redis::Client,
    prefix: String,
}

#[cfg(feature = "redis")]
fn backend(err: redis::RedisError) -> LedgerError {
    LedgerError::Backend(err.to_string())
}

#[cfg(feature = "redis")]
impl RedisBlobStore {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    fn blob_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl PayloadBlobStore for RedisBlobStore {
    async fn put(&self, key: &str, content: &str) -> Result<(), LedgerError> {
        let mut conn = self.client.get_tokio_connection().await.map_err(backend)?;
        conn.set::<_, _, ()>(self.blob_key(key), content).await.map_err(backend)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LedgerError> {
        let mut conn = self.client.get_tokio_connection().await.map_err(backend)?;
        conn.get(self.blob_key(key)).await.map_err(backend)
    }

    async fn delete(&self, key: &str) -> Result<(), LedgerError> {
        let mut conn = self.client.get_tokio_connection().await.map_err(backend)?;
        conn.del::<_, ()>(self.blob_key(key)).await.map_err(backend)
    }
}
