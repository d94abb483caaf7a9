//! Embedding results keyed by image content and model.
//!
//! Two concurrent misses for the same key both compute and both store. The
//! second write replaces the first with identical bytes, so this is wasted
//! work rather than corruption.

use crate::blob_store::{sha256_hex, BlobStore};
use crate::worker::EmbedPayload;
use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub content_hash: String,
    pub model_id: String,
}

impl CacheKey {
    /// Cropped results are never cached.
    pub fn for_payload(payload: &EmbedPayload) -> Option<Self> {
        if payload.crop.is_some() {
            return None;
        }
        Some(Self {
            content_hash: sha256_hex(&payload.image),
            model_id: payload.model_id.clone(),
        })
    }

    pub fn storage_key(&self) -> String {
        format!("embed/{}.{}.npy", self.content_hash, self.model_id)
    }
}

#[derive(Clone)]
pub struct ResultCache {
    store: Arc<dyn BlobStore>,
}

impl ResultCache {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    pub async fn check(&self, key: &CacheKey) -> Result<Option<String>> {
        let hit = self.store.check(&key.storage_key()).await?;
        debug!(key = %key.storage_key(), hit = hit.is_some(), "checked embedding cache");
        Ok(hit)
    }

    pub async fn put(&self, key: &CacheKey, bytes: &[u8]) -> Result<String> {
        self.store.put(&key.storage_key(), bytes).await
    }

    pub async fn put_uncacheable(&self, bytes: &[u8]) -> Result<String> {
        self.store.put_temp(bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::LocalBlobStore;
    use crate::worker::CropRect;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_key_depends_on_content_and_model() {
        let a = EmbedPayload::new(b"img".to_vec(), "sam.vit_b.1", None);
        let b = EmbedPayload::new(b"img".to_vec(), "sam.vit_b.2", None);
        let c = EmbedPayload::new(b"other".to_vec(), "sam.vit_b.1", None);

        let ka = CacheKey::for_payload(&a).unwrap();
        assert_eq!(
            ka.storage_key(),
            format!("embed/{}.sam.vit_b.1.npy", sha256_hex(b"img"))
        );
        assert_ne!(ka, CacheKey::for_payload(&b).unwrap());
        assert_ne!(ka, CacheKey::for_payload(&c).unwrap());
        assert_eq!(ka, CacheKey::for_payload(&a.clone()).unwrap());
    }

    #[test]
    fn test_cropped_payloads_have_no_key() {
        let cropped =
            EmbedPayload::new(b"img".to_vec(), "m", CropRect::new(0, 0, 4, 4));
        assert_eq!(CacheKey::for_payload(&cropped), None);
    }

    #[tokio::test]
    async fn test_miss_put_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(Arc::new(LocalBlobStore::new(
            dir.path(),
            "http://files/",
        )));
        let key = CacheKey::for_payload(&EmbedPayload::new(
            b"img".to_vec(),
            "m",
            None,
        ))
        .unwrap();

        assert_eq!(cache.check(&key).await.unwrap(), None);
        let url = cache.put(&key, b"npy").await.unwrap();
        assert_eq!(cache.check(&key).await.unwrap(), Some(url.clone()));
        assert!(url.starts_with("http://files/embed/"));

        let temp = cache.put_uncacheable(b"npy").await.unwrap();
        assert!(temp.starts_with("http://files/tmp/"));
    }
}
