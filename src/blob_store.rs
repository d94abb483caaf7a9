use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use walkdir::WalkDir;

pub const TEMP_PREFIX: &str = "tmp";

/// Content-addressed public storage. Every stored object is reachable at the
/// returned URL.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` under `key`, replacing any previous object.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String>;

    /// Stores `bytes` as a short-lived object that the sweeper removes later.
    async fn put_temp(&self, bytes: &[u8]) -> Result<String>;

    /// Returns the URL of `key` if it is stored.
    async fn check(&self, key: &str) -> Result<Option<String>>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// A [`BlobStore`] on the local filesystem, served by something else under
/// `url_prefix`.
pub struct LocalBlobStore {
    root: PathBuf,
    url_prefix: String,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            url_prefix: url_prefix.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}{}", self.url_prefix, key)
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    async fn write_atomically(&self, key: &str, bytes: &[u8]) -> Result<String> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        // Readers never see a half-written object.
        let partial = path.with_extension(format!("partial-{}", Uuid::new_v4()));
        tokio::fs::write(&partial, bytes)
            .await
            .with_context(|| format!("failed to write {}", partial.display()))?;
        if let Err(e) = tokio::fs::rename(&partial, &path).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e).with_context(|| format!("failed to store {}", key));
        }

        debug!(key, bytes = bytes.len(), "stored object");
        Ok(self.url_for(key))
    }

    /// Removes temporary objects last modified before `cutoff`. Returns how
    /// many were removed.
    pub fn sweep_temp(&self, cutoff: SystemTime) -> Result<usize> {
        let dir = self.root.join(TEMP_PREFIX);
        if !dir.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        for entry in WalkDir::new(&dir).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("failed to walk temp dir: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let modified = match entry.metadata().map(|m| m.modified()) {
                Ok(Ok(modified)) => modified,
                _ => continue,
            };
            if modified >= cutoff {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                // Another sweep or a re-put got there first.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    "failed to remove {}: {}",
                    entry.path().display(),
                    e
                ),
            }
        }
        Ok(removed)
    }

    /// Sweeps temporary objects older than `lifespan` every `interval` until
    /// `shutdown` is cancelled.
    pub fn run_temp_sweeper(
        self: Arc<Self>,
        interval: Duration,
        lifespan: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(?interval, ?lifespan, "Starting temp object sweeper");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(cutoff) = SystemTime::now().checked_sub(lifespan) else {
                    continue;
                };
                let store = self.clone();
                match tokio::task::spawn_blocking(move || store.sweep_temp(cutoff)).await {
                    Ok(Ok(0)) => {}
                    Ok(Ok(n)) => info!("swept {} temp objects", n),
                    Ok(Err(e)) => warn!("temp sweep failed: {:#}", e),
                    Err(e) => warn!("temp sweep task failed: {}", e),
                }
            }
            info!("Temp object sweeper stopped");
        })
    }
}

/// Keys are relative paths with no `..`, root or prefix components.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        anyhow::bail!("empty storage key");
    }
    let ok = Path::new(key)
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !ok {
        anyhow::bail!("invalid storage key: {:?}", key);
    }
    Ok(())
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    #[instrument(skip(self, bytes), err)]
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        self.write_atomically(key, bytes).await
    }

    async fn put_temp(&self, bytes: &[u8]) -> Result<String> {
        let key = format!("{}/{}", TEMP_PREFIX, sha256_hex(bytes));
        self.write_atomically(&key, bytes).await
    }

    async fn check(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(self.url_for(key))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to check {}", key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> (tempfile::TempDir, LocalBlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path(), "/public/");
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_then_check() {
        let (dir, store) = store();
        assert_eq!(store.check("embed/a.npy").await.unwrap(), None);

        let url = store.put("embed/a.npy", b"data").await.unwrap();
        assert_eq!(url, "/public/embed/a.npy");
        assert_eq!(
            store.check("embed/a.npy").await.unwrap(),
            Some("/public/embed/a.npy".to_string())
        );
        assert_eq!(std::fs::read(dir.path().join("embed/a.npy")).unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let (dir, store) = store();
        store.put("k", b"one").await.unwrap();
        store.put("k", b"two").await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("k")).unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_put_temp_is_content_addressed() {
        let (_dir, store) = store();
        let a = store.put_temp(b"same").await.unwrap();
        let b = store.put_temp(b"same").await.unwrap();
        let c = store.put_temp(b"other").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, format!("/public/tmp/{}", sha256_hex(b"same")));
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let (_dir, store) = store();
        for key in ["../etc/passwd", "/abs", "a/../../b", ""] {
            assert!(store.put(key, b"x").await.is_err(), "{}", key);
            assert!(store.check(key).await.is_err(), "{}", key);
        }
    }

    #[tokio::test]
    async fn test_sweep_removes_only_old_temp_objects() {
        let (dir, store) = store();
        store.put("embed/keep.npy", b"keep").await.unwrap();
        store.put_temp(b"one").await.unwrap();
        store.put_temp(b"two").await.unwrap();

        // Nothing is older than a minute ago.
        let past = SystemTime::now() - Duration::from_secs(60);
        assert_eq!(store.sweep_temp(past).unwrap(), 0);

        let future = SystemTime::now() + Duration::from_secs(60);
        assert_eq!(store.sweep_temp(future).unwrap(), 2);
        assert!(dir.path().join("embed/keep.npy").exists());
        assert_eq!(store.sweep_temp(future).unwrap(), 0);
    }

    #[test]
    fn test_sweep_without_temp_dir() {
        let (_dir, store) = store();
        assert_eq!(store.sweep_temp(SystemTime::now()).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let (_dir, store) = store();
        let store = Arc::new(store);
        let url = store.put_temp(b"short-lived").await.unwrap();
        let key = url.trim_start_matches("/public/").to_string();

        let shutdown = CancellationToken::new();
        let handle = store.clone().run_temp_sweeper(
            Duration::from_millis(20),
            Duration::ZERO,
            shutdown.clone(),
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.check(&key).await.unwrap().is_some() {
            assert!(tokio::time::Instant::now() < deadline, "never swept");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        handle.await.unwrap();
    }
}
