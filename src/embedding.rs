use crate::broker::Broker;
use crate::cache::{CacheKey, ResultCache};
use crate::cancel::Cancellation;
use crate::decoder::DecoderArtifact;
use crate::error::{ServiceError, ServiceResult};
use crate::worker::{CropRect, EmbedPayload};
use anyhow::Context;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument};

const DATA_SCHEME: &str = "data://";

/// Turns images into embedding URLs: cache first, then a worker slot.
pub struct EmbedService {
    broker: Broker,
    cache: ResultCache,
    decoder: Arc<DecoderArtifact>,
    data_dir: Option<PathBuf>,
    http: reqwest::Client,
}

impl EmbedService {
    pub fn new(
        broker: Broker,
        cache: ResultCache,
        decoder: Arc<DecoderArtifact>,
        data_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            broker,
            cache,
            decoder,
            data_dir,
            http: reqwest::Client::new(),
        }
    }

    pub fn decoder(&self) -> &DecoderArtifact {
        &self.decoder
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    /// Embeds `image` for the model identified by `model_id` and returns the
    /// URL of the stored result.
    #[instrument(skip(self, image, cancel), fields(bytes = image.len()), err)]
    pub async fn embed_image(
        &self,
        image: Vec<u8>,
        model_id: &str,
        crop: Option<CropRect>,
        cancel: &Cancellation,
    ) -> ServiceResult<String> {
        if model_id != self.decoder.uuid {
            return Err(ServiceError::InvalidRequest(format!(
                "unknown decoder uuid: {}",
                model_id
            )));
        }

        let payload = EmbedPayload::new(image, model_id, crop);
        let key = CacheKey::for_payload(&payload);
        if let Some(key) = &key {
            if let Some(url) = self.cache.check(key).await? {
                info!(key = %key.storage_key(), "embedding already stored");
                return Ok(url);
            }
        }

        let embedded = self.broker.submit(payload, cancel.clone()).await?;

        let url = match &key {
            Some(key) => self.cache.put(key, &embedded).await?,
            None => self.cache.put_uncacheable(&embedded).await?,
        };
        Ok(url)
    }

    /// Fetches the image at `url`, then embeds it.
    pub async fn embed_url(
        &self,
        url: &str,
        model_id: &str,
        crop: Option<CropRect>,
        cancel: &Cancellation,
    ) -> ServiceResult<String> {
        if model_id != self.decoder.uuid {
            return Err(ServiceError::InvalidRequest(format!(
                "unknown decoder uuid: {}",
                model_id
            )));
        }
        let image = tokio::select! {
            biased;
            err = cancel.fired() => return Err(err),
            image = self.load_image(url) => image?,
        };
        info!(url, size = image.len(), "loaded image");
        self.embed_image(image, model_id, crop, cancel).await
    }

    /// `data://relative/path` reads from the data dir; anything else is
    /// downloaded.
    #[instrument(skip(self), err)]
    pub async fn load_image(&self, url: &str) -> ServiceResult<Vec<u8>> {
        match url.strip_prefix(DATA_SCHEME) {
            Some(rel) => self.load_local(rel).await,
            None => self.download(url).await,
        }
    }

    async fn load_local(&self, rel: &str) -> ServiceResult<Vec<u8>> {
        let dir = self.data_dir.as_ref().ok_or_else(|| {
            ServiceError::InvalidRequest(format!(
                "missing data dir to load local image [{}]",
                rel
            ))
        })?;
        let rel_path = Path::new(rel);
        let escapes = rel.is_empty()
            || rel_path
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(ServiceError::InvalidRequest(format!(
                "invalid local image path: {}",
                rel
            )));
        }

        let path = dir.join(rel_path);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ServiceError::NotFound)
            }
            Err(e) => Err(ServiceError::Internal(
                anyhow::Error::new(e)
                    .context(format!("failed to read {}", path.display())),
            )),
        }
    }

    async fn download(&self, url: &str) -> ServiceResult<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ServiceError::Upstream(format!("failed to fetch {}: {}", url, e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Upstream(format!(
                "failed to download image from {}: status {}",
                url,
                status.as_u16()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .context("failed to read image body")
            .map_err(|e| ServiceError::Upstream(format!("{:#}", e)))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::LocalBlobStore;
    use crate::test_utils::init_test_logging;
    use crate::worker::fake::FakeWorkerClient;
    use crate::worker::pool::WorkerPool;
    use crate::worker::{WorkerEndpoint, WorkerSlot};
    use axum::{http::StatusCode, routing::get, Router};
    use pretty_assertions::assert_eq;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        service: EmbedService,
        client: Arc<FakeWorkerClient>,
        _public: tempfile::TempDir,
        data: tempfile::TempDir,
    }

    fn fixture(client: FakeWorkerClient) -> Fixture {
        init_test_logging();
        let client = Arc::new(client);
        let pool = Arc::new(WorkerPool::new(vec![WorkerSlot::new(
            0,
            "cpu",
            WorkerEndpoint::new(7100),
            client.clone(),
        )]));
        let (broker, _) = Broker::start(pool, CancellationToken::new());

        let public = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(Arc::new(LocalBlobStore::new(
            public.path(),
            "/public/",
        )));
        let decoder = Arc::new(DecoderArtifact {
            encoder_type: "vit_b".to_string(),
            uuid: "sam.vit_b.abc".to_string(),
            path: PathBuf::from("/unused"),
            feed_js: String::new(),
        });
        Fixture {
            service: EmbedService::new(
                broker,
                cache,
                decoder,
                Some(data.path().to_path_buf()),
            ),
            client,
            _public: public,
            data,
        }
    }

    #[tokio::test]
    async fn test_second_identical_request_is_served_from_cache() {
        // The second worker call would fail, so a success proves it never
        // happened.
        let f = fixture(FakeWorkerClient::new().with_success().failing_by_default("boom"));
        let cancel = Cancellation::none();

        let first = f
            .service
            .embed_image(b"img".to_vec(), "sam.vit_b.abc", None, &cancel)
            .await
            .unwrap();
        let second = f
            .service
            .embed_image(b"img".to_vec(), "sam.vit_b.abc", None, &cancel)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(f.client.call_count(), 1);
        assert!(first.starts_with("/public/embed/"));
    }

    #[tokio::test]
    async fn test_cropped_requests_are_not_cached() {
        let f = fixture(FakeWorkerClient::new());
        let cancel = Cancellation::none();
        let crop = CropRect::new(1, 1, 2, 2);

        let a = f
            .service
            .embed_image(b"img".to_vec(), "sam.vit_b.abc", crop, &cancel)
            .await
            .unwrap();
        let b = f
            .service
            .embed_image(b"img".to_vec(), "sam.vit_b.abc", crop, &cancel)
            .await
            .unwrap();

        assert!(a.starts_with("/public/tmp/"));
        assert_eq!(a, b);
        assert_eq!(f.client.call_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_model_is_rejected_before_queueing() {
        let f = fixture(FakeWorkerClient::new());
        let err = f
            .service
            .embed_image(b"img".to_vec(), "sam.vit_h.zzz", None, &Cancellation::none())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)));
        assert_eq!(f.client.call_count(), 0);
        assert_eq!(f.service.broker().stats().pending, 0);
    }

    #[tokio::test]
    async fn test_worker_failure_is_not_cached() {
        let f = fixture(FakeWorkerClient::new().with_failure("HTTP 500"));
        let cancel = Cancellation::none();

        let err = f
            .service
            .embed_image(b"img".to_vec(), "sam.vit_b.abc", None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Upstream(_)));

        f.service
            .embed_image(b"img".to_vec(), "sam.vit_b.abc", None, &cancel)
            .await
            .unwrap();
        assert_eq!(f.client.call_count(), 2);
    }

    #[tokio::test]
    async fn test_load_local_image() {
        let f = fixture(FakeWorkerClient::new());
        std::fs::create_dir_all(f.data.path().join("frames")).unwrap();
        std::fs::write(f.data.path().join("frames/1.jpg"), b"jpeg").unwrap();

        let bytes = f.service.load_image("data://frames/1.jpg").await.unwrap();
        assert_eq!(bytes, b"jpeg");

        let missing = f.service.load_image("data://frames/2.jpg").await;
        assert!(matches!(missing, Err(ServiceError::NotFound)));

        for bad in ["data://../secret", "data:///etc/passwd", "data://"] {
            let err = f.service.load_image(bad).await.unwrap_err();
            assert!(matches!(err, ServiceError::InvalidRequest(_)), "{}", bad);
        }
    }

    #[tokio::test]
    async fn test_local_image_without_data_dir() {
        let f = fixture(FakeWorkerClient::new());
        let service = EmbedService {
            data_dir: None,
            ..f.service
        };
        let err = service.load_image("data://a.jpg").await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)));
    }

    async fn spawn_image_server() -> String {
        let app = Router::new()
            .route("/ok.jpg", get(|| async { "jpeg-bytes" }))
            .route("/gone.jpg", get(|| async { StatusCode::NOT_FOUND }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_download_and_embed() {
        let f = fixture(FakeWorkerClient::new());
        let base = spawn_image_server().await;

        let url = f
            .service
            .embed_url(
                &format!("{}/ok.jpg", base),
                "sam.vit_b.abc",
                None,
                &Cancellation::none(),
            )
            .await
            .unwrap();
        assert!(url.starts_with("/public/embed/"));
        assert_eq!(f.client.call_count(), 1);

        let err = f
            .service
            .load_image(&format!("{}/gone.jpg", base))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Upstream(ref msg) if msg.contains("404")));
    }
}
