use crate::blob_store::{sha256_hex, BlobStore};
use crate::error::{ServiceError, ServiceResult};
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

/// The browser-side mask decoder paired with the embedding model.
#[derive(Debug, Clone)]
pub struct DecoderArtifact {
    pub encoder_type: String,
    pub uuid: String,
    pub path: PathBuf,
    pub feed_js: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Introspection {
    pub decoder_uuid: String,
    pub decoder_feed_js: String,
}

#[derive(Debug, Clone)]
pub struct DecoderBlob {
    pub uuid: String,
    pub bytes: Vec<u8>,
}

/// What clients need to run the decoder locally.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DecoderInfo {
    pub url: String,
    pub uuid: String,
    pub feed_js: String,
}

pub fn decoder_uuid(encoder_type: &str, decoder: &[u8]) -> String {
    format!("sam.{}.{}", encoder_type, sha256_hex(decoder))
}

pub fn decoder_key(uuid: &str) -> String {
    format!("model/online_segmentation/{}.onnx", uuid)
}

impl DecoderArtifact {
    #[instrument(err)]
    pub async fn load(
        encoder_type: &str,
        path: &Path,
        feed_js_path: Option<&Path>,
    ) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read decoder {}", path.display()))?;
        let feed_js = match feed_js_path {
            Some(p) => tokio::fs::read_to_string(p)
                .await
                .with_context(|| format!("failed to read {}", p.display()))?,
            None => String::new(),
        };

        let uuid = decoder_uuid(encoder_type, &bytes);
        info!(uuid = %uuid, "loaded decoder");
        Ok(Self {
            encoder_type: encoder_type.to_string(),
            uuid,
            path: path.to_path_buf(),
            feed_js,
        })
    }

    pub fn introspect(&self) -> Introspection {
        Introspection {
            decoder_uuid: self.uuid.clone(),
            decoder_feed_js: self.feed_js.clone(),
        }
    }

    /// Reads the decoder as it is on disk now. The returned uuid is derived
    /// from these bytes, so it differs from `self.uuid` if the file changed.
    pub async fn get_decoder(&self) -> Result<DecoderBlob> {
        let bytes = tokio::fs::read(&self.path).await.with_context(|| {
            format!("failed to read decoder {}", self.path.display())
        })?;
        Ok(DecoderBlob {
            uuid: decoder_uuid(&self.encoder_type, &bytes),
            bytes,
        })
    }
}

/// Makes sure the decoder is in the public store and describes it.
#[instrument(skip(store, artifact), fields(uuid = %artifact.uuid), err)]
pub async fn publish_decoder(
    store: &dyn BlobStore,
    artifact: &DecoderArtifact,
) -> ServiceResult<DecoderInfo> {
    let Introspection {
        decoder_uuid: uuid,
        decoder_feed_js: feed_js,
    } = artifact.introspect();
    let key = decoder_key(&uuid);
    let url = match store.check(&key).await? {
        Some(url) => url,
        None => {
            let blob = artifact.get_decoder().await?;
            if blob.uuid != uuid {
                return Err(ServiceError::Internal(anyhow::anyhow!(
                    "expected decoder {}, but got {}",
                    uuid,
                    blob.uuid
                )));
            }
            let url = store.put(&key, &blob.bytes).await?;
            info!(key = %key, "published decoder");
            url
        }
    };

    Ok(DecoderInfo {
        url,
        uuid,
        feed_js,
    })
}
