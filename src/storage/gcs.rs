//! Google Cloud Storage backend on the `google-cloud-storage` client.
//!
//! [`GcsObjectStore::new`] authenticates with Application Default
//! Credentials; the client refreshes its token on its own, so long runs do
//! not outlive their credentials. Transient failures (429, 5xx, timeouts)
//! are retried with the pipeline's backoff policy.

use super::ObjectStore;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::http::{retry_async, RetryPolicy};
use async_trait::async_trait;
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::objects::delete::DeleteObjectRequest;
use google_cloud_storage::http::objects::download::Range;
use google_cloud_storage::http::objects::get::GetObjectRequest;
use google_cloud_storage::http::objects::list::ListObjectsRequest;
use google_cloud_storage::http::objects::upload::{Media, UploadObjectRequest, UploadType};
use google_cloud_storage::http::Error as GcsError;
use tracing::debug;

pub struct GcsObjectStore {
    client: Client,
    bucket: String,
    retry: RetryPolicy,
}

impl std::fmt::Debug for GcsObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcsObjectStore")
            .field("bucket", &self.bucket)
            .field("retry", &self.retry)
            .finish()
    }
}

fn status_of(e: &GcsError) -> Option<u16> {
    match e {
        GcsError::Response(r) => Some(r.code),
        GcsError::HttpClient(e) => e.status().map(|s| s.as_u16()),
        _ => None,
    }
}

fn is_transient(e: &GcsError) -> bool {
    match e {
        GcsError::HttpClient(e) => e.is_timeout() || e.is_connect(),
        other => status_of(other).is_some_and(|code| code == 408 || code == 429 || code >= 500),
    }
}

impl GcsObjectStore {
    /// Connect to the bucket named in `config` using Application Default
    /// Credentials.
    pub async fn new(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let client_config = ClientConfig::default()
            .with_auth()
            .await
            .map_err(|e| PipelineError::GoogleAuth(e.to_string()))?;
        Ok(Self::with_client_config(config, client_config))
    }

    /// Use a prepared client configuration, e.g. an anonymous one pointed at
    /// an emulator through `storage_endpoint`.
    pub fn with_client_config(config: &PipelineConfig, client_config: ClientConfig) -> Self {
        Self {
            client: Client::new(client_config),
            bucket: config.bucket.clone(),
            retry: config.retry_policy(),
        }
    }
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, PipelineError> {
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let request = ListObjectsRequest {
                bucket: self.bucket.clone(),
                prefix: Some(prefix.to_string()).filter(|p| !p.is_empty()),
                page_token: page_token.clone(),
                ..Default::default()
            };
            let page = retry_async("gcs list", &self.retry, is_transient, || {
                self.client.list_objects(&request)
            })
            .await
            .map_err(|e| PipelineError::storage("list", prefix, e))?;

            names.extend(page.items.unwrap_or_default().into_iter().map(|o| o.name));
            match page.next_page_token {
                Some(t) if !t.is_empty() => page_token = Some(t),
                _ => break,
            }
        }

        names.sort();
        debug!("gcs list {}: {} objects", prefix, names.len());
        Ok(names)
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, PipelineError> {
        let request = GetObjectRequest {
            bucket: self.bucket.clone(),
            object: name.to_string(),
            ..Default::default()
        };
        let range = Range::default();
        retry_async("gcs get", &self.retry, is_transient, || {
            self.client.download_object(&request, &range)
        })
        .await
        .map_err(|e| PipelineError::storage("get", name, e))
    }

    async fn put(
        &self,
        name: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<(), PipelineError> {
        let request = UploadObjectRequest {
            bucket: self.bucket.clone(),
            ..Default::default()
        };
        let mut media = Media::new(name.to_string());
        media.content_type = content_type.to_string().into();
        let upload_type = UploadType::Simple(media);

        let len = data.len();
        retry_async("gcs put", &self.retry, is_transient, || {
            self.client
                .upload_object(&request, data.clone(), &upload_type)
        })
        .await
        .map_err(|e| PipelineError::storage("put", name, e))?;

        debug!("gcs put {} ({} bytes)", name, len);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), PipelineError> {
        let request = DeleteObjectRequest {
            bucket: self.bucket.clone(),
            object: name.to_string(),
            ..Default::default()
        };
        match retry_async("gcs delete", &self.retry, is_transient, || {
            self.client.delete_object(&request)
        })
        .await
        {
            Ok(()) => Ok(()),
            Err(e) if status_of(&e) == Some(404) => Ok(()),
            Err(e) => Err(PipelineError::storage("delete", name, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use google_cloud_storage::http::error::ErrorResponse;

    fn store() -> GcsObjectStore {
        let config = PipelineConfig::builder()
            .bucket("gaia_benchmark_data")
            .output_dir("out")
            .cloud_extracted_folder("adobe_extracted")
            .build()
            .unwrap();
        let client_config = ClientConfig {
            storage_endpoint: "http://localhost:4443".into(),
            ..ClientConfig::default().anonymous()
        };
        GcsObjectStore::with_client_config(&config, client_config)
    }

    fn response(code: u16) -> GcsError {
        GcsError::Response(ErrorResponse {
            code,
            errors: vec![],
            message: "boom".into(),
        })
    }

    #[test]
    fn uris_use_the_configured_bucket() {
        let s = store();
        assert_eq!(s.bucket(), "gaia_benchmark_data");
        assert_eq!(s.uri("2023/a.pdf"), "gs://gaia_benchmark_data/2023/a.pdf");
    }

    #[test]
    fn transient_statuses_are_retried() {
        assert!(is_transient(&response(429)));
        assert!(is_transient(&response(503)));
        assert!(!is_transient(&response(401)));
        assert!(!is_transient(&response(404)));
        assert_eq!(status_of(&response(404)), Some(404));
    }
}
