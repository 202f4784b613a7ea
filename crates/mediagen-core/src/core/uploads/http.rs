//! HTTP Object Uploader
//!
//! Two-step upload against provider storage: initiate to obtain a signed
//! upload URL and the public file URL, then PUT the bytes.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ObjectUploader;
use crate::core::{CoreError, CoreResult};

/// Default storage REST host
pub const DEFAULT_STORAGE_BASE_URL: &str = "https://rest.alpha.fal.ai";

const UPLOAD_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Serialize)]
struct InitiateRequest<'a> {
    content_type: &'a str,
    file_name: String,
}

#[derive(Debug, Deserialize)]
struct InitiateResponse {
    upload_url: String,
    file_url: String,
}

/// Uploader for provider object storage
pub struct HttpUploader {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl std::fmt::Debug for HttpUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpUploader")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpUploader {
    pub fn new(api_key: impl Into<String>) -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECS))
            .build()
            .map_err(|e| CoreError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: DEFAULT_STORAGE_BASE_URL.to_string(),
        })
    }

    /// Set custom storage host
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    fn initiate_url(&self) -> String {
        format!("{}/storage/upload/initiate", self.base_url)
    }

    fn upload_error(context: &str, e: reqwest::Error) -> CoreError {
        if e.is_timeout() {
            CoreError::UploadFailed(format!("{}: request timeout: {}", context, e))
        } else if e.is_connect() {
            CoreError::UploadFailed(format!("{}: connection failed: {}", context, e))
        } else {
            CoreError::UploadFailed(format!("{}: {}", context, e))
        }
    }
}

/// File name derived from the content type, e.g. `upload.png`
fn file_name_for(content_type: &str) -> String {
    let extension = match content_type {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "audio/wav" => "wav",
        "audio/mpeg" => "mp3",
        "audio/ogg" => "ogg",
        "video/mp4" => "mp4",
        _ => "bin",
    };
    format!("upload.{}", extension)
}

#[async_trait]
impl ObjectUploader for HttpUploader {
    fn name(&self) -> &str {
        "http"
    }

    async fn upload(&self, data: &[u8], content_type: &str) -> CoreResult<String> {
        let initiate = InitiateRequest {
            content_type,
            file_name: file_name_for(content_type),
        };

        let resp = self
            .client
            .post(self.initiate_url())
            .header("Authorization", format!("Key {}", self.api_key))
            .json(&initiate)
            .send()
            .await
            .map_err(|e| Self::upload_error("initiate", e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CoreError::UploadFailed(format!(
                "initiate: {}",
                crate::core::queue::parse_api_error(status, &body)
            )));
        }

        let target: InitiateResponse = resp.json().await.map_err(|e| {
            CoreError::UploadFailed(format!("Failed to parse initiate response: {}", e))
        })?;

        debug!("Uploading {} bytes to signed URL", data.len());

        let resp = self
            .client
            .put(&target.upload_url)
            .header("Content-Type", content_type)
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| Self::upload_error("upload", e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CoreError::UploadFailed(format!(
                "upload: {}",
                crate::core::queue::parse_api_error(status, &body)
            )));
        }

        Ok(target.file_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_file_name_for() {
        assert_eq!(file_name_for("image/png"), "upload.png");
        assert_eq!(file_name_for("application/octet-stream"), "upload.bin");
    }

    #[test]
    fn test_debug_hides_key() {
        let uploader = HttpUploader::new("secret-key").unwrap();
        assert!(!format!("{:?}", uploader).contains("secret-key"));
    }

    #[tokio::test]
    async fn test_two_step_upload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/upload/initiate"))
            .and(header("Authorization", "Key k"))
            .and(body_json(json!({"content_type": "image/png", "file_name": "upload.png"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "upload_url": format!("{}/signed/abc", server.uri()),
                "file_url": "https://files.example/abc.png",
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/signed/abc"))
            .and(header("Content-Type", "image/png"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let uploader = HttpUploader::new("k").unwrap().with_base_url(server.uri());
        let url = uploader.upload(b"png-bytes", "image/png").await.unwrap();
        assert_eq!(url, "https://files.example/abc.png");
    }

    #[tokio::test]
    async fn test_initiate_failure_is_upload_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/upload/initiate"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let uploader = HttpUploader::new("k").unwrap().with_base_url(server.uri());
        let err = uploader.upload(b"x", "image/png").await.unwrap_err();
        assert!(matches!(err, CoreError::UploadFailed(_)));
        assert!(err.is_retryable());
    }
}
