use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::multipart::{Form, Part};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::attachment::ImageUpload;
use crate::config::BackendConfig;
use crate::error::TransportError;
use crate::request::{BackendReply, BackendRequest, RequestOutcome};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    message: &'a str,
}

/// HTTP client for the commerce assistant backend.
#[derive(Debug, Clone)]
pub struct BackendClient {
    base_url: String,
    client: reqwest::Client,
}

impl BackendClient {
    pub fn with_config(config: &BackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(BackendClient {
            base_url: config.url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Perform `request`, giving up as soon as `cancel` fires.
    pub async fn dispatch(&self, request: BackendRequest, cancel: CancellationToken) -> RequestOutcome {
        let kind = request.kind();

        let call = async {
            match &request {
                BackendRequest::Text { message } => self.send_chat(message).await,
                BackendRequest::Image(upload) => self.send_image_search(upload).await,
                BackendRequest::ResetMemory => self.reset_memory().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            body = call => body.map(|body| BackendReply::classify(kind, body)),
        }
    }

    pub async fn send_chat(&self, message: &str) -> Result<Value, TransportError> {
        let url = format!("{}/chat", self.base_url);
        tracing::debug!(%url, "sending chat message");

        let response = self
            .client
            .post(&url)
            .json(&ChatRequest { message })
            .send()
            .await?;

        read_json(response).await
    }

    pub async fn send_image_search(&self, upload: &ImageUpload) -> Result<Value, TransportError> {
        let url = format!("{}/search-image", self.base_url);
        tracing::debug!(%url, filename = %upload.filename, size = upload.bytes.len(), "uploading image");

        let part = Part::bytes(upload.bytes.clone()).file_name(upload.filename.clone());
        let part = match part.mime_str(&upload.mime) {
            Ok(part) => part,
            Err(e) => {
                tracing::warn!("ignoring invalid mime type {}: {}", upload.mime, e);
                Part::bytes(upload.bytes.clone()).file_name(upload.filename.clone())
            }
        };
        let form = Form::new().part("file", part);

        let response = self.client.post(&url).multipart(form).send().await?;

        read_json(response).await
    }

    /// Clear the server-side conversation memory for this client.
    pub async fn reset_memory(&self) -> Result<Value, TransportError> {
        let url = format!("{}/reset-memory", self.base_url);
        tracing::debug!(%url, "resetting conversation memory");

        let response = self.client.post(&url).send().await?;

        read_json(response).await
    }
}

async fn read_json(response: reqwest::Response) -> Result<Value, TransportError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TransportError::Status {
            status: status.as_u16(),
            body,
        });
    }

    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| TransportError::MalformedBody(e.to_string()))
}
