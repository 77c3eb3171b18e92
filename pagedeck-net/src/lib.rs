use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use pagedeck_core::{DocumentId, NetworkError, PersistenceGateway, UploadReceipt};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use tracing::{debug, instrument};

/// HTTP client for the document persistence endpoints. Transfers bytes only;
/// the document format is never reinterpreted here, and failed requests are
/// not retried.
pub struct HttpGateway {
    client: Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    fn download_url(&self, id: DocumentId) -> String {
        format!("{}/download/{}", self.base_url, id)
    }

    fn upload_url(&self) -> String {
        format!("{}/upload", self.base_url)
    }
}

#[async_trait]
impl PersistenceGateway for HttpGateway {
    #[instrument(skip(self))]
    async fn download(&self, id: DocumentId) -> Result<Bytes, NetworkError> {
        let response = self
            .client
            .get(self.download_url(id))
            .send()
            .await
            .map_err(map_transport_error)?;
        let response = check_status(response)?;
        let bytes = response.bytes().await.map_err(map_transport_error)?;
        debug!(%id, len = bytes.len(), "document downloaded");
        Ok(bytes)
    }

    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    async fn upload(&self, id: DocumentId, bytes: Bytes) -> Result<UploadReceipt, NetworkError> {
        let part = Part::bytes(bytes.to_vec())
            .file_name(format!("{id}.pdf"))
            .mime_str("application/pdf")
            .map_err(map_transport_error)?;
        let form = Form::new().part("pdfFile", part);

        let response = self
            .client
            .post(self.upload_url())
            .query(&[("id", id.to_string())])
            .multipart(form)
            .send()
            .await
            .map_err(map_transport_error)?;
        let response = check_status(response)?;
        let receipt = response
            .json::<UploadReceipt>()
            .await
            .map_err(map_transport_error)?;
        debug!(%id, path = %receipt.file_path, "document uploaded");
        Ok(receipt)
    }
}

fn map_transport_error(err: reqwest::Error) -> NetworkError {
    if err.is_timeout() {
        NetworkError::Timeout
    } else if let Some(status) = err.status() {
        NetworkError::ServerError {
            status: status.as_u16(),
        }
    } else {
        NetworkError::Unreachable {
            detail: err.to_string(),
        }
    }
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, NetworkError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(NetworkError::ServerError {
            status: status.as_u16(),
        })
    }
}
