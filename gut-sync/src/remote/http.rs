//! HTTP client for the tracker API
//!
//! The session lives in the cookie store of the underlying client.

use super::{AuthStatus, ImageUpload, RemoteEntry, RemoteStore, SaveReceipt};
use crate::database::Entry;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;

#[derive(Clone)]
pub struct HttpRemoteStore {
    client: Client,
    base_url: Url,
}

impl HttpRemoteStore {
    pub fn new(server_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Self::with_client(client, server_url)
    }

    pub fn with_client(client: Client, server_url: &str) -> Result<Self> {
        let mut base = server_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| AppError::Config(format!("Invalid server URL {:?}: {}", server_url, e)))?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, name: &str) -> Result<Url> {
        self.base_url
            .join(name)
            .map_err(|e| AppError::Config(format!("Invalid endpoint {}: {}", name, e)))
    }

    async fn decode<T: DeserializeOwned>(response: Response, entry_id: Option<i64>) -> Result<T> {
        let response = check_status(response, entry_id).await?;
        Ok(response.json::<T>().await?)
    }
}

/// Map non-2xx responses onto the error taxonomy.
async fn check_status(response: Response, entry_id: Option<i64>) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if let (StatusCode::NOT_FOUND, Some(id)) = (status, entry_id) {
        return Err(AppError::RemoteNotFound(id));
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });

    Err(AppError::RemoteRejected {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn check_auth(&self) -> Result<AuthStatus> {
        let response = self.client.get(self.endpoint("check_auth")?).send().await?;
        Self::decode(response, None).await
    }

    async fn list(&self, limit: u32) -> Result<Vec<Entry>> {
        let response = self
            .client
            .get(self.endpoint("entries")?)
            .query(&[("limit", limit)])
            .send()
            .await?;
        let remote: Vec<RemoteEntry> = Self::decode(response, None).await?;

        let entries = remote
            .into_iter()
            .filter_map(|entry| {
                entry
                    .into_entry()
                    .map_err(|e| tracing::warn!("Ignoring server entry: {}", e))
                    .ok()
            })
            .collect();
        Ok(entries)
    }

    async fn get(&self, id: i64) -> Result<Entry> {
        let response = self
            .client
            .get(self.endpoint("entries")?)
            .query(&[("id", id)])
            .send()
            .await?;
        let remote: RemoteEntry = Self::decode(response, Some(id)).await?;
        remote.into_entry()
    }

    async fn save(&self, entry: &Entry, image: Option<ImageUpload>) -> Result<SaveReceipt> {
        let mut form = Form::new()
            .text("type", entry.kind().as_str())
            .text("event_at", entry.event_at.clone())
            .text("data", entry.data.to_value().to_string());

        if let Some(id) = entry.id {
            form = form.text("id", id.to_string());
        }

        if let Some(image) = image {
            let part = Part::bytes(image.bytes)
                .file_name(image.file_name)
                .mime_str(&image.mime_type)
                .map_err(|e| AppError::InvalidEntry(format!("Invalid image type: {}", e)))?;
            form = form.part("image", part);
        }

        let response = self
            .client
            .post(self.endpoint("entry")?)
            .multipart(form)
            .send()
            .await?;
        let receipt: SaveReceipt = Self::decode(response, None).await?;

        tracing::debug!("Server stored entry as {}", receipt.id);
        Ok(receipt)
    }

    async fn delete(&self, id: i64) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint("delete")?)
            .json(&json!({ "id": id }))
            .send()
            .await?;
        check_status(response, Some(id)).await?;
        Ok(())
    }

    async fn delete_all(&self) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint("delete_all")?)
            .send()
            .await?;
        check_status(response, None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let store = HttpRemoteStore::new("http://localhost:8000/api", Duration::from_secs(5)).unwrap();
        assert_eq!(store.base_url().as_str(), "http://localhost:8000/api/");
        assert_eq!(
            store.endpoint("entries").unwrap().as_str(),
            "http://localhost:8000/api/entries"
        );
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        let result = HttpRemoteStore::new("not a url", Duration::from_secs(5));
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
