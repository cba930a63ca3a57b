use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::time;

use super::DocumentClient;
use crate::config::{self, RemoteConfig};

const MAX_ATTEMPTS: u64 = 3;

/// Document store spoken over HTTP:
/// `GET {base}/v1/documents/{collection}/{key}` and
/// `PATCH` of the same path with a JSON object of fields to merge.
pub struct HttpDocumentClient {
    client: Client,
    base_url: String,
}

impl HttpDocumentClient {
    pub fn new(remote: &RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(remote.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: config::get_api_base_url(remote)
                .trim_end_matches('/')
                .to_string(),
        })
    }

    fn document_path(collection: &str, key: &str) -> String {
        format!("/v1/documents/{collection}/{key}")
    }

    /// Bearer-authenticated request. Retries transport failures and 5xx with
    /// backoff, and refreshes the token once on 401.
    async fn authenticated_request<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&T>,
    ) -> Result<Response> {
        let mut attempts = 0;

        loop {
            attempts += 1;
            let url = format!("{}{}", self.base_url, path);
            let mut builder = self.client.request(method.clone(), &url);

            let token = config::get_token();
            if !token.is_empty() {
                builder = builder.bearer_auth(token);
            }

            if let Some(b) = body {
                builder = builder.json(b);
            }

            match builder.send().await {
                Ok(resp) => {
                    if resp.status() == StatusCode::UNAUTHORIZED
                        && attempts == 1
                        && self.refresh_token().await.is_ok()
                    {
                        continue;
                    }

                    if resp.status().is_server_error() && attempts < MAX_ATTEMPTS {
                        tracing::debug!(status = %resp.status(), attempts, %url, "server error, retrying");
                        time::sleep(Duration::from_millis(500 * attempts)).await;
                        continue;
                    }

                    return Ok(resp);
                }
                Err(e) if attempts < MAX_ATTEMPTS => {
                    tracing::debug!(error = %e, attempts, %url, "request failed, retrying");
                    time::sleep(Duration::from_millis(500 * attempts)).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn refresh_token(&self) -> Result<()> {
        let data = config::get_token_data();
        if data.refresh_token.is_empty() {
            return Err(anyhow!("No refresh token"));
        }

        let resp = self
            .client
            .post(format!("{}/auth/refresh", self.base_url))
            .json(&serde_json::json!({ "refresh_token": data.refresh_token }))
            .send()
            .await?;

        if resp.status() != StatusCode::OK {
            return Err(anyhow!("Refresh failed: {}", resp.status()));
        }

        #[derive(Deserialize)]
        struct RefreshRes {
            id_token: String,
            refresh_token: String,
        }
        let res: RefreshRes = resp.json().await?;
        config::save_token_data(&res.id_token, &res.refresh_token)?;
        tracing::info!("token refreshed");
        Ok(())
    }
}

#[async_trait]
impl DocumentClient for HttpDocumentClient {
    async fn get_document(&self, collection: &str, key: &str) -> Result<Option<Map<String, Value>>> {
        let resp = self
            .authenticated_request::<()>(Method::GET, &Self::document_path(collection, key), None)
            .await?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let doc: Map<String, Value> = resp.json().await.context("Malformed document body")?;
                Ok(Some(doc))
            }
            status => Err(anyhow!("Fetching {collection}/{key} failed: {status}")),
        }
    }

    async fn merge_document(&self, collection: &str, key: &str, fields: Map<String, Value>) -> Result<()> {
        let resp = self
            .authenticated_request(Method::PATCH, &Self::document_path(collection, key), Some(&fields))
            .await?;

        if !resp.status().is_success() {
            return Err(anyhow!("Merging into {collection}/{key} failed: {}", resp.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_document_paths_against_trimmed_base() {
        let client = HttpDocumentClient::new(&RemoteConfig {
            base_url: "https://example.test/".into(),
            timeout_secs: 1,
        })
        .unwrap();
        if std::env::var("DREAMLOG_API_URL").is_err() {
            assert_eq!(client.base_url, "https://example.test");
        }
        assert_eq!(
            HttpDocumentClient::document_path("dreams", "uid-1"),
            "/v1/documents/dreams/uid-1"
        );
    }
}
