//! HTTP clients for the remote collaborator services

mod engine;
mod host;
mod secrets;

pub use engine::HttpContainerEngine;
pub use host::HttpHostResources;
pub use secrets::HttpSecretStore;

use crate::error::{ClientError, ClientResult};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

/// Thin JSON client shared by the service clients
#[derive(Debug, Clone)]
pub(crate) struct HttpClient {
    client: Client,
    base_url: String,
}

impl HttpClient {
    pub(crate) fn new(base_url: &str, timeout: Duration) -> ClientResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub(crate) async fn get<T: DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        self.json(self.client.get(self.url(path))).await
    }

    pub(crate) async fn get_query<Q: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        query: &Q,
    ) -> ClientResult<T> {
        self.json(self.client.get(self.url(path)).query(query)).await
    }

    pub(crate) async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> ClientResult<T> {
        self.json(self.client.post(self.url(path)).json(body)).await
    }

    pub(crate) async fn patch<T: DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        self.json(self.client.patch(self.url(path))).await
    }

    /// PATCH expecting no response body
    pub(crate) async fn patch_empty(&self, path: &str) -> ClientResult<()> {
        let response = self.client.patch(self.url(path)).send().await?;
        Self::check_status(response).await.map(|_| ())
    }

    pub(crate) async fn delete<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> ClientResult<T> {
        self.json(self.client.delete(self.url(path)).query(query)).await
    }

    /// DELETE expecting no response body
    pub(crate) async fn delete_empty(&self, path: &str, query: &[(&str, String)]) -> ClientResult<()> {
        let response = self.client.delete(self.url(path)).query(query).send().await?;
        Self::check_status(response).await.map(|_| ())
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> ClientResult<T> {
        let response = Self::check_status(request.send().await?).await?;
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    async fn check_status(response: reqwest::Response) -> ClientResult<reqwest::Response> {
        let status = response.status();

        if status.is_success() {
            Ok(response)
        } else if status == StatusCode::NOT_FOUND {
            let path = response.url().path().to_string();
            Err(ClientError::NotFound(path))
        } else {
            let message = response.text().await.unwrap_or_default();
            Err(ClientError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}
