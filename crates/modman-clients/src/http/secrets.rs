use super::HttpClient;
use crate::error::{cancellable, ClientResult};
use crate::secrets::*;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Serialize)]
struct VariantBody<'a> {
    item: Option<&'a str>,
    reference: &'a str,
}

impl<'a> From<&'a SecretVariantRequest> for VariantBody<'a> {
    fn from(request: &'a SecretVariantRequest) -> Self {
        Self {
            item: request.item.as_deref(),
            reference: &request.reference,
        }
    }
}

/// Secret manager client
pub struct HttpSecretStore {
    http: HttpClient,
}

impl HttpSecretStore {
    pub fn new(base_url: &str, timeout: Duration) -> ClientResult<Self> {
        Ok(Self {
            http: HttpClient::new(base_url, timeout)?,
        })
    }
}

#[async_trait]
impl SecretStore for HttpSecretStore {
    async fn get_secret(&self, id: &str, cancel: &CancellationToken) -> ClientResult<Secret> {
        cancellable(cancel, self.http.get(&format!("/secrets/{}", id))).await
    }

    async fn init_path_variant(
        &self,
        request: &SecretVariantRequest,
        cancel: &CancellationToken,
    ) -> ClientResult<SecretPathVariant> {
        let body = VariantBody::from(request);
        cancellable(
            cancel,
            self.http
                .post(&format!("/secrets/{}/path-variants", request.id), &body),
        )
        .await
    }

    async fn init_value_variant(
        &self,
        request: &SecretVariantRequest,
        cancel: &CancellationToken,
    ) -> ClientResult<SecretValueVariant> {
        let body = VariantBody::from(request);
        cancellable(
            cancel,
            self.http
                .post(&format!("/secrets/{}/value-variants", request.id), &body),
        )
        .await
    }

    async fn load_path_variants(
        &self,
        reference: &str,
        cancel: &CancellationToken,
    ) -> ClientResult<()> {
        cancellable(
            cancel,
            self.http
                .patch_empty(&format!("/path-variants/{}/load", reference)),
        )
        .await
    }

    async fn clean_path_variants(
        &self,
        reference: &str,
        cancel: &CancellationToken,
    ) -> ClientResult<()> {
        cancellable(
            cancel,
            self.http
                .delete_empty(&format!("/path-variants/{}", reference), &[]),
        )
        .await
    }
}
