//! Secret manager contract
//!
//! Secrets are materialized per deployment as *variants*: a path variant is
//! a file the secret manager writes and the container bind-mounts, a value
//! variant is the plain value injected into the environment. Path variants
//! are grouped under a reference (the deployment id) so they can be loaded
//! before start and cleaned after stop in one call. Cleaning removes the
//! files only; the variants stay registered and can be loaded again.

use crate::error::ClientResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub secret_type: Option<String>,
    #[serde(default)]
    pub items: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretVariantRequest {
    pub id: String,
    #[serde(default)]
    pub item: Option<String>,
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretPathVariant {
    pub id: String,
    #[serde(default)]
    pub item: Option<String>,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretValueVariant {
    pub id: String,
    #[serde(default)]
    pub item: Option<String>,
    pub value: String,
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, id: &str, cancel: &CancellationToken) -> ClientResult<Secret>;

    async fn init_path_variant(
        &self,
        request: &SecretVariantRequest,
        cancel: &CancellationToken,
    ) -> ClientResult<SecretPathVariant>;

    async fn init_value_variant(
        &self,
        request: &SecretVariantRequest,
        cancel: &CancellationToken,
    ) -> ClientResult<SecretValueVariant>;

    /// Write every path variant of `reference` to disk
    async fn load_path_variants(&self, reference: &str, cancel: &CancellationToken)
        -> ClientResult<()>;

    /// Remove the files of every path variant of `reference`
    async fn clean_path_variants(
        &self,
        reference: &str,
        cancel: &CancellationToken,
    ) -> ClientResult<()>;
}
