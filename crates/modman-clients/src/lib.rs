//! Modman Clients - Collaborator contracts
//!
//! The orchestration engine talks to four external services through the
//! capability traits in this crate:
//!
//! - [`ContainerEngine`]: containers and named volumes
//! - [`SecretStore`]: secrets and their materialized variants
//! - [`HostResources`]: devices and other host resources
//! - [`ModuleSource`]: installed module descriptors and include directories
//!
//! Each trait has an in-memory implementation (used for tests and dry runs)
//! and, for the remote services, a `reqwest` based HTTP client.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod engine;
pub mod error;
pub mod host;
pub mod http;
pub mod memory;
pub mod modules;
pub mod secrets;

pub use engine::{
    ContainerEngine, ContainerInfo, ContainerSpec, ContainerState, EngineJob, Mount, PortBinding,
    VolumeFilter, VolumeInfo, VolumeSpec,
};
pub use error::{cancellable, ClientError, ClientResult};
pub use host::{HostResource, HostResources};
pub use http::{HttpContainerEngine, HttpHostResources, HttpSecretStore};
pub use memory::{
    EngineOp, InMemoryContainerEngine, InMemoryHostResources, InMemorySecretStore, SecretOp,
};
pub use modules::{ModuleRegistry, ModuleSource};
pub use secrets::{Secret, SecretPathVariant, SecretStore, SecretValueVariant, SecretVariantRequest};
