//! Modman Store - Deployment state storage
//!
//! Storage is the durable owner of record for deployments, their dependency
//! edges, resolved assets and live instances. The orchestration engine only
//! depends on the traits defined here; [`InMemoryStorage`] is the bundled
//! implementation.
//!
//! Multi-step writes are grouped in transactions: [`Transactional::begin_transaction`]
//! hands out a [`Tx`] that every mutating call accepts, and the handle is
//! consumed by either [`Transactional::commit`] or [`Transactional::rollback`].

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{StorageError, StorageResult};
pub use memory::InMemoryStorage;
pub use traits::{
    AssetStorage, DeploymentStorage, InstanceStorage, RequirementStorage, Storage,
    Transactional, Tx,
};
