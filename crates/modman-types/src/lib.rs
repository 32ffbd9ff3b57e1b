//! Modman Types - Core types for edge module deployment orchestration
//!
//! Modman installs versioned modules on an edge gateway and manages the
//! deployments created from them.
//!
//! ## Key Concepts
//!
//! - **Module**: Immutable, versioned descriptor of container services and
//!   the host resources, secrets, configuration and volumes they require
//! - **Deployment**: A named instance of a module with resolved assets and
//!   dependency edges to other deployments
//! - **Instance**: The live container set of a deployment
//! - **Job**: A cancellable, trackable unit of asynchronous orchestration work

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod config;
pub mod deployment;
pub mod error;
pub mod ids;
pub mod job;
pub mod module;

pub use config::ConfigValue;
pub use deployment::{
    DepAssets, DepContainer, DepFilter, DepInput, DepInstance, DepModule, DepSecret, Deployment,
};
pub use error::{Error, ErrorKind, Result};
pub use ids::{DeploymentId, InstanceId, JobId, ModuleId};
pub use job::{Job, JobError, JobFilter, JobStatus};
pub use module::{
    BindMount, ConfigField, DataType, ExtDependencyTarget, HostResourceRequirement,
    HostResourceTarget, Module, Port, Protocol, RunConfig, SecretRequirement, SecretTarget,
    Service, SrvRefTarget, TmpfsMount, Validator,
};
