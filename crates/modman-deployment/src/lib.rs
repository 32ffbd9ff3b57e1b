//! Modman Deployment - Deployment lifecycle orchestration
//!
//! This crate turns module descriptors into running containers and keeps the
//! stored deployment state consistent with what exists on the container
//! engine:
//!
//! - [`configs`] and [`assets`] resolve user input against module requirements
//! - [`materializer`] and [`volumes`] build container specs and named volumes
//! - [`handler::LifecycleHandler`] implements create, start, stop, update and
//!   delete, including dependency handling, orphan cleanup and rollback
//! - [`manager::Manager`] is the entry point: it serializes mutations through
//!   the orchestration lease and runs them as background jobs
//!
//! Remote side effects are undone through a [`CompensationStack`] when an
//! operation fails; every remote or storage call runs inside a [`CallScope`].

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod assets;
pub mod compensation;
pub mod configs;
pub mod handler;
pub mod manager;
pub mod materializer;
pub mod scope;
pub mod volumes;

pub use assets::{AssetResolver, ResolvedAssets};
pub use compensation::CompensationStack;
pub use configs::resolve_configs;
pub use handler::{Collaborators, HandlerConfig, LifecycleHandler};
pub use manager::{BatchSubmission, CreateSubmission, Manager};
pub use materializer::Materializer;
pub use scope::{CallScope, Timeouts};
pub use volumes::{VolumeDiff, VolumeNaming, VolumeNamingScheme};
