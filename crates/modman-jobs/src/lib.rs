//! Modman Jobs - Asynchronous orchestration work
//!
//! Every mutating orchestration operation runs as a [`Job`](modman_types::Job)
//! on the [`JobEngine`]'s bounded worker pool. Conflicting operations are
//! serialized by the [`OrchestrationLease`]: the caller acquires it before
//! submitting the job and moves the [`LeaseGuard`] into the job body, so the
//! lease is held until the asynchronous work finishes.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod engine;
pub mod lease;

pub use engine::{JobEngine, JobEngineConfig};
pub use lease::{LeaseGuard, OrchestrationLease};
