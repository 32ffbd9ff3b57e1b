//! Modman Daemon library
//!
//! Components of `modmand`:
//! - REST API handlers over the deployment [`Manager`](modman_deployment::Manager)
//! - Configuration loading
//! - Server lifecycle management

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod api;
pub mod config;
pub mod error;
pub mod server;

pub use config::DaemonConfig;
pub use error::{ApiError, DaemonError, DaemonResult};
pub use server::Server;
