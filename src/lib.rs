//! VICE - lifecycle orchestration for interactive analyses on Kubernetes
//!
//! An analysis launch becomes a fixed set of cluster objects (deployment,
//! service, ingress, staging config and, in CSI mode, volumes) that all carry
//! the same `external-id` label. That label is the only thing tying them
//! together: listing, teardown and host lookups all key off it.
//!
//! # Modules
//!
//! - [`mounts`] - Mount-root planning for remote store paths
//! - [`assembler`] - Job descriptor to resource graph
//! - [`lifecycle`] - Idempotent apply and label-driven teardown
//! - [`admission`] - Per-user concurrency limit
//! - [`transfer`] - Data staging trigger and poll state machine
//! - [`monitor`] - Deployment watch feeding the status tracker
//! - [`relabel`] - Label repair for older analyses
//! - [`tasks`] - Supervision of detached work
//! - [`manager`] - Facade sequencing the above per request
//! - [`server`] - HTTP surface over the manager
//! - [`cluster`], [`lookup`], [`status`] - Seams to the outside world
//! - [`error`] - Error types

#![warn(missing_docs)]

pub mod admission;
pub mod assembler;
pub mod backoff;
pub mod cluster;
pub mod config;
pub mod error;
mod http;
pub mod job;
pub mod labels;
pub mod lifecycle;
pub mod lookup;
pub mod manager;
pub mod monitor;
pub mod mounts;
pub mod relabel;
pub mod server;
pub mod status;
pub mod tasks;
pub mod telemetry;
pub mod transfer;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T, E = Error> = std::result::Result<T, E>;
