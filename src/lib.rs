//! Sandcell orchestrator library
//!
//! Provisions short-lived, RPC-controlled execution sandboxes on top of a
//! Docker/Podman runtime: images are built from local definitions or pulled,
//! each session keeps one container alive for on-demand command execution,
//! and every build, pull and exec streams its output to a caller-supplied
//! sink.

pub mod catalog;
pub mod config;
pub mod container;
pub mod logging;
pub mod metrics;
pub mod rpc;

pub use catalog::{ImageCatalog, ImageDescriptor};
pub use container::{Orchestrator, SessionError};
