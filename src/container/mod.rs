//! Container session orchestration
//!
//! Handles all interactions with the container runtime:
//! - Resolving images (local build from the catalog, or registry pull)
//! - Creating and starting sandbox containers
//! - Executing commands inside them and streaming their output
//! - Tearing containers down and aggregating teardown failures

mod error;
mod orchestrator;
mod registry;
pub mod runtime;
mod session;
pub mod stream;

pub use error::{AggregateError, SessionError};
pub use orchestrator::Orchestrator;
pub use registry::SessionRegistry;
pub use runtime::{ContainerRuntime, DockerRuntime, LogStream, RuntimeError};
pub use session::{ContainerSession, SessionHandle, SessionSettings, SessionState};
pub use stream::{LogSink, RuntimeMessage};
