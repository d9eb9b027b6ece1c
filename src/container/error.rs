//! Error kinds for session orchestration

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use crate::catalog::CatalogError;

use super::runtime::RuntimeError;

/// Errors returned by sessions and the orchestrator
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("image catalog scan failed: {0}")]
    Catalog(#[from] CatalogError),

    #[error("container runtime unavailable: {0}")]
    Connect(#[source] RuntimeError),

    /// Build or pull failed, or the progress stream reported an error
    #[error("image resolution failed for {image}: {message}")]
    ImageResolution { image: String, message: String },

    /// Create, start, stop or remove failed
    #[error("{operation} failed for {image}: {source}")]
    Lifecycle {
        operation: &'static str,
        image: String,
        #[source]
        source: RuntimeError,
    },

    /// The runtime refused to create, attach or inspect an exec
    #[error("exec in session {session_id} failed: {message}")]
    Exec { session_id: Uuid, message: String },

    /// The command ran but exited with a nonzero status
    #[error("command completed with error (exit code {exit_code}): {command}")]
    CommandFailed { command: String, exit_code: i64 },

    #[error("session {0} is not running")]
    NotRunning(Uuid),

    #[error("session {0} not found")]
    NotFound(Uuid),

    #[error("log sink closed by its owner")]
    SinkClosed,

    /// Shutdown began before the session could be registered
    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error("session registry invariant violated: {0}")]
    Registry(String),

    #[error("{0}")]
    Teardown(AggregateError),

    /// Session setup failed and the compensating close failed as well
    #[error("{cause}; {cleanup}")]
    Aborted {
        cause: Box<SessionError>,
        cleanup: AggregateError,
    },
}

/// One failed sub-operation inside an [`AggregateError`]
#[derive(Debug, Clone, PartialEq, Eq)]
struct AggregateEntry {
    context: String,
    message: String,
}

/// Ordered collection of independent failures.
///
/// Renders as `[<context>] <message>` entries joined by `; `. Nothing is
/// ever dropped or deduplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateError {
    entries: Vec<AggregateEntry>,
}

impl AggregateError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure under `context`
    pub fn push(&mut self, context: impl Into<String>, error: impl fmt::Display) {
        self.entries.push(AggregateEntry {
            context: context.into(),
            message: error.to_string(),
        });
    }

    /// Record `result`'s error, if any, under `context`
    pub fn check<E: fmt::Display>(&mut self, context: impl Into<String>, result: Result<(), E>) {
        if let Err(e) = result {
            self.push(context, e);
        }
    }

    /// Fold a session error in, flattening nested teardown aggregates so each
    /// failed sub-operation keeps exactly one entry
    pub fn absorb(&mut self, context: impl Into<String>, error: SessionError) {
        match error {
            SessionError::Teardown(inner) => self.entries.extend(inner.entries),
            other => self.push(context, other),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `Ok(())` when nothing failed, otherwise the aggregate as a teardown error
    pub fn into_result(self) -> Result<(), SessionError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(SessionError::Teardown(self))
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "[{}] {}", entry.context, entry.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}
