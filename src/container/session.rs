//! Container sessions
//!
//! A session owns one container from image resolution to removal:
//! `New -> ImageResolving -> Created -> Running -> Closed`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::ImageDescriptor;
use crate::metrics;

use super::error::{AggregateError, SessionError};
use super::runtime::ContainerRuntime;
use super::stream::{forward_lines, Framing, LogSink, StreamError};

/// Seconds slept by each iteration of the placeholder loop
const IDLE_TICK_SECS: u64 = 10;

/// Session state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    ImageResolving,
    Created,
    Running,
    Closed,
}

/// Per-session runtime settings
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// How long the placeholder process keeps an unclosed container alive
    pub container_lifetime: Duration,
    /// Grace period given to `stop` before the runtime kills the container
    pub stop_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            container_lifetime: Duration::from_secs(3600),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

impl SessionSettings {
    /// Placeholder entry point: a shell loop that exits on its own once the
    /// configured lifetime has elapsed
    pub fn idle_command(&self) -> Vec<String> {
        let ticks = self.container_lifetime.as_secs().div_ceil(IDLE_TICK_SECS).max(1);
        vec![
            "sh".to_string(),
            "-ce".to_string(),
            format!(
                "i=0; while [ $i -lt {} ]; do sleep {}; i=$((i+1)); done",
                ticks, IDLE_TICK_SECS
            ),
        ]
    }
}

/// A sandbox container and the sink its output is streamed to
pub struct ContainerSession {
    /// Unique session ID
    pub session_id: Uuid,

    /// Image reference the session was requested with
    pub image: String,

    /// Container name
    pub container_name: String,

    /// When the session was created
    pub created_at: DateTime<Utc>,

    runtime: Arc<dyn ContainerRuntime>,
    sink: LogSink,
    settings: SessionSettings,

    /// Runtime container ID, set once create succeeds and taken by close
    container_id: RwLock<Option<String>>,

    state: RwLock<SessionState>,
    exec_count: AtomicU64,

    /// Only one exec at a time per session
    exec_lock: Mutex<()>,
}

impl std::fmt::Debug for ContainerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerSession")
            .field("session_id", &self.session_id)
            .field("image", &self.image)
            .field("container_name", &self.container_name)
            .finish_non_exhaustive()
    }
}

impl ContainerSession {
    pub(crate) fn new(
        image: impl Into<String>,
        runtime: Arc<dyn ContainerRuntime>,
        sink: LogSink,
        settings: SessionSettings,
    ) -> Self {
        let session_id = Uuid::new_v4();
        Self {
            session_id,
            image: image.into(),
            container_name: format!("sandcell-{}", session_id.simple()),
            created_at: Utc::now(),
            runtime,
            sink,
            settings,
            container_id: RwLock::new(None),
            state: RwLock::new(SessionState::New),
            exec_count: AtomicU64::new(0),
            exec_lock: Mutex::new(()),
        }
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    async fn set_state(&self, state: SessionState) {
        *self.state.write().await = state;
    }

    pub async fn container_id(&self) -> Option<String> {
        self.container_id.read().await.clone()
    }

    pub fn exec_count(&self) -> u64 {
        self.exec_count.load(Ordering::Relaxed)
    }

    /// Resolve the image (local build from `local` when the catalog knows
    /// it, registry pull otherwise), then create and start the container.
    ///
    /// On failure the caller must still [`close`](Self::close) the session.
    pub(crate) async fn resolve_and_start(
        &self,
        local: Option<&ImageDescriptor>,
    ) -> Result<(), SessionError> {
        self.set_state(SessionState::ImageResolving).await;

        match local {
            Some(descriptor) => self.build(descriptor).await?,
            None => self.pull().await?,
        }

        let container_id = self
            .runtime
            .create_container(
                &self.container_name,
                &self.image,
                self.settings.idle_command(),
            )
            .await
            .map_err(|source| SessionError::Lifecycle {
                operation: "container create",
                image: self.image.clone(),
                source,
            })?;

        *self.container_id.write().await = Some(container_id.clone());
        self.set_state(SessionState::Created).await;

        self.runtime
            .start_container(&container_id)
            .await
            .map_err(|source| SessionError::Lifecycle {
                operation: "container start",
                image: self.image.clone(),
                source,
            })?;

        self.set_state(SessionState::Running).await;
        info!(
            session_id = %self.session_id,
            image = %self.image,
            container_id = %container_id,
            "Container started"
        );
        Ok(())
    }

    async fn build(&self, descriptor: &ImageDescriptor) -> Result<(), SessionError> {
        info!(session_id = %self.session_id, tag = %descriptor.tag, "Building image locally");

        let archive = tokio::fs::read(&descriptor.archive_path)
            .await
            .map_err(|e| self.resolution_error(format!(
                "failed to open archive {}: {}",
                descriptor.archive_path.display(),
                e
            )))?;

        let progress = self
            .runtime
            .build_image(archive, &descriptor.definition_name, &descriptor.tag)
            .await
            .map_err(|e| self.resolution_error(format!("image build: {}", e)))?;

        self.forward_progress(progress).await?;
        metrics::record_image_resolved("build");
        Ok(())
    }

    async fn pull(&self) -> Result<(), SessionError> {
        info!(session_id = %self.session_id, image = %self.image, "Pulling image");

        let progress = self
            .runtime
            .pull_image(&self.image)
            .await
            .map_err(|e| self.resolution_error(format!("image pull: {}", e)))?;

        self.forward_progress(progress).await?;
        metrics::record_image_resolved("pull");
        Ok(())
    }

    async fn forward_progress(
        &self,
        progress: super::runtime::LogStream,
    ) -> Result<(), SessionError> {
        match forward_lines(progress, &self.sink, Framing::Message).await {
            Ok(lines) => {
                debug!(session_id = %self.session_id, lines, "Image progress forwarded");
                Ok(())
            }
            Err(StreamError::SinkClosed) => Err(SessionError::SinkClosed),
            Err(e) => Err(self.resolution_error(e.to_string())),
        }
    }

    fn resolution_error(&self, message: String) -> SessionError {
        SessionError::ImageResolution {
            image: self.image.clone(),
            message,
        }
    }

    /// Run `command` through `sh -ce` inside the container, streaming its
    /// combined output to the sink. Fails if the command exits nonzero.
    pub async fn exec(&self, command: &str) -> Result<(), SessionError> {
        let _lock = self.exec_lock.lock().await;

        if self.state().await != SessionState::Running {
            return Err(SessionError::NotRunning(self.session_id));
        }
        let container_id = self
            .container_id()
            .await
            .ok_or(SessionError::NotRunning(self.session_id))?;

        self.exec_count.fetch_add(1, Ordering::Relaxed);
        debug!(session_id = %self.session_id, command = %command, "Executing command");

        let result = self.run_exec(&container_id, command).await;
        metrics::record_exec(result.is_ok());
        result
    }

    async fn run_exec(&self, container_id: &str, command: &str) -> Result<(), SessionError> {
        let cmd = vec!["sh".to_string(), "-ce".to_string(), command.to_string()];
        let exec_id = self
            .runtime
            .create_exec(container_id, cmd)
            .await
            .map_err(|e| self.exec_error(format!("exec create: {}", e)))?;

        let output = self
            .runtime
            .attach_exec(&exec_id)
            .await
            .map_err(|e| self.exec_error(format!("exec attach: {}", e)))?;

        match forward_lines(output, &self.sink, Framing::Raw).await {
            Ok(_) => {}
            Err(StreamError::SinkClosed) => return Err(SessionError::SinkClosed),
            Err(e) => return Err(self.exec_error(format!("reading exec output: {}", e))),
        }

        let exit_code = self
            .runtime
            .inspect_exec(&exec_id)
            .await
            .map_err(|e| self.exec_error(format!("exec inspect: {}", e)))?;

        match exit_code {
            Some(code) if code != 0 => {
                warn!(
                    session_id = %self.session_id,
                    command = %command,
                    exit_code = code,
                    "Command completed with error"
                );
                Err(SessionError::CommandFailed {
                    command: command.to_string(),
                    exit_code: code,
                })
            }
            _ => Ok(()),
        }
    }

    fn exec_error(&self, message: String) -> SessionError {
        SessionError::Exec {
            session_id: self.session_id,
            message,
        }
    }

    /// Stop and remove the container.
    ///
    /// Both runtime calls are attempted and their failures combined. Only the
    /// first call does any work; later calls find no container and return
    /// `Ok(())`. Registered sessions are closed through
    /// [`Orchestrator::close_session`](super::Orchestrator::close_session),
    /// which also removes them from the registry.
    pub(crate) async fn close(&self) -> Result<(), SessionError> {
        let Some(container_id) = self.container_id.write().await.take() else {
            self.set_state(SessionState::Closed).await;
            return Ok(());
        };
        self.set_state(SessionState::Closed).await;

        let mut errors = AggregateError::new();
        errors.check(
            format!("container stop: {} {}", self.image, self.session_id),
            self.runtime
                .stop_container(&container_id, self.settings.stop_timeout)
                .await,
        );
        errors.check(
            format!("container remove: {} {}", self.image, self.session_id),
            self.runtime.remove_container(&container_id, true, true).await,
        );

        if errors.is_empty() {
            info!(session_id = %self.session_id, container_id = %container_id, "Container removed");
        } else {
            warn!(
                session_id = %self.session_id,
                container_id = %container_id,
                errors = %errors,
                "Container teardown incomplete"
            );
        }
        errors.into_result()
    }
}

/// Thread-safe session handle
pub type SessionHandle = Arc<ContainerSession>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ImageCatalog;
    use crate::container::runtime::{LogStream, MockContainerRuntime, RuntimeError};
    use bytes::Bytes;
    use futures::stream::{self, StreamExt};
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    fn lines(parts: &[&str]) -> LogStream {
        let items: Vec<std::io::Result<Bytes>> = parts
            .iter()
            .map(|p| Ok(Bytes::from(format!("{}\n", p))))
            .collect();
        stream::iter(items).boxed()
    }

    fn session(runtime: MockContainerRuntime, sink: LogSink) -> ContainerSession {
        ContainerSession::new("alpine", Arc::new(runtime), sink, SessionSettings::default())
    }

    fn expect_pull_and_start(runtime: &mut MockContainerRuntime) {
        runtime
            .expect_pull_image()
            .with(eq("alpine"))
            .returning(|_| Ok(lines(&[r#"{"status":"Pulled"}"#])));
        runtime
            .expect_create_container()
            .returning(|_, _, _| Ok("c-1".to_string()));
        runtime.expect_start_container().returning(|_| Ok(()));
    }

    fn collect(mut rx: mpsc::Receiver<Vec<u8>>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(String::from_utf8(line).unwrap());
        }
        out
    }

    #[test]
    fn test_idle_command_is_bounded() {
        let settings = SessionSettings {
            container_lifetime: Duration::from_secs(95),
            stop_timeout: Duration::from_secs(1),
        };
        let cmd = settings.idle_command();
        assert_eq!(cmd[0], "sh");
        assert!(cmd[2].contains("-lt 10"));
        assert!(cmd[2].contains("i=$((i+1))"));
    }

    #[tokio::test]
    async fn test_pull_path_starts_container() {
        let mut runtime = MockContainerRuntime::new();
        expect_pull_and_start(&mut runtime);
        let (tx, rx) = mpsc::channel(16);

        let session = session(runtime, tx);
        session.resolve_and_start(None).await.unwrap();

        assert_eq!(session.state().await, SessionState::Running);
        assert_eq!(session.container_id().await.as_deref(), Some("c-1"));
        assert_eq!(collect(rx), vec!["Pulled"]);
    }

    #[tokio::test]
    async fn test_build_path_uses_catalog_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("alpine.def"), "FROM alpine\n").unwrap();
        let mut catalog = ImageCatalog::new("def");
        catalog.scan(dir.path()).unwrap();

        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_build_image()
            .withf(|archive, definition, tag| {
                !archive.is_empty() && definition == "alpine.def" && tag == "alpine"
            })
            .times(1)
            .returning(|_, _, _| Ok(lines(&[r#"{"stream":"Step 1/1 : FROM alpine"}"#])));
        runtime.expect_pull_image().never();
        runtime
            .expect_create_container()
            .returning(|_, _, _| Ok("c-1".to_string()));
        runtime.expect_start_container().returning(|_| Ok(()));

        let (tx, rx) = mpsc::channel(16);
        let session = session(runtime, tx);
        session
            .resolve_and_start(catalog.lookup("alpine"))
            .await
            .unwrap();

        assert_eq!(collect(rx), vec!["Step 1/1 : FROM alpine"]);
    }

    #[tokio::test]
    async fn test_reported_pull_error_prevents_create() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_pull_image()
            .returning(|_| Ok(lines(&[r#"{"error":"manifest not found"}"#])));
        runtime.expect_create_container().never();

        let (tx, _rx) = mpsc::channel(16);
        let session = session(runtime, tx);
        let err = session
            .resolve_and_start(None)
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::ImageResolution { .. }));
        assert!(err.to_string().contains("manifest not found"));
        assert!(session.container_id().await.is_none());
        assert!(session.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_start_failure_keeps_container_for_cleanup() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_pull_image()
            .returning(|_| Ok(lines(&[])));
        runtime
            .expect_create_container()
            .returning(|_, _, _| Ok("c-1".to_string()));
        runtime
            .expect_start_container()
            .returning(|_| Err(RuntimeError::Other("no such image".to_string())));
        runtime.expect_stop_container().times(1).returning(|_, _| Ok(()));
        runtime
            .expect_remove_container()
            .with(eq("c-1"), eq(true), eq(true))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let (tx, _rx) = mpsc::channel(16);
        let session = session(runtime, tx);
        let err = session
            .resolve_and_start(None)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("container start failed for alpine"));
        session.close().await.unwrap();
        assert_eq!(session.state().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_exec_success_forwards_output() {
        let mut runtime = MockContainerRuntime::new();
        expect_pull_and_start(&mut runtime);
        runtime
            .expect_create_exec()
            .withf(|id, cmd| id == "c-1" && cmd[2] == "echo hello")
            .returning(|_, _| Ok("e-1".to_string()));
        runtime
            .expect_attach_exec()
            .returning(|_| Ok(lines(&["hello", "world"])));
        runtime.expect_inspect_exec().returning(|_| Ok(Some(0)));

        let (tx, rx) = mpsc::channel(16);
        let session = session(runtime, tx);
        session.resolve_and_start(None).await.unwrap();
        session.exec("echo hello").await.unwrap();

        assert_eq!(session.exec_count(), 1);
        assert_eq!(collect(rx), vec!["Pulled", "hello", "world"]);
    }

    #[tokio::test]
    async fn test_exec_nonzero_exit_names_command() {
        let mut runtime = MockContainerRuntime::new();
        expect_pull_and_start(&mut runtime);
        runtime
            .expect_create_exec()
            .returning(|_, _| Ok("e-1".to_string()));
        runtime
            .expect_attach_exec()
            .returning(|_| Ok(lines(&["sh: p0ng: not found"])));
        runtime.expect_inspect_exec().returning(|_| Ok(Some(127)));

        let (tx, rx) = mpsc::channel(16);
        let session = session(runtime, tx);
        session.resolve_and_start(None).await.unwrap();
        let err = session.exec("p0ng -c 10 example.com").await.unwrap_err();

        assert!(matches!(err, SessionError::CommandFailed { exit_code: 127, .. }));
        assert!(err.to_string().contains("p0ng -c 10 example.com"));
        assert_eq!(collect(rx), vec!["Pulled", "sh: p0ng: not found"]);
    }

    #[tokio::test]
    async fn test_exec_attach_failure_consumes_nothing() {
        let mut runtime = MockContainerRuntime::new();
        expect_pull_and_start(&mut runtime);
        runtime
            .expect_create_exec()
            .returning(|_, _| Ok("e-1".to_string()));
        runtime
            .expect_attach_exec()
            .returning(|_| Err(RuntimeError::Other("connection refused".to_string())));
        runtime.expect_inspect_exec().never();

        let (tx, _rx) = mpsc::channel(16);
        let session = session(runtime, tx);
        session.resolve_and_start(None).await.unwrap();
        let err = session.exec("true").await.unwrap_err();

        assert!(matches!(err, SessionError::Exec { .. }));
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_exec_before_start_is_rejected() {
        let runtime = MockContainerRuntime::new();
        let (tx, _rx) = mpsc::channel(16);
        let session = session(runtime, tx);

        assert!(matches!(
            session.exec("true").await,
            Err(SessionError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_close_twice_tears_down_once() {
        let mut runtime = MockContainerRuntime::new();
        expect_pull_and_start(&mut runtime);
        runtime.expect_stop_container().times(1).returning(|_, _| Ok(()));
        runtime
            .expect_remove_container()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let (tx, _rx) = mpsc::channel(16);
        let session = Arc::new(session(runtime, tx));
        session.resolve_and_start(None).await.unwrap();

        let (a, b) = tokio::join!(session.close(), session.close());
        assert!(a.is_ok());
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_close_attempts_remove_after_stop_failure() {
        let mut runtime = MockContainerRuntime::new();
        expect_pull_and_start(&mut runtime);
        runtime
            .expect_stop_container()
            .times(1)
            .returning(|_, _| Err(RuntimeError::Other("stop timed out".to_string())));
        runtime
            .expect_remove_container()
            .times(1)
            .returning(|_, _, _| Err(RuntimeError::Other("removal in progress".to_string())));

        let (tx, _rx) = mpsc::channel(16);
        let session = session(runtime, tx);
        session.resolve_and_start(None).await.unwrap();

        let err = session.close().await.unwrap_err();
        let SessionError::Teardown(errors) = err else {
            panic!("expected teardown error");
        };
        assert_eq!(errors.len(), 2);
        assert_eq!(
            errors.to_string(),
            format!(
                "[container stop: alpine {id}] stop timed out; \
                 [container remove: alpine {id}] removal in progress",
                id = session.session_id
            )
        );
    }
}
