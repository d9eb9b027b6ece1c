//! Session orchestration
//!
//! The [`Orchestrator`] owns the runtime client, the image catalog and the
//! registry of live sessions. It is the only place sessions enter or leave
//! the registry.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::{CatalogError, ImageCatalog};
use crate::config::DockerConfig;
use crate::metrics;

use super::error::{AggregateError, SessionError};
use super::registry::SessionRegistry;
use super::runtime::ContainerRuntime;
use super::session::{ContainerSession, SessionHandle, SessionSettings};
use super::stream::LogSink;

/// Creates, tracks and tears down container sessions
pub struct Orchestrator {
    config: DockerConfig,
    settings: SessionSettings,
    runtime: Arc<dyn ContainerRuntime>,
    catalog: RwLock<ImageCatalog>,
    registry: SessionRegistry,
}

impl Orchestrator {
    pub fn new(config: DockerConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let settings = config.session_settings();
        let catalog = ImageCatalog::new(config.definition_extension.clone());
        Self {
            config,
            settings,
            runtime,
            catalog: RwLock::new(catalog),
            registry: SessionRegistry::new(),
        }
    }

    /// Scan the image definitions, then verify the runtime is reachable
    pub async fn start(&self) -> Result<(), SessionError> {
        let root = self.config.images_dir.clone();
        let extension = self.config.definition_extension.clone();

        let catalog = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&root).map_err(|source| CatalogError::Write {
                path: root.clone(),
                source,
            })?;
            let mut catalog = ImageCatalog::new(extension);
            catalog.scan(&root)?;
            Ok::<_, CatalogError>(catalog)
        })
        .await
        .map_err(CatalogError::Task)??;

        if catalog.is_empty() {
            info!(
                images_dir = %self.config.images_dir.display(),
                "No local image definitions; every image will be pulled"
            );
        }
        let tags = catalog.tags();
        *self.catalog.write().await = catalog;

        self.runtime.connect().await.map_err(SessionError::Connect)?;

        info!(
            images_dir = %self.config.images_dir.display(),
            images = ?tags,
            "Orchestrator started"
        );
        Ok(())
    }

    /// Close every live session and the runtime client, collecting every
    /// failure instead of stopping at the first.
    ///
    /// The registry is sealed first, so a session still resolving when
    /// shutdown begins is torn down by its own setup path instead of being
    /// registered behind the sweep.
    pub async fn stop(&self) -> Result<(), SessionError> {
        let sessions = self.registry.seal().await;
        info!(sessions = sessions.len(), "Stopping orchestrator");

        let mut errors = AggregateError::new();
        for session in sessions {
            if let Err(e) = self.close_session(&session.session_id).await {
                errors.absorb(format!("session close: {}", session.session_id), e);
            }
        }
        errors.check("runtime close", self.runtime.close().await);

        if !errors.is_empty() {
            error!(errors = %errors, "Orchestrator stopped with errors");
        }
        errors.into_result()
    }

    /// Resolve `image`, start a container for it and register the session.
    ///
    /// On failure the half-built session is closed before the error is
    /// returned; it is never registered. Once [`stop`](Self::stop) has begun
    /// every call fails with [`SessionError::ShuttingDown`].
    pub async fn new_session(&self, image: &str, sink: LogSink) -> Result<SessionHandle, SessionError> {
        if self.registry.is_sealed().await {
            return Err(SessionError::ShuttingDown);
        }

        let session = Arc::new(ContainerSession::new(
            image,
            self.runtime.clone(),
            sink,
            self.settings.clone(),
        ));

        let local = self.catalog.read().await.lookup(image).cloned();
        let started = session.resolve_and_start(local.as_ref()).await;
        let registered = match started {
            Ok(()) => self.registry.register(session.clone()).await,
            Err(e) => Err(e),
        };

        if let Err(cause) = registered {
            warn!(session_id = %session.session_id, image = %image, error = %cause, "Session setup failed");
            return Err(match session.close().await {
                Ok(()) => cause,
                Err(close_err) => {
                    let mut cleanup = AggregateError::new();
                    cleanup.absorb("on close", close_err);
                    SessionError::Aborted {
                        cause: Box::new(cause),
                        cleanup,
                    }
                }
            });
        }

        metrics::record_session_created();
        info!(session_id = %session.session_id, image = %image, "Session created");
        Ok(session)
    }

    /// Look up a live session
    pub async fn session(&self, id: &Uuid) -> Option<SessionHandle> {
        self.registry.get(id).await
    }

    /// Run `command` in the session `id`
    pub async fn exec(&self, id: &Uuid, command: &str) -> Result<(), SessionError> {
        let session = self
            .registry
            .get(id)
            .await
            .ok_or(SessionError::NotFound(*id))?;
        session.exec(command).await
    }

    /// Deregister and tear down the session `id`.
    ///
    /// Only the caller that removes the registry entry performs the
    /// teardown; any other caller gets `Ok(())`.
    pub async fn close_session(&self, id: &Uuid) -> Result<(), SessionError> {
        let Some(session) = self.registry.deregister(id).await else {
            return Ok(());
        };
        metrics::record_session_closed();
        let result = session.close().await;
        info!(session_id = %id, ok = result.is_ok(), "Session closed");
        result
    }

    /// IDs of every live session
    pub async fn session_ids(&self) -> Vec<Uuid> {
        let mut ids = Vec::new();
        self.registry.for_each(|id, _| ids.push(*id)).await;
        ids
    }

    pub async fn active_session_count(&self) -> usize {
        self.registry.len().await
    }

    /// Tags buildable from local definitions
    pub async fn catalog_tags(&self) -> Vec<String> {
        self.catalog.read().await.tags()
    }
}
