//! Container runtime client
//!
//! [`ContainerRuntime`] is the narrow set of image, container and exec
//! calls sessions make. [`DockerRuntime`] implements it on top of bollard.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::Docker;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::DockerConfig;

/// Byte chunks produced by a build, pull or exec
pub type LogStream = BoxStream<'static, io::Result<Bytes>>;

/// Failures reported by the container runtime
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),

    #[error("{0}")]
    Other(String),
}

/// Operations the orchestrator needs from a container runtime
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Verify the runtime is reachable
    async fn connect(&self) -> Result<(), RuntimeError>;

    /// Release the client
    async fn close(&self) -> Result<(), RuntimeError>;

    /// Build `tag` from a tar build context whose root holds `definition`
    async fn build_image(
        &self,
        archive: Vec<u8>,
        definition: &str,
        tag: &str,
    ) -> Result<LogStream, RuntimeError>;

    /// Pull `reference` from its registry
    async fn pull_image(&self, reference: &str) -> Result<LogStream, RuntimeError>;

    /// Create a container and return its runtime id
    async fn create_container(
        &self,
        name: &str,
        image: &str,
        cmd: Vec<String>,
    ) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError>;

    async fn remove_container(
        &self,
        id: &str,
        force: bool,
        remove_volumes: bool,
    ) -> Result<(), RuntimeError>;

    /// Register `cmd` for execution inside a container and return the exec id
    async fn create_exec(&self, container_id: &str, cmd: Vec<String>)
        -> Result<String, RuntimeError>;

    /// Start an exec and stream its combined stdout/stderr
    async fn attach_exec(&self, exec_id: &str) -> Result<LogStream, RuntimeError>;

    /// Exit code of a finished exec, `None` if the runtime has none yet
    async fn inspect_exec(&self, exec_id: &str) -> Result<Option<i64>, RuntimeError>;
}

/// Docker/Podman API client
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Create a client from configuration. No request is made until
    /// [`ContainerRuntime::connect`].
    pub fn new(config: &DockerConfig) -> Result<Self, RuntimeError> {
        let docker = match &config.socket {
            Some(socket) => Docker::connect_with_socket(
                socket,
                config.connect_timeout_secs,
                bollard::API_DEFAULT_VERSION,
            )?,
            None => Docker::connect_with_local_defaults()?,
        };
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn connect(&self) -> Result<(), RuntimeError> {
        let version = self.docker.version().await?;
        info!(
            version = version.version.as_deref().unwrap_or("unknown"),
            api_version = version.api_version.as_deref().unwrap_or("unknown"),
            "Container runtime connected"
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), RuntimeError> {
        debug!("Container runtime client released");
        Ok(())
    }

    async fn build_image(
        &self,
        archive: Vec<u8>,
        definition: &str,
        tag: &str,
    ) -> Result<LogStream, RuntimeError> {
        let options = BuildImageOptions {
            dockerfile: definition.to_string(),
            t: tag.to_string(),
            rm: true,
            ..Default::default()
        };
        let progress = self.docker.build_image(options, None, Some(archive.into()));
        Ok(json_lines(progress))
    }

    async fn pull_image(&self, reference: &str) -> Result<LogStream, RuntimeError> {
        let (image, tag) = split_reference(reference);
        let options = CreateImageOptions {
            from_image: image.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };
        let progress = self.docker.create_image(Some(options), None, None);
        Ok(json_lines(progress))
    }

    async fn create_container(
        &self,
        name: &str,
        image: &str,
        cmd: Vec<String>,
    ) -> Result<String, RuntimeError> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            ..Default::default()
        };
        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(cmd),
            ..Default::default()
        };
        let response = self.docker.create_container(Some(options), config).await?;
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: stop_grace_secs(timeout),
        };
        self.docker.stop_container(id, Some(options)).await?;
        Ok(())
    }

    async fn remove_container(
        &self,
        id: &str,
        force: bool,
        remove_volumes: bool,
    ) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force,
            v: remove_volumes,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn create_exec(
        &self,
        container_id: &str,
        cmd: Vec<String>,
    ) -> Result<String, RuntimeError> {
        let options = CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(cmd),
            ..Default::default()
        };
        let created = self.docker.create_exec(container_id, options).await?;
        Ok(created.id)
    }

    async fn attach_exec(&self, exec_id: &str) -> Result<LogStream, RuntimeError> {
        match self.docker.start_exec(exec_id, None).await? {
            StartExecResults::Attached { output, .. } => Ok(output
                .map_ok(|chunk| chunk.into_bytes())
                .map_err(io::Error::other)
                .boxed()),
            StartExecResults::Detached => Err(RuntimeError::Other(format!(
                "exec {} started detached, no output to attach",
                exec_id
            ))),
        }
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<Option<i64>, RuntimeError> {
        let inspected = self.docker.inspect_exec(exec_id).await?;
        Ok(inspected.exit_code)
    }
}

/// Re-encode decoded progress items as one JSON document per line so every
/// backend feeds the same line decoder
fn json_lines<S, T>(progress: S) -> LogStream
where
    S: futures::Stream<Item = Result<T, bollard::errors::Error>> + Send + 'static,
    T: Serialize,
{
    progress
        .map(|item| -> io::Result<Bytes> {
            let item = item.map_err(io::Error::other)?;
            let mut line = serde_json::to_vec(&item).map_err(io::Error::other)?;
            line.push(b'\n');
            Ok(Bytes::from(line))
        })
        .boxed()
}

/// Stop grace period in whole seconds, saturating at the API's `i64` range
fn stop_grace_secs(timeout: Duration) -> i64 {
    i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX)
}

/// Split `name[:tag]` into its parts, defaulting the tag to `latest`.
/// A colon inside the registry host (`host:5000/img`) is not a tag, and
/// digest references are passed through untouched.
pub fn split_reference(reference: &str) -> (&str, &str) {
    if reference.contains('@') {
        return (reference, "");
    }
    let name_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[name_start..].rfind(':') {
        Some(i) => {
            let split = name_start + i;
            (&reference[..split], &reference[split + 1..])
        }
        None => (reference, "latest"),
    }
}
