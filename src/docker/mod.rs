//! Container discovery over the local container runtime.
//!
//! The watcher (`watcher` module) tracks containers through the runtime's
//! list and event-stream APIs behind the [`ContainerRuntime`] seam. The
//! production implementation speaks the Docker Engine API through
//! `bollard`; tests substitute a mock runtime.

pub mod watcher;

pub use watcher::{Watcher, WatcherError, DEFAULT_CLEANUP_TIMEOUT};

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;

/// A container snapshot. Immutable; the watcher replaces entries
/// atomically on update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    /// Opaque runtime identifier, typically 64 hex characters.
    pub id: String,
    /// First runtime-provided name with the leading `/` stripped.
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
}

/// One entry of the runtime's container list.
#[derive(Debug, Clone, Default)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub labels: HashMap<String, String>,
}

/// A lifecycle event from the runtime's event stream.
#[derive(Debug, Clone)]
pub struct ContainerEvent {
    /// Runtime action: `start`, `update`, `die`, `kill`, `destroy`, ...
    pub action: String,
    pub id: String,
    pub attributes: HashMap<String, String>,
}

/// Detailed container state from an inspect call.
#[derive(Debug, Clone, Default)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
}

/// Container runtime failure, classified for retry decisions: transient
/// failures are retried with backoff, fatal ones (authentication,
/// unsupported API) stop the watcher.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("transient container runtime failure: {0}")]
    Transient(anyhow::Error),
    #[error("fatal container runtime failure: {0}")]
    Fatal(anyhow::Error),
}

impl RuntimeError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, RuntimeError::Fatal(_))
    }
}

/// The operations the watcher needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// List all containers, running or not.
    async fn list(&self) -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// Open the lifecycle event stream.
    fn events(&self) -> BoxStream<'static, Result<ContainerEvent, RuntimeError>>;

    /// Inspect one container for details the event stream does not carry.
    async fn inspect(&self, id: &str) -> Result<ContainerDetails, RuntimeError>;
}

/// [`ContainerRuntime`] over the Docker Engine API.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect via the default socket, falling back to the environment
    /// (`DOCKER_HOST`, `DOCKER_CERT_PATH`, `DOCKER_TLS_VERIFY`).
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_socket_defaults()
            .or_else(|_| Docker::connect_with_local_defaults())
            .map_err(|err| RuntimeError::Fatal(err.into()))?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(classify)?;

        Ok(containers
            .into_iter()
            .map(|summary| ContainerSummary {
                id: summary.id.unwrap_or_default(),
                names: summary.names.unwrap_or_default(),
                image: summary.image.unwrap_or_default(),
                labels: summary.labels.unwrap_or_default().into_iter().collect(),
            })
            .collect())
    }

    fn events(&self) -> BoxStream<'static, Result<ContainerEvent, RuntimeError>> {
        let options = EventsOptions::<String> {
            filters: HashMap::from([("type".to_string(), vec!["container".to_string()])]),
            ..Default::default()
        };
        self.docker
            .events(Some(options))
            .filter_map(|message| async move {
                match message {
                    Ok(message) => {
                        let action = message.action?;
                        let actor = message.actor?;
                        let id = actor.id?;
                        Some(Ok(ContainerEvent {
                            action,
                            id,
                            attributes: actor.attributes.unwrap_or_default(),
                        }))
                    }
                    Err(err) => Some(Err(classify(err))),
                }
            })
            .boxed()
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
        let response = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(classify)?;
        let config = response.config.unwrap_or_default();
        Ok(ContainerDetails {
            id: response.id.unwrap_or_default(),
            name: response
                .name
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            image: config.image.unwrap_or_default(),
            labels: config.labels.unwrap_or_default().into_iter().collect(),
        })
    }
}

fn classify(err: bollard::errors::Error) -> RuntimeError {
    match &err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. }
            if *status_code == 401 || *status_code == 403 =>
        {
            RuntimeError::Fatal(err.into())
        }
        _ => RuntimeError::Transient(err.into()),
    }
}

/// Injectable time source so that grace-period logic is deterministic in
/// tests.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock [`Clock`].
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Subscription to one kind of container lifecycle event. The watcher
/// closes the channel on shutdown; `recv` returning `None` is the
/// termination signal.
pub struct EventListener {
    rx: mpsc::Receiver<Container>,
}

impl EventListener {
    pub(crate) fn new(rx: mpsc::Receiver<Container>) -> Self {
        Self { rx }
    }

    /// Next container snapshot, or `None` once the watcher shut down.
    pub async fn recv(&mut self) -> Option<Container> {
        self.rx.recv().await
    }

    /// Stop receiving; the watcher drops the sending side on its next
    /// publish.
    pub fn stop(&mut self) {
        self.rx.close();
    }
}
