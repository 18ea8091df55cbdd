//! Container runtime event source contract
//!
//! The ingestion loop only talks to the runtime through [`EventSource`], which
//! keeps the registry pipeline independent of Docker and testable with a
//! scripted source.

use futures::stream::BoxStream;
use std::future::Future;

/// Runtime event category for container lifecycle events
pub const CATEGORY_CONTAINER: &str = "container";

/// Action emitted when a container begins running
pub const ACTION_START: &str = "start";

/// Actions that mean a container no longer serves traffic
pub const STOP_ACTIONS: [&str; 3] = ["die", "stop", "destroy"];

/// A single lifecycle notification from the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    /// Object category ("container", "network", "image", ...)
    pub category: String,
    /// Action verb ("start", "die", "health_status: healthy", ...)
    pub action: String,
    /// Id of the object the event is about
    pub container_id: Option<String>,
    /// Container name, when the runtime attaches one to the event
    pub name: Option<String>,
    /// Unix time (seconds) the runtime recorded the event at
    pub time: Option<i64>,
}

impl RuntimeEvent {
    pub fn container(action: &str, container_id: &str) -> Self {
        Self {
            category: CATEGORY_CONTAINER.to_string(),
            action: action.to_string(),
            container_id: Some(container_id.to_string()),
            name: None,
            time: None,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    fn is_container(&self) -> bool {
        self.category == CATEGORY_CONTAINER
    }

    /// Container started: the trigger for registration
    pub fn is_container_start(&self) -> bool {
        self.is_container() && self.action == ACTION_START
    }

    /// Container stopped, died or was removed
    pub fn is_container_stop(&self) -> bool {
        self.is_container() && STOP_ACTIONS.contains(&self.action.as_str())
    }
}

/// Inspection metadata for one container, reduced to the fields routing needs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerMetadata {
    /// Container id
    pub id: String,
    /// Primary name as reported by the runtime (usually with a leading `/`)
    pub name: Option<String>,
    /// Private network address, if one has been assigned
    pub address: Option<String>,
    /// Declared exposed ports (`"8080/tcp"`, `"53/udp"`), in runtime order
    pub declared_ports: Vec<String>,
}

/// Errors surfaced by an event source
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Could not reach the runtime at all
    #[error("failed to connect to container runtime: {0}")]
    Connect(String),
    /// The event feed failed mid-stream
    #[error("event stream error: {0}")]
    Stream(String),
    /// The container disappeared before it could be inspected
    #[error("container {0} not found")]
    NotFound(String),
    /// Inspection failed for another reason
    #[error("failed to inspect container {id}: {message}")]
    Inspect { id: String, message: String },
}

/// Push-based feed of runtime events plus lookup by container id
pub trait EventSource: Send + Sync + 'static {
    /// Open a new event subscription.
    ///
    /// With `since` (unix seconds) the runtime first replays events recorded
    /// from that time on, then streams new ones. The stream may end or yield
    /// an error at any time; the caller decides whether to resubscribe.
    fn subscribe(&self, since: Option<i64>) -> BoxStream<'static, Result<RuntimeEvent, SourceError>>;

    /// Fetch routing metadata for one container
    fn inspect(
        &self,
        container_id: &str,
    ) -> impl Future<Output = Result<ContainerMetadata, SourceError>> + Send;

    /// Ids of the containers running right now
    fn running(&self) -> impl Future<Output = Result<Vec<String>, SourceError>> + Send;
}
