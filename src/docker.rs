//! Docker implementation of the runtime event source
//!
//! Wraps a bollard client: the event feed and container inspection feed the
//! registry, and `launch_container` backs the management API.

use crate::config::DockerSettings;
use crate::events::{ContainerMetadata, EventSource, RuntimeEvent, SourceError, ACTION_START, STOP_ACTIONS};
use crate::resolver::routing_name;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, EventMessage, HostConfig};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Docker client used both as event source and for launching containers
#[derive(Clone)]
pub struct DockerRuntime {
    client: Docker,
    preferred_network: Option<String>,
}

impl DockerRuntime {
    /// Create a client for the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit `docker.host` setting
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    ///
    /// The daemon does not have to be up yet; an unreachable daemon is
    /// reported and retried by the ingestion loop.
    pub async fn new(settings: &DockerSettings) -> anyhow::Result<Self> {
        let client = if let Some(ref host) = settings.host {
            Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host, e
                )
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker via DOCKER_HOST='{}': {}. \
                     Ensure Docker is running and accessible.",
                    host, e
                )
            })?
        } else {
            Self::connect_with_defaults()?
        };

        match client.ping().await {
            Ok(_) => debug!("Connected to Docker daemon"),
            Err(e) => warn!(error = %e, "Docker daemon is not responding yet; the event feed will keep retrying"),
        }

        Ok(Self {
            client,
            preferred_network: settings.network.clone(),
        })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
            ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
            ("Rancher Desktop", format!("{}/.rd/docker.sock", home)),
            ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
        ];

        for (name, path) in &socket_paths {
            if path.is_empty() || path.starts_with("/.") || path.starts_with("/podman") {
                continue; // Skip paths built from empty env vars
            }
            if std::path::Path::new(path).exists() {
                debug!(path, socket = name, "Found Docker socket");
                match Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION) {
                    Ok(client) => return Ok(client),
                    Err(e) => debug!(path, error = %e, "Docker socket unusable"),
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon: {}\n\n\
                 To fix this:\n\
                 - Start Docker Desktop, Colima, or dockerd\n\
                 - Or set DOCKER_HOST environment variable\n\
                 - Or set docker.host in the configuration",
                e
            )
        })
    }

    /// Pull `image:tag` unless it already exists locally
    pub async fn pull_image_if_missing(&self, image: &str, tag: &str) -> anyhow::Result<()> {
        let reference = format!("{}:{}", image, tag);
        if self.client.inspect_image(&reference).await.is_ok() {
            debug!(image = %reference, "Image exists locally, skipping pull");
            return Ok(());
        }

        info!(image = %reference, "Pulling Docker image");
        let options = CreateImageOptions {
            from_image: image,
            tag,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        let mut last_error = None;

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(image = %reference, status, "Pull progress");
                    }
                    if let Some(error) = info.error {
                        last_error = Some(error);
                    }
                }
                Err(e) => {
                    let err_str = e.to_string();
                    if err_str.contains("manifest unknown") || err_str.contains("not found") {
                        anyhow::bail!(
                            "Image '{}' not found in registry. \
                             Check the image name and tag are correct.",
                            reference
                        );
                    } else if err_str.contains("unauthorized") || err_str.contains("authentication") {
                        anyhow::bail!(
                            "Authentication required to pull '{}'. \
                             Run 'docker login' first or check your credentials.",
                            reference
                        );
                    } else {
                        anyhow::bail!("Failed to pull image '{}': {}", reference, e);
                    }
                }
            }
        }

        if let Some(error) = last_error {
            anyhow::bail!("Failed to pull image '{}': {}", reference, error);
        }

        info!(image = %reference, "Image pulled successfully");
        Ok(())
    }

    /// Pull, create and start a container; returns its routing name.
    ///
    /// The container is created with auto-remove. Routing is picked up from
    /// its start event like any other container.
    pub async fn launch_container(&self, image: &str, tag: &str) -> anyhow::Result<String> {
        self.pull_image_if_missing(image, tag).await?;

        let reference = format!("{}:{}", image, tag);
        let config = Config {
            image: Some(reference.clone()),
            tty: Some(false),
            host_config: Some(HostConfig {
                auto_remove: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self
            .client
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create container from image '{}': {}", reference, e))?;
        let container_id = response.id;

        self.client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                let err_str = e.to_string();
                if err_str.contains("OCI runtime") || err_str.contains("executable file not found") {
                    anyhow::anyhow!(
                        "Container failed to start: the image '{}' may have an invalid entrypoint or command. \
                         Error: {}",
                        reference, e
                    )
                } else {
                    anyhow::anyhow!("Failed to start container {}: {}", container_id, e)
                }
            })?;

        let info = self
            .client
            .inspect_container(&container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to inspect container {}: {}", container_id, e))?;

        let name = info
            .name
            .as_deref()
            .and_then(routing_name)
            .unwrap_or_else(|| container_id.clone());

        info!(container_id, name = %name, image = %reference, "Started Docker container");
        Ok(name)
    }
}

impl EventSource for DockerRuntime {
    fn subscribe(&self, since: Option<i64>) -> BoxStream<'static, Result<RuntimeEvent, SourceError>> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        let mut actions = vec![ACTION_START.to_string()];
        actions.extend(STOP_ACTIONS.iter().map(|a| a.to_string()));
        filters.insert("event".to_string(), actions);

        let options = EventsOptions::<String> {
            since: since.map(|t| t.to_string()),
            filters,
            ..Default::default()
        };

        self.client
            .events(Some(options))
            .map(|result| {
                result
                    .map(runtime_event)
                    .map_err(|e| SourceError::Stream(e.to_string()))
            })
            .boxed()
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerMetadata, SourceError> {
        match self
            .client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(metadata_from_inspect(info, self.preferred_network.as_deref())),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(SourceError::NotFound(container_id.to_string())),
            Err(e) => Err(SourceError::Inspect {
                id: container_id.to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn running(&self) -> Result<Vec<String>, SourceError> {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| SourceError::Connect(e.to_string()))?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}

/// Convert a Docker event message into a runtime event
fn runtime_event(message: EventMessage) -> RuntimeEvent {
    let (container_id, name) = match message.actor {
        Some(actor) => {
            let name = actor
                .attributes
                .as_ref()
                .and_then(|attrs| attrs.get("name").cloned());
            (actor.id, name)
        }
        None => (None, None),
    };

    RuntimeEvent {
        category: message.typ.map(|t| t.to_string()).unwrap_or_default(),
        action: message.action.unwrap_or_default(),
        container_id,
        name,
        time: message.time,
    }
}

/// Reduce a Docker inspect response to routing metadata
///
/// Address preference: the configured network, then the default bridge
/// address, then the first attached network by name. Docker serializes
/// `ExposedPorts` as a JSON object with sorted keys; bollard decodes it into
/// a map, so the keys are sorted again to recover the reported order.
fn metadata_from_inspect(info: ContainerInspectResponse, preferred_network: Option<&str>) -> ContainerMetadata {
    let address = info.network_settings.as_ref().and_then(|settings| {
        let networks = settings.networks.as_ref();
        let non_empty = |ip: Option<&String>| ip.filter(|ip| !ip.is_empty()).cloned();

        let preferred = preferred_network
            .and_then(|name| networks.and_then(|n| n.get(name)))
            .and_then(|endpoint| non_empty(endpoint.ip_address.as_ref()));

        preferred
            .or_else(|| non_empty(settings.ip_address.as_ref()))
            .or_else(|| {
                let mut attached: Vec<_> = networks?.iter().collect();
                attached.sort_by(|a, b| a.0.cmp(b.0));
                attached
                    .into_iter()
                    .find_map(|(_, endpoint)| non_empty(endpoint.ip_address.as_ref()))
            })
    });

    let mut declared_ports: Vec<String> = info
        .config
        .and_then(|c| c.exposed_ports)
        .map(|ports| ports.into_keys().collect())
        .unwrap_or_default();
    declared_ports.sort();

    ContainerMetadata {
        id: info.id.unwrap_or_default(),
        name: info.name,
        address,
        declared_ports,
    }
}
