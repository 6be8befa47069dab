use std::{collections::HashMap, net::Ipv4Addr, sync::Arc};

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use typed_builder::TypedBuilder;

use crate::{CyroidError, CyroidResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The subset of the Docker Engine API the orchestrator drives.
///
/// One implementation talks to the host daemon; others are created per range by a
/// [`DockerConnector`] and talk to the nested daemon inside a sandbox.
#[async_trait]
pub trait DockerApi: Send + Sync {
    /// Checks that the daemon answers.
    async fn ping(&self) -> CyroidResult<()>;

    /// Whether the image is present in the local cache.
    async fn image_exists(&self, image: &str) -> CyroidResult<bool>;

    /// The architecture recorded on a cached image.
    async fn image_architecture(&self, image: &str) -> CyroidResult<Option<String>>;

    /// Pulls an image.
    async fn pull_image(&self, image: &str) -> CyroidResult<()>;

    /// Creates a network and returns its id.
    async fn create_network(&self, spec: &NetworkSpec) -> CyroidResult<String>;

    /// Inspects a network by name or id.
    async fn inspect_network(&self, name_or_id: &str) -> CyroidResult<NetworkInfo>;

    /// Lists networks carrying `label` (`key=value` or `key`).
    async fn list_networks(&self, label: Option<&str>) -> CyroidResult<Vec<NetworkInfo>>;

    /// Removes a network.
    async fn remove_network(&self, name_or_id: &str) -> CyroidResult<()>;

    /// Connects a container to a network, optionally at a fixed address.
    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        ipv4_address: Option<Ipv4Addr>,
    ) -> CyroidResult<()>;

    /// Disconnects a container from a network.
    async fn disconnect_network(&self, network: &str, container: &str, force: bool)
        -> CyroidResult<()>;

    /// Creates a named volume.
    async fn create_volume(&self, name: &str, labels: &HashMap<String, String>) -> CyroidResult<()>;

    /// Removes a named volume.
    async fn remove_volume(&self, name: &str, force: bool) -> CyroidResult<()>;

    /// Creates a container and returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> CyroidResult<String>;

    /// Starts a container.
    async fn start_container(&self, id: &str) -> CyroidResult<()>;

    /// Stops a container with a grace period.
    async fn stop_container(&self, id: &str, timeout_secs: i64) -> CyroidResult<()>;

    /// Removes a container.
    async fn remove_container(&self, id: &str, force: bool) -> CyroidResult<()>;

    /// Inspects a container by name or id.
    async fn inspect_container(&self, id: &str) -> CyroidResult<ContainerInfo>;

    /// Lists containers, running or not, carrying `label` (`key=value` or `key`).
    async fn list_containers(&self, label: &str) -> CyroidResult<Vec<ContainerInfo>>;

    /// Runs a command in a container and collects its combined output.
    async fn exec(&self, container: &str, cmd: &[String], privileged: bool)
        -> CyroidResult<ExecOutput>;

    /// Returns the last `tail` lines of a container's logs.
    async fn logs(&self, container: &str, tail: usize) -> CyroidResult<String>;

    /// Returns a single resource usage sample.
    async fn stats(&self, container: &str) -> CyroidResult<ContainerStats>;

    /// Stops then starts a container.
    async fn restart_container(&self, id: &str, timeout_secs: i64) -> CyroidResult<()> {
        self.stop_container(id, timeout_secs).await?;
        self.start_container(id).await
    }
}

/// Turns a daemon url into a client.
pub trait DockerConnector: Send + Sync {
    /// Connects to the daemon at `url` (`tcp://host:port`).
    fn connect(&self, url: &str) -> CyroidResult<Arc<dyn DockerApi>>;
}

/// A network to create.
#[derive(Debug, Clone, PartialEq, TypedBuilder)]
pub struct NetworkSpec {
    /// The network name.
    #[builder(setter(into))]
    pub name: String,

    /// The IPAM subnet.
    pub subnet: Ipv4Network,

    /// The IPAM gateway Docker assigns to its bridge.
    #[builder(default, setter(strip_option))]
    pub gateway: Option<Ipv4Addr>,

    /// Whether the network has no route out.
    #[builder(default)]
    pub internal: bool,

    /// Labels.
    #[builder(default)]
    pub labels: HashMap<String, String>,
}

/// A container attached to a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEndpoint {
    /// The container id.
    pub container_id: String,

    /// The container name.
    pub name: String,

    /// The address on the network.
    pub ipv4_address: Option<Ipv4Addr>,
}

/// An inspected network.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkInfo {
    /// The full network id.
    pub id: String,

    /// The network name.
    pub name: String,

    /// The IPAM subnet.
    pub subnet: Option<Ipv4Network>,

    /// The IPAM gateway.
    pub gateway: Option<Ipv4Addr>,

    /// Attached containers.
    pub endpoints: Vec<NetworkEndpoint>,

    /// Labels.
    pub labels: HashMap<String, String>,
}

/// A container to create.
#[derive(Debug, Clone, PartialEq, TypedBuilder)]
pub struct ContainerSpec {
    /// The container name.
    #[builder(setter(into))]
    pub name: String,

    /// The image reference.
    #[builder(setter(into))]
    pub image: String,

    /// The hostname.
    #[builder(default, setter(strip_option, into))]
    pub hostname: Option<String>,

    /// Environment in `KEY=VALUE` form.
    #[builder(default)]
    pub env: Vec<String>,

    /// Command override.
    #[builder(default, setter(strip_option))]
    pub cmd: Option<Vec<String>>,

    /// Labels.
    #[builder(default)]
    pub labels: HashMap<String, String>,

    /// Whether the container runs privileged.
    #[builder(default)]
    pub privileged: bool,

    /// Added capabilities.
    #[builder(default)]
    pub cap_add: Vec<String>,

    /// Namespaced sysctls.
    #[builder(default)]
    pub sysctls: HashMap<String, String>,

    /// Host devices passed through, `host_path:container_path`.
    #[builder(default)]
    pub devices: Vec<String>,

    /// Bind mounts and named volumes, `source:target[:mode]`.
    #[builder(default)]
    pub binds: Vec<String>,

    /// Memory limit in bytes.
    #[builder(default, setter(strip_option))]
    pub memory_bytes: Option<i64>,

    /// CPU limit in units of 1e-9 CPUs.
    #[builder(default, setter(strip_option))]
    pub nano_cpus: Option<i64>,

    /// The network attached at creation.
    #[builder(default, setter(strip_option, into))]
    pub network: Option<String>,

    /// The fixed address on `network`.
    #[builder(default, setter(strip_option))]
    pub ipv4_address: Option<Ipv4Addr>,

    /// DNS servers.
    #[builder(default)]
    pub dns: Vec<Ipv4Addr>,

    /// Shared memory size in bytes.
    #[builder(default, setter(strip_option))]
    pub shm_size: Option<i64>,

    /// Container ports exposed to the sandbox namespace, published on the same host port.
    #[builder(default)]
    pub published_ports: Vec<u16>,
}

/// An inspected or listed container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerInfo {
    /// The full container id.
    pub id: String,

    /// The container name without the leading slash.
    pub name: String,

    /// The image reference.
    pub image: String,

    /// Whether the container is running.
    pub running: bool,

    /// The daemon-reported state (`running`, `exited`...).
    pub state: String,

    /// Labels.
    pub labels: HashMap<String, String>,

    /// Address per attached network name.
    pub networks: HashMap<String, Option<Ipv4Addr>>,
}

/// The result of an exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// The exit code, `-1` when the daemon did not report one.
    pub exit_code: i64,

    /// Interleaved stdout and stderr.
    pub output: String,
}

/// A resource usage sample.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ContainerStats {
    /// CPU usage across all cores in percent.
    pub cpu_percent: f64,

    /// Memory usage in bytes.
    pub memory_usage: u64,

    /// Memory limit in bytes.
    pub memory_limit: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ExecOutput {
    /// Whether the command exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turns a non-zero exit into [`CyroidError::CommandFailed`] carrying the full output.
    pub fn check(self, command: impl Into<String>) -> CyroidResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(CyroidError::CommandFailed {
                command: command.into(),
                exit_code: self.exit_code,
                output: self.output,
            })
        }
    }
}

impl ContainerInfo {
    /// The address on `network`.
    pub fn ip_on(&self, network: &str) -> Option<Ipv4Addr> {
        self.networks.get(network).copied().flatten()
    }
}

impl NetworkInfo {
    /// The first twelve characters of the id.
    pub fn short_id(&self) -> &str {
        let end = self
            .id
            .char_indices()
            .nth(12)
            .map(|(i, _)| i)
            .unwrap_or(self.id.len());
        &self.id[..end]
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
