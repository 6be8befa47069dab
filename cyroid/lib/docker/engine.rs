use std::{collections::HashMap, net::Ipv4Addr, sync::Arc};

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
        LogsOptions, NetworkingConfig, RemoveContainerOptions, StartContainerOptions, StatsOptions,
        StopContainerOptions,
    },
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::{
        DeviceMapping, EndpointIpamConfig, EndpointSettings, HostConfig, Ipam, IpamConfig,
        PortBinding,
    },
    network::{
        ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions,
        InspectNetworkOptions, ListNetworksOptions,
    },
    volume::{CreateVolumeOptions, RemoveVolumeOptions},
    Docker, API_DEFAULT_VERSION,
};
use futures::{StreamExt, TryStreamExt};

use crate::{CyroidError, CyroidResult};

use super::{
    ContainerInfo, ContainerSpec, ContainerStats, DockerApi, DockerConnector, ExecOutput,
    NetworkEndpoint, NetworkInfo, NetworkSpec,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Request timeout for daemon connections, in seconds.
pub const DEFAULT_DOCKER_TIMEOUT_SECS: u64 = 120;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// [`DockerApi`] over a `bollard` client.
#[derive(Clone)]
pub struct BollardDocker {
    docker: Docker,
}

/// Connects to nested daemons over plain TCP.
#[derive(Debug, Clone)]
pub struct BollardConnector {
    timeout_secs: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl BollardDocker {
    /// Wraps an existing client.
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connects to the host daemon using the platform defaults (`DOCKER_HOST` or the local socket).
    pub fn connect_local() -> CyroidResult<Self> {
        Ok(Self::new(Docker::connect_with_local_defaults()?))
    }

    /// Connects to a daemon over TCP, `tcp://host:port`.
    pub fn connect_http(url: &str, timeout_secs: u64) -> CyroidResult<Self> {
        Ok(Self::new(Docker::connect_with_http(
            url,
            timeout_secs,
            API_DEFAULT_VERSION,
        )?))
    }
}

impl BollardConnector {
    /// Creates a connector with the given request timeout.
    pub fn new(timeout_secs: u64) -> Self {
        Self { timeout_secs }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl DockerApi for BollardDocker {
    async fn ping(&self) -> CyroidResult<()> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> CyroidResult<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) => match docker_error(e, image) {
                CyroidError::NotFound(_) => Ok(false),
                e => Err(e),
            },
        }
    }

    async fn image_architecture(&self, image: &str) -> CyroidResult<Option<String>> {
        let inspect = self
            .docker
            .inspect_image(image)
            .await
            .map_err(|e| docker_error(e, image))?;
        Ok(inspect.architecture)
    }

    async fn pull_image(&self, image: &str) -> CyroidResult<()> {
        let (repo, tag) = split_image_reference(image);
        tracing::info!(image, "pulling image");

        self.docker
            .create_image(
                Some(CreateImageOptions {
                    from_image: repo.to_string(),
                    tag: tag.to_string(),
                    ..Default::default()
                }),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| docker_error(e, image))?;

        Ok(())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> CyroidResult<String> {
        let options = CreateNetworkOptions {
            name: spec.name.clone(),
            check_duplicate: true,
            driver: "bridge".to_string(),
            internal: spec.internal,
            ipam: Ipam {
                config: Some(vec![IpamConfig {
                    subnet: Some(spec.subnet.to_string()),
                    gateway: spec.gateway.map(|g| g.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            labels: spec.labels.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_network(options)
            .await
            .map_err(|e| docker_error(e, &spec.name))?;

        Ok(response.id)
    }

    async fn inspect_network(&self, name_or_id: &str) -> CyroidResult<NetworkInfo> {
        let network = self
            .docker
            .inspect_network(name_or_id, None::<InspectNetworkOptions<String>>)
            .await
            .map_err(|e| docker_error(e, name_or_id))?;

        Ok(network_info(network))
    }

    async fn list_networks(&self, label: Option<&str>) -> CyroidResult<Vec<NetworkInfo>> {
        let mut filters = HashMap::new();
        if let Some(label) = label {
            filters.insert("label".to_string(), vec![label.to_string()]);
        }

        let networks = self
            .docker
            .list_networks(Some(ListNetworksOptions { filters }))
            .await?;

        Ok(networks.into_iter().map(network_info).collect())
    }

    async fn remove_network(&self, name_or_id: &str) -> CyroidResult<()> {
        self.docker
            .remove_network(name_or_id)
            .await
            .map_err(|e| docker_error(e, name_or_id))
    }

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        ipv4_address: Option<Ipv4Addr>,
    ) -> CyroidResult<()> {
        let endpoint_config = EndpointSettings {
            ipam_config: ipv4_address.map(|ip| EndpointIpamConfig {
                ipv4_address: Some(ip.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.docker
            .connect_network(
                network,
                ConnectNetworkOptions {
                    container: container.to_string(),
                    endpoint_config,
                },
            )
            .await
            .map_err(|e| docker_error(e, network))
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
        force: bool,
    ) -> CyroidResult<()> {
        self.docker
            .disconnect_network(
                network,
                DisconnectNetworkOptions {
                    container: container.to_string(),
                    force,
                },
            )
            .await
            .map_err(|e| docker_error(e, network))
    }

    async fn create_volume(&self, name: &str, labels: &HashMap<String, String>) -> CyroidResult<()> {
        self.docker
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                driver: "local".to_string(),
                labels: labels.clone(),
                ..Default::default()
            })
            .await
            .map_err(|e| docker_error(e, name))?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str, force: bool) -> CyroidResult<()> {
        self.docker
            .remove_volume(name, Some(RemoveVolumeOptions { force }))
            .await
            .map_err(|e| docker_error(e, name))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> CyroidResult<String> {
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                container_config(spec),
            )
            .await
            .map_err(|e| docker_error(e, &spec.name))?;

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> CyroidResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| docker_error(e, id))
    }

    async fn stop_container(&self, id: &str, timeout_secs: i64) -> CyroidResult<()> {
        match self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: timeout_secs }))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(docker_error(e, id)),
        }
    }

    async fn remove_container(&self, id: &str, force: bool) -> CyroidResult<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| docker_error(e, id))
    }

    async fn inspect_container(&self, id: &str) -> CyroidResult<ContainerInfo> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| docker_error(e, id))?;

        let state = inspect.state.unwrap_or_default();
        let config = inspect.config.unwrap_or_default();
        let networks = inspect
            .network_settings
            .and_then(|s| s.networks)
            .unwrap_or_default();

        Ok(ContainerInfo {
            id: inspect.id.unwrap_or_default(),
            name: inspect
                .name
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            image: config.image.unwrap_or_default(),
            running: state.running.unwrap_or(false),
            state: state.status.map(|s| s.to_string()).unwrap_or_default(),
            labels: config.labels.unwrap_or_default(),
            networks: endpoint_addresses(networks),
        })
    }

    async fn list_containers(&self, label: &str) -> CyroidResult<Vec<ContainerInfo>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .map(|c| {
                let state = c.state.unwrap_or_default();
                ContainerInfo {
                    id: c.id.unwrap_or_default(),
                    name: c
                        .names
                        .and_then(|n| n.into_iter().next())
                        .unwrap_or_default()
                        .trim_start_matches('/')
                        .to_string(),
                    image: c.image.unwrap_or_default(),
                    running: state == "running",
                    state,
                    labels: c.labels.unwrap_or_default(),
                    networks: endpoint_addresses(
                        c.network_settings
                            .and_then(|s| s.networks)
                            .unwrap_or_default(),
                    ),
                }
            })
            .collect())
    }

    async fn exec(
        &self,
        container: &str,
        cmd: &[String],
        privileged: bool,
    ) -> CyroidResult<ExecOutput> {
        let created = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    privileged: Some(privileged),
                    cmd: Some(cmd.to_vec()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| docker_error(e, container))?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut stream, .. } =
            self.docker.start_exec(&created.id, None).await?
        {
            while let Some(chunk) = stream.next().await {
                append_log(&mut output, chunk?);
            }
        }

        let inspect = self.docker.inspect_exec(&created.id).await?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            output,
        })
    }

    async fn logs(&self, container: &str, tail: usize) -> CyroidResult<String> {
        let mut stream = Box::pin(self.docker.logs(
            container,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                ..Default::default()
            }),
        ));

        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            append_log(&mut output, chunk.map_err(|e| docker_error(e, container))?);
        }

        Ok(output)
    }

    async fn stats(&self, container: &str) -> CyroidResult<ContainerStats> {
        let mut stream = Box::pin(self.docker.stats(
            container,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        ));

        let Some(sample) = stream.next().await else {
            return Ok(ContainerStats::default());
        };
        let sample = sample.map_err(|e| docker_error(e, container))?;

        let cpu_delta = sample
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(sample.precpu_stats.cpu_usage.total_usage);
        let system_delta = sample
            .cpu_stats
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(sample.precpu_stats.system_cpu_usage.unwrap_or(0));
        let cpus = sample.cpu_stats.online_cpus.unwrap_or(1) as f64;

        let cpu_percent = if system_delta > 0 {
            (cpu_delta as f64 / system_delta as f64) * cpus * 100.0
        } else {
            0.0
        };

        Ok(ContainerStats {
            cpu_percent,
            memory_usage: sample.memory_stats.usage.unwrap_or(0),
            memory_limit: sample.memory_stats.limit.unwrap_or(0),
        })
    }
}

impl DockerConnector for BollardConnector {
    fn connect(&self, url: &str) -> CyroidResult<Arc<dyn DockerApi>> {
        Ok(Arc::new(BollardDocker::connect_http(url, self.timeout_secs)?))
    }
}

impl Default for BollardConnector {
    fn default() -> Self {
        Self::new(DEFAULT_DOCKER_TIMEOUT_SECS)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Maps 404 and 409 daemon responses onto the idempotency-aware variants.
fn docker_error(error: bollard::errors::Error, subject: &str) -> CyroidError {
    match error {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => CyroidError::NotFound(format!("{subject}: {message}")),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => CyroidError::AlreadyExists(format!("{subject}: {message}")),
        e => CyroidError::Docker(e),
    }
}

/// Splits `repo[:tag]`, defaulting the tag to `latest` so pulls never fetch every tag.
fn split_image_reference(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }

    let last_segment_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[last_segment_start..].rfind(':') {
        Some(i) => {
            let split = last_segment_start + i;
            (&image[..split], &image[split + 1..])
        }
        None => (image, "latest"),
    }
}

fn network_info(network: bollard::models::Network) -> NetworkInfo {
    let ipam_config = network
        .ipam
        .and_then(|ipam| ipam.config)
        .and_then(|configs| configs.into_iter().next())
        .unwrap_or_default();

    let endpoints = network
        .containers
        .unwrap_or_default()
        .into_iter()
        .map(|(container_id, c)| NetworkEndpoint {
            container_id,
            name: c.name.unwrap_or_default(),
            ipv4_address: c.ipv4_address.as_deref().and_then(parse_cidr_address),
        })
        .collect();

    NetworkInfo {
        id: network.id.unwrap_or_default(),
        name: network.name.unwrap_or_default(),
        subnet: ipam_config.subnet.and_then(|s| s.parse().ok()),
        gateway: ipam_config.gateway.and_then(|g| g.parse().ok()),
        endpoints,
        labels: network.labels.unwrap_or_default(),
    }
}

fn endpoint_addresses(
    networks: HashMap<String, EndpointSettings>,
) -> HashMap<String, Option<Ipv4Addr>> {
    networks
        .into_iter()
        .map(|(name, endpoint)| {
            let ip = endpoint
                .ip_address
                .filter(|ip| !ip.is_empty())
                .and_then(|ip| ip.parse().ok());
            (name, ip)
        })
        .collect()
}

/// Parses `10.0.0.2/24` or `10.0.0.2`.
fn parse_cidr_address(value: &str) -> Option<Ipv4Addr> {
    value.split('/').next().and_then(|ip| ip.parse().ok())
}

fn append_log(output: &mut String, log: LogOutput) {
    match log {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::Console { message } => output.push_str(&String::from_utf8_lossy(&message)),
        LogOutput::StdIn { .. } => {}
    }
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    let endpoints_config = spec
        .network
        .as_ref()
        .map(|network| {
            let endpoint = EndpointSettings {
                ipam_config: spec.ipv4_address.map(|ip| EndpointIpamConfig {
                    ipv4_address: Some(ip.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            };
            HashMap::from([(network.clone(), endpoint)])
        })
        .unwrap_or_default();

    let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
        .published_ports
        .iter()
        .map(|port| (format!("{port}/tcp"), HashMap::new()))
        .collect();

    let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
        .published_ports
        .iter()
        .map(|port| {
            (
                format!("{port}/tcp"),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(port.to_string()),
                }]),
            )
        })
        .collect();

    let devices = spec
        .devices
        .iter()
        .map(|device| {
            let (host, container) = device
                .split_once(':')
                .unwrap_or((device.as_str(), device.as_str()));
            DeviceMapping {
                path_on_host: Some(host.to_string()),
                path_in_container: Some(container.to_string()),
                cgroup_permissions: Some("rwm".to_string()),
            }
        })
        .collect::<Vec<_>>();

    let host_config = HostConfig {
        privileged: Some(spec.privileged),
        cap_add: (!spec.cap_add.is_empty()).then(|| spec.cap_add.clone()),
        sysctls: (!spec.sysctls.is_empty()).then(|| spec.sysctls.clone()),
        devices: (!devices.is_empty()).then_some(devices),
        binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
        memory: spec.memory_bytes,
        nano_cpus: spec.nano_cpus,
        network_mode: spec.network.clone(),
        dns: (!spec.dns.is_empty()).then(|| spec.dns.iter().map(|d| d.to_string()).collect()),
        shm_size: spec.shm_size,
        port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        hostname: spec.hostname.clone(),
        env: (!spec.env.is_empty()).then(|| spec.env.clone()),
        cmd: spec.cmd.clone(),
        labels: Some(spec.labels.clone()),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        host_config: Some(host_config),
        networking_config: spec
            .network
            .as_ref()
            .map(|_| NetworkingConfig { endpoints_config }),
        ..Default::default()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_image_reference() {
        assert_eq!(split_image_reference("nginx"), ("nginx", "latest"));
        assert_eq!(split_image_reference("nginx:alpine"), ("nginx", "alpine"));
        assert_eq!(
            split_image_reference("registry:5000/team/img"),
            ("registry:5000/team/img", "latest")
        );
        assert_eq!(
            split_image_reference("registry:5000/team/img:1.2"),
            ("registry:5000/team/img", "1.2")
        );
    }

    #[test]
    fn test_docker_error_mapping() {
        let err = docker_error(
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message: "no such network".into(),
            },
            "lan",
        );
        assert!(matches!(err, CyroidError::NotFound(ref m) if m.contains("lan")));

        let err = docker_error(
            bollard::errors::Error::DockerResponseServerError {
                status_code: 500,
                message: "boom".into(),
            },
            "lan",
        );
        assert!(matches!(err, CyroidError::Docker(_)));
    }

    #[test]
    fn test_container_config_attaches_network_at_address() {
        let spec = ContainerSpec::builder()
            .name("cyroid-ws01")
            .image("alpine:3")
            .network("lan")
            .ipv4_address(Ipv4Addr::new(10, 0, 1, 10))
            .published_ports(vec![15900])
            .build();

        let config = container_config(&spec);
        let endpoints = config.networking_config.unwrap().endpoints_config;
        let ipam = endpoints["lan"].ipam_config.clone().unwrap();
        assert_eq!(ipam.ipv4_address.as_deref(), Some("10.0.1.10"));

        let host = config.host_config.unwrap();
        assert_eq!(host.network_mode.as_deref(), Some("lan"));
        assert!(host.port_bindings.unwrap().contains_key("15900/tcp"));
    }

    #[test]
    fn test_parse_cidr_address() {
        assert_eq!(
            parse_cidr_address("10.10.0.2/24"),
            Some(Ipv4Addr::new(10, 10, 0, 2))
        );
        assert_eq!(parse_cidr_address(""), None);
    }
}
