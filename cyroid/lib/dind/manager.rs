use std::{collections::HashMap, net::Ipv4Addr, sync::Arc};

use tokio::time::{self, Instant};
use uuid::Uuid;

use crate::{
    config::{DindSettings, DEFAULT_DIND_DATA_PATH},
    docker::{ContainerInfo, ContainerSpec, DockerApi, ExecOutput, NetworkSpec},
    models::DindSandbox,
    utils::{
        dind_container_name, dind_volume_name, range_label_filter, LABEL_RANGE_ID,
        LABEL_RANGE_NAME, LABEL_ROLE, ROLE_DIND,
    },
    CyroidError, CyroidResult,
};

use super::RangeClientRegistry;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Creates, locates and removes range sandboxes on the host daemon.
pub struct DindManager {
    host: Arc<dyn DockerApi>,
    registry: Arc<RangeClientRegistry>,
    settings: DindSettings,
}

/// A sandbox found on the host.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSummary {
    /// The range the sandbox belongs to.
    pub range_id: Uuid,

    /// The container id.
    pub container_id: String,

    /// The container name.
    pub container_name: String,

    /// Whether the container is running.
    pub running: bool,

    /// The address on the ranges bridge.
    pub management_ip: Option<Ipv4Addr>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DindManager {
    /// Creates a manager over the host daemon.
    pub fn new(
        host: Arc<dyn DockerApi>,
        registry: Arc<RangeClientRegistry>,
        settings: DindSettings,
    ) -> Self {
        Self {
            host,
            registry,
            settings,
        }
    }

    /// The host daemon client.
    pub fn host(&self) -> &Arc<dyn DockerApi> {
        &self.host
    }

    /// The nested-daemon client registry.
    pub fn registry(&self) -> &Arc<RangeClientRegistry> {
        &self.registry
    }

    /// The sandbox settings.
    pub fn settings(&self) -> &DindSettings {
        &self.settings
    }

    /// Creates the sandbox of a range and waits for its nested daemon.
    ///
    /// Fails with [`CyroidError::Timeout`] if the nested daemon does not answer within the
    /// configured startup timeout.
    pub async fn create_range_container(
        &self,
        range_id: Uuid,
        range_name: Option<&str>,
        memory_limit: Option<i64>,
        cpu_limit: Option<f64>,
    ) -> CyroidResult<DindSandbox> {
        self.ensure_image().await?;
        self.ensure_ranges_network().await?;

        let volume_name = dind_volume_name(&range_id);
        let container_name = dind_container_name(&range_id, range_name);

        let mut labels = HashMap::from([
            (LABEL_RANGE_ID.to_string(), range_id.to_string()),
            (LABEL_ROLE.to_string(), ROLE_DIND.to_string()),
        ]);

        match self.host.create_volume(&volume_name, &labels).await {
            Err(e) if e.is_already_exists() => {
                tracing::debug!(%range_id, volume = %volume_name, "sandbox volume already exists");
            }
            result => result?,
        }

        if let Some(name) = range_name {
            labels.insert(LABEL_RANGE_NAME.to_string(), name.to_string());
        }

        let port = self.settings.get_docker_port();
        let mut spec = ContainerSpec::builder()
            .name(container_name.clone())
            .image(self.settings.get_image().clone())
            .hostname(container_name.clone())
            .env(vec!["DOCKER_TLS_CERTDIR=".to_string()])
            .cmd(vec![
                "dockerd".to_string(),
                format!("--host=tcp://0.0.0.0:{port}"),
                "--host=unix:///var/run/docker.sock".to_string(),
                "--tls=false".to_string(),
            ])
            .labels(labels)
            .privileged(true)
            .binds(vec![format!("{volume_name}:{DEFAULT_DIND_DATA_PATH}")])
            .network(self.settings.get_ranges_network_name().clone())
            .build();
        spec.memory_bytes = memory_limit.or(*self.settings.get_memory_limit());
        spec.nano_cpus = cpu_limit
            .or(*self.settings.get_cpu_limit())
            .map(|cpus| (cpus * 1e9) as i64);

        let container_id = self.host.create_container(&spec).await?;
        self.host.start_container(&container_id).await?;

        let management_ip = self.management_ip_of(&container_id).await?;
        let docker_url = format!("tcp://{management_ip}:{port}");

        tracing::info!(%range_id, container = %container_name, %docker_url, "waiting for sandbox daemon");
        let client = self.wait_for_docker_ready(&docker_url).await?;
        self.registry.insert(range_id, &docker_url, client).await;

        tracing::info!(%range_id, container = %container_name, "sandbox ready");
        Ok(DindSandbox {
            container_id,
            container_name,
            management_ip,
            docker_url,
            volume_name,
        })
    }

    /// Removes the sandbox of a range and its data volume. Absent artifacts are not an error.
    pub async fn delete_range_container(&self, range_id: Uuid) -> CyroidResult<()> {
        self.registry.close(range_id).await;

        match self.find_container(range_id).await? {
            Some(container) => {
                if let Err(e) = self
                    .host
                    .stop_container(&container.id, *self.settings.get_stop_timeout_secs())
                    .await
                {
                    tracing::warn!(%range_id, error = %e, "failed to stop sandbox before removal");
                }

                match self.host.remove_container(&container.id, true).await {
                    Err(e) if e.is_not_found() => {
                        tracing::debug!(%range_id, "sandbox container already gone");
                    }
                    result => result?,
                }
                tracing::info!(%range_id, container = %container.name, "sandbox removed");
            }
            None => tracing::debug!(%range_id, "no sandbox container to remove"),
        }

        let volume_name = dind_volume_name(&range_id);
        match self.host.remove_volume(&volume_name, true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                tracing::debug!(%range_id, volume = %volume_name, "sandbox volume already gone");
            }
            Err(e) => {
                tracing::warn!(%range_id, volume = %volume_name, error = %e, "failed to remove sandbox volume");
            }
        }

        Ok(())
    }

    /// Describes the sandbox of a range, or `None` if it has none or it is not attached to the
    /// ranges bridge.
    pub async fn get_container_info(&self, range_id: Uuid) -> CyroidResult<Option<DindSandbox>> {
        let Some(container) = self.find_container(range_id).await? else {
            return Ok(None);
        };

        let info = self.host.inspect_container(&container.id).await?;
        let Some(management_ip) = info.ip_on(self.settings.get_ranges_network_name()) else {
            return Ok(None);
        };

        Ok(Some(DindSandbox {
            container_id: info.id,
            container_name: info.name,
            management_ip,
            docker_url: format!("tcp://{management_ip}:{}", self.settings.get_docker_port()),
            volume_name: dind_volume_name(&range_id),
        }))
    }

    /// Returns the cached nested-daemon client of a range.
    pub async fn get_range_client(
        &self,
        range_id: Uuid,
        docker_url: &str,
    ) -> CyroidResult<Arc<dyn DockerApi>> {
        self.registry.get_or_connect(range_id, docker_url).await
    }

    /// Starts an existing sandbox and waits for its nested daemon.
    pub async fn start_range_container(&self, range_id: Uuid) -> CyroidResult<DindSandbox> {
        let container = self.require_container(range_id).await?;
        self.host.start_container(&container.id).await?;
        self.await_sandbox(range_id, &container.id).await
    }

    /// Stops a sandbox and evicts its cached client.
    pub async fn stop_range_container(&self, range_id: Uuid) -> CyroidResult<()> {
        self.registry.close(range_id).await;
        let container = self.require_container(range_id).await?;
        self.host
            .stop_container(&container.id, *self.settings.get_stop_timeout_secs())
            .await?;
        tracing::info!(%range_id, "sandbox stopped");
        Ok(())
    }

    /// Restarts a sandbox and waits for its nested daemon.
    pub async fn restart_range_container(&self, range_id: Uuid) -> CyroidResult<DindSandbox> {
        self.registry.close(range_id).await;
        let container = self.require_container(range_id).await?;
        self.host
            .restart_container(&container.id, *self.settings.get_stop_timeout_secs())
            .await?;
        self.await_sandbox(range_id, &container.id).await
    }

    /// Lists every sandbox on the host.
    pub async fn list_range_containers(&self) -> CyroidResult<Vec<SandboxSummary>> {
        let containers = self.host.list_containers(LABEL_RANGE_ID).await?;
        let ranges_network = self.settings.get_ranges_network_name();

        Ok(containers
            .into_iter()
            .filter(is_sandbox)
            .filter_map(|c| {
                let range_id = c.labels.get(LABEL_RANGE_ID)?.parse().ok()?;
                Some(SandboxSummary {
                    range_id,
                    management_ip: c.ip_on(ranges_network),
                    container_id: c.id,
                    container_name: c.name,
                    running: c.running,
                })
            })
            .collect())
    }

    /// Runs a privileged command in the sandbox of a range.
    pub async fn exec_in_container(
        &self,
        range_id: Uuid,
        command: &[String],
    ) -> CyroidResult<ExecOutput> {
        let container = self.require_container(range_id).await?;
        self.host.exec(&container.id, command, true).await
    }

    /// Polls the nested daemon at `docker_url` until it answers or the startup timeout elapses.
    pub async fn wait_for_docker_ready(&self, docker_url: &str) -> CyroidResult<Arc<dyn DockerApi>> {
        let timeout = self.settings.startup_timeout();
        let interval = self.settings.poll_interval();
        let deadline = Instant::now() + timeout;

        loop {
            match self.registry.connector().connect(docker_url) {
                Ok(client) => match client.ping().await {
                    Ok(()) => return Ok(client),
                    Err(e) => tracing::trace!(docker_url, error = %e, "sandbox daemon not ready"),
                },
                Err(e) => tracing::trace!(docker_url, error = %e, "sandbox daemon unreachable"),
            }

            if Instant::now() + interval > deadline {
                return Err(CyroidError::Timeout {
                    what: format!("docker daemon at {docker_url}"),
                    seconds: timeout.as_secs(),
                });
            }

            time::sleep(interval).await;
        }
    }

    async fn await_sandbox(&self, range_id: Uuid, container_id: &str) -> CyroidResult<DindSandbox> {
        let info = self.host.inspect_container(container_id).await?;
        let management_ip = self.management_ip_of(container_id).await?;
        let docker_url = format!("tcp://{management_ip}:{}", self.settings.get_docker_port());

        let client = self.wait_for_docker_ready(&docker_url).await?;
        self.registry.insert(range_id, &docker_url, client).await;

        Ok(DindSandbox {
            container_id: info.id,
            container_name: info.name,
            management_ip,
            docker_url,
            volume_name: dind_volume_name(&range_id),
        })
    }

    async fn find_container(&self, range_id: Uuid) -> CyroidResult<Option<ContainerInfo>> {
        let containers = self
            .host
            .list_containers(&range_label_filter(&range_id))
            .await?;
        Ok(containers.into_iter().find(is_sandbox))
    }

    async fn require_container(&self, range_id: Uuid) -> CyroidResult<ContainerInfo> {
        self.find_container(range_id)
            .await?
            .ok_or_else(|| CyroidError::SandboxNotFound(range_id.to_string()))
    }

    async fn management_ip_of(&self, container_id: &str) -> CyroidResult<Ipv4Addr> {
        let network = self.settings.get_ranges_network_name();
        self.host
            .inspect_container(container_id)
            .await?
            .ip_on(network)
            .ok_or_else(|| {
                CyroidError::NotFound(format!(
                    "sandbox {container_id} has no address on {network}"
                ))
            })
    }

    async fn ensure_image(&self) -> CyroidResult<()> {
        let image = self.settings.get_image();
        if !self.host.image_exists(image).await? {
            self.host.pull_image(image).await?;
        }
        Ok(())
    }

    async fn ensure_ranges_network(&self) -> CyroidResult<()> {
        let name = self.settings.get_ranges_network_name();
        match self.host.inspect_network(name).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let spec = NetworkSpec::builder()
            .name(name.clone())
            .subnet(*self.settings.get_ranges_network_subnet())
            .build();

        match self.host.create_network(&spec).await {
            Ok(id) => {
                tracing::info!(network = %name, %id, "created ranges network");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Sandboxes carry `cyroid.role=dind`; older sandboxes carry no role label at all.
fn is_sandbox(container: &ContainerInfo) -> bool {
    container
        .labels
        .get(LABEL_ROLE)
        .map(|role| role == ROLE_DIND)
        .unwrap_or(true)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
