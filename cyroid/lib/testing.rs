//! In-memory Docker daemon and range fixtures used by unit tests.

use std::{
    collections::{HashMap, HashSet},
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use uuid::Uuid;

use crate::{
    config::Settings,
    docker::{
        ContainerInfo, ContainerSpec, ContainerStats, DockerApi, DockerConnector, ExecOutput,
        NetworkEndpoint, NetworkInfo, NetworkSpec,
    },
    models::{Architecture, BaseImage, ImageFamily, Network, OsType, Range, Vm},
    orchestration::{Orchestrator, RecordingEventSink},
    store::{MemoryStore, RangeStore},
    CyroidError, CyroidResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A fake daemon that keeps networks, containers and volumes in memory and records every exec.
#[derive(Default)]
pub struct MockDocker {
    state: Mutex<MockState>,
}

/// Hands out the same nested [`MockDocker`] for every url and counts connections.
pub struct MockConnector {
    nested: Arc<MockDocker>,
    connects: AtomicUsize,
}

/// One recorded exec.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecRecord {
    pub container: String,
    pub cmd: Vec<String>,
    pub privileged: bool,
}

/// A range in a [`MemoryStore`] wired to an orchestrator over mock host and nested daemons.
pub struct RangeFixture {
    pub host: Arc<MockDocker>,
    pub nested: Arc<MockDocker>,
    pub store: Arc<MemoryStore>,
    pub events: Arc<RecordingEventSink>,
    pub orchestrator: Orchestrator,
    pub range_id: Uuid,
}

#[derive(Default)]
struct MockState {
    next_id: usize,
    ping_failing: bool,
    images: HashMap<String, Option<String>>,
    pulled: Vec<String>,
    networks: Vec<MockNetwork>,
    containers: Vec<MockContainer>,
    volumes: HashSet<String>,
    execs: Vec<ExecRecord>,
    failing_execs: Vec<String>,
    exec_responses: Vec<(String, String)>,
    failing_images: HashSet<String>,
    removed_networks: Vec<String>,
}

struct MockNetwork {
    id: String,
    name: String,
    subnet: Ipv4Network,
    gateway: Option<Ipv4Addr>,
    labels: HashMap<String, String>,
}

struct MockContainer {
    info: ContainerInfo,
    spec: ContainerSpec,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MockDocker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn add_image(&self, image: &str, architecture: Option<&str>) {
        self.state()
            .images
            .insert(image.to_string(), architecture.map(str::to_string));
    }

    pub fn set_ping_ok(&self, ok: bool) {
        self.state().ping_failing = !ok;
    }

    /// Execs whose joined command line contains `needle` exit 1.
    pub fn fail_exec_when(&self, needle: &str) {
        self.state().failing_execs.push(needle.to_string());
    }

    /// Execs whose joined command line contains `needle` print `output`.
    pub fn respond_to_exec(&self, needle: &str, output: &str) {
        self.state()
            .exec_responses
            .push((needle.to_string(), output.to_string()));
    }

    pub fn fail_create_for_image(&self, image: &str) {
        self.state().failing_images.insert(image.to_string());
    }

    pub fn pulled(&self) -> Vec<String> {
        self.state().pulled.clone()
    }

    pub fn execs(&self) -> Vec<ExecRecord> {
        self.state().execs.clone()
    }

    /// Every exec as one space-joined line.
    pub fn exec_commands(&self) -> Vec<String> {
        self.state()
            .execs
            .iter()
            .map(|e| e.cmd.join(" "))
            .collect()
    }

    pub fn clear_execs(&self) {
        self.state().execs.clear();
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.state().volumes.contains(name)
    }

    pub fn container_by_name(&self, name: &str) -> Option<ContainerInfo> {
        let state = self.state();
        state
            .containers
            .iter()
            .find(|c| c.info.name == name)
            .map(|c| c.info.clone())
    }

    pub fn container_spec(&self, id_or_name: &str) -> Option<ContainerSpec> {
        let state = self.state();
        state
            .find_container(id_or_name)
            .map(|i| state.containers[i].spec.clone())
    }

    pub fn containers(&self) -> Vec<ContainerInfo> {
        self.state()
            .containers
            .iter()
            .map(|c| c.info.clone())
            .collect()
    }

    pub fn network_by_name(&self, name: &str) -> Option<NetworkInfo> {
        let state = self.state();
        state.find_network(name).map(|i| state.network_info(i))
    }

    pub fn network_names(&self) -> Vec<String> {
        self.state()
            .networks
            .iter()
            .map(|n| n.name.clone())
            .collect()
    }

    pub fn removed_networks(&self) -> Vec<String> {
        self.state().removed_networks.clone()
    }
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{:09}{}", self.next_id, "f".repeat(52))
    }

    fn find_network(&self, name_or_id: &str) -> Option<usize> {
        self.networks
            .iter()
            .position(|n| n.name == name_or_id || n.id == name_or_id)
    }

    fn find_container(&self, id_or_name: &str) -> Option<usize> {
        self.containers
            .iter()
            .position(|c| c.info.id == id_or_name || c.info.name == id_or_name)
    }

    fn network_info(&self, index: usize) -> NetworkInfo {
        let network = &self.networks[index];
        let endpoints = self
            .containers
            .iter()
            .filter_map(|c| {
                c.info.networks.get(&network.name).map(|ip| NetworkEndpoint {
                    container_id: c.info.id.clone(),
                    name: c.info.name.clone(),
                    ipv4_address: *ip,
                })
            })
            .collect();

        NetworkInfo {
            id: network.id.clone(),
            name: network.name.clone(),
            subnet: Some(network.subnet),
            gateway: network.gateway,
            endpoints,
            labels: network.labels.clone(),
        }
    }

    /// Picks the lowest free host address of a network.
    fn allocate(&self, index: usize) -> CyroidResult<Ipv4Addr> {
        let network = &self.networks[index];
        let taken: HashSet<Ipv4Addr> = self
            .containers
            .iter()
            .filter_map(|c| c.info.networks.get(&network.name).copied().flatten())
            .collect();

        network
            .subnet
            .iter()
            .skip(1)
            .take_while(|ip| *ip != network.subnet.broadcast())
            .find(|ip| Some(*ip) != network.gateway && !taken.contains(ip))
            .ok_or_else(|| CyroidError::AddressPoolExhausted(network.name.clone()))
    }

    fn attach(
        &mut self,
        network: &str,
        container: usize,
        ipv4_address: Option<Ipv4Addr>,
    ) -> CyroidResult<()> {
        let index = self
            .find_network(network)
            .ok_or_else(|| CyroidError::NotFound(format!("network {network}")))?;
        let name = self.networks[index].name.clone();
        if self.containers[container].info.networks.contains_key(&name) {
            return Err(CyroidError::AlreadyExists(format!(
                "endpoint {} on {name}",
                self.containers[container].info.name
            )));
        }

        let ip = match ipv4_address {
            Some(ip) => ip,
            None => self.allocate(index)?,
        };
        self.containers[container].info.networks.insert(name, Some(ip));
        Ok(())
    }
}

impl MockConnector {
    pub fn new(nested: Arc<MockDocker>) -> Self {
        Self {
            nested,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl RangeFixture {
    /// Stores an empty draft range named `lab`.
    pub async fn new(settings: Settings) -> anyhow::Result<Self> {
        let host = Arc::new(MockDocker::new());
        let nested = Arc::new(MockDocker::new());
        let store = Arc::new(MemoryStore::default());
        let events = Arc::new(RecordingEventSink::new());

        let orchestrator = Orchestrator::new(
            settings,
            host.clone(),
            Arc::new(MockConnector::new(nested.clone())),
            store.clone(),
            events.clone(),
        );

        let range = Range::new("lab");
        store.save_range(&range).await?;

        Ok(Self {
            host,
            nested,
            store,
            events,
            orchestrator,
            range_id: range.id,
        })
    }

    /// Stores a network with the router on the first host address.
    pub async fn add_network(&self, name: &str, subnet: &str) -> anyhow::Result<Network> {
        let subnet: Ipv4Network = subnet.parse()?;
        let gateway = subnet
            .iter()
            .nth(1)
            .ok_or_else(|| anyhow::anyhow!("subnet {subnet} has no hosts"))?;

        let network = Network::new(self.range_id, name, subnet, gateway);
        self.store.save_network(&network).await?;
        Ok(network)
    }

    /// Stores a VM running `image` as a plain container of `family`.
    pub async fn add_container_vm(
        &self,
        network: &Network,
        hostname: &str,
        ip: Ipv4Addr,
        image: &str,
        family: ImageFamily,
    ) -> anyhow::Result<Vm> {
        let base = BaseImage {
            id: Uuid::new_v4(),
            name: image.to_string(),
            docker_image: Some(image.to_string()),
            iso_path: None,
            os_type: OsType::Linux,
            family,
            architecture: Architecture::X86_64,
            distro: None,
            version: None,
        };
        self.store.save_base_image(&base).await?;

        let mut vm = Vm::new(self.range_id, network.id, hostname, ip);
        vm.base_image_id = Some(base.id);
        self.store.save_vm(&vm).await?;
        Ok(vm)
    }

    pub async fn range(&self) -> anyhow::Result<Range> {
        Ok(self.store.require_range(self.range_id).await?)
    }

    pub async fn network(&self, id: Uuid) -> anyhow::Result<Network> {
        Ok(self.store.require_network(id).await?)
    }

    pub async fn vm(&self, id: Uuid) -> anyhow::Result<Vm> {
        Ok(self.store.require_vm(id).await?)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl DockerApi for MockDocker {
    async fn ping(&self) -> CyroidResult<()> {
        if self.state().ping_failing {
            return Err(CyroidError::custom(anyhow::anyhow!("daemon not answering")));
        }
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> CyroidResult<bool> {
        Ok(self.state().images.contains_key(image))
    }

    async fn image_architecture(&self, image: &str) -> CyroidResult<Option<String>> {
        Ok(self.state().images.get(image).cloned().flatten())
    }

    async fn pull_image(&self, image: &str) -> CyroidResult<()> {
        let mut state = self.state();
        state.pulled.push(image.to_string());
        state.images.entry(image.to_string()).or_insert(None);
        Ok(())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> CyroidResult<String> {
        let mut state = self.state();
        if state.find_network(&spec.name).is_some() {
            return Err(CyroidError::AlreadyExists(format!("network {}", spec.name)));
        }

        let id = state.next_id("net");
        let gateway = spec.gateway.or_else(|| spec.subnet.iter().nth(1));
        state.networks.push(MockNetwork {
            id: id.clone(),
            name: spec.name.clone(),
            subnet: spec.subnet,
            gateway,
            labels: spec.labels.clone(),
        });
        Ok(id)
    }

    async fn inspect_network(&self, name_or_id: &str) -> CyroidResult<NetworkInfo> {
        let state = self.state();
        state
            .find_network(name_or_id)
            .map(|i| state.network_info(i))
            .ok_or_else(|| CyroidError::NotFound(format!("network {name_or_id}")))
    }

    async fn list_networks(&self, label: Option<&str>) -> CyroidResult<Vec<NetworkInfo>> {
        let state = self.state();
        Ok((0..state.networks.len())
            .filter(|i| label.is_none_or(|l| has_label(&state.networks[*i].labels, l)))
            .map(|i| state.network_info(i))
            .collect())
    }

    async fn remove_network(&self, name_or_id: &str) -> CyroidResult<()> {
        let mut state = self.state();
        let index = state
            .find_network(name_or_id)
            .ok_or_else(|| CyroidError::NotFound(format!("network {name_or_id}")))?;
        let network = state.networks.remove(index);
        for container in state.containers.iter_mut() {
            container.info.networks.remove(&network.name);
        }
        state.removed_networks.push(network.name);
        Ok(())
    }

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        ipv4_address: Option<Ipv4Addr>,
    ) -> CyroidResult<()> {
        let mut state = self.state();
        let index = state
            .find_container(container)
            .ok_or_else(|| CyroidError::NotFound(format!("container {container}")))?;
        state.attach(network, index, ipv4_address)
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
        _force: bool,
    ) -> CyroidResult<()> {
        let mut state = self.state();
        let net_index = state
            .find_network(network)
            .ok_or_else(|| CyroidError::NotFound(format!("network {network}")))?;
        let name = state.networks[net_index].name.clone();
        let index = state
            .find_container(container)
            .ok_or_else(|| CyroidError::NotFound(format!("container {container}")))?;
        state.containers[index]
            .info
            .networks
            .remove(&name)
            .map(|_| ())
            .ok_or_else(|| CyroidError::NotFound(format!("endpoint {container} on {name}")))
    }

    async fn create_volume(
        &self,
        name: &str,
        _labels: &HashMap<String, String>,
    ) -> CyroidResult<()> {
        if !self.state().volumes.insert(name.to_string()) {
            return Err(CyroidError::AlreadyExists(format!("volume {name}")));
        }
        Ok(())
    }

    async fn remove_volume(&self, name: &str, _force: bool) -> CyroidResult<()> {
        if !self.state().volumes.remove(name) {
            return Err(CyroidError::NotFound(format!("volume {name}")));
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> CyroidResult<String> {
        let mut state = self.state();
        if state.failing_images.contains(&spec.image) {
            return Err(CyroidError::custom(anyhow::anyhow!(
                "cannot create container from {}",
                spec.image
            )));
        }
        if state.find_container(&spec.name).is_some() {
            return Err(CyroidError::AlreadyExists(format!("container {}", spec.name)));
        }

        let id = state.next_id("ctr");
        state.containers.push(MockContainer {
            info: ContainerInfo {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                running: false,
                state: "created".to_string(),
                labels: spec.labels.clone(),
                networks: HashMap::new(),
            },
            spec: spec.clone(),
        });

        if let Some(network) = &spec.network {
            let index = state.containers.len() - 1;
            if let Err(e) = state.attach(network, index, spec.ipv4_address) {
                state.containers.pop();
                return Err(e);
            }
        }

        Ok(id)
    }

    async fn start_container(&self, id: &str) -> CyroidResult<()> {
        let mut state = self.state();
        let index = state
            .find_container(id)
            .ok_or_else(|| CyroidError::NotFound(format!("container {id}")))?;
        let info = &mut state.containers[index].info;
        info.running = true;
        info.state = "running".to_string();
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout_secs: i64) -> CyroidResult<()> {
        let mut state = self.state();
        let index = state
            .find_container(id)
            .ok_or_else(|| CyroidError::NotFound(format!("container {id}")))?;
        let info = &mut state.containers[index].info;
        info.running = false;
        info.state = "exited".to_string();
        Ok(())
    }

    async fn remove_container(&self, id: &str, _force: bool) -> CyroidResult<()> {
        let mut state = self.state();
        let index = state
            .find_container(id)
            .ok_or_else(|| CyroidError::NotFound(format!("container {id}")))?;
        state.containers.remove(index);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> CyroidResult<ContainerInfo> {
        let state = self.state();
        state
            .find_container(id)
            .map(|i| state.containers[i].info.clone())
            .ok_or_else(|| CyroidError::NotFound(format!("container {id}")))
    }

    async fn list_containers(&self, label: &str) -> CyroidResult<Vec<ContainerInfo>> {
        Ok(self
            .state()
            .containers
            .iter()
            .filter(|c| has_label(&c.info.labels, label))
            .map(|c| c.info.clone())
            .collect())
    }

    async fn exec(
        &self,
        container: &str,
        cmd: &[String],
        privileged: bool,
    ) -> CyroidResult<ExecOutput> {
        let mut state = self.state();
        let index = state
            .find_container(container)
            .ok_or_else(|| CyroidError::NotFound(format!("container {container}")))?;
        let container_id = state.containers[index].info.id.clone();

        state.execs.push(ExecRecord {
            container: container_id,
            cmd: cmd.to_vec(),
            privileged,
        });

        let line = cmd.join(" ");
        if state.failing_execs.iter().any(|n| line.contains(n.as_str())) {
            return Ok(ExecOutput {
                exit_code: 1,
                output: "mock exec failure".to_string(),
            });
        }

        let output = state
            .exec_responses
            .iter()
            .find(|(n, _)| line.contains(n.as_str()))
            .map(|(_, o)| o.clone())
            .unwrap_or_default();
        Ok(ExecOutput {
            exit_code: 0,
            output,
        })
    }

    async fn logs(&self, container: &str, _tail: usize) -> CyroidResult<String> {
        self.inspect_container(container).await?;
        Ok(String::new())
    }

    async fn stats(&self, container: &str) -> CyroidResult<ContainerStats> {
        self.inspect_container(container).await?;
        Ok(ContainerStats::default())
    }
}

impl DockerConnector for MockConnector {
    fn connect(&self, _url: &str) -> CyroidResult<Arc<dyn DockerApi>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.nested.clone())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn has_label(labels: &HashMap<String, String>, filter: &str) -> bool {
    match filter.split_once('=') {
        Some((key, value)) => labels.get(key).is_some_and(|v| v == value),
        None => labels.contains_key(filter),
    }
}
