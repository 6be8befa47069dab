use std::{
    collections::{HashMap, HashSet},
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    models::{
        Architecture, BaseImage, BootSource, DisplayType, ImageFamily, LinuxUser, Network, OsType,
        Range, Vm, WindowsCredentials,
    },
    store::RangeStore,
    CyroidError, CyroidResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A range described in YAML, as accepted by `cyroid create`.
///
/// ```yaml
/// name: red-team-lab
/// images:
///   - name: kali
///     docker_image: kasmweb/kali-rolling-desktop:1.15.0
///     family: KASM_VNC
/// networks:
///   - name: lan
///     subnet: 10.0.1.0/24
///     internet: true
/// vms:
///   - hostname: attacker
///     network: lan
///     ip: 10.0.1.10
///     image: kali
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeDefinition {
    /// The range name.
    pub name: String,

    /// Base images referenced by the VMs.
    #[serde(default)]
    pub images: Vec<ImageDefinition>,

    /// The networks, provisioned in this order.
    #[serde(default)]
    pub networks: Vec<NetworkDefinition>,

    /// The VMs, deployed in this order.
    #[serde(default)]
    pub vms: Vec<VmDefinition>,
}

/// A base image entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageDefinition {
    /// The name VMs refer to.
    pub name: String,

    /// The container image reference.
    #[serde(default)]
    pub docker_image: Option<String>,

    /// ISO path relative to the ISO root.
    #[serde(default)]
    pub iso_path: Option<PathBuf>,

    /// The operating system.
    #[serde(default)]
    pub os_type: OsType,

    /// The workload family.
    #[serde(default)]
    pub family: ImageFamily,

    /// The image architecture.
    #[serde(default)]
    pub architecture: Architecture,

    /// Distro the QEMU image downloads itself.
    #[serde(default)]
    pub distro: Option<String>,

    /// Windows version.
    #[serde(default)]
    pub version: Option<String>,
}

/// A network entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkDefinition {
    /// The network name, unique in the range.
    pub name: String,

    /// The subnet.
    pub subnet: Ipv4Network,

    /// The router address; the first host of the subnet when absent.
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,

    /// Whether traffic is confined to the network.
    #[serde(default = "default_isolated")]
    pub isolated: bool,

    /// Whether the router NATs the network to the internet.
    #[serde(default)]
    pub internet: bool,

    /// Whether the router serves DHCP.
    #[serde(default)]
    pub dhcp: bool,

    /// DNS servers handed out over DHCP.
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,

    /// DNS search domain handed out over DHCP.
    #[serde(default)]
    pub dns_search: Option<String>,
}

/// A VM entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmDefinition {
    /// The hostname, unique in the range.
    pub hostname: String,

    /// The name of the network the VM sits on.
    pub network: String,

    /// The VM address.
    pub ip: Ipv4Addr,

    /// The name of the base image.
    pub image: String,

    /// Virtual CPUs.
    #[serde(default)]
    pub cpu: Option<u32>,

    /// RAM in MiB.
    #[serde(default)]
    pub ram_mb: Option<u32>,

    /// Disk in GiB.
    #[serde(default)]
    pub disk_gb: Option<u32>,

    /// Desktop or server.
    #[serde(default)]
    pub display: DisplayType,

    /// Boot path when the image offers both a container and an ISO.
    #[serde(default)]
    pub boot_source: Option<BootSource>,

    /// Account pushed into desktop containers.
    #[serde(default)]
    pub linux_user: Option<LinuxUser>,

    /// Account for Windows installs.
    #[serde(default)]
    pub windows_credentials: Option<WindowsCredentials>,
}

/// The records a definition expands to.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeRecords {
    /// The draft range.
    pub range: Range,

    /// The base images.
    pub images: Vec<BaseImage>,

    /// The networks.
    pub networks: Vec<Network>,

    /// The VMs.
    pub vms: Vec<Vm>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RangeDefinition {
    /// Reads a definition from a YAML file.
    pub async fn load(path: impl AsRef<Path>) -> CyroidResult<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        Self::from_yaml(&contents)
    }

    /// Parses a definition from YAML.
    pub fn from_yaml(yaml: &str) -> CyroidResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Expands the definition into records, checking that names are unique and references
    /// resolve.
    pub fn into_records(self) -> CyroidResult<RangeRecords> {
        let range = Range::new(self.name);

        let mut images: HashMap<String, BaseImage> = HashMap::new();
        for image in self.images {
            let record = BaseImage {
                id: Uuid::new_v4(),
                name: image.name.clone(),
                docker_image: image.docker_image,
                iso_path: image.iso_path,
                os_type: image.os_type,
                family: image.family,
                architecture: image.architecture,
                distro: image.distro,
                version: image.version,
            };
            if images.insert(image.name.clone(), record).is_some() {
                return Err(definition_error(format!("image {} is defined twice", image.name)));
            }
        }

        let mut networks: Vec<Network> = Vec::with_capacity(self.networks.len());
        for def in self.networks {
            if networks.iter().any(|n| n.name == def.name) {
                return Err(definition_error(format!("network {} is defined twice", def.name)));
            }

            let gateway = match def.gateway {
                Some(gateway) if def.subnet.contains(gateway) => gateway,
                Some(gateway) => {
                    return Err(definition_error(format!(
                        "gateway {gateway} of {} is outside {}",
                        def.name, def.subnet
                    )))
                }
                None => def.subnet.iter().nth(1).ok_or_else(|| {
                    definition_error(format!("subnet {} of {} has no hosts", def.subnet, def.name))
                })?,
            };

            let mut network = Network::new(range.id, def.name, def.subnet, gateway);
            network.is_isolated = def.isolated;
            network.internet_enabled = def.internet;
            network.dhcp_enabled = def.dhcp;
            network.dns_servers = def.dns_servers;
            network.dns_search = def.dns_search;
            networks.push(network);
        }

        let mut hostnames = HashSet::new();
        let mut vms = Vec::with_capacity(self.vms.len());
        for def in self.vms {
            if !hostnames.insert(def.hostname.clone()) {
                return Err(definition_error(format!("vm {} is defined twice", def.hostname)));
            }
            let network = networks
                .iter()
                .find(|n| n.name == def.network)
                .ok_or_else(|| CyroidError::NetworkNotFound(def.network.clone()))?;
            let image = images
                .get(&def.image)
                .ok_or_else(|| CyroidError::ImageSourceNotFound(def.image.clone()))?;

            let mut vm = Vm::new(range.id, network.id, def.hostname, def.ip);
            vm.base_image_id = Some(image.id);
            vm.resources.cpu = def.cpu.unwrap_or(vm.resources.cpu);
            vm.resources.ram_mb = def.ram_mb.unwrap_or(vm.resources.ram_mb);
            vm.resources.disk_gb = def.disk_gb.unwrap_or(vm.resources.disk_gb);
            vm.display_type = def.display;
            vm.boot_source = def.boot_source;
            vm.linux_user = def.linux_user;
            vm.windows_credentials = def.windows_credentials;
            vms.push(vm);
        }

        let mut images: Vec<BaseImage> = images.into_values().collect();
        images.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(RangeRecords {
            range,
            images,
            networks,
            vms,
        })
    }
}

impl RangeRecords {
    /// Writes every record to `store`.
    pub async fn save(&self, store: &dyn RangeStore) -> CyroidResult<()> {
        for image in &self.images {
            store.save_base_image(image).await?;
        }
        store.save_range(&self.range).await?;
        for network in &self.networks {
            store.save_network(network).await?;
        }
        for vm in &self.vms {
            store.save_vm(vm).await?;
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn default_isolated() -> bool {
    true
}

fn definition_error(message: String) -> CyroidError {
    CyroidError::Config(message)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
