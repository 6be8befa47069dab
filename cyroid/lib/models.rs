//! Records the orchestrator reads and writes through a [`RangeStore`](crate::store::RangeStore).

use std::{collections::BTreeMap, fmt, net::Ipv4Addr, path::PathBuf, str::FromStr};

use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::{DEFAULT_VM_CPU, DEFAULT_VM_DISK_GB, DEFAULT_VM_RAM_MB},
    CyroidError, CyroidResult,
};

//--------------------------------------------------------------------------------------------------
// Macros
//--------------------------------------------------------------------------------------------------

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// The persisted representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = CyroidError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(CyroidError::InvalidParameter {
                        name: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

//--------------------------------------------------------------------------------------------------
// Types: Range
//--------------------------------------------------------------------------------------------------

/// Lifecycle of a range.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RangeStatus {
    /// Defined but never deployed, or torn down.
    #[default]
    Draft,

    /// A deploy is in flight.
    Deploying,

    /// Deployed.
    Running,

    /// Gracefully stopped.
    Stopped,

    /// A deploy failed.
    Error,
}

/// The sandbox backing a range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DindSandbox {
    /// The sandbox container id on the host daemon.
    pub container_id: String,

    /// The sandbox container name.
    pub container_name: String,

    /// The sandbox address on the shared ranges bridge.
    pub management_ip: Ipv4Addr,

    /// The nested daemon url, `tcp://{ip}:{port}`.
    pub docker_url: String,

    /// The data volume mounted at the nested daemon's storage path.
    pub volume_name: String,
}

/// Where a VM console can be reached from the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VncProxyMapping {
    /// The forwarded port on the sandbox.
    pub proxy_port: u16,

    /// The sandbox management address.
    pub proxy_host: String,

    /// The console port inside the VM.
    pub original_port: u16,
}

/// A cyber range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Range {
    /// The unique identifier of the range.
    pub id: Uuid,

    /// The display name.
    pub name: String,

    /// The lifecycle status.
    pub status: RangeStatus,

    /// The last failure, truncated.
    pub error_message: Option<String>,

    /// The sandbox, when one exists.
    pub sandbox: Option<DindSandbox>,

    /// Console mappings keyed by VM id.
    pub vnc_proxy_mappings: BTreeMap<Uuid, VncProxyMapping>,

    /// When the range was created.
    pub created_at: DateTime<Utc>,

    /// When the range was last modified.
    pub modified_at: DateTime<Utc>,
}

//--------------------------------------------------------------------------------------------------
// Types: Network
//--------------------------------------------------------------------------------------------------

/// A range network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    /// The unique identifier of the network.
    pub id: Uuid,

    /// The owning range.
    pub range_id: Uuid,

    /// The display name.
    pub name: String,

    /// The subnet, fixed at creation.
    pub subnet: Ipv4Network,

    /// The gateway the router takes, fixed at creation.
    pub gateway: Ipv4Addr,

    /// Whether traffic is confined to the network.
    pub is_isolated: bool,

    /// Whether the router NATs this network to the internet.
    pub internet_enabled: bool,

    /// Whether the router serves DHCP on this network.
    pub dhcp_enabled: bool,

    /// DNS servers handed out over DHCP.
    pub dns_servers: Vec<Ipv4Addr>,

    /// DNS search domain handed out over DHCP.
    pub dns_search: Option<String>,

    /// The Docker network id once provisioned.
    pub docker_network_id: Option<String>,

    /// The router interface once attached.
    pub vyos_interface: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Types: VM
//--------------------------------------------------------------------------------------------------

/// Lifecycle of a VM.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmStatus {
    /// No container.
    #[default]
    Pending,

    /// Container being created or started.
    Creating,

    /// Container running.
    Running,

    /// Container stopped.
    Stopped,

    /// Creation or start failed.
    Error,
}

/// How a VM is presented to users.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisplayType {
    /// Has a graphical console routed through the reverse proxy.
    #[default]
    Desktop,

    /// Headless.
    Server,
}

/// Which boot path to use when a base image offers both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BootSource {
    /// Run the container image.
    Container,

    /// Boot the ISO under QEMU.
    Iso,
}

/// Compute resources of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmResources {
    /// Virtual CPUs.
    pub cpu: u32,

    /// RAM in MiB.
    pub ram_mb: u32,

    /// Disk in GiB.
    pub disk_gb: u32,
}

/// A Linux account pushed into KasmVNC and LinuxServer containers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinuxUser {
    /// Login name.
    pub username: String,

    /// Password.
    pub password: String,

    /// Whether the account may sudo.
    pub sudo: bool,
}

/// Credentials for unattended Windows installs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowsCredentials {
    /// Login name.
    pub username: String,

    /// Password.
    pub password: String,
}

/// The resolved image source of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    /// A fresh install from a base image.
    Base(Uuid),

    /// A pre-built golden image.
    Golden(Uuid),

    /// A committed snapshot.
    Snapshot(Uuid),
}

/// A VM or container workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vm {
    /// The unique identifier of the VM.
    pub id: Uuid,

    /// The owning range.
    pub range_id: Uuid,

    /// The network the VM is attached to.
    pub network_id: Uuid,

    /// The hostname, unique within the range.
    pub hostname: String,

    /// The address, unique within the network.
    pub ip_address: Ipv4Addr,

    /// Compute resources.
    pub resources: VmResources,

    /// The lifecycle status.
    pub status: VmStatus,

    /// The last failure, truncated.
    pub error_message: Option<String>,

    /// The container id once created.
    pub container_id: Option<String>,

    /// Base image source.
    pub base_image_id: Option<Uuid>,

    /// Golden image source.
    pub golden_image_id: Option<Uuid>,

    /// Snapshot source.
    pub snapshot_id: Option<Uuid>,

    /// Desktop or server.
    pub display_type: DisplayType,

    /// Boot path chosen when the base image offers more than one.
    pub boot_source: Option<BootSource>,

    /// Account for KasmVNC and LinuxServer images.
    pub linux_user: Option<LinuxUser>,

    /// Account for Windows installs.
    pub windows_credentials: Option<WindowsCredentials>,
}

//--------------------------------------------------------------------------------------------------
// Types: Router
//--------------------------------------------------------------------------------------------------

/// Lifecycle of a range router.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouterStatus {
    /// No container.
    #[default]
    Pending,

    /// Container being created.
    Creating,

    /// Container running.
    Running,

    /// Container stopped.
    Stopped,

    /// Creation failed.
    Error,
}

/// The VyOS router of a range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeRouter {
    /// The owning range.
    pub range_id: Uuid,

    /// The address on the management network.
    pub management_ip: Option<Ipv4Addr>,

    /// The container id once created.
    pub container_id: Option<String>,

    /// The lifecycle status.
    pub status: RouterStatus,

    /// The last failure, truncated.
    pub error_message: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Types: Image catalog
//--------------------------------------------------------------------------------------------------

/// The closed set of workload families. Resolved once from the catalog record and carried as
/// data everywhere the console port, proxy backend or provisioning differs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageFamily {
    /// QEMU booting an ISO or disk image.
    QemuIso,

    /// QEMU running a Windows install.
    Windows,

    /// A KasmVNC desktop container.
    KasmVnc,

    /// A LinuxServer.io desktop container.
    LinuxServer,

    /// Any other container.
    #[default]
    GenericContainer,
}

/// Operating system of an image.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OsType {
    /// Linux.
    #[default]
    Linux,

    /// Windows.
    Windows,
}

/// CPU architecture of an image.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    /// 64-bit x86.
    #[default]
    #[serde(rename = "x86_64")]
    X86_64,

    /// 64-bit ARM.
    #[serde(rename = "aarch64")]
    Aarch64,
}

/// A base image: a container image, an installer ISO or both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseImage {
    /// The unique identifier of the image.
    pub id: Uuid,

    /// The display name.
    pub name: String,

    /// The container image reference.
    pub docker_image: Option<String>,

    /// The ISO path relative to the ISO root.
    pub iso_path: Option<PathBuf>,

    /// The operating system.
    pub os_type: OsType,

    /// The workload family when run as a container.
    pub family: ImageFamily,

    /// The image architecture.
    pub architecture: Architecture,

    /// Distro identifier understood by the QEMU image's auto-download (`ubuntu`, `debian`...).
    pub distro: Option<String>,

    /// Windows version understood by the Windows image (`11`, `2022`...).
    pub version: Option<String>,
}

/// A pre-built golden image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenImage {
    /// The unique identifier of the image.
    pub id: Uuid,

    /// The display name.
    pub name: String,

    /// The container image reference.
    pub docker_image: Option<String>,

    /// The disk image path relative to the VM storage root.
    pub disk_image_path: Option<PathBuf>,

    /// The operating system.
    pub os_type: OsType,

    /// The workload family.
    pub family: ImageFamily,

    /// The image architecture.
    pub architecture: Architecture,
}

/// A snapshot committed from a running VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The unique identifier of the snapshot.
    pub id: Uuid,

    /// The display name.
    pub name: String,

    /// The committed container image.
    pub docker_image: String,

    /// The operating system.
    pub os_type: OsType,

    /// The workload family.
    pub family: ImageFamily,

    /// The image architecture.
    pub architecture: Architecture,
}

//--------------------------------------------------------------------------------------------------
// Types: Events
//--------------------------------------------------------------------------------------------------

/// Kinds of deployment events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum EventType {
    DeploymentStarted,
    DeploymentCompleted,
    DeploymentFailed,
    SandboxCreated,
    RouterCreating,
    RouterCreated,
    RouterError,
    NetworkCreating,
    NetworkCreated,
    NetworkError,
    VmCreating,
    VmStarted,
    VmStopped,
    VmError,
    RangeStarted,
    RangeStopped,
    RangeTornDown,
}

/// A structured progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentEvent {
    /// The range the event belongs to.
    pub range_id: Uuid,

    /// The kind of event.
    pub event_type: EventType,

    /// A human readable message.
    pub message: String,

    /// The VM the event concerns.
    pub vm_id: Option<Uuid>,

    /// Additional JSON data.
    pub extra_data: Option<serde_json::Value>,

    /// When the event was emitted.
    pub created_at: DateTime<Utc>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Range {
    /// Creates a draft range.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: RangeStatus::Draft,
            error_message: None,
            sandbox: None,
            vnc_proxy_mappings: BTreeMap::new(),
            created_at: now,
            modified_at: now,
        }
    }

    /// Whether a deploy may start from the current status.
    pub fn can_deploy(&self) -> bool {
        matches!(
            self.status,
            RangeStatus::Draft | RangeStatus::Stopped | RangeStatus::Error
        )
    }
}

impl Network {
    /// Creates an unprovisioned network with isolation on, internet and DHCP off.
    pub fn new(range_id: Uuid, name: impl Into<String>, subnet: Ipv4Network, gateway: Ipv4Addr) -> Self {
        Self {
            id: Uuid::new_v4(),
            range_id,
            name: name.into(),
            subnet,
            gateway,
            is_isolated: true,
            internet_enabled: false,
            dhcp_enabled: false,
            dns_servers: Vec::new(),
            dns_search: None,
            docker_network_id: None,
            vyos_interface: None,
        }
    }

    /// The router interface address, `{gateway}/{prefix}`.
    pub fn gateway_cidr(&self) -> CyroidResult<Ipv4Network> {
        Ok(Ipv4Network::new(self.gateway, self.subnet.prefix())?)
    }
}

impl Vm {
    /// Creates a pending VM with default resources.
    pub fn new(
        range_id: Uuid,
        network_id: Uuid,
        hostname: impl Into<String>,
        ip_address: Ipv4Addr,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            range_id,
            network_id,
            hostname: hostname.into(),
            ip_address,
            resources: VmResources::default(),
            status: VmStatus::Pending,
            error_message: None,
            container_id: None,
            base_image_id: None,
            golden_image_id: None,
            snapshot_id: None,
            display_type: DisplayType::Desktop,
            boot_source: None,
            linux_user: None,
            windows_credentials: None,
        }
    }

    /// Resolves the image source in priority order: base, golden, snapshot.
    pub fn image_source(&self) -> CyroidResult<ImageSource> {
        self.base_image_id
            .map(ImageSource::Base)
            .or(self.golden_image_id.map(ImageSource::Golden))
            .or(self.snapshot_id.map(ImageSource::Snapshot))
            .ok_or_else(|| CyroidError::InvalidImageSource(self.id.to_string()))
    }
}

impl RangeRouter {
    /// Creates a router record in `CREATING` at the given management address.
    pub fn new(range_id: Uuid, management_ip: Ipv4Addr) -> Self {
        Self {
            range_id,
            management_ip: Some(management_ip),
            container_id: None,
            status: RouterStatus::Creating,
            error_message: None,
        }
    }
}

impl ImageFamily {
    /// Whether the workload runs under QEMU.
    pub fn is_qemu_backed(&self) -> bool {
        matches!(self, Self::QemuIso | Self::Windows)
    }

    /// Whether a Linux account is pushed into the container after start.
    pub fn provisions_user(&self) -> bool {
        matches!(self, Self::KasmVnc | Self::LinuxServer)
    }

    /// The console port inside the workload.
    pub fn vnc_port(&self) -> u16 {
        match self {
            Self::QemuIso | Self::Windows => 8006,
            Self::KasmVnc => 6901,
            Self::LinuxServer | Self::GenericContainer => 3000,
        }
    }
}

impl Architecture {
    /// The architecture of the running host, if recognized.
    pub fn host() -> Option<Self> {
        match std::env::consts::ARCH {
            "x86_64" => Some(Self::X86_64),
            "aarch64" => Some(Self::Aarch64),
            _ => None,
        }
    }
}

impl DeploymentEvent {
    /// Creates an event stamped now.
    pub fn new(range_id: Uuid, event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            range_id,
            event_type,
            message: message.into(),
            vm_id: None,
            extra_data: None,
            created_at: Utc::now(),
        }
    }

    /// Attaches the VM the event concerns.
    pub fn with_vm(mut self, vm_id: Uuid) -> Self {
        self.vm_id = Some(vm_id);
        self
    }

    /// Attaches extra JSON data.
    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra_data = Some(extra);
        self
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

string_enum!(RangeStatus {
    Draft => "DRAFT",
    Deploying => "DEPLOYING",
    Running => "RUNNING",
    Stopped => "STOPPED",
    Error => "ERROR",
});

string_enum!(VmStatus {
    Pending => "PENDING",
    Creating => "CREATING",
    Running => "RUNNING",
    Stopped => "STOPPED",
    Error => "ERROR",
});

string_enum!(RouterStatus {
    Pending => "PENDING",
    Creating => "CREATING",
    Running => "RUNNING",
    Stopped => "STOPPED",
    Error => "ERROR",
});

string_enum!(DisplayType {
    Desktop => "DESKTOP",
    Server => "SERVER",
});

string_enum!(BootSource {
    Container => "CONTAINER",
    Iso => "ISO",
});

string_enum!(Architecture {
    X86_64 => "x86_64",
    Aarch64 => "aarch64",
});

string_enum!(EventType {
    DeploymentStarted => "DEPLOYMENT_STARTED",
    DeploymentCompleted => "DEPLOYMENT_COMPLETED",
    DeploymentFailed => "DEPLOYMENT_FAILED",
    SandboxCreated => "SANDBOX_CREATED",
    RouterCreating => "ROUTER_CREATING",
    RouterCreated => "ROUTER_CREATED",
    RouterError => "ROUTER_ERROR",
    NetworkCreating => "NETWORK_CREATING",
    NetworkCreated => "NETWORK_CREATED",
    NetworkError => "NETWORK_ERROR",
    VmCreating => "VM_CREATING",
    VmStarted => "VM_STARTED",
    VmStopped => "VM_STOPPED",
    VmError => "VM_ERROR",
    RangeStarted => "RANGE_STARTED",
    RangeStopped => "RANGE_STOPPED",
    RangeTornDown => "RANGE_TORN_DOWN",
});

impl Default for VmResources {
    fn default() -> Self {
        Self {
            cpu: DEFAULT_VM_CPU,
            ram_mb: DEFAULT_VM_RAM_MB,
            disk_gb: DEFAULT_VM_DISK_GB,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_source_priority() {
        let mut vm = Vm::new(Uuid::new_v4(), Uuid::new_v4(), "ws01", Ipv4Addr::new(10, 0, 1, 10));
        assert!(matches!(
            vm.image_source(),
            Err(CyroidError::InvalidImageSource(_))
        ));

        let snapshot = Uuid::new_v4();
        let golden = Uuid::new_v4();
        vm.snapshot_id = Some(snapshot);
        assert_eq!(vm.image_source().unwrap(), ImageSource::Snapshot(snapshot));

        vm.golden_image_id = Some(golden);
        assert_eq!(vm.image_source().unwrap(), ImageSource::Golden(golden));
    }

    #[test]
    fn test_status_strings_round_trip() {
        assert_eq!(RangeStatus::Deploying.to_string(), "DEPLOYING");
        assert_eq!("ERROR".parse::<VmStatus>().unwrap(), VmStatus::Error);
        assert!("running".parse::<RouterStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&EventType::VmError).unwrap(),
            "\"VM_ERROR\""
        );
    }

    #[test]
    fn test_family_console_ports() {
        assert_eq!(ImageFamily::Windows.vnc_port(), 8006);
        assert_eq!(ImageFamily::QemuIso.vnc_port(), 8006);
        assert_eq!(ImageFamily::KasmVnc.vnc_port(), 6901);
        assert_eq!(ImageFamily::LinuxServer.vnc_port(), 3000);
        assert_eq!(ImageFamily::GenericContainer.vnc_port(), 3000);
    }

    #[test]
    fn test_gateway_cidr() {
        let net = Network::new(
            Uuid::new_v4(),
            "lan",
            "10.0.1.0/24".parse().unwrap(),
            Ipv4Addr::new(10, 0, 1, 1),
        );
        assert_eq!(net.gateway_cidr().unwrap().to_string(), "10.0.1.1/24");
    }
}
