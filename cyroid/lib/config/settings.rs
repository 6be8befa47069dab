//! Runtime settings for the orchestrator.
//!
//! Settings resolve in three layers: built-in defaults, an optional YAML file and finally
//! `CYROID_*` environment variables.

use std::{
    env,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use getset::Getters;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{CyroidError, CyroidResult};

use super::defaults::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Top-level settings.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct Settings {
    /// Sandbox settings.
    #[builder(default)]
    dind: DindSettings,

    /// Shared network settings.
    #[builder(default)]
    network: NetworkSettings,

    /// Router settings.
    #[builder(default)]
    vyos: VyosSettings,

    /// VM workload settings.
    #[builder(default)]
    vm: VmSettings,

    /// Console proxy settings.
    #[builder(default)]
    proxy: ProxySettings,

    /// Orchestration policy.
    #[builder(default)]
    orchestration: OrchestrationSettings,
}

/// Settings for Docker-in-Docker sandboxes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct DindSettings {
    /// Whether ranges are deployed inside a per-range sandbox.
    #[builder(default = true)]
    enabled: bool,

    /// The sandbox image.
    #[builder(default = DEFAULT_DIND_IMAGE.to_string(), setter(into))]
    image: String,

    /// Seconds to wait for the nested daemon.
    #[builder(default = DEFAULT_DIND_STARTUP_TIMEOUT_SECS)]
    startup_timeout_secs: u64,

    /// Milliseconds between nested daemon pings.
    #[builder(default = DEFAULT_DIND_POLL_INTERVAL_MS)]
    poll_interval_ms: u64,

    /// The nested daemon port.
    #[builder(default = DEFAULT_DIND_DOCKER_PORT)]
    docker_port: u16,

    /// Grace period when stopping a sandbox.
    #[builder(default = DEFAULT_DIND_STOP_TIMEOUT_SECS)]
    stop_timeout_secs: i64,

    /// The bridge network all sandboxes attach to.
    #[builder(default = DEFAULT_RANGES_NETWORK_NAME.to_string(), setter(into))]
    ranges_network_name: String,

    /// The subnet of the sandbox bridge network.
    #[builder(default = default_ranges_subnet())]
    ranges_network_subnet: Ipv4Network,

    /// Default memory limit in bytes applied to sandboxes.
    #[builder(default)]
    memory_limit: Option<i64>,

    /// Default CPU limit applied to sandboxes.
    #[builder(default)]
    cpu_limit: Option<f64>,
}

/// Settings for the shared networks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct NetworkSettings {
    /// The router management network.
    #[builder(default = DEFAULT_MANAGEMENT_NETWORK_NAME.to_string(), setter(into))]
    management_network_name: String,

    /// The management subnet.
    #[builder(default = default_management_subnet())]
    management_subnet: Ipv4Network,

    /// The management gateway.
    #[builder(default = default_management_gateway())]
    management_gateway: Ipv4Addr,

    /// Upstream DNS servers.
    #[builder(default = default_dns_servers())]
    dns_servers: Vec<Ipv4Addr>,

    /// The host reverse proxy container joined to host-mode range networks.
    #[builder(default = Some(DEFAULT_REVERSE_PROXY_CONTAINER.to_string()))]
    reverse_proxy_container: Option<String>,
}

/// Settings for VyOS routers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct VyosSettings {
    /// The VyOS image.
    #[builder(default = DEFAULT_VYOS_IMAGE.to_string(), setter(into))]
    image: String,

    /// Settle delay after starting a router.
    #[builder(default = DEFAULT_VYOS_BOOT_DELAY_MS)]
    boot_delay_ms: u64,

    /// Deadline for readiness checks.
    #[builder(default = DEFAULT_VYOS_READY_TIMEOUT_SECS)]
    ready_timeout_secs: u64,

    /// Interval between readiness checks.
    #[builder(default = DEFAULT_VYOS_READY_INTERVAL_MS)]
    ready_interval_ms: u64,
}

/// Settings for VM workloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct VmSettings {
    /// Root directory of per-VM storage.
    #[builder(default = DEFAULT_VM_STORAGE_ROOT.clone())]
    storage_root: PathBuf,

    /// Root directory of cached ISO files.
    #[builder(default = DEFAULT_ISO_ROOT.clone())]
    iso_root: PathBuf,

    /// Image for Windows VMs.
    #[builder(default = DEFAULT_WINDOWS_IMAGE.to_string(), setter(into))]
    windows_image: String,

    /// Image for ISO-booted VMs.
    #[builder(default = DEFAULT_QEMU_IMAGE.to_string(), setter(into))]
    qemu_image: String,

    /// Delay before a container VM's default route is replaced.
    #[builder(default = DEFAULT_ROUTE_SETTLE_DELAY_MS)]
    route_settle_delay_ms: u64,

    /// Minimum free disk space in GiB.
    #[builder(default = DEFAULT_MIN_FREE_DISK_GB)]
    min_free_disk_gb: u64,

    /// Shared console user for KasmVNC.
    #[builder(default = DEFAULT_CONSOLE_USER.to_string(), setter(into))]
    console_user: String,

    /// Shared console password for KasmVNC.
    #[builder(default = DEFAULT_CONSOLE_PASSWORD.to_string(), setter(into))]
    console_password: String,
}

/// How console ports inside a sandbox are exposed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VncProxyMechanism {
    /// PREROUTING DNAT rules in the sandbox namespace.
    #[default]
    #[serde(rename = "iptables")]
    Iptables,

    /// An nginx stream proxy container inside the sandbox.
    #[serde(rename = "nginx")]
    Nginx,
}

/// Settings for console proxying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct ProxySettings {
    /// The mechanism used to expose console ports.
    #[builder(default)]
    mechanism: VncProxyMechanism,

    /// The first forwarded port.
    #[builder(default = DEFAULT_VNC_BASE_PORT)]
    base_port: u16,

    /// Image of the nginx stream proxy.
    #[builder(default = DEFAULT_NGINX_IMAGE.to_string(), setter(into))]
    nginx_image: String,

    /// Reverse proxy entrypoint for console routes.
    #[builder(default = DEFAULT_PROXY_ENTRYPOINT.to_string(), setter(into))]
    entrypoint: String,
}

/// Deployment policy knobs.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct OrchestrationSettings {
    /// Abort the deployment when the router cannot be created.
    #[builder(default)]
    abort_on_router_failure: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Settings {
    /// Loads settings from an optional YAML file and applies `CYROID_*` environment overrides.
    pub async fn load(path: Option<&Path>) -> CyroidResult<Self> {
        let mut settings = match path {
            Some(path) => {
                let contents = tokio::fs::read_to_string(path).await?;
                serde_yaml::from_str::<Settings>(&contents)?
            }
            None => Settings::default(),
        };

        settings.apply_env()?;
        settings.validate()?;

        Ok(settings)
    }

    /// Builds settings from defaults and environment variables only.
    pub fn from_env() -> CyroidResult<Self> {
        let mut settings = Settings::default();
        settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Overrides fields from `CYROID_*` environment variables.
    pub fn apply_env(&mut self) -> CyroidResult<()> {
        if let Some(v) = env_parse::<bool>("CYROID_DIND_ENABLED")? {
            self.dind.enabled = v;
        }
        if let Some(v) = env_var("CYROID_DIND_IMAGE") {
            self.dind.image = v;
        }
        if let Some(v) = env_parse("CYROID_DIND_STARTUP_TIMEOUT")? {
            self.dind.startup_timeout_secs = v;
        }
        if let Some(v) = env_parse("CYROID_DIND_DOCKER_PORT")? {
            self.dind.docker_port = v;
        }
        if let Some(v) = env_var("CYROID_RANGES_NETWORK") {
            self.dind.ranges_network_name = v;
        }
        if let Some(v) = env_parse("CYROID_RANGES_SUBNET")? {
            self.dind.ranges_network_subnet = v;
        }
        if let Some(v) = env_var("CYROID_MGMT_NETWORK") {
            self.network.management_network_name = v;
        }
        if let Some(v) = env_parse("CYROID_MGMT_SUBNET")? {
            self.network.management_subnet = v;
        }
        if let Some(v) = env_parse("CYROID_MGMT_GATEWAY")? {
            self.network.management_gateway = v;
        }
        if let Some(v) = env_var("CYROID_REVERSE_PROXY_CONTAINER") {
            self.network.reverse_proxy_container = (!v.is_empty()).then_some(v);
        }
        if let Some(v) = env_var("CYROID_VYOS_IMAGE") {
            self.vyos.image = v;
        }
        if let Some(v) = env_var("CYROID_VM_STORAGE_DIR") {
            self.vm.storage_root = PathBuf::from(v);
        }
        if let Some(v) = env_var("CYROID_ISO_DIR") {
            self.vm.iso_root = PathBuf::from(v);
        }
        if let Some(v) = env_var("CYROID_VNC_PROXY") {
            self.proxy.mechanism = match v.to_ascii_lowercase().as_str() {
                "iptables" => VncProxyMechanism::Iptables,
                "nginx" => VncProxyMechanism::Nginx,
                other => {
                    return Err(CyroidError::Config(format!(
                        "CYROID_VNC_PROXY must be `iptables` or `nginx`, got `{other}`"
                    )))
                }
            };
        }
        if let Some(v) = env_parse::<bool>("CYROID_ABORT_ON_ROUTER_FAILURE")? {
            self.orchestration.abort_on_router_failure = v;
        }

        Ok(())
    }

    /// Checks cross-field consistency.
    pub fn validate(&self) -> CyroidResult<()> {
        let mgmt = &self.network;
        if !mgmt.management_subnet.contains(mgmt.management_gateway) {
            return Err(CyroidError::Config(format!(
                "management gateway {} is outside {}",
                mgmt.management_gateway, mgmt.management_subnet
            )));
        }

        if self.dind.poll_interval_ms == 0 || self.vyos.ready_interval_ms == 0 {
            return Err(CyroidError::Config(
                "poll intervals must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

impl DindSettings {
    /// The readiness deadline as a duration.
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// The readiness poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl VyosSettings {
    /// The post-start settle delay as a duration.
    pub fn boot_delay(&self) -> Duration {
        Duration::from_millis(self.boot_delay_ms)
    }

    /// The readiness deadline as a duration.
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    /// The readiness poll interval as a duration.
    pub fn ready_interval(&self) -> Duration {
        Duration::from_millis(self.ready_interval_ms)
    }
}

impl VmSettings {
    /// The route settle delay as a duration.
    pub fn route_settle_delay(&self) -> Duration {
        Duration::from_millis(self.route_settle_delay_ms)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for DindSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for VyosSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for VmSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn default_ranges_subnet() -> Ipv4Network {
    DEFAULT_RANGES_NETWORK_SUBNET
        .parse()
        .expect("default ranges subnet is a valid CIDR")
}

fn default_management_subnet() -> Ipv4Network {
    DEFAULT_MANAGEMENT_SUBNET
        .parse()
        .expect("default management subnet is a valid CIDR")
}

fn default_management_gateway() -> Ipv4Addr {
    DEFAULT_MANAGEMENT_GATEWAY
        .parse()
        .expect("default management gateway is a valid address")
}

fn default_dns_servers() -> Vec<Ipv4Addr> {
    DEFAULT_DNS_SERVERS
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect()
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_parse<T: FromStr>(key: &str) -> CyroidResult<Option<T>> {
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| CyroidError::Config(format!("invalid value for {key}: `{value}`"))),
        Err(_) => Ok(None),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::default();
        assert!(*settings.get_dind().get_enabled());
        assert_eq!(settings.get_dind().get_docker_port(), &2375);
        assert_eq!(settings.get_dind().startup_timeout(), Duration::from_secs(60));
        assert_eq!(settings.get_proxy().get_base_port(), &15900);
        assert_eq!(
            settings.get_network().get_management_gateway(),
            &Ipv4Addr::new(10, 10, 0, 1)
        );
        assert_eq!(settings.get_network().get_dns_servers().len(), 2);
        assert!(!*settings.get_orchestration().get_abort_on_router_failure());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_yaml_partial_override() -> anyhow::Result<()> {
        let yaml = r#"
dind:
  image: docker:27-dind
  startup_timeout_secs: 5
proxy:
  mechanism: nginx
"#;
        let settings: Settings = serde_yaml::from_str(yaml)?;
        assert_eq!(settings.get_dind().get_image(), "docker:27-dind");
        assert_eq!(settings.get_dind().get_startup_timeout_secs(), &5);
        assert_eq!(settings.get_dind().get_docker_port(), &2375);
        assert_eq!(
            settings.get_proxy().get_mechanism(),
            &VncProxyMechanism::Nginx
        );
        Ok(())
    }

    #[test]
    fn test_settings_rejects_gateway_outside_subnet() {
        let settings = Settings::builder()
            .network(
                NetworkSettings::builder()
                    .management_gateway(Ipv4Addr::new(192, 168, 1, 1))
                    .build(),
            )
            .build();
        assert!(matches!(settings.validate(), Err(CyroidError::Config(_))));
    }

    #[test]
    #[serial]
    fn test_settings_env_overrides() -> anyhow::Result<()> {
        unsafe {
            env::set_var("CYROID_DIND_IMAGE", "docker:26-dind");
            env::set_var("CYROID_DIND_DOCKER_PORT", "2376");
            env::set_var("CYROID_VNC_PROXY", "NGINX");
        }

        let settings = Settings::from_env();

        unsafe {
            env::remove_var("CYROID_DIND_IMAGE");
            env::remove_var("CYROID_DIND_DOCKER_PORT");
            env::remove_var("CYROID_VNC_PROXY");
        }

        let settings = settings?;
        assert_eq!(settings.get_dind().get_image(), "docker:26-dind");
        assert_eq!(settings.get_dind().get_docker_port(), &2376);
        assert_eq!(
            settings.get_proxy().get_mechanism(),
            &VncProxyMechanism::Nginx
        );
        Ok(())
    }

    #[test]
    #[serial]
    fn test_settings_env_rejects_garbage() {
        unsafe {
            env::set_var("CYROID_DIND_DOCKER_PORT", "not-a-port");
        }
        let result = Settings::from_env();
        unsafe {
            env::remove_var("CYROID_DIND_DOCKER_PORT");
        }
        assert!(matches!(result, Err(CyroidError::Config(_))));
    }
}
