use std::{
    collections::{BTreeMap, HashMap},
    net::Ipv4Addr,
    path::Path,
    sync::Arc,
};

use serde::Serialize;
use uuid::Uuid;

use crate::{
    config::Settings,
    dind::DindManager,
    docker::DockerApi,
    models::{Architecture, Network, Range, Vm},
    orchestration::{resolve_image, ResolvedImage, VmStrategy},
    store::RangeStore,
    CyroidResult,
};

use super::DiskProbe;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const GIB: u64 = 1024 * 1024 * 1024;

/// Headroom required over the requested VM disks, in percent.
const DISK_HEADROOM_PERCENT: u64 = 120;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Checks whether a range can be deployed without touching anything.
pub struct DeploymentValidator {
    settings: Settings,
    host: Arc<dyn DockerApi>,
    dind: Arc<DindManager>,
    store: Arc<dyn RangeStore>,
    disks: Arc<dyn DiskProbe>,
}

/// The outcome of a validation run. The range is deployable when `errors` is empty.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    /// Whether no errors were found.
    pub valid: bool,

    /// Problems that would make deployment fail.
    pub errors: Vec<String>,

    /// Problems deployment survives, such as emulated architectures.
    pub warnings: Vec<String>,

    /// What was checked and found fine.
    pub info: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DeploymentValidator {
    /// Creates a validator reading images from `host` (or a range's sandbox) and disk space
    /// from `disks`.
    pub fn new(
        settings: Settings,
        host: Arc<dyn DockerApi>,
        dind: Arc<DindManager>,
        store: Arc<dyn RangeStore>,
        disks: Arc<dyn DiskProbe>,
    ) -> Self {
        Self {
            settings,
            host,
            dind,
            store,
            disks,
        }
    }

    /// Validates a range. Only a missing range is an error; every finding is reported in the
    /// result.
    pub async fn validate_range(&self, range_id: Uuid) -> CyroidResult<ValidationResult> {
        let range = self.store.require_range(range_id).await?;
        let networks = self.store.list_networks(range_id).await?;
        let vms = self.store.list_vms(range_id).await?;

        let mut result = ValidationResult::default();
        let docker = self.image_daemon(&range, &mut result).await;

        for vm in &vms {
            self.check_image(docker.as_ref(), vm, &mut result).await;
        }
        self.check_disk_space(&vms, &mut result);
        check_addresses(&networks, &vms, &mut result);

        result.valid = result.errors.is_empty();
        tracing::info!(
            %range_id,
            valid = result.valid,
            errors = result.errors.len(),
            warnings = result.warnings.len(),
            "range validated"
        );
        Ok(result)
    }

    /// The daemon whose image cache VMs will be created from: the sandbox when it is up,
    /// otherwise the host.
    async fn image_daemon(&self, range: &Range, result: &mut ValidationResult) -> Arc<dyn DockerApi> {
        if !*self.settings.get_dind().get_enabled() {
            return self.host.clone();
        }

        match &range.sandbox {
            Some(sandbox) => match self.dind.get_range_client(range.id, &sandbox.docker_url).await {
                Ok(client) => return client,
                Err(e) => result.warnings.push(format!(
                    "sandbox daemon unreachable ({e}), checking the host image cache instead"
                )),
            },
            None => result
                .info
                .push("range has no sandbox yet, checking the host image cache".to_string()),
        }
        self.host.clone()
    }

    async fn check_image(&self, docker: &dyn DockerApi, vm: &Vm, result: &mut ValidationResult) {
        let resolved = match resolve_image(vm, self.store.as_ref(), &self.settings).await {
            Ok(resolved) => resolved,
            Err(e) => {
                result
                    .errors
                    .push(format!("{}: image cannot be resolved: {e}", vm.hostname));
                return;
            }
        };

        match &resolved.strategy {
            VmStrategy::CustomIso { path } => check_file(&vm.hostname, path, result).await,
            VmStrategy::Windows { iso: Some(path), .. } => {
                check_file(&vm.hostname, path, result).await
            }
            _ => {}
        }

        let image = resolved.container_image(&self.settings);
        match docker.image_exists(&image).await {
            Ok(true) => {
                result
                    .info
                    .push(format!("{}: image {image} is available", vm.hostname));
                self.check_architecture(docker, vm, &image, &resolved, result)
                    .await;
            }
            Ok(false) => result
                .errors
                .push(format!("{}: image {image} is not present locally", vm.hostname)),
            Err(e) => result
                .warnings
                .push(format!("{}: could not inspect image {image}: {e}", vm.hostname)),
        }
    }

    async fn check_architecture(
        &self,
        docker: &dyn DockerApi,
        vm: &Vm,
        image: &str,
        resolved: &ResolvedImage,
        result: &mut ValidationResult,
    ) {
        let Some(host) = Architecture::host() else {
            result
                .warnings
                .push(format!("{}: host architecture not recognized", vm.hostname));
            return;
        };

        let reported = docker
            .image_architecture(image)
            .await
            .ok()
            .flatten()
            .and_then(|arch| docker_architecture(&arch));
        let architecture = reported.unwrap_or(resolved.architecture);

        if architecture != host {
            result.warnings.push(format!(
                "{}: {image} is built for {architecture:?} and will run emulated on {host:?}",
                vm.hostname
            ));
        }
    }

    fn check_disk_space(&self, vms: &[Vm], result: &mut ValidationResult) {
        let requested_gb: u64 = vms.iter().map(|vm| u64::from(vm.resources.disk_gb)).sum();
        let required_gb = (requested_gb * DISK_HEADROOM_PERCENT)
            .div_ceil(100)
            .max(*self.settings.get_vm().get_min_free_disk_gb());

        let storage_root = self.settings.get_vm().get_storage_root();
        match self.disks.available_bytes(storage_root) {
            Some(available) if available >= required_gb * GIB => result.info.push(format!(
                "{} GiB free under {}, {required_gb} GiB required",
                available / GIB,
                storage_root.display()
            )),
            Some(available) => result.errors.push(format!(
                "insufficient disk space under {}: {} GiB free, {required_gb} GiB required",
                storage_root.display(),
                available / GIB
            )),
            None => result.warnings.push(format!(
                "could not determine free space under {}",
                storage_root.display()
            )),
        }
    }
}

impl ValidationResult {
    /// Whether the range may be deployed.
    pub fn is_deployable(&self) -> bool {
        self.valid
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn check_file(hostname: &str, path: &Path, result: &mut ValidationResult) {
    match tokio::fs::try_exists(path).await {
        Ok(true) => result
            .info
            .push(format!("{hostname}: {} is present", path.display())),
        Ok(false) => result
            .errors
            .push(format!("{hostname}: {} does not exist", path.display())),
        Err(e) => result
            .warnings
            .push(format!("{hostname}: could not check {}: {e}", path.display())),
    }
}

/// Duplicate addresses within a network, and addresses outside their network's subnet or on
/// the router's gateway.
fn check_addresses(networks: &[Network], vms: &[Vm], result: &mut ValidationResult) {
    let by_id: HashMap<Uuid, &Network> = networks.iter().map(|n| (n.id, n)).collect();
    let mut seen: BTreeMap<(Uuid, Ipv4Addr), &str> = BTreeMap::new();

    for vm in vms {
        let Some(network) = by_id.get(&vm.network_id) else {
            result.errors.push(format!(
                "{}: network {} does not belong to the range",
                vm.hostname, vm.network_id
            ));
            continue;
        };

        if !network.subnet.contains(vm.ip_address) {
            result.errors.push(format!(
                "{}: {} is outside {} ({})",
                vm.hostname, vm.ip_address, network.name, network.subnet
            ));
        } else if vm.ip_address == network.gateway {
            result.errors.push(format!(
                "{}: {} is the gateway of {}",
                vm.hostname, vm.ip_address, network.name
            ));
        }

        if let Some(other) = seen.insert((network.id, vm.ip_address), &vm.hostname) {
            result.errors.push(format!(
                "duplicate IP {} on {}: {} and {}",
                vm.ip_address, network.name, other, vm.hostname
            ));
        }
    }
}

/// Maps Docker's architecture names onto ours.
fn docker_architecture(name: &str) -> Option<Architecture> {
    match name {
        "amd64" | "x86_64" => Some(Architecture::X86_64),
        "arm64" | "aarch64" => Some(Architecture::Aarch64),
        _ => None,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::{
        config::DindSettings,
        dind::RangeClientRegistry,
        models::ImageFamily,
        testing::{MockConnector, RangeFixture},
        validator::FixedDiskProbe,
        CyroidError,
    };

    const IMAGE: &str = "ubuntu:22.04";

    fn validator(fx: &RangeFixture, free_gb: Option<u64>) -> DeploymentValidator {
        let settings = Settings::builder()
            .dind(DindSettings::builder().enabled(false).build())
            .build();
        let registry = Arc::new(RangeClientRegistry::new(Arc::new(MockConnector::new(
            fx.nested.clone(),
        ))));
        let dind = Arc::new(DindManager::new(
            fx.host.clone(),
            registry,
            settings.get_dind().clone(),
        ));

        DeploymentValidator::new(
            settings,
            fx.host.clone(),
            dind,
            fx.store.clone(),
            Arc::new(FixedDiskProbe(free_gb.map(|gb| gb * GIB))),
        )
    }

    #[tokio::test]
    async fn test_valid_range() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        let lan = fx.add_network("lan", "10.0.1.0/24").await?;
        fx.add_container_vm(&lan, "web01", Ipv4Addr::new(10, 0, 1, 10), IMAGE, ImageFamily::GenericContainer)
            .await?;
        fx.host.add_image(IMAGE, None);

        let result = validator(&fx, Some(500)).validate_range(fx.range_id).await?;
        assert!(result.valid, "{result:?}");
        assert!(result.errors.is_empty());
        assert!(result.info.iter().any(|i| i.contains(IMAGE)));
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_ip_is_an_error() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        let lan = fx.add_network("lan", "10.0.1.0/24").await?;
        for hostname in ["web01", "web02"] {
            fx.add_container_vm(&lan, hostname, Ipv4Addr::new(10, 0, 1, 10), IMAGE, ImageFamily::GenericContainer)
                .await?;
        }
        fx.host.add_image(IMAGE, None);

        let result = validator(&fx, Some(500)).validate_range(fx.range_id).await?;
        assert!(!result.valid);
        assert!(!result.is_deployable());
        assert!(result.errors.iter().any(|e| e.contains("duplicate")));
        Ok(())
    }

    #[tokio::test]
    async fn test_address_outside_subnet_is_an_error() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        let lan = fx.add_network("lan", "10.0.1.0/24").await?;
        fx.add_container_vm(&lan, "web01", Ipv4Addr::new(10, 0, 2, 10), IMAGE, ImageFamily::GenericContainer)
            .await?;
        fx.add_container_vm(&lan, "web02", Ipv4Addr::new(10, 0, 1, 1), IMAGE, ImageFamily::GenericContainer)
            .await?;
        fx.host.add_image(IMAGE, None);

        let result = validator(&fx, Some(500)).validate_range(fx.range_id).await?;
        assert_eq!(result.errors.len(), 2, "{result:?}");
        assert!(result.errors.iter().any(|e| e.contains("outside")));
        assert!(result.errors.iter().any(|e| e.contains("gateway")));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_image_and_disk_space() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        let lan = fx.add_network("lan", "10.0.1.0/24").await?;
        fx.add_container_vm(&lan, "web01", Ipv4Addr::new(10, 0, 1, 10), IMAGE, ImageFamily::GenericContainer)
            .await?;

        // One 40 GiB disk needs 48 GiB.
        let result = validator(&fx, Some(47)).validate_range(fx.range_id).await?;
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("not present locally")));
        assert!(result.errors.iter().any(|e| e.contains("48 GiB required")));

        let result = validator(&fx, None).validate_range(fx.range_id).await?;
        assert!(result.warnings.iter().any(|w| w.contains("free space")));
        Ok(())
    }

    #[tokio::test]
    async fn test_disk_floor_applies_to_small_ranges() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        let result = validator(&fx, Some(10)).validate_range(fx.range_id).await?;
        assert!(result.errors.iter().any(|e| e.contains("20 GiB required")));
        Ok(())
    }

    #[tokio::test]
    async fn test_architecture_mismatch_is_a_warning() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        let lan = fx.add_network("lan", "10.0.1.0/24").await?;
        fx.add_container_vm(&lan, "web01", Ipv4Addr::new(10, 0, 1, 10), IMAGE, ImageFamily::GenericContainer)
            .await?;

        let foreign = match Architecture::host() {
            Some(Architecture::Aarch64) => "amd64",
            _ => "arm64",
        };
        fx.host.add_image(IMAGE, Some(foreign));

        let result = validator(&fx, Some(500)).validate_range(fx.range_id).await?;
        assert!(result.valid, "{result:?}");
        assert!(result.warnings.iter().any(|w| w.contains("emulated")));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_range_is_raised() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        let result = validator(&fx, Some(500)).validate_range(Uuid::new_v4()).await;
        assert!(matches!(result, Err(CyroidError::RangeNotFound(_))));
        Ok(())
    }
}
