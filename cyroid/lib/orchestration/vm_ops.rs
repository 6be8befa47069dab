use std::{collections::BTreeMap, sync::Arc};

use uuid::Uuid;

use crate::{
    docker::DockerApi,
    isolation::VncTarget,
    models::{DeploymentEvent, EventType, LinuxUser, Network, Range, Vm, VmStatus, VncProxyMapping},
    proxy::ConsoleRequest,
    utils::{docker_network_name, truncate_message, vm_container_name, VM_ERROR_MAX_LEN},
    CyroidError, CyroidResult,
};

use super::{
    build_container_spec, default_route_command, resolve_image, user_provisioning_commands,
    Orchestrator,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Grace period when stopping a VM container.
pub(super) const VM_STOP_TIMEOUT_SECS: i64 = 10;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Creates (or starts) the container of a single VM in a deployed range. A failure marks the
    /// VM `ERROR` and is returned.
    pub async fn deploy_vm(&self, vm_id: Uuid) -> CyroidResult<Vm> {
        let mut vm = self.store.require_vm(vm_id).await?;
        let range = self.store.require_range(vm.range_id).await?;
        let docker = self.target_docker(&range).await?;
        let networks = self.store.list_networks(range.id).await?;

        match self.launch_vm(&range, &docker, &networks, &mut vm).await {
            Ok(()) => Ok(vm),
            Err(e) => {
                self.fail_vm(&mut vm, &e).await;
                Err(e)
            }
        }
    }

    /// Starts the existing container of a VM.
    pub async fn start_vm(&self, vm_id: Uuid) -> CyroidResult<Vm> {
        let (mut vm, docker, container_id) = self.vm_container(vm_id).await?;
        docker.start_container(&container_id).await?;

        vm.status = VmStatus::Running;
        vm.error_message = None;
        self.store.save_vm(&vm).await?;
        self.emit_vm(&vm, EventType::VmStarted, format!("{} started", vm.hostname));
        Ok(vm)
    }

    /// Stops the container of a VM.
    pub async fn stop_vm(&self, vm_id: Uuid) -> CyroidResult<Vm> {
        let (mut vm, docker, container_id) = self.vm_container(vm_id).await?;
        docker
            .stop_container(&container_id, VM_STOP_TIMEOUT_SECS)
            .await?;

        vm.status = VmStatus::Stopped;
        self.store.save_vm(&vm).await?;
        self.emit_vm(&vm, EventType::VmStopped, format!("{} stopped", vm.hostname));
        Ok(vm)
    }

    /// Restarts the container of a VM.
    pub async fn restart_vm(&self, vm_id: Uuid) -> CyroidResult<Vm> {
        let (mut vm, docker, container_id) = self.vm_container(vm_id).await?;
        docker
            .restart_container(&container_id, VM_STOP_TIMEOUT_SECS)
            .await?;

        vm.status = VmStatus::Running;
        vm.error_message = None;
        self.store.save_vm(&vm).await?;
        self.emit_vm(&vm, EventType::VmStarted, format!("{} restarted", vm.hostname));
        Ok(vm)
    }

    /// Removes a VM: its container, its console mapping and its record.
    pub async fn delete_vm(&self, vm_id: Uuid) -> CyroidResult<()> {
        let vm = self.store.require_vm(vm_id).await?;
        let mut range = self.store.require_range(vm.range_id).await?;

        if let Some(container_id) = &vm.container_id {
            let docker = self.target_docker(&range).await?;
            match docker.remove_container(container_id, true).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    tracing::debug!(%vm_id, "vm container already gone");
                }
                Err(e) => return Err(e),
            }
        }

        if range.vnc_proxy_mappings.remove(&vm_id).is_some() {
            self.save_range(&mut range).await?;
        }
        self.store.delete_vm(vm_id).await?;

        tracing::info!(range_id = %range.id, %vm_id, hostname = %vm.hostname, "vm deleted");
        Ok(())
    }

    /// Returns the console mapping of a VM, creating it on first use. VMs that are not running,
    /// and ranges without a sandbox, have none.
    pub async fn ensure_vnc_mapping(&self, vm_id: Uuid) -> CyroidResult<Option<VncProxyMapping>> {
        let vm = self.store.require_vm(vm_id).await?;
        let mut range = self.store.require_range(vm.range_id).await?;

        if let Some(mapping) = range.vnc_proxy_mappings.get(&vm_id) {
            return Ok(Some(mapping.clone()));
        }
        if !self.is_dind() || vm.status != VmStatus::Running || vm.container_id.is_none() {
            return Ok(None);
        }

        let mappings = self.expose_consoles(&range, range.vnc_proxy_mappings.clone()).await?;
        range.vnc_proxy_mappings = mappings;
        self.save_range(&mut range).await?;
        Ok(range.vnc_proxy_mappings.get(&vm_id).cloned())
    }

    /// Brings up one VM. Errors leave the VM for the caller to mark as failed.
    pub(super) async fn launch_vm(
        &self,
        range: &Range,
        docker: &Arc<dyn DockerApi>,
        networks: &[Network],
        vm: &mut Vm,
    ) -> CyroidResult<()> {
        if let Some(container_id) = vm.container_id.clone() {
            self.emit_vm(vm, EventType::VmCreating, format!("starting {}", vm.hostname));
            match docker.start_container(&container_id).await {
                Ok(()) => {
                    vm.status = VmStatus::Running;
                    vm.error_message = None;
                    self.store.save_vm(vm).await?;
                    self.emit_vm(vm, EventType::VmStarted, format!("{} started", vm.hostname));
                    return Ok(());
                }
                Err(e) if e.is_not_found() => {
                    tracing::warn!(vm_id = %vm.id, "vm container vanished, recreating it");
                    vm.container_id = None;
                }
                Err(e) => return Err(e),
            }
        }

        let network = networks
            .iter()
            .find(|n| n.id == vm.network_id)
            .ok_or_else(|| CyroidError::NetworkNotFound(vm.network_id.to_string()))?;
        if network.docker_network_id.is_none() {
            return Err(CyroidError::InvalidState(format!(
                "network {} is not provisioned",
                network.name
            )));
        }

        let resolved = resolve_image(vm, self.store.as_ref(), &self.settings).await?;
        let image = resolved.container_image(&self.settings);
        if !docker.image_exists(&image).await? {
            tracing::info!(vm_id = %vm.id, %image, "pulling vm image");
            docker.pull_image(&image).await?;
        }

        let spec = build_container_spec(
            range.id,
            vm,
            network,
            &docker_network_name(&range.id, &network.name),
            &resolved,
            &self.settings,
        )?;

        vm.status = VmStatus::Creating;
        self.store.save_vm(vm).await?;
        self.emit_vm(vm, EventType::VmCreating, format!("creating {}", vm.hostname));

        let container_id = match docker.create_container(&spec).await {
            Ok(id) => id,
            Err(e) if e.is_already_exists() => {
                tracing::warn!(vm_id = %vm.id, container = %spec.name, "vm container already exists, reusing it");
                docker.inspect_container(&spec.name).await?.id
            }
            Err(e) => return Err(e),
        };
        vm.container_id = Some(container_id.clone());
        self.store.save_vm(vm).await?;
        docker.start_container(&container_id).await?;

        if !resolved.strategy.is_qemu() {
            tokio::time::sleep(self.settings.get_vm().route_settle_delay()).await;
            let route = default_route_command(network.gateway);
            let result = docker
                .exec(&container_id, &route, true)
                .await
                .and_then(|output| output.check(route.join(" ")));
            if let Err(e) = result {
                tracing::warn!(vm_id = %vm.id, gateway = %network.gateway, error = %e, "failed to set default route");
            }
        }

        if resolved.family.provisions_user() {
            if let Some(user) = &vm.linux_user {
                if let Err(e) = self.provision_user(docker, &container_id, user).await {
                    tracing::warn!(vm_id = %vm.id, error = %e, "failed to provision linux user");
                }
            }
        }

        vm.status = VmStatus::Running;
        vm.error_message = None;
        self.store.save_vm(vm).await?;
        self.emit_vm(
            vm,
            EventType::VmStarted,
            format!("{} started from {image}", vm.hostname),
        );
        tracing::info!(vm_id = %vm.id, hostname = %vm.hostname, ip = %vm.ip_address, "vm running");
        Ok(())
    }

    /// Marks a VM failed. Persistence failures are logged.
    pub(super) async fn fail_vm(&self, vm: &mut Vm, error: &CyroidError) {
        vm.status = VmStatus::Error;
        vm.error_message = Some(truncate_message(&error.to_string(), VM_ERROR_MAX_LEN));
        if let Err(e) = self.store.save_vm(vm).await {
            tracing::error!(vm_id = %vm.id, error = %e, "failed to persist vm failure");
        }
        self.emit_vm(vm, EventType::VmError, format!("{} failed: {error}", vm.hostname));
    }

    /// Exposes the console of every running VM of a range, keeping the ports in `existing`.
    pub(super) async fn expose_consoles(
        &self,
        range: &Range,
        existing: BTreeMap<Uuid, VncProxyMapping>,
    ) -> CyroidResult<BTreeMap<Uuid, VncProxyMapping>> {
        let sandbox = range
            .sandbox
            .as_ref()
            .ok_or_else(|| CyroidError::SandboxNotFound(range.id.to_string()))?;

        let mut targets = Vec::new();
        for vm in self.store.list_vms(range.id).await? {
            if vm.status != VmStatus::Running || vm.container_id.is_none() {
                continue;
            }
            match resolve_image(&vm, self.store.as_ref(), &self.settings).await {
                Ok(resolved) => targets.push(VncTarget {
                    vm_id: vm.id,
                    container_name: vm_container_name(&range.id, &vm.hostname),
                    ip: vm.ip_address,
                    port: resolved.family.vnc_port(),
                }),
                Err(e) => tracing::warn!(vm_id = %vm.id, error = %e, "no console for vm"),
            }
        }

        let (networks, _) = self.provisioned_network_names(range.id).await?;
        self.proxy
            .expose(ConsoleRequest {
                range_id: range.id,
                sandbox,
                networks: &networks,
                existing: &existing,
                targets: &targets,
            })
            .await
    }

    async fn provision_user(
        &self,
        docker: &Arc<dyn DockerApi>,
        container_id: &str,
        user: &LinuxUser,
    ) -> CyroidResult<()> {
        for command in user_provisioning_commands(user)? {
            docker
                .exec(container_id, &command, true)
                .await?
                .check(format!("provision user {}", user.username))?;
        }
        Ok(())
    }

    async fn vm_container(&self, vm_id: Uuid) -> CyroidResult<(Vm, Arc<dyn DockerApi>, String)> {
        let vm = self.store.require_vm(vm_id).await?;
        let container_id = vm
            .container_id
            .clone()
            .ok_or_else(|| CyroidError::InvalidState(format!("vm {} has no container", vm.hostname)))?;
        let range = self.store.require_range(vm.range_id).await?;
        let docker = self.target_docker(&range).await?;
        Ok((vm, docker, container_id))
    }

    pub(super) fn emit_vm(&self, vm: &Vm, event_type: EventType, message: String) {
        self.emit(DeploymentEvent::new(vm.range_id, event_type, message).with_vm(vm.id));
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use crate::{
        config::Settings,
        models::{ImageFamily, LinuxUser, VmStatus},
        store::RangeStore,
        testing::RangeFixture,
        utils::vm_container_name,
    };

    const DESKTOP_IMAGE: &str = "kasmweb/ubuntu-jammy-desktop:1.15.0";

    #[tokio::test(start_paused = true)]
    async fn test_vnc_mapping_keeps_existing_ports() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        let lan = fx.add_network("lan", "10.0.1.0/24").await?;
        let ws = fx
            .add_container_vm(&lan, "ws01", Ipv4Addr::new(10, 0, 1, 10), DESKTOP_IMAGE, ImageFamily::KasmVnc)
            .await?;
        fx.orchestrator.deploy_range(fx.range_id).await?;

        let first = fx.range().await?.vnc_proxy_mappings[&ws.id].clone();
        assert_eq!(first.proxy_port, 15900);

        let ws2 = fx
            .add_container_vm(&lan, "ws02", Ipv4Addr::new(10, 0, 1, 11), DESKTOP_IMAGE, ImageFamily::KasmVnc)
            .await?;
        assert_eq!(fx.orchestrator.ensure_vnc_mapping(ws2.id).await?, None);

        let ws2 = fx.orchestrator.deploy_vm(ws2.id).await?;
        assert_eq!(ws2.status, VmStatus::Running);

        let mapping = fx
            .orchestrator
            .ensure_vnc_mapping(ws2.id)
            .await?
            .expect("running vm gets a console");
        assert_eq!(mapping.proxy_port, 15901);
        assert_eq!(mapping.original_port, 6901);

        let range = fx.range().await?;
        assert_eq!(range.vnc_proxy_mappings[&ws.id], first);
        assert_eq!(fx.orchestrator.ensure_vnc_mapping(ws2.id).await?, Some(mapping));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_vm_removes_container_and_mapping() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        let lan = fx.add_network("lan", "10.0.1.0/24").await?;
        let ws = fx
            .add_container_vm(&lan, "ws01", Ipv4Addr::new(10, 0, 1, 10), DESKTOP_IMAGE, ImageFamily::KasmVnc)
            .await?;
        fx.orchestrator.deploy_range(fx.range_id).await?;

        fx.orchestrator.delete_vm(ws.id).await?;

        assert!(fx.store.get_vm(ws.id).await?.is_none());
        assert!(fx.range().await?.vnc_proxy_mappings.is_empty());
        assert!(fx
            .nested
            .container_by_name(&vm_container_name(&fx.range_id, "ws01"))
            .is_none());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_start_and_restart_vm() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        let lan = fx.add_network("lan", "10.0.1.0/24").await?;
        let ws = fx
            .add_container_vm(&lan, "ws01", Ipv4Addr::new(10, 0, 1, 10), DESKTOP_IMAGE, ImageFamily::KasmVnc)
            .await?;
        fx.orchestrator.deploy_range(fx.range_id).await?;
        let name = vm_container_name(&fx.range_id, "ws01");

        assert_eq!(fx.orchestrator.stop_vm(ws.id).await?.status, VmStatus::Stopped);
        assert!(!fx.nested.container_by_name(&name).expect("container").running);

        assert_eq!(fx.orchestrator.start_vm(ws.id).await?.status, VmStatus::Running);
        assert!(fx.nested.container_by_name(&name).expect("container").running);

        assert_eq!(fx.orchestrator.restart_vm(ws.id).await?.status, VmStatus::Running);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_deploy_vm_failure_marks_vm_error() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        let lan = fx.add_network("lan", "10.0.1.0/24").await?;
        fx.orchestrator.deploy_range(fx.range_id).await?;

        let broken = fx
            .add_container_vm(&lan, "broken", Ipv4Addr::new(10, 0, 1, 20), "broken:latest", ImageFamily::GenericContainer)
            .await?;
        fx.nested.fail_create_for_image("broken:latest");

        assert!(fx.orchestrator.deploy_vm(broken.id).await.is_err());
        let broken = fx.vm(broken.id).await?;
        assert_eq!(broken.status, VmStatus::Error);
        assert!(broken.error_message.is_some());
        assert_eq!(broken.container_id, None);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_linux_user_is_provisioned() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        let lan = fx.add_network("lan", "10.0.1.0/24").await?;
        let mut ws = fx
            .add_container_vm(&lan, "ws01", Ipv4Addr::new(10, 0, 1, 10), DESKTOP_IMAGE, ImageFamily::KasmVnc)
            .await?;
        ws.linux_user = Some(LinuxUser {
            username: "analyst".into(),
            password: "s3cret".into(),
            sudo: true,
        });
        fx.store.save_vm(&ws).await?;

        fx.orchestrator.deploy_range(fx.range_id).await?;

        let container_id = fx.vm(ws.id).await?.container_id.expect("container");
        let user_execs: Vec<_> = fx
            .nested
            .execs()
            .into_iter()
            .filter(|e| e.container == container_id && e.cmd.contains(&"analyst".to_string()))
            .collect();
        assert_eq!(user_execs.len(), 3);
        Ok(())
    }
}
