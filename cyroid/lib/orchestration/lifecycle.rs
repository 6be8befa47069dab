use uuid::Uuid;

use crate::{
    models::{DeploymentEvent, EventType, Range, RangeStatus, RouterStatus, VmStatus},
    CyroidError, CyroidResult,
};

use super::{vm_ops::VM_STOP_TIMEOUT_SECS, Orchestrator};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Stops a running range: VMs first, then the router. The sandbox keeps running so its
    /// forwarding rules survive.
    pub async fn stop_range(&self, range_id: Uuid) -> CyroidResult<Range> {
        let mut range = self.store.require_range(range_id).await?;
        if range.status != RangeStatus::Running {
            return Err(CyroidError::InvalidState(format!(
                "range {} cannot be stopped while {}",
                range.name, range.status
            )));
        }
        let docker = self.target_docker(&range).await?;

        for mut vm in self.store.list_vms(range_id).await? {
            let Some(container_id) = vm.container_id.clone() else {
                continue;
            };
            match docker.stop_container(&container_id, VM_STOP_TIMEOUT_SECS).await {
                Ok(()) => {
                    vm.status = VmStatus::Stopped;
                    self.store.save_vm(&vm).await?;
                    self.emit_vm(&vm, EventType::VmStopped, format!("{} stopped", vm.hostname));
                }
                Err(e) => {
                    tracing::warn!(%range_id, vm_id = %vm.id, error = %e, "failed to stop vm");
                }
            }
        }

        if let Some(mut router) = self.store.get_router(range_id).await? {
            if let Some(container_id) = router.container_id.clone() {
                match self.vyos(docker.clone()).stop_router(&container_id).await {
                    Ok(()) => {
                        router.status = RouterStatus::Stopped;
                        self.store.save_router(&router).await?;
                    }
                    Err(e) => tracing::warn!(%range_id, error = %e, "failed to stop router"),
                }
            }
        }

        range.status = RangeStatus::Stopped;
        self.save_range(&mut range).await?;
        self.emit(DeploymentEvent::new(
            range_id,
            EventType::RangeStopped,
            format!("range {} stopped", range.name),
        ));
        Ok(range)
    }

    /// Starts a stopped range: router first, then VMs. VMs that fail to start are marked
    /// `ERROR`.
    pub async fn start_range(&self, range_id: Uuid) -> CyroidResult<Range> {
        let mut range = self.store.require_range(range_id).await?;
        if range.status != RangeStatus::Stopped {
            return Err(CyroidError::InvalidState(format!(
                "range {} cannot be started while {}",
                range.name, range.status
            )));
        }

        if self.is_dind() {
            self.ensure_sandbox(&mut range).await?;
        }
        let docker = self.target_docker(&range).await?;

        if let Some(mut router) = self.store.get_router(range_id).await? {
            if let Some(container_id) = router.container_id.clone() {
                match self.vyos(docker.clone()).start_router(&container_id).await {
                    Ok(()) => {
                        tokio::time::sleep(self.settings.get_vyos().boot_delay()).await;
                        router.status = RouterStatus::Running;
                        router.error_message = None;
                        self.store.save_router(&router).await?;
                    }
                    Err(e) => tracing::warn!(%range_id, error = %e, "failed to start router"),
                }
            }
        }

        for mut vm in self.store.list_vms(range_id).await? {
            let Some(container_id) = vm.container_id.clone() else {
                continue;
            };
            match docker.start_container(&container_id).await {
                Ok(()) => {
                    vm.status = VmStatus::Running;
                    vm.error_message = None;
                    self.store.save_vm(&vm).await?;
                    self.emit_vm(&vm, EventType::VmStarted, format!("{} started", vm.hostname));
                }
                Err(e) => {
                    tracing::warn!(%range_id, vm_id = %vm.id, error = %e, "failed to start vm");
                    self.fail_vm(&mut vm, &e).await;
                }
            }
        }

        range.status = RangeStatus::Running;
        range.error_message = None;
        self.save_range(&mut range).await?;
        self.emit(DeploymentEvent::new(
            range_id,
            EventType::RangeStarted,
            format!("range {} started", range.name),
        ));
        Ok(range)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
