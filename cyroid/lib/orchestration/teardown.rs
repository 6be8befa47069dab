use std::collections::BTreeMap;

use uuid::Uuid;

use crate::{
    docker::DockerApi,
    models::{DeploymentEvent, EventType, Range, RangeStatus, RouterStatus, VmStatus},
    CyroidError, CyroidResult,
};

use super::Orchestrator;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Removes everything a range deployed and returns it to `DRAFT`.
    ///
    /// Every removal is attempted on its own; a failing one is logged and the rest still run.
    /// Records are reset either way.
    pub async fn teardown_range(&self, range_id: Uuid) -> CyroidResult<Range> {
        let mut range = self.store.require_range(range_id).await?;
        if range.status == RangeStatus::Deploying {
            return Err(CyroidError::InvalidState(format!(
                "range {} is deploying",
                range.name
            )));
        }

        let docker = match self.target_docker(&range).await {
            Ok(docker) => Some(docker),
            Err(e) => {
                tracing::warn!(%range_id, error = %e, "target daemon unavailable, resetting records only");
                None
            }
        };

        for mut vm in self.store.list_vms(range_id).await? {
            if let (Some(docker), Some(container_id)) = (&docker, &vm.container_id) {
                remove_container(docker.as_ref(), container_id, range_id).await;
            }
            vm.container_id = None;
            vm.status = VmStatus::Pending;
            vm.error_message = None;
            self.store.save_vm(&vm).await?;
        }

        if let Some(mut router) = self.store.get_router(range_id).await? {
            if let (Some(docker), Some(container_id)) = (&docker, &router.container_id) {
                if let Err(e) = self.vyos(docker.clone()).remove_router(container_id).await {
                    tracing::warn!(%range_id, error = %e, "failed to remove router");
                }
            }
            router.container_id = None;
            router.status = RouterStatus::Pending;
            router.error_message = None;
            self.store.save_router(&router).await?;
        }

        if let Some(sandbox) = &range.sandbox {
            if let Err(e) = self.proxy.remove(range_id, sandbox).await {
                tracing::warn!(%range_id, error = %e, "failed to remove console proxy");
            }
        }

        for mut network in self.store.list_networks(range_id).await? {
            if let Some(docker) = &docker {
                self.remove_docker_network(&range, docker, &network).await;
            }
            network.docker_network_id = None;
            network.vyos_interface = None;
            self.store.save_network(&network).await?;
        }

        if self.is_dind() {
            self.remove_sandbox(range_id).await;
        }

        range.sandbox = None;
        range.vnc_proxy_mappings = BTreeMap::new();
        range.status = RangeStatus::Draft;
        range.error_message = None;
        self.save_range(&mut range).await?;

        self.emit(DeploymentEvent::new(
            range_id,
            EventType::RangeTornDown,
            format!("range {} torn down", range.name),
        ));
        tracing::info!(%range_id, "range torn down");
        Ok(range)
    }

    async fn remove_sandbox(&self, range_id: Uuid) {
        if let Err(e) = self.isolation.teardown_vnc_port_forwarding(range_id).await {
            tracing::warn!(%range_id, error = %e, "failed to remove console forwards");
        }
        if let Err(e) = self.isolation.teardown_network_isolation_in_dind(range_id).await {
            tracing::warn!(%range_id, error = %e, "failed to remove isolation rules");
        }
        if let Err(e) = self.dind.delete_range_container(range_id).await {
            tracing::warn!(%range_id, error = %e, "failed to delete sandbox");
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn remove_container(docker: &dyn DockerApi, container_id: &str, range_id: Uuid) {
    match docker.remove_container(container_id, true).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {
            tracing::debug!(%range_id, container_id, "vm container already gone");
        }
        Err(e) => tracing::warn!(%range_id, container_id, error = %e, "failed to remove vm container"),
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
        models::{EventType, ImageFamily, RangeStatus, RouterStatus, VmStatus},
        store::RangeStore,
        testing::RangeFixture,
        utils::{dind_volume_name, ROLE_DIND, LABEL_ROLE},
        CyroidError,
    };

    #[tokio::test(start_paused = true)]
    async fn test_teardown_resets_records_and_removes_sandbox() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        let lan = fx.add_network("lan", "10.0.1.0/24").await?;
        let ws = fx
            .add_container_vm(&lan, "ws01", Ipv4Addr::new(10, 0, 1, 10), "ubuntu:22.04", ImageFamily::GenericContainer)
            .await?;
        fx.orchestrator.deploy_range(fx.range_id).await?;
        assert!(fx.host.has_volume(&dind_volume_name(&fx.range_id)));

        let range = fx.orchestrator.teardown_range(fx.range_id).await?;
        assert_eq!(range.status, RangeStatus::Draft);
        assert_eq!(range.sandbox, None);
        assert!(range.vnc_proxy_mappings.is_empty());

        let ws = fx.vm(ws.id).await?;
        assert_eq!(ws.status, VmStatus::Pending);
        assert_eq!(ws.container_id, None);

        let lan = fx.network(lan.id).await?;
        assert_eq!(lan.docker_network_id, None);
        assert_eq!(lan.vyos_interface, None);

        let router = fx.store.get_router(fx.range_id).await?.expect("router");
        assert_eq!(router.status, RouterStatus::Pending);
        assert_eq!(router.container_id, None);

        assert!(!fx
            .host
            .containers()
            .iter()
            .any(|c| c.labels.get(LABEL_ROLE).map(String::as_str) == Some(ROLE_DIND)));
        assert!(!fx.host.has_volume(&dind_volume_name(&fx.range_id)));
        assert_eq!(fx.events.event_types().last(), Some(&EventType::RangeTornDown));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_range_redeploys_after_teardown() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        let lan = fx.add_network("lan", "10.0.1.0/24").await?;
        fx.orchestrator.deploy_range(fx.range_id).await?;
        fx.orchestrator.teardown_range(fx.range_id).await?;

        let report = fx.orchestrator.deploy_range(fx.range_id).await?;
        assert_eq!(report.status, RangeStatus::Running);
        assert_eq!(fx.network(lan.id).await?.vyos_interface.as_deref(), Some("eth1"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_of_draft_range_is_harmless() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        fx.add_network("lan", "10.0.1.0/24").await?;

        let range = fx.orchestrator.teardown_range(fx.range_id).await?;
        assert_eq!(range.status, RangeStatus::Draft);
        Ok(())
    }

    #[tokio::test]
    async fn test_teardown_refused_while_deploying() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        let mut range = fx.range().await?;
        range.status = RangeStatus::Deploying;
        fx.store.save_range(&range).await?;

        assert!(matches!(
            fx.orchestrator.teardown_range(fx.range_id).await,
            Err(CyroidError::InvalidState(_))
        ));
        Ok(())
    }
}
