use std::{collections::BTreeMap, sync::Arc};

use uuid::Uuid;

use crate::{
    docker::DockerApi,
    models::{DeploymentEvent, EventType, Range, RangeRouter, RangeStatus, RouterStatus},
    utils::{truncate_message, ROUTER_ERROR_MAX_LEN},
    CyroidError, CyroidResult,
};

use super::{
    network_ops::active_router, DeploymentReport, DeploymentStep, Orchestrator, StepOutcome,
};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Deploys a range: sandbox, router, networks, VMs, then consoles.
    ///
    /// Deployment is forward-only. Router, network and VM failures are recorded and the rest of
    /// the range still comes up; the returned report lists every step. A failure that prevents
    /// the range from coming up at all moves it to `ERROR` and is returned, with nothing rolled
    /// back.
    pub async fn deploy_range(&self, range_id: Uuid) -> CyroidResult<DeploymentReport> {
        let mut range = self.store.require_range(range_id).await?;
        if !range.can_deploy() {
            return Err(CyroidError::InvalidState(format!(
                "range {} cannot be deployed while {}",
                range.name, range.status
            )));
        }

        let mut report = DeploymentReport::new(range_id);
        match self.run_deployment(&mut range, &mut report).await {
            Ok(()) => {
                range.status = RangeStatus::Running;
                range.error_message = None;
                self.save_range(&mut range).await?;

                let failures = report.failures().count();
                self.emit(
                    DeploymentEvent::new(
                        range_id,
                        EventType::DeploymentCompleted,
                        format!("range {} deployed", range.name),
                    )
                    .with_extra(serde_json::json!({ "failed_steps": failures })),
                );
                tracing::info!(%range_id, failed_steps = failures, "range deployed");

                report.status = RangeStatus::Running;
                Ok(report)
            }
            Err(e) => {
                tracing::error!(%range_id, error = %e, "range deployment failed");
                self.fail_range(&mut range, &e).await;
                Err(e)
            }
        }
    }

    async fn run_deployment(&self, range: &mut Range, report: &mut DeploymentReport) -> CyroidResult<()> {
        let range_id = range.id;
        let networks = self.store.list_networks(range_id).await?;
        let vms = self.store.list_vms(range_id).await?;

        range.status = RangeStatus::Deploying;
        range.error_message = None;
        self.save_range(range).await?;
        self.emit(
            DeploymentEvent::new(
                range_id,
                EventType::DeploymentStarted,
                format!("deploying range {}", range.name),
            )
            .with_extra(serde_json::json!({
                "networks": networks.len(),
                "vms": vms.len(),
            })),
        );

        if self.is_dind() {
            self.ensure_sandbox(range).await?;
            report.record(DeploymentStep::Sandbox, StepOutcome::Success);
        } else {
            report.record(
                DeploymentStep::Sandbox,
                StepOutcome::Skipped("sandboxes disabled".to_string()),
            );
        }

        let docker = self.target_docker(range).await?;
        let router = self.deploy_router(range, &docker, report).await?;

        for network in networks {
            let step = DeploymentStep::Network {
                network_id: network.id,
                name: network.name.clone(),
            };

            let needs_router = router.is_some() && network.vyos_interface.is_none();
            if network.docker_network_id.is_some() && !needs_router {
                report.record(step, StepOutcome::Skipped("already provisioned".to_string()));
                continue;
            }

            self.emit_network(
                range_id,
                EventType::NetworkCreating,
                &network,
                format!("creating network {} ({})", network.name, network.subnet),
            );
            let active = active_router(router.as_ref());
            match self.provision(range, &docker, active, network.clone()).await {
                Ok((network, warnings)) => {
                    for warning in &warnings {
                        tracing::warn!(%range_id, network = %network.name, "{warning}");
                    }
                    self.emit_network(
                        range_id,
                        EventType::NetworkCreated,
                        &network,
                        format!("network {} ready", network.name),
                    );
                    report.record(step, StepOutcome::Success);
                }
                Err(e) => {
                    tracing::warn!(%range_id, network = %network.name, error = %e, "network provisioning failed");
                    self.emit_network(
                        range_id,
                        EventType::NetworkError,
                        &network,
                        format!("network {} failed: {e}", network.name),
                    );
                    report.record(step, StepOutcome::Failed(e.to_string()));
                }
            }
        }

        let networks = self.store.list_networks(range_id).await?;
        for mut vm in vms {
            let step = DeploymentStep::Vm {
                vm_id: vm.id,
                hostname: vm.hostname.clone(),
            };
            match self.launch_vm(range, &docker, &networks, &mut vm).await {
                Ok(()) => report.record(step, StepOutcome::Success),
                Err(e) => {
                    tracing::warn!(%range_id, vm_id = %vm.id, hostname = %vm.hostname, error = %e, "vm deployment failed");
                    self.fail_vm(&mut vm, &e).await;
                    report.record(step, StepOutcome::Failed(e.to_string()));
                }
            }
        }

        if self.is_dind() {
            match self.expose_consoles(range, BTreeMap::new()).await {
                Ok(mappings) => {
                    range.vnc_proxy_mappings = mappings;
                    self.save_range(range).await?;
                    report.record(DeploymentStep::Consoles, StepOutcome::Success);
                }
                Err(e) => {
                    tracing::warn!(%range_id, error = %e, "console forwarding failed");
                    report.record(DeploymentStep::Consoles, StepOutcome::Failed(e.to_string()));
                }
            }
        } else {
            report.record(
                DeploymentStep::Consoles,
                StepOutcome::Skipped("consoles are routed by the reverse proxy".to_string()),
            );
        }

        Ok(())
    }

    /// Brings the router up. Returns the running router, or `None` when it failed and
    /// deployment continues without routing.
    async fn deploy_router(
        &self,
        range: &Range,
        docker: &Arc<dyn DockerApi>,
        report: &mut DeploymentReport,
    ) -> CyroidResult<Option<RangeRouter>> {
        let existing = self.store.get_router(range.id).await?;

        match self.bring_up_router(range, docker, existing.clone()).await {
            Ok((router, created)) => {
                let outcome = if created {
                    StepOutcome::Success
                } else {
                    StepOutcome::Skipped("router already exists".to_string())
                };
                report.record(DeploymentStep::Router, outcome);
                Ok(Some(router))
            }
            Err(e) => {
                let mut router = match self.store.get_router(range.id).await {
                    Ok(Some(latest)) => latest,
                    _ => existing.unwrap_or(RangeRouter {
                        range_id: range.id,
                        management_ip: None,
                        container_id: None,
                        status: RouterStatus::Pending,
                        error_message: None,
                    }),
                };
                router.status = RouterStatus::Error;
                router.error_message = Some(truncate_message(&e.to_string(), ROUTER_ERROR_MAX_LEN));
                self.store.save_router(&router).await?;

                self.emit(DeploymentEvent::new(
                    range.id,
                    EventType::RouterError,
                    format!("router failed: {e}"),
                ));
                report.record(DeploymentStep::Router, StepOutcome::Failed(e.to_string()));

                if *self.settings.get_orchestration().get_abort_on_router_failure() {
                    return Err(e);
                }
                tracing::warn!(range_id = %range.id, error = %e, "continuing without a router");
                Ok(None)
            }
        }
    }

    /// Creates and starts the router if it has no container, or starts the existing one.
    /// Returns the router and whether it was created.
    async fn bring_up_router(
        &self,
        range: &Range,
        docker: &Arc<dyn DockerApi>,
        existing: Option<RangeRouter>,
    ) -> CyroidResult<(RangeRouter, bool)> {
        let vyos = self.vyos(docker.clone());

        let mut router = match existing {
            Some(router) if router.management_ip.is_some() => router,
            Some(mut router) => {
                router.management_ip = Some(vyos.allocate_management_ip().await?);
                router
            }
            None => RangeRouter::new(range.id, vyos.allocate_management_ip().await?),
        };

        if let Some(container_id) = router.container_id.clone() {
            match vyos.start_router(&container_id).await {
                Ok(()) => {
                    router.status = RouterStatus::Running;
                    router.error_message = None;
                    self.store.save_router(&router).await?;
                    return Ok((router, false));
                }
                Err(e) if e.is_not_found() => {
                    tracing::warn!(range_id = %range.id, "router container vanished, recreating it");
                    router.container_id = None;
                }
                Err(e) => return Err(e),
            }
        }

        let management_ip = router
            .management_ip
            .ok_or_else(|| CyroidError::InvalidState("router has no management address".to_string()))?;

        router.status = RouterStatus::Creating;
        router.error_message = None;
        self.store.save_router(&router).await?;
        self.emit(DeploymentEvent::new(
            range.id,
            EventType::RouterCreating,
            format!("creating router at {management_ip}"),
        ));

        let container_id = vyos.create_router_container(range.id, management_ip).await?;
        router.container_id = Some(container_id.clone());
        self.store.save_router(&router).await?;

        vyos.start_router(&container_id).await?;
        tokio::time::sleep(self.settings.get_vyos().boot_delay()).await;

        let vyos_settings = self.settings.get_vyos();
        if !vyos
            .wait_for_router_ready(
                &container_id,
                vyos_settings.ready_timeout(),
                vyos_settings.ready_interval(),
            )
            .await
        {
            tracing::warn!(range_id = %range.id, "router CLI not answering yet, configuring anyway");
        }

        router.status = RouterStatus::Running;
        self.store.save_router(&router).await?;
        self.emit(DeploymentEvent::new(
            range.id,
            EventType::RouterCreated,
            format!("router running at {management_ip}"),
        ));
        Ok((router, true))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use uuid::Uuid;

    use crate::{
        config::{DindSettings, OrchestrationSettings, Settings, DEFAULT_VYOS_IMAGE},
        models::{EventType, ImageFamily, RangeStatus, RouterStatus, VmStatus},
        orchestration::StepOutcome,
        store::RangeStore,
        testing::RangeFixture,
        utils::{docker_network_name, vm_container_name},
        CyroidError,
    };

    const DESKTOP_IMAGE: &str = "kasmweb/ubuntu-jammy-desktop:1.15.0";
    const SERVER_IMAGE: &str = "ubuntu:22.04";

    #[tokio::test(start_paused = true)]
    async fn test_deploy_brings_up_router_networks_and_vms() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        let lan = fx.add_network("lan", "10.0.1.0/24").await?;
        let dmz = fx.add_network("dmz", "10.0.2.0/24").await?;
        let ws = fx
            .add_container_vm(&lan, "ws01", Ipv4Addr::new(10, 0, 1, 10), DESKTOP_IMAGE, ImageFamily::KasmVnc)
            .await?;
        let web = fx
            .add_container_vm(&dmz, "web01", Ipv4Addr::new(10, 0, 2, 10), SERVER_IMAGE, ImageFamily::GenericContainer)
            .await?;

        let report = fx.orchestrator.deploy_range(fx.range_id).await?;
        assert_eq!(report.status, RangeStatus::Running);
        assert!(!report.is_degraded(), "{report}");

        let range = fx.range().await?;
        assert_eq!(range.status, RangeStatus::Running);
        assert!(range.sandbox.is_some());

        let lan = fx.network(lan.id).await?;
        let dmz = fx.network(dmz.id).await?;
        assert!(lan.docker_network_id.is_some());
        assert_eq!(lan.vyos_interface.as_deref(), Some("eth1"));
        assert_eq!(dmz.vyos_interface.as_deref(), Some("eth2"));

        let commands = fx.nested.exec_commands();
        assert!(commands
            .iter()
            .any(|c| c.contains("set interfaces ethernet eth1 address 10.0.1.1/24")));
        assert!(commands
            .iter()
            .any(|c| c.contains("set interfaces ethernet eth2 address 10.0.2.1/24")));
        assert!(commands
            .iter()
            .any(|c| c == "ip route replace default via 10.0.1.1"));

        let bridge = fx
            .nested
            .network_by_name(&docker_network_name(&fx.range_id, "lan"))
            .expect("lan bridge exists");
        assert_eq!(bridge.gateway, Some(Ipv4Addr::new(10, 0, 1, 254)));

        let container = fx
            .nested
            .container_by_name(&vm_container_name(&fx.range_id, "ws01"))
            .expect("ws01 container exists");
        assert!(container.running);
        assert_eq!(
            container.networks.get(&docker_network_name(&fx.range_id, "lan")),
            Some(&Some(Ipv4Addr::new(10, 0, 1, 10)))
        );

        for vm in [&ws, &web] {
            let vm = fx.vm(vm.id).await?;
            assert_eq!(vm.status, VmStatus::Running);
            assert!(vm.container_id.is_some());
        }

        let mut ports: Vec<u16> = range.vnc_proxy_mappings.values().map(|m| m.proxy_port).collect();
        ports.sort_unstable();
        assert_eq!(ports, vec![15900, 15901]);
        assert_eq!(range.vnc_proxy_mappings[&ws.id].original_port, 6901);
        assert_eq!(range.vnc_proxy_mappings[&web.id].original_port, 3000);

        let events = fx.events.event_types();
        assert_eq!(events.first(), Some(&EventType::DeploymentStarted));
        assert_eq!(events.last(), Some(&EventType::DeploymentCompleted));
        assert!(events.contains(&EventType::SandboxCreated));
        assert!(events.contains(&EventType::RouterCreated));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_deploy_tolerates_a_failing_vm() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        let lan = fx.add_network("lan", "10.0.1.0/24").await?;
        let ws = fx
            .add_container_vm(&lan, "ws01", Ipv4Addr::new(10, 0, 1, 10), DESKTOP_IMAGE, ImageFamily::KasmVnc)
            .await?;
        let web = fx
            .add_container_vm(&lan, "web01", Ipv4Addr::new(10, 0, 1, 20), SERVER_IMAGE, ImageFamily::GenericContainer)
            .await?;
        fx.nested.fail_create_for_image(SERVER_IMAGE);

        let report = fx.orchestrator.deploy_range(fx.range_id).await?;
        assert!(report.is_degraded());
        assert_eq!(report.vm_outcome(ws.id), Some(&StepOutcome::Success));
        assert!(matches!(report.vm_outcome(web.id), Some(StepOutcome::Failed(_))));

        let range = fx.range().await?;
        assert_eq!(range.status, RangeStatus::Running);
        assert_eq!(range.vnc_proxy_mappings.len(), 1);
        assert!(range.vnc_proxy_mappings.contains_key(&ws.id));

        let web = fx.vm(web.id).await?;
        assert_eq!(web.status, VmStatus::Error);
        assert!(web
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains(SERVER_IMAGE)));
        assert_eq!(fx.vm(ws.id).await?.status, VmStatus::Running);
        assert!(fx.events.event_types().contains(&EventType::VmError));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_deploy_survives_unresolvable_image_in_the_middle() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        let lan = fx.add_network("lan", "10.0.1.0/24").await?;
        let first = fx
            .add_container_vm(&lan, "ws01", Ipv4Addr::new(10, 0, 1, 10), SERVER_IMAGE, ImageFamily::GenericContainer)
            .await?;
        let mut middle = fx
            .add_container_vm(&lan, "ws02", Ipv4Addr::new(10, 0, 1, 11), SERVER_IMAGE, ImageFamily::GenericContainer)
            .await?;
        let last = fx
            .add_container_vm(&lan, "ws03", Ipv4Addr::new(10, 0, 1, 12), SERVER_IMAGE, ImageFamily::GenericContainer)
            .await?;
        middle.base_image_id = Some(Uuid::new_v4());
        fx.store.save_vm(&middle).await?;

        let report = fx.orchestrator.deploy_range(fx.range_id).await?;
        assert_eq!(report.status, RangeStatus::Running);
        assert!(matches!(report.vm_outcome(middle.id), Some(StepOutcome::Failed(_))));

        for vm in [&first, &last] {
            let vm = fx.vm(vm.id).await?;
            assert_eq!(vm.status, VmStatus::Running, "{}", vm.hostname);
            assert!(vm.container_id.is_some());
        }

        let middle = fx.vm(middle.id).await?;
        assert_eq!(middle.status, VmStatus::Error);
        assert!(middle.container_id.is_none());
        assert!(middle
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("base image")));
        assert!(fx
            .nested
            .container_by_name(&vm_container_name(&fx.range_id, "ws02"))
            .is_none());
        assert_eq!(fx.range().await?.status, RangeStatus::Running);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_deploy_continues_without_router() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        let lan = fx.add_network("lan", "10.0.1.0/24").await?;
        let ws = fx
            .add_container_vm(&lan, "ws01", Ipv4Addr::new(10, 0, 1, 10), DESKTOP_IMAGE, ImageFamily::KasmVnc)
            .await?;
        fx.nested.fail_create_for_image(DEFAULT_VYOS_IMAGE);

        let report = fx.orchestrator.deploy_range(fx.range_id).await?;
        assert!(matches!(report.router_outcome(), Some(StepOutcome::Failed(_))));
        assert_eq!(report.status, RangeStatus::Running);

        let router = fx
            .store
            .get_router(fx.range_id)
            .await?
            .expect("router record exists");
        assert_eq!(router.status, RouterStatus::Error);
        assert!(router.error_message.is_some());

        let lan = fx.network(lan.id).await?;
        assert!(lan.docker_network_id.is_some());
        assert_eq!(lan.vyos_interface, None);
        assert_eq!(fx.vm(ws.id).await?.status, VmStatus::Running);
        assert!(fx.events.event_types().contains(&EventType::RouterError));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_deploy_aborts_on_router_failure_when_configured() -> anyhow::Result<()> {
        let settings = Settings::builder()
            .orchestration(
                OrchestrationSettings::builder()
                    .abort_on_router_failure(true)
                    .build(),
            )
            .build();
        let fx = RangeFixture::new(settings).await?;
        let lan = fx.add_network("lan", "10.0.1.0/24").await?;
        let ws = fx
            .add_container_vm(&lan, "ws01", Ipv4Addr::new(10, 0, 1, 10), DESKTOP_IMAGE, ImageFamily::KasmVnc)
            .await?;
        fx.nested.fail_create_for_image(DEFAULT_VYOS_IMAGE);

        assert!(fx.orchestrator.deploy_range(fx.range_id).await.is_err());

        let range = fx.range().await?;
        assert_eq!(range.status, RangeStatus::Error);
        assert!(range.error_message.is_some());
        assert_eq!(fx.vm(ws.id).await?.status, VmStatus::Pending);
        assert_eq!(fx.events.event_types().last(), Some(&EventType::DeploymentFailed));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_deploy_fails_when_sandbox_daemon_never_answers() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        fx.add_network("lan", "10.0.1.0/24").await?;
        fx.nested.set_ping_ok(false);

        let result = fx.orchestrator.deploy_range(fx.range_id).await;
        assert!(matches!(result, Err(CyroidError::Timeout { .. })));

        let range = fx.range().await?;
        assert_eq!(range.status, RangeStatus::Error);
        assert!(range
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("docker daemon")));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_deploy_refused_while_running() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        fx.add_network("lan", "10.0.1.0/24").await?;
        fx.orchestrator.deploy_range(fx.range_id).await?;

        let result = fx.orchestrator.deploy_range(fx.range_id).await;
        assert!(matches!(result, Err(CyroidError::InvalidState(_))));
        assert_eq!(fx.range().await?.status, RangeStatus::Running);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_deploy_on_host_daemon_without_sandbox() -> anyhow::Result<()> {
        let settings = Settings::builder()
            .dind(DindSettings::builder().enabled(false).build())
            .build();
        let fx = RangeFixture::new(settings).await?;
        let lan = fx.add_network("lan", "10.0.1.0/24").await?;
        let ws = fx
            .add_container_vm(&lan, "ws01", Ipv4Addr::new(10, 0, 1, 10), DESKTOP_IMAGE, ImageFamily::KasmVnc)
            .await?;

        let report = fx.orchestrator.deploy_range(fx.range_id).await?;
        assert_eq!(report.status, RangeStatus::Running);

        let range = fx.range().await?;
        assert_eq!(range.sandbox, None);
        assert!(range.vnc_proxy_mappings.is_empty());
        assert!(fx.nested.containers().is_empty());

        let container = fx
            .host
            .container_by_name(&vm_container_name(&fx.range_id, "ws01"))
            .expect("vm runs on the host daemon");
        assert_eq!(container.labels.get("traefik.enable").map(String::as_str), Some("true"));
        assert_eq!(fx.vm(ws.id).await?.status, VmStatus::Running);
        Ok(())
    }
}
