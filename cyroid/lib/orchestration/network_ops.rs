use std::{collections::HashMap, sync::Arc};

use uuid::Uuid;

use crate::{
    config::VncProxyMechanism,
    docker::{DockerApi, NetworkSpec},
    isolation::VncTarget,
    models::{DeploymentEvent, EventType, Network, Range, RangeRouter, RouterStatus},
    utils::{
        docker_bridge_gateway, docker_network_name, nat_rule_number, router_interface_index,
        router_interface_name, sanitize_name, vm_container_name, LABEL_NETWORK_ID, LABEL_RANGE_ID,
    },
    CyroidError, CyroidResult,
};

use super::Orchestrator;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A running router a network can be attached to.
pub(super) struct ActiveRouter<'a> {
    pub(super) container_id: &'a str,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Provisions a single network of a deployed range: Docker network, sandbox isolation and
    /// router attachment. Returns the updated record.
    pub async fn provision_network(&self, network_id: Uuid) -> CyroidResult<Network> {
        let network = self.store.require_network(network_id).await?;
        let range = self.store.require_range(network.range_id).await?;
        let docker = self.target_docker(&range).await?;
        let router = self.store.get_router(range.id).await?;

        let (network, warnings) = self
            .provision(&range, &docker, active_router(router.as_ref()), network)
            .await?;
        for warning in warnings {
            tracing::warn!(range_id = %range.id, %network_id, "{warning}");
        }
        Ok(network)
    }

    /// Turns internet access of a network on or off, updating the router NAT and the sandbox
    /// rules when the network is live.
    pub async fn set_network_internet(&self, network_id: Uuid, enabled: bool) -> CyroidResult<Network> {
        let mut network = self.store.require_network(network_id).await?;
        network.internet_enabled = enabled;
        self.store.save_network(&network).await?;

        let range = self.store.require_range(network.range_id).await?;
        if let Some((docker, container_id, index)) = self.live_router_port(&range, &network).await? {
            let vyos = self.vyos(docker);
            let rule = nat_rule_number(index);
            if enabled {
                vyos.configure_internet_nat(&container_id, rule, network.subnet, None)
                    .await?;
            } else {
                vyos.remove_internet_nat(&container_id, rule, network.subnet)
                    .await?;
            }
        }

        if network.docker_network_id.is_some() {
            self.reapply_isolation(&range).await?;
        }

        tracing::info!(range_id = %range.id, network = %network.name, enabled, "internet access updated");
        Ok(network)
    }

    /// Turns isolation of a network on or off.
    pub async fn set_network_isolation(&self, network_id: Uuid, isolated: bool) -> CyroidResult<Network> {
        let mut network = self.store.require_network(network_id).await?;
        network.is_isolated = isolated;
        self.store.save_network(&network).await?;

        let range = self.store.require_range(network.range_id).await?;
        if let Some((docker, container_id, _)) = self.live_router_port(&range, &network).await? {
            let vyos = self.vyos(docker);
            if let Some(interface) = &network.vyos_interface {
                if isolated {
                    vyos.configure_firewall_isolated(&container_id, interface, network.subnet, true)
                        .await?;
                } else {
                    vyos.remove_firewall_isolated(&container_id, interface)
                        .await?;
                }
            }
        }

        if network.docker_network_id.is_some() {
            self.reapply_isolation(&range).await?;
        }
        Ok(network)
    }

    /// Turns the router's DHCP server for a network on or off.
    pub async fn set_network_dhcp(&self, network_id: Uuid, enabled: bool) -> CyroidResult<Network> {
        let mut network = self.store.require_network(network_id).await?;
        network.dhcp_enabled = enabled;
        self.store.save_network(&network).await?;

        let range = self.store.require_range(network.range_id).await?;
        if let Some((docker, container_id, _)) = self.live_router_port(&range, &network).await? {
            let vyos = self.vyos(docker);
            let pool = sanitize_name(&network.name);
            if enabled {
                let dns = self.dns_servers_of(&network);
                vyos.configure_dhcp_server(
                    &container_id,
                    &pool,
                    network.subnet,
                    network.gateway,
                    &dns,
                    network.dns_search.as_deref(),
                )
                .await?;
            } else {
                vyos.remove_dhcp_server(&container_id, &pool).await?;
            }
        }
        Ok(network)
    }

    /// Removes the Docker network of a network and detaches the router. VMs on the network must
    /// have been removed first.
    pub async fn teardown_network(&self, network_id: Uuid) -> CyroidResult<Network> {
        let mut network = self.store.require_network(network_id).await?;
        let range = self.store.require_range(network.range_id).await?;

        let attached = self
            .store
            .list_vms(range.id)
            .await?
            .into_iter()
            .filter(|vm| vm.network_id == network_id && vm.container_id.is_some())
            .count();
        if attached > 0 {
            return Err(CyroidError::InvalidState(format!(
                "network {} still has {attached} VM containers",
                network.name
            )));
        }

        if let Some((docker, container_id, index)) = self.live_router_port(&range, &network).await? {
            let vyos = self.vyos(docker.clone());
            if network.internet_enabled {
                if let Err(e) = vyos
                    .remove_internet_nat(&container_id, nat_rule_number(index), network.subnet)
                    .await
                {
                    tracing::warn!(range_id = %range.id, network = %network.name, error = %e, "failed to remove NAT rule");
                }
            }
            if let Some(docker_network_id) = &network.docker_network_id {
                if let Err(e) = docker
                    .disconnect_network(docker_network_id, &container_id, true)
                    .await
                {
                    tracing::warn!(range_id = %range.id, network = %network.name, error = %e, "failed to detach router");
                }
            }
        }

        if network.docker_network_id.is_some() {
            let docker = self.target_docker(&range).await?;
            self.remove_docker_network(&range, &docker, &network).await;
        }

        network.docker_network_id = None;
        network.vyos_interface = None;
        self.store.save_network(&network).await?;
        Ok(network)
    }

    /// Creates the Docker network of `network` if needed, applies sandbox isolation and attaches
    /// the router. Only the Docker network creation is fatal; the rest comes back as warnings.
    pub(super) async fn provision(
        &self,
        range: &Range,
        docker: &Arc<dyn DockerApi>,
        router: Option<ActiveRouter<'_>>,
        mut network: Network,
    ) -> CyroidResult<(Network, Vec<String>)> {
        let mut warnings = Vec::new();
        let name = docker_network_name(&range.id, &network.name);

        if network.docker_network_id.is_none() {
            let spec = NetworkSpec::builder()
                .name(name.clone())
                .subnet(network.subnet)
                .labels(HashMap::from([
                    (LABEL_RANGE_ID.to_string(), range.id.to_string()),
                    (LABEL_NETWORK_ID.to_string(), network.id.to_string()),
                ]))
                .build();
            let spec = match docker_bridge_gateway(network.subnet, network.gateway) {
                Some(gateway) => NetworkSpec {
                    gateway: Some(gateway),
                    ..spec
                },
                None => spec,
            };

            let id = match docker.create_network(&spec).await {
                Ok(id) => id,
                Err(e) if e.is_already_exists() => {
                    tracing::warn!(range_id = %range.id, network = %name, "docker network already exists, adopting it");
                    docker.inspect_network(&name).await?.id
                }
                Err(e) => return Err(e),
            };
            network.docker_network_id = Some(id);
            self.store.save_network(&network).await?;
            tracing::info!(range_id = %range.id, network = %name, subnet = %network.subnet, "docker network created");

            if !self.is_dind() {
                if let Some(proxy) = self.settings.get_network().get_reverse_proxy_container() {
                    match docker.connect_network(&name, proxy, None).await {
                        Ok(()) => {}
                        Err(e) if e.is_already_exists() => {}
                        Err(e) => warnings.push(format!("reverse proxy not attached to {name}: {e}")),
                    }
                }
            }
        }

        if network.is_isolated && self.is_dind() {
            if let Err(e) = self.reapply_isolation(range).await {
                warnings.push(format!("sandbox isolation not applied: {e}"));
            }
        }

        if let Some(router) = router {
            if let Err(e) = self
                .attach_router(range, docker, router.container_id, &mut network, &mut warnings)
                .await
            {
                warnings.push(format!("router not attached to {}: {e}", network.name));
            }
        }

        Ok((network, warnings))
    }

    /// Re-applies the sandbox forwarding rules over every provisioned network of a range.
    pub(super) async fn reapply_isolation(&self, range: &Range) -> CyroidResult<()> {
        if !self.is_dind() {
            return Ok(());
        }
        let Some(sandbox) = &range.sandbox else {
            return Ok(());
        };

        let (mut names, mut internet) = self.provisioned_network_names(range.id).await?;

        // Routed internet leaves through the router's management interface.
        let router_attached = self
            .store
            .get_router(range.id)
            .await?
            .is_some_and(|r| r.container_id.is_some());
        if router_attached {
            let management = self.settings.get_network().get_management_network_name().clone();
            if !internet.is_empty() {
                internet.push(management.clone());
            }
            names.push(management);
        }

        let outcome = self
            .isolation
            .setup_network_isolation_in_dind(range.id, &sandbox.docker_url, &names, &internet)
            .await?;
        if !outcome.skipped.is_empty() || !outcome.failed.is_empty() {
            tracing::warn!(
                range_id = %range.id,
                skipped = ?outcome.skipped,
                failed = outcome.failed.len(),
                "sandbox isolation partially applied"
            );
        }

        self.restore_console_accepts(range).await
    }

    /// Re-admits forwarded console traffic after the FORWARD chain was rebuilt. The DNAT rules
    /// live in the nat table and survive the rebuild.
    async fn restore_console_accepts(&self, range: &Range) -> CyroidResult<()> {
        if range.vnc_proxy_mappings.is_empty() || self.proxy.mechanism() != VncProxyMechanism::Iptables {
            return Ok(());
        }

        let targets: Vec<VncTarget> = self
            .store
            .list_vms(range.id)
            .await?
            .into_iter()
            .filter_map(|vm| {
                let mapping = range.vnc_proxy_mappings.get(&vm.id)?;
                Some(VncTarget {
                    vm_id: vm.id,
                    container_name: vm_container_name(&range.id, &vm.hostname),
                    ip: vm.ip_address,
                    port: mapping.original_port,
                })
            })
            .collect();

        let outcome = self
            .isolation
            .restore_console_accepts(range.id, &targets)
            .await?;
        if !outcome.failed.is_empty() {
            tracing::warn!(range_id = %range.id, failed = outcome.failed.len(), "console forwards partially restored");
        }
        Ok(())
    }

    /// Removes a network's Docker network, detaching the reverse proxy first in host mode.
    pub(super) async fn remove_docker_network(
        &self,
        range: &Range,
        docker: &Arc<dyn DockerApi>,
        network: &Network,
    ) {
        let Some(id) = &network.docker_network_id else {
            return;
        };

        if !self.is_dind() {
            if let Some(proxy) = self.settings.get_network().get_reverse_proxy_container() {
                if let Err(e) = docker.disconnect_network(id, proxy, true).await {
                    tracing::debug!(range_id = %range.id, network = %network.name, error = %e, "reverse proxy was not attached");
                }
            }
        }

        match docker.remove_network(id).await {
            Ok(()) => tracing::info!(range_id = %range.id, network = %network.name, "docker network removed"),
            Err(e) if e.is_not_found() => {
                tracing::debug!(range_id = %range.id, network = %network.name, "docker network already gone");
            }
            Err(e) => {
                tracing::warn!(range_id = %range.id, network = %network.name, error = %e, "failed to remove docker network");
            }
        }
    }

    /// Attaches the router to a provisioned network and configures address, NAT, firewall and
    /// DHCP. Failures after the attach are collected as warnings.
    async fn attach_router(
        &self,
        range: &Range,
        docker: &Arc<dyn DockerApi>,
        container_id: &str,
        network: &mut Network,
        warnings: &mut Vec<String>,
    ) -> CyroidResult<()> {
        let Some(docker_network_id) = network.docker_network_id.clone() else {
            return Err(CyroidError::InvalidState(format!(
                "network {} is not provisioned",
                network.name
            )));
        };

        let index = match network.vyos_interface.as_deref().and_then(router_interface_index) {
            Some(index) => index,
            None => self.next_interface_index(range.id).await?,
        };
        let interface = router_interface_name(index);
        let vyos = self.vyos(docker.clone());

        vyos.connect_to_network(container_id, &docker_network_id, network.gateway)
            .await?;
        vyos.configure_interface(
            container_id,
            &interface,
            network.gateway_cidr()?,
            Some(&sanitize_name(&network.name)),
        )
        .await?;

        network.vyos_interface = Some(interface.clone());
        self.store.save_network(network).await?;

        if network.internet_enabled {
            if let Err(e) = vyos
                .configure_internet_nat(container_id, nat_rule_number(index), network.subnet, None)
                .await
            {
                warnings.push(format!("internet NAT for {}: {e}", network.name));
            }
        }

        if network.is_isolated {
            if let Err(e) = vyos
                .configure_firewall_isolated(container_id, &interface, network.subnet, true)
                .await
            {
                warnings.push(format!("isolation firewall for {}: {e}", network.name));
            }
        }

        if network.dhcp_enabled {
            let dns = self.dns_servers_of(network);
            if let Err(e) = vyos
                .configure_dhcp_server(
                    container_id,
                    &sanitize_name(&network.name),
                    network.subnet,
                    network.gateway,
                    &dns,
                    network.dns_search.as_deref(),
                )
                .await
            {
                warnings.push(format!("dhcp for {}: {e}", network.name));
            }
        }

        tracing::info!(range_id = %range.id, network = %network.name, %interface, "router attached");
        Ok(())
    }

    /// One past the highest router interface already assigned in the range.
    async fn next_interface_index(&self, range_id: Uuid) -> CyroidResult<u32> {
        Ok(self
            .store
            .list_networks(range_id)
            .await?
            .iter()
            .filter_map(|n| n.vyos_interface.as_deref().and_then(router_interface_index))
            .max()
            .unwrap_or(0)
            + 1)
    }

    /// The router container and interface index serving a live network, if any.
    async fn live_router_port(
        &self,
        range: &Range,
        network: &Network,
    ) -> CyroidResult<Option<(Arc<dyn DockerApi>, String, u32)>> {
        let Some(index) = network.vyos_interface.as_deref().and_then(router_interface_index) else {
            return Ok(None);
        };
        let router = self.store.get_router(range.id).await?;
        let Some(active) = active_router(router.as_ref()) else {
            return Ok(None);
        };

        let docker = self.target_docker(range).await?;
        Ok(Some((docker, active.container_id.to_string(), index)))
    }

    fn dns_servers_of(&self, network: &Network) -> Vec<std::net::Ipv4Addr> {
        if network.dns_servers.is_empty() {
            self.settings.get_network().get_dns_servers().clone()
        } else {
            network.dns_servers.clone()
        }
    }

    /// Records a network event.
    pub(super) fn emit_network(&self, range_id: Uuid, event_type: EventType, network: &Network, message: String) {
        self.emit(
            DeploymentEvent::new(range_id, event_type, message).with_extra(serde_json::json!({
                "network_id": network.id.to_string(),
                "network": network.name,
            })),
        );
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The router if it is running with a container.
pub(super) fn active_router(router: Option<&RangeRouter>) -> Option<ActiveRouter<'_>> {
    router
        .filter(|r| r.status == RouterStatus::Running)
        .and_then(|r| r.container_id.as_deref())
        .map(|container_id| ActiveRouter { container_id })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use crate::{
        config::Settings,
        models::ImageFamily,
        store::RangeStore,
        testing::RangeFixture,
        utils::{bridge_interface_name, docker_network_name},
        CyroidError,
    };

    const KASM_IMAGE: &str = "kasmweb/ubuntu-jammy-desktop:1.15.0";

    #[tokio::test(start_paused = true)]
    async fn test_internet_toggle_updates_router_nat() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        let lan = fx.add_network("lan", "10.0.1.0/24").await?;
        fx.orchestrator.deploy_range(fx.range_id).await?;
        fx.nested.clear_execs();

        let lan = fx.orchestrator.set_network_internet(lan.id, true).await?;
        assert!(lan.internet_enabled);
        assert!(fx.network(lan.id).await?.internet_enabled);
        assert!(fx
            .nested
            .exec_commands()
            .iter()
            .any(|c| c.contains("set nat source rule 10 source address 10.0.1.0/24")));

        fx.nested.clear_execs();
        fx.orchestrator.set_network_internet(lan.id, false).await?;
        assert!(fx
            .nested
            .exec_commands()
            .iter()
            .any(|c| c.contains("delete nat source rule 10")));
        assert!(!fx.network(lan.id).await?.internet_enabled);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_internet_toggle_keeps_console_forwards() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        let lan = fx.add_network("lan", "10.0.1.0/24").await?;
        let ws = fx
            .add_container_vm(&lan, "ws01", Ipv4Addr::new(10, 0, 1, 10), KASM_IMAGE, ImageFamily::KasmVnc)
            .await?;
        fx.orchestrator.deploy_range(fx.range_id).await?;
        fx.host.clear_execs();

        fx.orchestrator.set_network_internet(lan.id, true).await?;

        let commands = fx.host.exec_commands();
        let flush = commands
            .iter()
            .rposition(|c| c == "iptables -t filter -F FORWARD")
            .expect("forward chain rebuilt");
        let accept = commands
            .iter()
            .rposition(|c| c.contains("-I FORWARD 1 -p tcp -d 10.0.1.10 --dport 6901"))
            .expect("console accept restored");
        assert!(accept > flush);

        let mapping = fx.orchestrator.ensure_vnc_mapping(ws.id).await?.expect("mapping");
        assert_eq!(mapping.proxy_port, 15900);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_internet_network_egresses_through_management_bridge() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        let mut lan = fx.add_network("lan", "10.0.1.0/24").await?;
        lan.internet_enabled = true;
        fx.store.save_network(&lan).await?;

        fx.orchestrator.deploy_range(fx.range_id).await?;

        let management = Settings::default().get_network().get_management_network_name().clone();
        assert!(fx.nested.network_names().contains(&management));
        let mgmt_bridge = bridge_interface_name(&fx.nested.network_by_name(&management).expect("mgmt").id);
        let lan_bridge = bridge_interface_name(
            &fx.nested
                .network_by_name(&docker_network_name(&fx.range_id, "lan"))
                .expect("lan")
                .id,
        );

        let commands = fx.host.exec_commands();
        for bridge in [&mgmt_bridge, &lan_bridge] {
            let rule = format!("iptables -t filter -A FORWARD -i {bridge} -o eth0 -j ACCEPT");
            assert!(commands.contains(&rule), "missing {rule}");
        }

        fx.host.clear_execs();
        fx.orchestrator.set_network_internet(lan.id, false).await?;
        let commands = fx.host.exec_commands();
        assert!(!commands.iter().any(|c| c.contains("-o eth0 -j ACCEPT")));
        assert!(commands.contains(&format!(
            "iptables -t filter -A FORWARD -i {mgmt_bridge} -o {mgmt_bridge} -j ACCEPT"
        )));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_nat_rule_follows_interface_index() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        fx.add_network("lan", "10.0.1.0/24").await?;
        let mut dmz = fx.add_network("dmz", "10.0.2.0/24").await?;
        dmz.internet_enabled = true;
        fx.store.save_network(&dmz).await?;

        fx.orchestrator.deploy_range(fx.range_id).await?;

        assert_eq!(fx.network(dmz.id).await?.vyos_interface.as_deref(), Some("eth2"));
        assert!(fx
            .nested
            .exec_commands()
            .iter()
            .any(|c| c.contains("set nat source rule 20 source address 10.0.2.0/24")));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_added_after_deploy_takes_next_interface() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        fx.add_network("lan", "10.0.1.0/24").await?;
        fx.orchestrator.deploy_range(fx.range_id).await?;

        let lab = fx.add_network("lab", "10.0.3.0/24").await?;
        let lab = fx.orchestrator.provision_network(lab.id).await?;

        assert!(lab.docker_network_id.is_some());
        assert_eq!(lab.vyos_interface.as_deref(), Some("eth2"));
        assert!(fx
            .nested
            .network_by_name(&docker_network_name(&fx.range_id, "lab"))
            .is_some());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_network_requires_no_vm_containers() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        let lan = fx.add_network("lan", "10.0.1.0/24").await?;
        let ws = fx
            .add_container_vm(&lan, "ws01", Ipv4Addr::new(10, 0, 1, 10), "ubuntu:22.04", ImageFamily::GenericContainer)
            .await?;
        fx.orchestrator.deploy_range(fx.range_id).await?;

        let result = fx.orchestrator.teardown_network(lan.id).await;
        assert!(matches!(result, Err(CyroidError::InvalidState(_))));

        fx.orchestrator.delete_vm(ws.id).await?;
        let lan = fx.orchestrator.teardown_network(lan.id).await?;
        assert_eq!(lan.docker_network_id, None);
        assert_eq!(lan.vyos_interface, None);
        assert!(fx
            .nested
            .removed_networks()
            .contains(&docker_network_name(&fx.range_id, "lan")));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_dhcp_toggle_configures_pool() -> anyhow::Result<()> {
        let fx = RangeFixture::new(Settings::default()).await?;
        let lan = fx.add_network("Corp LAN", "10.0.1.0/24").await?;
        fx.orchestrator.deploy_range(fx.range_id).await?;
        fx.nested.clear_execs();

        fx.orchestrator.set_network_dhcp(lan.id, true).await?;
        let commands = fx.nested.exec_commands();
        assert!(commands.iter().any(|c| c.contains(
            "set service dhcp-server shared-network-name corp-lan subnet 10.0.1.0/24 range 0 start 10.0.1.10"
        )));

        fx.nested.clear_execs();
        fx.orchestrator.set_network_dhcp(lan.id, false).await?;
        assert!(fx
            .nested
            .exec_commands()
            .iter()
            .any(|c| c.contains("delete service dhcp-server shared-network-name corp-lan")));
        Ok(())
    }
}
