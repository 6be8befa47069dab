use std::{collections::HashMap, net::Ipv4Addr, sync::Arc, time::Duration};

use ipnetwork::Ipv4Network;
use tokio::time::{self, Instant};
use uuid::Uuid;

use crate::{
    command::{
        IptablesCommand, InterfaceName, ResourceName, RuleOp, VyosScript, DISABLE_RP_FILTER_SCRIPT,
        VBASH_PATH,
    },
    config::{NetworkSettings, VyosSettings},
    docker::{ContainerSpec, DockerApi, NetworkSpec},
    utils::{
        host_addresses, router_container_name, LABEL_RANGE_ID, LABEL_ROLE, MANAGEMENT_INTERFACE,
        ROLE_ROUTER,
    },
    CyroidError, CyroidResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The operational command used to probe whether the router CLI is up.
const READY_PROBE: &str = "/opt/vyatta/bin/vyatta-op-cmd-wrapper show version";

/// The grace period when stopping a router.
const ROUTER_STOP_TIMEOUT_SECS: i64 = 10;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Drives VyOS router containers on a range's target daemon.
///
/// The controller raises on genuine failures and never touches persisted records; the
/// orchestrator decides what a failure means for the router's status.
pub struct VyosController {
    docker: Arc<dyn DockerApi>,
    settings: VyosSettings,
    network: NetworkSettings,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VyosController {
    /// Creates a controller over `docker`.
    pub fn new(docker: Arc<dyn DockerApi>, settings: VyosSettings, network: NetworkSettings) -> Self {
        Self {
            docker,
            settings,
            network,
        }
    }

    /// The daemon the routers live on.
    pub fn docker(&self) -> &Arc<dyn DockerApi> {
        &self.docker
    }

    /// Picks the first management address that is neither the gateway nor attached to a
    /// container.
    ///
    /// Two concurrent callers can pick the same address; the later attach fails in that case.
    pub async fn allocate_management_ip(&self) -> CyroidResult<Ipv4Addr> {
        let name = self.network.get_management_network_name();
        let taken: Vec<Ipv4Addr> = match self.docker.inspect_network(name).await {
            Ok(info) => info
                .endpoints
                .iter()
                .filter_map(|e| e.ipv4_address)
                .collect(),
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };

        let gateway = *self.network.get_management_gateway();
        host_addresses(*self.network.get_management_subnet())
            .find(|ip| *ip != gateway && !taken.contains(ip))
            .ok_or_else(|| CyroidError::AddressPoolExhausted(name.clone()))
    }

    /// Creates the router container of a range attached to the management network at
    /// `management_ip`. Returns the container id.
    pub async fn create_router_container(
        &self,
        range_id: Uuid,
        management_ip: Ipv4Addr,
    ) -> CyroidResult<String> {
        let image = self.settings.get_image();
        if !self.docker.image_exists(image).await? {
            tracing::info!(%range_id, image, "pulling router image");
            self.docker.pull_image(image).await?;
        }
        self.ensure_management_network().await?;

        let name = router_container_name(&range_id);
        let spec = ContainerSpec::builder()
            .name(name.clone())
            .image(image.clone())
            .hostname(name.clone())
            .cmd(vec!["/sbin/init".to_string()])
            .labels(HashMap::from([
                (LABEL_RANGE_ID.to_string(), range_id.to_string()),
                (LABEL_ROLE.to_string(), ROLE_ROUTER.to_string()),
            ]))
            .privileged(true)
            .cap_add(vec!["NET_ADMIN".to_string(), "SYS_ADMIN".to_string()])
            .sysctls(HashMap::from([
                ("net.ipv4.ip_forward".to_string(), "1".to_string()),
                ("net.ipv4.conf.all.forwarding".to_string(), "1".to_string()),
            ]))
            .network(self.network.get_management_network_name().clone())
            .ipv4_address(management_ip)
            .build();

        let id = match self.docker.create_container(&spec).await {
            Ok(id) => id,
            Err(e) if e.is_already_exists() => {
                tracing::warn!(%range_id, container = %name, "router container already exists, reusing it");
                self.docker.inspect_container(&name).await?.id
            }
            Err(e) => return Err(e),
        };

        tracing::info!(%range_id, container = %name, %management_ip, "router container created");
        Ok(id)
    }

    /// Starts a router container.
    pub async fn start_router(&self, container_id: &str) -> CyroidResult<()> {
        self.docker.start_container(container_id).await
    }

    /// Stops a router container.
    pub async fn stop_router(&self, container_id: &str) -> CyroidResult<()> {
        self.docker
            .stop_container(container_id, ROUTER_STOP_TIMEOUT_SECS)
            .await
    }

    /// Force-removes a router container. A missing container is success.
    pub async fn remove_router(&self, container_id: &str) -> CyroidResult<()> {
        match self.docker.remove_container(container_id, true).await {
            Err(e) if e.is_not_found() => {
                tracing::debug!(container_id, "router container already gone");
                Ok(())
            }
            result => result,
        }
    }

    /// Attaches the router to `network_id` at `interface_ip`, dropping any previous endpoint on
    /// that network first.
    pub async fn connect_to_network(
        &self,
        container_id: &str,
        network_id: &str,
        interface_ip: Ipv4Addr,
    ) -> CyroidResult<()> {
        if let Err(e) = self
            .docker
            .disconnect_network(network_id, container_id, true)
            .await
        {
            tracing::trace!(container_id, network_id, error = %e, "no previous endpoint");
        }

        self.docker
            .connect_network(network_id, container_id, Some(interface_ip))
            .await
    }

    /// Sets the address (and description) of an ethernet interface.
    pub async fn configure_interface(
        &self,
        container_id: &str,
        interface: &str,
        address: Ipv4Network,
        description: Option<&str>,
    ) -> CyroidResult<()> {
        let interface = InterfaceName::new(interface)?;
        let script = VyosScript::interface_address(&interface, address, description)?;
        self.apply(container_id, &script).await
    }

    /// Masquerades `source` out of `outbound_interface` (the management interface by default).
    pub async fn configure_nat_outbound(
        &self,
        container_id: &str,
        rule_number: u32,
        source: Ipv4Network,
        outbound_interface: Option<&str>,
    ) -> CyroidResult<()> {
        let outbound = InterfaceName::new(outbound_interface.unwrap_or(MANAGEMENT_INTERFACE))?;
        let script = VyosScript::nat_masquerade(rule_number, source, &outbound);
        self.apply(container_id, &script).await
    }

    /// Deletes a source NAT rule.
    pub async fn remove_nat_rule(&self, container_id: &str, rule_number: u32) -> CyroidResult<()> {
        self.apply(container_id, &VyosScript::delete_nat_rule(rule_number))
            .await
    }

    /// Installs the `ISOLATED-{IFACE}` ruleset for traffic leaving `interface`.
    pub async fn configure_firewall_isolated(
        &self,
        container_id: &str,
        interface: &str,
        subnet: Ipv4Network,
        allow_established: bool,
    ) -> CyroidResult<()> {
        let interface = InterfaceName::new(interface)?;
        let script = VyosScript::firewall_isolated(&interface, subnet, allow_established)?;
        self.apply(container_id, &script).await
    }

    /// Removes the isolation ruleset of `interface`.
    pub async fn remove_firewall_isolated(
        &self,
        container_id: &str,
        interface: &str,
    ) -> CyroidResult<()> {
        let interface = InterfaceName::new(interface)?;
        let script = VyosScript::delete_firewall_isolated(&interface)?;
        self.apply(container_id, &script).await
    }

    /// Serves DHCP on `subnet` under the pool `network_name`.
    pub async fn configure_dhcp_server(
        &self,
        container_id: &str,
        network_name: &str,
        subnet: Ipv4Network,
        gateway: Ipv4Addr,
        dns_servers: &[Ipv4Addr],
        dns_search: Option<&str>,
    ) -> CyroidResult<()> {
        let pool = ResourceName::new(network_name)?;
        let script = VyosScript::dhcp_server(&pool, subnet, gateway, dns_servers, dns_search)?;
        self.apply(container_id, &script).await
    }

    /// Removes the DHCP pool `network_name`.
    pub async fn remove_dhcp_server(&self, container_id: &str, network_name: &str) -> CyroidResult<()> {
        let pool = ResourceName::new(network_name)?;
        self.apply(container_id, &VyosScript::delete_dhcp_server(&pool))
            .await
    }

    /// Gives `source` internet access through the management interface.
    ///
    /// Besides the NAT rule this disables reverse-path filtering on every router interface and
    /// exempts the source network and the management subnet from the raw-table rules VyOS
    /// installs, both of which otherwise drop the NAT return path.
    pub async fn configure_internet_nat(
        &self,
        container_id: &str,
        rule_number: u32,
        source: Ipv4Network,
        outbound_interface: Option<&str>,
    ) -> CyroidResult<()> {
        self.configure_nat_outbound(container_id, rule_number, source, outbound_interface)
            .await?;

        let rp_filter = vec![
            "sh".to_string(),
            "-c".to_string(),
            DISABLE_RP_FILTER_SCRIPT.to_string(),
        ];
        if let Err(e) = self.run(container_id, &rp_filter, "disable rp_filter").await {
            tracing::warn!(container_id, error = %e, "failed to disable rp_filter");
        }

        let management = *self.network.get_management_subnet();
        let raw_rules = [
            (
                IptablesCommand::raw_accept_source(RuleOp::Delete, source),
                IptablesCommand::raw_accept_source(RuleOp::Insert(1), source),
            ),
            (
                IptablesCommand::raw_accept_destination(RuleOp::Delete, management),
                IptablesCommand::raw_accept_destination(RuleOp::Insert(1), management),
            ),
        ];
        for (stale, rule) in raw_rules {
            if let Err(e) = self.docker.exec(container_id, &stale.argv(), true).await {
                tracing::trace!(container_id, rule = %stale.render(), error = %e, "no stale raw rule");
            }
            if let Err(e) = self.run(container_id, &rule.argv(), &rule.render()).await {
                tracing::warn!(container_id, rule = %rule.render(), error = %e, "raw table rule failed");
            }
        }

        tracing::info!(container_id, %source, rule_number, "internet NAT configured");
        Ok(())
    }

    /// Removes internet access for `source`. The management-subnet exemption is shared with
    /// other networks and stays.
    pub async fn remove_internet_nat(
        &self,
        container_id: &str,
        rule_number: u32,
        source: Ipv4Network,
    ) -> CyroidResult<()> {
        self.remove_nat_rule(container_id, rule_number).await?;

        let rule = IptablesCommand::raw_accept_source(RuleOp::Delete, source);
        if let Err(e) = self.run(container_id, &rule.argv(), &rule.render()).await {
            tracing::debug!(container_id, error = %e, "raw table exemption already absent");
        }

        tracing::info!(container_id, %source, rule_number, "internet NAT removed");
        Ok(())
    }

    /// Polls until the router container is running and its CLI answers, or `timeout` elapses.
    pub async fn wait_for_router_ready(
        &self,
        container_id: &str,
        timeout: Duration,
        interval: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let probe = vec![
            VBASH_PATH.to_string(),
            "-c".to_string(),
            READY_PROBE.to_string(),
        ];

        loop {
            match self.docker.inspect_container(container_id).await {
                Ok(info) if info.running => match self.docker.exec(container_id, &probe, false).await {
                    Ok(output) if output.success() => return true,
                    Ok(output) => tracing::trace!(container_id, output = %output.output, "router not ready"),
                    Err(e) => tracing::trace!(container_id, error = %e, "router not reachable"),
                },
                Ok(_) => tracing::trace!(container_id, "router container not running"),
                Err(e) => tracing::trace!(container_id, error = %e, "router container not found"),
            }

            if Instant::now() + interval > deadline {
                tracing::warn!(container_id, seconds = timeout.as_secs(), "router did not become ready");
                return false;
            }

            time::sleep(interval).await;
        }
    }

    /// Runs a configuration script; a non-zero exit carries the full output.
    async fn apply(&self, container_id: &str, script: &VyosScript) -> CyroidResult<()> {
        if script.is_empty() {
            return Ok(());
        }

        let summary = script.statements().join("; ");
        self.run(container_id, &script.argv(), &summary).await?;
        tracing::debug!(container_id, statements = script.statements().len(), "vyos commit");
        Ok(())
    }

    async fn run(&self, container_id: &str, argv: &[String], label: &str) -> CyroidResult<()> {
        self.docker
            .exec(container_id, argv, true)
            .await?
            .check(label)
            .map(|_| ())
    }

    async fn ensure_management_network(&self) -> CyroidResult<()> {
        let name = self.network.get_management_network_name();
        match self.docker.inspect_network(name).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let spec = NetworkSpec::builder()
            .name(name.clone())
            .subnet(*self.network.get_management_subnet())
            .gateway(*self.network.get_management_gateway())
            .build();

        match self.docker.create_network(&spec).await {
            Ok(_) => {
                tracing::info!(network = %name, "created management network");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
