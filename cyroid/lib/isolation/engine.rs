use std::{collections::BTreeMap, net::Ipv4Addr, sync::Arc};

use uuid::Uuid;

use crate::{
    command::{IptablesCommand, InterfaceName, ResourceName, RuleOp, Table},
    dind::DindManager,
    models::{DindSandbox, VncProxyMapping},
    utils::bridge_interface_name,
    CyroidError, CyroidResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Applies isolation and console forwarding rules inside range sandboxes.
pub struct IsolationEngine {
    dind: Arc<DindManager>,
    vnc_base_port: u16,
}

/// A workload console to expose on the sandbox management address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VncTarget {
    /// The VM the console belongs to.
    pub vm_id: Uuid,

    /// The workload container name.
    pub container_name: String,

    /// The workload address on its range network.
    pub ip: Ipv4Addr,

    /// The console port inside the workload.
    pub port: u16,
}

/// What an isolation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSetOutcome {
    /// Bridges the rules were generated for.
    pub bridges: Vec<String>,

    /// Names skipped because they failed validation or could not be resolved.
    pub skipped: Vec<String>,

    /// Number of rules that applied.
    pub applied: usize,

    /// Rules that failed, rendered.
    pub failed: Vec<String>,
}

struct ResolvedBridge {
    name: String,
    bridge: InterfaceName,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl IsolationEngine {
    /// Creates an engine executing through `dind` and numbering console ports from
    /// `vnc_base_port`.
    pub fn new(dind: Arc<DindManager>, vnc_base_port: u16) -> Self {
        Self {
            dind,
            vnc_base_port,
        }
    }

    /// The first console port handed out per range.
    pub fn vnc_base_port(&self) -> u16 {
        self.vnc_base_port
    }

    /// Replaces the sandbox forwarding rules with default-deny plus per-network allows.
    ///
    /// `networks` and `allow_internet` are Docker network names in the nested daemon. Names that
    /// fail validation or do not resolve are skipped with a warning. The FORWARD chain and nat
    /// POSTROUTING are flushed first, so calling this again with the same input converges to
    /// the same rules.
    pub async fn setup_network_isolation_in_dind(
        &self,
        range_id: Uuid,
        docker_url: &str,
        networks: &[String],
        allow_internet: &[String],
    ) -> CyroidResult<RuleSetOutcome> {
        let sandbox = self.sandbox(range_id).await?;
        let (resolved, skipped) = self.resolve_bridges(range_id, docker_url, networks).await?;

        let internet: Vec<InterfaceName> = resolved
            .iter()
            .filter(|r| allow_internet.contains(&r.name))
            .map(|r| r.bridge.clone())
            .collect();
        let bridges: Vec<InterfaceName> = resolved.iter().map(|r| r.bridge.clone()).collect();

        let commands = isolation_rules(&bridges, &internet);
        let mut outcome = self.apply(range_id, &sandbox, &commands).await;
        outcome.bridges = bridges.iter().map(|b| b.to_string()).collect();
        outcome.skipped = skipped;

        tracing::info!(
            %range_id,
            bridges = outcome.bridges.len(),
            internet = internet.len(),
            failed = outcome.failed.len(),
            "applied network isolation"
        );
        Ok(outcome)
    }

    /// Isolation rules disappear with the sandbox, so there is nothing to undo.
    pub async fn teardown_network_isolation_in_dind(&self, range_id: Uuid) -> CyroidResult<()> {
        tracing::debug!(%range_id, "isolation rules are removed with the sandbox");
        Ok(())
    }

    /// Forwards sequential ports on the sandbox management address to each target's console,
    /// starting at the base port.
    pub async fn setup_vnc_port_forwarding(
        &self,
        range_id: Uuid,
        targets: &[VncTarget],
    ) -> CyroidResult<BTreeMap<Uuid, VncProxyMapping>> {
        self.setup_vnc_port_forwarding_from(range_id, targets, self.vnc_base_port)
            .await
    }

    /// Same as [`setup_vnc_port_forwarding`](Self::setup_vnc_port_forwarding) with an explicit
    /// first port, used when a range already has mappings.
    pub async fn setup_vnc_port_forwarding_from(
        &self,
        range_id: Uuid,
        targets: &[VncTarget],
        first_port: u16,
    ) -> CyroidResult<BTreeMap<Uuid, VncProxyMapping>> {
        let sandbox = self.sandbox(range_id).await?;
        let mut mappings = BTreeMap::new();

        for (offset, target) in targets.iter().enumerate() {
            let proxy_port = port_at(first_port, offset)?;
            let management_ip = sandbox.management_ip;

            let stale = IptablesCommand::dnat(
                RuleOp::Delete,
                management_ip,
                proxy_port,
                target.ip,
                target.port,
            );
            if let Ok(output) = self.dind.host().exec(&sandbox.container_id, &stale.argv(), true).await {
                if output.success() {
                    tracing::debug!(%range_id, proxy_port, "replaced existing console forward");
                }
            }

            let commands = [
                IptablesCommand::dnat(
                    RuleOp::Append,
                    management_ip,
                    proxy_port,
                    target.ip,
                    target.port,
                ),
                IptablesCommand::accept_forward_to(target.ip, target.port),
            ];
            let outcome = self.apply(range_id, &sandbox, &commands).await;
            if !outcome.failed.is_empty() {
                tracing::warn!(%range_id, vm_id = %target.vm_id, "console forward partially applied");
            }

            mappings.insert(
                target.vm_id,
                VncProxyMapping {
                    proxy_port,
                    proxy_host: management_ip.to_string(),
                    original_port: target.port,
                },
            );
        }

        tracing::info!(%range_id, count = mappings.len(), "console forwards ready");
        Ok(mappings)
    }

    /// Re-installs the FORWARD accept of each console, for use after the FORWARD chain was
    /// flushed. Existing DNAT rules are left alone.
    pub async fn restore_console_accepts(
        &self,
        range_id: Uuid,
        targets: &[VncTarget],
    ) -> CyroidResult<RuleSetOutcome> {
        let sandbox = self.sandbox(range_id).await?;
        let commands: Vec<IptablesCommand> = targets
            .iter()
            .map(|t| IptablesCommand::accept_forward_to(t.ip, t.port))
            .collect();

        let outcome = self.apply(range_id, &sandbox, &commands).await;
        tracing::debug!(%range_id, restored = outcome.applied, "console forwards restored");
        Ok(outcome)
    }

    /// Console forwards disappear with the sandbox, so there is nothing to undo.
    pub async fn teardown_vnc_port_forwarding(&self, range_id: Uuid) -> CyroidResult<()> {
        tracing::debug!(%range_id, "console forwards are removed with the sandbox");
        Ok(())
    }

    /// Allows traffic both ways between each pair of named networks. Pairs with an invalid or
    /// unknown name are skipped.
    pub async fn setup_inter_network_routing(
        &self,
        range_id: Uuid,
        docker_url: &str,
        network_pairs: &[(String, String)],
    ) -> CyroidResult<RuleSetOutcome> {
        let sandbox = self.sandbox(range_id).await?;

        let mut names: Vec<String> = Vec::new();
        for (a, b) in network_pairs {
            for name in [a, b] {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }

        let (resolved, skipped) = self.resolve_bridges(range_id, docker_url, &names).await?;
        let bridge_of = |name: &str| {
            resolved
                .iter()
                .find(|r| r.name == name)
                .map(|r| r.bridge.clone())
        };

        let mut commands = Vec::new();
        for (a, b) in network_pairs {
            match (bridge_of(a), bridge_of(b)) {
                (Some(from), Some(to)) => {
                    commands.push(IptablesCommand::accept_between(&from, &to));
                    commands.push(IptablesCommand::accept_between(&to, &from));
                }
                _ => tracing::warn!(%range_id, %a, %b, "skipping network pair"),
            }
        }

        let mut outcome = self.apply(range_id, &sandbox, &commands).await;
        outcome.bridges = resolved.iter().map(|r| r.bridge.to_string()).collect();
        outcome.skipped = skipped;
        Ok(outcome)
    }

    async fn sandbox(&self, range_id: Uuid) -> CyroidResult<DindSandbox> {
        self.dind
            .get_container_info(range_id)
            .await?
            .ok_or_else(|| CyroidError::SandboxNotFound(range_id.to_string()))
    }

    /// Validates names and maps each to `br-{first 12 id chars}` through the nested daemon.
    async fn resolve_bridges(
        &self,
        range_id: Uuid,
        docker_url: &str,
        names: &[String],
    ) -> CyroidResult<(Vec<ResolvedBridge>, Vec<String>)> {
        let client = self.dind.get_range_client(range_id, docker_url).await?;
        let mut resolved = Vec::new();
        let mut skipped = Vec::new();

        for name in names {
            let valid = match ResourceName::new(name.as_str()) {
                Ok(valid) => valid,
                Err(e) => {
                    tracing::warn!(%range_id, error = %e, "skipping network with unsafe name");
                    skipped.push(name.clone());
                    continue;
                }
            };

            let info = match client.inspect_network(valid.as_str()).await {
                Ok(info) => info,
                Err(e) => {
                    tracing::warn!(%range_id, network = %valid, error = %e, "cannot resolve network");
                    skipped.push(name.clone());
                    continue;
                }
            };

            let bridge = InterfaceName::new(bridge_interface_name(&info.id))?;
            resolved.push(ResolvedBridge {
                name: name.clone(),
                bridge,
            });
        }

        Ok((resolved, skipped))
    }

    /// Runs every command in order. A failing command is logged and the rest still run.
    async fn apply(
        &self,
        range_id: Uuid,
        sandbox: &DindSandbox,
        commands: &[IptablesCommand],
    ) -> RuleSetOutcome {
        let mut outcome = RuleSetOutcome::default();

        for command in commands {
            let rendered = command.render();
            let result = self
                .dind
                .host()
                .exec(&sandbox.container_id, &command.argv(), true)
                .await
                .and_then(|output| output.check(rendered.clone()));

            match result {
                Ok(_) => outcome.applied += 1,
                Err(e) => {
                    tracing::warn!(%range_id, rule = %rendered, error = %e, "iptables rule failed");
                    outcome.failed.push(rendered);
                }
            }
        }

        outcome
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The full isolation rule list for a sandbox, in application order.
pub fn isolation_rules(bridges: &[InterfaceName], internet: &[InterfaceName]) -> Vec<IptablesCommand> {
    let mut commands = vec![
        IptablesCommand::flush(Table::Filter, "FORWARD"),
        IptablesCommand::flush(Table::Nat, "POSTROUTING"),
        IptablesCommand::forward_policy_drop(),
        IptablesCommand::accept_established(),
    ];

    commands.extend(bridges.iter().map(IptablesCommand::accept_intra_bridge));
    commands.extend(internet.iter().map(IptablesCommand::accept_bridge_to_uplink));

    if !internet.is_empty() {
        commands.push(IptablesCommand::accept_uplink_return());
        commands.push(IptablesCommand::masquerade_uplink());
    }

    commands
}

fn port_at(first_port: u16, offset: usize) -> CyroidResult<u16> {
    u16::try_from(offset)
        .ok()
        .and_then(|offset| first_port.checked_add(offset))
        .ok_or_else(|| CyroidError::AddressPoolExhausted("console ports".to_string()))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
