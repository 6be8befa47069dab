use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

use crate::{utils, CyroidError, CyroidResult};

use super::{validate_description, validate_domain, InterfaceName, ResourceName};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The interpreter VyOS configuration scripts run under.
pub const VBASH_PATH: &str = "/bin/vbash";

const SCRIPT_TEMPLATE: &str = "source /opt/vyatta/etc/functions/script-template";

/// Resets reverse-path filtering on every interface so NAT return traffic on the management
/// interface is not dropped.
pub const DISABLE_RP_FILTER_SCRIPT: &str =
    "for f in /proc/sys/net/ipv4/conf/*/rp_filter; do echo 0 > \"$f\"; done";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A batch of configuration statements applied with a single commit and save.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VyosScript {
    statements: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VyosScript {
    /// Creates an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&mut self, path: &[&str]) -> &mut Self {
        self.statements.push(format!("set {}", path.join(" ")));
        self
    }

    fn delete(&mut self, path: &[&str]) -> &mut Self {
        self.statements.push(format!("delete {}", path.join(" ")));
        self
    }

    /// Appends every statement of `other`.
    pub fn extend(&mut self, other: VyosScript) -> &mut Self {
        self.statements.extend(other.statements);
        self
    }

    /// The configuration statements without the session wrapper.
    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    /// Whether there is nothing to apply.
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// The full script: enter configuration mode, apply, commit, save, exit.
    pub fn render(&self) -> String {
        let mut lines = Vec::with_capacity(self.statements.len() + 5);
        lines.push(SCRIPT_TEMPLATE.to_string());
        lines.push("configure".to_string());
        lines.extend(self.statements.iter().cloned());
        lines.push("commit".to_string());
        lines.push("save".to_string());
        lines.push("exit".to_string());
        lines.join("\n")
    }

    /// The exec argv running the script under vbash.
    pub fn argv(&self) -> Vec<String> {
        vec![VBASH_PATH.to_string(), "-c".to_string(), self.render()]
    }

    /// Assigns `address` to an ethernet interface.
    pub fn interface_address(
        interface: &InterfaceName,
        address: Ipv4Network,
        description: Option<&str>,
    ) -> CyroidResult<Self> {
        let address = address.to_string();
        let mut script = Self::new();
        script.set(&["interfaces", "ethernet", interface.as_str(), "address", &address]);

        if let Some(description) = description {
            let quoted = format!("'{}'", validate_description(description)?);
            script.set(&[
                "interfaces",
                "ethernet",
                interface.as_str(),
                "description",
                &quoted,
            ]);
        }

        Ok(script)
    }

    /// Masquerades `source` out of `outbound` under source NAT rule `rule`.
    pub fn nat_masquerade(rule: u32, source: Ipv4Network, outbound: &InterfaceName) -> Self {
        let rule = rule.to_string();
        let source = source.to_string();
        let mut script = Self::new();
        script
            .set(&["nat", "source", "rule", &rule, "outbound-interface", "name", outbound.as_str()])
            .set(&["nat", "source", "rule", &rule, "source", "address", &source])
            .set(&["nat", "source", "rule", &rule, "translation", "address", "masquerade"]);
        script
    }

    /// Deletes source NAT rule `rule`.
    pub fn delete_nat_rule(rule: u32) -> Self {
        let rule = rule.to_string();
        let mut script = Self::new();
        script.delete(&["nat", "source", "rule", &rule]);
        script
    }

    /// Builds `ISOLATED-{IFACE}`: default drop, optional established/related accept, accept from
    /// the interface's own subnet, and a forward-filter jump for traffic leaving the interface.
    pub fn firewall_isolated(
        interface: &InterfaceName,
        subnet: Ipv4Network,
        allow_established: bool,
    ) -> CyroidResult<Self> {
        let name = isolated_ruleset_name(interface);
        let jump_rule = forward_jump_rule(interface)?.to_string();
        let subnet = subnet.to_string();

        let mut script = Self::new();
        script.set(&["firewall", "ipv4", "name", &name, "default-action", "drop"]);

        if allow_established {
            script
                .set(&["firewall", "ipv4", "name", &name, "rule", "10", "action", "accept"])
                .set(&["firewall", "ipv4", "name", &name, "rule", "10", "state", "established"])
                .set(&["firewall", "ipv4", "name", &name, "rule", "10", "state", "related"]);
        }

        script
            .set(&["firewall", "ipv4", "name", &name, "rule", "20", "action", "accept"])
            .set(&["firewall", "ipv4", "name", &name, "rule", "20", "source", "address", &subnet])
            .set(&["firewall", "ipv4", "forward", "filter", "rule", &jump_rule, "action", "jump"])
            .set(&[
                "firewall",
                "ipv4",
                "forward",
                "filter",
                "rule",
                &jump_rule,
                "jump-target",
                &name,
            ])
            .set(&[
                "firewall",
                "ipv4",
                "forward",
                "filter",
                "rule",
                &jump_rule,
                "outbound-interface",
                "name",
                interface.as_str(),
            ]);

        Ok(script)
    }

    /// Removes the isolation ruleset of `interface` and its forward-filter jump.
    pub fn delete_firewall_isolated(interface: &InterfaceName) -> CyroidResult<Self> {
        let name = isolated_ruleset_name(interface);
        let jump_rule = forward_jump_rule(interface)?.to_string();

        let mut script = Self::new();
        script
            .delete(&["firewall", "ipv4", "forward", "filter", "rule", &jump_rule])
            .delete(&["firewall", "ipv4", "name", &name]);
        Ok(script)
    }

    /// Serves DHCP on `subnet` from the 10th to the 250th host (or the last usable one).
    pub fn dhcp_server(
        pool: &ResourceName,
        subnet: Ipv4Network,
        gateway: Ipv4Addr,
        dns_servers: &[Ipv4Addr],
        dns_search: Option<&str>,
    ) -> CyroidResult<Self> {
        let (start, stop) = utils::dhcp_range(subnet).ok_or(CyroidError::InvalidParameter {
            name: "subnet",
            value: subnet.to_string(),
        })?;

        let subnet_str = subnet.to_string();
        let subnet_id = dhcp_subnet_id(subnet).to_string();
        let gateway = gateway.to_string();
        let start = start.to_string();
        let stop = stop.to_string();
        let base = [
            "service",
            "dhcp-server",
            "shared-network-name",
            pool.as_str(),
            "subnet",
            subnet_str.as_str(),
        ];
        let with = |tail: &[&str]| -> Vec<String> {
            base.iter().chain(tail.iter()).map(|s| s.to_string()).collect()
        };

        let mut script = Self::new();
        let mut push = |path: Vec<String>| {
            let refs: Vec<&str> = path.iter().map(String::as_str).collect();
            script.set(&refs);
        };

        push(with(&["subnet-id", &subnet_id]));
        push(with(&["option", "default-router", &gateway]));
        for dns in dns_servers {
            push(with(&["option", "name-server", &dns.to_string()]));
        }
        if let Some(search) = dns_search {
            push(with(&["option", "domain-search", validate_domain(search)?]));
        }
        push(with(&["range", "0", "start", &start]));
        push(with(&["range", "0", "stop", &stop]));

        Ok(script)
    }

    /// Removes the DHCP pool `pool`.
    pub fn delete_dhcp_server(pool: &ResourceName) -> Self {
        let mut script = Self::new();
        script.delete(&["service", "dhcp-server", "shared-network-name", pool.as_str()]);
        script
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// `ISOLATED-ETH1` for `eth1`.
pub fn isolated_ruleset_name(interface: &InterfaceName) -> String {
    format!("ISOLATED-{}", interface.as_str().to_ascii_uppercase())
}

/// The forward-filter rule number used for the isolation jump of `ethN`.
fn forward_jump_rule(interface: &InterfaceName) -> CyroidResult<u32> {
    utils::router_interface_index(interface.as_str())
        .map(utils::nat_rule_number)
        .ok_or_else(|| CyroidError::InvalidParameter {
            name: "interface",
            value: interface.to_string(),
        })
}

/// A subnet id that is stable for a given subnet and never zero.
fn dhcp_subnet_id(subnet: Ipv4Network) -> u32 {
    let host_bits = 32 - u32::from(subnet.prefix());
    let id = u32::from(subnet.network()).checked_shr(host_bits).unwrap_or(0);
    id.max(1)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn eth(n: u32) -> InterfaceName {
        InterfaceName::new(format!("eth{n}")).unwrap()
    }

    #[test]
    fn test_script_wraps_commit_and_save() {
        let script =
            VyosScript::interface_address(&eth(1), "10.0.1.1/24".parse().unwrap(), Some("LAN"))
                .unwrap();
        let rendered = script.render();
        let lines: Vec<&str> = rendered.lines().collect();

        assert_eq!(lines[0], SCRIPT_TEMPLATE);
        assert_eq!(lines[1], "configure");
        assert_eq!(lines[2], "set interfaces ethernet eth1 address 10.0.1.1/24");
        assert_eq!(lines[3], "set interfaces ethernet eth1 description 'LAN'");
        assert_eq!(&lines[4..], &["commit", "save", "exit"]);
        assert_eq!(script.argv()[0], VBASH_PATH);
    }

    #[test]
    fn test_description_injection_rejected() {
        let result = VyosScript::interface_address(
            &eth(1),
            "10.0.1.1/24".parse().unwrap(),
            Some("x'; reboot; echo '"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_nat_rule() {
        let script = VyosScript::nat_masquerade(
            20,
            "10.0.2.0/24".parse().unwrap(),
            &InterfaceName::uplink(),
        );
        assert_eq!(
            script.statements(),
            &[
                "set nat source rule 20 outbound-interface name eth0",
                "set nat source rule 20 source address 10.0.2.0/24",
                "set nat source rule 20 translation address masquerade",
            ]
        );
        assert_eq!(
            VyosScript::delete_nat_rule(20).statements(),
            &["delete nat source rule 20"]
        );
    }

    #[test]
    fn test_firewall_isolated() {
        let script =
            VyosScript::firewall_isolated(&eth(2), "10.0.2.0/24".parse().unwrap(), true).unwrap();
        let statements = script.statements();
        assert_eq!(
            statements[0],
            "set firewall ipv4 name ISOLATED-ETH2 default-action drop"
        );
        assert!(statements
            .iter()
            .any(|s| s == "set firewall ipv4 name ISOLATED-ETH2 rule 10 state established"));
        assert!(statements.iter().any(|s| s
            == "set firewall ipv4 forward filter rule 20 outbound-interface name eth2"));

        let without =
            VyosScript::firewall_isolated(&eth(2), "10.0.2.0/24".parse().unwrap(), false).unwrap();
        assert!(!without.statements().iter().any(|s| s.contains("established")));

        assert!(VyosScript::firewall_isolated(
            &InterfaceName::uplink(),
            "10.0.2.0/24".parse().unwrap(),
            true
        )
        .is_err());
    }

    #[test]
    fn test_dhcp_server() {
        let pool = ResourceName::new("lan").unwrap();
        let script = VyosScript::dhcp_server(
            &pool,
            "10.0.1.0/24".parse().unwrap(),
            Ipv4Addr::new(10, 0, 1, 1),
            &[Ipv4Addr::new(8, 8, 8, 8)],
            Some("corp.local"),
        )
        .unwrap();
        let prefix = "set service dhcp-server shared-network-name lan subnet 10.0.1.0/24";
        let statements = script.statements();
        assert!(statements.contains(&format!("{prefix} option default-router 10.0.1.1")));
        assert!(statements.contains(&format!("{prefix} option name-server 8.8.8.8")));
        assert!(statements.contains(&format!("{prefix} option domain-search corp.local")));
        assert!(statements.contains(&format!("{prefix} range 0 start 10.0.1.10")));
        assert!(statements.contains(&format!("{prefix} range 0 stop 10.0.1.250")));

        assert!(VyosScript::dhcp_server(
            &pool,
            "10.0.1.0/24".parse().unwrap(),
            Ipv4Addr::new(10, 0, 1, 1),
            &[],
            Some("bad domain"),
        )
        .is_err());
    }

    #[test]
    fn test_dhcp_subnet_id_is_stable() {
        let a = dhcp_subnet_id("10.0.1.0/24".parse().unwrap());
        let b = dhcp_subnet_id("10.0.2.0/24".parse().unwrap());
        assert_ne!(a, b);
        assert_eq!(a, dhcp_subnet_id("10.0.1.0/24".parse().unwrap()));
        assert_eq!(dhcp_subnet_id("0.0.0.0/0".parse().unwrap()), 1);
    }
}
