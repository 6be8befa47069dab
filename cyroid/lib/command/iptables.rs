use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

use super::InterfaceName;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An iptables table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    /// `filter`
    Filter,

    /// `nat`
    Nat,

    /// `raw`
    Raw,
}

/// How a rule is placed in its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOp {
    /// `-A`
    Append,

    /// `-I <position>`
    Insert(u32),

    /// `-D`
    Delete,
}

/// A single iptables invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IptablesCommand {
    table: Table,
    args: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Table {
    fn as_str(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
            Table::Raw => "raw",
        }
    }
}

impl RuleOp {
    fn push_into(&self, args: &mut Vec<String>, chain: &str) {
        match self {
            RuleOp::Append => args.extend(["-A".to_string(), chain.to_string()]),
            RuleOp::Insert(position) => args.extend([
                "-I".to_string(),
                chain.to_string(),
                position.to_string(),
            ]),
            RuleOp::Delete => args.extend(["-D".to_string(), chain.to_string()]),
        }
    }
}

impl IptablesCommand {
    fn rule(table: Table, op: RuleOp, chain: &str, spec: &[&str]) -> Self {
        let mut args = Vec::with_capacity(spec.len() + 3);
        op.push_into(&mut args, chain);
        args.extend(spec.iter().map(|s| s.to_string()));
        Self { table, args }
    }

    /// `-t <table> -F <chain>`
    pub fn flush(table: Table, chain: &str) -> Self {
        Self {
            table,
            args: vec!["-F".to_string(), chain.to_string()],
        }
    }

    /// `-P FORWARD DROP`
    pub fn forward_policy_drop() -> Self {
        Self {
            table: Table::Filter,
            args: vec!["-P".into(), "FORWARD".into(), "DROP".into()],
        }
    }

    /// Accepts return traffic of tracked connections.
    pub fn accept_established() -> Self {
        Self::rule(
            Table::Filter,
            RuleOp::Append,
            "FORWARD",
            &["-m", "state", "--state", "ESTABLISHED,RELATED", "-j", "ACCEPT"],
        )
    }

    /// Accepts traffic between hosts on the same bridge.
    pub fn accept_intra_bridge(bridge: &InterfaceName) -> Self {
        Self::rule(
            Table::Filter,
            RuleOp::Append,
            "FORWARD",
            &["-i", bridge.as_str(), "-o", bridge.as_str(), "-j", "ACCEPT"],
        )
    }

    /// Accepts traffic leaving `bridge` through the sandbox uplink.
    pub fn accept_bridge_to_uplink(bridge: &InterfaceName) -> Self {
        let uplink = InterfaceName::uplink();
        Self::rule(
            Table::Filter,
            RuleOp::Append,
            "FORWARD",
            &["-i", bridge.as_str(), "-o", uplink.as_str(), "-j", "ACCEPT"],
        )
    }

    /// Accepts return traffic arriving on the sandbox uplink.
    pub fn accept_uplink_return() -> Self {
        let uplink = InterfaceName::uplink();
        Self::rule(
            Table::Filter,
            RuleOp::Append,
            "FORWARD",
            &[
                "-i",
                uplink.as_str(),
                "-m",
                "state",
                "--state",
                "ESTABLISHED,RELATED",
                "-j",
                "ACCEPT",
            ],
        )
    }

    /// Masquerades everything leaving the sandbox uplink.
    pub fn masquerade_uplink() -> Self {
        let uplink = InterfaceName::uplink();
        Self::rule(
            Table::Nat,
            RuleOp::Append,
            "POSTROUTING",
            &["-o", uplink.as_str(), "-j", "MASQUERADE"],
        )
    }

    /// Accepts forwarding from bridge `from` to bridge `to`, at the head of FORWARD.
    pub fn accept_between(from: &InterfaceName, to: &InterfaceName) -> Self {
        Self::rule(
            Table::Filter,
            RuleOp::Insert(1),
            "FORWARD",
            &["-i", from.as_str(), "-o", to.as_str(), "-j", "ACCEPT"],
        )
    }

    /// Redirects `listen_ip:listen_port` to `target_ip:target_port`.
    pub fn dnat(
        op: RuleOp,
        listen_ip: Ipv4Addr,
        listen_port: u16,
        target_ip: Ipv4Addr,
        target_port: u16,
    ) -> Self {
        let listen_ip = listen_ip.to_string();
        let listen_port = listen_port.to_string();
        let destination = format!("{target_ip}:{target_port}");
        Self::rule(
            Table::Nat,
            op,
            "PREROUTING",
            &[
                "-d",
                &listen_ip,
                "-p",
                "tcp",
                "--dport",
                &listen_port,
                "-j",
                "DNAT",
                "--to-destination",
                &destination,
            ],
        )
    }

    /// Accepts forwarded connections to `target_ip:target_port`, at the head of FORWARD.
    pub fn accept_forward_to(target_ip: Ipv4Addr, target_port: u16) -> Self {
        let target_ip = target_ip.to_string();
        let target_port = target_port.to_string();
        Self::rule(
            Table::Filter,
            RuleOp::Insert(1),
            "FORWARD",
            &[
                "-p",
                "tcp",
                "-d",
                &target_ip,
                "--dport",
                &target_port,
                "-m",
                "state",
                "--state",
                "NEW,ESTABLISHED,RELATED",
                "-j",
                "ACCEPT",
            ],
        )
    }

    /// Exempts packets from `source` from the raw-table NOTRACK rules.
    pub fn raw_accept_source(op: RuleOp, source: Ipv4Network) -> Self {
        let source = source.to_string();
        Self::rule(
            Table::Raw,
            op,
            "PREROUTING",
            &["-s", &source, "-j", "ACCEPT"],
        )
    }

    /// Exempts packets to `destination` from the raw-table NOTRACK rules.
    pub fn raw_accept_destination(op: RuleOp, destination: Ipv4Network) -> Self {
        let destination = destination.to_string();
        Self::rule(
            Table::Raw,
            op,
            "PREROUTING",
            &["-d", &destination, "-j", "ACCEPT"],
        )
    }

    /// The full argv, starting with `iptables`.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 3);
        argv.push("iptables".to_string());
        argv.push("-t".to_string());
        argv.push(self.table.as_str().to_string());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// The argv joined for logging.
    pub fn render(&self) -> String {
        self.argv().join(" ")
    }

    /// Whether this is a flush.
    pub fn is_flush(&self) -> bool {
        self.args.first().map(String::as_str) == Some("-F")
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
