use uuid::Uuid;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Label carrying the owning range id on every container, volume and network cyroid creates.
pub const LABEL_RANGE_ID: &str = "cyroid.range_id";

/// Label carrying the owning range name on sandbox containers.
pub const LABEL_RANGE_NAME: &str = "cyroid.range_name";

/// Label describing what a container is for (`dind`, `router`, `vm`, `vnc-proxy`).
pub const LABEL_ROLE: &str = "cyroid.role";

/// Label carrying the VM id on VM containers.
pub const LABEL_VM_ID: &str = "cyroid.vm_id";

/// Label carrying the network id on Docker networks.
pub const LABEL_NETWORK_ID: &str = "cyroid.network_id";

/// Role value for sandbox containers.
pub const ROLE_DIND: &str = "dind";

/// Role value for router containers.
pub const ROLE_ROUTER: &str = "router";

/// Role value for VM containers.
pub const ROLE_VM: &str = "vm";

/// Role value for the in-sandbox console proxy.
pub const ROLE_VNC_PROXY: &str = "vnc-proxy";

const MAX_SANITIZED_LEN: usize = 32;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the first eight hex characters of a range id.
pub fn range_short_id(range_id: &Uuid) -> String {
    range_id.simple().to_string()[..8].to_string()
}

/// Lowercases `name` and collapses everything outside `[a-z0-9]` into single dashes.
///
/// ## Examples
///
/// ```
/// use cyroid::utils::sanitize_name;
///
/// assert_eq!(sanitize_name("Red Team / Lab #1"), "red-team-lab-1");
/// assert_eq!(sanitize_name("--"), "");
/// ```
pub fn sanitize_name(name: &str) -> String {
    let mut sanitized = String::with_capacity(name.len());
    let mut last_dash = true;

    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            sanitized.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            sanitized.push('-');
            last_dash = true;
        }

        if sanitized.len() >= MAX_SANITIZED_LEN {
            break;
        }
    }

    sanitized.trim_end_matches('-').to_string()
}

/// The sandbox container name for a range.
pub fn dind_container_name(range_id: &Uuid, range_name: Option<&str>) -> String {
    let short = range_short_id(range_id);
    match range_name.map(sanitize_name).filter(|s| !s.is_empty()) {
        Some(name) => format!("cyroid-range-{short}-{name}"),
        None => format!("cyroid-range-{short}"),
    }
}

/// The sandbox data volume name for a range.
pub fn dind_volume_name(range_id: &Uuid) -> String {
    format!("cyroid-range-{}-docker", range_short_id(range_id))
}

/// The router container name for a range.
pub fn router_container_name(range_id: &Uuid) -> String {
    format!("cyroid-router-{}", range_short_id(range_id))
}

/// The Docker network name for a range network.
pub fn docker_network_name(range_id: &Uuid, network_name: &str) -> String {
    format!(
        "cyroid-{}-{}",
        range_short_id(range_id),
        sanitize_name(network_name)
    )
}

/// The container name for a VM.
pub fn vm_container_name(range_id: &Uuid, hostname: &str) -> String {
    format!(
        "cyroid-{}-{}",
        range_short_id(range_id),
        sanitize_name(hostname)
    )
}

/// The console proxy container name for a range.
pub fn vnc_proxy_container_name(range_id: &Uuid) -> String {
    format!("cyroid-vncproxy-{}", range_short_id(range_id))
}

/// The Linux bridge Docker creates for a network: `br-` plus the first twelve id characters.
pub fn bridge_interface_name(network_id: &str) -> String {
    let prefix: String = network_id.chars().take(12).collect();
    format!("br-{prefix}")
}

/// The `cyroid.range_id=<id>` label filter value.
pub fn range_label_filter(range_id: &Uuid) -> String {
    format!("{LABEL_RANGE_ID}={range_id}")
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_derive_from_range_id() {
        let range_id = Uuid::parse_str("3f2a9c1e-0000-4000-8000-000000000001").unwrap();

        assert_eq!(range_short_id(&range_id), "3f2a9c1e");
        assert_eq!(dind_volume_name(&range_id), "cyroid-range-3f2a9c1e-docker");
        assert_eq!(dind_container_name(&range_id, None), "cyroid-range-3f2a9c1e");
        assert_eq!(
            dind_container_name(&range_id, Some("Blue Team!")),
            "cyroid-range-3f2a9c1e-blue-team"
        );
        assert_eq!(
            dind_container_name(&range_id, Some("***")),
            "cyroid-range-3f2a9c1e"
        );
        assert_eq!(
            docker_network_name(&range_id, "DMZ Net"),
            "cyroid-3f2a9c1e-dmz-net"
        );
    }

    #[test]
    fn test_bridge_interface_uses_network_id() {
        assert_eq!(
            bridge_interface_name("abc123def456789aaaabbbbcccc"),
            "br-abc123def456"
        );
        assert_eq!(bridge_interface_name("short"), "br-short");
    }

    #[test]
    fn test_sanitize_name_caps_length() {
        let long = "a".repeat(100);
        assert_eq!(sanitize_name(&long).len(), 32);
    }
}
