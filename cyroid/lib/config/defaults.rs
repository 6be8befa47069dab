use std::{path::PathBuf, sync::LazyLock};

use crate::utils::CYROID_HOME_DIR;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default image used for range sandboxes.
pub const DEFAULT_DIND_IMAGE: &str = "docker:24-dind";

/// The default number of seconds to wait for a nested daemon to answer pings.
pub const DEFAULT_DIND_STARTUP_TIMEOUT_SECS: u64 = 60;

/// The default interval between nested daemon pings.
pub const DEFAULT_DIND_POLL_INTERVAL_MS: u64 = 1000;

/// The default TCP port the nested daemon listens on.
pub const DEFAULT_DIND_DOCKER_PORT: u16 = 2375;

/// The default grace period when stopping a sandbox container.
pub const DEFAULT_DIND_STOP_TIMEOUT_SECS: i64 = 10;

/// The path inside the sandbox where the nested daemon keeps its data.
pub const DEFAULT_DIND_DATA_PATH: &str = "/var/lib/docker";

/// The default name of the bridge network all sandboxes attach to.
pub const DEFAULT_RANGES_NETWORK_NAME: &str = "cyroid-ranges";

/// The default subnet of the sandbox bridge network.
pub const DEFAULT_RANGES_NETWORK_SUBNET: &str = "172.30.0.0/16";

/// The default name of the router management network.
pub const DEFAULT_MANAGEMENT_NETWORK_NAME: &str = "cyroid-mgmt";

/// The default subnet of the router management network.
pub const DEFAULT_MANAGEMENT_SUBNET: &str = "10.10.0.0/24";

/// The default gateway of the router management network.
pub const DEFAULT_MANAGEMENT_GATEWAY: &str = "10.10.0.1";

/// The default upstream DNS servers handed to VMs and DHCP clients.
pub const DEFAULT_DNS_SERVERS: [&str; 2] = ["8.8.8.8", "8.8.4.4"];

/// The default name of the host reverse proxy container.
pub const DEFAULT_REVERSE_PROXY_CONTAINER: &str = "cyroid-traefik";

/// The default VyOS image.
pub const DEFAULT_VYOS_IMAGE: &str = "vyos/vyos:1.4-rolling";

/// How long to let VyOS boot after starting its container.
pub const DEFAULT_VYOS_BOOT_DELAY_MS: u64 = 3000;

/// The default deadline for `wait_for_router_ready`.
pub const DEFAULT_VYOS_READY_TIMEOUT_SECS: u64 = 60;

/// The default poll interval for `wait_for_router_ready`.
pub const DEFAULT_VYOS_READY_INTERVAL_MS: u64 = 2000;

/// The image used for Windows VMs.
pub const DEFAULT_WINDOWS_IMAGE: &str = "dockurr/windows";

/// The image used for ISO-booted Linux VMs.
pub const DEFAULT_QEMU_IMAGE: &str = "qemux/qemu";

/// How long to wait after starting a container VM before replacing its default route.
pub const DEFAULT_ROUTE_SETTLE_DELAY_MS: u64 = 2000;

/// The minimum amount of free disk space a deployment needs regardless of VM sizes.
pub const DEFAULT_MIN_FREE_DISK_GB: u64 = 20;

/// The shared console credential injected for KasmVNC consoles.
pub const DEFAULT_CONSOLE_USER: &str = "kasm_user";

/// The shared console password injected for KasmVNC consoles.
pub const DEFAULT_CONSOLE_PASSWORD: &str = "vncpassword";

/// The first port handed out for VNC console forwarding.
pub const DEFAULT_VNC_BASE_PORT: u16 = 15900;

/// The image used for the in-sandbox nginx stream proxy.
pub const DEFAULT_NGINX_IMAGE: &str = "nginx:alpine";

/// The reverse proxy entrypoint desktop consoles are routed through.
pub const DEFAULT_PROXY_ENTRYPOINT: &str = "websecure";

/// The default number of CPUs for a VM.
pub const DEFAULT_VM_CPU: u32 = 2;

/// The default amount of RAM in MiB for a VM.
pub const DEFAULT_VM_RAM_MB: u32 = 4096;

/// The default disk size in GiB for a VM.
pub const DEFAULT_VM_DISK_GB: u32 = 40;

/// The path where per-VM storage lives.
pub static DEFAULT_VM_STORAGE_ROOT: LazyLock<PathBuf> =
    LazyLock::new(|| PathBuf::from("/data/cyroid/vm-storage"));

/// The path where ISO files live.
pub static DEFAULT_ISO_ROOT: LazyLock<PathBuf> =
    LazyLock::new(|| PathBuf::from("/data/cyroid/iso-cache"));

/// The path where all cyroid local data is stored.
pub static DEFAULT_CYROID_HOME: LazyLock<PathBuf> = LazyLock::new(|| {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join(CYROID_HOME_DIR)
});
