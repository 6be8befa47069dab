//! Turning a VM record and its catalog image into a container spec.

use std::{collections::HashMap, net::Ipv4Addr, path::PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine};
use uuid::Uuid;

use crate::{
    command::{validate_password, validate_username},
    config::Settings,
    docker::ContainerSpec,
    models::{
        Architecture, BootSource, DisplayType, ImageFamily, ImageSource, LinuxUser, Network,
        OsType, Vm,
    },
    store::RangeStore,
    utils::{vm_container_name, LABEL_RANGE_ID, LABEL_ROLE, LABEL_VM_ID, ROLE_VM},
    CyroidError, CyroidResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Shared memory given to desktop containers.
const DESKTOP_SHM_BYTES: i64 = 512 * 1024 * 1024;

/// Where QEMU-backed images keep their disks.
const QEMU_STORAGE_PATH: &str = "/storage";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How a VM is realized as a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmStrategy {
    /// A Windows install under QEMU, optionally from a supplied ISO.
    Windows {
        /// Version understood by the Windows image.
        version: Option<String>,

        /// Host path of an installer ISO.
        iso: Option<PathBuf>,
    },

    /// A supplied ISO or disk image booted under QEMU.
    CustomIso {
        /// Host path of the image.
        path: PathBuf,
    },

    /// A Linux distro the QEMU image downloads itself.
    LinuxIso {
        /// Distro identifier.
        distro: String,
    },

    /// A plain container image.
    Container {
        /// The image reference.
        image: String,
    },

    /// A committed snapshot image.
    Snapshot {
        /// The image reference.
        image: String,
    },
}

/// A VM's image source resolved against the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    /// How to run it.
    pub strategy: VmStrategy,

    /// The workload family.
    pub family: ImageFamily,

    /// The operating system.
    pub os_type: OsType,

    /// The image architecture.
    pub architecture: Architecture,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmStrategy {
    /// The container image the strategy runs.
    pub fn container_image(&self, settings: &Settings) -> String {
        match self {
            Self::Windows { .. } => settings.get_vm().get_windows_image().clone(),
            Self::CustomIso { .. } | Self::LinuxIso { .. } => {
                settings.get_vm().get_qemu_image().clone()
            }
            Self::Container { image } | Self::Snapshot { image } => image.clone(),
        }
    }

    /// Whether the workload is a QEMU guest rather than a container.
    pub fn is_qemu(&self) -> bool {
        matches!(
            self,
            Self::Windows { .. } | Self::CustomIso { .. } | Self::LinuxIso { .. }
        )
    }
}

impl ResolvedImage {
    /// The container image, taking the family into account for Windows disk images.
    pub fn container_image(&self, settings: &Settings) -> String {
        match (&self.strategy, self.family) {
            (VmStrategy::CustomIso { .. }, ImageFamily::Windows) => {
                settings.get_vm().get_windows_image().clone()
            }
            (strategy, _) => strategy.container_image(settings),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Resolves a VM's image source (base, then golden, then snapshot) into a strategy.
pub async fn resolve_image(
    vm: &Vm,
    store: &dyn RangeStore,
    settings: &Settings,
) -> CyroidResult<ResolvedImage> {
    match vm.image_source()? {
        ImageSource::Base(id) => {
            let base = store
                .get_base_image(id)
                .await?
                .ok_or_else(|| CyroidError::ImageSourceNotFound(format!("base image {id}")))?;

            let boot = match (&base.docker_image, &base.iso_path, vm.boot_source) {
                (Some(_), Some(_), None) => {
                    return Err(CyroidError::InvalidImageSource(format!(
                        "{}: base image {} offers a container and an ISO, choose a boot source",
                        vm.hostname, base.name
                    )))
                }
                (_, _, Some(boot)) => boot,
                (Some(_), None, None) => BootSource::Container,
                (None, _, None) => BootSource::Iso,
            };

            let iso = base
                .iso_path
                .as_ref()
                .map(|p| settings.get_vm().get_iso_root().join(p));

            let strategy = match (base.os_type, boot) {
                (OsType::Windows, _) => VmStrategy::Windows {
                    version: base.version.clone(),
                    iso: if boot == BootSource::Iso { iso } else { None },
                },
                (OsType::Linux, BootSource::Container) => VmStrategy::Container {
                    image: base.docker_image.clone().ok_or_else(|| {
                        CyroidError::InvalidImageSource(format!("{}: no container image", base.name))
                    })?,
                },
                (OsType::Linux, BootSource::Iso) => match (iso, &base.distro) {
                    (Some(path), _) => VmStrategy::CustomIso { path },
                    (None, Some(distro)) => VmStrategy::LinuxIso {
                        distro: distro.clone(),
                    },
                    (None, None) => {
                        return Err(CyroidError::InvalidImageSource(format!(
                            "{}: no ISO and no distro",
                            base.name
                        )))
                    }
                },
            };

            let family = match &strategy {
                VmStrategy::Windows { .. } => ImageFamily::Windows,
                VmStrategy::CustomIso { .. } | VmStrategy::LinuxIso { .. } => ImageFamily::QemuIso,
                _ => base.family,
            };

            Ok(ResolvedImage {
                strategy,
                family,
                os_type: base.os_type,
                architecture: base.architecture,
            })
        }
        ImageSource::Golden(id) => {
            let golden = store
                .get_golden_image(id)
                .await?
                .ok_or_else(|| CyroidError::ImageSourceNotFound(format!("golden image {id}")))?;

            let (strategy, family) = match (&golden.docker_image, &golden.disk_image_path) {
                (Some(image), _) => (
                    VmStrategy::Container {
                        image: image.clone(),
                    },
                    golden.family,
                ),
                (None, Some(path)) => (
                    VmStrategy::CustomIso {
                        path: settings.get_vm().get_storage_root().join(path),
                    },
                    if golden.os_type == OsType::Windows {
                        ImageFamily::Windows
                    } else {
                        ImageFamily::QemuIso
                    },
                ),
                (None, None) => {
                    return Err(CyroidError::InvalidImageSource(format!(
                        "{}: golden image has neither a container nor a disk",
                        golden.name
                    )))
                }
            };

            Ok(ResolvedImage {
                strategy,
                family,
                os_type: golden.os_type,
                architecture: golden.architecture,
            })
        }
        ImageSource::Snapshot(id) => {
            let snapshot = store
                .get_snapshot(id)
                .await?
                .ok_or_else(|| CyroidError::ImageSourceNotFound(format!("snapshot {id}")))?;

            Ok(ResolvedImage {
                strategy: VmStrategy::Snapshot {
                    image: snapshot.docker_image,
                },
                family: snapshot.family,
                os_type: snapshot.os_type,
                architecture: snapshot.architecture,
            })
        }
    }
}

/// Builds the container spec of a VM on its provisioned network.
pub fn build_container_spec(
    range_id: Uuid,
    vm: &Vm,
    network: &Network,
    docker_network: &str,
    resolved: &ResolvedImage,
    settings: &Settings,
) -> CyroidResult<ContainerSpec> {
    let name = vm_container_name(&range_id, &vm.hostname);
    let mut labels = HashMap::from([
        (LABEL_RANGE_ID.to_string(), range_id.to_string()),
        (LABEL_VM_ID.to_string(), vm.id.to_string()),
        (LABEL_ROLE.to_string(), ROLE_VM.to_string()),
    ]);
    if vm.display_type == DisplayType::Desktop {
        labels.extend(proxy_labels(vm.id, resolved.family, settings));
    }

    let dns = if network.dns_servers.is_empty() {
        settings.get_network().get_dns_servers().clone()
    } else {
        network.dns_servers.clone()
    };

    let mut spec = ContainerSpec::builder()
        .name(name.clone())
        .image(resolved.container_image(settings))
        .hostname(vm.hostname.clone())
        .labels(labels)
        .memory_bytes(i64::from(vm.resources.ram_mb) * 1024 * 1024)
        .nano_cpus(i64::from(vm.resources.cpu) * 1_000_000_000)
        .network(docker_network.to_string())
        .ipv4_address(vm.ip_address)
        .dns(dns)
        .build();

    if resolved.strategy.is_qemu() {
        let storage = settings.get_vm().get_storage_root().join(vm.id.to_string());
        spec.env.extend([
            format!("RAM_SIZE={}M", vm.resources.ram_mb),
            format!("CPU_CORES={}", vm.resources.cpu),
            format!("DISK_SIZE={}G", vm.resources.disk_gb),
        ]);
        spec.devices = vec!["/dev/kvm:/dev/kvm".into(), "/dev/net/tun:/dev/net/tun".into()];
        spec.cap_add = vec!["NET_ADMIN".into()];
        spec.binds
            .push(format!("{}:{QEMU_STORAGE_PATH}", storage.display()));
    }

    match &resolved.strategy {
        VmStrategy::Windows { version, iso } => {
            if let Some(version) = version {
                spec.env.push(format!("VERSION={version}"));
            }
            if let Some(iso) = iso {
                spec.binds.push(boot_mount(iso));
            }
            if let Some(credentials) = &vm.windows_credentials {
                spec.env.push(format!("USERNAME={}", credentials.username));
                spec.env.push(format!("PASSWORD={}", credentials.password));
            }
        }
        VmStrategy::CustomIso { path } => spec.binds.push(boot_mount(path)),
        VmStrategy::LinuxIso { distro } => spec.env.push(format!("BOOT={distro}")),
        VmStrategy::Container { .. } | VmStrategy::Snapshot { .. } => {
            spec.cap_add = vec!["NET_ADMIN".into()];
            match resolved.family {
                ImageFamily::KasmVnc => {
                    spec.env
                        .push(format!("VNC_PW={}", settings.get_vm().get_console_password()));
                    spec.shm_size = Some(DESKTOP_SHM_BYTES);
                }
                ImageFamily::LinuxServer => {
                    spec.env.extend([
                        "PUID=1000".to_string(),
                        "PGID=1000".to_string(),
                        "TZ=Etc/UTC".to_string(),
                    ]);
                    spec.shm_size = Some(DESKTOP_SHM_BYTES);
                }
                _ => {}
            }
        }
    }

    Ok(spec)
}

/// Reverse proxy routing labels for a desktop console.
pub fn proxy_labels(vm_id: Uuid, family: ImageFamily, settings: &Settings) -> HashMap<String, String> {
    let router = format!("vm-{vm_id}");
    let (port, scheme) = match family {
        ImageFamily::QemuIso | ImageFamily::Windows => (8006, "http"),
        ImageFamily::LinuxServer => (3000, "http"),
        ImageFamily::KasmVnc | ImageFamily::GenericContainer => (6901, "https"),
    };

    let mut labels = HashMap::from([
        ("traefik.enable".to_string(), "true".to_string()),
        (
            format!("traefik.http.routers.{router}.rule"),
            format!("PathPrefix(`/vnc/{vm_id}`)"),
        ),
        (
            format!("traefik.http.routers.{router}.entrypoints"),
            settings.get_proxy().get_entrypoint().clone(),
        ),
        (format!("traefik.http.routers.{router}.tls"), "true".to_string()),
        (
            format!("traefik.http.services.{router}.loadbalancer.server.port"),
            port.to_string(),
        ),
        (
            format!("traefik.http.services.{router}.loadbalancer.server.scheme"),
            scheme.to_string(),
        ),
    ]);

    if scheme == "https" {
        labels.insert(
            format!("traefik.http.services.{router}.loadbalancer.serverstransport"),
            "insecure@file".to_string(),
        );
    }

    if family == ImageFamily::KasmVnc {
        let vm_settings = settings.get_vm();
        let token = STANDARD.encode(format!(
            "{}:{}",
            vm_settings.get_console_user(),
            vm_settings.get_console_password()
        ));
        labels.insert(
            format!("traefik.http.middlewares.{router}-auth.headers.customrequestheaders.Authorization"),
            format!("Basic {token}"),
        );
        labels.insert(
            format!("traefik.http.routers.{router}.middlewares"),
            format!("{router}-auth"),
        );
    }

    labels
}

/// The exec that points a container's default route at the range gateway.
pub fn default_route_command(gateway: Ipv4Addr) -> Vec<String> {
    vec![
        "ip".to_string(),
        "route".to_string(),
        "replace".to_string(),
        "default".to_string(),
        "via".to_string(),
        gateway.to_string(),
    ]
}

/// The execs that create a Linux account, set its password and optionally grant sudo. Values are
/// passed as positional shell arguments, never spliced into the script.
pub fn user_provisioning_commands(user: &LinuxUser) -> CyroidResult<Vec<Vec<String>>> {
    let username = validate_username(&user.username)?.to_string();
    let password = validate_password(&user.password)?.to_string();

    let shell = |script: &str, args: &[&String]| -> Vec<String> {
        let mut argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "sh".to_string(),
        ];
        argv.extend(args.iter().map(|a| a.to_string()));
        argv
    };

    let mut commands = vec![
        shell(
            "id -u \"$1\" >/dev/null 2>&1 || useradd -m -s /bin/bash \"$1\"",
            &[&username],
        ),
        shell("printf '%s:%s\\n' \"$1\" \"$2\" | chpasswd", &[&username, &password]),
    ];
    if user.sudo {
        commands.push(shell("usermod -aG sudo \"$1\"", &[&username]));
    }

    Ok(commands)
}

/// `/boot.{ext}` read-only mount for an ISO or disk image.
fn boot_mount(path: &std::path::Path) -> String {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("iso");
    format!("{}:/boot.{ext}:ro", path.display())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
