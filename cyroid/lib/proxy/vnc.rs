use std::{collections::BTreeMap, collections::HashMap, sync::Arc};

use uuid::Uuid;

use crate::{
    config::{ProxySettings, VncProxyMechanism},
    dind::DindManager,
    docker::{ContainerSpec, DockerApi},
    isolation::{IsolationEngine, VncTarget},
    models::{DindSandbox, VncProxyMapping},
    utils::{vnc_proxy_container_name, LABEL_RANGE_ID, LABEL_ROLE, ROLE_VNC_PROXY},
    CyroidError, CyroidResult,
};

use super::{nginx_command, render_stream_config};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Exposes VM consoles of a range on its sandbox management address.
///
/// Both mechanisms hand out the same sequential ports and produce the same mapping shape.
pub struct VncProxy {
    isolation: Arc<IsolationEngine>,
    dind: Arc<DindManager>,
    settings: ProxySettings,
}

/// A console paired with the sandbox port that reaches it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortAssignment {
    /// The console.
    pub target: VncTarget,

    /// The port on the sandbox management address.
    pub proxy_port: u16,

    /// Whether the port was handed out by this assignment rather than carried over.
    pub is_new: bool,
}

/// Which consoles of a range to expose.
#[derive(Debug, Clone, Copy)]
pub struct ConsoleRequest<'a> {
    /// The range.
    pub range_id: Uuid,

    /// Its sandbox.
    pub sandbox: &'a DindSandbox,

    /// The range's Docker network names in the nested daemon.
    pub networks: &'a [String],

    /// Mappings the range already has.
    pub existing: &'a BTreeMap<Uuid, VncProxyMapping>,

    /// Every console that should be reachable.
    pub targets: &'a [VncTarget],
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VncProxy {
    /// Creates a proxy using the configured mechanism.
    pub fn new(isolation: Arc<IsolationEngine>, dind: Arc<DindManager>, settings: ProxySettings) -> Self {
        Self {
            isolation,
            dind,
            settings,
        }
    }

    /// The configured mechanism.
    pub fn mechanism(&self) -> VncProxyMechanism {
        *self.settings.get_mechanism()
    }

    /// Makes every requested console reachable and returns the range's updated mapping table.
    ///
    /// Consoles that already have a mapping keep their port. Mappings of VMs absent from the
    /// request are carried over untouched.
    pub async fn expose(
        &self,
        request: ConsoleRequest<'_>,
    ) -> CyroidResult<BTreeMap<Uuid, VncProxyMapping>> {
        let assignments = assign_ports(request.existing, request.targets, *self.settings.get_base_port())?;
        let mut mappings = request.existing.clone();

        match self.mechanism() {
            VncProxyMechanism::Iptables => {
                for assignment in assignments.iter().filter(|a| a.is_new) {
                    let applied = self
                        .isolation
                        .setup_vnc_port_forwarding_from(
                            request.range_id,
                            std::slice::from_ref(&assignment.target),
                            assignment.proxy_port,
                        )
                        .await?;
                    mappings.extend(applied);
                }
            }
            VncProxyMechanism::Nginx => {
                if !assignments.is_empty() {
                    self.rebuild_nginx(&request, &assignments).await?;
                }
                for assignment in &assignments {
                    mappings.insert(
                        assignment.target.vm_id,
                        VncProxyMapping {
                            proxy_port: assignment.proxy_port,
                            proxy_host: request.sandbox.management_ip.to_string(),
                            original_port: assignment.target.port,
                        },
                    );
                }
            }
        }

        tracing::info!(
            range_id = %request.range_id,
            mechanism = ?self.mechanism(),
            consoles = mappings.len(),
            "console mappings updated"
        );
        Ok(mappings)
    }

    /// Removes the nginx proxy of a range, if any.
    pub async fn remove(&self, range_id: Uuid, sandbox: &DindSandbox) -> CyroidResult<()> {
        if self.mechanism() != VncProxyMechanism::Nginx {
            return self.isolation.teardown_vnc_port_forwarding(range_id).await;
        }

        let client = self
            .dind
            .get_range_client(range_id, &sandbox.docker_url)
            .await?;
        remove_if_present(client.as_ref(), &vnc_proxy_container_name(&range_id)).await
    }

    /// Replaces the proxy container with one serving every assignment.
    async fn rebuild_nginx(
        &self,
        request: &ConsoleRequest<'_>,
        assignments: &[PortAssignment],
    ) -> CyroidResult<()> {
        let range_id = request.range_id;
        let client = self
            .dind
            .get_range_client(range_id, &request.sandbox.docker_url)
            .await?;

        let image = self.settings.get_nginx_image();
        if !client.image_exists(image).await? {
            tracing::info!(%range_id, image, "pulling console proxy image");
            client.pull_image(image).await?;
        }

        let name = vnc_proxy_container_name(&range_id);
        remove_if_present(client.as_ref(), &name).await?;

        let (first, rest) = request
            .networks
            .split_first()
            .ok_or_else(|| CyroidError::InvalidState(format!("range {range_id} has no networks")))?;

        let config = render_stream_config(assignments);
        let spec = ContainerSpec::builder()
            .name(name.clone())
            .image(image.clone())
            .cmd(nginx_command(&config))
            .labels(HashMap::from([
                (LABEL_RANGE_ID.to_string(), range_id.to_string()),
                (LABEL_ROLE.to_string(), ROLE_VNC_PROXY.to_string()),
            ]))
            .network(first.clone())
            .published_ports(assignments.iter().map(|a| a.proxy_port).collect())
            .build();

        let id = client.create_container(&spec).await?;
        for network in rest {
            client.connect_network(network, &id, None).await?;
        }
        client.start_container(&id).await?;

        tracing::info!(%range_id, container = %name, upstreams = assignments.len(), "console proxy rebuilt");
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Pairs every target with a port. Targets with an existing mapping keep its port; the rest get
/// sequential ports after the highest port in use, or from `base_port` when there is none.
pub fn assign_ports(
    existing: &BTreeMap<Uuid, VncProxyMapping>,
    targets: &[VncTarget],
    base_port: u16,
) -> CyroidResult<Vec<PortAssignment>> {
    let mut next = existing
        .values()
        .map(|m| m.proxy_port)
        .max()
        .map_or(Some(base_port), |max| max.checked_add(1));

    let mut assignments = Vec::with_capacity(targets.len());
    for target in targets {
        let (proxy_port, is_new) = match existing.get(&target.vm_id) {
            Some(mapping) => (mapping.proxy_port, false),
            None => {
                let port = next
                    .ok_or_else(|| CyroidError::AddressPoolExhausted("console ports".to_string()))?;
                next = port.checked_add(1);
                (port, true)
            }
        };
        assignments.push(PortAssignment {
            target: target.clone(),
            proxy_port,
            is_new,
        });
    }

    Ok(assignments)
}

async fn remove_if_present(client: &dyn DockerApi, name: &str) -> CyroidResult<()> {
    match client.remove_container(name, true).await {
        Err(e) if e.is_not_found() => Ok(()),
        result => result,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
