use std::sync::Arc;

use uuid::Uuid;

use crate::{
    config::Settings,
    dind::{DindManager, RangeClientRegistry},
    docker::{DockerApi, DockerConnector},
    isolation::IsolationEngine,
    models::{DeploymentEvent, DindSandbox, EventType, Network, Range, RangeRouter, RangeStatus, Vm},
    proxy::VncProxy,
    store::RangeStore,
    utils::{docker_network_name, truncate_message, RANGE_ERROR_MAX_LEN},
    validator::{DeploymentValidator, SysinfoDiskProbe},
    vyos::VyosController,
    CyroidError, CyroidResult,
};

use super::EventSink;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Drives ranges through deploy, stop, start and teardown.
///
/// The orchestrator is the only component that turns errors into persisted status. Operations
/// on one range must be serialized by the caller.
pub struct Orchestrator {
    pub(super) settings: Settings,
    pub(super) host: Arc<dyn DockerApi>,
    pub(super) dind: Arc<DindManager>,
    pub(super) isolation: Arc<IsolationEngine>,
    pub(super) proxy: VncProxy,
    pub(super) store: Arc<dyn RangeStore>,
    pub(super) events: Arc<dyn EventSink>,
}

/// Everything persisted about a range.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeOverview {
    /// The range.
    pub range: Range,

    /// Its router, if one was ever created.
    pub router: Option<RangeRouter>,

    /// Its networks.
    pub networks: Vec<Network>,

    /// Its VMs.
    pub vms: Vec<Vm>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Wires the orchestrator and its components over the host daemon.
    pub fn new(
        settings: Settings,
        host: Arc<dyn DockerApi>,
        connector: Arc<dyn DockerConnector>,
        store: Arc<dyn RangeStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let registry = Arc::new(RangeClientRegistry::new(connector));
        let dind = Arc::new(DindManager::new(
            host.clone(),
            registry,
            settings.get_dind().clone(),
        ));
        let isolation = Arc::new(IsolationEngine::new(
            dind.clone(),
            *settings.get_proxy().get_base_port(),
        ));
        let proxy = VncProxy::new(isolation.clone(), dind.clone(), settings.get_proxy().clone());

        Self {
            settings,
            host,
            dind,
            isolation,
            proxy,
            store,
            events,
        }
    }

    /// The settings in effect.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The sandbox manager.
    pub fn dind(&self) -> &Arc<DindManager> {
        &self.dind
    }

    /// The store the orchestrator persists to.
    pub fn store(&self) -> &Arc<dyn RangeStore> {
        &self.store
    }

    /// A pre-flight validator over the same daemons and store, reading free space from the
    /// mounted filesystems.
    pub fn validator(&self) -> DeploymentValidator {
        DeploymentValidator::new(
            self.settings.clone(),
            self.host.clone(),
            self.dind.clone(),
            self.store.clone(),
            Arc::new(SysinfoDiskProbe),
        )
    }

    /// Loads a range with its router, networks and VMs.
    pub async fn describe_range(&self, range_id: Uuid) -> CyroidResult<RangeOverview> {
        let range = self.store.require_range(range_id).await?;
        Ok(RangeOverview {
            router: self.store.get_router(range_id).await?,
            networks: self.store.list_networks(range_id).await?,
            vms: self.store.list_vms(range_id).await?,
            range,
        })
    }

    /// Whether ranges live in per-range sandboxes.
    pub(super) fn is_dind(&self) -> bool {
        *self.settings.get_dind().get_enabled()
    }

    /// The daemon a range's networks, router and VMs live on.
    pub(super) async fn target_docker(&self, range: &Range) -> CyroidResult<Arc<dyn DockerApi>> {
        if !self.is_dind() {
            return Ok(self.host.clone());
        }

        let sandbox = range
            .sandbox
            .as_ref()
            .ok_or_else(|| CyroidError::SandboxNotFound(range.id.to_string()))?;
        self.dind
            .get_range_client(range.id, &sandbox.docker_url)
            .await
    }

    /// A router controller on `docker`.
    pub(super) fn vyos(&self, docker: Arc<dyn DockerApi>) -> VyosController {
        VyosController::new(
            docker,
            self.settings.get_vyos().clone(),
            self.settings.get_network().clone(),
        )
    }

    /// Makes sure the range has a reachable sandbox and records it on the range.
    ///
    /// A running sandbox is reused, a stopped one is started and a missing one is created.
    pub(super) async fn ensure_sandbox(&self, range: &mut Range) -> CyroidResult<DindSandbox> {
        let range_id = range.id;

        let sandbox = match self.dind.get_container_info(range_id).await? {
            Some(sandbox) => {
                let client = self
                    .dind
                    .get_range_client(range_id, &sandbox.docker_url)
                    .await?;
                match client.ping().await {
                    Ok(()) => sandbox,
                    Err(e) => {
                        tracing::warn!(%range_id, error = %e, "sandbox daemon not answering, restarting sandbox");
                        self.dind.restart_range_container(range_id).await?
                    }
                }
            }
            None => {
                let stopped = self
                    .dind
                    .list_range_containers()
                    .await?
                    .iter()
                    .any(|s| s.range_id == range_id);

                if stopped {
                    tracing::info!(%range_id, "starting existing sandbox");
                    self.dind.start_range_container(range_id).await?
                } else {
                    let sandbox = self
                        .dind
                        .create_range_container(range_id, Some(&range.name), None, None)
                        .await?;
                    self.emit(
                        DeploymentEvent::new(
                            range_id,
                            EventType::SandboxCreated,
                            format!("sandbox {} created", sandbox.container_name),
                        )
                        .with_extra(serde_json::json!({
                            "container_name": sandbox.container_name,
                            "management_ip": sandbox.management_ip.to_string(),
                        })),
                    );
                    sandbox
                }
            }
        };

        range.sandbox = Some(sandbox.clone());
        self.save_range(range).await?;
        Ok(sandbox)
    }

    /// Docker network names of every provisioned network of a range, plus the subset with
    /// internet access.
    pub(super) async fn provisioned_network_names(
        &self,
        range_id: Uuid,
    ) -> CyroidResult<(Vec<String>, Vec<String>)> {
        let networks = self.store.list_networks(range_id).await?;
        let provisioned: Vec<&Network> = networks
            .iter()
            .filter(|n| n.docker_network_id.is_some())
            .collect();

        let names = provisioned
            .iter()
            .map(|n| docker_network_name(&range_id, &n.name))
            .collect();
        let internet = provisioned
            .iter()
            .filter(|n| n.internet_enabled)
            .map(|n| docker_network_name(&range_id, &n.name))
            .collect();
        Ok((names, internet))
    }

    /// Persists a range, bumping its modification time.
    pub(super) async fn save_range(&self, range: &mut Range) -> CyroidResult<()> {
        range.modified_at = chrono::Utc::now();
        self.store.save_range(range).await
    }

    /// Moves a range to `ERROR` with the failure recorded. Persistence failures are logged.
    pub(super) async fn fail_range(&self, range: &mut Range, error: &CyroidError) {
        range.status = RangeStatus::Error;
        range.error_message = Some(truncate_message(&error.to_string(), RANGE_ERROR_MAX_LEN));
        if let Err(e) = self.save_range(range).await {
            tracing::error!(range_id = %range.id, error = %e, "failed to persist range failure");
        }

        self.emit(DeploymentEvent::new(
            range.id,
            EventType::DeploymentFailed,
            format!("deployment failed: {error}"),
        ));
    }

    /// Hands an event to the sink.
    pub(super) fn emit(&self, event: DeploymentEvent) {
        self.events.log_event(event);
    }
}
