use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    models::{BaseImage, GoldenImage, Network, Range, RangeRouter, Snapshot, Vm},
    CyroidError, CyroidResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Reads and writes orchestrator records.
///
/// Lists preserve insertion order; the orchestrator relies on it for interface numbering.
#[async_trait]
pub trait RangeStore: Send + Sync {
    /// Gets a range.
    async fn get_range(&self, id: Uuid) -> CyroidResult<Option<Range>>;

    /// Lists all ranges.
    async fn list_ranges(&self) -> CyroidResult<Vec<Range>>;

    /// Inserts or replaces a range.
    async fn save_range(&self, range: &Range) -> CyroidResult<()>;

    /// Gets a network.
    async fn get_network(&self, id: Uuid) -> CyroidResult<Option<Network>>;

    /// Lists the networks of a range in creation order.
    async fn list_networks(&self, range_id: Uuid) -> CyroidResult<Vec<Network>>;

    /// Inserts or replaces a network.
    async fn save_network(&self, network: &Network) -> CyroidResult<()>;

    /// Gets a VM.
    async fn get_vm(&self, id: Uuid) -> CyroidResult<Option<Vm>>;

    /// Lists the VMs of a range in creation order.
    async fn list_vms(&self, range_id: Uuid) -> CyroidResult<Vec<Vm>>;

    /// Inserts or replaces a VM.
    async fn save_vm(&self, vm: &Vm) -> CyroidResult<()>;

    /// Deletes a VM record. Returns whether it existed.
    async fn delete_vm(&self, id: Uuid) -> CyroidResult<bool>;

    /// Gets the router of a range.
    async fn get_router(&self, range_id: Uuid) -> CyroidResult<Option<RangeRouter>>;

    /// Inserts or replaces the router of a range.
    async fn save_router(&self, router: &RangeRouter) -> CyroidResult<()>;

    /// Gets a base image.
    async fn get_base_image(&self, id: Uuid) -> CyroidResult<Option<BaseImage>>;

    /// Inserts or replaces a base image.
    async fn save_base_image(&self, image: &BaseImage) -> CyroidResult<()>;

    /// Gets a golden image.
    async fn get_golden_image(&self, id: Uuid) -> CyroidResult<Option<GoldenImage>>;

    /// Inserts or replaces a golden image.
    async fn save_golden_image(&self, image: &GoldenImage) -> CyroidResult<()>;

    /// Gets a snapshot.
    async fn get_snapshot(&self, id: Uuid) -> CyroidResult<Option<Snapshot>>;

    /// Inserts or replaces a snapshot.
    async fn save_snapshot(&self, snapshot: &Snapshot) -> CyroidResult<()>;

    /// Gets a range or fails with [`CyroidError::RangeNotFound`].
    async fn require_range(&self, id: Uuid) -> CyroidResult<Range> {
        self.get_range(id)
            .await?
            .ok_or_else(|| CyroidError::RangeNotFound(id.to_string()))
    }

    /// Gets a network or fails with [`CyroidError::NetworkNotFound`].
    async fn require_network(&self, id: Uuid) -> CyroidResult<Network> {
        self.get_network(id)
            .await?
            .ok_or_else(|| CyroidError::NetworkNotFound(id.to_string()))
    }

    /// Gets a VM or fails with [`CyroidError::VmNotFound`].
    async fn require_vm(&self, id: Uuid) -> CyroidResult<Vm> {
        self.get_vm(id)
            .await?
            .ok_or_else(|| CyroidError::VmNotFound(id.to_string()))
    }
}
