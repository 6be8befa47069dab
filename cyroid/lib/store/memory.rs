use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    models::{BaseImage, GoldenImage, Network, Range, RangeRouter, Snapshot, Vm},
    CyroidResult,
};

use super::RangeStore;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A [`RangeStore`] that lives for the duration of the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    ranges: Vec<Range>,
    networks: Vec<Network>,
    vms: Vec<Vm>,
    routers: HashMap<Uuid, RangeRouter>,
    base_images: HashMap<Uuid, BaseImage>,
    golden_images: HashMap<Uuid, GoldenImage>,
    snapshots: HashMap<Uuid, Snapshot>,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Replaces the record matching `id` in place, or appends it.
fn upsert<T: Clone>(records: &mut Vec<T>, record: &T, id: impl Fn(&T) -> Uuid) {
    let key = id(record);
    match records.iter_mut().find(|r| id(r) == key) {
        Some(existing) => *existing = record.clone(),
        None => records.push(record.clone()),
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl RangeStore for MemoryStore {
    async fn get_range(&self, id: Uuid) -> CyroidResult<Option<Range>> {
        Ok(self
            .state
            .read()
            .await
            .ranges
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn list_ranges(&self) -> CyroidResult<Vec<Range>> {
        Ok(self.state.read().await.ranges.clone())
    }

    async fn save_range(&self, range: &Range) -> CyroidResult<()> {
        upsert(&mut self.state.write().await.ranges, range, |r| r.id);
        Ok(())
    }

    async fn get_network(&self, id: Uuid) -> CyroidResult<Option<Network>> {
        Ok(self
            .state
            .read()
            .await
            .networks
            .iter()
            .find(|n| n.id == id)
            .cloned())
    }

    async fn list_networks(&self, range_id: Uuid) -> CyroidResult<Vec<Network>> {
        Ok(self
            .state
            .read()
            .await
            .networks
            .iter()
            .filter(|n| n.range_id == range_id)
            .cloned()
            .collect())
    }

    async fn save_network(&self, network: &Network) -> CyroidResult<()> {
        upsert(&mut self.state.write().await.networks, network, |n| n.id);
        Ok(())
    }

    async fn get_vm(&self, id: Uuid) -> CyroidResult<Option<Vm>> {
        Ok(self
            .state
            .read()
            .await
            .vms
            .iter()
            .find(|v| v.id == id)
            .cloned())
    }

    async fn list_vms(&self, range_id: Uuid) -> CyroidResult<Vec<Vm>> {
        Ok(self
            .state
            .read()
            .await
            .vms
            .iter()
            .filter(|v| v.range_id == range_id)
            .cloned()
            .collect())
    }

    async fn save_vm(&self, vm: &Vm) -> CyroidResult<()> {
        upsert(&mut self.state.write().await.vms, vm, |v| v.id);
        Ok(())
    }

    async fn delete_vm(&self, id: Uuid) -> CyroidResult<bool> {
        let mut state = self.state.write().await;
        let before = state.vms.len();
        state.vms.retain(|v| v.id != id);
        Ok(state.vms.len() != before)
    }

    async fn get_router(&self, range_id: Uuid) -> CyroidResult<Option<RangeRouter>> {
        Ok(self.state.read().await.routers.get(&range_id).cloned())
    }

    async fn save_router(&self, router: &RangeRouter) -> CyroidResult<()> {
        self.state
            .write()
            .await
            .routers
            .insert(router.range_id, router.clone());
        Ok(())
    }

    async fn get_base_image(&self, id: Uuid) -> CyroidResult<Option<BaseImage>> {
        Ok(self.state.read().await.base_images.get(&id).cloned())
    }

    async fn save_base_image(&self, image: &BaseImage) -> CyroidResult<()> {
        self.state
            .write()
            .await
            .base_images
            .insert(image.id, image.clone());
        Ok(())
    }

    async fn get_golden_image(&self, id: Uuid) -> CyroidResult<Option<GoldenImage>> {
        Ok(self.state.read().await.golden_images.get(&id).cloned())
    }

    async fn save_golden_image(&self, image: &GoldenImage) -> CyroidResult<()> {
        self.state
            .write()
            .await
            .golden_images
            .insert(image.id, image.clone());
        Ok(())
    }

    async fn get_snapshot(&self, id: Uuid) -> CyroidResult<Option<Snapshot>> {
        Ok(self.state.read().await.snapshots.get(&id).cloned())
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> CyroidResult<()> {
        self.state
            .write()
            .await
            .snapshots
            .insert(snapshot.id, snapshot.clone());
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_networks_keep_insertion_order() -> anyhow::Result<()> {
        let store = MemoryStore::default();
        let range = Range::new("r");
        store.save_range(&range).await?;

        let names = ["c", "a", "b"];
        let mut networks = Vec::new();
        for (i, name) in names.iter().enumerate() {
            let network = Network::new(
                range.id,
                *name,
                format!("10.0.{i}.0/24").parse()?,
                format!("10.0.{i}.1").parse()?,
            );
            store.save_network(&network).await?;
            networks.push(network);
        }

        let mut updated = networks[0].clone();
        updated.docker_network_id = Some("abc".into());
        store.save_network(&updated).await?;

        let listed: Vec<String> = store
            .list_networks(range.id)
            .await?
            .into_iter()
            .map(|n| n.name)
            .collect();
        assert_eq!(listed, names);
        assert_eq!(
            store.require_network(updated.id).await?.docker_network_id,
            Some("abc".to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_require_missing_range() {
        let store = MemoryStore::default();
        assert!(matches!(
            store.require_range(Uuid::new_v4()).await,
            Err(crate::CyroidError::RangeNotFound(_))
        ));
    }
}
