use std::{collections::HashMap, sync::Arc};

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    docker::{DockerApi, DockerConnector},
    CyroidResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Holds one nested-daemon client per range.
///
/// Clients are created lazily and live until [`close`](Self::close) is called, which the
/// sandbox manager does whenever a sandbox is stopped or deleted.
pub struct RangeClientRegistry {
    connector: Arc<dyn DockerConnector>,
    clients: Mutex<HashMap<Uuid, CachedClient>>,
}

struct CachedClient {
    docker_url: String,
    client: Arc<dyn DockerApi>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RangeClientRegistry {
    /// Creates an empty registry.
    pub fn new(connector: Arc<dyn DockerConnector>) -> Self {
        Self {
            connector,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// The connector used for new clients.
    pub fn connector(&self) -> &Arc<dyn DockerConnector> {
        &self.connector
    }

    /// Returns the cached client for `range_id`, connecting to `docker_url` if there is none or
    /// the cached one points elsewhere.
    pub async fn get_or_connect(
        &self,
        range_id: Uuid,
        docker_url: &str,
    ) -> CyroidResult<Arc<dyn DockerApi>> {
        let mut clients = self.clients.lock().await;
        if let Some(cached) = clients.get(&range_id) {
            if cached.docker_url == docker_url {
                return Ok(cached.client.clone());
            }
            tracing::debug!(%range_id, docker_url, "sandbox url changed, reconnecting");
        }

        let client = self.connector.connect(docker_url)?;
        clients.insert(
            range_id,
            CachedClient {
                docker_url: docker_url.to_string(),
                client: client.clone(),
            },
        );

        Ok(client)
    }

    /// Caches an already connected client.
    pub async fn insert(&self, range_id: Uuid, docker_url: &str, client: Arc<dyn DockerApi>) {
        self.clients.lock().await.insert(
            range_id,
            CachedClient {
                docker_url: docker_url.to_string(),
                client,
            },
        );
    }

    /// Returns the cached client, if any.
    pub async fn get(&self, range_id: Uuid) -> Option<Arc<dyn DockerApi>> {
        self.clients
            .lock()
            .await
            .get(&range_id)
            .map(|c| c.client.clone())
    }

    /// Evicts the client of `range_id`. Returns whether one was cached.
    pub async fn close(&self, range_id: Uuid) -> bool {
        self.clients.lock().await.remove(&range_id).is_some()
    }

    /// The number of cached clients.
    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Whether no client is cached.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConnector, MockDocker};

    #[tokio::test]
    async fn test_registry_caches_one_client_per_range() -> anyhow::Result<()> {
        let connector = Arc::new(MockConnector::new(Arc::new(MockDocker::new())));
        let registry = RangeClientRegistry::new(connector.clone());
        let range_id = Uuid::new_v4();

        registry.get_or_connect(range_id, "tcp://172.30.0.2:2375").await?;
        registry.get_or_connect(range_id, "tcp://172.30.0.2:2375").await?;
        assert_eq!(connector.connect_count(), 1);
        assert_eq!(registry.len().await, 1);

        registry.get_or_connect(range_id, "tcp://172.30.0.9:2375").await?;
        assert_eq!(connector.connect_count(), 2);
        assert_eq!(registry.len().await, 1);

        assert!(registry.close(range_id).await);
        assert!(!registry.close(range_id).await);
        assert!(registry.is_empty().await);
        Ok(())
    }
}
