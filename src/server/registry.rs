use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::Result;
use crate::server::Server;

/// Process-wide map of the servers this node manages. Reads are concurrent,
/// writes exclusive. Servers live here for the process lifetime; removal
/// tears the server all the way down.
pub struct ServerRegistry {
    servers: RwLock<HashMap<Uuid, Arc<Server>>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add(&self, server: Arc<Server>) {
        self.servers.write().await.insert(server.id(), server);
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<Server>> {
        self.servers.read().await.get(&id).cloned()
    }

    pub async fn all(&self) -> Vec<Arc<Server>> {
        self.servers.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.servers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.servers.read().await.is_empty()
    }

    /// Drops a server: destroys its backing environment, then its event bus
    /// so subscribers drain, then releases the data-directory handle along
    /// with the server itself.
    pub async fn remove(&self, id: Uuid) -> Result<()> {
        let Some(server) = self.servers.write().await.remove(&id) else {
            return Ok(());
        };

        let result = server.environment().destroy().await;
        if let Err(err) = &result {
            error!(server = %id, error = %err, "failed to destroy environment while removing server");
        }

        server.events().destroy();
        info!(server = %id, "removed server from registry");

        result
    }
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
