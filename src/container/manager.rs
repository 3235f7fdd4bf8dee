//! Capability map from host id to its container client.

use std::collections::HashMap;
use std::sync::Arc;

use super::ContainerClient;
use crate::agent::identity::ServerId;

/// One managed host: its container client plus the address agents on it are
/// reachable at (published ports bind there).
#[derive(Clone)]
pub struct Host {
    pub server_id: ServerId,
    pub address: String,
    pub client: Arc<dyn ContainerClient>,
}

#[derive(Default)]
pub struct ClientManager {
    hosts: HashMap<ServerId, Host>,
}

impl ClientManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(
        &mut self,
        server_id: ServerId,
        address: impl Into<String>,
        client: Arc<dyn ContainerClient>,
    ) {
        self.hosts.insert(
            server_id.clone(),
            Host {
                server_id,
                address: address.into(),
                client,
            },
        );
    }

    pub fn host(&self, server_id: &ServerId) -> Option<&Host> {
        self.hosts.get(server_id)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::MockContainerClient;

    #[test]
    fn host_lookup() {
        let mut manager = ClientManager::new();
        let main = ServerId::new("main").unwrap();
        manager.add_host(main.clone(), "127.0.0.1", Arc::new(MockContainerClient::new()));

        assert!(manager.host(&main).is_some());
        assert!(manager.host(&ServerId::new("other").unwrap()).is_none());
        assert_eq!(manager.hosts().count(), 1);
    }
}
