//! The membership collaborator seen from the messaging layer.

use std::net::SocketAddr;
use std::sync::Mutex;

use tracing::info;

/// Cluster membership as far as connections need it.
pub trait Membership: Send + Sync {
    /// Remember `endpoint` so it gets reconnected later.
    fn add_saved_endpoint(&self, endpoint: SocketAddr);
}

/// In-memory membership that only keeps the saved endpoints.
#[derive(Debug, Default)]
pub struct SavedEndpoints {
    saved: Mutex<Vec<SocketAddr>>,
}

impl SavedEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved(&self) -> Vec<SocketAddr> {
        match self.saved.lock() {
            Ok(saved) => saved.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Membership for SavedEndpoints {
    fn add_saved_endpoint(&self, endpoint: SocketAddr) {
        info!(%endpoint, "Saving endpoint for reconnection");
        match self.saved.lock() {
            Ok(mut saved) => saved.push(endpoint),
            Err(poisoned) => poisoned.into_inner().push(endpoint),
        }
    }
}
