//! Protocol versions announced by known peers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;

use tracing::debug;

use crate::config::CURRENT_VERSION;

/// Shared table of the max protocol version each peer has announced.
///
/// Mutations take the write lock; lookups only take the read lock.
#[derive(Debug, Default)]
pub struct VersionTable {
    versions: RwLock<HashMap<SocketAddr, i32>>,
}

impl VersionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `version` for `endpoint`, returning the previous value.
    pub fn set_version(&self, endpoint: SocketAddr, version: i32) -> Option<i32> {
        debug!(%endpoint, version, "Recording peer protocol version");
        match self.versions.write() {
            Ok(mut versions) => versions.insert(endpoint, version),
            Err(poisoned) => poisoned.into_inner().insert(endpoint, version),
        }
    }

    /// Forget whatever was recorded for `endpoint`.
    pub fn reset_version(&self, endpoint: &SocketAddr) {
        debug!(%endpoint, "Resetting peer protocol version");
        match self.versions.write() {
            Ok(mut versions) => versions.remove(endpoint),
            Err(poisoned) => poisoned.into_inner().remove(endpoint),
        };
    }

    /// Version to speak with `endpoint`: the recorded one capped at ours,
    /// or ours if nothing is known.
    pub fn get_version(&self, endpoint: &SocketAddr) -> i32 {
        self.known_version(endpoint)
            .map_or(CURRENT_VERSION, |v| v.min(CURRENT_VERSION))
    }

    /// The raw recorded version, which may be ahead of ours.
    pub fn known_version(&self, endpoint: &SocketAddr) -> Option<i32> {
        match self.versions.read() {
            Ok(versions) => versions.get(endpoint).copied(),
            Err(poisoned) => poisoned.into_inner().get(endpoint).copied(),
        }
    }

    pub fn knows(&self, endpoint: &SocketAddr) -> bool {
        self.known_version(endpoint).is_some()
    }
}
