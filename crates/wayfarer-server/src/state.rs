use std::path::PathBuf;
use std::sync::Arc;

use wayfarer_gateway::Gateway;

/// Shared application state accessible from all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Config root (holds wayfarer.yaml, data/ and logs/)
    pub root: PathBuf,
    pub gateway: Arc<Gateway>,
}

impl AppState {
    pub fn new(root: impl Into<PathBuf>, gateway: Arc<Gateway>) -> Self {
        Self {
            root: root.into(),
            gateway,
        }
    }

    pub fn bus(&self) -> &Arc<wayfarer_bus::EventBus> {
        self.gateway.bus()
    }
}

#[cfg(test)]
pub(crate) fn test_state(
    configure: impl FnOnce(&mut wayfarer_core::WayfarerConfig),
) -> (AppState, tempfile::TempDir) {
    let tmp = tempfile::TempDir::new().unwrap();
    let mut config = wayfarer_core::WayfarerConfig::default();
    config.provider = wayfarer_provider::ProviderConfig::stub();
    config.security.semantic_enabled = false;
    configure(&mut config);
    let gateway = Gateway::from_config(&config, tmp.path()).unwrap();
    (AppState::new(tmp.path(), Arc::new(gateway)), tmp)
}
