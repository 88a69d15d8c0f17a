//! GATT client configuration

use crate::gatt::persist::CacheStore;

/// GATT client configuration
#[derive(Debug, Clone)]
pub struct GattClientConfig {
    /// Maximum number of registered applications
    pub max_applications: usize,
    /// Path prefix of per-device cache files; `None` disables persistence
    pub cache_prefix: Option<String>,
    /// Store the device cache after a successful discovery
    pub persist_on_discovery: bool,
    /// Load the device cache from disk when its link comes up
    pub restore_on_connect: bool,
    /// Name of the dispatcher thread
    pub dispatcher_name: String,
}

impl Default for GattClientConfig {
    fn default() -> Self {
        Self {
            max_applications: 64,
            cache_prefix: None,
            persist_on_discovery: true,
            restore_on_connect: true,
            dispatcher_name: "gattc-dispatch".to_string(),
        }
    }
}

impl GattClientConfig {
    /// Enable persistence under `prefix`.
    pub fn with_cache_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.cache_prefix = Some(prefix.into());
        self
    }

    pub(crate) fn cache_store(&self) -> Option<CacheStore> {
        self.cache_prefix.as_deref().map(CacheStore::new)
    }
}
