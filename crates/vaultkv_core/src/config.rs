//! Vault configuration.

/// Default name of the backing record store.
pub const DEFAULT_STORE_NAME: &str = "vault";

/// Default number of change events kept for polling.
pub const DEFAULT_MAX_EVENT_HISTORY: usize = 1024;

/// Configuration for opening a vault.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Name of the record store opened on the backend.
    pub store_name: String,

    /// Maximum number of change events retained for
    /// [`changes_since`](crate::Vault::changes_since).
    pub max_event_history: usize,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            store_name: DEFAULT_STORE_NAME.to_owned(),
            max_event_history: DEFAULT_MAX_EVENT_HISTORY,
        }
    }
}

impl VaultConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the store name.
    #[must_use]
    pub fn store_name(mut self, name: impl Into<String>) -> Self {
        self.store_name = name.into();
        self
    }

    /// Sets the change event history limit.
    #[must_use]
    pub const fn max_event_history(mut self, limit: usize) -> Self {
        self.max_event_history = limit;
        self
    }
}
