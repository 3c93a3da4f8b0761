//! Relay configuration.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// How long an empty session survives before eviction
    pub eviction_grace: Duration,
    /// Presence entries not refreshed for this long are tombstoned
    pub awareness_timeout: Duration,
    /// How often the stale-presence sweeper runs
    pub awareness_sweep_interval: Duration,
    /// How long a tombstone is kept after it was broadcast
    pub tombstone_grace: Duration,
    /// Frames buffered per connection before fan-out starts dropping
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            eviction_grace: Duration::from_secs(30),
            awareness_timeout: Duration::from_secs(30),
            awareness_sweep_interval: Duration::from_secs(15),
            tombstone_grace: Duration::from_secs(30),
            broadcast_capacity: 256,
        }
    }
}

impl RelayConfig {
    /// Defaults bound to `addr`.
    pub fn with_bind_addr(addr: impl Into<String>) -> Self {
        Self {
            bind_addr: addr.into(),
            ..Self::default()
        }
    }
}
