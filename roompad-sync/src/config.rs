//! Configuration for the engine, the bundled server and its client.

use std::path::PathBuf;
use std::time::Duration;

use crate::debounce::DEFAULT_DEBOUNCE;
use crate::memory::DEFAULT_FEED_CAPACITY;

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Quiet period after the last edit before content is written
    pub debounce_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_delay: DEFAULT_DEBOUNCE,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Events buffered per feed subscriber
    pub feed_capacity: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            feed_capacity: DEFAULT_FEED_CAPACITY,
            storage_path: None,
        }
    }
}

/// Remote backend configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL, e.g. `ws://127.0.0.1:9090`
    pub url: String,
    /// How long to wait for a response before giving up
    pub request_timeout: Duration,
    /// Capacity of the outgoing frame queue; requests fail with
    /// `ProtocolError::QueueFull` while it is full
    pub outgoing_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            request_timeout: Duration::from_secs(10),
            outgoing_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(SyncConfig::default().debounce_delay, Duration::from_millis(300));

        let server = ServerConfig::default();
        assert_eq!(server.bind_addr, "127.0.0.1:9090");
        assert_eq!(server.feed_capacity, 256);
        assert!(server.storage_path.is_none());

        let client = ClientConfig::new("ws://example:1");
        assert_eq!(client.url, "ws://example:1");
        assert_eq!(client.request_timeout, Duration::from_secs(10));
    }
}
