//! Configuration shared by routes and the sockets they spawn.

use std::time::Duration;

/// Tunables for a WebSocket route.
///
/// The defaults mirror common server settings: traffic is logged without
/// payload bodies, there is no init deadline, and message sizes are capped
/// well below anything a browser will produce.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Emit a structured log record for every inbound and outbound message.
    pub log_traffic: bool,
    /// Include the payload body in traffic records. Off by default since
    /// payloads may carry user data.
    pub log_payloads: bool,
    /// How long to wait for the init message on routes that require one.
    /// `None` waits indefinitely.
    pub init_timeout: Option<Duration>,
    /// Maximum size of a complete (possibly fragmented) message in bytes.
    pub max_message_size: usize,
    /// Maximum size of a single frame in bytes.
    pub max_frame_size: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            log_traffic: true,
            log_payloads: false,
            init_timeout: None,
            max_message_size: 64 * 1024 * 1024,
            max_frame_size: 16 * 1024 * 1024,
        }
    }
}

impl WsConfig {
    /// Create a config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether traffic records are emitted.
    #[must_use]
    pub const fn log_traffic(mut self, enabled: bool) -> Self {
        self.log_traffic = enabled;
        self
    }

    /// Set whether traffic records include payload bodies.
    #[must_use]
    pub const fn log_payloads(mut self, enabled: bool) -> Self {
        self.log_payloads = enabled;
        self
    }

    /// Set the init handshake deadline.
    #[must_use]
    pub const fn init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = Some(timeout);
        self
    }

    /// Set the maximum message size in bytes.
    #[must_use]
    pub const fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the maximum frame size in bytes.
    #[must_use]
    pub const fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}
