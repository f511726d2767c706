//! Session and relay configuration.
//!
//! All timing constants of the collaboration session live here so tests can
//! shrink them; the defaults are the production values.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ProtocolError;

/// Configuration for one collaboration session.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Heartbeat interval while connected, in seconds
    pub heartbeat_interval_secs: u64,
    /// Delay between a socket close and the next reconnect attempt, in seconds
    pub reconnect_delay_secs: u64,
    /// Consecutive failed reconnects tolerated before giving up
    pub max_reconnect_attempts: u32,
    /// Recovery cache mirroring interval, in milliseconds
    pub cache_interval_ms: u64,
    /// Delay before leaving the room after a partner-forced termination, in seconds
    pub terminate_redirect_secs: u64,
    /// Average spectrum level (0..=255) above which the local side is "speaking"
    pub speech_threshold: f32,
    /// FFT window used by the speech detector
    pub fft_size: usize,
    /// Speech sampling cadence, in milliseconds
    pub speech_sample_ms: u64,
    /// STUN/TURN urls handed to the peer connection factory
    pub ice_servers: Vec<String>,
    /// Relay used for signaling and document frames
    pub relay_url: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 60,
            reconnect_delay_secs: 5,
            max_reconnect_attempts: 5,
            cache_interval_ms: 3_000,
            terminate_redirect_secs: 3,
            speech_threshold: 20.0,
            fft_size: 512,
            speech_sample_ms: 16,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            relay_url: "ws://127.0.0.1:9090".to_string(),
        }
    }
}

impl SessionConfig {
    /// Parse a (possibly partial) JSON config; missing fields take defaults.
    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn cache_interval(&self) -> Duration {
        Duration::from_millis(self.cache_interval_ms)
    }

    pub fn terminate_redirect_delay(&self) -> Duration {
        Duration::from_secs(self.terminate_redirect_secs)
    }

    pub fn speech_sample_interval(&self) -> Duration {
        Duration::from_millis(self.speech_sample_ms)
    }
}

/// Relay server configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum members per topic (a room has two participants; the
    /// signaling topic of a room can briefly hold a stale socket too)
    pub max_peers_per_topic: usize,
    /// Broadcast channel capacity per topic
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_topic: 8,
            broadcast_capacity: 256,
        }
    }
}
