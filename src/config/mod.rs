//! Configuration management for roomcall-core

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Signaling relay configuration
    #[serde(default)]
    pub signaling: SignalingConfig,

    /// WebRTC configuration
    #[serde(default)]
    pub webrtc: WebRTCConfig,

    /// Local media configuration
    #[serde(default)]
    pub media: MediaConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Relay WebSocket URL
    pub url: String,

    /// Connection attempts before giving up
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Delay between attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "wss://voip-signal-server.vercel.app".to_string(),
            connect_attempts: default_connect_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// One ICE server entry for peer link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRTCConfig {
    /// ICE servers used for candidate gathering
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,

    /// Pre-gathered candidate pool size
    #[serde(default)]
    pub ice_candidate_pool_size: u8,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            ice_candidate_pool_size: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Stream id shared by the local audio and video tracks
    #[serde(default = "default_stream_id")]
    pub stream_id: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            stream_id: default_stream_id(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            webrtc: WebRTCConfig::default(),
            media: MediaConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if !self.signaling.url.starts_with("ws://") && !self.signaling.url.starts_with("wss://") {
            return Err("Signaling URL must start with ws:// or wss://".into());
        }

        if self.signaling.connect_attempts == 0 {
            return Err("Signaling connect_attempts must be non-zero".into());
        }

        if self.webrtc.ice_servers.is_empty()
            || self.webrtc.ice_servers.iter().any(|s| s.urls.is_empty())
        {
            return Err("At least one ICE server with a URL is required".into());
        }

        if self.media.stream_id.is_empty() {
            return Err("Media stream_id must be non-empty".into());
        }

        Ok(())
    }
}

fn default_connect_attempts() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ],
        username: None,
        credential: None,
    }]
}

fn default_stream_id() -> String {
    "roomcall-stream".to_string()
}
