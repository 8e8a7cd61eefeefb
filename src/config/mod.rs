//! Configuration management for castbridge

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Capture-agent TCP receiver
    pub receiver: ReceiverConfig,

    /// HTTP / signaling front-end
    pub http: HttpConfig,

    /// Viewer login policy
    pub auth: AuthConfig,

    /// Video stream defaults
    pub video: VideoConfig,

    /// Audio configuration
    #[serde(default)]
    pub audio: AudioConfig,

    /// Peer connection settings
    #[serde(default)]
    pub webrtc: WebRTCConfig,

    /// Viewer relay (client side)
    #[serde(default)]
    pub viewer: ViewerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Bind address for agent connections
    pub host: String,

    /// Port for agent connections
    pub port: u16,

    /// How long a new socket may stay silent before it is treated as the
    /// control channel
    #[serde(default = "default_sniff_timeout_ms")]
    pub sniff_timeout_ms: u64,

    /// Agent was started through adb and sends a 64-byte device name first
    #[serde(default)]
    pub use_adb: bool,

    /// Largest accepted frame payload
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// HTTP bind address
    pub host: String,

    /// HTTP port (static files, /health, /ws)
    pub port: u16,

    /// Directory served for the browser viewer
    #[serde(default)]
    pub web_root: Option<PathBuf>,

    /// Refuse WebSocket upgrades from non-private IPv4 peers
    #[serde(default = "default_lan_only")]
    pub lan_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared viewer password
    pub password: String,

    /// How long a used login token is remembered
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,

    /// Accepted distance between the client timestamp and server time
    #[serde(default = "default_clock_skew_ms")]
    pub clock_skew_ms: u64,

    /// Window over which failed logins per IP are counted
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,

    /// Failed logins tolerated per IP inside the window
    #[serde(default = "default_lockout_threshold")]
    pub lockout_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Initial width until the agent announces one
    pub width: u32,

    /// Initial height until the agent announces one
    pub height: u32,

    /// Screen orientation reported to viewers (0..3)
    #[serde(default)]
    pub orientation: u32,

    /// Default maxSize hint before a viewer logs in
    #[serde(default = "default_max_size")]
    pub max_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Publish an Opus track
    pub enabled: bool,

    /// Sample rate (Hz)
    pub sample_rate: u32,

    /// Channel count
    pub channels: u16,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 48_000,
            channels: 2,
        }
    }
}

/// WebRTC configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebRTCConfig {
    /// STUN/TURN URLs; empty for LAN-only operation
    #[serde(default)]
    pub ice_servers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerConfig {
    /// Signaling endpoint of the remote bridge
    pub server_url: String,

    /// Where the re-framed H264 stream is written
    pub output: String,

    /// maxSize hint sent with the login
    #[serde(default = "default_max_size")]
    pub max_size: u32,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8008/ws".to_string(),
            output: "127.0.0.1:8554".to_string(),
            max_size: default_max_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            receiver: ReceiverConfig {
                host: "0.0.0.0".to_string(),
                port: 27183,
                sniff_timeout_ms: default_sniff_timeout_ms(),
                use_adb: false,
                max_frame_size: default_max_frame_size(),
            },
            http: HttpConfig {
                host: "0.0.0.0".to_string(),
                port: 8008,
                web_root: None,
                lan_only: true,
            },
            auth: AuthConfig {
                password: "castbridge".to_string(),
                token_ttl_secs: default_token_ttl_secs(),
                clock_skew_ms: default_clock_skew_ms(),
                failure_window_secs: default_failure_window_secs(),
                lockout_threshold: default_lockout_threshold(),
            },
            video: VideoConfig {
                width: 1280,
                height: 720,
                orientation: 0,
                max_size: default_max_size(),
            },
            audio: AudioConfig::default(),
            webrtc: WebRTCConfig::default(),
            viewer: ViewerConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
            },
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
        if self.video.width == 0 || self.video.height == 0 {
            return Err("Video dimensions must be non-zero".into());
        }

        if self.video.orientation > 3 {
            return Err("Video orientation must be 0..3".into());
        }

        if self.auth.password.is_empty() {
            return Err("Viewer password must not be empty".into());
        }

        // A token must outlive the window in which its timestamp is accepted
        if self.auth.token_ttl_secs * 1000 <= self.auth.clock_skew_ms {
            return Err("Auth token_ttl_secs must exceed clock_skew_ms".into());
        }

        if self.auth.lockout_threshold == 0 {
            return Err("Auth lockout_threshold must be non-zero".into());
        }

        if self.receiver.max_frame_size == 0 {
            return Err("Receiver max_frame_size must be non-zero".into());
        }

        if self.receiver.port == self.http.port && self.receiver.host == self.http.host {
            return Err("Receiver and HTTP listeners cannot share an address".into());
        }

        if self.audio.enabled {
            if self.audio.sample_rate == 0 {
                return Err("Audio sample rate must be non-zero".into());
            }
            if self.audio.channels == 0 || self.audio.channels > 2 {
                return Err("Audio channels must be 1 or 2".into());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_short_token_ttl() {
        let mut cfg = Config::default();
        cfg.auth.token_ttl_secs = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_audio_requires_channels() {
        let mut cfg = Config::default();
        cfg.audio.channels = 3;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let toml = r#"
            [receiver]
            host = "127.0.0.1"
            port = 9000

            [http]
            host = "127.0.0.1"
            port = 9001

            [auth]
            password = "secret"

            [video]
            width = 1920
            height = 1080

            [logging]
            level = "debug"
        "#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.auth.token_ttl_secs, 20);
        assert_eq!(cfg.auth.clock_skew_ms, 10_000);
        assert_eq!(cfg.auth.lockout_threshold, 20);
        assert!(cfg.http.lan_only);
        assert!(cfg.audio.enabled);
        assert!(cfg.validate().is_ok());
    }
}

fn default_sniff_timeout_ms() -> u64 { 3000 }
fn default_max_frame_size() -> usize { 5 * 1024 * 1024 }
fn default_lan_only() -> bool { true }
fn default_token_ttl_secs() -> u64 { 20 }
fn default_clock_skew_ms() -> u64 { 10_000 }
fn default_failure_window_secs() -> u64 { 3600 }
fn default_lockout_threshold() -> u32 { 20 }
fn default_max_size() -> u32 { 1920 }
