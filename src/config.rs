//! Synchronization Configuration
//!
//! Every tunable of the sync core in one place. Values come from
//! [`SyncConfig::default`], optionally a JSON file, then `SYNC_*`
//! environment variables layered on top.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Development passphrase shared by every build that does not override it.
pub const DEFAULT_PASSPHRASE: &str = "syncore-dev-shared-secret";

/// Serialization used for the message body before compression/encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// Human-readable JSON.
    Json,
    /// Compact bincode.
    Binary,
}

/// What the client agent does when the server corrects its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationMode {
    /// Adopt the server sample, then replay newer buffered inputs.
    Replay,
    /// Adopt the server sample and discard the local prediction.
    SnapOnly,
}

/// Configuration for every component of the sync core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Interface the listener binds to.
    pub bind_host: String,
    /// Listener port.
    pub port: u16,
    /// Maximum concurrent sessions.
    pub max_players: usize,
    /// Tick rate for snapshot broadcast (Hz).
    pub tick_rate: u32,
    /// Enable server-side movement validation.
    pub validate_movement: bool,
    /// Maximum movement speed (units per second).
    pub max_speed: f32,
    /// Extra distance allowed on top of `max_speed * elapsed`.
    pub teleport_tolerance: f32,
    /// Body serialization.
    pub wire_format: WireFormat,
    /// Enable LZ4 compression of large bodies.
    pub compression: bool,
    /// Minimum body size (bytes) before compression is attempted.
    pub compression_threshold: usize,
    /// Enable AES-128-CBC encryption of frames.
    pub encryption: bool,
    /// Passphrase the key and IV are derived from.
    pub encryption_passphrase: String,
    /// Explicit key (hex, 16 bytes). Overrides the passphrase.
    pub encryption_key_hex: Option<String>,
    /// Explicit IV (hex, 16 bytes). Overrides the passphrase.
    pub encryption_iv_hex: Option<String>,
    /// Delay between client connection attempts (milliseconds).
    pub reconnect_delay_ms: u64,
    /// Client connection attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Enable client-side prediction.
    pub prediction: bool,
    /// Capacity of the predicted-input ring buffer.
    pub prediction_buffer_size: usize,
    /// How the client reacts to corrections.
    pub reconciliation: ReconciliationMode,
    /// Remote peer interpolation rate (per second).
    pub interpolation_rate: f32,
    /// Per-session outbound queue capacity (messages).
    pub outbound_queue_capacity: usize,
    /// WebSocket handshake / welcome timeout (milliseconds).
    pub handshake_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: 7777,
            max_players: 16,
            tick_rate: 30,
            validate_movement: true,
            max_speed: 15.0,
            teleport_tolerance: 5.0,
            wire_format: WireFormat::Json,
            compression: false,
            compression_threshold: 256,
            encryption: false,
            encryption_passphrase: DEFAULT_PASSPHRASE.to_string(),
            encryption_key_hex: None,
            encryption_iv_hex: None,
            reconnect_delay_ms: 2000,
            max_reconnect_attempts: 5,
            prediction: true,
            prediction_buffer_size: 32,
            reconciliation: ReconciliationMode::Replay,
            interpolation_rate: 10.0,
            outbound_queue_capacity: 128,
            handshake_timeout_ms: 5000,
        }
    }
}

impl SyncConfig {
    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Overlay `SYNC_*` environment variables onto this configuration.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("SYNC_BIND_HOST") {
            self.bind_host = v;
        }
        if let Some(v) = env_parse("SYNC_PORT")? {
            self.port = v;
        }
        if let Some(v) = env_parse("SYNC_MAX_PLAYERS")? {
            self.max_players = v;
        }
        if let Some(v) = env_parse("SYNC_TICK_RATE")? {
            self.tick_rate = v;
        }
        if let Some(v) = env_flag("SYNC_VALIDATE_MOVEMENT")? {
            self.validate_movement = v;
        }
        if let Some(v) = env_parse("SYNC_MAX_SPEED")? {
            self.max_speed = v;
        }
        if let Some(v) = env_parse("SYNC_TELEPORT_TOLERANCE")? {
            self.teleport_tolerance = v;
        }
        if let Some(v) = env_flag("SYNC_COMPRESSION")? {
            self.compression = v;
        }
        if let Some(v) = env_flag("SYNC_ENCRYPTION")? {
            self.encryption = v;
        }
        if let Ok(v) = std::env::var("SYNC_PASSPHRASE") {
            self.encryption_passphrase = v;
        }
        if let Ok(v) = std::env::var("SYNC_KEY_HEX") {
            self.encryption_key_hex = Some(v);
        }
        if let Ok(v) = std::env::var("SYNC_IV_HEX") {
            self.encryption_iv_hex = Some(v);
        }
        if let Some(v) = env_parse("SYNC_RECONNECT_DELAY_MS")? {
            self.reconnect_delay_ms = v;
        }
        if let Some(v) = env_parse("SYNC_MAX_RECONNECT_ATTEMPTS")? {
            self.max_reconnect_attempts = v;
        }
        if let Some(v) = env_flag("SYNC_PREDICTION")? {
            self.prediction = v;
        }
        if let Some(v) = env_parse("SYNC_PREDICTION_BUFFER_SIZE")? {
            self.prediction_buffer_size = v;
        }
        self.validate()
    }

    /// Reject values the core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate == 0 {
            return Err(ConfigError::Invalid("tick_rate must be greater than zero".into()));
        }
        if self.max_players == 0 {
            return Err(ConfigError::Invalid("max_players must be greater than zero".into()));
        }
        if self.prediction_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "prediction_buffer_size must be greater than zero".into(),
            ));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "outbound_queue_capacity must be greater than zero".into(),
            ));
        }
        if !(self.max_speed.is_finite() && self.max_speed >= 0.0) {
            return Err(ConfigError::Invalid("max_speed must be a non-negative number".into()));
        }
        if !(self.teleport_tolerance.is_finite() && self.teleport_tolerance >= 0.0) {
            return Err(ConfigError::Invalid(
                "teleport_tolerance must be a non-negative number".into(),
            ));
        }
        if !(self.interpolation_rate.is_finite() && self.interpolation_rate > 0.0) {
            return Err(ConfigError::Invalid("interpolation_rate must be positive".into()));
        }
        if self.encryption {
            self.key_material()?;
        }
        Ok(())
    }

    /// Interval between snapshot ticks.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.tick_rate.max(1) as u64)
    }

    /// Delay between client connection attempts.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Handshake / welcome timeout.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Resolve the AES key and IV.
    ///
    /// Explicit hex values win; otherwise both are derived from the
    /// passphrase with domain-separated SHA-256.
    pub fn key_material(&self) -> Result<([u8; 16], [u8; 16]), ConfigError> {
        let key = match &self.encryption_key_hex {
            Some(h) => decode_block(h, "encryption key")?,
            None => derive_block(b"syncore-key:", &self.encryption_passphrase),
        };
        let iv = match &self.encryption_iv_hex {
            Some(h) => decode_block(h, "encryption iv")?,
            None => derive_block(b"syncore-iv:", &self.encryption_passphrase),
        };
        Ok((key, iv))
    }
}

fn derive_block(label: &[u8], passphrase: &str) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(label);
    hasher.update(passphrase.as_bytes());
    let hash = hasher.finalize();

    let mut block = [0u8; 16];
    block.copy_from_slice(&hash[..16]);
    block
}

fn decode_block(text: &str, what: &str) -> Result<[u8; 16], ConfigError> {
    let bytes = hex::decode(text.trim())
        .map_err(|e| ConfigError::Invalid(format!("{what} is not valid hex: {e}")))?;
    if bytes.len() != 16 {
        return Err(ConfigError::Invalid(format!(
            "{what} must be 16 bytes, got {}",
            bytes.len()
        )));
    }
    let mut block = [0u8; 16];
    block.copy_from_slice(&bytes);
    Ok(block)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{name}: cannot parse {v:?}"))),
        Err(_) => Ok(None),
    }
}

fn env_flag(name: &str) -> Result<Option<bool>, ConfigError> {
    match std::env::var(name) {
        Ok(v) => parse_flag(name, &v).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid(format!("{name}: expected a boolean, got {value:?}"))),
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Could not read the configuration file.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration file is not valid JSON.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}
