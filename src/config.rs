use crate::defaults;
use crate::error::{CoachError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub channel: ChannelSettings,
    pub audio: AudioConfig,
    pub voice: VoiceConfig,
}

/// Remote endpoints and credentials
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub api_url: String,
    pub ws_url: String,
    pub token: Option<String>,
    pub request_timeout_ms: u64,
}

/// Realtime channel tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelSettings {
    pub handshake_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub max_reconnect_attempts: u32,
}

/// Audio capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub input_device: Option<String>,
    pub sample_rate: u32,
}

/// Speech synthesis defaults, used when a scenario has no voice profile
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VoiceConfig {
    pub voice_name: Option<String>,
    pub emotional_style: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_url: defaults::API_URL.to_string(),
            ws_url: defaults::WS_URL.to_string(),
            token: None,
            request_timeout_ms: defaults::REQUEST_TIMEOUT_MS,
        }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: defaults::HANDSHAKE_TIMEOUT_MS,
            reconnect_base_delay_ms: defaults::RECONNECT_BASE_DELAY_MS,
            max_reconnect_attempts: defaults::MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            sample_rate: defaults::SAMPLE_RATE,
        }
    }
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            voice_name: None,
            emotional_style: defaults::EMOTIONAL_STYLE.to_string(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl ChannelSettings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only a missing file falls back to defaults; invalid TOML is an error.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e)
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound) =>
            {
                Ok(Self::default())
            }
            Err(e) => Err(e.context(format!("Failed to load config from {}", path.display()))),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - COACHSH_API_URL → server.api_url
    /// - COACHSH_WS_URL → server.ws_url
    /// - COACHSH_TOKEN → server.token
    /// - COACHSH_AUDIO_DEVICE → audio.input_device
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("COACHSH_API_URL")
            && !url.is_empty()
        {
            self.server.api_url = url;
        }

        if let Ok(url) = std::env::var("COACHSH_WS_URL")
            && !url.is_empty()
        {
            self.server.ws_url = url;
        }

        if let Ok(token) = std::env::var("COACHSH_TOKEN")
            && !token.is_empty()
        {
            self.server.token = Some(token);
        }

        if let Ok(device) = std::env::var("COACHSH_AUDIO_DEVICE")
            && !device.is_empty()
        {
            self.audio.input_device = Some(device);
        }

        self
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        let zero_checks = [
            ("server.request_timeout_ms", self.server.request_timeout_ms),
            ("channel.handshake_timeout_ms", self.channel.handshake_timeout_ms),
            ("audio.sample_rate", u64::from(self.audio.sample_rate)),
        ];
        for (key, value) in zero_checks {
            if value == 0 {
                return Err(CoachError::ConfigInvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }

        for (key, url, schemes) in [
            ("server.api_url", &self.server.api_url, ["http://", "https://"]),
            ("server.ws_url", &self.server.ws_url, ["ws://", "wss://"]),
        ] {
            if !schemes.iter().any(|scheme| url.starts_with(scheme)) {
                return Err(CoachError::ConfigInvalidValue {
                    key: key.to_string(),
                    message: format!("expected a {} or {} URL, got '{url}'", schemes[0], schemes[1]),
                });
            }
        }

        Ok(())
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/coachsh/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("coachsh")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Mutex to serialize tests that modify environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // SAFETY: These helpers are only used in tests with ENV_LOCK held,
    // ensuring no concurrent access to environment variables.
    fn set_env(key: &str, value: &str) {
        unsafe { std::env::set_var(key, value) }
    }

    fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) }
    }

    fn clear_coachsh_env() {
        remove_env("COACHSH_API_URL");
        remove_env("COACHSH_WS_URL");
        remove_env("COACHSH_TOKEN");
        remove_env("COACHSH_AUDIO_DEVICE");
    }

    #[test]
    fn test_default_config_has_correct_values() {
        let config = Config::default();

        assert_eq!(config.server.api_url, "http://localhost:8000/api/v1");
        assert_eq!(config.server.ws_url, "ws://localhost:8000");
        assert_eq!(config.server.token, None);
        assert_eq!(config.server.request_timeout_ms, 30_000);

        assert_eq!(config.channel.handshake_timeout_ms, 10_000);
        assert_eq!(config.channel.reconnect_base_delay_ms, 1_000);
        assert_eq!(config.channel.max_reconnect_attempts, 5);

        assert_eq!(config.audio.input_device, None);
        assert_eq!(config.audio.sample_rate, 16000);

        assert_eq!(config.voice.voice_name, None);
        assert_eq!(config.voice.emotional_style, "neutral");
    }

    #[test]
    fn test_load_from_toml_file() {
        let toml_content = r#"
            [server]
            api_url = "https://coach.example.org/api/v1"
            ws_url = "wss://coach.example.org"
            token = "abc123"

            [channel]
            handshake_timeout_ms = 2500
            max_reconnect_attempts = 3

            [audio]
            input_device = "pipewire"

            [voice]
            voice_name = "en-GB-RyanNeural"
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.server.api_url, "https://coach.example.org/api/v1");
        assert_eq!(config.server.ws_url, "wss://coach.example.org");
        assert_eq!(config.server.token.as_deref(), Some("abc123"));
        assert_eq!(config.channel.handshake_timeout(), Duration::from_millis(2500));
        assert_eq!(config.channel.max_reconnect_attempts, 3);
        // Unset keys in a present section keep their defaults
        assert_eq!(config.channel.reconnect_base_delay_ms, 1_000);
        assert_eq!(config.audio.input_device.as_deref(), Some("pipewire"));
        assert_eq!(config.voice.voice_name.as_deref(), Some("en-GB-RyanNeural"));
        assert_eq!(config.voice.emotional_style, "neutral");
    }

    #[test]
    fn test_env_override_all() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_coachsh_env();

        set_env("COACHSH_API_URL", "http://10.0.0.2:8000/api/v1");
        set_env("COACHSH_WS_URL", "ws://10.0.0.2:8000");
        set_env("COACHSH_TOKEN", "secret");
        set_env("COACHSH_AUDIO_DEVICE", "hw:1,0");

        let config = Config::default().with_env_overrides();

        assert_eq!(config.server.api_url, "http://10.0.0.2:8000/api/v1");
        assert_eq!(config.server.ws_url, "ws://10.0.0.2:8000");
        assert_eq!(config.server.token.as_deref(), Some("secret"));
        assert_eq!(config.audio.input_device.as_deref(), Some("hw:1,0"));

        clear_coachsh_env();
    }

    #[test]
    fn test_env_override_empty_string_ignored() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_coachsh_env();

        set_env("COACHSH_TOKEN", "");
        let config = Config::default().with_env_overrides();
        assert_eq!(config.server.token, None);

        clear_coachsh_env();
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(b"[server\napi_url = \"broken")
            .unwrap();

        assert!(Config::load(temp_file.path()).is_err());
        assert!(Config::load_or_default(temp_file.path()).is_err());
    }

    #[test]
    fn test_load_or_default_returns_default_for_missing_file() {
        let missing_path = Path::new("/tmp/nonexistent_coachsh_config_12345.toml");
        let config = Config::load_or_default(missing_path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_handshake_timeout() {
        let mut config = Config::default();
        config.channel.handshake_timeout_ms = 0;

        match config.validate() {
            Err(CoachError::ConfigInvalidValue { key, .. }) => {
                assert_eq!(key, "channel.handshake_timeout_ms");
            }
            other => panic!("Expected ConfigInvalidValue, got: {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_wrong_ws_scheme() {
        let mut config = Config::default();
        config.server.ws_url = "http://localhost:8000".to_string();

        match config.validate() {
            Err(CoachError::ConfigInvalidValue { key, message }) => {
                assert_eq!(key, "server.ws_url");
                assert!(message.contains("ws://"));
            }
            other => panic!("Expected ConfigInvalidValue, got: {:?}", other),
        }
    }

    #[test]
    fn test_default_path_ends_with_config_toml() {
        let path = Config::default_path();
        let path_str = path.to_string_lossy();
        assert!(path_str.contains("coachsh"));
        assert!(path_str.ends_with("config.toml"));
    }
}
