//! Server configuration.
//!
//! Loads `bridge-core`'s typed [`Config`] from an optional YAML file, then
//! applies environment variable overrides for the settings operators most
//! often need to vary per-deployment without editing the file (the speech
//! service endpoint/credentials and the bind port).

use std::path::Path;

use anyhow::{Context, Result};
use bridge_core::Config;

/// Environment variable overrides recognized by the server binary, applied
/// after the YAML file (if any) and before CLI flags.
const ENV_SPEECH_SERVICE_ENDPOINT: &str = "BRIDGE_SPEECH_SERVICE_ENDPOINT";
const ENV_SPEECH_SERVICE_API_KEY: &str = "BRIDGE_SPEECH_SERVICE_API_KEY";
const ENV_SPEECH_SERVICE_VOICE: &str = "BRIDGE_SPEECH_SERVICE_VOICE";
const ENV_BIND_PORT: &str = "BRIDGE_BIND_PORT";
const ENV_MEDIA_OUT_FORMAT: &str = "BRIDGE_MEDIA_OUT_FORMAT";

/// Loads configuration from a YAML file (if given), then applies
/// environment variable overrides.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let mut config: Config = if let Some(path) = path {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Applies environment variable overrides to `config` in place.
fn apply_env_overrides(config: &mut Config) -> Result<()> {
    if let Ok(val) = std::env::var(ENV_SPEECH_SERVICE_ENDPOINT) {
        config.speech_service_endpoint = val;
    }
    if let Ok(val) = std::env::var(ENV_SPEECH_SERVICE_API_KEY) {
        config.speech_service_api_key = val;
    }
    if let Ok(val) = std::env::var(ENV_SPEECH_SERVICE_VOICE) {
        config.speech_service_voice = val;
    }
    if let Ok(val) = std::env::var(ENV_BIND_PORT) {
        config.preferred_port = val
            .parse()
            .with_context(|| format!("{ENV_BIND_PORT} must be a u16, got '{val}'"))?;
    }
    if let Ok(val) = std::env::var(ENV_MEDIA_OUT_FORMAT) {
        config.media_out_format = val
            .parse()
            .map_err(|e: bridge_core::BridgeError| anyhow::anyhow!(e.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_a_config_file() {
        let config = load(None).unwrap();
        assert_eq!(config.preferred_port, 0);
        assert!(config.speech_service_endpoint.is_empty());
    }

    #[test]
    fn env_override_sets_speech_service_endpoint() {
        std::env::set_var(ENV_SPEECH_SERVICE_ENDPOINT, "wss://example.invalid/voice-live");
        let config = load(None).unwrap();
        std::env::remove_var(ENV_SPEECH_SERVICE_ENDPOINT);
        assert_eq!(config.speech_service_endpoint, "wss://example.invalid/voice-live");
    }
}
