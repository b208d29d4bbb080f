//! # Configuration Management
//!
//! Loads the service configuration from several layered sources:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml` next to the binary
//! - `APP_`-prefixed environment variables (`APP_SERVER__PORT=9000`)
//! - Plain environment keys used by deployment scripts (`API_TOKEN`, `MODEL_PATH`, ...)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Plain keys (`HOST`, `PORT`, `API_TOKEN`, `MODEL_PATH`, `MODEL_DEVICE`,
//!    `MODEL_PRECISION`, `MODEL_LANGUAGE`, `LOG_LEVEL`)
//! 2. `APP_` environment variables
//! 3. Configuration file (config.toml)
//! 4. Default values
//!
//! ## Deferred model settings:
//! The server section and the API token are read once at startup. The model
//! section is read again through [`ModelSettings::resolve`] at the moment a
//! model load begins, so the process can answer health checks before it
//! commits to a slow load.

use crate::device::{DevicePreference, Precision};
use crate::transcription::{DecodeOptions, ModelSettings};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;

/// Default model identifier: a Hugging Face repo id or a local directory.
pub const DEFAULT_MODEL_PATH: &str = "islomov/navaistt_v1_medium";

/// Plain environment keys and the config paths they override.
const PLAIN_OVERRIDES: &[(&str, &str)] = &[
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("API_TOKEN", "auth.api_token"),
    ("MODEL_PATH", "model.path"),
    ("MODEL_DEVICE", "model.device"),
    ("MODEL_PRECISION", "model.precision"),
    ("MODEL_LANGUAGE", "model.language"),
    ("LOG_LEVEL", "logging.level"),
];

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each section is consumed by a different part of the service: the HTTP
/// server, the auth gate, the model loader and the logging setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub model: ModelConfig,
    pub logging: LoggingConfig,
}

/// Server-specific configuration settings.
///
/// ## Fields:
/// - `host`: IP address to bind to ("0.0.0.0" inside containers)
/// - `port`: TCP port number to listen on
/// - `max_upload_mb`: largest multipart upload accepted, in megabytes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_upload_mb: usize,
}

/// Shared-secret authentication.
///
/// An empty `api_token` disables the auth gate entirely. That is an insecure
/// default and is logged as a warning at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub api_token: String,
}

/// Speech model settings.
///
/// ## Fields:
/// - `path`: local model directory or Hugging Face repo id
/// - `device`: "auto", "cpu", "cuda" or "metal"
/// - `precision`: "f32", "f16" or "bf16"
/// - `language`: language hint passed to the decoder for every request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub path: String,
    pub device: String,
    pub precision: String,
    pub language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive such as "info" or "stt_service=debug".
    pub level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
                max_upload_mb: 50,
            },
            auth: AuthConfig {
                api_token: String::new(),
            },
            model: ModelConfig {
                path: DEFAULT_MODEL_PATH.to_string(),
                device: "auto".to_string(),
                precision: "f32".to_string(),
                language: "uz".to_string(),
            },
            logging: LoggingConfig {
                level: "stt_service=info,actix_web=info".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from the process environment and `config.toml`.
    pub fn load() -> Result<Self> {
        Self::load_from(env::vars().collect())
    }

    /// Load configuration from an explicit set of environment variables.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: nested key through the `APP_` prefix
    /// - `API_TOKEN=secret`: plain key, wins over everything else
    /// - `MODEL_PATH=/models/whisper-medium`: load from a local directory
    pub fn load_from(vars: HashMap<String, String>) -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .source(Some(vars.clone().into_iter().collect())),
            );

        for (key, path) in PLAIN_OVERRIDES {
            if let Some(value) = vars.get(*key) {
                settings = settings.set_override(*path, value.as_str())?;
            }
        }

        let config = settings
            .build()?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Upload limit is at least one megabyte
    /// - Model path is present
    /// - Device and precision strings parse
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.max_upload_mb == 0 {
            return Err(anyhow::anyhow!("Upload limit must be greater than 0"));
        }

        self.model.settings()?;
        Ok(())
    }

    /// Whether the shared-secret gate is active.
    pub fn auth_enabled(&self) -> bool {
        !self.auth.api_token.is_empty()
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.server.max_upload_mb * 1024 * 1024
    }
}

impl ModelConfig {
    /// Parse the model section into the settings handed to a loader.
    pub fn settings(&self) -> Result<ModelSettings> {
        if self.path.trim().is_empty() {
            return Err(anyhow::anyhow!("Model path cannot be empty"));
        }

        let device: DevicePreference = self
            .device
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        let precision: Precision = self
            .precision
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;

        Ok(ModelSettings {
            path: self.path.trim().to_string(),
            device,
            precision,
        })
    }

    /// Decoding options applied to every request.
    pub fn decode_options(&self) -> DecodeOptions {
        let language = self.language.trim();
        DecodeOptions {
            language: (!language.is_empty()).then(|| language.to_string()),
            ..DecodeOptions::default()
        }
    }
}

impl ModelSettings {
    /// Resolve the model settings from the environment as it is right now.
    ///
    /// Called by the lifecycle manager when a load attempt starts, never at
    /// process start.
    pub fn resolve() -> Result<Self> {
        AppConfig::load()?.model.settings()
    }
}
