//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (`voice-server.toml`, optional)
//! - Environment variables (with `APP_` prefix, `__` between sections)
//! - Command-line flags (highest priority)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Command-line flags (`-p`, `-c`, `-m`, `--https`, ...)
//! 2. Environment variables (`APP_SERVER__HOST`, `APP_TLS__KEY_DIR`, ...)
//! 3. Configuration file (`voice-server.toml`)
//! 4. Default values (defined in the Default impl)
//!
//! The model's own hyper-parameter JSON (the `-c` flag) is not part of this
//! configuration; see `conversion::hparams`.

use crate::cli::Cli;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub tls: TlsConfig,
    pub channel: ChannelConfig,
    pub static_files: StaticFilesConfig,
    pub diagnostics: DiagnosticsConfig,
}

/// Listener settings.
///
/// ## Fields:
/// - `host`: address to bind, `0.0.0.0` accepts connections from any interface
/// - `port`: TCP port for both the event channel and the static files
/// - `workers`: actix worker threads; one matches a single event loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

/// Where the pretrained model lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Hyper-parameter JSON shipped with the checkpoint
    pub config_path: PathBuf,
    /// Serialized model parameters / exported graph
    pub checkpoint_path: PathBuf,
}

/// HTTPS settings.
///
/// When `enabled` and `self_signed` are both set, a key/certificate pair is
/// generated under `key_dir` and `key_path`/`cert_path` are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub enabled: bool,
    pub self_signed: bool,
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_dir: PathBuf,
}

/// Event channel (Engine.IO / Socket.IO) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Socket.IO namespace serving conversions
    pub namespace: String,
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
    /// Largest websocket frame accepted, in bytes
    pub max_payload: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticFilesConfig {
    pub dir: PathBuf,
    pub index_file: String,
}

/// Debug hooks. Everything here is off by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    /// Write each decoded request to `dump_path` before inference
    pub dump_input: bool,
    pub dump_path: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 18888,
                workers: 1,
            },
            model: ModelConfig {
                config_path: PathBuf::new(),
                checkpoint_path: PathBuf::new(),
            },
            tls: TlsConfig {
                enabled: false,
                self_signed: true,
                key_path: PathBuf::from("ssl.key"),
                cert_path: PathBuf::from("ssl.cert"),
                key_dir: PathBuf::from("./key"),
            },
            channel: ChannelConfig {
                namespace: "/test".to_string(),
                ping_interval_ms: 25_000,
                ping_timeout_ms: 20_000,
                // A few seconds of 24 kHz PCM16 fit comfortably
                max_payload: 16 * 1024 * 1024,
            },
            static_files: StaticFilesConfig {
                dir: PathBuf::from("../frontend/dist"),
                index_file: "index.html".to_string(),
            },
            diagnostics: DiagnosticsConfig {
                dump_input: false,
                dump_path: PathBuf::from("logs/received_data.wav"),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `voice-server.toml` and environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=127.0.0.1`: Override server host
    /// - `APP_CHANNEL__PING_INTERVAL_MS=10000`: Override heartbeat interval
    /// - `APP_DIAGNOSTICS__DUMP_INPUT=true`: Enable the WAV dump
    /// - `HOST` / `PORT`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("voice-server").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Layer command-line flags on top of the loaded configuration.
    ///
    /// Flags that were not given leave the configured value alone, except
    /// the three required ones (port, model config, checkpoint).
    pub fn apply_cli(&mut self, cli: &Cli) {
        self.server.port = cli.port;
        self.model.config_path = cli.model_config.clone();
        self.model.checkpoint_path = cli.checkpoint.clone();

        if let Some(host) = &cli.host {
            self.server.host = host.clone();
        }
        if let Some(https) = cli.https {
            self.tls.enabled = https;
        }
        if let Some(self_signed) = cli.https_self_signed {
            self.tls.self_signed = self_signed;
        }
        if let Some(key) = &cli.https_key {
            self.tls.key_path = key.clone();
        }
        if let Some(cert) = &cli.https_cert {
            self.tls.cert_path = cert.clone();
        }
        if let Some(dir) = &cli.static_dir {
            self.static_files.dir = dir.clone();
        }
        if cli.dump_input {
            self.diagnostics.dump_input = true;
        }
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.workers == 0 {
            return Err(anyhow::anyhow!("Worker count must be greater than 0"));
        }

        if self.model.config_path.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("Model configuration path is required"));
        }

        if self.model.checkpoint_path.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("Model checkpoint path is required"));
        }

        if self.tls.enabled && !self.tls.self_signed {
            if self.tls.key_path.as_os_str().is_empty() || self.tls.cert_path.as_os_str().is_empty()
            {
                return Err(anyhow::anyhow!(
                    "HTTPS without self-signing needs both a key and a certificate path"
                ));
            }
        }

        if !self.channel.namespace.starts_with('/') {
            return Err(anyhow::anyhow!(
                "Channel namespace must start with '/': {}",
                self.channel.namespace
            ));
        }

        if self.channel.ping_interval_ms == 0 || self.channel.ping_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Ping interval and timeout must be greater than 0"));
        }

        if self.channel.max_payload == 0 {
            return Err(anyhow::anyhow!("Max payload must be greater than 0"));
        }

        Ok(())
    }

    /// `host:port` string handed to the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        let mut full = vec!["vcs"];
        full.extend_from_slice(args);
        Cli::try_parse_from(full).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.channel.namespace, "/test");
        assert!(!config.tls.enabled);
        assert!(config.tls.self_signed);
        assert!(!config.diagnostics.dump_input);
        // Model paths only come from the command line
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = AppConfig::default();
        config.apply_cli(&cli(&[
            "-p",
            "9090",
            "-c",
            "cfg.json",
            "-m",
            "G.onnx",
            "--https",
            "true",
            "--httpsSelfSigned",
            "false",
            "--httpsKey",
            "my.key",
            "--dump-input",
        ]));

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.model.config_path, PathBuf::from("cfg.json"));
        assert!(config.tls.enabled);
        assert!(!config.tls.self_signed);
        assert_eq!(config.tls.key_path, PathBuf::from("my.key"));
        // Not given on the command line, keeps the default
        assert_eq!(config.tls.cert_path, PathBuf::from("ssl.cert"));
        assert!(config.diagnostics.dump_input);
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_addr(), "0.0.0.0:9090");
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.apply_cli(&cli(&["-p", "1", "-c", "c", "-m", "m"]));
        assert!(config.validate().is_ok());

        config.server.port = 0;
        assert!(config.validate().is_err());
        config.server.port = 1;

        config.channel.namespace = "test".to_string();
        assert!(config.validate().is_err());
        config.channel.namespace = "/test".to_string();

        config.tls.enabled = true;
        config.tls.self_signed = false;
        config.tls.cert_path = PathBuf::new();
        assert!(config.validate().is_err());
    }
}
