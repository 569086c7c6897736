//! Configuration module for the engine server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Tokens are advertised to clients as an `int32`; one permit is kept
/// spare for the response channel.
const MAX_TOKENS: usize = if (i32::MAX as usize) < Semaphore::MAX_PERMITS {
    i32::MAX as usize
} else {
    Semaphore::MAX_PERMITS - 1
};

/// Which engine handles incoming frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Echo the first image payload back unchanged
    #[default]
    Roundtrip,
    /// Rotate the image 270 degrees and re-encode as JPEG
    Rotate,
    /// Rotate, dump the result to disk, then fault
    Crash,
}

/// Command-line arguments for the engine server
#[derive(Parser, Debug, Default)]
#[command(name = "gabriel-roundtrip")]
#[command(author = "gabriel-roundtrip authors")]
#[command(version = "0.1.0")]
#[command(about = "A Gabriel cognitive engine server for camera frames", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:9099)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Engine variant to run
    #[arg(short = 'e', long, value_enum)]
    pub engine: Option<EngineKind>,

    /// Source name clients must send frames for
    #[arg(short = 's', long)]
    pub source: Option<String>,

    /// Per-frame engine timeout in seconds
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,

    /// Number of frames processed concurrently across all connections
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Number of in-flight frames allowed per connection
    #[arg(long)]
    pub tokens: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Concurrent engine invocations
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// In-flight frames per connection
    #[serde(default = "default_tokens")]
    pub tokens: usize,
    /// Per-frame timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Largest accepted message in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: default_workers(),
            tokens: default_tokens(),
            timeout: default_timeout(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// Engine-related configuration
#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub kind: EngineKind,
    /// Source name served by this engine
    #[serde(default = "default_source")]
    pub source: String,
    /// JPEG quality (1-100) for re-encoded images
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Where the crash engine writes its rotated image
    #[serde(default = "default_dump_path")]
    pub dump_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::default(),
            source: default_source(),
            jpeg_quality: default_jpeg_quality(),
            dump_path: default_dump_path(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:9099".to_string()
}

fn default_workers() -> usize {
    2
}

fn default_tokens() -> usize {
    2
}

fn default_timeout() -> u64 {
    60
}

fn default_max_frame_size() -> usize {
    16 * 1024 * 1024 // 16 MB
}

fn default_source() -> String {
    "roundtrip".to_string()
}

fn default_jpeg_quality() -> u8 {
    95
}

fn default_dump_path() -> PathBuf {
    PathBuf::from("rotated.jpg")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub engine: EngineKind,
    pub source: String,
    pub timeout: Duration,
    pub workers: usize,
    pub tokens: usize,
    pub max_frame_size: usize,
    pub jpeg_quality: u8,
    pub dump_path: PathBuf,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence).
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            engine: cli.engine.unwrap_or(toml_config.engine.kind),
            source: cli.source.unwrap_or(toml_config.engine.source),
            // A zero timeout would drop every frame.
            timeout: Duration::from_secs(cli.timeout.unwrap_or(toml_config.server.timeout).max(1)),
            // Zero would deadlock every frame on its semaphore.
            workers: cli
                .workers
                .unwrap_or(toml_config.server.workers)
                .clamp(1, Semaphore::MAX_PERMITS),
            tokens: cli
                .tokens
                .unwrap_or(toml_config.server.tokens)
                .clamp(1, MAX_TOKENS),
            max_frame_size: toml_config.server.max_frame_size,
            jpeg_quality: toml_config.engine.jpeg_quality.clamp(1, 100),
            dump_path: toml_config.engine.dump_path,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
}
