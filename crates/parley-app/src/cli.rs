//! CLI argument definitions for the Parley service.
//!
//! Uses `clap` with derive macros for ergonomic argument parsing.
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::Parser;
use std::path::PathBuf;

use parley_core::ParleyConfig;

/// Parley - HTTP front end for a conversational agent.
#[derive(Parser, Debug)]
#[command(name = "parley", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// API server port.
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Address to bind, e.g. 0.0.0.0.
    #[arg(long = "host")]
    pub host: Option<String>,

    /// Bearer secret required on protected endpoints.
    #[arg(long = "auth-secret")]
    pub auth_secret: Option<String>,

    /// Log level or filter directive (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,

    /// SQLite file for persisted log records.
    #[arg(long = "log-db")]
    pub log_db: Option<PathBuf>,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > PARLEY_CONFIG env var > ~/.parley/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Some(p) = env_var("PARLEY_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the API server port.
    ///
    /// Priority: --port flag > PARLEY_PORT env var > config file value.
    pub fn resolve_port(&self, config_port: u16, env: impl Fn(&str) -> Option<String>) -> u16 {
        if let Some(p) = self.port {
            return p;
        }
        env("PARLEY_PORT")
            .and_then(|val| val.parse::<u16>().ok())
            .unwrap_or(config_port)
    }

    /// Resolve the bearer secret.
    ///
    /// Priority: --auth-secret flag > PARLEY_AUTH_SECRET env var > config file value.
    /// An empty value disables authentication.
    pub fn resolve_auth_secret(
        &self,
        config_secret: Option<String>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Option<String> {
        self.auth_secret
            .clone()
            .or_else(|| env("PARLEY_AUTH_SECRET"))
            .or(config_secret)
            .filter(|s| !s.is_empty())
    }

    /// Resolve the log level.
    ///
    /// Priority: --log-level flag > PARLEY_LOG_LEVEL env var.
    /// Returns `None` if not overridden.
    pub fn resolve_log_level(&self, env: impl Fn(&str) -> Option<String>) -> Option<String> {
        self.log_level.clone().or_else(|| env("PARLEY_LOG_LEVEL"))
    }

    /// Fold every override from the flags and the process environment into
    /// a loaded configuration.
    pub fn apply(&self, config: &mut ParleyConfig) {
        self.apply_with(config, env_var);
    }

    /// Like [`CliArgs::apply`], reading environment overrides through `env`.
    pub fn apply_with(&self, config: &mut ParleyConfig, env: impl Fn(&str) -> Option<String>) {
        config.server.port = self.resolve_port(config.server.port, &env);
        if let Some(ref host) = self.host {
            config.server.host = host.clone();
        }
        config.auth.secret = self.resolve_auth_secret(config.auth.secret.take(), &env);
        if let Some(level) = self.resolve_log_level(&env) {
            config.logging.level = level;
        }
        if let Some(ref db) = self.log_db {
            config.logging.db_path = db.to_string_lossy().to_string();
        }
    }
}

pub fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".parley").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".parley").join("config.toml");
    }
    PathBuf::from("config.toml")
}
