use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::{IdentityEndpoints, RefreshPolicy};

/// Film Bridge - privileged request bridge for the film extension
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Server host address
    #[arg(short = 'H', long, env = "BRIDGE_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Server port
    #[arg(short, long, env = "BRIDGE_PORT", default_value = "8787")]
    pub port: u16,

    /// API key page-context clients must present
    #[arg(short = 'k', long, env = "BRIDGE_API_KEY")]
    pub api_key: Option<String>,

    /// Path to the credential SQLite database
    #[arg(short = 'd', long, env = "CREDENTIAL_DB_FILE")]
    pub db_file: Option<String>,

    /// Identity provider API key
    #[arg(long, env = "IDENTITY_API_KEY")]
    pub identity_api_key: Option<String>,

    /// Identity provider token endpoint
    #[arg(
        long,
        env = "IDENTITY_TOKEN_URL",
        default_value = "https://securetoken.googleapis.com/v1/token"
    )]
    pub identity_token_url: String,

    /// Identity provider account lookup endpoint
    #[arg(
        long,
        env = "IDENTITY_LOOKUP_URL",
        default_value = "https://identitytoolkit.googleapis.com/v1/accounts:lookup"
    )]
    pub identity_lookup_url: String,

    /// Refresh token used to sign in when no identity is stored
    #[arg(long, env = "IDENTITY_REFRESH_TOKEN", hide_env_values = true)]
    pub refresh_token: Option<String>,

    /// Base URL of the document store's documents tree
    #[arg(short = 's', long, env = "DOCUMENT_STORE_URL")]
    pub store_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Seconds a full validation stays trusted
    #[arg(long, env = "VALIDATION_WINDOW_SECS", default_value = "86400")]
    pub validation_window: u64,

    /// Seconds before the window ends at which renewal is scheduled
    #[arg(long, env = "REFRESH_THRESHOLD_SECS", default_value = "7200")]
    pub refresh_threshold: u64,

    /// Default bridge call timeout in milliseconds
    #[arg(long, env = "BRIDGE_TIMEOUT_MS", default_value = "30000")]
    pub bridge_timeout: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// HTTP max retries
    #[arg(long, env = "HTTP_MAX_RETRIES", default_value = "3")]
    pub http_retries: u32,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Server settings
    pub server_host: String,
    pub server_port: u16,

    // Authentication
    pub bridge_api_key: String,

    // Credential lifecycle
    pub credential_db_file: PathBuf,
    pub validation_window_secs: u64,
    pub refresh_threshold_secs: u64,

    // Identity provider
    pub identity_api_key: String,
    pub identity_token_url: String,
    pub identity_lookup_url: String,
    pub refresh_token: Option<String>,

    // Document store
    pub document_store_url: String,

    // Bridge
    pub bridge_timeout_ms: u64,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub http_max_retries: u32,

    pub log_level: String,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(args: CliArgs) -> Result<Self> {
        let config = Config {
            server_host: args.host,
            server_port: args.port,

            bridge_api_key: args
                .api_key
                .context("BRIDGE_API_KEY is required (use -k or set BRIDGE_API_KEY env var)")?,

            credential_db_file: args
                .db_file
                .map(|s| expand_tilde(&s))
                .or_else(default_db_file)
                .context("CREDENTIAL_DB_FILE is required (use -d or set CREDENTIAL_DB_FILE env var)")?,
            validation_window_secs: args.validation_window,
            refresh_threshold_secs: args.refresh_threshold,

            identity_api_key: args
                .identity_api_key
                .context("IDENTITY_API_KEY is required")?,
            identity_token_url: args.identity_token_url,
            identity_lookup_url: args.identity_lookup_url,
            refresh_token: args.refresh_token.filter(|t| !t.trim().is_empty()),

            document_store_url: args
                .store_url
                .context("DOCUMENT_STORE_URL is required (use -s or set DOCUMENT_STORE_URL env var)")?,

            bridge_timeout_ms: args.bridge_timeout,

            http_max_connections: env_or("HTTP_MAX_CONNECTIONS", 20),
            http_connect_timeout: env_or("HTTP_CONNECT_TIMEOUT", 10),
            http_request_timeout: args.http_timeout,
            http_max_retries: args.http_retries,

            log_level: args.log_level,
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.bridge_api_key.trim().is_empty() {
            anyhow::bail!("BRIDGE_API_KEY cannot be empty");
        }

        if self.refresh_threshold_secs >= self.validation_window_secs {
            anyhow::bail!(
                "REFRESH_THRESHOLD_SECS ({}) must be smaller than VALIDATION_WINDOW_SECS ({})",
                self.refresh_threshold_secs,
                self.validation_window_secs
            );
        }

        if !self.document_store_url.starts_with("http://")
            && !self.document_store_url.starts_with("https://")
        {
            anyhow::bail!(
                "DOCUMENT_STORE_URL must be an http(s) URL: {}",
                self.document_store_url
            );
        }

        if self.bridge_timeout_ms == 0 {
            anyhow::bail!("BRIDGE_TIMEOUT_MS must be positive");
        }

        self.refresh_policy()?;

        Ok(())
    }

    pub fn refresh_policy(&self) -> Result<RefreshPolicy> {
        RefreshPolicy::new(
            seconds("VALIDATION_WINDOW_SECS", self.validation_window_secs)?,
            seconds("REFRESH_THRESHOLD_SECS", self.refresh_threshold_secs)?,
        )
    }

    pub fn identity_endpoints(&self) -> IdentityEndpoints {
        IdentityEndpoints {
            token_url: self.identity_token_url.clone(),
            lookup_url: self.identity_lookup_url.clone(),
            api_key: self.identity_api_key.clone(),
        }
    }

    /// Reply budget remote clients should give each bridge call
    pub fn bridge_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge_timeout_ms)
    }
}

fn seconds(name: &str, secs: u64) -> Result<chrono::Duration> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .with_context(|| format!("{} is out of range: {}", name, secs))
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// `<data dir>/film-bridge/credentials.sqlite3`
fn default_db_file() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("film-bridge").join("credentials.sqlite3"))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
