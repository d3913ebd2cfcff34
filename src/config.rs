use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::{Input, Password};
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::{Credentials, NetworkErrorPolicy, SessionPolicy, StoreLifetimes};

/// Catalog session keeper
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the WordPress catalog site
    #[arg(short = 'u', long, env = "CATALOG_API_URL")]
    pub base_url: Option<String>,

    /// Account username
    #[arg(long, env = "CATALOG_USERNAME")]
    pub username: Option<String>,

    /// Account password (prompted when missing)
    #[arg(long, env = "CATALOG_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Keep credentials for the long lifetime window
    #[arg(long, env = "REMEMBER_ME", default_value = "false")]
    pub remember_me: bool,

    /// Path to the SQLite session store
    #[arg(short = 's', long, env = "SESSION_STORE_FILE")]
    pub store_file: Option<String>,

    /// Seconds before expiry to renew the access token
    #[arg(long, env = "TOKEN_REFRESH_MARGIN", default_value = "60")]
    pub refresh_margin: u64,

    /// Upper bound in seconds on one re-authentication exchange
    #[arg(long, env = "AUTH_EXCHANGE_TIMEOUT", default_value = "30")]
    pub exchange_timeout: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "20")]
    pub http_timeout: u64,

    /// Network errors during token validation (lenient, timeouts-only, strict)
    #[arg(long, env = "NETWORK_ERROR_POLICY", default_value = "lenient")]
    pub network_error_policy: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Clear the stored session and exit
    #[arg(long)]
    pub logout: bool,

    /// Fetch this API path once through the authorized client
    #[arg(long)]
    pub fetch: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Catalog site
    pub base_url: String,

    // Login
    pub username: Option<String>,
    pub password: Option<String>,
    pub remember_me: bool,

    // Persistence
    pub store_file: PathBuf,
    pub session_lifetime: u64,
    pub remembered_lifetime: u64,

    // Session timing
    pub refresh_margin: u64,
    pub exchange_timeout: u64,
    pub min_wake_delay: u64,
    pub network_error_policy: NetworkErrorPolicy,

    // HTTP client
    pub http_request_timeout: u64,

    pub log_level: String,

    // One-shot actions
    pub logout: bool,
    pub fetch: Option<String>,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        Self::from_args(args)
    }

    /// Build configuration from parsed arguments plus env-only settings
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let config = Config {
            base_url: args
                .base_url
                .context("CATALOG_API_URL is required (use -u or set CATALOG_API_URL env var)")?,

            username: args.username,
            password: args.password,
            remember_me: args.remember_me,

            store_file: args
                .store_file
                .map(|s| expand_tilde(&s))
                .unwrap_or_else(default_store_file),

            session_lifetime: env_or("SESSION_LIFETIME", 24 * 60 * 60),
            remembered_lifetime: env_or("REMEMBERED_LIFETIME", 30 * 24 * 60 * 60),

            refresh_margin: args.refresh_margin,
            exchange_timeout: args.exchange_timeout,
            min_wake_delay: env_or("MIN_WAKE_DELAY", 5),
            network_error_policy: parse_network_error_policy(&args.network_error_policy),

            http_request_timeout: args.http_timeout,

            log_level: args.log_level,

            logout: args.logout,
            fetch: args.fetch,
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            anyhow::bail!(
                "CATALOG_API_URL must be an http(s) URL: {}",
                self.base_url
            );
        }

        if self.exchange_timeout == 0 {
            anyhow::bail!("AUTH_EXCHANGE_TIMEOUT must be greater than zero");
        }

        if self.remembered_lifetime < self.session_lifetime {
            anyhow::bail!("REMEMBERED_LIFETIME must not be shorter than SESSION_LIFETIME");
        }

        Ok(())
    }

    /// Timing and failure policy for the session manager
    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            refresh_margin: Duration::from_secs(self.refresh_margin),
            exchange_timeout: Duration::from_secs(self.exchange_timeout),
            min_wake_delay: Duration::from_secs(self.min_wake_delay),
            network_errors: self.network_error_policy,
        }
    }

    /// Persisted lifetime tiers for the credential store
    pub fn store_lifetimes(&self) -> StoreLifetimes {
        StoreLifetimes {
            session: Duration::from_secs(self.session_lifetime),
            remembered: Duration::from_secs(self.remembered_lifetime),
        }
    }

    /// Login credentials, prompting for whatever is missing
    pub fn credentials(&self) -> Result<Credentials> {
        let username = match self.username {
            Some(ref username) => username.clone(),
            None => Input::new()
                .with_prompt("Username")
                .interact_text()
                .context("Failed to read username")?,
        };

        let password = match self.password {
            Some(ref password) => password.clone(),
            None => Password::new()
                .with_prompt("Password")
                .interact()
                .context("Failed to read password")?,
        };

        if username.is_empty() || password.is_empty() {
            anyhow::bail!("Username and password cannot be empty");
        }

        Ok(Credentials::new(username, password))
    }
}

fn env_or(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Default session store location under the user's data directory
fn default_store_file() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("catalog-session")
        .join("session.sqlite3")
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

/// Parse network error policy from string
fn parse_network_error_policy(s: &str) -> NetworkErrorPolicy {
    match s.to_lowercase().as_str() {
        "timeouts-only" | "timeouts_only" => NetworkErrorPolicy::TimeoutsOnly,
        "strict" => NetworkErrorPolicy::Strict,
        _ => NetworkErrorPolicy::Lenient,
    }
}
