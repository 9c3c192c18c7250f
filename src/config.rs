use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Session Gate - authenticated API client with single-flight token refresh
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the API server
    #[arg(short = 'u', long, env = "SESSION_API_URL", default_value = "http://localhost:8000")]
    pub api_url: String,

    /// Base URL of the auth server (defaults to the API server)
    #[arg(long, env = "SESSION_AUTH_URL")]
    pub auth_url: Option<String>,

    /// Path to the SQLite file holding the persisted session
    #[arg(short = 'd', long, env = "SESSION_DB_FILE")]
    pub db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable lines
    Text,
    /// One JSON object per event
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Log in and persist the session
    Login {
        /// Account email (prompted when omitted)
        #[arg(short, long)]
        email: Option<String>,
    },
    /// Create an account; logs in if the server hands back tokens
    Register {
        #[arg(short, long)]
        email: Option<String>,
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Show the current session
    Status,
    /// Print a valid access token, refreshing it if needed
    Token,
    /// GET an API path with the session's credentials
    Get {
        /// Path relative to the API URL, e.g. /pipelines
        path: String,
    },
    /// End the session
    Logout,
}

/// Session lifecycle tuning used by `SessionManager`
#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    /// Renew the access token when less than this much time is left
    pub refresh_window: Duration,
    /// Consecutive transient refresh failures before the session is ended.
    /// `0` never escalates.
    pub max_soft_refresh_failures: u32,
    /// Delay before retrying after a transient refresh failure
    pub refresh_retry_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_window: Duration::from_secs(300),
            max_soft_refresh_failures: 3,
            refresh_retry_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    // Endpoints
    pub api_base_url: String,
    pub auth_base_url: String,

    // Persistence
    pub db_file: PathBuf,

    // HTTP client
    pub http_connect_timeout: Duration,
    pub http_request_timeout: Duration,

    // Session
    pub session: SessionConfig,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration with priority: CLI > ENV > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let command = args.command.clone();
        Ok((Self::from_args(args)?, command))
    }

    /// Build configuration from parsed arguments plus env-only settings
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let db_file = match args.db_file {
            Some(path) => expand_tilde(&path),
            None => default_db_file().context(
                "Cannot determine a data directory (use -d or set SESSION_DB_FILE)",
            )?,
        };

        let api_base_url = args.api_url.trim_end_matches('/').to_string();
        let auth_base_url = args
            .auth_url
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| api_base_url.clone());

        Ok(Config {
            api_base_url,
            auth_base_url,
            db_file,

            http_connect_timeout: Duration::from_secs(env_or("HTTP_CONNECT_TIMEOUT", 10)),
            http_request_timeout: Duration::from_secs(args.http_timeout),

            session: SessionConfig {
                refresh_window: Duration::from_secs(env_or("TOKEN_REFRESH_WINDOW", 300)),
                max_soft_refresh_failures: env_or("MAX_SOFT_REFRESH_FAILURES", 3),
                refresh_retry_delay: Duration::from_secs(env_or("REFRESH_RETRY_DELAY", 30)),
            },

            log_level: args.log_level,
            log_format: args.log_format,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for (name, url) in [
            ("SESSION_API_URL", &self.api_base_url),
            ("SESSION_AUTH_URL", &self.auth_base_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                anyhow::bail!("{} must be an http(s) URL: {}", name, url);
            }
        }

        if self.http_request_timeout.is_zero() {
            anyhow::bail!("HTTP_REQUEST_TIMEOUT must be greater than zero");
        }

        Ok(())
    }
}

/// Read a numeric env var, falling back to `default` when unset or invalid
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Default session database location
fn default_db_file() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("session-gate").join("session.sqlite3"))
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

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/test/file.txt");
        assert!(path.to_string_lossy().contains("test/file.txt"));
        assert!(!path.to_string_lossy().starts_with("~"));

        let path = expand_tilde("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_expand_tilde_relative_path() {
        let path = expand_tilde("relative/path");
        assert_eq!(path, PathBuf::from("relative/path"));
    }

    #[test]
    fn test_expand_tilde_just_tilde() {
        // Just "~" without slash should not expand
        let path = expand_tilde("~");
        assert_eq!(path, PathBuf::from("~"));
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.refresh_window, Duration::from_secs(300));
        assert_eq!(config.max_soft_refresh_failures, 3);
        assert_eq!(config.refresh_retry_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_auth_url_defaults_to_api_url() {
        let args = parse(&[
            "session-gate",
            "--api-url",
            "https://api.example.com/",
            "--db-file",
            "/tmp/session.sqlite3",
            "status",
        ]);
        let config = Config::from_args(args).unwrap();

        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.api_base_url, "https://api.example.com");
        assert_eq!(config.auth_base_url, "https://api.example.com");
        assert_eq!(config.db_file, PathBuf::from("/tmp/session.sqlite3"));
        config.validate().unwrap();
    }

    #[test]
    fn test_separate_auth_url() {
        let args = parse(&[
            "session-gate",
            "--api-url",
            "https://api.example.com",
            "--auth-url",
            "https://auth.example.com/",
            "--db-file",
            "/tmp/session.sqlite3",
            "logout",
        ]);
        let config = Config::from_args(args).unwrap();
        assert_eq!(config.auth_base_url, "https://auth.example.com");
    }

    #[test]
    fn test_validate_rejects_non_http_url() {
        let args = parse(&[
            "session-gate",
            "--api-url",
            "ftp://api.example.com",
            "--db-file",
            "/tmp/session.sqlite3",
            "status",
        ]);
        let config = Config::from_args(args).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_subcommands() {
        let args = parse(&["session-gate", "login", "--email", "ada@example.com"]);
        assert_eq!(
            args.command,
            Command::Login {
                email: Some("ada@example.com".to_string())
            }
        );

        let args = parse(&["session-gate", "get", "/pipelines"]);
        assert_eq!(
            args.command,
            Command::Get {
                path: "/pipelines".to_string()
            }
        );
    }

    #[test]
    fn test_json_log_format() {
        let args = parse(&["session-gate", "--log-format", "json", "token"]);
        assert_eq!(args.log_format, LogFormat::Json);
    }

    #[test]
    fn test_env_or_falls_back_on_invalid_value() {
        assert_eq!(env_or("SESSION_GATE_TEST_UNSET_VARIABLE", 42u64), 42);
    }
}
