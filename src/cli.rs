//! CLI argument parsing, validation, and startup helpers.

use crate::ServerConfig;
use crate::db::Database;
use crate::jwt::{ACCESS_TOKEN_DURATION_SECS, REFRESH_TOKEN_DURATION_SECS};
use clap::Parser;
use tracing::{error, info};

const MIN_JWT_SECRET_LENGTH: usize = 32;

/// Longest accepted access token lifetime: 4 hours
const MAX_ACCESS_TOKEN_TTL: u64 = 4 * 60 * 60;

#[derive(clap::ValueEnum, Clone, Debug, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "Shakedown", about = "Live-music show reviews: auth server")]
pub struct Args {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value = "5000")]
    pub port: u16,

    /// Path to SQLite database file
    #[arg(short, long, default_value = "shakedown.db")]
    pub database: String,

    /// Path to file containing JWT secret. Prefer using JWT_SECRET env var instead
    #[arg(long)]
    pub jwt_secret_file: Option<String>,

    /// Set the Secure flag on the refresh cookie (enable when served over HTTPS)
    #[arg(long)]
    pub secure_cookies: bool,

    /// Trust the first X-Forwarded-For entry as the client IP (only behind a proxy)
    #[arg(long)]
    pub trust_proxy: bool,

    /// Access token lifetime in seconds
    #[arg(long, default_value_t = ACCESS_TOKEN_DURATION_SECS,
        value_parser = clap::value_parser!(u64).range(1..=MAX_ACCESS_TOKEN_TTL))]
    pub access_token_ttl: u64,

    /// Refresh token lifetime in seconds
    #[arg(long, default_value_t = REFRESH_TOKEN_DURATION_SECS,
        value_parser = clap::value_parser!(u64).range(1..))]
    pub refresh_token_ttl: u64,

    /// Log output format
    #[arg(short, long, default_value = "pretty")]
    pub log_format: LogFormat,
}

/// Initialize logging based on the specified format.
pub fn init_logging(format: &LogFormat) {
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt::init(),
        LogFormat::Json => tracing_subscriber::fmt().json().init(),
        LogFormat::Compact => tracing_subscriber::fmt().compact().init(),
    }
}

/// Load JWT secret from environment variable or file.
/// Returns None and logs an error if the secret cannot be loaded.
pub fn load_jwt_secret(jwt_secret_file: Option<&str>) -> Option<String> {
    let secret = if let Ok(secret) = std::env::var("JWT_SECRET") {
        // Clear the environment variable to prevent leaking
        // SAFETY: We're single-threaded at this point during startup,
        // and no other code is reading this environment variable.
        unsafe { std::env::remove_var("JWT_SECRET") };
        secret
    } else if let Some(path) = jwt_secret_file {
        match std::fs::read_to_string(path) {
            Ok(content) => content.trim().to_string(),
            Err(e) => {
                error!(path = %path, error = %e, "Failed to read JWT secret file");
                return None;
            }
        }
    } else {
        error!(
            "JWT secret is required. Set JWT_SECRET environment variable (recommended) or use --jwt-secret-file"
        );
        return None;
    };

    if secret.len() < MIN_JWT_SECRET_LENGTH {
        error!(
            "JWT secret is shorter than {} characters. Use a longer secret",
            MIN_JWT_SECRET_LENGTH
        );
        return None;
    }

    Some(secret)
}

/// Build ServerConfig from validated arguments.
pub fn build_config(args: &Args, db: Database, jwt_secret: String) -> Option<ServerConfig> {
    if args.access_token_ttl >= args.refresh_token_ttl {
        error!(
            access_token_ttl = args.access_token_ttl,
            refresh_token_ttl = args.refresh_token_ttl,
            "Access token lifetime must be shorter than refresh token lifetime"
        );
        return None;
    }

    Some(ServerConfig {
        db,
        jwt_secret: jwt_secret.into_bytes(),
        secure_cookies: args.secure_cookies,
        trust_proxy: args.trust_proxy,
        access_token_ttl: args.access_token_ttl,
        refresh_token_ttl: args.refresh_token_ttl,
    })
}

/// Open the database, logging errors if it fails.
pub async fn open_database(path: &str) -> Option<Database> {
    match Database::open(path).await {
        Ok(db) => {
            info!(path = %path, "Database opened");
            Some(db)
        }
        Err(e) => {
            error!(path = %path, error = %e, "Failed to open database");
            None
        }
    }
}
