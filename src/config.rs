//! Handle configuration of the parcel tracking server.

use std::{
    env,
    fmt,
    net::{Ipv4Addr, TcpListener},
    path::PathBuf,
    str::FromStr,
};

use dotenv::dotenv;

const DEFAULT_UPLOAD_DIR: &str = "uploads";
const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// What to do when a package that has already been delivered is assigned again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassignPolicy {
    /// Force the package back to `ASSIGNED`, whatever its status
    Allow,
    /// Refuse to re-assign a delivered package
    Reject,
}

impl Default for ReassignPolicy {
    fn default() -> Self {
        ReassignPolicy::Allow
    }
}

impl FromStr for ReassignPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(ReassignPolicy::Allow),
            "reject" => Ok(ReassignPolicy::Reject),
            other => Err(format!("unknown reassign policy `{}`", other)),
        }
    }
}

impl fmt::Display for ReassignPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReassignPolicy::Allow => f.write_str("allow"),
            ReassignPolicy::Reject => f.write_str("reject"),
        }
    }
}

/// Handles all configuration variables for the crate
#[derive(Debug)]
pub struct Config {
    /// The listener to bind to
    pub listener: TcpListener,
    /// The database url to connect to
    pub db_url: String,
    /// Directory delivery evidence is written to
    pub upload_dir: PathBuf,
    /// Largest evidence photo accepted, in bytes
    pub max_upload_bytes: usize,
    /// Whether delivered packages may be assigned again
    pub reassign_policy: ReassignPolicy,
}

impl Config {
    /// Load configuration from the environment
    pub fn load() -> Result<Config, String> {
        dotenv().ok();

        let host: Ipv4Addr = env::var("HOST")
            .map_err(|_| "HOST must be set")?
            .parse()
            .map_err(|_| "HOST must be a valid IPv4 address")?;

        let port: u16 = env::var("PORT")
            .map_err(|_| "PORT must be set")?
            .parse()
            .map_err(|_| "PORT must be a valid port number")?;

        let listener = TcpListener::bind((host, port))
            .map_err(|e| format!("failed to bind to {}:{} due to error: {}", host, port, e))?;

        Ok(Self {
            listener,
            db_url: env::var("DB_URL").map_err(|_| "DB_URL must be set")?,
            upload_dir: env::var("UPLOAD_DIR")
                .unwrap_or_else(|_| DEFAULT_UPLOAD_DIR.to_owned())
                .into(),
            max_upload_bytes: match env::var("MAX_UPLOAD_BYTES") {
                Ok(v) => v
                    .parse()
                    .map_err(|_| "MAX_UPLOAD_BYTES must be a positive integer")?,
                Err(_) => DEFAULT_MAX_UPLOAD_BYTES,
            },
            reassign_policy: match env::var("REASSIGN_DELIVERED") {
                Ok(v) => v
                    .parse()
                    .map_err(|e| format!("REASSIGN_DELIVERED must be `allow` or `reject`: {}", e))?,
                Err(_) => ReassignPolicy::default(),
            },
        })
    }
}
