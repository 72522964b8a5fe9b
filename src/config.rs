use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::{env, path::PathBuf, str::FromStr, time::Duration};

use crate::{
    client::{RetryPolicy, SequencerConfig},
    wire::DEFAULT_CHUNK_SIZE,
};

/// Centralized receiver configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub upload_dir: String,
    pub database_url: String,
    /// Single origin allowed to call the API from a browser. Empty disables CORS.
    pub allowed_origin: Option<String>,
    pub body_limit: usize,
    pub staging_ttl: Duration,
    pub reap_interval: Duration,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable chunked upload receiver and client")]
pub struct Args {
    /// Host to bind to (overrides CHUNKED_UPLOAD_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CHUNKED_UPLOAD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding staging and final artifacts (overrides CHUNKED_UPLOAD_DIR)
    #[arg(long)]
    pub upload_dir: Option<String>,

    /// Database URL (overrides CHUNKED_UPLOAD_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Allowed CORS origin (overrides CHUNKED_UPLOAD_ALLOWED_ORIGIN)
    #[arg(long)]
    pub allowed_origin: Option<String>,

    /// Maximum request body in bytes (overrides CHUNKED_UPLOAD_BODY_LIMIT)
    #[arg(long)]
    pub body_limit: Option<usize>,

    /// Seconds an upload may sit idle before its staging file is purged
    /// (overrides CHUNKED_UPLOAD_STAGING_TTL_SECS)
    #[arg(long)]
    pub staging_ttl_secs: Option<u64>,

    /// Seconds between reaper passes (overrides CHUNKED_UPLOAD_REAP_INTERVAL_SECS)
    #[arg(long)]
    pub reap_interval_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upload files to a running receiver, one chunk at a time
    Upload(UploadArgs),
}

#[derive(ClapArgs, Debug, Clone)]
pub struct UploadArgs {
    /// Receiver base URL
    #[arg(long, default_value = "http://127.0.0.1:5002")]
    pub server: String,

    /// Chunk size in bytes
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: u64,

    /// Attempts per chunk before the file is marked failed
    #[arg(long, default_value_t = 5)]
    pub max_attempts: u32,

    /// Seconds to wait for one acknowledgment
    #[arg(long, default_value_t = 30)]
    pub chunk_timeout_secs: u64,

    /// Key uploads by filename and address instead of a session token
    #[arg(long)]
    pub no_sessions: bool,

    /// Files to upload, in queue order
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

impl UploadArgs {
    pub fn sequencer_config(&self) -> SequencerConfig {
        SequencerConfig {
            chunk_size: self.chunk_size,
            retry: RetryPolicy {
                max_attempts: self.max_attempts.max(1),
                chunk_timeout: Duration::from_secs(self.chunk_timeout_secs.max(1)),
                ..RetryPolicy::default()
            },
            use_sessions: !self.no_sessions,
        }
    }
}

/// What the binary was asked to do.
#[derive(Debug)]
pub enum RunMode {
    Serve,
    Migrate,
    Upload(UploadArgs),
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Result<(Self, RunMode)> {
        // --- Environment fallback ---
        let env_host = env::var("CHUNKED_UPLOAD_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("CHUNKED_UPLOAD_PORT", 5002u16)?;
        let env_dir = env::var("CHUNKED_UPLOAD_DIR").unwrap_or_else(|_| "./uploads".into());
        let env_db = env::var("CHUNKED_UPLOAD_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/chunked_upload.db".into());
        let env_origin = env::var("CHUNKED_UPLOAD_ALLOWED_ORIGIN")
            .unwrap_or_else(|_| "http://localhost:3000".into());
        let env_body_limit = env_or("CHUNKED_UPLOAD_BODY_LIMIT", 100 * 1024 * 1024usize)?;
        let env_ttl = env_or("CHUNKED_UPLOAD_STAGING_TTL_SECS", 24 * 60 * 60u64)?;
        let env_interval = env_or("CHUNKED_UPLOAD_REAP_INTERVAL_SECS", 10 * 60u64)?;

        // --- Merge ---
        let origin = args.allowed_origin.unwrap_or(env_origin);
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            upload_dir: args.upload_dir.unwrap_or(env_dir),
            database_url: args.database_url.unwrap_or(env_db),
            allowed_origin: (!origin.trim().is_empty()).then_some(origin),
            body_limit: args.body_limit.unwrap_or(env_body_limit),
            staging_ttl: Duration::from_secs(args.staging_ttl_secs.unwrap_or(env_ttl)),
            reap_interval: Duration::from_secs(
                args.reap_interval_secs.unwrap_or(env_interval).max(1),
            ),
        };

        let mode = match args.command {
            Some(Command::Upload(upload)) => RunMode::Upload(upload),
            None if args.migrate => RunMode::Migrate,
            None => RunMode::Serve,
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
