use crate::services::storage::{DEFAULT_ENDPOINT, DEFAULT_METADATA_URL, StorageKind};
use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::{env, path::PathBuf};

const ENV_PREFIX: &str = "AUDIO_CONVERT_";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage: StorageKind,
    pub storage_dir: PathBuf,
    pub gcs_endpoint: String,
    pub gcs_token: Option<String>,
    pub metadata_auth: bool,
    pub metadata_url: String,
    pub ffmpeg_path: PathBuf,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(
    author,
    version,
    about = "Converts uploaded audio objects to mono 16 kHz FLAC"
)]
pub struct Args {
    /// Host to bind to (overrides AUDIO_CONVERT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides AUDIO_CONVERT_PORT, then PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Storage backend, `gcs` or `local` (overrides AUDIO_CONVERT_STORAGE)
    #[arg(long)]
    pub storage: Option<String>,

    /// Root directory holding one directory per bucket for the local backend
    /// (overrides AUDIO_CONVERT_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<PathBuf>,

    /// Cloud Storage API endpoint (overrides AUDIO_CONVERT_GCS_ENDPOINT)
    #[arg(long)]
    pub gcs_endpoint: Option<String>,

    /// Static bearer token for Cloud Storage (overrides AUDIO_CONVERT_GCS_TOKEN)
    #[arg(long)]
    pub gcs_token: Option<String>,

    /// Do not ask the metadata server for tokens (AUDIO_CONVERT_NO_METADATA_AUTH)
    #[arg(long)]
    pub no_metadata_auth: bool,

    /// Path to the ffmpeg binary (overrides AUDIO_CONVERT_FFMPEG)
    #[arg(long)]
    pub ffmpeg: Option<PathBuf>,

    /// Handle a single event read from this file (`-` for stdin) and exit
    #[arg(long, value_name = "PATH")]
    pub event: Option<PathBuf>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the optional
    /// one-shot event path.
    pub fn from_env_and_args() -> Result<(Self, Option<PathBuf>)> {
        let mut args = Args::parse();
        let event = args.event.take();
        let cfg = Self::resolve(args, |key| env::var(key).ok())?;
        Ok((cfg, event))
    }

    /// Merge CLI arguments over values looked up through `env`.
    pub fn resolve(args: Args, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| env(&format!("{}{}", ENV_PREFIX, name));

        let port = match args.port {
            Some(port) => port,
            None => {
                let from_env = var("PORT")
                    .map(|v| ("AUDIO_CONVERT_PORT", v))
                    .or_else(|| env("PORT").map(|v| ("PORT", v)));
                match from_env {
                    Some((source, value)) => value
                        .parse::<u16>()
                        .with_context(|| format!("parsing {} value `{}`", source, value))?,
                    None => 8080,
                }
            }
        };

        let storage = match args.storage.or_else(|| var("STORAGE")) {
            Some(value) => value.parse::<StorageKind>().map_err(|err| anyhow!(err))?,
            None => StorageKind::Gcs,
        };

        let no_metadata_auth = args.no_metadata_auth
            || var("NO_METADATA_AUTH")
                .is_some_and(|v| matches!(v.as_str(), "1" | "true" | "yes"));

        Ok(Self {
            host: args
                .host
                .or_else(|| var("HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port,
            storage,
            storage_dir: args
                .storage_dir
                .or_else(|| var("STORAGE_DIR").map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("./data/buckets")),
            gcs_endpoint: args
                .gcs_endpoint
                .or_else(|| var("GCS_ENDPOINT"))
                .unwrap_or_else(|| DEFAULT_ENDPOINT.into()),
            gcs_token: args
                .gcs_token
                .or_else(|| var("GCS_TOKEN"))
                .filter(|t| !t.is_empty()),
            metadata_auth: !no_metadata_auth,
            metadata_url: var("METADATA_URL").unwrap_or_else(|| DEFAULT_METADATA_URL.into()),
            ffmpeg_path: args
                .ffmpeg
                .or_else(|| var("FFMPEG").map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("ffmpeg")),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
