use crate::stores::filesystem::FileSystemStore;
use afd_cache_core::{
    office::OfficeCode,
    store::{
        s3::{S3Config, S3Store},
        Store, StoreHandle,
    },
};
use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};

pub const S3_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const S3_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const S3_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";
pub const S3_REGION: &str = "AWS_REGION";
pub const S3_ENDPOINT: &str = "AWS_ENDPOINT_URL_S3";

const DEFAULT_S3_REGION: &str = "us-east-1";

/// Builds an [`S3Config`] for an `s3://bucket/prefix` URL, reading
/// credentials through `env` (normally `std::env::var(..).ok()`).
pub fn parse_s3_config(
    store_url: &str,
    env: impl Fn(&str) -> Option<String>,
) -> Result<S3Config> {
    let url = url::Url::parse(store_url)?;
    if url.scheme() != "s3" {
        bail!("Expected an s3:// URL, got {}", store_url);
    }
    let bucket = url
        .host_str()
        .ok_or_else(|| anyhow!("Invalid S3 URL"))?
        .to_owned();
    let bucket_prefix = url.path().trim_start_matches('/').to_owned();

    let region = env(S3_REGION).unwrap_or_else(|| DEFAULT_S3_REGION.to_string());
    Ok(S3Config {
        key: env(S3_ACCESS_KEY_ID)
            .ok_or_else(|| anyhow!("{} env var not supplied", S3_ACCESS_KEY_ID))?,
        secret: env(S3_SECRET_ACCESS_KEY)
            .ok_or_else(|| anyhow!("{} env var not supplied", S3_SECRET_ACCESS_KEY))?,
        token: env(S3_SESSION_TOKEN),
        endpoint: env(S3_ENDPOINT)
            .unwrap_or_else(|| format!("https://s3.dualstack.{}.amazonaws.com", region)),
        region,
        bucket,
        bucket_prefix: Some(bucket_prefix),
    })
}

/// Picks the backends for this process.
///
/// `s3://` URLs configure a remote backend in front of the local directory.
/// Any other value is taken as the local directory itself. Missing remote
/// credentials or `local_only` leave the process on the local backend.
pub async fn select_store(
    store: Option<&str>,
    data_dir: &Path,
    local_only: bool,
    env: impl Fn(&str) -> Option<String>,
) -> Result<StoreHandle> {
    let (remote_url, local_dir) = match store {
        Some(store) if store.starts_with("s3://") => (Some(store), data_dir.to_path_buf()),
        Some(path) => (None, PathBuf::from(path)),
        None => (None, data_dir.to_path_buf()),
    };

    let local = FileSystemStore::new(local_dir.clone())
        .with_context(|| format!("Failed to open data directory {}", local_dir.display()))?;
    let local: Box<dyn Store> = Box::new(local);

    let remote: Option<Box<dyn Store>> = match remote_url {
        _ if local_only => {
            tracing::info!(event = "store_local_requested", "Local mode requested.");
            None
        }
        None => None,
        Some(url) => match parse_s3_config(url, env) {
            Ok(config) => {
                let remote: Box<dyn Store> = Box::new(S3Store::new(config)?);
                Some(remote)
            }
            Err(e) => {
                tracing::warn!(
                    event = "store_remote_unconfigured",
                    error = %e,
                    "Remote store is not configured; using the local directory."
                );
                None
            }
        },
    };

    let handle = StoreHandle::select(remote, local).await?;
    tracing::info!(
        event = "store_selected",
        backend = ?handle.backend(),
        data_dir = %local_dir.display(),
        "Store selected."
    );
    Ok(handle)
}

/// Resolves the configured office list.
///
/// An explicit comma-separated list wins over a JSON file of codes.
pub fn load_offices(list: Option<&str>, file: Option<&Path>) -> Result<Vec<OfficeCode>> {
    let raw: Vec<String> = match (list, file) {
        (Some(list), _) => list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        (None, Some(file)) => {
            let contents = std::fs::read_to_string(file)
                .with_context(|| format!("Failed to read offices file {}", file.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Offices file {} is not a JSON array of codes", file.display()))?
        }
        (None, None) => Vec::new(),
    };

    let mut offices: Vec<OfficeCode> = Vec::with_capacity(raw.len());
    for code in raw {
        let office = OfficeCode::parse(&code)?;
        if !offices.contains(&office) {
            offices.push(office);
        }
    }
    Ok(offices)
}
