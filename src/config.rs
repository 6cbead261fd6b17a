//! Process-wide configuration, built once at startup and passed down.
//!
//! Sources, lowest precedence first: built-in defaults, an optional TOML
//! file, then environment variables.
//!
//! ```toml
//! workspace_dir = "workspace"
//! default_build_path = "/app/.heroku/"
//! storage_root = "/srv/buckets"
//!
//! [bucket]
//! name = "lang-python"
//! prefix = "heroku-18"
//!
//! [upstream]
//! name = "lang-python-upstream"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

pub const DEFAULT_WORKSPACE_DIR: &str = "workspace";
pub const DEFAULT_BUILD_PATH: &str = "/app/.heroku/";
pub const DEFAULT_STORAGE_ROOT: &str = ".bob-storage";
pub const DEFAULT_CONFIG_FILE: &str = "bob.toml";

/// A bucket name plus the key prefix used inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketLocation {
    pub name: String,
    /// Empty, or ending with `/`.
    pub prefix: String,
}

impl BucketLocation {
    pub fn new(name: impl Into<String>, prefix: &str) -> Self {
        Self {
            name: name.into(),
            prefix: normalize_prefix(prefix),
        }
    }

    /// Key of the archive for `identifier` in this bucket.
    pub fn archive_key(&self, identifier: &str) -> String {
        format!("{}{}.tar.gz", self.prefix, identifier)
    }
}

/// Keys for authenticated bucket access.
///
/// Their presence selects [`crate::storage::AccessMode::Authenticated`] in
/// the bucket registry. The directory backend has nothing to sign, so the
/// values themselves are only read by connectors that talk to a remote
/// store.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Directory containing formula scripts.
    pub workspace_dir: PathBuf,
    /// Build output directory for formulas without a `# Build Path:` marker.
    pub default_build_path: PathBuf,
    /// Directory whose subdirectories are the buckets.
    pub storage_root: PathBuf,
    pub bucket: BucketLocation,
    pub upstream: Option<BucketLocation>,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    workspace_dir: Option<PathBuf>,
    default_build_path: Option<PathBuf>,
    storage_root: Option<PathBuf>,
    bucket: Option<BucketToml>,
    upstream: Option<BucketToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BucketToml {
    name: String,
    #[serde(default)]
    prefix: String,
}

impl Config {
    /// Load from the process environment, reading `config_file` if given or
    /// `bob.toml` in the current directory if present.
    pub fn from_env(config_file: Option<&Path>) -> Result<Self> {
        let file = match config_file {
            Some(path) => Some(path.to_path_buf()),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                default.is_file().then_some(default)
            }
        };
        Self::load(file.as_deref(), |key| std::env::var(key).ok())
    }

    /// Load from an optional TOML file and an environment lookup function.
    pub fn load<F>(config_file: Option<&Path>, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = match config_file {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("reading config '{}'", path.display()))?;
                toml::from_str::<ConfigToml>(&text)
                    .with_context(|| format!("parsing config '{}'", path.display()))?
            }
            None => ConfigToml::default(),
        };
        let lookup = |key: &str| env(key).filter(|value| !value.is_empty());

        let workspace_dir = lookup("WORKSPACE_DIR")
            .map(PathBuf::from)
            .or(file.workspace_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKSPACE_DIR));
        let default_build_path = lookup("DEFAULT_BUILD_PATH")
            .map(PathBuf::from)
            .or(file.default_build_path)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BUILD_PATH));
        let storage_root = lookup("BOB_STORAGE_ROOT")
            .map(PathBuf::from)
            .or(file.storage_root)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT));

        let bucket = merge_bucket(file.bucket, lookup("S3_BUCKET"), lookup("S3_PREFIX"));
        let Some(bucket) = bucket else {
            bail!("The environment variable S3_BUCKET must be set to the bucket name.");
        };
        let upstream = merge_bucket(
            file.upstream,
            lookup("UPSTREAM_S3_BUCKET"),
            lookup("UPSTREAM_S3_PREFIX"),
        );

        let credentials = match (lookup("AWS_ACCESS_KEY_ID"), lookup("AWS_SECRET_ACCESS_KEY")) {
            (Some(access_key_id), Some(secret_access_key)) => Some(Credentials {
                access_key_id,
                secret_access_key,
            }),
            (None, None) => None,
            _ => bail!("AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY must be set together"),
        };

        Ok(Self {
            workspace_dir,
            default_build_path,
            storage_root,
            bucket,
            upstream,
            credentials,
        })
    }
}

fn merge_bucket(
    file: Option<BucketToml>,
    env_name: Option<String>,
    env_prefix: Option<String>,
) -> Option<BucketLocation> {
    let (file_name, file_prefix) = match file {
        Some(bucket) => (Some(bucket.name), bucket.prefix),
        None => (None, String::new()),
    };
    let name = env_name.or(file_name)?;
    let prefix = env_prefix.unwrap_or(file_prefix);
    Some(BucketLocation::new(name, &prefix))
}

/// Append a `/` to a non-empty prefix that lacks one.
pub fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    }
}
