//! Object storage seam.
//!
//! The formula lifecycle only needs a handful of operations from a bucket:
//! exact lookup, prefix listing, download, public upload and the access mode
//! the handle was opened with. [`Bucket`] captures exactly those;
//! [`BucketRegistry`] owns the handle cache and the credentialed/anonymous
//! fallback.

pub mod local;
#[cfg(test)]
pub(crate) mod memory;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::{info, warn};

/// How a bucket handle authenticates its requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Authenticated,
    Anonymous,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Authenticated => f.write_str("authenticated"),
            AccessMode::Anonymous => f.write_str("anonymous"),
        }
    }
}

/// A stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
    pub size: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("access denied for bucket '{bucket}'")]
    AccessDenied { bucket: String },

    #[error("bucket '{bucket}' does not exist")]
    NoSuchBucket { bucket: String },

    #[error("object '{key}' not found in bucket '{bucket}'")]
    NoSuchKey { bucket: String, key: String },

    #[error("bucket '{bucket}' was opened anonymously; cannot write '{key}'")]
    ReadOnly { bucket: String, key: String },

    #[error("invalid object key '{key}'")]
    InvalidKey { key: String },

    #[error("storage I/O on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("transport error talking to bucket '{bucket}': {message}")]
    Transport { bucket: String, message: String },
}

impl StorageError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Operations the formula lifecycle needs from one bucket.
pub trait Bucket {
    fn name(&self) -> &str;

    /// Mode this handle was opened with.
    fn access_mode(&self) -> AccessMode;

    /// Exact-key lookup. `Ok(None)` means the key is absent; any other
    /// failure is an `Err`.
    fn head(&self, key: &str) -> Result<Option<ObjectRef>, StorageError>;

    /// Every object whose key starts with `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<ObjectRef>, StorageError>;

    fn download(&self, key: &str, dest: &Path) -> Result<(), StorageError>;

    /// Store `src` under `key`, readable by anyone.
    fn upload_public(&self, key: &str, src: &Path) -> Result<(), StorageError>;

    /// Unauthenticated URL of `key`.
    fn public_url(&self, key: &str) -> String;
}

/// Opens bucket handles for a storage backend.
pub trait Connector {
    fn connect(&self, bucket: &str, mode: AccessMode) -> Result<Rc<dyn Bucket>, StorageError>;
}

/// Cache of bucket handles keyed by name.
///
/// With credentials, buckets are opened authenticated first; an access
/// denial retries anonymously so public buckets stay readable. Without
/// credentials every bucket is opened anonymously.
pub struct BucketRegistry<C> {
    connector: C,
    has_credentials: bool,
    warned_anonymous: bool,
    cache: HashMap<String, Rc<dyn Bucket>>,
}

impl<C: Connector> BucketRegistry<C> {
    pub fn new(connector: C, has_credentials: bool) -> Self {
        Self {
            connector,
            has_credentials,
            warned_anonymous: false,
            cache: HashMap::new(),
        }
    }

    /// Get (or open and cache) the handle for `name`.
    pub fn bucket(&mut self, name: &str) -> Result<Rc<dyn Bucket>, StorageError> {
        if let Some(bucket) = self.cache.get(name) {
            return Ok(Rc::clone(bucket));
        }

        let bucket = if self.has_credentials {
            match self.connector.connect(name, AccessMode::Authenticated) {
                Err(StorageError::AccessDenied { .. }) => {
                    info!(
                        "Access denied for bucket \"{name}\" using found credentials. \
                         Retrying as an anonymous user."
                    );
                    self.connector.connect(name, AccessMode::Anonymous)?
                }
                other => other?,
            }
        } else {
            if !self.warned_anonymous {
                warn!("No credentials found. Requests will be made without authentication.");
                self.warned_anonymous = true;
            }
            self.connector.connect(name, AccessMode::Anonymous)?
        };

        self.cache.insert(name.to_string(), Rc::clone(&bucket));
        Ok(bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryBucket;
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashSet;

    #[derive(Default)]
    struct FakeConnector {
        denied_with_credentials: HashSet<String>,
        calls: RefCell<Vec<(String, AccessMode)>>,
    }

    impl Connector for FakeConnector {
        fn connect(
            &self,
            bucket: &str,
            mode: AccessMode,
        ) -> Result<Rc<dyn Bucket>, StorageError> {
            self.calls.borrow_mut().push((bucket.to_string(), mode));
            if mode == AccessMode::Authenticated && self.denied_with_credentials.contains(bucket)
            {
                return Err(StorageError::AccessDenied {
                    bucket: bucket.to_string(),
                });
            }
            Ok(Rc::new(MemoryBucket::new(bucket, mode)))
        }
    }

    #[test]
    fn test_registry_prefers_credentials() {
        let mut registry = BucketRegistry::new(FakeConnector::default(), true);
        let bucket = registry.bucket("builds").unwrap();
        assert_eq!(bucket.access_mode(), AccessMode::Authenticated);
    }

    #[test]
    fn test_registry_falls_back_to_anonymous_on_denial() {
        let connector = FakeConnector {
            denied_with_credentials: HashSet::from(["public".to_string()]),
            ..Default::default()
        };
        let mut registry = BucketRegistry::new(connector, true);
        let bucket = registry.bucket("public").unwrap();
        assert_eq!(bucket.access_mode(), AccessMode::Anonymous);
        assert_eq!(
            registry.connector.calls.borrow().as_slice(),
            &[
                ("public".to_string(), AccessMode::Authenticated),
                ("public".to_string(), AccessMode::Anonymous),
            ]
        );
    }

    #[test]
    fn test_registry_without_credentials_is_anonymous() {
        let mut registry = BucketRegistry::new(FakeConnector::default(), false);
        let bucket = registry.bucket("builds").unwrap();
        assert_eq!(bucket.access_mode(), AccessMode::Anonymous);
    }

    #[test]
    fn test_registry_caches_handles() {
        let mut registry = BucketRegistry::new(FakeConnector::default(), true);
        let first = registry.bucket("builds").unwrap();
        let second = registry.bucket("builds").unwrap();
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(registry.connector.calls.borrow().len(), 1);
    }

    #[test]
    fn test_registry_propagates_other_errors() {
        struct Missing;
        impl Connector for Missing {
            fn connect(&self, bucket: &str, _: AccessMode) -> Result<Rc<dyn Bucket>, StorageError> {
                Err(StorageError::NoSuchBucket {
                    bucket: bucket.to_string(),
                })
            }
        }
        let mut registry = BucketRegistry::new(Missing, true);
        let err = registry.bucket("nope").err().unwrap();
        assert!(matches!(err, StorageError::NoSuchBucket { .. }));
    }
}
