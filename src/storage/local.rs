//! Directory-backed object store.
//!
//! Each bucket is a directory under a storage root and each key a file path
//! relative to it, so `<root>/<bucket>/<prefix>/<name>.tar.gz`. A bucket
//! directory without write permission behaves like a bucket the credentials
//! may not write to: opening it authenticated is an access denial.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;

use walkdir::WalkDir;

use super::{AccessMode, Bucket, Connector, ObjectRef, StorageError};

/// Opens [`DirectoryBucket`]s below `root`.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    root: PathBuf,
}

impl LocalConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Connector for LocalConnector {
    fn connect(&self, bucket: &str, mode: AccessMode) -> Result<Rc<dyn Bucket>, StorageError> {
        Ok(Rc::new(DirectoryBucket::open(&self.root, bucket, mode)?))
    }
}

#[derive(Debug)]
pub struct DirectoryBucket {
    name: String,
    dir: PathBuf,
    mode: AccessMode,
}

impl DirectoryBucket {
    pub fn open(root: &Path, name: &str, mode: AccessMode) -> Result<Self, StorageError> {
        validate_key(name)?;
        let dir = root.join(name);
        let meta = match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => meta,
            Ok(_) => {
                return Err(StorageError::NoSuchBucket {
                    bucket: name.to_string(),
                })
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::NoSuchBucket {
                    bucket: name.to_string(),
                })
            }
            Err(err) => return Err(StorageError::io(&dir, err)),
        };
        if mode == AccessMode::Authenticated && meta.permissions().readonly() {
            return Err(StorageError::AccessDenied {
                bucket: name.to_string(),
            });
        }
        Ok(Self {
            name: name.to_string(),
            dir,
            mode,
        })
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.dir.join(key))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.dir).ok()?;
        let parts: Option<Vec<&str>> = rel
            .components()
            .map(|component| match component {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect();
        Some(parts?.join("/"))
    }
}

impl Bucket for DirectoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn access_mode(&self) -> AccessMode {
        self.mode
    }

    fn head(&self, key: &str) -> Result<Option<ObjectRef>, StorageError> {
        let path = self.object_path(key)?;
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(ObjectRef {
                bucket: self.name.clone(),
                key: key.to_string(),
                size: meta.len(),
            })),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::io(&path, err)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectRef>, StorageError> {
        // Only the directory part of the prefix needs walking.
        let start = match prefix.rfind('/') {
            Some(idx) => self.object_path(&prefix[..idx])?,
            None => self.dir.clone(),
        };
        if !start.is_dir() {
            return Ok(Vec::new());
        }

        let mut objects = Vec::new();
        for entry in WalkDir::new(&start).follow_links(false) {
            let entry = entry.map_err(|err| {
                let path = err.path().unwrap_or(&start).to_path_buf();
                StorageError::io(&path, io::Error::other(err))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(key) = self.key_for(entry.path()) else {
                continue;
            };
            if !key.starts_with(prefix) {
                continue;
            }
            let meta = entry
                .metadata()
                .map_err(|err| StorageError::io(entry.path(), io::Error::other(err)))?;
            objects.push(ObjectRef {
                bucket: self.name.clone(),
                key,
                size: meta.len(),
            });
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    fn download(&self, key: &str, dest: &Path) -> Result<(), StorageError> {
        let path = self.object_path(key)?;
        match fs::copy(&path, dest) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound && !path.exists() => {
                Err(StorageError::NoSuchKey {
                    bucket: self.name.clone(),
                    key: key.to_string(),
                })
            }
            Err(err) => Err(StorageError::io(dest, err)),
        }
    }

    fn upload_public(&self, key: &str, src: &Path) -> Result<(), StorageError> {
        if self.mode == AccessMode::Anonymous {
            return Err(StorageError::ReadOnly {
                bucket: self.name.clone(),
                key: key.to_string(),
            });
        }
        let path = self.object_path(key)?;
        let parent = path.parent().unwrap_or(&self.dir);
        fs::create_dir_all(parent).map_err(|err| StorageError::io(parent, err))?;

        // Stage next to the destination so the final rename is atomic.
        let staged = tempfile::Builder::new()
            .prefix(".upload-")
            .tempfile_in(parent)
            .map_err(|err| StorageError::io(parent, err))?;
        fs::copy(src, staged.path()).map_err(|err| StorageError::io(src, err))?;
        fs::set_permissions(staged.path(), fs::Permissions::from_mode(0o644))
            .map_err(|err| StorageError::io(staged.path(), err))?;
        staged
            .persist(&path)
            .map_err(|err| StorageError::io(&path, err.error))?;
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("file://{}", self.dir.join(key).display())
    }
}

/// Keys are relative, `/`-separated and free of `.`/`..` segments.
fn validate_key(key: &str) -> Result<(), StorageError> {
    let invalid = || StorageError::InvalidKey {
        key: key.to_string(),
    };
    if key.is_empty() || key.starts_with('/') || key.contains('\\') || key.contains('\0') {
        return Err(invalid());
    }
    if key
        .split('/')
        .any(|segment| segment == "." || segment == "..")
    {
        return Err(invalid());
    }
    Ok(())
}
