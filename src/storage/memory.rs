//! In-memory bucket for tests. Counts calls so tests can assert which
//! operations ran.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use super::{AccessMode, Bucket, ObjectRef, StorageError};

pub(crate) struct MemoryBucket {
    name: String,
    mode: AccessMode,
    objects: RefCell<BTreeMap<String, Vec<u8>>>,
    /// When set, every call fails with a transport error carrying this text.
    pub(crate) fail_with: RefCell<Option<String>>,
    pub(crate) head_calls: Cell<usize>,
    pub(crate) list_calls: Cell<usize>,
    pub(crate) upload_calls: Cell<usize>,
}

impl MemoryBucket {
    pub(crate) fn new(name: &str, mode: AccessMode) -> Self {
        Self {
            name: name.to_string(),
            mode,
            objects: RefCell::new(BTreeMap::new()),
            fail_with: RefCell::new(None),
            head_calls: Cell::new(0),
            list_calls: Cell::new(0),
            upload_calls: Cell::new(0),
        }
    }

    pub(crate) fn insert(&self, key: &str, data: Vec<u8>) {
        self.objects.borrow_mut().insert(key.to_string(), data);
    }

    pub(crate) fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.borrow().get(key).cloned()
    }

    fn check(&self) -> Result<(), StorageError> {
        match self.fail_with.borrow().as_ref() {
            Some(message) => Err(StorageError::Transport {
                bucket: self.name.clone(),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    fn object_ref(&self, key: &str, data: &[u8]) -> ObjectRef {
        ObjectRef {
            bucket: self.name.clone(),
            key: key.to_string(),
            size: data.len() as u64,
        }
    }
}

impl Bucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn access_mode(&self) -> AccessMode {
        self.mode
    }

    fn head(&self, key: &str) -> Result<Option<ObjectRef>, StorageError> {
        self.head_calls.set(self.head_calls.get() + 1);
        self.check()?;
        Ok(self
            .objects
            .borrow()
            .get(key)
            .map(|data| self.object_ref(key, data)))
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectRef>, StorageError> {
        self.list_calls.set(self.list_calls.get() + 1);
        self.check()?;
        Ok(self
            .objects
            .borrow()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, data)| self.object_ref(key, data))
            .collect())
    }

    fn download(&self, key: &str, dest: &Path) -> Result<(), StorageError> {
        self.check()?;
        let data = self.get(key).ok_or_else(|| StorageError::NoSuchKey {
            bucket: self.name.clone(),
            key: key.to_string(),
        })?;
        fs::write(dest, data).map_err(|err| StorageError::io(dest, err))
    }

    fn upload_public(&self, key: &str, src: &Path) -> Result<(), StorageError> {
        self.upload_calls.set(self.upload_calls.get() + 1);
        self.check()?;
        if self.mode == AccessMode::Anonymous {
            return Err(StorageError::ReadOnly {
                bucket: self.name.clone(),
                key: key.to_string(),
            });
        }
        let data = fs::read(src).map_err(|err| StorageError::io(src, err))?;
        self.insert(key, data);
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("memory://{}/{}", self.name, key)
    }
}
