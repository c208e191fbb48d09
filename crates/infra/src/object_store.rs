//! Hot object storage (inputs and results), keyed by bucket + key.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::fault::FaultBudget;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ObjectStoreError {
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("object store unavailable: {0}")]
    Unavailable(String),
}

pub trait ObjectStore: Send + Sync {
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ObjectStoreError>;

    /// Durable once this returns `Ok`.
    fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), ObjectStoreError>;

    /// Deleting a missing object succeeds.
    fn delete(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError>;
}

impl<S> ObjectStore for Arc<S>
where
    S: ObjectStore + ?Sized,
{
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        (**self).get(bucket, key)
    }

    fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), ObjectStoreError> {
        (**self).put(bucket, key, bytes)
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
        (**self).delete(bucket, key)
    }
}

/// In-memory object store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<(String, String), Vec<u8>>>,
    put_faults: FaultBudget,
    delete_faults: FaultBudget,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .read()
            .map(|m| m.contains_key(&(bucket.to_string(), key.to_string())))
            .unwrap_or(false)
    }

    pub fn fail_next_puts(&self, n: usize) {
        self.put_faults.arm(n);
    }

    pub fn fail_next_deletes(&self, n: usize) {
        self.delete_faults.arm(n);
    }

    fn poisoned() -> ObjectStoreError {
        ObjectStoreError::Unavailable("lock poisoned".into())
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), ObjectStoreError> {
        if self.put_faults.trip() {
            return Err(ObjectStoreError::Unavailable("injected put failure".into()));
        }
        let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;
        objects.insert((bucket.to_string(), key.to_string()), bytes);
        Ok(())
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
        if self.delete_faults.trip() {
            return Err(ObjectStoreError::Unavailable("injected delete failure".into()));
        }
        let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;
        objects.remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}
