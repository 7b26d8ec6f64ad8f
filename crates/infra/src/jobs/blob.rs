//! Offloaded byte payloads referenced from job records.
//!
//! A `BlobRef` keeps only the blob identity inside the owning record. Content is
//! fetched on first read and cached for the lifetime of the record instance. Writes
//! are buffered in memory and reach the store when the owning record is persisted.
//!
//! Stored blobs are immutable. Rewriting a reference creates a new blob and hands
//! back the superseded id, which the owner deletes only after its own row update
//! succeeded. A writer that loses the revision check therefore never changes
//! content another instance can see.

use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::warn;

use flowjob_core::{BlobId, EngineError, EngineResult};

use super::store::StoreError;

/// Blob persistence boundary.
pub trait BlobStore: Send + Sync {
    /// Fetch blob content. `Ok(None)` when no blob has this id.
    fn get_blob(&self, id: BlobId) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store a new blob and return its identity.
    fn put_blob(&self, name: &str, bytes: &[u8]) -> Result<BlobId, StoreError>;

    /// Delete a blob. Deleting a missing blob is not an error.
    fn delete_blob(&self, id: BlobId) -> Result<(), StoreError>;
}

impl<S> BlobStore for Arc<S>
where
    S: BlobStore + ?Sized,
{
    fn get_blob(&self, id: BlobId) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get_blob(id)
    }

    fn put_blob(&self, name: &str, bytes: &[u8]) -> Result<BlobId, StoreError> {
        (**self).put_blob(name, bytes)
    }

    fn delete_blob(&self, id: BlobId) -> Result<(), StoreError> {
        (**self).delete_blob(id)
    }
}

/// Blob identities touched by one `BlobRef::flush`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flushed {
    /// The blob now holding the content.
    pub written: BlobId,
    /// The blob the reference pointed at before; still stored.
    pub superseded: Option<BlobId>,
}

/// Lazy reference to an offloaded payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlobRef {
    id: Option<BlobId>,
    name: Option<String>,
    /// Written but not yet flushed to the store.
    #[serde(skip)]
    pending: Option<Vec<u8>>,
    #[serde(skip)]
    cache: OnceLock<Option<Vec<u8>>>,
}

impl BlobRef {
    /// Empty reference; nothing has been written yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reference to a blob that already exists in the store.
    pub fn stored(id: BlobId, name: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn id(&self) -> Option<BlobId> {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether a write is buffered and waiting for the owner to be persisted.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Read the payload, fetching it from the store on first access.
    ///
    /// Returns `Ok(None)` when nothing was ever written.
    pub fn get<S: BlobStore + ?Sized>(&self, store: &S) -> EngineResult<Option<&[u8]>> {
        if let Some(pending) = &self.pending {
            return Ok(Some(pending.as_slice()));
        }
        let Some(id) = self.id else {
            return Ok(None);
        };
        if let Some(cached) = self.cache.get() {
            return Ok(cached.as_deref());
        }

        let fetched = store.get_blob(id).map_err(|e| match e {
            StoreError::Unavailable(msg) => EngineError::storage(msg),
            other => EngineError::storage(other.to_string()),
        })?;
        if fetched.is_none() {
            warn!(blob_id = %id, name = ?self.name, "blob reference points at a missing blob");
        }
        let _ = self.cache.set(fetched);
        Ok(self.cache.get().and_then(|c| c.as_deref()))
    }

    /// Buffer new content under `name`. Takes effect when the owner is persisted.
    pub fn set(&mut self, name: impl Into<String>, bytes: Vec<u8>) {
        self.name = Some(name.into());
        self.pending = Some(bytes);
        self.cache = OnceLock::new();
    }

    /// Read the payload as UTF-8 text.
    ///
    /// Invalid UTF-8 means the stored data is corrupt and is reported as
    /// `EngineError::Encoding`, never as "no content".
    pub fn decode_text<S: BlobStore + ?Sized>(&self, store: &S) -> EngineResult<Option<String>> {
        let Some(bytes) = self.get(store)? else {
            return Ok(None);
        };
        let text = std::str::from_utf8(bytes).map_err(|source| EngineError::Encoding {
            slot: self.name.clone().unwrap_or_else(|| "unnamed".to_string()),
            source,
        })?;
        Ok(Some(text.to_string()))
    }

    /// Buffer `text` as UTF-8 under `name`.
    pub fn encode_text(&mut self, name: impl Into<String>, text: &str) {
        self.set(name, text.as_bytes().to_vec());
    }

    /// Write buffered content to a new blob and point the reference at it.
    ///
    /// Returns `None` when nothing was buffered. The previous blob, if any, is left
    /// in the store and reported as superseded.
    pub fn flush<S: BlobStore + ?Sized>(&mut self, store: &S) -> Result<Option<Flushed>, StoreError> {
        let Some(bytes) = self.pending.as_deref() else {
            return Ok(None);
        };
        let name = self.name.as_deref().unwrap_or_default();
        let written = store.put_blob(name, bytes)?;
        let superseded = self.id.replace(written);

        let content = self.pending.take();
        self.cache = OnceLock::new();
        let _ = self.cache.set(content);
        Ok(Some(Flushed {
            written,
            superseded,
        }))
    }

    /// Delete the stored blob (if any) and forget buffered content.
    pub fn delete<S: BlobStore + ?Sized>(&mut self, store: &S) -> Result<(), StoreError> {
        self.pending = None;
        self.cache = OnceLock::new();
        if let Some(id) = self.id.take() {
            store.delete_blob(id)?;
        }
        Ok(())
    }

    /// Drop buffered content and cache, keeping only the identity.
    pub(crate) fn detached(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingBlobs {
        blobs: Mutex<HashMap<BlobId, Vec<u8>>>,
        reads: AtomicUsize,
    }

    impl BlobStore for CountingBlobs {
        fn get_blob(&self, id: BlobId) -> Result<Option<Vec<u8>>, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.blobs.lock().unwrap().get(&id).cloned())
        }

        fn put_blob(&self, _name: &str, bytes: &[u8]) -> Result<BlobId, StoreError> {
            let id = BlobId::new();
            self.blobs.lock().unwrap().insert(id, bytes.to_vec());
            Ok(id)
        }

        fn delete_blob(&self, id: BlobId) -> Result<(), StoreError> {
            self.blobs.lock().unwrap().remove(&id);
            Ok(())
        }
    }

    #[test]
    fn unset_reference_reads_no_content() {
        let store = CountingBlobs::default();
        let blob = BlobRef::new();
        assert_eq!(blob.get(&store).unwrap(), None);
        assert_eq!(blob.decode_text(&store).unwrap(), None);
        assert_eq!(store.reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn write_is_buffered_until_flush() {
        let store = CountingBlobs::default();
        let mut blob = BlobRef::new();
        blob.encode_text("cfg", "{\"a\":1}");

        assert!(blob.has_pending());
        assert!(blob.id().is_none());
        assert!(store.blobs.lock().unwrap().is_empty());
        assert_eq!(blob.decode_text(&store).unwrap().as_deref(), Some("{\"a\":1}"));

        let flushed = blob.flush(&store).unwrap().unwrap();
        assert_eq!(flushed.superseded, None);
        assert_eq!(blob.id(), Some(flushed.written));
        assert!(!blob.has_pending());
        assert_eq!(blob.flush(&store).unwrap(), None);
        let id = blob.id().unwrap();
        assert_eq!(store.blobs.lock().unwrap()[&id], b"{\"a\":1}".to_vec());
    }

    #[test]
    fn rewrite_creates_new_blob_and_keeps_the_old_one() {
        let store = CountingBlobs::default();
        let mut blob = BlobRef::new();
        blob.encode_text("cfg", "v1");
        blob.flush(&store).unwrap();
        let first = blob.id().unwrap();

        blob.encode_text("cfg", "v2");
        let flushed = blob.flush(&store).unwrap().unwrap();
        assert_ne!(flushed.written, first);
        assert_eq!(flushed.superseded, Some(first));
        assert_eq!(blob.id(), Some(flushed.written));

        let blobs = store.blobs.lock().unwrap();
        assert_eq!(blobs[&first], b"v1".to_vec());
        assert_eq!(blobs[&flushed.written], b"v2".to_vec());
    }

    #[test]
    fn content_is_fetched_once_and_cached() {
        let store = CountingBlobs::default();
        let id = store.put_blob("stacktrace", b"boom").unwrap();
        let blob = BlobRef::stored(id, "stacktrace");

        assert_eq!(blob.get(&store).unwrap(), Some(&b"boom"[..]));
        assert_eq!(blob.get(&store).unwrap(), Some(&b"boom"[..]));
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalid_utf8_is_an_encoding_error() {
        let store = CountingBlobs::default();
        let id = store.put_blob("cfg", &[0xff, 0xfe, 0xfd]).unwrap();
        let blob = BlobRef::stored(id, "cfg");

        let err = blob.decode_text(&store).unwrap_err();
        assert!(matches!(err, EngineError::Encoding { ref slot, .. } if slot == "cfg"));
    }

    #[test]
    fn delete_removes_stored_blob() {
        let store = CountingBlobs::default();
        let mut blob = BlobRef::new();
        blob.set("cfg", vec![1, 2, 3]);
        blob.flush(&store).unwrap();

        blob.delete(&store).unwrap();
        assert!(blob.id().is_none());
        assert!(store.blobs.lock().unwrap().is_empty());
    }

    struct UnreachableBlobs;

    impl BlobStore for UnreachableBlobs {
        fn get_blob(&self, _id: BlobId) -> Result<Option<Vec<u8>>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        fn put_blob(&self, _name: &str, _bytes: &[u8]) -> Result<BlobId, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        fn delete_blob(&self, _id: BlobId) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    #[test]
    fn failed_fetch_is_storage_unavailable_and_not_cached() {
        let blob = BlobRef::stored(BlobId::new(), "stacktrace");

        let err = blob.get(&UnreachableBlobs).unwrap_err();
        assert_eq!(err, EngineError::storage("connection refused"));
        assert!(matches!(
            blob.decode_text(&UnreachableBlobs),
            Err(EngineError::StorageUnavailable(_))
        ));

        let store = CountingBlobs::default();
        assert_eq!(blob.get(&store).unwrap(), None);
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_write_keeps_content_buffered() {
        let mut blob = BlobRef::new();
        blob.encode_text("cfg", "v1");
        assert!(blob.flush(&UnreachableBlobs).is_err());
        assert!(blob.has_pending());
        assert!(blob.id().is_none());
    }
}
