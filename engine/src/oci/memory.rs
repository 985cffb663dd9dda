//! Process-local blob store.
//!
//! Behaves like a registry for a single host: blobs are scoped per
//! repository, uploads are verified against their digest and size, and
//! manifests are rejected while any blob they reference is missing. Every
//! store operation is recorded in a journal, and uploads of chosen digests
//! can be made to fail, which makes the store suitable for dry runs and for
//! exercising the replication engine without a network.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use bytes::Bytes;
use oci_relay_core::error::{RelayError, Result};
use parking_lot::Mutex;

use super::digest::ContentDigest;
use super::manifest::Manifest;
use super::reference::ArtifactReference;
use super::store::{collect_stream, BlobStore, BlobStream};

/// Chunk size used when streaming stored blobs back out.
const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// One recorded store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    HeadManifest(String),
    FetchManifest(String),
    FetchBlob(ContentDigest),
    PutBlob(ContentDigest),
    PutManifest(String),
}

impl StoreOp {
    /// Whether the operation mutates the store.
    pub fn is_write(&self) -> bool {
        matches!(self, StoreOp::PutBlob(_) | StoreOp::PutManifest(_))
    }
}

/// A published manifest as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredManifest {
    pub bytes: Bytes,
    pub media_type: String,
}

#[derive(Default)]
struct MemoryState {
    /// "repository:tag" and "repository@digest" → manifest
    manifests: HashMap<String, StoredManifest>,
    blobs: HashMap<(String, ContentDigest), Bytes>,
    journal: Vec<StoreOp>,
    failing_uploads: HashSet<ContentDigest>,
}

/// In-memory content-addressed store.
pub struct MemoryStore {
    name: String,
    chunk_size: usize,
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Create an empty store answering for registry host `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Size of the chunks `fetch_blob` streams.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Seed a blob without recording a journal entry.
    pub fn insert_blob(&self, repository: &str, data: impl Into<Bytes>) -> ContentDigest {
        let data = data.into();
        let digest = ContentDigest::sha256(&data);
        self.state
            .lock()
            .blobs
            .insert((repository.to_string(), digest.clone()), data);
        digest
    }

    /// Seed a manifest without recording a journal entry.
    pub fn insert_manifest(
        &self,
        reference: &ArtifactReference,
        manifest: &Manifest,
    ) -> Result<ContentDigest> {
        let bytes = Bytes::from(manifest.to_bytes()?);
        let digest = ContentDigest::sha256(&bytes);
        let stored = StoredManifest {
            bytes,
            media_type: manifest.content_type().to_string(),
        };
        let mut state = self.state.lock();
        for key in manifest_keys(reference, &digest) {
            state.manifests.insert(key, stored.clone());
        }
        Ok(digest)
    }

    /// Blob content stored in `repository`, if any.
    pub fn blob(&self, repository: &str, digest: &ContentDigest) -> Option<Bytes> {
        self.state
            .lock()
            .blobs
            .get(&(repository.to_string(), digest.clone()))
            .cloned()
    }

    /// Manifest stored at `reference`, if any.
    pub fn manifest(&self, reference: &ArtifactReference) -> Option<StoredManifest> {
        self.state
            .lock()
            .manifests
            .get(&manifest_key(reference))
            .cloned()
    }

    /// Make every upload of `digest` fail with a `RegistryError`.
    pub fn fail_uploads_of(&self, digest: ContentDigest) {
        self.state.lock().failing_uploads.insert(digest);
    }

    /// Operations recorded so far, in call order.
    pub fn journal(&self) -> Vec<StoreOp> {
        self.state.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.state.lock().journal.clear();
    }

    fn record(&self, op: StoreOp) {
        self.state.lock().journal.push(op);
    }
}

fn manifest_key(reference: &ArtifactReference) -> String {
    match reference.digest() {
        Some(digest) => format!("{}@{}", reference.repository(), digest),
        None => format!("{}:{}", reference.repository(), reference.tag_or_digest()),
    }
}

/// Keys a manifest is addressable by: its tag (if any) and its digest.
fn manifest_keys(reference: &ArtifactReference, digest: &ContentDigest) -> Vec<String> {
    let mut keys = vec![format!("{}@{}", reference.repository(), digest)];
    if let Some(tag) = reference.tag() {
        keys.push(format!("{}:{}", reference.repository(), tag));
    }
    keys
}

#[async_trait]
impl BlobStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn head_manifest(&self, reference: &ArtifactReference) -> Result<bool> {
        self.record(StoreOp::HeadManifest(reference.to_string()));
        Ok(self
            .state
            .lock()
            .manifests
            .contains_key(&manifest_key(reference)))
    }

    async fn fetch_manifest(&self, reference: &ArtifactReference) -> Result<Manifest> {
        self.record(StoreOp::FetchManifest(reference.to_string()));
        let stored = self.manifest(reference).ok_or_else(|| RelayError::NotFound {
            reference: reference.to_string(),
        })?;
        Manifest::from_slice(&stored.bytes)
    }

    async fn fetch_blob(
        &self,
        reference: &ArtifactReference,
        digest: &ContentDigest,
    ) -> Result<BlobStream> {
        self.record(StoreOp::FetchBlob(digest.clone()));
        let data = self
            .blob(reference.repository(), digest)
            .ok_or_else(|| RelayError::NotFound {
                reference: format!("{}/{}@{}", self.name, reference.repository(), digest),
            })?;

        let chunks: Vec<Result<Bytes>> = (0..data.len())
            .step_by(self.chunk_size)
            .map(|start| Ok(data.slice(start..(start + self.chunk_size).min(data.len()))))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn put_blob(
        &self,
        reference: &ArtifactReference,
        digest: &ContentDigest,
        size: u64,
        content: BlobStream,
    ) -> Result<()> {
        self.record(StoreOp::PutBlob(digest.clone()));
        if self.state.lock().failing_uploads.contains(digest) {
            return Err(RelayError::registry(
                &self.name,
                format!("upload of {} rejected (injected failure)", digest),
            ));
        }

        let data = collect_stream(content).await?;
        if data.len() as u64 != size {
            return Err(RelayError::IntegrityError {
                digest: digest.to_string(),
                message: format!("received {} bytes, expected {}", data.len(), size),
            });
        }
        let actual = ContentDigest::sha256(&data);
        if &actual != digest {
            return Err(RelayError::IntegrityError {
                digest: digest.to_string(),
                message: format!("content hashes to {}", actual),
            });
        }

        self.state
            .lock()
            .blobs
            .insert((reference.repository().to_string(), digest.clone()), data);
        Ok(())
    }

    async fn put_manifest(
        &self,
        reference: &ArtifactReference,
        manifest: &[u8],
        media_type: &str,
    ) -> Result<()> {
        self.record(StoreOp::PutManifest(reference.to_string()));
        let parsed = Manifest::from_slice(manifest)?;

        let mut state = self.state.lock();
        let missing = parsed.descriptors().find(|d| {
            !state
                .blobs
                .contains_key(&(reference.repository().to_string(), d.digest.clone()))
        });
        if let Some(descriptor) = missing {
            return Err(RelayError::registry(
                &self.name,
                format!("manifest references unknown blob {}", descriptor.digest),
            ));
        }

        let stored = StoredManifest {
            bytes: Bytes::copy_from_slice(manifest),
            media_type: media_type.to_string(),
        };
        for key in manifest_keys(reference, &ContentDigest::sha256(manifest)) {
            state.manifests.insert(key, stored.clone());
        }
        Ok(())
    }
}
