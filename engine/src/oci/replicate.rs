//! Replication engine.
//!
//! Copies a manifest and its blobs from a source store to a target store,
//! substituting caller-supplied content for selected blobs. Target artifacts
//! are write-once: an existing target manifest short-circuits the whole call.
//!
//! The manifest is published strictly after every blob transfer succeeded,
//! so a failed or cancelled replication never leaves a manifest behind, only
//! unreferenced blobs that registry garbage collection reclaims.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use oci_relay_core::config::RelayConfig;
use oci_relay_core::error::{RelayError, Result};

use super::digest::{digest_reader, ContentDigest};
use super::manifest::{BlobDescriptor, Manifest};
use super::reference::ArtifactReference;
use super::store::{guard_idle, guard_length, reader_stream, BlobReader, BlobStore};

/// Replacement content for one source blob.
pub struct Overwrite {
    content: Box<dyn BlobReader>,
    media_type: Option<String>,
}

impl Overwrite {
    /// Replace with the content of a seekable reader.
    pub fn from_reader(reader: impl BlobReader + 'static) -> Self {
        Self {
            content: Box::new(reader),
            media_type: None,
        }
    }

    /// Replace with an in-memory buffer.
    pub fn bytes(data: impl Into<Bytes>) -> Self {
        Self::from_reader(Cursor::new(data.into()))
    }

    /// Replace with the content of a local file.
    pub async fn file(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self::from_reader(file))
    }

    /// Media type for the replacement descriptor. Defaults to the media type
    /// of the descriptor being replaced.
    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }
}

impl std::fmt::Debug for Overwrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Overwrite")
            .field("media_type", &self.media_type)
            .finish_non_exhaustive()
    }
}

/// Overwrites keyed by the digest of the source blob they replace.
///
/// Lives for one replication call and is consumed by it.
#[derive(Debug, Default)]
pub struct BlobOverwrites {
    entries: BTreeMap<ContentDigest, Overwrite>,
}

impl BlobOverwrites {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `overwrite` for the source blob `digest`, returning any
    /// overwrite previously registered for it.
    pub fn insert(&mut self, digest: ContentDigest, overwrite: Overwrite) -> Option<Overwrite> {
        self.entries.insert(digest, overwrite)
    }

    /// Builder form of [`BlobOverwrites::insert`].
    pub fn with(mut self, digest: ContentDigest, overwrite: Overwrite) -> Self {
        self.insert(digest, overwrite);
        self
    }

    pub fn contains(&self, digest: &ContentDigest) -> bool {
        self.entries.contains_key(digest)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of a replication call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationResult {
    /// The target already existed and nothing was written
    pub skipped: bool,

    /// Published target manifest (None when skipped)
    pub manifest: Option<Manifest>,

    /// Digest of the published manifest bytes (None when skipped)
    pub manifest_digest: Option<ContentDigest>,
}

impl ReplicationResult {
    pub(crate) fn skipped() -> Self {
        Self {
            skipped: true,
            manifest: None,
            manifest_digest: None,
        }
    }
}

/// One blob to place in the target repository.
enum Transfer {
    /// Stream a source blob verbatim.
    Copy(BlobDescriptor),
    /// Upload local replacement content.
    Upload {
        descriptor: BlobDescriptor,
        content: Box<dyn BlobReader>,
    },
}

impl Transfer {
    fn digest(&self) -> &ContentDigest {
        match self {
            Transfer::Copy(descriptor) => &descriptor.digest,
            Transfer::Upload { descriptor, .. } => &descriptor.digest,
        }
    }
}

/// Blob transfers and descriptor substitutions for one replication.
struct ReplicationPlan {
    transfers: Vec<Transfer>,
    replacements: BTreeMap<ContentDigest, BlobDescriptor>,
}

/// Replicates artifacts between two stores.
///
/// Holds no state beyond its store handles and configuration; every call is
/// independent.
pub struct Replicator {
    source: Arc<dyn BlobStore>,
    target: Arc<dyn BlobStore>,
    config: RelayConfig,
}

impl Replicator {
    /// Create a replicator over already-authenticated store clients.
    pub fn new(
        source: Arc<dyn BlobStore>,
        target: Arc<dyn BlobStore>,
        config: RelayConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            source,
            target,
            config,
        })
    }

    pub fn source(&self) -> &Arc<dyn BlobStore> {
        &self.source
    }

    pub fn target(&self) -> &Arc<dyn BlobStore> {
        &self.target
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Replicate `source_ref` to `target_ref`, substituting `overwrites`.
    ///
    /// Returns `skipped` without writing anything if the target manifest
    /// already exists.
    pub async fn replicate(
        &self,
        source_ref: &ArtifactReference,
        target_ref: &ArtifactReference,
        overwrites: BlobOverwrites,
    ) -> Result<ReplicationResult> {
        let work = async {
            if self.target.head_manifest(target_ref).await? {
                tracing::info!(
                    target = %target_ref,
                    "Target manifest exists, skipping replication"
                );
                return Ok(ReplicationResult::skipped());
            }

            let source_manifest = self.source.fetch_manifest(source_ref).await?;
            self.publish(source_ref, &source_manifest, target_ref, overwrites)
                .await
        };

        let result = with_deadline(
            self.config.timeout(),
            self.target.name(),
            &format!("replication of {}", target_ref),
            work,
        )
        .await;
        log_failure(source_ref, target_ref, &result);
        result
    }

    /// Replicate a source manifest the caller already fetched.
    ///
    /// Performs no existence check on the target.
    pub async fn replicate_resolved(
        &self,
        source_ref: &ArtifactReference,
        source_manifest: &Manifest,
        target_ref: &ArtifactReference,
        overwrites: BlobOverwrites,
    ) -> Result<ReplicationResult> {
        let result = with_deadline(
            self.config.timeout(),
            self.target.name(),
            &format!("replication of {}", target_ref),
            self.publish(source_ref, source_manifest, target_ref, overwrites),
        )
        .await;
        log_failure(source_ref, target_ref, &result);
        result
    }

    async fn publish(
        &self,
        source_ref: &ArtifactReference,
        source_manifest: &Manifest,
        target_ref: &ArtifactReference,
        overwrites: BlobOverwrites,
    ) -> Result<ReplicationResult> {
        tracing::info!(
            source = %source_ref,
            target = %target_ref,
            overwrites = overwrites.len(),
            "Replicating artifact"
        );

        let plan = self.plan(source_manifest, overwrites).await?;

        futures::stream::iter(plan.transfers.into_iter().map(Ok::<_, RelayError>))
            .try_for_each_concurrent(self.config.max_concurrent_blobs, |transfer| {
                self.transfer(source_ref, target_ref, transfer)
            })
            .await?;

        let manifest = source_manifest.with_substitutions(&plan.replacements);
        let bytes = manifest.to_bytes()?;
        let digest = ContentDigest::sha256(&bytes);
        self.target
            .put_manifest(target_ref, &bytes, manifest.content_type())
            .await?;

        tracing::info!(target = %target_ref, digest = %digest, "Published manifest");
        Ok(ReplicationResult {
            skipped: false,
            manifest: Some(manifest),
            manifest_digest: Some(digest),
        })
    }

    /// Digest every overwrite and list the blobs to transfer, once per
    /// distinct target digest, in manifest order.
    async fn plan(
        &self,
        source_manifest: &Manifest,
        overwrites: BlobOverwrites,
    ) -> Result<ReplicationPlan> {
        let unmatched: Vec<String> = overwrites
            .entries
            .keys()
            .filter(|digest| source_manifest.find(digest).is_none())
            .map(|digest| digest.to_string())
            .collect();
        if !unmatched.is_empty() {
            return Err(RelayError::ConfigError(format!(
                "Overwrites reference blobs absent from the source manifest: {}",
                unmatched.join(", ")
            )));
        }

        let mut replacements = BTreeMap::new();
        let mut pending = BTreeMap::new();
        for (source_digest, overwrite) in overwrites.entries {
            let Some(original) = source_manifest.find(&source_digest) else {
                continue;
            };
            let mut content = overwrite.content;
            let digested = digest_reader(&mut content, self.config.chunk_size).await?;

            let mut descriptor = BlobDescriptor::new(
                overwrite
                    .media_type
                    .unwrap_or_else(|| original.media_type.clone()),
                digested.digest,
                digested.size,
            );
            descriptor.annotations = original.annotations.clone();

            tracing::debug!(
                source_digest = %source_digest,
                digest = %descriptor.digest,
                size = descriptor.size,
                "Planned blob overwrite"
            );
            replacements.insert(source_digest.clone(), descriptor.clone());
            pending.insert(source_digest, (descriptor, content));
        }

        let mut seen = BTreeSet::new();
        let mut transfers = Vec::new();
        for original in source_manifest.descriptors() {
            let target_digest = replacements
                .get(&original.digest)
                .map_or(&original.digest, |d| &d.digest);
            if !seen.insert(target_digest.clone()) {
                continue;
            }
            match pending.remove(&original.digest) {
                Some((descriptor, content)) => {
                    transfers.push(Transfer::Upload {
                        descriptor,
                        content,
                    });
                }
                None => transfers.push(Transfer::Copy(original.clone())),
            }
        }

        Ok(ReplicationPlan {
            transfers,
            replacements,
        })
    }

    /// Move one blob into the target repository.
    ///
    /// Copies are bounded by the idle timeout: opening the source blob and
    /// every wait for its next chunk must finish within the limit, while the
    /// transfer as a whole may take as long as it keeps making progress.
    async fn transfer(
        &self,
        source_ref: &ArtifactReference,
        target_ref: &ArtifactReference,
        transfer: Transfer,
    ) -> Result<()> {
        let digest = transfer.digest().clone();
        let idle = self.config.blob_idle_timeout();
        match transfer {
            Transfer::Copy(descriptor) => {
                tracing::debug!(digest = %digest, size = descriptor.size, "Copying blob");
                let stream = with_deadline(
                    idle,
                    self.source.name(),
                    &format!("opening blob {}", digest),
                    self.source.fetch_blob(source_ref, &digest),
                )
                .await?;
                let stream = guard_idle(stream, idle, self.source.name(), &digest);
                let guarded = guard_length(stream, digest.clone(), descriptor.size);
                self.target
                    .put_blob(target_ref, &digest, descriptor.size, guarded)
                    .await
            }
            Transfer::Upload {
                descriptor,
                content,
            } => {
                tracing::debug!(
                    digest = %digest,
                    size = descriptor.size,
                    "Uploading replacement blob"
                );
                let stream = reader_stream(content, self.config.chunk_size);
                self.target
                    .put_blob(target_ref, &digest, descriptor.size, stream)
                    .await
            }
        }
    }
}

/// Run `work`, failing with `RegistryError` once `limit` elapses.
pub(crate) async fn with_deadline<T, F>(
    limit: Option<Duration>,
    registry: &str,
    what: &str,
    work: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let Some(limit) = limit else {
        return work.await;
    };
    match tokio::time::timeout(limit, work).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::registry(
            registry,
            format!("{} timed out after {}s", what, limit.as_secs()),
        )),
    }
}

fn log_failure(
    source_ref: &ArtifactReference,
    target_ref: &ArtifactReference,
    result: &Result<ReplicationResult>,
) {
    if let Err(e) = result {
        tracing::warn!(
            source = %source_ref,
            target = %target_ref,
            retryable = e.is_retryable(),
            error = %e,
            "Replication aborted"
        );
    }
}
