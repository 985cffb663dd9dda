//! OCI manifest model.
//!
//! Parses raw manifest bytes into a config descriptor plus ordered layer
//! descriptors and serializes them back. Serialization is deterministic:
//! fields are emitted in declaration order and maps are ordered, so the same
//! `Manifest` always yields the same bytes (and therefore the same digest).

use std::collections::BTreeMap;

use oci_relay_core::error::{RelayError, Result};
use serde::{Deserialize, Serialize};

use super::digest::ContentDigest;

/// OCI image manifest media type.
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Docker v2 schema 2 manifest media type.
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

/// OCI image index media type (not replicated, see [`Manifest::from_slice`]).
pub const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// Docker manifest list media type (not replicated).
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Manifest media types the engine can replicate.
pub const SUPPORTED_MANIFEST_MEDIA_TYPES: &[&str] =
    &[OCI_MANIFEST_MEDIA_TYPE, DOCKER_MANIFEST_MEDIA_TYPE];

/// Reference to a blob: digest, size and media type.
///
/// `size` must equal the byte length of the content `digest` was computed
/// over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobDescriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,

    pub digest: ContentDigest,

    pub size: u64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl BlobDescriptor {
    pub fn new(media_type: impl Into<String>, digest: ContentDigest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            urls: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }
}

/// Image manifest: one config blob and ordered layer blobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    #[serde(rename = "artifactType", default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,

    pub config: BlobDescriptor,

    /// Layers, in order (bottom to top)
    pub layers: Vec<BlobDescriptor>,

    /// Referrers pointer; carried verbatim, never copied as a blob
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<BlobDescriptor>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Manifest {
    /// Create an OCI image manifest.
    pub fn new(config: BlobDescriptor, layers: Vec<BlobDescriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(OCI_MANIFEST_MEDIA_TYPE.to_string()),
            artifact_type: None,
            config,
            layers,
            subject: None,
            annotations: BTreeMap::new(),
        }
    }

    /// Parse raw manifest bytes.
    ///
    /// Image indexes and manifest lists are rejected with `ConfigError`.
    /// They are not copied verbatim either: an index references child
    /// manifests rather than blobs, so a verbatim copy would publish an
    /// index whose children are missing from the target. Replicate each
    /// platform manifest by its own reference instead.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_slice(bytes)?;

        let media_type = raw.get("mediaType").and_then(|v| v.as_str());
        let is_index = raw.get("manifests").is_some()
            || matches!(
                media_type,
                Some(OCI_INDEX_MEDIA_TYPE) | Some(DOCKER_MANIFEST_LIST_MEDIA_TYPE)
            );
        if is_index {
            return Err(RelayError::ConfigError(
                "Image indexes and manifest lists cannot be replicated; \
                 reference a single-platform manifest instead"
                    .to_string(),
            ));
        }

        let manifest: Manifest = serde_json::from_value(raw)?;
        if manifest.schema_version != 2 {
            return Err(RelayError::SerializationError(format!(
                "Unsupported manifest schemaVersion {}",
                manifest.schema_version
            )));
        }
        Ok(manifest)
    }

    /// Canonical bytes for publication.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Digest of [`Manifest::to_bytes`].
    pub fn digest(&self) -> Result<ContentDigest> {
        Ok(ContentDigest::sha256(&self.to_bytes()?))
    }

    /// Content type to publish the manifest with.
    pub fn content_type(&self) -> &str {
        self.media_type.as_deref().unwrap_or(OCI_MANIFEST_MEDIA_TYPE)
    }

    /// Config descriptor followed by layer descriptors, in order.
    pub fn descriptors(&self) -> impl Iterator<Item = &BlobDescriptor> {
        std::iter::once(&self.config).chain(self.layers.iter())
    }

    /// First descriptor (config or layer) with `digest`.
    pub fn find(&self, digest: &ContentDigest) -> Option<&BlobDescriptor> {
        self.descriptors().find(|d| &d.digest == digest)
    }

    /// Copy of this manifest where every descriptor whose digest is a key of
    /// `replacements` is swapped for the mapped descriptor, in place.
    pub fn with_substitutions(
        &self,
        replacements: &BTreeMap<ContentDigest, BlobDescriptor>,
    ) -> Manifest {
        let substitute = |descriptor: &BlobDescriptor| {
            replacements
                .get(&descriptor.digest)
                .cloned()
                .unwrap_or_else(|| descriptor.clone())
        };

        Manifest {
            config: substitute(&self.config),
            layers: self.layers.iter().map(substitute).collect(),
            ..self.clone()
        }
    }
}
