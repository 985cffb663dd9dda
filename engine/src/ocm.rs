//! OCM component-descriptor replication.
//!
//! An OCM component version is stored as an OCI artifact whose config blob
//! points at a layer holding the component descriptor, a tar archive with a
//! single `component-descriptor.yaml`. Replicating a component with a
//! patched descriptor swaps both of those blobs and copies every other blob
//! verbatim.

use std::io::Read;
use std::path::Path;

use oci_relay_core::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::oci::digest::ContentDigest;
use crate::oci::manifest::BlobDescriptor;
use crate::oci::reference::ArtifactReference;
use crate::oci::replicate::{
    with_deadline, BlobOverwrites, Overwrite, ReplicationResult, Replicator,
};
use crate::oci::store::collect_stream;

/// Media type of the tar layer carrying the component descriptor.
pub const COMPONENT_DESCRIPTOR_MEDIA_TYPE: &str =
    "application/vnd.gardener.cloud.cnudie.component-descriptor.v2+yaml+tar";

/// Media type of the component config blob.
pub const COMPONENT_CONFIG_MEDIA_TYPE: &str =
    "application/vnd.gardener.cloud.cnudie.component.config.v1+json";

/// File name of the descriptor inside its tar layer.
const COMPONENT_DESCRIPTOR_FILE: &str = "component-descriptor.yaml";

/// Repository path segment below which component versions live.
const COMPONENT_DESCRIPTORS_PREFIX: &str = "component-descriptors";

/// An OCI registry location holding OCM component versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcmRepository {
    base_url: String,
}

impl OcmRepository {
    /// e.g. `europe-docker.pkg.dev/gardener-project/releases`, with or
    /// without a scheme.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `<base>/component-descriptors/<lower(name)>:<version>`
    pub fn component_version_ref(&self, name: &str, version: &str) -> Result<ArtifactReference> {
        let base = self.base_url.trim();
        let base = base
            .strip_prefix("https://")
            .or_else(|| base.strip_prefix("http://"))
            .unwrap_or(base)
            .trim_end_matches('/');
        if base.is_empty() {
            return Err(RelayError::ConfigError(
                "OCM repository has an empty base URL".to_string(),
            ));
        }

        ArtifactReference::parse(&format!(
            "{}/{}/{}:{}",
            base,
            COMPONENT_DESCRIPTORS_PREFIX,
            name.to_lowercase(),
            version
        ))
    }
}

/// A component descriptor document.
///
/// Only `component.name`, `component.version` and
/// `component.repositoryContexts` are interpreted; everything else is
/// carried through unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentDescriptor {
    name: String,
    version: String,
    document: Value,
}

impl ComponentDescriptor {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::from_value(serde_yaml::from_str(yaml)?)
    }

    pub fn from_value(document: Value) -> Result<Self> {
        let field = |key: &str| {
            document
                .get("component")
                .and_then(|c| c.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    RelayError::SerializationError(format!(
                        "Component descriptor lacks component.{}",
                        key
                    ))
                })
        };
        let name = field("name")?;
        let version = field("version")?;

        Ok(Self {
            name,
            version,
            document,
        })
    }

    /// Read the descriptor out of its tar layer.
    pub fn from_tar(data: &[u8]) -> Result<Self> {
        let mut archive = tar::Archive::new(data);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();
            if path.as_path() == Path::new(COMPONENT_DESCRIPTOR_FILE) {
                let mut yaml = String::new();
                entry.read_to_string(&mut yaml)?;
                return Self::from_yaml(&yaml);
            }
        }
        Err(RelayError::SerializationError(format!(
            "Archive contains no {}",
            COMPONENT_DESCRIPTOR_FILE
        )))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    /// OCI repository contexts, oldest first.
    pub fn repository_contexts(&self) -> Vec<OcmRepository> {
        self.document
            .get("component")
            .and_then(|c| c.get("repositoryContexts"))
            .and_then(Value::as_sequence)
            .map(|contexts| {
                contexts
                    .iter()
                    .filter_map(|ctx| ctx.get("baseUrl").and_then(Value::as_str))
                    .map(OcmRepository::new)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The repository the component currently lives in: the last context.
    pub fn current_repository(&self) -> Option<OcmRepository> {
        self.repository_contexts().pop()
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.document)?)
    }

    /// Pack the descriptor into its tar layer.
    ///
    /// The entry carries a fixed mode and mtime so equal descriptors yield
    /// equal digests.
    pub fn to_tar(&self) -> Result<Vec<u8>> {
        let yaml = self.to_yaml()?;
        let mut header = tar::Header::new_gnu();
        header.set_size(yaml.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);

        let mut builder = tar::Builder::new(Vec::new());
        builder.append_data(&mut header, COMPONENT_DESCRIPTOR_FILE, yaml.as_bytes())?;
        Ok(builder.into_inner()?)
    }
}

/// Config blob of a component version artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDescriptorConfig {
    pub component_descriptor_layer: BlobDescriptor,
}

/// Replicate component version `name:version` from `source_repository` into
/// the patched descriptor's current repository, replacing the stored
/// descriptor with `patched`.
///
/// Existing target component versions are never overwritten. The whole
/// call, lookups included, runs under the replicator's `timeout_secs`.
pub async fn replicate_patched_component(
    replicator: &Replicator,
    source_repository: &OcmRepository,
    name: &str,
    version: &str,
    patched: &ComponentDescriptor,
) -> Result<ReplicationResult> {
    let target_repository = patched.current_repository().ok_or_else(|| {
        RelayError::ConfigError(format!(
            "Component {} has no repository context",
            patched.name()
        ))
    })?;
    let target_ref = target_repository.component_version_ref(patched.name(), patched.version())?;
    let source_ref = source_repository.component_version_ref(name, version)?;

    with_deadline(
        replicator.config().timeout(),
        replicator.target().name(),
        &format!("replication of {}", target_ref),
        replicate_component(replicator, &source_ref, &target_ref, patched),
    )
    .await
}

async fn replicate_component(
    replicator: &Replicator,
    source_ref: &ArtifactReference,
    target_ref: &ArtifactReference,
    patched: &ComponentDescriptor,
) -> Result<ReplicationResult> {
    if replicator.target().head_manifest(target_ref).await? {
        tracing::info!(target = %target_ref, "Component version exists, skipping replication");
        return Ok(ReplicationResult::skipped());
    }

    let source_manifest = replicator.source().fetch_manifest(source_ref).await?;

    let config_blob = replicator
        .source()
        .fetch_blob(source_ref, &source_manifest.config.digest)
        .await?;
    let source_config: ComponentDescriptorConfig =
        serde_json::from_slice(&collect_stream(config_blob).await?)?;

    let descriptor_tar = patched.to_tar()?;
    let config = ComponentDescriptorConfig {
        component_descriptor_layer: BlobDescriptor::new(
            COMPONENT_DESCRIPTOR_MEDIA_TYPE,
            ContentDigest::sha256(&descriptor_tar),
            descriptor_tar.len() as u64,
        ),
    };
    let config_json = serde_json::to_vec(&config)?;

    tracing::debug!(
        source = %source_ref,
        descriptor_layer = %config.component_descriptor_layer.digest,
        "Patching component descriptor"
    );

    let overwrites = BlobOverwrites::new()
        .with(
            source_config.component_descriptor_layer.digest,
            Overwrite::bytes(descriptor_tar).with_media_type(COMPONENT_DESCRIPTOR_MEDIA_TYPE),
        )
        .with(
            source_manifest.config.digest.clone(),
            Overwrite::bytes(config_json),
        );

    replicator
        .replicate_resolved(source_ref, &source_manifest, target_ref, overwrites)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::manifest::Manifest;
    use crate::oci::memory::{MemoryStore, StoreOp};
    use crate::oci::store::{BlobStore, BlobStream};
    use oci_relay_core::config::RelayConfig;
    use std::sync::Arc;

    const DESCRIPTOR: &str = r#"
meta:
  schemaVersion: v2
component:
  name: github.com/Gardener/Example
  version: 1.2.3
  provider: internal
  repositoryContexts:
  - type: ociRegistry
    baseUrl: https://source.example.com/releases
  - type: ociRegistry
    baseUrl: target.example.com/mirror
  resources: []
  sources: []
  componentReferences: []
"#;

    const SOURCE_REPO: &str = "releases/component-descriptors/github.com/gardener/example";
    const TARGET_REPO: &str = "mirror/component-descriptors/github.com/gardener/example";

    fn descriptor() -> ComponentDescriptor {
        ComponentDescriptor::from_yaml(DESCRIPTOR).unwrap()
    }

    /// Seed `store` with a component version built from `DESCRIPTOR` plus one
    /// resource layer.
    fn seed_component(store: &MemoryStore) -> Manifest {
        let upstream = DESCRIPTOR.replace("provider: internal", "provider: upstream");
        let original = ComponentDescriptor::from_yaml(&upstream).unwrap();
        let tar = original.to_tar().unwrap();
        let tar_len = tar.len() as u64;
        let layer_digest = store.insert_blob(SOURCE_REPO, tar);
        let layer = BlobDescriptor::new(COMPONENT_DESCRIPTOR_MEDIA_TYPE, layer_digest, tar_len);

        let config = serde_json::to_vec(&ComponentDescriptorConfig {
            component_descriptor_layer: layer.clone(),
        })
        .unwrap();
        let config_len = config.len() as u64;
        let config_digest = store.insert_blob(SOURCE_REPO, config);

        let resource_digest = store.insert_blob(SOURCE_REPO, &b"resource-bytes"[..]);
        let manifest = Manifest::new(
            BlobDescriptor::new(COMPONENT_CONFIG_MEDIA_TYPE, config_digest, config_len),
            vec![
                layer,
                BlobDescriptor::new("application/octet-stream", resource_digest, 14),
            ],
        );
        let source_ref = OcmRepository::new("source.example.com/releases")
            .component_version_ref("github.com/Gardener/Example", "1.2.3")
            .unwrap();
        store.insert_manifest(&source_ref, &manifest).unwrap();
        manifest
    }

    #[test]
    fn test_component_version_ref() {
        let repo = OcmRepository::new("https://europe-docker.pkg.dev/gardener-project/releases/");
        let r = repo
            .component_version_ref("github.com/Gardener/Gardener", "v1.80.0")
            .unwrap();
        assert_eq!(r.registry(), "europe-docker.pkg.dev");
        assert_eq!(
            r.repository(),
            "gardener-project/releases/component-descriptors/github.com/gardener/gardener"
        );
        assert_eq!(r.tag(), Some("v1.80.0"));
    }

    #[test]
    fn test_component_version_ref_rejects_empty_base() {
        let err = OcmRepository::new("https://")
            .component_version_ref("a", "1.0")
            .unwrap_err();
        assert!(matches!(err, RelayError::ConfigError(_)));
    }

    #[test]
    fn test_descriptor_fields() {
        let cd = descriptor();
        assert_eq!(cd.name(), "github.com/Gardener/Example");
        assert_eq!(cd.version(), "1.2.3");
        assert_eq!(cd.repository_contexts().len(), 2);
        assert_eq!(
            cd.current_repository(),
            Some(OcmRepository::new("target.example.com/mirror"))
        );
    }

    #[test]
    fn test_descriptor_requires_name() {
        let err = ComponentDescriptor::from_yaml("component:\n  version: 1.0.0\n").unwrap_err();
        assert!(matches!(err, RelayError::SerializationError(_)));
    }

    #[test]
    fn test_descriptor_without_contexts() {
        let cd = ComponentDescriptor::from_yaml("component:\n  name: a\n  version: '1'\n").unwrap();
        assert!(cd.current_repository().is_none());
    }

    #[test]
    fn test_tar_is_reproducible_and_readable() {
        let cd = descriptor();
        let first = cd.to_tar().unwrap();
        assert_eq!(first, cd.to_tar().unwrap());
        assert_eq!(ComponentDescriptor::from_tar(&first).unwrap(), cd);
    }

    #[test]
    fn test_from_tar_without_descriptor() {
        let mut header = tar::Header::new_gnu();
        header.set_size(2);
        let mut builder = tar::Builder::new(Vec::new());
        builder.append_data(&mut header, "other.txt", &b"hi"[..]).unwrap();
        let data = builder.into_inner().unwrap();
        assert!(matches!(
            ComponentDescriptor::from_tar(&data),
            Err(RelayError::SerializationError(_))
        ));
    }

    #[tokio::test]
    async fn test_replicate_patched_component() {
        let source = Arc::new(MemoryStore::new("source.example.com"));
        let target = Arc::new(MemoryStore::new("target.example.com"));
        let source_manifest = seed_component(&source);
        let replicator =
            Replicator::new(source.clone(), target.clone(), RelayConfig::default()).unwrap();
        let patched = descriptor();

        let result = replicate_patched_component(
            &replicator,
            &OcmRepository::new("https://source.example.com/releases"),
            "github.com/Gardener/Example",
            "1.2.3",
            &patched,
        )
        .await
        .unwrap();
        assert!(!result.skipped);

        let manifest = result.manifest.unwrap();
        assert_eq!(manifest.layers.len(), 2);
        assert_eq!(manifest.layers[1], source_manifest.layers[1]);
        assert_ne!(manifest.config.digest, source_manifest.config.digest);
        assert_eq!(manifest.config.media_type, COMPONENT_CONFIG_MEDIA_TYPE);

        let config_bytes = target.blob(TARGET_REPO, &manifest.config.digest).unwrap();
        let config: ComponentDescriptorConfig = serde_json::from_slice(&config_bytes).unwrap();
        assert_eq!(config.component_descriptor_layer, manifest.layers[0]);

        let tar = target.blob(TARGET_REPO, &manifest.layers[0].digest).unwrap();
        assert_eq!(ComponentDescriptor::from_tar(&tar).unwrap(), patched);
        assert!(target
            .blob(TARGET_REPO, &source_manifest.layers[1].digest)
            .is_some());
    }

    #[tokio::test]
    async fn test_replicate_patched_component_skips_existing() {
        let source = Arc::new(MemoryStore::new("source.example.com"));
        let target = Arc::new(MemoryStore::new("target.example.com"));
        seed_component(&source);
        let replicator =
            Replicator::new(source.clone(), target.clone(), RelayConfig::default()).unwrap();
        let source_repository = OcmRepository::new("source.example.com/releases");

        replicate_patched_component(
            &replicator,
            &source_repository,
            "github.com/Gardener/Example",
            "1.2.3",
            &descriptor(),
        )
        .await
        .unwrap();
        target.clear_journal();
        source.clear_journal();

        let again = replicate_patched_component(
            &replicator,
            &source_repository,
            "github.com/Gardener/Example",
            "1.2.3",
            &descriptor(),
        )
        .await
        .unwrap();
        assert!(again.skipped);
        assert!(target.journal().iter().all(|op| !op.is_write()));
        assert!(source.journal().is_empty());
    }

    #[tokio::test]
    async fn test_replicate_patched_component_missing_source() {
        let source = Arc::new(MemoryStore::new("source.example.com"));
        let target = Arc::new(MemoryStore::new("target.example.com"));
        let replicator = Replicator::new(source, target.clone(), RelayConfig::default()).unwrap();

        let err = replicate_patched_component(
            &replicator,
            &OcmRepository::new("source.example.com/releases"),
            "github.com/Gardener/Example",
            "1.2.3",
            &descriptor(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RelayError::NotFound { .. }));
        assert_eq!(
            target.journal(),
            vec![StoreOp::HeadManifest(format!(
                "target.example.com/{}:1.2.3",
                TARGET_REPO
            ))]
        );
    }

    /// Delegates to a `MemoryStore` but never answers manifest fetches.
    struct StalledManifests(Arc<MemoryStore>);

    #[async_trait::async_trait]
    impl BlobStore for StalledManifests {
        fn name(&self) -> &str {
            self.0.name()
        }

        async fn head_manifest(&self, reference: &ArtifactReference) -> Result<bool> {
            self.0.head_manifest(reference).await
        }

        async fn fetch_manifest(&self, _reference: &ArtifactReference) -> Result<Manifest> {
            futures::future::pending().await
        }

        async fn fetch_blob(
            &self,
            reference: &ArtifactReference,
            digest: &ContentDigest,
        ) -> Result<BlobStream> {
            self.0.fetch_blob(reference, digest).await
        }

        async fn put_blob(
            &self,
            reference: &ArtifactReference,
            digest: &ContentDigest,
            size: u64,
            content: BlobStream,
        ) -> Result<()> {
            self.0.put_blob(reference, digest, size, content).await
        }

        async fn put_manifest(
            &self,
            reference: &ArtifactReference,
            manifest: &[u8],
            media_type: &str,
        ) -> Result<()> {
            self.0.put_manifest(reference, manifest, media_type).await
        }
    }

    #[tokio::test]
    async fn test_replicate_patched_component_lookups_honor_timeout() {
        let memory = Arc::new(MemoryStore::new("source.example.com"));
        seed_component(&memory);
        let target = Arc::new(MemoryStore::new("target.example.com"));
        let config = RelayConfig {
            timeout_secs: 1,
            ..Default::default()
        };
        let source = Arc::new(StalledManifests(memory));
        let replicator = Replicator::new(source, target.clone(), config).unwrap();

        let err = replicate_patched_component(
            &replicator,
            &OcmRepository::new("source.example.com/releases"),
            "github.com/Gardener/Example",
            "1.2.3",
            &descriptor(),
        )
        .await
        .unwrap_err();

        assert!(err.is_retryable());
        assert!(err.to_string().contains("timed out after 1s"));
        assert!(target.journal().iter().all(|op| !op.is_write()));
    }
}
