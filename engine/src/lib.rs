//! oci-relay Engine
//!
//! Replicates OCI artifacts between registries while substituting selected
//! blobs with locally supplied content.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use oci_relay_core::RelayConfig;
//! use oci_relay_engine::{
//!     ArtifactReference, BlobOverwrites, Overwrite, RegistryAuth, RegistryClient, Replicator,
//! };
//!
//! # async fn run() -> oci_relay_core::Result<()> {
//! let config = RelayConfig::default();
//! let source = RegistryClient::new("ghcr.io", &RegistryAuth::anonymous(), &config)?;
//! let target = RegistryClient::new("registry.example.com", &RegistryAuth::from_env(), &config)?;
//! let replicator = Replicator::new(Arc::new(source), Arc::new(target), config)?;
//!
//! let source_ref = ArtifactReference::parse("ghcr.io/org/app:1.0.0")?;
//! let target_ref = ArtifactReference::parse("registry.example.com/mirror/app:1.0.0")?;
//! let source_manifest = replicator.source().fetch_manifest(&source_ref).await?;
//!
//! let overwrites = BlobOverwrites::new()
//!     .with(source_manifest.config.digest.clone(), Overwrite::bytes(&b"{}"[..]));
//! let result = replicator.replicate(&source_ref, &target_ref, overwrites).await?;
//! println!("skipped: {}", result.skipped);
//! # Ok(())
//! # }
//! ```

pub mod oci;
pub mod ocm;

pub use oci::{
    ArtifactReference, BlobDescriptor, BlobOverwrites, BlobStore, ContentDigest, Manifest,
    MemoryStore, Overwrite, RegistryAuth, RegistryClient, ReplicationResult, Replicator,
};
pub use ocm::{replicate_patched_component, ComponentDescriptor, OcmRepository};

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
