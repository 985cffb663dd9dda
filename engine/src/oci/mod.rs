//! OCI artifact replication.
//!
//! Provides:
//! - Content digests and streaming digest computation
//! - Artifact reference parsing
//! - Manifest parsing and deterministic serialization
//! - The `BlobStore` abstraction with registry and in-memory implementations
//! - The replication engine with blob substitution

pub mod digest;
pub mod manifest;
pub mod memory;
pub mod reference;
pub mod registry;
pub mod replicate;
pub mod store;

pub use digest::{digest_reader, ContentDigest, DigestAlgorithm, DigestedContent};
pub use manifest::{BlobDescriptor, Manifest};
pub use memory::{MemoryStore, StoreOp, StoredManifest};
pub use reference::ArtifactReference;
pub use registry::{RegistryAuth, RegistryClient};
pub use replicate::{BlobOverwrites, Overwrite, ReplicationResult, Replicator};
pub use store::{BlobReader, BlobStore, BlobStream};
