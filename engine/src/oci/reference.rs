//! OCI artifact reference parsing.
//!
//! Parses references like `ghcr.io/org/app:v1.2.0` into structured components.

use oci_relay_core::error::{RelayError, Result};

use super::digest::ContentDigest;

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when neither tag nor digest is specified.
const DEFAULT_TAG: &str = "latest";

/// Maximum tag length registries accept.
const MAX_TAG_LEN: usize = 128;

/// Normalized reference to an artifact in a registry.
///
/// Immutable once constructed. Two references are equal iff their normalized
/// forms are byte-identical.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<ContentDigest>,
}

impl ArtifactReference {
    /// Parse a reference string.
    ///
    /// Supports formats:
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `org/app:1.0` → docker.io/org/app:1.0
    /// - `ghcr.io/org/app:tag` → ghcr.io/org/app:tag
    /// - `localhost:5000/app@sha256:...` → localhost:5000/app@sha256:...
    /// - `ghcr.io/org/app:tag@sha256:...` (tag kept, digest wins for lookups)
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(RelayError::ConfigError(
                "Empty artifact reference".to_string(),
            ));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name_tag, digest)) => (name_tag, Some(ContentDigest::parse(digest)?)),
            None => (reference, None),
        };

        // A tag separator can only follow the last path component, otherwise
        // the colon belongs to a registry port.
        let last_component_start = name_tag.rfind('/').map_or(0, |pos| pos + 1);
        let (name, tag) = match name_tag[last_component_start..].rfind(':') {
            Some(colon) => {
                let colon = last_component_start + colon;
                (&name_tag[..colon], Some(name_tag[colon + 1..].to_string()))
            }
            None => (name_tag, None),
        };

        let (registry, repository) = split_registry_repository(name)?;

        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Self::build(registry, repository, tag, digest)
    }

    /// Reference `registry/repository:tag`.
    pub fn with_tag(registry: &str, repository: &str, tag: &str) -> Result<Self> {
        Self::build(
            registry.to_string(),
            repository.to_string(),
            Some(tag.to_string()),
            None,
        )
    }

    /// Reference `registry/repository@digest`.
    pub fn with_digest(registry: &str, repository: &str, digest: ContentDigest) -> Result<Self> {
        Self::build(
            registry.to_string(),
            repository.to_string(),
            None,
            Some(digest),
        )
    }

    fn build(
        registry: String,
        repository: String,
        tag: Option<String>,
        digest: Option<ContentDigest>,
    ) -> Result<Self> {
        let registry = registry.trim().to_ascii_lowercase();
        if registry.is_empty() {
            return Err(RelayError::ConfigError("Empty registry host".to_string()));
        }
        validate_repository(&repository)?;
        if let Some(ref tag) = tag {
            validate_tag(tag)?;
        }
        if tag.is_none() && digest.is_none() {
            return Err(RelayError::ConfigError(format!(
                "Reference '{}/{}' has neither tag nor digest",
                registry, repository
            )));
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Registry host, lower-cased (e.g., "ghcr.io", "localhost:5000").
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Repository path (e.g., "org/app").
    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&ContentDigest> {
        self.digest.as_ref()
    }

    /// The manifest selector used in registry URLs; a digest wins over a tag.
    pub fn tag_or_digest(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => tag.clone(),
            (None, None) => DEFAULT_TAG.to_string(),
        }
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(&digest.to_string());
        }
        s
    }
}

impl std::fmt::Display for ArtifactReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

impl std::str::FromStr for ArtifactReference {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Split a name into registry and repository components.
fn split_registry_repository(name: &str) -> Result<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            return Ok((first.to_string(), rest.to_string()));
        }
    }

    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };
    Ok((DEFAULT_REGISTRY.to_string(), repository))
}

fn validate_repository(repository: &str) -> Result<()> {
    let valid_component = |component: &str| {
        component
            .bytes()
            .next()
            .map_or(false, |b| b.is_ascii_lowercase() || b.is_ascii_digit())
            && component
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"._-".contains(&b))
    };

    if repository.is_empty() || !repository.split('/').all(valid_component) {
        return Err(RelayError::ConfigError(format!(
            "Invalid repository name '{}'",
            repository
        )));
    }
    Ok(())
}

fn validate_tag(tag: &str) -> Result<()> {
    let mut bytes = tag.bytes();
    let valid = tag.len() <= MAX_TAG_LEN
        && bytes
            .next()
            .map_or(false, |b| b.is_ascii_alphanumeric() || b == b'_')
        && bytes.all(|b| b.is_ascii_alphanumeric() || b"_.-".contains(&b));

    if !valid {
        return Err(RelayError::ConfigError(format!("Invalid tag '{}'", tag)));
    }
    Ok(())
}
