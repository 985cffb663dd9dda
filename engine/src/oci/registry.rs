//! OCI registry client.
//!
//! Implements [`BlobStore`] over the distribution HTTP API using `reqwest`.
//! Credentials are attached once, as a default `Authorization` header, when
//! the client is built; token challenge flows are left to whoever builds a
//! pre-authenticated `reqwest::Client` and hands it to
//! [`RegistryClient::with_client`].

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use oci_relay_core::config::RelayConfig;
use oci_relay_core::error::{RelayError, Result};
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION,
};
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;

use super::digest::ContentDigest;
use super::manifest::{Manifest, SUPPORTED_MANIFEST_MEDIA_TYPES};
use super::reference::ArtifactReference;
use super::store::{BlobStore, BlobStream};

/// Chunks buffered between the upload source and the request body.
const UPLOAD_BUFFER_CHUNKS: usize = 4;

/// Distribution error codes that mean the uploaded bytes did not match.
const INTEGRITY_ERROR_CODES: &[&str] = &["DIGEST_INVALID", "SIZE_INVALID", "BLOB_UPLOAD_INVALID"];

/// Authentication credentials for a container registry.
#[derive(Clone)]
pub enum RegistryAuth {
    Anonymous,
    Basic { username: String, password: String },
    Bearer(String),
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        RegistryAuth::Anonymous
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        RegistryAuth::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Use an already-issued bearer token.
    pub fn bearer(token: impl Into<String>) -> Self {
        RegistryAuth::Bearer(token.into())
    }

    /// Create authentication from environment variables.
    ///
    /// Reads `REGISTRY_TOKEN`, then `REGISTRY_USERNAME` and
    /// `REGISTRY_PASSWORD`. Falls back to anonymous if not set.
    pub fn from_env() -> Self {
        if let Ok(token) = std::env::var("REGISTRY_TOKEN") {
            return Self::bearer(token);
        }
        match (
            std::env::var("REGISTRY_USERNAME"),
            std::env::var("REGISTRY_PASSWORD"),
        ) {
            (Ok(username), Ok(password)) => Self::basic(username, password),
            _ => Self::anonymous(),
        }
    }

    /// `Authorization` header value, if any.
    fn header_value(&self) -> Result<Option<HeaderValue>> {
        let raw = match self {
            RegistryAuth::Anonymous => return Ok(None),
            RegistryAuth::Basic { username, password } => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", username, password));
                format!("Basic {}", encoded)
            }
            RegistryAuth::Bearer(token) => format!("Bearer {}", token),
        };
        let mut value = HeaderValue::from_str(&raw).map_err(|_| {
            RelayError::ConfigError("Registry credentials contain invalid characters".to_string())
        })?;
        value.set_sensitive(true);
        Ok(Some(value))
    }
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryAuth::Anonymous => write!(f, "Anonymous"),
            RegistryAuth::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            RegistryAuth::Bearer(_) => write!(f, "Bearer(<redacted>)"),
        }
    }
}

/// Error document returned by registries.
#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    errors: Vec<ErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct ErrorEntry {
    code: String,
    #[serde(default)]
    message: String,
}

/// Blob store backed by a remote OCI registry.
pub struct RegistryClient {
    registry: String,
    base_url: String,
    client: Client,
}

impl RegistryClient {
    /// Build a client for `registry` that sends `auth` with every request.
    pub fn new(registry: &str, auth: &RegistryAuth, config: &RelayConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(value) = auth.header_value()? {
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = Client::builder()
            .default_headers(headers)
            .user_agent(concat!("oci-relay/", env!("CARGO_PKG_VERSION")));
        if let Some(timeout) = config.connect_timeout() {
            builder = builder.connect_timeout(timeout);
        }
        let client = builder.build().map_err(|e| {
            RelayError::registry(registry, format!("Failed to build HTTP client: {}", e))
        })?;

        Ok(Self::with_client(registry, client, config))
    }

    /// Wrap a pre-authenticated HTTP client.
    pub fn with_client(registry: &str, client: Client, config: &RelayConfig) -> Self {
        let registry = registry.trim().to_ascii_lowercase();
        let base_url = format!(
            "{}://{}",
            config.protocol.scheme_for(&registry),
            api_host(&registry)
        );
        Self {
            registry,
            base_url,
            client,
        }
    }

    fn check_host(&self, reference: &ArtifactReference) -> Result<()> {
        if reference.registry() != self.registry {
            return Err(RelayError::ConfigError(format!(
                "Reference {} does not belong to registry {}",
                reference, self.registry
            )));
        }
        Ok(())
    }

    fn manifest_url(&self, reference: &ArtifactReference) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.base_url,
            reference.repository(),
            reference.tag_or_digest()
        )
    }

    fn blob_url(&self, reference: &ArtifactReference, digest: &ContentDigest) -> String {
        format!(
            "{}/v2/{}/blobs/{}",
            self.base_url,
            reference.repository(),
            digest
        )
    }

    fn upload_url(&self, reference: &ArtifactReference) -> String {
        format!(
            "{}/v2/{}/blobs/uploads/",
            self.base_url,
            reference.repository()
        )
    }

    /// Resolve an upload `Location` (absolute or relative) and append the
    /// digest query parameter that completes a monolithic upload.
    fn upload_completion_url(&self, location: &str, digest: &ContentDigest) -> Result<Url> {
        let base = Url::parse(&self.base_url).map_err(|e| {
            RelayError::ConfigError(format!("Invalid registry URL {}: {}", self.base_url, e))
        })?;
        let mut url = base.join(location).map_err(|e| {
            RelayError::registry(
                &self.registry,
                format!("Invalid upload location '{}': {}", location, e),
            )
        })?;
        url.query_pairs_mut()
            .append_pair("digest", &digest.to_string());
        Ok(url)
    }

    fn transport_error(&self, action: &str, err: reqwest::Error) -> RelayError {
        let cause = if err.is_timeout() {
            "timed out".to_string()
        } else {
            err.to_string()
        };
        RelayError::registry(&self.registry, format!("Failed to {}: {}", action, cause))
    }

    async fn status_error(
        &self,
        action: &str,
        response: Response,
        digest: Option<&ContentDigest>,
    ) -> RelayError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        classify_failure(&self.registry, action, status, &body, digest)
    }
}

/// Docker Hub serves its API from a different host than its name.
fn api_host(registry: &str) -> &str {
    match registry {
        "docker.io" | "index.docker.io" => "registry-1.docker.io",
        other => other,
    }
}

/// Map a failed registry response to the error taxonomy.
///
/// Upload rejections carrying a digest/size error code become
/// `IntegrityError`; everything else is a `RegistryError`.
fn classify_failure(
    registry: &str,
    action: &str,
    status: StatusCode,
    body: &str,
    digest: Option<&ContentDigest>,
) -> RelayError {
    let parsed: ErrorResponse = serde_json::from_str(body).unwrap_or_default();

    if let Some(digest) = digest {
        if let Some(entry) = parsed
            .errors
            .iter()
            .find(|e| INTEGRITY_ERROR_CODES.contains(&e.code.as_str()))
        {
            return RelayError::IntegrityError {
                digest: digest.to_string(),
                message: format!("{}: {}", entry.code, entry.message),
            };
        }
    }

    let detail = if parsed.errors.is_empty() {
        body.chars().take(200).collect::<String>()
    } else {
        parsed
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.code, e.message))
            .collect::<Vec<_>>()
            .join("; ")
    };
    RelayError::registry(
        registry,
        format!("Failed to {}: {} {}", action, status, detail)
            .trim_end()
            .to_string(),
    )
}

#[async_trait]
impl BlobStore for RegistryClient {
    fn name(&self) -> &str {
        &self.registry
    }

    async fn head_manifest(&self, reference: &ArtifactReference) -> Result<bool> {
        self.check_host(reference)?;
        let response = self
            .client
            .head(self.manifest_url(reference))
            .header(ACCEPT, SUPPORTED_MANIFEST_MEDIA_TYPES.join(", "))
            .send()
            .await
            .map_err(|e| self.transport_error("check manifest", e))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(self.status_error("check manifest", response, None).await),
        }
    }

    async fn fetch_manifest(&self, reference: &ArtifactReference) -> Result<Manifest> {
        self.check_host(reference)?;
        let response = self
            .client
            .get(self.manifest_url(reference))
            .header(ACCEPT, SUPPORTED_MANIFEST_MEDIA_TYPES.join(", "))
            .send()
            .await
            .map_err(|e| self.transport_error("pull manifest", e))?;

        match response.status() {
            status if status.is_success() => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| self.transport_error("read manifest", e))?;
                Manifest::from_slice(&body)
            }
            StatusCode::NOT_FOUND => Err(RelayError::NotFound {
                reference: reference.to_string(),
            }),
            _ => Err(self.status_error("pull manifest", response, None).await),
        }
    }

    async fn fetch_blob(
        &self,
        reference: &ArtifactReference,
        digest: &ContentDigest,
    ) -> Result<BlobStream> {
        self.check_host(reference)?;
        let response = self
            .client
            .get(self.blob_url(reference, digest))
            .send()
            .await
            .map_err(|e| self.transport_error("pull blob", e))?;

        match response.status() {
            status if status.is_success() => {
                let registry = self.registry.clone();
                let digest = digest.clone();
                Ok(Box::pin(response.bytes_stream().map_err(move |e| {
                    RelayError::registry(
                        &registry,
                        format!("Failed to read blob {}: {}", digest, e),
                    )
                })))
            }
            StatusCode::NOT_FOUND => Err(RelayError::NotFound {
                reference: format!("{}/{}@{}", self.registry, reference.repository(), digest),
            }),
            _ => Err(self.status_error("pull blob", response, None).await),
        }
    }

    async fn put_blob(
        &self,
        reference: &ArtifactReference,
        digest: &ContentDigest,
        size: u64,
        content: BlobStream,
    ) -> Result<()> {
        self.check_host(reference)?;

        let session = self
            .client
            .post(self.upload_url(reference))
            .header(CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(|e| self.transport_error("start blob upload", e))?;
        if session.status() != StatusCode::ACCEPTED {
            return Err(self.status_error("start blob upload", session, None).await);
        }
        let location = session
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                RelayError::registry(&self.registry, "Upload session has no Location header")
            })?;
        let url = self.upload_completion_url(location, digest)?;

        // reqwest 0.11 requires a `Sync` body stream, so the source stream is
        // pumped through a bounded channel within this task.
        let (tx, rx) = tokio::sync::mpsc::channel::<std::io::Result<Bytes>>(UPLOAD_BUFFER_CHUNKS);
        let pump = async move {
            let mut content = content;
            while let Some(chunk) = content.next().await {
                match chunk {
                    Ok(bytes) => {
                        if tx.send(Ok(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(Err(std::io::Error::new(
                                std::io::ErrorKind::Other,
                                "upload source failed",
                            )))
                            .await;
                        return Err(e);
                    }
                }
            }
            Ok(())
        };
        let request = self
            .client
            .put(url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, size)
            .body(reqwest::Body::wrap_stream(ReceiverStream::new(rx)))
            .send();

        let (pumped, response) = tokio::join!(pump, request);
        pumped?;
        let response = response.map_err(|e| self.transport_error("upload blob", e))?;

        if response.status() == StatusCode::CREATED {
            tracing::debug!(registry = %self.registry, digest = %digest, size, "Uploaded blob");
            Ok(())
        } else {
            Err(self.status_error("upload blob", response, Some(digest)).await)
        }
    }

    async fn put_manifest(
        &self,
        reference: &ArtifactReference,
        manifest: &[u8],
        media_type: &str,
    ) -> Result<()> {
        self.check_host(reference)?;
        let response = self
            .client
            .put(self.manifest_url(reference))
            .header(CONTENT_TYPE, media_type)
            .body(manifest.to_vec())
            .send()
            .await
            .map_err(|e| self.transport_error("push manifest", e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(self.status_error("push manifest", response, None).await)
        }
    }
}
