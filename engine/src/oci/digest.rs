//! Content digests.
//!
//! Canonical `algorithm:hex` identifiers, plus a chunked digester for local
//! content that is hashed first and uploaded afterwards.

use std::fmt;
use std::io::SeekFrom;
use std::str::FromStr;

use oci_relay_core::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DigestAlgorithm {
    Sha256,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 64,
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(DigestAlgorithm::Sha256),
            other => Err(RelayError::ConfigError(format!(
                "unsupported digest algorithm '{}'",
                other
            ))),
        }
    }
}

/// Content digest in canonical `algorithm:hex` form.
///
/// Equal digests identify byte-identical content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl ContentDigest {
    /// Parse `sha256:<64 lowercase hex chars>`.
    pub fn parse(s: &str) -> Result<Self> {
        let (algorithm, hex) = s.split_once(':').ok_or_else(|| {
            RelayError::ConfigError(format!(
                "invalid digest '{}': expected algorithm:hex",
                s
            ))
        })?;
        let algorithm: DigestAlgorithm = algorithm.parse()?;

        let well_formed = hex.len() == algorithm.hex_len()
            && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !well_formed {
            return Err(RelayError::ConfigError(format!(
                "invalid digest '{}': expected {} lowercase hex characters",
                s,
                algorithm.hex_len()
            )));
        }

        Ok(Self {
            algorithm,
            hex: hex.to_string(),
        })
    }

    /// Digest of an in-memory buffer.
    pub fn sha256(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self::from_hasher(hasher)
    }

    fn from_hasher(hasher: Sha256) -> Self {
        Self {
            algorithm: DigestAlgorithm::Sha256,
            hex: hex::encode(hasher.finalize()),
        }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}

impl FromStr for ContentDigest {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = RelayError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<ContentDigest> for String {
    fn from(digest: ContentDigest) -> Self {
        digest.to_string()
    }
}

/// Digest and byte count observed for a piece of content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestedContent {
    pub digest: ContentDigest,
    pub size: u64,
}

/// Hash `reader` from the start in `chunk_size` reads.
///
/// Memory use is bounded by `chunk_size`. The reader is rewound to offset 0
/// both before hashing and afterwards so the same bytes can be uploaded next.
pub async fn digest_reader<R>(reader: &mut R, chunk_size: usize) -> Result<DigestedContent>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    reader.seek(SeekFrom::Start(0)).await?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut size: u64 = 0;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    reader.seek(SeekFrom::Start(0)).await?;

    Ok(DigestedContent {
        digest: ContentDigest::from_hasher(hasher),
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    const EMPTY_SHA256: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    const HELLO_SHA256: &str =
        "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_sha256_of_empty_input() {
        assert_eq!(ContentDigest::sha256(b"").to_string(), EMPTY_SHA256);
    }

    #[test]
    fn test_sha256_of_hello() {
        let digest = ContentDigest::sha256(b"hello");
        assert_eq!(digest.to_string(), HELLO_SHA256);
        assert_eq!(digest.algorithm(), DigestAlgorithm::Sha256);
        assert_eq!(digest.hex().len(), 64);
    }

    #[test]
    fn test_parse_roundtrips_canonical_form() {
        let digest = ContentDigest::parse(HELLO_SHA256).unwrap();
        assert_eq!(digest, ContentDigest::sha256(b"hello"));
    }

    #[test]
    fn test_parse_rejects_missing_algorithm() {
        assert!(ContentDigest::parse("2cf24dba5fb0a30e").is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_algorithm() {
        let err = ContentDigest::parse("md5:d41d8cd98f00b204e9800998ecf8427e").unwrap_err();
        assert!(err.to_string().contains("unsupported digest algorithm"));
    }

    #[test]
    fn test_parse_rejects_short_or_uppercase_hex() {
        assert!(ContentDigest::parse("sha256:abc").is_err());
        let upper = HELLO_SHA256.to_uppercase().replace("SHA256", "sha256");
        assert!(ContentDigest::parse(&upper).is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let digest = ContentDigest::sha256(b"hello");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{}\"", HELLO_SHA256));
        let back: ContentDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
        assert!(serde_json::from_str::<ContentDigest>("\"sha256:zz\"").is_err());
    }

    #[tokio::test]
    async fn test_digest_reader_small_chunks() {
        let mut cursor = Cursor::new(b"hello".to_vec());
        let digested = digest_reader(&mut cursor, 2).await.unwrap();
        assert_eq!(digested.digest.to_string(), HELLO_SHA256);
        assert_eq!(digested.size, 5);
    }

    #[tokio::test]
    async fn test_digest_reader_rewinds_afterwards() {
        let mut cursor = Cursor::new(b"hello".to_vec());
        digest_reader(&mut cursor, 4096).await.unwrap();

        let mut again = Vec::new();
        cursor.read_to_end(&mut again).await.unwrap();
        assert_eq!(again, b"hello");
    }

    #[tokio::test]
    async fn test_digest_reader_starts_from_offset_zero() {
        let mut cursor = Cursor::new(b"hello".to_vec());
        cursor.set_position(3);
        let digested = digest_reader(&mut cursor, 4096).await.unwrap();
        assert_eq!(digested.size, 5);
        assert_eq!(digested.digest.to_string(), HELLO_SHA256);
    }

    #[tokio::test]
    async fn test_digest_reader_empty() {
        let mut cursor = Cursor::new(Vec::new());
        let digested = digest_reader(&mut cursor, 16).await.unwrap();
        assert_eq!(digested.size, 0);
        assert_eq!(digested.digest.to_string(), EMPTY_SHA256);
    }

    #[tokio::test]
    async fn test_digest_reader_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut tmp, &vec![7u8; 100_000]).unwrap();

        let mut file = tokio::fs::File::open(tmp.path()).await.unwrap();
        let digested = digest_reader(&mut file, 4096).await.unwrap();
        assert_eq!(digested.size, 100_000);
        assert_eq!(digested.digest, ContentDigest::sha256(&vec![7u8; 100_000]));
    }

    struct BrokenReader;

    impl AsyncRead for BrokenReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk gone",
            )))
        }
    }

    impl AsyncSeek for BrokenReader {
        fn start_seek(self: Pin<&mut Self>, _position: SeekFrom) -> std::io::Result<()> {
            Ok(())
        }

        fn poll_complete(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<u64>> {
            Poll::Ready(Ok(0))
        }
    }

    #[tokio::test]
    async fn test_digest_reader_surfaces_io_error() {
        let err = digest_reader(&mut BrokenReader, 16).await.unwrap_err();
        assert!(matches!(err, RelayError::IoError(_)));
    }
}
