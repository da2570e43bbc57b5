//! Checksum Codec
//!
//! Content digests tying the data plane to the metadata plane. A checksum is
//! a tagged value (`algorithm:hexdigest`); the `none` algorithm is an explicit
//! opt-out sentinel that never verifies against anything.

mod reader;

pub use reader::ChecksumReader;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Read buffer used when draining a stream for hashing
const HASH_BUFFER_SIZE: usize = 64 * 1024;

// =============================================================================
// Algorithm
// =============================================================================

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// Explicit opt-out
    None,
    Sha224,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl ChecksumAlgorithm {
    /// Length of the hex digest produced by this algorithm
    pub fn hex_len(&self) -> usize {
        match self {
            ChecksumAlgorithm::None => 0,
            ChecksumAlgorithm::Sha224 => 56,
            ChecksumAlgorithm::Sha256 => 64,
            ChecksumAlgorithm::Sha384 => 96,
            ChecksumAlgorithm::Sha512 => 128,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::None => "none",
            ChecksumAlgorithm::Sha224 => "sha224",
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Sha384 => "sha384",
            ChecksumAlgorithm::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "").as_str() {
            "none" => Ok(ChecksumAlgorithm::None),
            "sha224" => Ok(ChecksumAlgorithm::Sha224),
            "sha256" => Ok(ChecksumAlgorithm::Sha256),
            "sha384" => Ok(ChecksumAlgorithm::Sha384),
            "sha512" => Ok(ChecksumAlgorithm::Sha512),
            other => Err(Error::BadInputData(format!(
                "unsupported checksum algorithm: {}",
                other
            ))),
        }
    }
}

// =============================================================================
// Checksum
// =============================================================================

/// A content digest tagged with its algorithm.
///
/// `PartialEq` is structural. Use [`Checksum::matches`] or [`verify`] for the
/// verification rule, under which `none` never matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Checksum {
    algorithm: ChecksumAlgorithm,
    digest: String,
}

impl Checksum {
    /// Build a checksum from an algorithm and hex digest, validating the digest
    pub fn new(algorithm: ChecksumAlgorithm, digest: impl Into<String>) -> Result<Self> {
        let digest = digest.into().to_lowercase();
        if algorithm == ChecksumAlgorithm::None {
            return Ok(Self::none());
        }
        if digest.len() != algorithm.hex_len() || hex::decode(&digest).is_err() {
            return Err(Error::BadInputData(format!(
                "malformed {} digest: {}",
                algorithm, digest
            )));
        }
        Ok(Self { algorithm, digest })
    }

    /// The explicit opt-out sentinel
    pub fn none() -> Self {
        Self {
            algorithm: ChecksumAlgorithm::None,
            digest: String::new(),
        }
    }

    /// Parse a client-declared checksum.
    ///
    /// An empty string means "unspecified" and yields `Ok(None)`; `none` (with or
    /// without a trailing colon) yields the opt-out sentinel.
    pub fn parse(s: &str) -> Result<Option<Self>> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(None);
        }
        let (alg, digest) = match s.split_once(':') {
            Some((alg, digest)) => (alg, digest),
            None => (s, ""),
        };
        let algorithm: ChecksumAlgorithm = alg.parse()?;
        if algorithm == ChecksumAlgorithm::None {
            return Ok(Some(Self::none()));
        }
        Self::new(algorithm, digest).map(Some)
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn is_none(&self) -> bool {
        self.algorithm == ChecksumAlgorithm::None
    }

    /// Verification equality: same algorithm, same digest, and not `none`
    pub fn matches(&self, other: &Checksum) -> bool {
        !self.is_none()
            && !other.is_none()
            && self.algorithm == other.algorithm
            && self.digest == other.digest
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("none")
        } else {
            write!(f, "{}:{}", self.algorithm, self.digest)
        }
    }
}

impl From<Checksum> for String {
    fn from(c: Checksum) -> Self {
        c.to_string()
    }
}

impl TryFrom<String> for Checksum {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Checksum::parse(&s)?.ok_or_else(|| Error::BadInputData("empty checksum".into()))
    }
}

// =============================================================================
// Hasher
// =============================================================================

/// Incremental digest state for one stream
#[derive(Clone)]
pub enum Hasher {
    None,
    Sha224(Sha224),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Hasher {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::None => Hasher::None,
            ChecksumAlgorithm::Sha224 => Hasher::Sha224(Sha224::new()),
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            ChecksumAlgorithm::Sha384 => Hasher::Sha384(Sha384::new()),
            ChecksumAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        match self {
            Hasher::None => ChecksumAlgorithm::None,
            Hasher::Sha224(_) => ChecksumAlgorithm::Sha224,
            Hasher::Sha256(_) => ChecksumAlgorithm::Sha256,
            Hasher::Sha384(_) => ChecksumAlgorithm::Sha384,
            Hasher::Sha512(_) => ChecksumAlgorithm::Sha512,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::None => {}
            Hasher::Sha224(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha384(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Checksum {
        let algorithm = self.algorithm();
        let digest = match self {
            Hasher::None => return Checksum::none(),
            Hasher::Sha224(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha384(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        };
        Checksum { algorithm, digest }
    }
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hasher").field(&self.algorithm()).finish()
    }
}

// =============================================================================
// Codec Functions
// =============================================================================

/// Checksum of an in-memory buffer
pub fn compute_bytes(algorithm: ChecksumAlgorithm, data: &[u8]) -> Checksum {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Consume `reader` to its end and return its checksum
pub async fn compute<R>(algorithm: ChecksumAlgorithm, mut reader: R) -> Result<Checksum>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = Hasher::new(algorithm);
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Verification rule: both present, same algorithm and digest, neither `none`
pub fn verify(expected: &Checksum, actual: &Checksum) -> bool {
    expected.matches(actual)
}
