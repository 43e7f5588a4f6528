use std::{
    fmt::{self, Display},
    io::{self, Read},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use super::StoreError;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The algorithm prefix of every digest produced by the harness.
pub const SHA256_PREFIX: &str = "sha256:";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A content digest rendered as `sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

/// The content identity of a single layer's own diff, independent of its ancestry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiffId(Digest);

/// The identity of a layer together with its full, ordered ancestry.
///
/// The base layer's chain ID equals its diff ID. Every other layer's chain ID is the digest of
/// `"<parent chain ID> <diff ID>"`, so the same diffs stacked in another order yield another ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(Digest);

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Digest {
    /// Computes the sha256 digest of `bytes`.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
        Self(format!("{SHA256_PREFIX}{}", hex::encode(Sha256::digest(bytes))))
    }

    /// Computes the sha256 digest of everything `reader` yields.
    pub fn from_reader(mut reader: impl Read) -> io::Result<Self> {
        let mut hasher = Sha256::new();
        io::copy(&mut reader, &mut hasher)?;
        Ok(Self(format!("{SHA256_PREFIX}{}", hex::encode(hasher.finalize()))))
    }

    /// Returns the hex-encoded part of the digest without its algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.0[SHA256_PREFIX.len()..]
    }

    /// Returns the full `sha256:<hex>` form of the digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl DiffId {
    /// Computes the diff ID of an uncompressed diff stream.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
        Self(Digest::from_bytes(bytes))
    }

    /// Returns the underlying digest.
    pub fn digest(&self) -> &Digest {
        &self.0
    }
}

impl ChainId {
    /// Derives the chain ID of a layer from its parent's chain ID and its own diff ID.
    pub fn derive(parent: Option<&ChainId>, diff_id: &DiffId) -> Self {
        match parent {
            None => Self(diff_id.0.clone()),
            Some(parent) => Self(Digest::from_bytes(format!("{parent} {diff_id}"))),
        }
    }

    /// Derives the chain ID of the tip of a stack of diff IDs, base first.
    pub fn for_diffs<'a>(diff_ids: impl IntoIterator<Item = &'a DiffId>) -> Option<Self> {
        diff_ids
            .into_iter()
            .fold(None, |parent, diff_id| Some(Self::derive(parent.as_ref(), diff_id)))
    }

    /// Returns the underlying digest.
    pub fn digest(&self) -> &Digest {
        &self.0
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for Digest {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s
            .strip_prefix(SHA256_PREFIX)
            .ok_or_else(|| StoreError::InvalidDigest(s.to_string()))?;

        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(StoreError::InvalidDigest(s.to_string()));
        }

        Result::Ok(Self(s.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for Digest {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

impl From<Digest> for DiffId {
    fn from(digest: Digest) -> Self {
        Self(digest)
    }
}

impl From<Digest> for ChainId {
    fn from(digest: Digest) -> Self {
        Self(digest)
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Display for DiffId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_of_empty_input() {
        let digest = Digest::from_bytes(b"");
        assert_eq!(
            digest.as_str(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(digest.hex().len(), 64);
        assert_eq!(Digest::from_reader(&b""[..]).unwrap(), digest);
    }

    #[test]
    fn test_digest_parse_rejects_malformed_input() {
        assert!("sha256:abc".parse::<Digest>().is_err());
        assert!("md5:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
            .parse::<Digest>()
            .is_err());

        let digest = Digest::from_bytes(b"layer");
        assert_eq!(digest.as_str().parse::<Digest>().unwrap(), digest);
    }

    #[test]
    fn test_chain_id_of_base_layer_is_its_diff_id() {
        let diff_id = DiffId::from_bytes(b"base");
        let chain_id = ChainId::derive(None, &diff_id);
        assert_eq!(chain_id.digest(), diff_id.digest());
    }

    #[test]
    fn test_chain_id_is_order_sensitive() {
        let a = DiffId::from_bytes(b"a");
        let b = DiffId::from_bytes(b"b");

        let ab = ChainId::for_diffs([&a, &b]).unwrap();
        let ba = ChainId::for_diffs([&b, &a]).unwrap();
        assert_ne!(ab, ba);

        let expected = Digest::from_bytes(format!("{a} {b}"));
        assert_eq!(ab.digest(), &expected);
        assert!(ChainId::for_diffs([]).is_none());
    }
}
