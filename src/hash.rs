//! SHA-1 object ids for the log store.
//!
//! A `bunsen_commit_id` is the 40-hex id of a commit object in the
//! content-addressed store; blobs and trees use the same id scheme. Hashing
//! prefixes the payload with the object header `"<type> <len>\0"`, so ids are
//! a deterministic function of type and content alone.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::errors::BunsenError;
use crate::store::object::ObjectType;

/// Byte length of an object id.
pub const HASH_SIZE: usize = 20;
/// Hex string length of an object id.
pub const HASH_HEX_LEN: usize = 40;
/// Shortest id prefix accepted for abbreviation.
pub const MIN_ABBREV: usize = 4;

/// Concrete object id value. Displays as 40 lowercase hex characters and
/// round-trips through `FromStr`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectHash([u8; HASH_SIZE]);

impl Display for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ObjectHash({})", self)
    }
}

impl AsRef<[u8]> for ObjectHash {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// Parse 40 hex characters into an `ObjectHash`.
impl FromStr for ObjectHash {
    type Err = BunsenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != HASH_HEX_LEN {
            return Err(BunsenError::InvalidHash(s.to_string()));
        }
        let bytes = hex::decode(s).map_err(|_| BunsenError::InvalidHash(s.to_string()))?;
        let mut h = [0u8; HASH_SIZE];
        h.copy_from_slice(&bytes);
        Ok(ObjectHash(h))
    }
}

impl Serialize for ObjectHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl ObjectHash {
    /// Compute the SHA-1 of raw data, without an object header.
    pub fn new(data: &[u8]) -> ObjectHash {
        let digest = Sha1::digest(data);
        let mut h = [0u8; HASH_SIZE];
        h.copy_from_slice(&digest);
        ObjectHash(h)
    }

    /// Compute the object id for typed content: hash of
    /// `"<type> <len>\0" + data`.
    pub fn from_type_and_data(object_type: ObjectType, data: &[u8]) -> ObjectHash {
        let mut d: Vec<u8> = Vec::with_capacity(data.len() + 16);
        d.extend(object_type.as_bytes());
        d.push(b' ');
        d.extend(data.len().to_string().as_bytes());
        d.push(b'\x00');
        d.extend(data);
        ObjectHash::new(&d)
    }

    /// Create an `ObjectHash` from exactly [`HASH_SIZE`] raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<ObjectHash, BunsenError> {
        if bytes.len() != HASH_SIZE {
            return Err(BunsenError::InvalidHash(hex::encode(bytes)));
        }
        let mut h = [0u8; HASH_SIZE];
        h.copy_from_slice(bytes);
        Ok(ObjectHash(h))
    }

    /// Raw id bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Whether `prefix` is a hex prefix of this id. Comparison is
    /// case-insensitive; an over-long or non-hex prefix never matches.
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        if prefix.len() > HASH_HEX_LEN || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
            return false;
        }
        hex::encode(self.0).starts_with(&prefix.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hashing "Hello, world!" should match the known SHA-1 value.
    #[test]
    fn test_sha1_new() {
        let sha1 = ObjectHash::new("Hello, world!".as_bytes());
        assert_eq!(sha1.to_string(), "943a702d06f34599aee1f8da8ef9f7296031d699");
    }

    /// Blob-header hashing matches `git hash-object` for a known input.
    #[test]
    fn test_from_type_and_data() {
        let id = ObjectHash::from_type_and_data(ObjectType::Blob, b"test content\n");
        assert_eq!(id.to_string(), "d670460b4b4aece5915caf5c68d12f560a9fe3e4");
    }

    /// Hex strings round-trip through `FromStr` and `Display`.
    #[test]
    fn test_from_str_round_trip() {
        let hash_str = "8ab686eafeb1f44702738c8b0f24f2567c36da6d";
        let hash = ObjectHash::from_str(hash_str).unwrap();
        assert_eq!(hash.to_string(), hash_str);
    }

    /// Wrong-length or non-hex strings are rejected.
    #[test]
    fn test_from_str_invalid() {
        assert!(ObjectHash::from_str("abcd").is_err());
        assert!(ObjectHash::from_str(&"g".repeat(40)).is_err());
    }

    /// Construct from raw bytes.
    #[test]
    fn test_from_bytes() {
        let hash = ObjectHash::from_bytes(&[
            0x8a, 0xb6, 0x86, 0xea, 0xfe, 0xb1, 0xf4, 0x47, 0x02, 0x73, 0x8c, 0x8b, 0x0f, 0x24,
            0xf2, 0x56, 0x7c, 0x36, 0xda, 0x6d,
        ])
        .unwrap();
        assert_eq!(hash.to_string(), "8ab686eafeb1f44702738c8b0f24f2567c36da6d");
        assert!(ObjectHash::from_bytes(&[0u8; 19]).is_err());
    }

    /// Prefix matching accepts unique hex prefixes and rejects junk.
    #[test]
    fn test_matches_prefix() {
        let hash = ObjectHash::from_str("943a702d06f34599aee1f8da8ef9f7296031d699").unwrap();
        assert!(hash.matches_prefix("943a"));
        assert!(hash.matches_prefix("943A702D"));
        assert!(!hash.matches_prefix("943b"));
        assert!(!hash.matches_prefix("94zz"));
    }

    /// Ids serialize to JSON as plain hex strings.
    #[test]
    fn test_serde_as_hex_string() {
        let hash = ObjectHash::from_str("943a702d06f34599aee1f8da8ef9f7296031d699").unwrap();
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, "\"943a702d06f34599aee1f8da8ef9f7296031d699\"");
        let back: ObjectHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
