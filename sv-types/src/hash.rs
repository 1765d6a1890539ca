use serde::de::{self, Visitor};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct H256(pub [u8; 32]);

impl H256 {
    /// Hex string in wire byte order.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Hex string in the reversed order used for display and by the
    /// Electrum protocol for block and transaction hashes.
    #[must_use]
    pub fn to_rev_hex(&self) -> String {
        let reversed: Vec<u8> = self.0.iter().rev().copied().collect();
        hex::encode(reversed)
    }

    /// Parses a reversed (display-order) hex string.
    pub fn from_rev_hex(s: &str) -> Result<Self, HashParseError> {
        let mut hash = Self::from_str(s)?;
        hash.0.reverse();
        Ok(hash)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct HashParseError;

impl fmt::Display for HashParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected 64 hex characters")
    }
}

impl std::error::Error for HashParseError {}

impl fmt::Debug for H256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "H256({})", self.to_hex())
    }
}

impl fmt::Display for H256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<[u8; 32]> for H256 {
    fn from(bytes: [u8; 32]) -> Self {
        H256(bytes)
    }
}

impl TryFrom<Vec<u8>> for H256 {
    type Error = HashParseError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        Ok(H256(value.try_into().map_err(|_| HashParseError)?))
    }
}

impl FromStr for H256 {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| HashParseError)?;
        bytes.try_into()
    }
}

impl<'de> Deserialize<'de> for H256 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct HexVisitor;

        impl<'de> Visitor<'de> for HexVisitor {
            type Value = H256;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a hex string")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                H256::from_str(v).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(HexVisitor)
    }
}

impl Serialize for H256 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

pub fn sha256(input: &[u8]) -> H256 {
    H256(Sha256::digest(input).into())
}

pub fn double_sha256(input: &[u8]) -> H256 {
    H256(Sha256::digest(Sha256::digest(input)).into())
}
