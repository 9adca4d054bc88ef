//! Object identifiers.

use crate::{Result, TypesError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// The all-zero identifier. Denotes an absent ref or a deletion, never an object.
pub const ZERO_ID: ObjectId = ObjectId([0u8; 20]);

/// A 20-byte object identifier, rendered on the wire as 40 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 20]);

impl Serialize for ObjectId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ObjectId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl ObjectId {
    /// Creates an ObjectId from raw bytes.
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Creates an ObjectId from a 20-byte binary slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 20] = bytes
            .try_into()
            .map_err(|_| TypesError::InvalidLength(bytes.len()))?;
        Ok(Self(bytes))
    }

    /// Creates an ObjectId from a hex string.
    pub fn from_hex(hex: &str) -> Result<Self> {
        Self::from_hex_bytes(hex.as_bytes())
    }

    /// Creates an ObjectId from hex characters taken straight off the wire.
    pub fn from_hex_bytes(hex: &[u8]) -> Result<Self> {
        if hex.len() != 40 {
            return Err(TypesError::InvalidLength(hex.len()));
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(hex, &mut bytes).map_err(|_| {
            TypesError::InvalidHex(String::from_utf8_lossy(hex).into_owned())
        })?;
        Ok(Self(bytes))
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Returns the hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Returns true for the all-zero identifier.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl FromStr for ObjectId {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
