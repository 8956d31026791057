//! Content digests (`<algo>:<hex>`) and their on-disk filename form.

use crate::error::{CopyError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Length of a hex-encoded sha256 digest.
pub const SHA256_HEX_LEN: usize = 64;

/// Opaque content id identifying a blob.
///
/// Two blobs with the same digest have identical bytes, so a digest doubles as
/// a map key and, with the colon replaced by a dash, as a filename.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: String,
    hex: String,
}

impl Digest {
    /// Build a sha256 digest from its hex body.
    pub fn sha256(hex: impl Into<String>) -> Result<Self> {
        Self::new("sha256", hex)
    }

    /// Build a digest from its algorithm and hex body.
    pub fn new(algorithm: impl Into<String>, hex: impl Into<String>) -> Result<Self> {
        let algorithm = algorithm.into();
        let hex = hex.into().to_ascii_lowercase();

        if algorithm.is_empty()
            || !algorithm
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            return Err(CopyError::Config(format!(
                "invalid digest algorithm '{}'",
                algorithm
            )));
        }
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CopyError::Config(format!(
                "invalid digest body '{}' for {}",
                hex, algorithm
            )));
        }
        if algorithm == "sha256" && hex.len() != SHA256_HEX_LEN {
            return Err(CopyError::Config(format!(
                "sha256 digest must have {} hex characters, got {}",
                SHA256_HEX_LEN,
                hex.len()
            )));
        }

        Ok(Self { algorithm, hex })
    }

    /// Parse the dash form used for blob filenames (`sha256-<hex>`).
    pub fn from_filename(name: &str) -> Result<Self> {
        let (algo, hex) = name
            .split_once('-')
            .ok_or_else(|| CopyError::Config(format!("not a blob filename: '{}'", name)))?;
        Self::new(algo, hex)
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Filename of this blob in a local store (`sha256-<hex>`).
    pub fn to_filename(&self) -> String {
        format!("{}-{}", self.algorithm, self.hex)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = CopyError;

    fn from_str(s: &str) -> Result<Self> {
        let (algo, hex) = s
            .split_once(':')
            .ok_or_else(|| CopyError::Config(format!("digest '{}' is missing ':'", s)))?;
        Self::new(algo, hex)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex64(c: char) -> String {
        std::iter::repeat(c).take(SHA256_HEX_LEN).collect()
    }

    #[test]
    fn test_parse_and_display() {
        let s = format!("sha256:{}", hex64('a'));
        let digest: Digest = s.parse().unwrap();
        assert_eq!(digest.algorithm(), "sha256");
        assert_eq!(digest.to_string(), s);
    }

    #[test]
    fn test_filename_form_uses_dash() {
        let digest = Digest::sha256(hex64('b')).unwrap();
        let name = digest.to_filename();
        assert_eq!(name, format!("sha256-{}", hex64('b')));
        assert_eq!(Digest::from_filename(&name).unwrap(), digest);
    }

    #[test]
    fn test_uppercase_hex_is_normalized() {
        let digest = Digest::sha256(hex64('C')).unwrap();
        assert_eq!(digest.hex(), hex64('c'));
    }

    #[test]
    fn test_rejects_malformed() {
        assert!("sha256".parse::<Digest>().is_err());
        assert!("sha256:xyz".parse::<Digest>().is_err());
        assert!("sha256:abcd".parse::<Digest>().is_err());
        assert!(format!("SHA256:{}", hex64('a')).parse::<Digest>().is_err());
        assert!(Digest::from_filename("nodash").is_err());
    }

    #[test]
    fn test_other_algorithms_accept_any_length() {
        let digest: Digest = "blake3:abc123".parse().unwrap();
        assert_eq!(digest.to_filename(), "blake3-abc123");
    }

    #[test]
    fn test_serde_as_string() {
        let digest = Digest::sha256(hex64('d')).unwrap();
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"sha256:{}\"", hex64('d')));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }
}
