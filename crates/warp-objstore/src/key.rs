//! Blob and object key validation

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A blob key: the named data unit inside a volume
///
/// A blob is a sequence of fixed-size objects addressed by index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobKey {
    domain: String,
    volume: String,
    blob: String,
}

impl BlobKey {
    /// Create a new blob key
    ///
    /// # Errors
    /// Returns an error if any component is empty, longer than 255 bytes,
    /// or contains `/` or a null byte
    pub fn new(
        domain: impl Into<String>,
        volume: impl Into<String>,
        blob: impl Into<String>,
    ) -> Result<Self> {
        let domain = domain.into();
        let volume = volume.into();
        let blob = blob.into();

        Self::validate_component("domain", &domain)?;
        Self::validate_component("volume", &volume)?;
        Self::validate_component("blob", &blob)?;

        Ok(Self {
            domain,
            volume,
            blob,
        })
    }

    /// Get the domain name
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Get the volume name
    pub fn volume(&self) -> &str {
        &self.volume
    }

    /// Get the blob name
    pub fn blob(&self) -> &str {
        &self.blob
    }

    /// Key of the object at `index` within this blob
    pub fn object(&self, index: u64) -> ObjectKey {
        ObjectKey {
            blob: self.clone(),
            index,
        }
    }

    /// Convert to path string
    pub fn to_path(&self) -> String {
        format!("{}/{}/{}", self.domain, self.volume, self.blob)
    }

    fn validate_component(what: &str, value: &str) -> Result<()> {
        if value.is_empty() {
            return Err(Error::InvalidKey(format!("{} cannot be empty", what)));
        }

        if value.len() > 255 {
            return Err(Error::InvalidKey(format!(
                "{} must be at most 255 bytes",
                what
            )));
        }

        if value.contains('/') || value.contains('\0') {
            return Err(Error::InvalidKey(format!(
                "{} cannot contain '/' or null bytes",
                what
            )));
        }

        Ok(())
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_path())
    }
}

/// An object key: one fixed-size object of a blob
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    blob: BlobKey,
    index: u64,
}

impl ObjectKey {
    /// Create a new object key
    pub fn new(blob: BlobKey, index: u64) -> Self {
        Self { blob, index }
    }

    /// Get the owning blob
    pub fn blob(&self) -> &BlobKey {
        &self.blob
    }

    /// Get the object index within the blob
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Convert to path string
    pub fn to_path(&self) -> String {
        format!("{}#{}", self.blob.to_path(), self.index)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_keys() {
        let blob = BlobKey::new("default", "vol1", "nbd").unwrap();
        assert_eq!(blob.domain(), "default");
        assert_eq!(blob.volume(), "vol1");
        assert_eq!(blob.blob(), "nbd");
        assert_eq!(blob.to_path(), "default/vol1/nbd");

        let obj = blob.object(7);
        assert_eq!(obj.index(), 7);
        assert_eq!(obj.blob(), &blob);
        assert_eq!(obj.to_string(), "default/vol1/nbd#7");
    }

    #[test]
    fn test_invalid_keys() {
        assert!(BlobKey::new("", "vol1", "nbd").is_err());
        assert!(BlobKey::new("default", "a/b", "nbd").is_err());
        assert!(BlobKey::new("default", "vol1", "nb\0d").is_err());
        assert!(BlobKey::new("default", "v".repeat(256), "nbd").is_err());
    }
}
