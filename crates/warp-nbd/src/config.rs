//! NBD gateway configuration
//!
//! Settings come from defaults, an optional TOML file, `WARP_NBD_*`
//! environment variables and finally command-line flags, in that order.
//!
//! ```toml
//! bind_addr = "127.0.0.1:10809"
//! domain = "default"
//! blob = "nbd"
//!
//! [[volumes]]
//! name = "vol1"
//! size = 1073741824
//! object_size = 4194304
//! ```

use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::backend::DEFAULT_GRANULARITY;
use crate::error::{BlockError, BlockResult};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "WARP_NBD";

/// Default object size for seeded volumes (4 MiB)
pub const DEFAULT_OBJECT_SIZE: u64 = 4 * 1024 * 1024;

fn default_object_size() -> u64 {
    DEFAULT_OBJECT_SIZE
}

/// NBD server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NbdConfig {
    /// TCP bind address for NBD server
    pub bind_addr: SocketAddr,
    /// Maximum concurrent clients
    pub max_clients: usize,
    /// Object store domain holding the volumes
    pub domain: String,
    /// Blob that backs each export
    pub blob: String,
    /// Serialize overlapping operations per export
    pub ordered: bool,
    /// Ordering granularity used before an export's object size is known
    pub default_granularity: u64,
    /// Volumes to create at startup
    pub volumes: Vec<VolumeConfig>,
}

impl Default for NbdConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 10809)),
            max_clients: 100,
            domain: "default".to_string(),
            blob: "nbd".to_string(),
            ordered: true,
            default_granularity: DEFAULT_GRANULARITY,
            volumes: Vec::new(),
        }
    }
}

impl NbdConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set max clients
    pub fn max_clients(mut self, count: usize) -> Self {
        self.max_clients = count;
        self
    }

    /// Set object store domain
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Set backing blob name
    pub fn blob(mut self, blob: impl Into<String>) -> Self {
        self.blob = blob.into();
        self
    }

    /// Disable the ordering layer
    pub fn no_ordering(mut self) -> Self {
        self.ordered = false;
        self
    }

    /// Set the fallback ordering granularity
    pub fn default_granularity(mut self, bytes: u64) -> Self {
        self.default_granularity = bytes;
        self
    }

    /// Add a volume
    pub fn volume(mut self, volume: VolumeConfig) -> Self {
        self.volumes.push(volume);
        self
    }

    /// Parse configuration from TOML
    pub fn from_toml_str(content: &str) -> BlockResult<Self> {
        toml::from_str(content).map_err(|e| BlockError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> BlockResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BlockError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Apply `WARP_NBD_*` environment overrides
    pub fn apply_env_overrides(self) -> BlockResult<Self> {
        self.apply_env_overrides_with_prefix(ENV_PREFIX)
    }

    /// Apply environment overrides using a custom prefix
    pub fn apply_env_overrides_with_prefix(mut self, prefix: &str) -> BlockResult<Self> {
        if let Ok(val) = std::env::var(format!("{prefix}_BIND_ADDR")) {
            self.bind_addr = val
                .parse()
                .map_err(|_| BlockError::Config(format!("Invalid bind_addr value: {val}")))?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_MAX_CLIENTS")) {
            self.max_clients = val
                .parse()
                .map_err(|_| BlockError::Config(format!("Invalid max_clients value: {val}")))?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_DOMAIN")) {
            self.domain = val;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_BLOB")) {
            self.blob = val;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_ORDERED")) {
            self.ordered = val
                .parse()
                .map_err(|_| BlockError::Config(format!("Invalid ordered value: {val}")))?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_DEFAULT_GRANULARITY")) {
            self.default_granularity = val.parse().map_err(|_| {
                BlockError::Config(format!("Invalid default_granularity value: {val}"))
            })?;
        }
        Ok(self)
    }

    /// Check the configuration for values the server cannot run with
    pub fn validate(&self) -> BlockResult<()> {
        if self.max_clients == 0 {
            return Err(BlockError::Config("max_clients must be at least 1".to_string()));
        }
        if self.default_granularity == 0 {
            return Err(BlockError::Config(
                "default_granularity must be non-zero".to_string(),
            ));
        }
        for volume in &self.volumes {
            if volume.name.is_empty() {
                return Err(BlockError::Config("Volume name must not be empty".to_string()));
            }
            if volume.object_size == 0 {
                return Err(BlockError::Config(format!(
                    "Volume {} has a zero object size",
                    volume.name
                )));
            }
        }
        Ok(())
    }
}

/// Volume seeded into the object store at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Volume (export) name
    pub name: String,
    /// Capacity in bytes
    pub size: u64,
    /// Object size in bytes
    #[serde(default = "default_object_size")]
    pub object_size: u64,
}

impl VolumeConfig {
    /// Create a volume with the default object size
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            object_size: DEFAULT_OBJECT_SIZE,
        }
    }

    /// Set object size
    pub fn object_size(mut self, size: u64) -> Self {
        self.object_size = size;
        self
    }

    /// Parse `NAME:SIZE[:OBJECT_SIZE]`, sizes accept K/M/G suffixes
    pub fn parse(spec: &str) -> BlockResult<Self> {
        let mut parts = spec.split(':');
        let name = parts.next().unwrap_or_default();
        if name.is_empty() {
            return Err(BlockError::Config(format!("Missing volume name in {spec:?}")));
        }
        let size = parts
            .next()
            .ok_or_else(|| BlockError::Config(format!("Missing volume size in {spec:?}")))
            .and_then(parse_size)?;

        let mut volume = Self::new(name, size);
        if let Some(object_size) = parts.next() {
            volume.object_size = parse_size(object_size)?;
        }
        if parts.next().is_some() {
            return Err(BlockError::Config(format!("Too many fields in {spec:?}")));
        }
        Ok(volume)
    }
}

/// Parse a byte count with an optional binary K/M/G suffix
fn parse_size(value: &str) -> BlockResult<u64> {
    let value = value.trim();
    let (digits, shift) = match value.char_indices().last() {
        Some((i, 'k' | 'K')) => (&value[..i], 10),
        Some((i, 'm' | 'M')) => (&value[..i], 20),
        Some((i, 'g' | 'G')) => (&value[..i], 30),
        _ => (value, 0),
    };

    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(1 << shift))
        .ok_or_else(|| BlockError::Config(format!("Invalid size: {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_nbd_config() {
        let config = NbdConfig::new()
            .bind("0.0.0.0:12345".parse().unwrap())
            .max_clients(4)
            .no_ordering()
            .volume(VolumeConfig::new("vol1", 1 << 20).object_size(4096));

        assert_eq!(config.bind_addr.port(), 12345);
        assert_eq!(config.max_clients, 4);
        assert!(!config.ordered);
        assert_eq!(config.volumes[0].object_size, 4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = NbdConfig::default();
        assert_eq!(config.bind_addr.port(), 10809);
        assert_eq!(config.max_clients, 100);
        assert_eq!(config.domain, "default");
        assert_eq!(config.blob, "nbd");
        assert!(config.ordered);
        assert_eq!(config.default_granularity, 4096);
        assert!(config.volumes.is_empty());
    }

    #[test]
    fn test_from_toml() {
        let config = NbdConfig::from_toml_str(
            r#"
            bind_addr = "127.0.0.1:20809"
            blob = "disk"

            [[volumes]]
            name = "vol1"
            size = 8192

            [[volumes]]
            name = "vol2"
            size = 65536
            object_size = 16384
            "#,
        )
        .unwrap();

        assert_eq!(config.bind_addr.port(), 20809);
        assert_eq!(config.blob, "disk");
        assert_eq!(config.domain, "default");
        assert_eq!(config.volumes.len(), 2);
        assert_eq!(config.volumes[0].object_size, DEFAULT_OBJECT_SIZE);
        assert_eq!(config.volumes[1].object_size, 16384);
    }

    #[test]
    fn test_invalid_toml() {
        let err = NbdConfig::from_toml_str("max_clients = \"many\"").unwrap_err();
        assert!(matches!(err, BlockError::Config(_)));
    }

    #[test]
    fn test_load_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "max_clients = 7").unwrap();
        writeln!(file, "ordered = false").unwrap();

        let config = NbdConfig::load(file.path()).unwrap();
        assert_eq!(config.max_clients, 7);
        assert!(!config.ordered);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = NbdConfig::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, BlockError::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        // Unique prefix keeps parallel tests apart
        unsafe {
            std::env::set_var("NBDENV_BIND_ADDR", "127.0.0.1:31000");
            std::env::set_var("NBDENV_ORDERED", "false");
            std::env::set_var("NBDENV_BLOB", "other");
        }
        let config = NbdConfig::new()
            .apply_env_overrides_with_prefix("NBDENV")
            .unwrap();
        assert_eq!(config.bind_addr.port(), 31000);
        assert!(!config.ordered);
        assert_eq!(config.blob, "other");
        unsafe {
            std::env::remove_var("NBDENV_BIND_ADDR");
            std::env::remove_var("NBDENV_ORDERED");
            std::env::remove_var("NBDENV_BLOB");
        }
    }

    #[test]
    fn test_env_override_invalid() {
        unsafe {
            std::env::set_var("NBDBAD_MAX_CLIENTS", "lots");
        }
        let err = NbdConfig::new()
            .apply_env_overrides_with_prefix("NBDBAD")
            .unwrap_err();
        assert!(matches!(err, BlockError::Config(_)));
        unsafe {
            std::env::remove_var("NBDBAD_MAX_CLIENTS");
        }
    }

    #[test]
    fn test_validate() {
        assert!(NbdConfig::new().max_clients(0).validate().is_err());
        assert!(NbdConfig::new().default_granularity(0).validate().is_err());
        assert!(
            NbdConfig::new()
                .volume(VolumeConfig::new("vol1", 4096).object_size(0))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_parse_volume() {
        assert_eq!(
            VolumeConfig::parse("vol1:4096").unwrap(),
            VolumeConfig::new("vol1", 4096)
        );
        assert_eq!(
            VolumeConfig::parse("vol1:1G:4M").unwrap(),
            VolumeConfig::new("vol1", 1 << 30).object_size(4 << 20)
        );
        assert_eq!(VolumeConfig::parse("disk:64k").unwrap().size, 65536);

        assert!(VolumeConfig::parse("vol1").is_err());
        assert!(VolumeConfig::parse(":4096").is_err());
        assert!(VolumeConfig::parse("vol1:big").is_err());
        assert!(VolumeConfig::parse("vol1:1:2:3").is_err());
    }
}
