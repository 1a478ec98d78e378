use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use am_dispatch::DispatcherConfig;
use am_fabric::FabricConfig;
use am_types::{ReplicaPolicy, SerializationMode, DEFAULT_OBJECT_SIZE};

/// Errors from loading or validating a [`GatewayConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration syntax: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("cannot render configuration: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which fan-out discipline catalog mutations use by default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    #[default]
    MultiPrimary,
    Legacy,
}

/// Gateway configuration, usually read from `amctl.toml`.
///
/// ```toml
/// object_size = 2097152
/// serialization = "volume"
/// replica_policy = "multi-primary"
/// num_primaries = 2
///
/// [fabric]
/// lanes = 64
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Object size for volumes attached without one.
    pub object_size: u32,
    pub serialization: SerializationMode,
    pub replica_policy: PolicyKind,
    /// Primaries per DM group under the multi-primary policy.
    pub num_primaries: usize,
    pub fabric: FabricConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            object_size: DEFAULT_OBJECT_SIZE,
            serialization: SerializationMode::default(),
            replica_policy: PolicyKind::default(),
            num_primaries: 2,
            fabric: FabricConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Read and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.object_size == 0 {
            return Err(ConfigError::Invalid("object_size must be greater than zero".into()));
        }
        if self.num_primaries == 0 {
            return Err(ConfigError::Invalid("num_primaries must be at least 1".into()));
        }
        if self.fabric.lanes == 0 {
            return Err(ConfigError::Invalid("fabric.lanes must be at least 1".into()));
        }
        Ok(())
    }

    /// The default replica policy as the dispatcher sees it.
    pub fn replica_policy(&self) -> ReplicaPolicy {
        match self.replica_policy {
            PolicyKind::MultiPrimary => ReplicaPolicy::MultiPrimary {
                num_primaries: self.num_primaries,
            },
            PolicyKind::Legacy => ReplicaPolicy::Legacy,
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            serialization: self.serialization,
            replica_policy: self.replica_policy(),
        }
    }
}
