//! Configuration for named mock servers.
//!
//! Defines the per-server entry, batch validation, and the YAML batch file
//! read by the standalone runner.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// One named mock server entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Unique name of the server within its test context
    pub name: String,

    /// Port to bind (0 = any free port)
    #[serde(default)]
    pub port: u16,

    /// Stub directory, relative to the resources root or the working directory
    #[serde(default)]
    pub stub_location: String,

    /// Whether `stub_location` lives under the resources root
    #[serde(default = "default_true")]
    pub stub_location_in_resources: bool,

    /// Extension ids, applied in order
    #[serde(default)]
    pub extensions: Vec<String>,

    /// Customizer ids, applied in order
    #[serde(default)]
    pub customizers: Vec<String>,

    /// Properties that receive the server's base URL
    #[serde(default)]
    pub base_url_properties: Vec<String>,

    /// Properties that receive the server's port
    #[serde(default)]
    pub port_properties: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl ServerConfig {
    /// Create an entry with an ephemeral port and resource-tree stubs.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port: 0,
            stub_location: String::new(),
            stub_location_in_resources: true,
            extensions: Vec::new(),
            customizers: Vec::new(),
            base_url_properties: Vec::new(),
            port_properties: Vec::new(),
        }
    }

    /// Bind a fixed port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Load stubs from a directory on the file system.
    #[must_use]
    pub fn with_stub_directory(mut self, location: impl Into<String>) -> Self {
        self.stub_location = location.into();
        self.stub_location_in_resources = false;
        self
    }

    /// Load stubs from a location under the resources root.
    #[must_use]
    pub fn with_resource_stubs(mut self, location: impl Into<String>) -> Self {
        self.stub_location = location.into();
        self.stub_location_in_resources = true;
        self
    }

    /// Append an extension id.
    #[must_use]
    pub fn with_extension(mut self, id: impl Into<String>) -> Self {
        self.extensions.push(id.into());
        self
    }

    /// Append a customizer id.
    #[must_use]
    pub fn with_customizer(mut self, id: impl Into<String>) -> Self {
        self.customizers.push(id.into());
        self
    }

    /// Publish the base URL under `property`.
    #[must_use]
    pub fn with_base_url_property(mut self, property: impl Into<String>) -> Self {
        self.base_url_properties.push(property.into());
        self
    }

    /// Publish the port under `property`.
    #[must_use]
    pub fn with_port_property(mut self, property: impl Into<String>) -> Self {
        self.port_properties.push(property.into());
        self
    }

    /// Validate the entry on its own.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::EmptyName);
        }
        Ok(())
    }

    /// Non-blank property keys this entry binds, base URL keys first.
    pub fn bound_properties(&self) -> impl Iterator<Item = &str> {
        self.base_url_properties
            .iter()
            .chain(&self.port_properties)
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
    }
}

/// Validate a registration batch.
///
/// Every entry must be valid, names must be unique, and no property may be
/// bound twice.
pub fn validate_batch(batch: &[ServerConfig]) -> Result<(), ConfigurationError> {
    let mut names = HashSet::new();
    let mut bindings: HashMap<&str, &str> = HashMap::new();

    for config in batch {
        config.validate()?;
        if !names.insert(config.name.as_str()) {
            return Err(ConfigurationError::DuplicateName(config.name.clone()));
        }
        for property in config.bound_properties() {
            if let Some(first) = bindings.insert(property, config.name.as_str()) {
                return Err(ConfigurationError::ConflictingBinding {
                    property: property.to_string(),
                    first: first.to_string(),
                    second: config.name.clone(),
                });
            }
        }
    }
    Ok(())
}

/// YAML file declaring a batch of servers for the standalone runner.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct BatchFile {
    /// Server entries, in registration order
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Settings shared by every entry
    #[serde(default)]
    pub settings: BatchSettings,
}

impl BatchFile {
    /// Load a batch from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigurationError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let batch: Self =
            serde_yaml::from_str(&content).map_err(|source| ConfigurationError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        batch.validate()?;
        Ok(batch)
    }

    /// Validate the batch.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validate_batch(&self.servers)
    }
}

/// Settings shared by a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchSettings {
    /// Root that resource stub locations are resolved against
    #[serde(default = "default_resources_root")]
    pub resources_root: PathBuf,

    /// Prefix used when an in-resources entry has no explicit location
    #[serde(default = "default_stub_prefix")]
    pub stub_prefix: String,

    /// Interface the servers bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Log every mounted stub at info level
    #[serde(default = "default_true")]
    pub verbose: bool,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            resources_root: default_resources_root(),
            stub_prefix: default_stub_prefix(),
            host: default_host(),
            verbose: true,
        }
    }
}

fn default_resources_root() -> PathBuf {
    PathBuf::from("tests/resources")
}

pub(crate) fn default_stub_prefix() -> String {
    "wiremock".to_string()
}

pub(crate) fn default_host() -> String {
    "127.0.0.1".to_string()
}
