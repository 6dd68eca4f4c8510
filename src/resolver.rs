//! Turns declarative server entries into concrete startup parameters.

use crate::config::{default_host, default_stub_prefix, BatchSettings, ServerConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where a server loads its file-backed stubs from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubSource {
    /// Directory under the resources root
    Resources(PathBuf),
    /// Directory on the file system, used as given
    Directory(PathBuf),
    /// Whatever the backend does by default
    LibraryDefault,
}

impl StubSource {
    /// Resolved stub root, if any.
    pub fn root(&self) -> Option<&Path> {
        match self {
            StubSource::Resources(path) | StubSource::Directory(path) => Some(path),
            StubSource::LibraryDefault => None,
        }
    }
}

/// Concrete parameters handed to the server factory.
///
/// Customizers mutate these in place before the server is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildParameters {
    /// Server name
    pub name: String,
    /// Interface to bind
    pub host: String,
    /// Port to bind (0 = any free port)
    pub port: u16,
    /// Stub location
    pub stubs: StubSource,
    /// Extension ids, in declaration order
    pub extensions: Vec<String>,
    /// Delay added to every file-backed and extension stub
    pub fixed_delay: Option<Duration>,
    /// Keep received requests for later inspection
    pub record_requests: bool,
    /// Log mounted stubs at info level
    pub verbose: bool,
}

/// Resolves [`ServerConfig`] entries against shared defaults.
#[derive(Debug, Clone)]
pub struct ConfigurationResolver {
    resources_root: PathBuf,
    stub_prefix: String,
    host: String,
    verbose: bool,
}

impl Default for ConfigurationResolver {
    fn default() -> Self {
        Self::from_settings(&BatchSettings::default())
    }
}

impl ConfigurationResolver {
    /// Create a resolver rooted at `resources_root`.
    pub fn new(resources_root: impl Into<PathBuf>) -> Self {
        Self {
            resources_root: resources_root.into(),
            stub_prefix: default_stub_prefix(),
            host: default_host(),
            verbose: true,
        }
    }

    /// Create a resolver from batch file settings.
    pub fn from_settings(settings: &BatchSettings) -> Self {
        Self {
            resources_root: settings.resources_root.clone(),
            stub_prefix: settings.stub_prefix.clone(),
            host: settings.host.clone(),
            verbose: settings.verbose,
        }
    }

    /// Override the prefix used for default resource locations.
    #[must_use]
    pub fn with_stub_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.stub_prefix = prefix.into();
        self
    }

    /// Override the bind interface.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Resolve one entry.
    pub fn resolve(&self, config: &ServerConfig) -> BuildParameters {
        BuildParameters {
            name: config.name.clone(),
            host: self.host.clone(),
            port: config.port,
            stubs: self.resolve_stubs(config),
            extensions: config.extensions.clone(),
            fixed_delay: None,
            record_requests: true,
            verbose: self.verbose,
        }
    }

    fn resolve_stubs(&self, config: &ServerConfig) -> StubSource {
        let location = config.stub_location.trim();
        if config.stub_location_in_resources {
            let relative = if location.is_empty() {
                Path::new(&self.stub_prefix).join(&config.name)
            } else {
                PathBuf::from(location)
            };
            StubSource::Resources(self.resources_root.join(relative))
        } else if location.is_empty() {
            StubSource::LibraryDefault
        } else {
            StubSource::Directory(PathBuf::from(location))
        }
    }
}
