//! Error types for mock server registration, startup, lookup and teardown.

use crate::context::ContextId;
use std::path::PathBuf;
use thiserror::Error;

/// A malformed server entry or batch. Aborts the whole batch before any
/// server is started.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// The server name is empty after trimming.
    #[error("mock server name cannot be empty")]
    EmptyName,

    /// The same name appears twice in one registration batch.
    #[error("mock server '{0}' is declared more than once in the same batch")]
    DuplicateName(String),

    /// One output property is bound more than once within a batch.
    #[error("property '{property}' is bound by both '{first}' and '{second}'")]
    ConflictingBinding {
        /// Property key.
        property: String,
        /// Server that bound the property first.
        first: String,
        /// Server that tried to bind it again.
        second: String,
    },

    /// A name is declared again in an enclosing scope with different settings.
    #[error("mock server '{name}' is declared differently in scopes '{inner}' and '{outer}'")]
    ConflictingDeclaration {
        /// Server name.
        name: String,
        /// Scope holding the first declaration.
        inner: String,
        /// Enclosing scope holding the conflicting one.
        outer: String,
    },

    /// No customizer is registered under the given id.
    #[error("unknown configuration customizer '{0}'")]
    UnknownCustomizer(String),

    /// The customizer factory refused to build an instance.
    #[error("configuration customizer '{customizer}' could not be instantiated: {reason}")]
    CustomizerInstantiation {
        /// Customizer id.
        customizer: String,
        /// Failure reported by the factory.
        reason: String,
    },

    /// No extension is registered under the given id.
    #[error("unknown mock server extension '{0}'")]
    UnknownExtension(String),

    /// A body file was requested from a server without a stub location.
    #[error("mock server '{0}' has no stub location to read body files from")]
    NoStubLocation(String),

    /// A stub mapping failed validation.
    #[error("invalid stub mapping in {path}: {reason}")]
    InvalidStub {
        /// File the mapping came from.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },

    /// Reading a configuration or stub file failed.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File or directory being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Parsing a configuration or stub file failed.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// File being parsed.
        path: PathBuf,
        /// Underlying YAML error.
        #[source]
        source: serde_yaml::Error,
    },
}

/// A server failed to come up.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The listener could not be bound, usually because the port is taken.
    #[error("failed to bind mock server '{name}' to {host}:{port}: {source}")]
    Bind {
        /// Server name.
        name: String,
        /// Host the server tried to bind.
        host: String,
        /// Requested port (0 = ephemeral).
        port: u16,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The backend failed after binding.
    #[error("mock server '{name}' failed to start: {reason}")]
    Server {
        /// Server name.
        name: String,
        /// Failure reported by the backend.
        reason: String,
    },

    /// The handle was stopped before and cannot be started again.
    #[error("mock server '{0}' has already been stopped")]
    AlreadyStopped(String),

    /// Registration targeted a context that has already closed.
    #[error("test context {0} is already closed")]
    ContextClosed(ContextId),
}

/// A named instance could not be found.
#[derive(Debug, Error)]
pub enum LookupError {
    /// No instance with that name is registered in the context.
    #[error("no mock server named '{name}' is registered in test context {context}")]
    NotFound {
        /// Context that was searched.
        context: ContextId,
        /// Requested name.
        name: String,
    },

    /// No single-entry batch has activated a default instance.
    #[error("no default mock server is active in test context {0}")]
    NoDefault(ContextId),

    /// The instance exists but is not serving requests.
    #[error("mock server '{0}' is not running")]
    NotRunning(String),
}

/// Stopping a registered server failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to stop mock server '{name}': {reason}")]
pub struct TeardownError {
    /// Server name.
    pub name: String,
    /// Failure reported by the backend.
    pub reason: String,
}

/// Any error raised by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    /// Server startup failure.
    #[error(transparent)]
    Startup(#[from] StartupError),
    /// Named lookup failure.
    #[error(transparent)]
    Lookup(#[from] LookupError),
    /// Server teardown failure.
    #[error(transparent)]
    Teardown(#[from] TeardownError),
}

/// Result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
