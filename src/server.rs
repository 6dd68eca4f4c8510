//! Mock server collaborator interfaces.
//!
//! The registry and coordinator never look inside a server; they build it,
//! start it, read its address and stop it.

use crate::error::{ConfigurationError, StartupError, TeardownError};
use crate::resolver::BuildParameters;
use async_trait::async_trait;

/// A built mock server.
#[async_trait]
pub trait ServerHandle: Send + Sync + 'static {
    /// Bind and start serving. Blocks until the server accepts requests.
    async fn start(&self) -> Result<(), StartupError>;

    /// Stop serving. Stopping a stopped server is a no-op.
    async fn stop(&self) -> Result<(), TeardownError>;

    /// `<scheme>://<host>:<port>` of the running server.
    fn base_url(&self) -> String;

    /// Bound port; 0 before start.
    fn port(&self) -> u16;

    /// Whether the server is currently serving.
    fn is_running(&self) -> bool;
}

/// Builds mock servers from resolved parameters.
pub trait ServerFactory: Send + Sync + 'static {
    /// Handle type produced by this factory.
    type Handle: ServerHandle;

    /// Build a server without binding any port.
    fn build(&self, params: BuildParameters) -> Result<Self::Handle, ConfigurationError>;
}
