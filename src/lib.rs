//! Zentinel Mock Server Registry
//!
//! Named mock HTTP servers scoped to a test context. Servers are declared,
//! started on first use, published into the context as properties, reused
//! for repeated declarations and stopped when the context closes.
//!
//! # Features
//!
//! - **Named Instances**: At most one running server per name and context
//! - **Property Publishing**: Base URL and port bound to context properties
//! - **Nested Scopes**: Inner declarations first, identical repeats folded
//! - **Customizers**: Adjust build parameters before a server starts
//! - **File Stubs**: `mappings/` and `__files/` loaded into `wiremock`
//!
//! # Example Configuration
//!
//! ```yaml
//! servers:
//!   - name: billing
//!     base_url_properties: [billing.url]
//!   - name: user-service
//!     port: 8081
//!     port_properties: [user-service.port]
//!     customizers: [quiet]
//! settings:
//!   resources_root: tests/resources
//! ```
//!
//! # Usage in tests
//!
//! ```no_run
//! use zentinel_mock_registry::{
//!     LifecycleCoordinator, OwningContext, ServerConfig, TestContext, WireMockFactory,
//! };
//!
//! # async fn run() -> zentinel_mock_registry::Result<()> {
//! let coordinator = LifecycleCoordinator::new(WireMockFactory::new());
//! let ctx = TestContext::new();
//! let billing = ServerConfig::new("billing").with_base_url_property("billing.url");
//! coordinator.register_batch(&*ctx, &[billing]).await?;
//!
//! let url = ctx.property("billing.url");
//! ctx.close().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod customizer;
pub mod error;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod source;
pub mod stubs;

#[cfg(test)]
mod testing;

pub use backend::{HealthCheck, ServerExtension, WireMockFactory, WireMockHandle};
pub use config::{BatchFile, BatchSettings, ServerConfig};
pub use context::{CloseHook, CloseReport, ContextId, OwningContext, TestContext};
pub use coordinator::LifecycleCoordinator;
pub use customizer::{ConfigurationCustomizer, CustomizerCatalog, FixedDelay};
pub use error::{ConfigurationError, Error, LookupError, Result, StartupError, TeardownError};
pub use registry::{RegisteredInstance, Registry};
pub use resolver::{BuildParameters, ConfigurationResolver, StubSource};
pub use server::{ServerFactory, ServerHandle};
pub use source::{ConfigurationSource, DeclarationScope};
