//! Lifecycle coordination for a registration batch.
//!
//! For each entry the coordinator resolves-or-creates a server in the
//! [`Registry`], publishes its output bindings into the owning context, and
//! subscribes a teardown hook to the context's close event.

use crate::config::{validate_batch, ServerConfig};
use crate::context::{CloseHook, ContextId, OwningContext};
use crate::customizer::{CustomizerCatalog, CustomizerChain};
use crate::error::{ConfigurationError, LookupError, Result, StartupError, TeardownError};
use crate::registry::{RegisteredInstance, Registry, Resolution};
use crate::resolver::ConfigurationResolver;
use crate::server::{ServerFactory, ServerHandle};
use crate::source::ConfigurationSource;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Starts, publishes and tears down the servers of registration batches.
pub struct LifecycleCoordinator<F: ServerFactory> {
    factory: Arc<F>,
    registry: Arc<Registry<F::Handle>>,
    resolver: ConfigurationResolver,
    customizers: CustomizerCatalog,
}

impl<F: ServerFactory> LifecycleCoordinator<F> {
    /// Create a coordinator with its own registry and the built-in customizers.
    pub fn new(factory: F) -> Self {
        Self {
            factory: Arc::new(factory),
            registry: Arc::new(Registry::new()),
            resolver: ConfigurationResolver::default(),
            customizers: CustomizerCatalog::with_builtins(),
        }
    }

    /// Share an existing registry.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<Registry<F::Handle>>) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the configuration resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: ConfigurationResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Replace the customizer catalog.
    #[must_use]
    pub fn with_customizers(mut self, customizers: CustomizerCatalog) -> Self {
        self.customizers = customizers;
        self
    }

    /// Mutable access to the customizer catalog.
    pub fn customizers_mut(&mut self) -> &mut CustomizerCatalog {
        &mut self.customizers
    }

    /// The registry backing this coordinator.
    pub fn registry(&self) -> &Arc<Registry<F::Handle>> {
        &self.registry
    }

    /// The server factory.
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Register every entry produced by `source`.
    pub async fn register_source<C, S>(
        &self,
        context: &C,
        source: &S,
    ) -> Result<Vec<RegisteredInstance<F::Handle>>>
    where
        C: OwningContext + ?Sized,
        S: ConfigurationSource + ?Sized,
    {
        let batch = source.server_configs()?;
        self.register_batch(context, &batch).await
    }

    /// Register a batch into `context`.
    ///
    /// Configuration errors abort the batch before any server starts. A
    /// startup error aborts the rest of the batch; servers already started
    /// stay registered and stop when the context closes.
    pub async fn register_batch<C>(
        &self,
        context: &C,
        batch: &[ServerConfig],
    ) -> Result<Vec<RegisteredInstance<F::Handle>>>
    where
        C: OwningContext + ?Sized,
    {
        let ctx = context.id();
        if context.is_closed() {
            return Err(StartupError::ContextClosed(ctx).into());
        }
        validate_batch(batch)?;
        debug!(context = %ctx, servers = batch.len(), "Registering mock server batch");

        let mut prepared = Vec::with_capacity(batch.len());
        for config in batch {
            if self.registry.find(ctx, &config.name).await.is_some() {
                prepared.push(None);
            } else {
                prepared.push(Some(self.build(config)?));
            }
        }

        let mut instances = Vec::with_capacity(batch.len());
        for (config, handle) in batch.iter().zip(prepared) {
            let instance = self.resolve_or_create(context, config, handle).await?;
            if batch.len() == 1 {
                self.registry.set_default(ctx, &instance.name).await;
            }
            instances.push(instance);
        }
        Ok(instances)
    }

    fn build(&self, config: &ServerConfig) -> Result<F::Handle, ConfigurationError> {
        let mut params = self.resolver.resolve(config);
        CustomizerChain::from_config(&self.customizers, config)?.apply(&mut params, config);
        info!(name = %config.name, port = params.port, "Configuring mock server");
        self.factory.build(params)
    }

    async fn resolve_or_create<C>(
        &self,
        context: &C,
        config: &ServerConfig,
        prepared: Option<F::Handle>,
    ) -> Result<RegisteredInstance<F::Handle>>
    where
        C: OwningContext + ?Sized,
    {
        let ctx = context.id();
        let registered = self.registry.find(ctx, &config.name).await.is_some();
        let handle = match prepared {
            Some(handle) => Some(handle),
            None if registered => None,
            // removed since the batch was prepared
            None => Some(self.build(config)?),
        };

        let (instance, resolution) = self
            .registry
            .resolve_or_create(ctx, &config.name, || async move {
                let handle = match handle {
                    Some(handle) => Arc::new(handle),
                    None => {
                        return Err(StartupError::Server {
                            name: config.name.clone(),
                            reason: "instance disappeared while the batch was registering"
                                .to_string(),
                        })
                    }
                };
                handle.start().await?;
                Ok::<_, StartupError>(RegisteredInstance::new(config.clone(), handle))
            })
            .await?;

        match resolution {
            Resolution::Created => {
                let teardown = Box::new(Teardown {
                    label: format!("stop mock server '{}'", instance.name),
                    registry: Arc::clone(&self.registry),
                    context: ctx,
                    name: instance.name.clone(),
                });
                if let Err(teardown) = context.on_close(teardown) {
                    warn!(
                        context = %ctx,
                        name = %instance.name,
                        "Test context closed while the mock server was starting"
                    );
                    if let Err(e) = teardown.on_close().await {
                        warn!(name = %instance.name, error = %e, "Mock server did not stop cleanly");
                    }
                    return Err(StartupError::ContextClosed(ctx).into());
                }
                info!(name = %instance.name, base_url = %instance.base_url, "Started mock server");
                publish_bindings(context, config, &instance);
            }
            Resolution::Reused => {
                info!(name = %config.name, "Mock server is already configured");
                if instance.config != *config {
                    warn!(
                        name = %config.name,
                        "Mock server was created from a different declaration; keeping the first"
                    );
                }
            }
        }
        Ok(instance)
    }

    /// Look up a registered instance by name.
    pub async fn instance<C>(
        &self,
        context: &C,
        name: &str,
    ) -> Result<RegisteredInstance<F::Handle>, LookupError>
    where
        C: OwningContext + ?Sized,
    {
        self.registry
            .find(context.id(), name)
            .await
            .ok_or_else(|| LookupError::NotFound {
                context: context.id(),
                name: name.to_string(),
            })
    }

    /// Handle of the server registered as `name`.
    pub async fn inject<C>(&self, context: &C, name: &str) -> Result<Arc<F::Handle>, LookupError>
    where
        C: OwningContext + ?Sized,
    {
        Ok(self.instance(context, name).await?.handle)
    }

    /// The server activated by a single-entry batch.
    pub async fn default_instance<C>(
        &self,
        context: &C,
    ) -> Result<RegisteredInstance<F::Handle>, LookupError>
    where
        C: OwningContext + ?Sized,
    {
        self.registry
            .default_instance(context.id())
            .await
            .ok_or(LookupError::NoDefault(context.id()))
    }
}

fn publish_bindings<C, H>(context: &C, config: &ServerConfig, instance: &RegisteredInstance<H>)
where
    C: OwningContext + ?Sized,
{
    let base_urls = config
        .base_url_properties
        .iter()
        .map(|p| (p, instance.base_url.clone()));
    let ports = config
        .port_properties
        .iter()
        .map(|p| (p, instance.port.to_string()));

    for (property, value) in base_urls.chain(ports) {
        let property = property.trim();
        if property.is_empty() {
            continue;
        }
        debug!(name = %config.name, property = %property, value = %value, "Publishing property");
        context.set_property(property, value);
    }
}

/// Stops one registered server when its context closes.
struct Teardown<H> {
    label: String,
    registry: Arc<Registry<H>>,
    context: ContextId,
    name: String,
}

#[async_trait]
impl<H: ServerHandle> CloseHook for Teardown<H> {
    fn name(&self) -> &str {
        &self.label
    }

    async fn on_close(&self) -> Result<(), TeardownError> {
        self.registry.remove(self.context, &self.name).await.map(|_| ())
    }
}
