//! Configuration customizers.
//!
//! Customizers are referenced by id from a [`ServerConfig`] and resolved
//! through a [`CustomizerCatalog`] of factories. The declared customizers of
//! one entry form a [`CustomizerChain`] that mutates the build parameters in
//! declaration order, each seeing what the previous ones did.

use crate::config::ServerConfig;
use crate::error::ConfigurationError;
use crate::resolver::BuildParameters;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Mutates build parameters before a server is built.
pub trait ConfigurationCustomizer: Send + Sync {
    /// Apply the customization.
    fn customize(&self, params: &mut BuildParameters, config: &ServerConfig);
}

/// Builds a fresh customizer instance.
pub type CustomizerFactory =
    Arc<dyn Fn() -> Result<Box<dyn ConfigurationCustomizer>, String> + Send + Sync>;

/// Customizer factories keyed by id.
#[derive(Clone, Default)]
pub struct CustomizerCatalog {
    factories: HashMap<String, CustomizerFactory>,
}

impl CustomizerCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a catalog holding the built-in customizers.
    ///
    /// - `no-request-recording` → [`DisableRequestRecording`]
    /// - `quiet` → [`Quiet`]
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        catalog.register_default::<DisableRequestRecording>("no-request-recording");
        catalog.register_default::<Quiet>("quiet");
        catalog
    }

    /// Register a fallible factory under `id`, replacing any previous one.
    pub fn register<F>(&mut self, id: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Result<Box<dyn ConfigurationCustomizer>, String> + Send + Sync + 'static,
    {
        self.factories.insert(id.into(), Arc::new(factory));
        self
    }

    /// Register a customizer that needs no construction arguments.
    pub fn register_default<T>(&mut self, id: impl Into<String>) -> &mut Self
    where
        T: ConfigurationCustomizer + Default + 'static,
    {
        self.register(id, || Ok(Box::new(T::default()) as Box<dyn ConfigurationCustomizer>))
    }

    /// Register a customizer value; every instantiation clones it.
    pub fn register_value<T>(&mut self, id: impl Into<String>, value: T) -> &mut Self
    where
        T: ConfigurationCustomizer + Clone + 'static,
    {
        self.register(id, move || {
            Ok(Box::new(value.clone()) as Box<dyn ConfigurationCustomizer>)
        })
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    /// Build a new instance of customizer `id`.
    pub fn instantiate(&self, id: &str) -> Result<Box<dyn ConfigurationCustomizer>, ConfigurationError> {
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| ConfigurationError::UnknownCustomizer(id.to_string()))?;
        factory().map_err(|reason| ConfigurationError::CustomizerInstantiation {
            customizer: id.to_string(),
            reason,
        })
    }
}

impl fmt::Debug for CustomizerCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.factories.keys().collect();
        ids.sort();
        f.debug_struct("CustomizerCatalog").field("ids", &ids).finish()
    }
}

/// Instantiated customizers for one server entry, in declaration order.
pub struct CustomizerChain {
    customizers: Vec<(String, Box<dyn ConfigurationCustomizer>)>,
}

impl CustomizerChain {
    /// Instantiate every customizer declared by `config`.
    ///
    /// Fails on the first id that is unknown or whose factory fails, before
    /// any customizer has run.
    pub fn from_config(
        catalog: &CustomizerCatalog,
        config: &ServerConfig,
    ) -> Result<Self, ConfigurationError> {
        let mut customizers = Vec::with_capacity(config.customizers.len());
        for id in &config.customizers {
            customizers.push((id.clone(), catalog.instantiate(id)?));
        }
        Ok(Self { customizers })
    }

    /// Run the chain.
    pub fn apply(&self, params: &mut BuildParameters, config: &ServerConfig) {
        for (id, customizer) in &self.customizers {
            debug!(name = %config.name, customizer = %id, "Applying configuration customizer");
            customizer.customize(params, config);
        }
    }

    /// Number of customizers in the chain.
    pub fn len(&self) -> usize {
        self.customizers.len()
    }

    /// True when the entry declares no customizers.
    pub fn is_empty(&self) -> bool {
        self.customizers.is_empty()
    }
}

/// Adds a fixed delay to every stub the backend mounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay(pub Duration);

impl FixedDelay {
    /// Delay of `ms` milliseconds.
    pub fn millis(ms: u64) -> Self {
        Self(Duration::from_millis(ms))
    }
}

impl ConfigurationCustomizer for FixedDelay {
    fn customize(&self, params: &mut BuildParameters, _config: &ServerConfig) {
        params.fixed_delay = Some(self.0);
    }
}

/// Stops the server from keeping received requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisableRequestRecording;

impl ConfigurationCustomizer for DisableRequestRecording {
    fn customize(&self, params: &mut BuildParameters, _config: &ServerConfig) {
        params.record_requests = false;
    }
}

/// Logs mounted stubs at debug instead of info.
#[derive(Debug, Clone, Copy, Default)]
pub struct Quiet;

impl ConfigurationCustomizer for Quiet {
    fn customize(&self, params: &mut BuildParameters, _config: &ServerConfig) {
        params.verbose = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ConfigurationResolver;

    #[derive(Clone)]
    struct DoubleDelay;

    impl ConfigurationCustomizer for DoubleDelay {
        fn customize(&self, params: &mut BuildParameters, _config: &ServerConfig) {
            params.fixed_delay = params.fixed_delay.map(|d| d * 2);
        }
    }

    fn params_for(config: &ServerConfig) -> BuildParameters {
        ConfigurationResolver::default().resolve(config)
    }

    #[test]
    fn test_builtins_registered() {
        let catalog = CustomizerCatalog::with_builtins();
        assert!(catalog.contains("no-request-recording"));
        assert!(catalog.contains("quiet"));
        assert!(!catalog.contains("slow"));
    }

    #[test]
    fn test_chain_sets_delay() {
        let mut catalog = CustomizerCatalog::new();
        catalog.register_value("slow", FixedDelay::millis(250));

        let config = ServerConfig::new("billing").with_customizer("slow");
        let mut params = params_for(&config);
        let chain = CustomizerChain::from_config(&catalog, &config).unwrap();
        chain.apply(&mut params, &config);

        assert_eq!(params.fixed_delay, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_chain_runs_in_declared_order() {
        let mut catalog = CustomizerCatalog::new();
        catalog.register_value("slow", FixedDelay::millis(100));
        catalog.register_value("double", DoubleDelay);

        let forward = ServerConfig::new("a").with_customizer("slow").with_customizer("double");
        let mut params = params_for(&forward);
        CustomizerChain::from_config(&catalog, &forward)
            .unwrap()
            .apply(&mut params, &forward);
        assert_eq!(params.fixed_delay, Some(Duration::from_millis(200)));

        let reversed = ServerConfig::new("a").with_customizer("double").with_customizer("slow");
        let mut params = params_for(&reversed);
        CustomizerChain::from_config(&catalog, &reversed)
            .unwrap()
            .apply(&mut params, &reversed);
        assert_eq!(params.fixed_delay, Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_unknown_customizer() {
        let config = ServerConfig::new("a").with_customizer("missing");
        match CustomizerChain::from_config(&CustomizerCatalog::with_builtins(), &config) {
            Err(ConfigurationError::UnknownCustomizer(id)) => assert_eq!(id, "missing"),
            Err(other) => panic!("Expected UnknownCustomizer, got {:?}", other),
            Ok(_) => panic!("Expected an error"),
        }
    }

    #[test]
    fn test_failing_factory_names_customizer() {
        let mut catalog = CustomizerCatalog::with_builtins();
        catalog.register("needs-args", || Err("requires a delay argument".to_string()));

        let config = ServerConfig::new("a")
            .with_customizer("quiet")
            .with_customizer("needs-args");
        match CustomizerChain::from_config(&catalog, &config) {
            Err(ConfigurationError::CustomizerInstantiation { customizer, reason }) => {
                assert_eq!(customizer, "needs-args");
                assert!(reason.contains("delay"));
            }
            Err(other) => panic!("Expected CustomizerInstantiation, got {:?}", other),
            Ok(_) => panic!("Expected an error"),
        }
    }

    #[test]
    fn test_builtin_effects() {
        let catalog = CustomizerCatalog::with_builtins();
        let config = ServerConfig::new("a")
            .with_customizer("no-request-recording")
            .with_customizer("quiet");
        let mut params = params_for(&config);
        let chain = CustomizerChain::from_config(&catalog, &config).unwrap();
        assert_eq!(chain.len(), 2);
        chain.apply(&mut params, &config);
        assert!(!params.record_requests);
        assert!(!params.verbose);
    }
}
