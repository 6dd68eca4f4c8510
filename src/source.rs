//! Sources of declarative server entries.
//!
//! A source produces the ordered registration batch for one test context.
//! [`DeclarationScope`] models nested test scopes: the innermost scope's
//! entries come first, followed by those of each enclosing scope.

use crate::config::{BatchFile, ServerConfig};
use crate::error::ConfigurationError;
use std::collections::HashMap;
use tracing::info;

/// Produces an ordered list of server entries.
pub trait ConfigurationSource {
    /// Collect the entries, in registration order.
    fn server_configs(&self) -> Result<Vec<ServerConfig>, ConfigurationError>;
}

impl ConfigurationSource for [ServerConfig] {
    fn server_configs(&self) -> Result<Vec<ServerConfig>, ConfigurationError> {
        Ok(self.to_vec())
    }
}

impl ConfigurationSource for Vec<ServerConfig> {
    fn server_configs(&self) -> Result<Vec<ServerConfig>, ConfigurationError> {
        Ok(self.clone())
    }
}

impl ConfigurationSource for BatchFile {
    fn server_configs(&self) -> Result<Vec<ServerConfig>, ConfigurationError> {
        self.validate()?;
        Ok(self.servers.clone())
    }
}

/// A named declaration site with an optional enclosing site.
#[derive(Debug, Clone)]
pub struct DeclarationScope {
    name: String,
    servers: Vec<ServerConfig>,
    enclosing: Option<Box<DeclarationScope>>,
}

impl DeclarationScope {
    /// Create a top-level scope.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            servers: Vec::new(),
            enclosing: None,
        }
    }

    /// Declare a server in this scope.
    #[must_use]
    pub fn declare(mut self, config: ServerConfig) -> Self {
        self.servers.push(config);
        self
    }

    /// Nest a new scope inside this one.
    #[must_use]
    pub fn nested(self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            servers: Vec::new(),
            enclosing: Some(Box::new(self)),
        }
    }

    /// Scope name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn chain(&self) -> impl Iterator<Item = &DeclarationScope> {
        std::iter::successors(Some(self), |scope| scope.enclosing.as_deref())
    }
}

impl ConfigurationSource for DeclarationScope {
    /// Walk from this scope outwards.
    ///
    /// A name declared again further out with identical settings is folded
    /// into the first declaration. Differing settings are an error.
    fn server_configs(&self) -> Result<Vec<ServerConfig>, ConfigurationError> {
        let mut batch: Vec<ServerConfig> = Vec::new();
        let mut declared_in: HashMap<String, (usize, &str)> = HashMap::new();

        for scope in self.chain() {
            for config in &scope.servers {
                match declared_in.get(&config.name) {
                    Some((index, inner)) if batch[*index] == *config => {
                        info!(
                            name = %config.name,
                            scope = %scope.name,
                            first = %inner,
                            "Mock server already declared in an inner scope"
                        );
                    }
                    Some((_, inner)) => {
                        return Err(ConfigurationError::ConflictingDeclaration {
                            name: config.name.clone(),
                            inner: inner.to_string(),
                            outer: scope.name.clone(),
                        });
                    }
                    None => {
                        declared_in.insert(config.name.clone(), (batch.len(), scope.name.as_str()));
                        batch.push(config.clone());
                    }
                }
            }
        }
        Ok(batch)
    }
}
