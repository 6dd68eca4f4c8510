//! Registry of running mock servers keyed by owning context and name.
//!
//! Each `(context, name)` key owns a once-cell. Concurrent first resolutions
//! of the same key race for the cell: one factory runs, the other callers
//! wait and observe its result. A failed creation leaves no entry behind.

use crate::config::ServerConfig;
use crate::context::ContextId;
use crate::error::{StartupError, TeardownError};
use crate::server::ServerHandle;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

/// A started server registered under a name.
#[derive(Debug)]
pub struct RegisteredInstance<H> {
    /// Registered name
    pub name: String,
    /// Running server
    pub handle: Arc<H>,
    /// Base URL captured after start
    pub base_url: String,
    /// Port captured after start
    pub port: u16,
    /// Entry the instance was created from
    pub config: ServerConfig,
}

impl<H> Clone for RegisteredInstance<H> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            handle: Arc::clone(&self.handle),
            base_url: self.base_url.clone(),
            port: self.port,
            config: self.config.clone(),
        }
    }
}

impl<H: ServerHandle> RegisteredInstance<H> {
    /// Capture the address of a started handle.
    pub fn new(config: ServerConfig, handle: Arc<H>) -> Self {
        Self {
            name: config.name.clone(),
            base_url: handle.base_url(),
            port: handle.port(),
            handle,
            config,
        }
    }
}

/// How a resolution was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The factory ran and its instance was stored.
    Created,
    /// An existing instance was returned.
    Reused,
}

type RegistryKey = (ContextId, String);
type Slot<H> = Arc<OnceCell<RegisteredInstance<H>>>;

/// Named mock server instances, scoped by owning context.
pub struct Registry<H> {
    entries: Mutex<HashMap<RegistryKey, Slot<H>>>,
    defaults: Mutex<HashMap<ContextId, String>>,
}

impl<H> Default for Registry<H> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            defaults: Mutex::new(HashMap::new()),
        }
    }
}

impl<H: ServerHandle> Registry<H> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the instance for `(context, name)`, running `create` if absent.
    ///
    /// `create` runs at most once per key while an instance is stored. When
    /// it fails, the error is returned and nothing is registered.
    pub async fn resolve_or_create<F, Fut>(
        &self,
        context: ContextId,
        name: &str,
        create: F,
    ) -> Result<(RegisteredInstance<H>, Resolution), StartupError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RegisteredInstance<H>, StartupError>>,
    {
        let key = (context, name.to_string());
        let slot = {
            let mut entries = self.entries.lock().await;
            Arc::clone(entries.entry(key.clone()).or_default())
        };

        let created = AtomicBool::new(false);
        let created_flag = &created;
        let result = slot
            .get_or_try_init(|| async move {
                created_flag.store(true, Ordering::SeqCst);
                create().await
            })
            .await
            .cloned();

        match result {
            Ok(instance) => {
                let resolution = if created.load(Ordering::SeqCst) {
                    Resolution::Created
                } else {
                    Resolution::Reused
                };
                Ok((instance, resolution))
            }
            Err(e) => {
                let mut entries = self.entries.lock().await;
                let stale = entries
                    .get(&key)
                    .is_some_and(|current| Arc::ptr_eq(current, &slot) && !current.initialized());
                if stale {
                    entries.remove(&key);
                }
                Err(e)
            }
        }
    }

    /// Look up a registered instance.
    pub async fn find(&self, context: ContextId, name: &str) -> Option<RegisteredInstance<H>> {
        let entries = self.entries.lock().await;
        entries
            .get(&(context, name.to_string()))
            .and_then(|slot| slot.get().cloned())
    }

    /// Names registered in `context`, sorted.
    pub async fn names(&self, context: ContextId) -> Vec<String> {
        let entries = self.entries.lock().await;
        let mut names: Vec<String> = entries
            .iter()
            .filter(|((ctx, _), slot)| *ctx == context && slot.initialized())
            .map(|((_, name), _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of registered instances across all contexts.
    pub async fn len(&self) -> usize {
        let entries = self.entries.lock().await;
        entries.values().filter(|slot| slot.initialized()).count()
    }

    /// True when nothing is registered.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stop and forget the instance for `(context, name)`.
    ///
    /// Returns `Ok(false)` when nothing was registered. The entry is removed
    /// even if stopping fails.
    pub async fn remove(&self, context: ContextId, name: &str) -> Result<bool, TeardownError> {
        let slot = {
            let mut entries = self.entries.lock().await;
            entries.remove(&(context, name.to_string()))
        };

        {
            let mut defaults = self.defaults.lock().await;
            if defaults.get(&context).is_some_and(|d| d == name) {
                defaults.remove(&context);
            }
        }

        let Some(instance) = slot.as_ref().and_then(|s| s.get()) else {
            debug!(context = %context, name = %name, "No mock server to remove");
            return Ok(false);
        };

        info!(context = %context, name = %name, "Stopping mock server");
        instance.handle.stop().await?;
        Ok(true)
    }

    /// Mark `name` as the default instance of `context`.
    pub async fn set_default(&self, context: ContextId, name: &str) {
        debug!(context = %context, name = %name, "Activating default mock server");
        self.defaults.lock().await.insert(context, name.to_string());
    }

    /// The default instance of `context`, if one is active.
    pub async fn default_instance(&self, context: ContextId) -> Option<RegisteredInstance<H>> {
        let name = self.defaults.lock().await.get(&context).cloned()?;
        self.find(context, &name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHandle;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn started(name: &str) -> Result<RegisteredInstance<FakeHandle>, StartupError> {
        let handle = Arc::new(FakeHandle::new(name, 0));
        handle.start().await?;
        Ok(RegisteredInstance::new(ServerConfig::new(name), handle))
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let registry = Registry::new();
        let ctx = ContextId::next();
        let calls = AtomicUsize::new(0);

        let (first, r1) = registry
            .resolve_or_create(ctx, "a", || {
                calls.fetch_add(1, Ordering::SeqCst);
                started("a")
            })
            .await
            .unwrap();
        let (second, r2) = registry
            .resolve_or_create(ctx, "a", || {
                calls.fetch_add(1, Ordering::SeqCst);
                started("a")
            })
            .await
            .unwrap();

        assert_eq!(r1, Resolution::Created);
        assert_eq!(r2, Resolution::Reused);
        assert!(Arc::ptr_eq(&first.handle, &second.handle));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.handle.start_count(), 1);
    }

    #[tokio::test]
    async fn test_distinct_names_get_distinct_ports() {
        let registry = Registry::new();
        let ctx = ContextId::next();
        let (a, _) = registry.resolve_or_create(ctx, "a", || started("a")).await.unwrap();
        let (b, _) = registry.resolve_or_create(ctx, "b", || started("b")).await.unwrap();

        assert!(!Arc::ptr_eq(&a.handle, &b.handle));
        assert_ne!(a.port, 0);
        assert_ne!(b.port, 0);
        assert_ne!(a.port, b.port);
        assert_eq!(registry.names(ctx).await, vec!["a", "b"]);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_contexts_are_isolated() {
        let registry = Registry::new();
        let one = ContextId::next();
        let two = ContextId::next();
        let (a1, _) = registry.resolve_or_create(one, "a", || started("a")).await.unwrap();
        let (a2, r) = registry.resolve_or_create(two, "a", || started("a")).await.unwrap();

        assert_eq!(r, Resolution::Created);
        assert!(!Arc::ptr_eq(&a1.handle, &a2.handle));
        assert!(registry.find(two, "b").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_access_creates_once() {
        let registry = Arc::new(Registry::new());
        let ctx = ContextId::next();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let calls = Arc::clone(&calls);
            tasks.push(tokio::spawn(async move {
                registry
                    .resolve_or_create(ctx, "shared", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        started("shared").await
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut handles = Vec::new();
        let mut created = 0;
        for task in tasks {
            let (instance, resolution) = task.await.unwrap();
            if resolution == Resolution::Created {
                created += 1;
            }
            handles.push(instance.handle);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(created, 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
    }

    #[tokio::test]
    async fn test_failed_creation_registers_nothing() {
        let registry: Registry<FakeHandle> = Registry::new();
        let ctx = ContextId::next();

        let result = registry
            .resolve_or_create(ctx, "broken", || async {
                Err(StartupError::Server {
                    name: "broken".to_string(),
                    reason: "port in use".to_string(),
                })
            })
            .await;
        assert!(result.is_err());
        assert!(registry.find(ctx, "broken").await.is_none());
        assert!(registry.is_empty().await);

        let (_, resolution) = registry
            .resolve_or_create(ctx, "broken", || started("broken"))
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Created);
    }

    #[tokio::test]
    async fn test_remove_stops_once() {
        let registry = Registry::new();
        let ctx = ContextId::next();
        let (a, _) = registry.resolve_or_create(ctx, "a", || started("a")).await.unwrap();

        assert!(registry.remove(ctx, "a").await.unwrap());
        assert!(!registry.remove(ctx, "a").await.unwrap());
        assert_eq!(a.handle.stop_count(), 1);
        assert!(!a.handle.is_running());
        assert!(registry.find(ctx, "a").await.is_none());

        let (fresh, resolution) = registry.resolve_or_create(ctx, "a", || started("a")).await.unwrap();
        assert_eq!(resolution, Resolution::Created);
        assert!(!Arc::ptr_eq(&fresh.handle, &a.handle));
    }

    #[tokio::test]
    async fn test_remove_reports_stop_failure() {
        let registry = Registry::new();
        let ctx = ContextId::next();
        registry
            .resolve_or_create(ctx, "flaky", || async {
                let handle = Arc::new(FakeHandle::new("flaky", 0).failing_stop());
                handle.start().await?;
                Ok::<_, StartupError>(RegisteredInstance::new(ServerConfig::new("flaky"), handle))
            })
            .await
            .unwrap();

        let err = registry.remove(ctx, "flaky").await.unwrap_err();
        assert_eq!(err.name, "flaky");
        assert!(registry.find(ctx, "flaky").await.is_none());
    }

    #[tokio::test]
    async fn test_default_cleared_on_remove() {
        let registry = Registry::new();
        let ctx = ContextId::next();
        registry.resolve_or_create(ctx, "a", || started("a")).await.unwrap();
        registry.set_default(ctx, "a").await;
        assert_eq!(registry.default_instance(ctx).await.unwrap().name, "a");

        registry.remove(ctx, "a").await.unwrap();
        assert!(registry.default_instance(ctx).await.is_none());
    }
}
