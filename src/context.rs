//! Owning test contexts.
//!
//! A context owns an environment of string properties and a list of close
//! hooks. Registered mock servers publish their bindings into the environment
//! and attach a hook that stops them when the context closes.

use crate::error::TeardownError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a test context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    /// Allocate a fresh identity.
    pub fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Callback fired once when the owning context closes.
#[async_trait]
pub trait CloseHook: Send + Sync {
    /// Label used in logs and reports.
    fn name(&self) -> &str;

    /// Run the hook.
    async fn on_close(&self) -> Result<(), TeardownError>;
}

/// Lifecycle scope that owns registered mock servers.
pub trait OwningContext: Send + Sync {
    /// Stable identity used as the registry key.
    fn id(&self) -> ContextId;

    /// Write a property into the environment.
    fn set_property(&self, key: &str, value: String);

    /// Read a property from the environment.
    fn property(&self, key: &str) -> Option<String>;

    /// Subscribe a hook to the close event.
    ///
    /// Once the event has fired the hook is handed back unrun.
    fn on_close(&self, hook: Box<dyn CloseHook>) -> Result<(), Box<dyn CloseHook>>;

    /// Whether the close event has already fired.
    fn is_closed(&self) -> bool;
}

/// Outcome of closing a context.
#[derive(Debug, Default)]
pub struct CloseReport {
    /// Hooks that completed.
    pub completed: Vec<String>,
    /// Hooks that failed.
    pub failures: Vec<TeardownError>,
}

impl CloseReport {
    /// True when every hook completed.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// In-memory test context.
pub struct TestContext {
    id: ContextId,
    parent: Option<Arc<TestContext>>,
    environment: RwLock<BTreeMap<String, String>>,
    hooks: Mutex<Vec<Box<dyn CloseHook>>>,
    closed: AtomicBool,
}

impl TestContext {
    /// Create a root context.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_parent(None))
    }

    /// Create a nested context with its own identity.
    ///
    /// Property lookups fall back to the parent environment; servers
    /// registered in the parent are not visible through the child's id.
    pub fn child(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self::with_parent(Some(Arc::clone(self))))
    }

    fn with_parent(parent: Option<Arc<TestContext>>) -> Self {
        let id = ContextId::next();
        debug!(context = %id, parent = ?parent.as_ref().map(|p| p.id), "Test context created");
        Self {
            id,
            parent,
            environment: RwLock::new(BTreeMap::new()),
            hooks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Snapshot of the properties set directly on this context.
    pub fn environment(&self) -> BTreeMap<String, String> {
        self.environment
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Fire the close event.
    ///
    /// Hooks run once, in subscription order. A failing hook is logged and
    /// recorded; the remaining hooks still run. Closing again returns an
    /// empty report.
    pub async fn close(&self) -> CloseReport {
        let mut report = CloseReport::default();
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!(context = %self.id, "Test context already closed");
            return report;
        }

        let hooks = std::mem::take(&mut *self.hooks.lock().unwrap_or_else(PoisonError::into_inner));
        info!(context = %self.id, hooks = hooks.len(), "Closing test context");

        for hook in hooks {
            match hook.on_close().await {
                Ok(()) => report.completed.push(hook.name().to_string()),
                Err(e) => {
                    warn!(context = %self.id, hook = hook.name(), error = %e, "Close hook failed");
                    report.failures.push(e);
                }
            }
        }
        report
    }
}

impl OwningContext for TestContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn set_property(&self, key: &str, value: String) {
        self.environment
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
    }

    fn property(&self, key: &str) -> Option<String> {
        let own = self
            .environment
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned();
        own.or_else(|| self.parent.as_ref().and_then(|p| p.property(key)))
    }

    fn on_close(&self, hook: Box<dyn CloseHook>) -> Result<(), Box<dyn CloseHook>> {
        // checked under the hook lock; `close` marks itself closed before taking the hooks
        let mut hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return Err(hook);
        }
        hooks.push(hook);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for TestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestContext")
            .field("id", &self.id)
            .field("parent", &self.parent.as_ref().map(|p| p.id))
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingHook {
        name: String,
        calls: Arc<AtomicUsize>,
        order: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl CloseHook for CountingHook {
        fn name(&self) -> &str {
            &self.name
        }

        async fn on_close(&self) -> Result<(), TeardownError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(self.name.clone());
            if self.fail {
                return Err(TeardownError {
                    name: self.name.clone(),
                    reason: "boom".to_string(),
                });
            }
            Ok(())
        }
    }

    fn hook(
        name: &str,
        calls: &Arc<AtomicUsize>,
        order: &Arc<Mutex<Vec<String>>>,
        fail: bool,
    ) -> Box<dyn CloseHook> {
        Box::new(CountingHook {
            name: name.to_string(),
            calls: Arc::clone(calls),
            order: Arc::clone(order),
            fail,
        })
    }

    #[test]
    fn test_context_ids_are_unique() {
        let a = TestContext::new();
        let b = TestContext::new();
        let c = a.child();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert!(c.id().get() > a.id().get());
    }

    #[test]
    fn test_child_property_fallback() {
        let parent = TestContext::new();
        parent.set_property("shared", "parent".to_string());
        parent.set_property("overridden", "parent".to_string());

        let child = parent.child();
        child.set_property("overridden", "child".to_string());

        assert_eq!(child.property("shared").as_deref(), Some("parent"));
        assert_eq!(child.property("overridden").as_deref(), Some("child"));
        assert_eq!(parent.property("overridden").as_deref(), Some("parent"));
        assert!(child.environment().get("shared").is_none());
    }

    #[tokio::test]
    async fn test_close_runs_hooks_once_in_order() {
        let ctx = TestContext::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        assert!(ctx.on_close(hook("first", &calls, &order, false)).is_ok());
        assert!(ctx.on_close(hook("second", &calls, &order, false)).is_ok());

        let report = ctx.close().await;
        assert!(report.is_clean());
        assert_eq!(report.completed, vec!["first", "second"]);
        assert!(ctx.is_closed());

        let again = ctx.close().await;
        assert!(again.completed.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_failing_hook_does_not_block_others() {
        let ctx = TestContext::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        assert!(ctx.on_close(hook("broken", &calls, &order, true)).is_ok());
        assert!(ctx.on_close(hook("healthy", &calls, &order, false)).is_ok());

        let report = ctx.close().await;
        assert_eq!(report.completed, vec!["healthy"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].name, "broken");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_closed_context_hands_hook_back() {
        let ctx = TestContext::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        ctx.close().await;

        let rejected = match ctx.on_close(hook("late", &calls, &order, false)) {
            Err(hook) => hook,
            Ok(()) => panic!("Expected the hook back from a closed context"),
        };
        assert_eq!(rejected.name(), "late");
        assert!(ctx.close().await.completed.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
