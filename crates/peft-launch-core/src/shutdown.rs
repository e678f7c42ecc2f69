//! At-exit hooks and the shutdown guard.
//!
//! The distributed-communication collaborator registers
//! [`DIST_TEARDOWN_HOOK`] so its connection is destroyed at process exit.
//! The trainer's own exit path may already have destroyed it, and destroying
//! it twice fails, so the orchestrator cancels the hook once training returns.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{LaunchError, Result};
use crate::runtime::RuntimeContext;

/// Name under which the distributed collaborator registers its teardown.
pub const DIST_TEARDOWN_HOOK: &str = "distributed.destroy_connection";

type ExitAction = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Named, cancellable actions to run once at process exit.
#[derive(Default)]
pub struct ExitHooks {
    hooks: Mutex<Vec<(String, ExitAction)>>,
}

impl std::fmt::Debug for ExitHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitHooks")
            .field("registered", &self.names())
            .finish()
    }
}

impl ExitHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `action` to run at exit. Names need not be unique.
    pub fn register<F>(&self, name: &str, action: F) -> Result<()>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let mut hooks = self.lock()?;
        hooks.push((name.to_string(), Box::new(action)));
        debug!(hook = %name, "exit hook registered");
        Ok(())
    }

    /// Cancel every registration of `name`; returns how many were removed.
    ///
    /// Cancelling a name that is not registered removes nothing and is not an error.
    pub fn unregister(&self, name: &str) -> Result<usize> {
        let mut hooks = self.lock()?;
        let before = hooks.len();
        hooks.retain(|(registered, _)| registered != name);
        Ok(before - hooks.len())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.names().iter().any(|registered| registered == name)
    }

    pub fn names(&self) -> Vec<String> {
        match self.hooks.lock() {
            Ok(hooks) => hooks.iter().map(|(name, _)| name.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Run and drain the remaining hooks, last registered first.
    ///
    /// Failures are logged and collected; every hook still runs.
    pub fn run_pending(&self) -> Vec<(String, anyhow::Error)> {
        let drained: Vec<(String, ExitAction)> = match self.hooks.lock() {
            Ok(mut hooks) => hooks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        let mut failures = Vec::new();
        for (name, action) in drained.into_iter().rev() {
            debug!(hook = %name, "running exit hook");
            if let Err(err) = action() {
                tracing::warn!(hook = %name, error = %err, "exit hook failed");
                failures.push((name, err));
            }
        }
        failures
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<(String, ExitAction)>>> {
        self.hooks
            .lock()
            .map_err(|_| LaunchError::Teardown("exit hook registry poisoned".to_string()))
    }
}

/// Cancel the default distributed teardown hook. Never fails.
///
/// Returns whether a registration was actually removed; a missing or
/// already-cancelled hook is a no-op. Registry errors are logged and swallowed.
pub fn disable_default_teardown_hook(ctx: &RuntimeContext) -> bool {
    match ctx.exit_hooks().unregister(DIST_TEARDOWN_HOOK) {
        Ok(0) => {
            debug!(hook = DIST_TEARDOWN_HOOK, "teardown hook not registered");
            false
        }
        Ok(_) => {
            ctx.metrics().inc_teardown_unregistrations();
            debug!(hook = DIST_TEARDOWN_HOOK, "teardown hook cancelled");
            true
        }
        Err(err) => {
            crate::obs::emit_teardown_error(&err);
            false
        }
    }
}

/// Deferred teardown-hook correction.
///
/// Arm it before training starts. [`ShutdownGuard::release`] cancels the hook
/// explicitly; if the guard is dropped first (early return, panic unwinding)
/// the drop does it instead. Either way it happens once.
pub struct ShutdownGuard {
    ctx: Arc<RuntimeContext>,
    released: bool,
}

impl ShutdownGuard {
    pub fn arm(ctx: Arc<RuntimeContext>) -> Self {
        Self {
            ctx,
            released: false,
        }
    }

    /// Cancel the teardown hook now; later calls and the drop are no-ops.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        disable_default_teardown_hook(&self.ctx)
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_unregister_missing_is_noop() {
        let hooks = ExitHooks::new();
        assert_eq!(hooks.unregister(DIST_TEARDOWN_HOOK).unwrap(), 0);
        assert_eq!(hooks.unregister(DIST_TEARDOWN_HOOK).unwrap(), 0);
    }

    #[test]
    fn test_unregistered_hook_does_not_run() {
        let hooks = ExitHooks::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        hooks
            .register(DIST_TEARDOWN_HOOK, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert!(hooks.is_registered(DIST_TEARDOWN_HOOK));
        assert_eq!(hooks.unregister(DIST_TEARDOWN_HOOK).unwrap(), 1);
        assert!(hooks.run_pending().is_empty());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_run_pending_is_lifo_and_drains() {
        let hooks = ExitHooks::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second"] {
            let order = order.clone();
            hooks
                .register(name, move || {
                    order.lock().unwrap().push(name);
                    Ok(())
                })
                .unwrap();
        }
        hooks.run_pending();
        assert_eq!(*order.lock().unwrap(), vec!["second", "first"]);
        assert!(hooks.names().is_empty());
        assert!(hooks.run_pending().is_empty());
    }

    #[test]
    fn test_failing_hook_is_collected() {
        let hooks = ExitHooks::new();
        hooks
            .register("flaky", || Err(anyhow::anyhow!("already destroyed")))
            .unwrap();
        let failures = hooks.run_pending();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "flaky");
    }

    #[test]
    fn test_guard_releases_once() {
        let ctx = Arc::new(RuntimeContext::detached());
        ctx.exit_hooks()
            .register(DIST_TEARDOWN_HOOK, || Ok(()))
            .unwrap();

        let mut guard = ShutdownGuard::arm(ctx.clone());
        assert!(guard.release());
        assert!(!guard.release());
        drop(guard);
        assert_eq!(ctx.metrics().teardown_unregistrations(), 1);
    }

    #[test]
    fn test_guard_drop_cancels_hook() {
        let ctx = Arc::new(RuntimeContext::detached());
        ctx.exit_hooks()
            .register(DIST_TEARDOWN_HOOK, || Ok(()))
            .unwrap();
        {
            let _guard = ShutdownGuard::arm(ctx.clone());
        }
        assert!(!ctx.exit_hooks().is_registered(DIST_TEARDOWN_HOOK));
    }

    #[test]
    fn test_disable_twice_never_fails() {
        let ctx = RuntimeContext::detached();
        assert!(!disable_default_teardown_hook(&ctx));
        assert!(!disable_default_teardown_hook(&ctx));
    }
}
