//! Cleanup hooks run on termination signals
//!
//! Instances register a synchronous kill of their container here instead of
//! binding to process-wide signal state themselves, so tests can trigger
//! cleanup without real signals.

use crate::error::{DockrunError, DockrunResult};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A cleanup action. Must not block for long and must not panic.
pub type CleanupHook = Box<dyn Fn() + Send + Sync>;

/// Identifies a registered hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// Something instances can register cleanup with
pub trait CleanupRegistry: Send + Sync {
    /// Register a hook, returning an id for later removal
    fn register(&self, hook: CleanupHook) -> HookId;

    /// Remove a hook; unknown ids are ignored
    fn unregister(&self, id: HookId);
}

/// In-memory hook list, optionally wired to process signals
#[derive(Default)]
pub struct CleanupHooks {
    next_id: AtomicU64,
    hooks: Mutex<Vec<(HookId, Arc<dyn Fn() + Send + Sync>)>>,
}

impl CleanupHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered hooks
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every registered hook once, returning how many ran.
    ///
    /// Hooks run outside the internal lock; a panicking hook is logged and
    /// does not prevent the others from running.
    pub fn run_all(&self) -> usize {
        let hooks: Vec<_> = self.lock().iter().map(|(id, hook)| (*id, hook.clone())).collect();

        for (id, hook) in &hooks {
            if catch_unwind(AssertUnwindSafe(|| hook())).is_err() {
                warn!("Cleanup hook {:?} panicked", id);
            }
        }
        hooks.len()
    }

    /// Run all hooks once for every SIGINT, SIGQUIT or SIGTERM received.
    ///
    /// Installing the handlers replaces the default terminate action; the
    /// caller decides whether to exit afterwards.
    #[cfg(unix)]
    pub fn watch_signals(self: &Arc<Self>) -> DockrunResult<JoinHandle<()>> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())
            .map_err(|e| DockrunError::io("installing SIGINT handler", e))?;
        let mut quit = signal(SignalKind::quit())
            .map_err(|e| DockrunError::io("installing SIGQUIT handler", e))?;
        let mut terminate = signal(SignalKind::terminate())
            .map_err(|e| DockrunError::io("installing SIGTERM handler", e))?;

        let hooks = Arc::clone(self);
        Ok(tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    Some(()) = interrupt.recv() => "SIGINT",
                    Some(()) = quit.recv() => "SIGQUIT",
                    Some(()) = terminate.recv() => "SIGTERM",
                    else => break,
                };
                let ran = hooks.run_all();
                info!("Received {}, ran {} cleanup hooks", name, ran);
            }
        }))
    }

    #[cfg(not(unix))]
    pub fn watch_signals(self: &Arc<Self>) -> DockrunResult<JoinHandle<()>> {
        let hooks = Arc::clone(self);
        Ok(tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                let ran = hooks.run_all();
                info!("Received Ctrl-C, ran {} cleanup hooks", ran);
            }
        }))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(HookId, Arc<dyn Fn() + Send + Sync>)>> {
        self.hooks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CleanupRegistry for CleanupHooks {
    fn register(&self, hook: CleanupHook) -> HookId {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::from(hook)));
        debug!("Registered cleanup hook {:?}", id);
        id
    }

    fn unregister(&self, id: HookId) {
        self.lock().retain(|(existing, _)| *existing != id);
    }
}
