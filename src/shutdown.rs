//! Shutdown hooks executed in registration order under one budget.
//!
//! Earlier-registered hooks typically hold earlier-acquired resources,
//! so the runner is strictly FIFO. A failing hook is logged and never
//! stops the hooks after it: shutdown is maximally thorough, not
//! fail-fast. The budget is shared across the whole sequence; there is
//! no per-hook allowance, so a hook can consume what remains for the
//! ones after it.

use std::sync::Mutex;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

type HookFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Accumulates cleanup callbacks and runs them once at shutdown.
#[derive(Default)]
pub struct ShutdownSequencer {
    hooks: Mutex<Vec<HookFn>>,
}

impl ShutdownSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a cleanup action. Hooks may be added any time before
    /// shutdown begins; additions after [`run`](Self::run) has drained
    /// the list are never invoked.
    pub fn add_hook<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks
            .lock()
            .expect("shutdown hook list poisoned")
            .push(Box::new(move || hook().boxed()));
    }

    /// Number of pending hooks.
    pub fn len(&self) -> usize {
        self.hooks.lock().expect("shutdown hook list poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every hook in registration order within `budget`.
    ///
    /// Returns the number of hooks that failed or were cut off. Each
    /// hook is awaited with whatever remains of the overall budget; a
    /// hook that outlives the remainder is counted as failed and the
    /// hooks after it are skipped with a warning.
    pub async fn run(&self, budget: Duration) -> usize {
        let hooks: Vec<HookFn> = {
            let mut pending = self.hooks.lock().expect("shutdown hook list poisoned");
            pending.drain(..).collect()
        };
        if hooks.is_empty() {
            return 0;
        }

        info!(hooks = hooks.len(), "running shutdown hooks");
        let deadline = Instant::now() + budget;
        let mut failures = 0;

        for (index, hook) in hooks.into_iter().enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(index, "shutdown budget exhausted, skipping remaining hooks");
                failures += 1;
                continue;
            }

            debug!(index, "executing shutdown hook");
            match tokio::time::timeout(remaining, hook()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    error!(index, error = %e, "shutdown hook failed");
                }
                Err(_) => {
                    failures += 1;
                    error!(index, "shutdown hook ran past the shutdown deadline");
                }
            }
        }

        failures
    }
}
