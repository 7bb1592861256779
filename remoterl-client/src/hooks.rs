//! Backend hooks.
//!
//! A simulator backend can plug in a poll callback, a stats source for
//! heartbeats and a policy loader. Nothing is required: the default hooks do
//! nothing. Hooks are swapped by explicit registration on a [`HookRegistry`].

use std::path::Path;
use std::sync::{Arc, RwLock};

use remoterl_common::SimulatorStats;

pub trait BackendHooks: Send + Sync {
    /// Called by the simulator host after every handled event.
    fn poll(&self) {}

    /// Stats attached to the next heartbeat.
    fn stats(&self) -> Option<SimulatorStats> {
        None
    }

    fn load_policy(&self, _path: &Path) -> Result<(), String> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl BackendHooks for NoopHooks {}

/// Holds the currently registered hooks.
pub struct HookRegistry {
    hooks: RwLock<Arc<dyn BackendHooks>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new(Arc::new(NoopHooks)),
        }
    }

    /// Replace the current hooks.
    pub fn register(&self, hooks: Arc<dyn BackendHooks>) {
        *self.hooks.write().unwrap_or_else(|p| p.into_inner()) = hooks;
    }

    /// Go back to the no-op hooks.
    pub fn reset(&self) {
        self.register(Arc::new(NoopHooks));
    }

    pub fn current(&self) -> Arc<dyn BackendHooks> {
        self.hooks.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn poll(&self) {
        self.current().poll();
    }

    pub fn stats(&self) -> Option<SimulatorStats> {
        self.current().stats()
    }

    pub fn load_policy(&self, path: &Path) -> Result<(), String> {
        self.current().load_policy(path)
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}
