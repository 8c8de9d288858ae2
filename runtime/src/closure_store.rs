//! Single-use closures handed from the compile kernel to the run kernel.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::client::{CompilationResult, Executable, LocalClient};
use crate::compilation_cache::CompiledArtifact;
use crate::error::{Result, UnknownClosureKeySnafu};
use crate::snapshot::ResourceSnapshots;

/// A compiled cluster plus the snapshots it was compiled against.
#[derive(Debug)]
pub struct ExecutableClosure {
    artifact: Arc<CompiledArtifact>,
    snapshots: ResourceSnapshots,
    num_constant_args: usize,
}

impl ExecutableClosure {
    pub fn new(artifact: Arc<CompiledArtifact>, snapshots: ResourceSnapshots, num_constant_args: usize) -> Self {
        Self { artifact, snapshots, num_constant_args }
    }

    pub fn artifact(&self) -> &Arc<CompiledArtifact> {
        &self.artifact
    }

    pub fn client(&self) -> &Arc<dyn LocalClient> {
        &self.artifact.client
    }

    pub fn executable(&self) -> &Arc<dyn Executable> {
        &self.artifact.executable
    }

    pub fn compilation_result(&self) -> &CompilationResult {
        &self.artifact.compilation_result
    }

    pub fn snapshots(&self) -> &ResourceSnapshots {
        &self.snapshots
    }

    /// Leading compiled inputs the run kernel does not receive.
    pub fn num_constant_args(&self) -> usize {
        self.num_constant_args
    }
}

#[derive(Debug, Default)]
struct StoreState {
    next_key: u64,
    closures: HashMap<String, ExecutableClosure>,
}

/// Map from string keys to closures; each key can be consumed once.
#[derive(Debug)]
pub struct ClosureStore {
    state: Mutex<StoreState>,
    warn_on_leaks: bool,
}

impl Default for ClosureStore {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ClosureStore {
    pub fn new(warn_on_leaks: bool) -> Self {
        Self { state: Mutex::new(StoreState::default()), warn_on_leaks }
    }

    /// Store `closure` under a fresh key ("0", "1", ...).
    pub fn produce(&self, closure: ExecutableClosure) -> String {
        let mut state = self.state.lock();
        let key = state.next_key.to_string();
        state.next_key += 1;
        state.closures.insert(key.clone(), closure);
        debug!(key = %key, pending = state.closures.len(), "closure stored");
        key
    }

    /// Remove and return the closure stored under `key`.
    ///
    /// The entry is erased before the closure is used, so a failing run does
    /// not leave it behind.
    pub fn consume(&self, key: &str) -> Result<ExecutableClosure> {
        let closure = self.state.lock().closures.remove(key);
        closure.ok_or_else(|| UnknownClosureKeySnafu { key }.build())
    }

    /// Closures produced but not yet consumed.
    pub fn len(&self) -> usize {
        self.state.lock().closures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ClosureStore {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if self.warn_on_leaks && !state.closures.is_empty() {
            let mut keys: Vec<&str> = state.closures.keys().map(String::as_str).collect();
            keys.sort_unstable();
            warn!(leaked = keys.len(), ?keys, "closures never consumed by a run kernel");
        }
    }
}
