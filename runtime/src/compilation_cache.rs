//! Compiled-cluster cache with at-most-one concurrent build per signature.
//!
//! Entries are kept in papaya's lock-free map so lookups for different
//! signatures never contend. Each entry carries its own mutex and condvar:
//! the first caller for a signature marks the entry as building and runs the
//! compiler without holding any lock, later callers wait on the condvar. A
//! failed build retires its entry and removes it from the map, so signatures
//! that never compile leave nothing behind and waiters retry on a fresh entry.
//!
//! The cache never evicts compiled artifacts. Artifacts are reference counted, so closures that
//! still hold one stay valid after the owning container is cleaned up.

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use kiln_device::Shape;
use kiln_dtype::DType;
use papaya::{Compute, HashMap, Operation};
use parking_lot::{Condvar, Mutex};
use snafu::ResultExt;
use tracing::{debug, warn};
use xxhash_rust::xxh64::Xxh64;

use crate::client::{CompilationResult, CompileOptions, CompilerArgument, CompilerOptions, Executable, LocalClient};
use crate::error::{DeviceSnafu, InvalidArgumentSnafu, Result};
use crate::function::FunctionSpec;
use crate::resource::Resource;

/// Compile-time constant as it appears in a signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstantValue {
    Bytes(Vec<u8>),
    Strings(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SignatureArg {
    Constant { dtype: DType, shape: Shape, value: ConstantValue },
    Parameter { dtype: DType, shape: Shape },
    Resource { dtype: DType, shape: Option<Shape> },
}

/// Deterministic cache key of a compilation request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    function: String,
    args: Vec<SignatureArg>,
    /// Argument positions of initialized resources.
    initialized_resources: Vec<usize>,
}

impl Signature {
    pub fn new(function: &FunctionSpec, args: &[CompilerArgument]) -> Result<Self> {
        let mut initialized_resources = Vec::new();
        let args = args
            .iter()
            .enumerate()
            .map(|(position, arg)| {
                Ok(match arg {
                    CompilerArgument::Constant(tensor) => {
                        let value = if tensor.dtype() == DType::String {
                            ConstantValue::Strings(tensor.strings().context(DeviceSnafu)?.to_vec())
                        } else if tensor.dtype().is_dense() {
                            ConstantValue::Bytes(tensor.host_bytes().context(DeviceSnafu)?.into_owned())
                        } else {
                            return InvalidArgumentSnafu {
                                message: format!("{} tensors cannot be compile-time constants", tensor.dtype()),
                            }
                            .fail();
                        };
                        SignatureArg::Constant { dtype: tensor.dtype(), shape: tensor.shape().into(), value }
                    }
                    CompilerArgument::Parameter { dtype, shape } => {
                        SignatureArg::Parameter { dtype: *dtype, shape: shape.clone() }
                    }
                    CompilerArgument::Resource { dtype, shape } => {
                        if shape.is_some() {
                            initialized_resources.push(position);
                        }
                        SignatureArg::Resource { dtype: *dtype, shape: shape.clone() }
                    }
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { function: function.canonical(), args, initialized_resources })
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    /// Stable 64-bit digest, for logs.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Xxh64::new(0);
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// Everything needed to launch a compiled cluster.
#[derive(Debug)]
pub struct CompiledArtifact {
    pub compilation_result: CompilationResult,
    pub executable: Arc<dyn Executable>,
    pub client: Arc<dyn LocalClient>,
    pub fingerprint: u64,
}

#[derive(Debug, Default)]
enum EntryState {
    #[default]
    Empty,
    Building,
    Ready(Arc<CompiledArtifact>),
    /// Removed from the map after a failed build.
    Retired,
}

#[derive(Debug, Default)]
struct Entry {
    state: Mutex<EntryState>,
    ready: Condvar,
}

/// Counters of a [`CompilationCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub requests: u64,
    pub compiles: u64,
    pub failed_compiles: u64,
    pub compile_time: Duration,
}

/// Cache of compiled clusters for one device.
#[derive(Debug)]
pub struct CompilationCache {
    options: CompilerOptions,
    entries: HashMap<Signature, Arc<Entry>>,
    requests: AtomicU64,
    compiles: AtomicU64,
    failed_compiles: AtomicU64,
    compile_time_us: AtomicU64,
}

impl CompilationCache {
    pub fn new(options: CompilerOptions) -> Self {
        Self {
            options,
            entries: HashMap::new(),
            requests: AtomicU64::new(0),
            compiles: AtomicU64::new(0),
            failed_compiles: AtomicU64::new(0),
            compile_time_us: AtomicU64::new(0),
        }
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    pub fn client(&self) -> &Arc<dyn LocalClient> {
        &self.options.client
    }

    /// Return the artifact for `(function, args)`, compiling it on a miss.
    ///
    /// Requests with equal signatures return the same artifact. Concurrent
    /// requests for a signature being built block until the build finishes.
    pub fn compile(
        &self,
        compile_options: &CompileOptions,
        function: &FunctionSpec,
        args: &[CompilerArgument],
    ) -> Result<Arc<CompiledArtifact>> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let signature = Signature::new(function, args)?;
        let entry = loop {
            let entry = self.entry(&signature);
            let mut state = entry.state.lock();
            while matches!(*state, EntryState::Building) {
                entry.ready.wait(&mut state);
            }
            if let EntryState::Ready(artifact) = &*state {
                return Ok(Arc::clone(artifact));
            }
            if matches!(*state, EntryState::Retired) {
                continue;
            }
            *state = EntryState::Building;
            drop(state);
            break entry;
        };

        let fingerprint = signature.fingerprint();
        debug!(function = %function, fingerprint, "compilation cache miss");

        let started = Instant::now();
        let compiled = self.options.client.compile(&self.options, compile_options, function, args);
        let elapsed = started.elapsed();
        self.compile_time_us.fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);

        let mut state = entry.state.lock();
        let outcome = match compiled {
            Ok((compilation_result, executable)) => {
                let compiles = self.compiles.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    function = %function,
                    fingerprint,
                    compiles,
                    elapsed_us = elapsed.as_micros() as u64,
                    "cluster compiled"
                );
                let artifact = Arc::new(CompiledArtifact {
                    compilation_result,
                    executable,
                    client: Arc::clone(&self.options.client),
                    fingerprint,
                });
                *state = EntryState::Ready(Arc::clone(&artifact));
                Ok(artifact)
            }
            Err(error) => {
                self.failed_compiles.fetch_add(1, Ordering::Relaxed);
                warn!(function = %function, %error, "compilation failed; entry dropped for retry");
                self.remove_entry(&signature, &entry);
                *state = EntryState::Retired;
                Err(error)
            }
        };
        entry.ready.notify_all();
        outcome
    }

    fn entry(&self, signature: &Signature) -> Arc<Entry> {
        let guard = self.entries.guard();

        // Fast path: entry already present
        if let Some(entry) = self.entries.get(signature, &guard) {
            return Arc::clone(entry);
        }

        // Atomic insert - if another thread beat us, use their entry
        let fresh = Arc::new(Entry::default());
        match self.entries.compute(
            signature.clone(),
            |existing| match existing {
                Some((_, entry)) => Operation::Abort(Arc::clone(entry)),
                None => Operation::Insert(Arc::clone(&fresh)),
            },
            &guard,
        ) {
            Compute::Inserted(_, entry) => Arc::clone(entry),
            Compute::Aborted(entry) => entry,
            _ => fresh,
        }
    }

    fn remove_entry(&self, signature: &Signature, entry: &Arc<Entry>) {
        let guard = self.entries.guard();
        let _ = self.entries.compute(
            signature.clone(),
            |existing| match existing {
                Some((_, current)) if Arc::ptr_eq(current, entry) => Operation::Remove,
                _ => Operation::Abort(()),
            },
            &guard,
        );
    }

    /// Number of signatures present in the map, including in-flight builds.
    pub(crate) fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of signatures with a compiled artifact.
    pub fn len(&self) -> usize {
        let guard = self.entries.guard();
        self.entries.iter(&guard).filter(|(_, entry)| matches!(*entry.state.lock(), EntryState::Ready(_))).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            requests: self.requests.load(Ordering::Relaxed),
            compiles: self.compiles.load(Ordering::Relaxed),
            failed_compiles: self.failed_compiles.load(Ordering::Relaxed),
            compile_time: Duration::from_micros(self.compile_time_us.load(Ordering::Relaxed)),
        }
    }
}

impl Resource for CompilationCache {
    fn debug_string(&self) -> String {
        let stats = self.stats();
        format!(
            "CompilationCache(device_type={}, compiles={}, failed={}, requests={})",
            self.options.device_type, stats.compiles, stats.failed_compiles, stats.requests
        )
    }
}
