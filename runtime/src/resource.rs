//! Typed, named resources shared between kernels of a device.
//!
//! Resources live in named containers and are keyed by `(type, name)`, so the
//! same name may hold differently typed resources. Resource variables ([`Var`])
//! and the compilation cache are both stored here.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use kiln_device::{ResourceHandle, Tensor};
use kiln_dtype::DType;
use parking_lot::RwLock;
use snafu::ensure;
use tracing::debug;

use crate::error::{InvalidArgumentSnafu, ResourceExistsSnafu, ResourceNotFoundSnafu, Result};

/// Container used when a handle does not name one.
pub const DEFAULT_CONTAINER: &str = "localhost";

/// A value that can be stored in a [`ResourceMgr`].
pub trait Resource: Any + Send + Sync {
    fn debug_string(&self) -> String;
}

type Entry = Arc<dyn Any + Send + Sync>;
type Container = HashMap<(TypeId, String), Entry>;

/// Per-device resource manager.
pub struct ResourceMgr {
    default_container: String,
    containers: RwLock<HashMap<String, Container>>,
}

impl fmt::Debug for ResourceMgr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let containers = self.containers.read();
        f.debug_struct("ResourceMgr")
            .field("default_container", &self.default_container)
            .field("containers", &containers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for ResourceMgr {
    fn default() -> Self {
        Self::new(DEFAULT_CONTAINER)
    }
}

impl ResourceMgr {
    pub fn new(default_container: impl Into<String>) -> Self {
        Self { default_container: default_container.into(), containers: RwLock::new(HashMap::new()) }
    }

    pub fn default_container(&self) -> &str {
        &self.default_container
    }

    fn key<T: Resource>(name: &str) -> (TypeId, String) {
        (TypeId::of::<T>(), name.to_string())
    }

    fn downcast<T: Resource>(entry: &Entry) -> Option<Arc<T>> {
        Arc::clone(entry).downcast::<T>().ok()
    }

    /// Look up an existing resource of type `T`.
    pub fn lookup<T: Resource>(&self, container: &str, name: &str) -> Result<Arc<T>> {
        self.containers
            .read()
            .get(container)
            .and_then(|c| c.get(&Self::key::<T>(name)))
            .and_then(Self::downcast::<T>)
            .ok_or_else(|| {
                ResourceNotFoundSnafu { kind: type_name::<T>(), container: container.to_string(), name: name.to_string() }
                    .build()
            })
    }

    /// Insert a new resource; fails if one of the same type and name exists.
    pub fn create<T: Resource>(&self, container: &str, name: &str, resource: T) -> Result<Arc<T>> {
        let mut containers = self.containers.write();
        let entries = containers.entry(container.to_string()).or_default();
        let key = Self::key::<T>(name);
        ensure!(
            !entries.contains_key(&key),
            ResourceExistsSnafu { kind: type_name::<T>(), container: container.to_string(), name: name.to_string() }
        );

        let resource = Arc::new(resource);
        entries.insert(key, resource.clone());
        debug!(container, name, kind = type_name::<T>(), "resource created");
        Ok(resource)
    }

    /// Look up a resource, creating it with `creator` if absent.
    ///
    /// At most one creator runs per `(container, type, name)`; concurrent
    /// callers observe the same instance. A failing creator leaves nothing
    /// behind.
    pub fn lookup_or_create<T, F>(&self, container: &str, name: &str, creator: F) -> Result<Arc<T>>
    where
        T: Resource,
        F: FnOnce() -> Result<T>,
    {
        // Fast path: read lock to check for an existing resource
        if let Ok(existing) = self.lookup::<T>(container, name) {
            return Ok(existing);
        }

        let mut containers = self.containers.write();
        let entries = containers.entry(container.to_string()).or_default();
        let key = Self::key::<T>(name);

        // Double-check after acquiring write lock
        if let Some(existing) = entries.get(&key).and_then(Self::downcast::<T>) {
            return Ok(existing);
        }

        let resource = Arc::new(creator()?);
        debug!(container, name, resource = %resource.debug_string(), "resource created on lookup");
        entries.insert(key, resource.clone());
        Ok(resource)
    }

    /// Drop every resource in `container`. Returns whether it existed.
    ///
    /// Resources still referenced elsewhere stay alive until released.
    pub fn cleanup(&self, container: &str) -> bool {
        let removed = self.containers.write().remove(container);
        if let Some(entries) = &removed {
            debug!(container, resources = entries.len(), "container cleaned up");
        }
        removed.is_some()
    }
}

/// Mutable tensor-valued cell addressed through a [`ResourceHandle`].
#[derive(Debug)]
pub struct Var {
    dtype: DType,
    value: RwLock<Option<Tensor>>,
}

impl Var {
    /// An uninitialized variable.
    pub fn new(dtype: DType) -> Self {
        Self { dtype, value: RwLock::new(None) }
    }

    pub fn with_value(value: Tensor) -> Self {
        Self { dtype: value.dtype(), value: RwLock::new(Some(value)) }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn is_initialized(&self) -> bool {
        self.value.read().is_some()
    }

    /// Current value, read under the variable's lock.
    pub fn read(&self) -> Option<Tensor> {
        self.value.read().clone()
    }

    /// Replace the value under the variable's lock.
    pub fn assign(&self, value: Tensor) -> Result<()> {
        ensure!(
            value.dtype() == self.dtype,
            InvalidArgumentSnafu {
                message: format!("cannot assign {} value to {} variable", value.dtype(), self.dtype)
            }
        );
        *self.value.write() = Some(value);
        Ok(())
    }
}

impl Resource for Var {
    fn debug_string(&self) -> String {
        match &*self.value.read() {
            Some(value) => format!("Var<{}>{:?}", self.dtype, value.shape()),
            None => format!("Var<{}>(uninitialized)", self.dtype),
        }
    }
}

/// Resolve the variable behind `handle` in `mgr`.
pub fn lookup_var(mgr: &ResourceMgr, handle: &ResourceHandle) -> Result<Arc<Var>> {
    mgr.lookup::<Var>(&handle.container, &handle.name)
}
