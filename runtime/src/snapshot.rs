//! Per-invocation snapshots of the resource variables a cluster reads.
//!
//! The same snapshot is used to build the compilation signature and to feed
//! the executable, so a concurrent resize of a variable between the two can
//! never hand the executable a buffer of a shape it was not compiled for.

use std::collections::BTreeMap;

use kiln_device::{ResourceHandle, Tensor};
use kiln_dtype::DType;
use snafu::ResultExt;

use crate::context::OpKernelContext;
use crate::error::{DeviceSnafu, ErrorKind, Result};
use crate::resource::lookup_var;

/// Value of one resource variable at snapshot time.
#[derive(Debug, Clone)]
pub struct VariableSnapshot {
    pub handle: ResourceHandle,
    /// `None` if no variable exists behind the handle yet.
    pub dtype: Option<DType>,
    /// `None` if the variable was uninitialized or does not exist.
    pub value: Option<Tensor>,
}

/// Snapshots keyed by node input index.
#[derive(Debug, Clone, Default)]
pub struct ResourceSnapshots {
    slots: BTreeMap<usize, VariableSnapshot>,
}

impl ResourceSnapshots {
    /// Read every variable referenced by the inputs at `resource_indices`.
    ///
    /// Each value is read under its variable's lock. A handle with no variable
    /// behind it is recorded as an unset slot; any other failure aborts the
    /// whole capture.
    pub fn capture(ctx: &OpKernelContext, resource_indices: &[usize]) -> Result<Self> {
        if resource_indices.is_empty() {
            return Ok(Self::default());
        }

        let mgr = ctx.resource_manager()?;
        let mut slots = BTreeMap::new();
        for &index in resource_indices {
            let handle = ctx.input(index)?.resource_handle().context(DeviceSnafu)?.clone();
            let slot = match lookup_var(mgr, &handle) {
                Ok(var) => VariableSnapshot { dtype: Some(var.dtype()), value: var.read(), handle },
                Err(error) if error.kind() == ErrorKind::NotFound => {
                    VariableSnapshot { dtype: None, value: None, handle }
                }
                Err(error) => return Err(error),
            };
            slots.insert(index, slot);
        }
        Ok(Self { slots })
    }

    pub fn get(&self, index: usize) -> Option<&VariableSnapshot> {
        self.slots.get(&index)
    }

    pub fn contains(&self, index: usize) -> bool {
        self.slots.contains_key(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &VariableSnapshot)> {
        self.slots.iter().map(|(index, slot)| (*index, slot))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
