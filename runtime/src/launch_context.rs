//! Marshalling between kernel tensors and executable buffers.

use std::sync::Arc;

use bon::bon;
use kiln_device::{DeviceBuffer, DeviceMemoryAllocator, Shape, ShapedBuffer, Tensor};
use kiln_dtype::DType;
use snafu::{ResultExt, ensure};
use tracing::trace;

use crate::client::{CompilationResult, ExecutionOutput, LocalClient, OutputDescription, ShapeRepresentationFn};
use crate::context::OpKernelContext;
use crate::error::{
    DeviceSnafu, ExecutionSnafu, InternalSnafu, InvalidArgumentSnafu, OutputCountMismatchSnafu,
    OutputShapeMismatchSnafu, Result, UninitializedVariableSnafu,
};
use crate::resource::Var;
use crate::snapshot::ResourceSnapshots;

/// Packs inputs for one executable run and unpacks its results.
#[derive(Clone)]
pub struct LaunchContext {
    client: Arc<dyn LocalClient>,
    allocator: Arc<dyn DeviceMemoryAllocator>,
    allocate_device_tensors: bool,
    use_multiple_streams: bool,
    shape_representation_fn: Option<ShapeRepresentationFn>,
}

#[bon]
impl LaunchContext {
    /// `allocate_device_tensors` is set on accelerator-device kinds, whose
    /// inputs arrive as device placeholders that are passed through uncopied.
    #[builder]
    pub fn new(
        client: Arc<dyn LocalClient>,
        allocator: Arc<dyn DeviceMemoryAllocator>,
        #[builder(default)] allocate_device_tensors: bool,
        #[builder(default)] use_multiple_streams: bool,
        shape_representation_fn: Option<ShapeRepresentationFn>,
    ) -> Self {
        Self { client, allocator, allocate_device_tensors, use_multiple_streams, shape_representation_fn }
    }
}

impl LaunchContext {
    pub fn client(&self) -> &Arc<dyn LocalClient> {
        &self.client
    }

    pub fn allocator(&self) -> &Arc<dyn DeviceMemoryAllocator> {
        &self.allocator
    }

    /// Assemble the executable's argument buffers in its declared order.
    ///
    /// Resource arguments come from `snapshots`; everything else from the
    /// kernel inputs. `missing_ctx_input_prefix` is the number of leading
    /// compiled inputs the kernel itself does not receive (the folded
    /// constants, for the run kernel of the split path).
    pub fn populate_inputs(
        &self,
        ctx: &OpKernelContext,
        result: &CompilationResult,
        snapshots: &ResourceSnapshots,
        missing_ctx_input_prefix: usize,
    ) -> Result<Vec<ShapedBuffer>> {
        let device_ordinal = ctx.stream().map_or(0, |stream| stream.device_ordinal());

        result
            .input_mapping
            .iter()
            .map(|&input_index| {
                let tensor = match snapshots.get(input_index) {
                    Some(slot) => slot.value.as_ref().ok_or_else(|| {
                        UninitializedVariableSnafu { handle: slot.handle.clone(), index: input_index }.build()
                    })?,
                    None => {
                        let ctx_index = input_index.checked_sub(missing_ctx_input_prefix).ok_or_else(|| {
                            InternalSnafu {
                                message: format!(
                                    "compiled input {input_index} falls in the missing prefix of {missing_ctx_input_prefix}"
                                ),
                            }
                            .build()
                        })?;
                        ctx.input(ctx_index)?
                    }
                };
                self.argument_buffer(tensor, device_ordinal)
            })
            .collect()
    }

    fn argument_buffer(&self, tensor: &Tensor, device_ordinal: i32) -> Result<ShapedBuffer> {
        if self.allocate_device_tensors
            && let Some(buffer) = tensor.device_buffer()
        {
            trace!(dtype = %tensor.dtype(), shape = ?tensor.shape(), "passing device tensor without copy");
            return ShapedBuffer::new(buffer.clone(), tensor.dtype(), tensor.shape()).context(DeviceSnafu);
        }

        let bytes = tensor.host_bytes().context(DeviceSnafu)?;
        let buffer = DeviceBuffer::from_host(Arc::clone(&self.allocator), device_ordinal, &bytes).context(DeviceSnafu)?;
        ShapedBuffer::new(buffer, tensor.dtype(), tensor.shape()).context(DeviceSnafu)
    }

    /// Publish the executable's results as kernel outputs and variable updates.
    ///
    /// Every result is validated before anything is written, so a shape or
    /// count mismatch never leaves a variable half-updated.
    pub fn populate_outputs(
        &self,
        ctx: &mut OpKernelContext,
        result: &CompilationResult,
        output: ExecutionOutput,
        snapshots: &ResourceSnapshots,
    ) -> Result<()> {
        let expected = result.num_result_buffers();
        ensure!(output.len() == expected, OutputCountMismatchSnafu { expected, actual: output.len() });
        let mut buffers = output.into_buffers().into_iter();

        let mut outputs = Vec::with_capacity(result.outputs.len());
        for (index, description) in result.outputs.iter().enumerate() {
            let tensor = match description {
                OutputDescription::Constant(value) => value.clone(),
                OutputDescription::Computed { dtype, shape } => {
                    let buffer = next_buffer(&mut buffers)?;
                    self.output_tensor(&format!("output {index}"), buffer, *dtype, shape)?
                }
            };
            outputs.push(tensor);
        }

        let mut updates: Vec<(Arc<Var>, Tensor)> = Vec::with_capacity(result.resource_updates.len());
        for update in &result.resource_updates {
            let slot = snapshots.get(update.input_index).ok_or_else(|| {
                InternalSnafu { message: format!("resource update of input {} has no snapshot", update.input_index) }
                    .build()
            })?;
            // The first write to a handle with no variable behind it creates one
            let var = ctx.resource_manager()?.lookup_or_create::<Var, _>(
                &slot.handle.container,
                &slot.handle.name,
                || Ok(Var::new(update.dtype)),
            )?;
            ensure!(
                var.dtype() == update.dtype,
                InvalidArgumentSnafu {
                    message: format!("variable {} holds {}, update is {}", slot.handle, var.dtype(), update.dtype)
                }
            );
            let buffer = next_buffer(&mut buffers)?;
            let tensor = self.output_tensor(&format!("update of {}", slot.handle), buffer, update.dtype, &update.shape)?;
            updates.push((var, tensor));
        }

        if self.use_multiple_streams
            && let Some(stream) = ctx.stream()
        {
            stream.block_host_until_done(0).context(DeviceSnafu)?;
        }

        for (index, tensor) in outputs.into_iter().enumerate() {
            ctx.set_output(index, tensor);
        }
        for (var, tensor) in updates {
            var.assign(tensor)?;
        }
        Ok(())
    }

    /// Validate one result buffer against its representation shape.
    ///
    /// The tensor takes the logical shape when the representation only
    /// relabels it, and keeps the representation shape when it pads.
    fn output_tensor(&self, what: &str, buffer: ShapedBuffer, dtype: DType, declared: &Shape) -> Result<Tensor> {
        let expected: Shape = match &self.shape_representation_fn {
            Some(representation) => representation(declared.as_slice(), dtype),
            None => declared.clone(),
        };
        ensure!(
            buffer.dtype == dtype,
            ExecutionSnafu { reason: format!("{what} has dtype {}, expected {dtype}", buffer.dtype) }
        );
        ensure!(
            buffer.shape == expected,
            OutputShapeMismatchSnafu { what, expected: expected.to_vec(), actual: buffer.shape.to_vec() }
        );

        // A padded representation cannot be viewed under the logical shape
        if buffer.shape == *declared || dtype.byte_size(declared.iter().product()) != Some(buffer.buffer.size()) {
            return Ok(Tensor::from_device(buffer));
        }
        let shaped = ShapedBuffer::new(buffer.buffer, dtype, declared.clone()).context(DeviceSnafu)?;
        Ok(Tensor::from_device(shaped))
    }
}

fn next_buffer(buffers: &mut impl Iterator<Item = ShapedBuffer>) -> Result<ShapedBuffer> {
    buffers.next().ok_or_else(|| InternalSnafu { message: "executable returned too few buffers" }.build())
}
