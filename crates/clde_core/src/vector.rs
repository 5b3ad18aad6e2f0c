use crate::device::DeviceContext;
use crate::error::EngineError;
use crate::kernel_engine::{Binding, KernelSource, Program, WriteMode};
use crate::traits::Scalar;
use std::rc::Rc;

/// A fixed-length buffer resident on the context's device.
///
/// The vector exclusively owns its storage: it can be moved but not cloned.
/// Every mutation is a command on the context's queue.
pub struct DeviceVector<'ctx, T> {
    context: &'ctx DeviceContext,
    data: Vec<T>,
}

impl<'ctx, T: Scalar> DeviceVector<'ctx, T> {
    /// Allocates `length` zero-initialised elements.
    pub fn zeros(length: usize, context: &'ctx DeviceContext) -> Self {
        Self {
            context,
            data: vec![T::zero(); length],
        }
    }

    /// Allocates and uploads in one go.
    pub fn from_host(values: &[T], context: &'ctx DeviceContext) -> Self {
        let mut vector = Self::zeros(values.len(), context);
        vector.write(values);
        vector
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn context(&self) -> &'ctx DeviceContext {
        self.context
    }

    /// Replaces the contents; the length never changes.
    pub fn upload(&mut self, values: &[T]) -> Result<(), EngineError> {
        if values.len() != self.len() {
            return Err(EngineError::size_mismatch("vector upload", self.len(), values.len()));
        }
        self.write(values);
        Ok(())
    }

    /// Waits for the queue to drain, then copies the contents back.
    pub fn download(&self) -> Vec<T> {
        self.context.queue().finish();
        self.data.clone()
    }

    /// Device-side copy from another vector of the same length.
    pub fn copy_from(&mut self, other: &DeviceVector<'_, T>) -> Result<(), EngineError> {
        if other.len() != self.len() {
            return Err(EngineError::size_mismatch("vector copy", self.len(), other.len()));
        }
        let source = &other.data;
        let target = &mut self.data;
        self.context
            .queue()
            .submit("copy", || target.copy_from_slice(source));
        Ok(())
    }

    pub fn fill(&mut self, value: T) {
        let target = &mut self.data;
        self.context.queue().submit("fill", || target.fill(value));
    }

    fn write(&mut self, values: &[T]) {
        let target = &mut self.data;
        self.context
            .queue()
            .submit("upload", || target.copy_from_slice(values));
    }

    pub(crate) fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }
}

const ACCUMULATE_KERNEL: &str = "vector_accumulate";

/// The one fused vector primitive the integrator needs: `y += alpha * x`.
pub struct VectorAlgebra<'ctx> {
    context: &'ctx DeviceContext,
    accumulate: Rc<Program>,
}

impl<'ctx> VectorAlgebra<'ctx> {
    pub fn new(context: &'ctx DeviceContext) -> Result<Self, EngineError> {
        let source = KernelSource::new(ACCUMULATE_KERNEL, ["x"], ["alpha"], ["alpha * x"]);
        let accumulate = context.build_program(&source)?;
        Ok(Self {
            context,
            accumulate,
        })
    }

    /// `y[i] += alpha * x[i]` for every element. Like BLAS `axpy`, a zero
    /// `alpha` returns without touching `y`.
    pub fn accumulate<T: Scalar>(
        &self,
        y: &mut DeviceVector<'_, T>,
        x: &DeviceVector<'_, T>,
        alpha: T,
    ) -> Result<(), EngineError> {
        if y.len() != x.len() {
            return Err(EngineError::size_mismatch("accumulate operands", y.len(), x.len()));
        }
        if alpha.is_zero() {
            return Ok(());
        }
        let alpha = [alpha];
        let work_items = y.len();
        self.accumulate.dispatch(
            self.context.queue(),
            work_items,
            &[Binding::Rows {
                data: x.as_slice(),
                width: 1,
            }],
            &[Binding::Uniform(&alpha)],
            y.as_mut_slice(),
            WriteMode::Accumulate,
        )
    }
}
