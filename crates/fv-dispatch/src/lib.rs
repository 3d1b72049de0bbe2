#![forbid(unsafe_code)]

//! Vectorized-execution dispatch for tensor operators.
//!
//! A caller invokes an operator on values that may carry a hidden batch
//! axis. The registry maps each operator identity to exactly one handling
//! strategy: a hand-written batch rule, a decomposition onto other batched
//! operators, the generic per-slice fallback, or bespoke in-place
//! plumbing. Batch rules and decompositions live in [`batching`]; this
//! module owns the registry, the explicit vectorized-execution context
//! (level stack plus interception-exclusion guard), the persistent
//! batched-tensor wrapper, and the `vmap` driver.

pub mod batching;

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use fv_core::{DimError, MemoryFormat, TensorOp, TensorValue, maybe_wrap_dim};
use fv_kernels as kernels;
use rustc_hash::FxHashMap;

pub use batching::{
    BatchedValue, get_physical_dim, move_batch_dim_to_front, rank_without_batch_dim,
};

/// String-keyed operator parameters, shared with the kernel layer.
pub type OpParams = BTreeMap<String, String>;

// ── Errors ─────────────────────────────────────────────────────────

/// Recoverable batching errors. Internal invariant violations (a mutating
/// call outside an active context, a value not batched at the current
/// level, an unsupported batch-dim position for a mutating operator)
/// abort via panic instead; continuing past them would silently produce
/// wrong numeric results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    /// Operator has no registered handling strategy.
    NoBatchRule(TensorOp),
    /// Batch dimension out of bounds for the underlying rank.
    BatchDimOutOfBounds { bdim: usize, rank: usize },
    /// Logical dimension index out of range.
    Dim(DimError),
    /// Evaluation error from the underlying kernel.
    Kernel(String),
    /// Tensor construction or slicing error.
    Tensor(String),
    /// Bad operator parameter.
    Param {
        op: TensorOp,
        key: &'static str,
        detail: String,
    },
    /// Wrong number of tensor inputs for an operator.
    ArityMismatch {
        op: TensorOp,
        expected: usize,
        actual: usize,
    },
    /// diag is defined only for logical rank 1 or 2.
    InvalidDiagRank { rank: usize },
    /// Mutating operators only accept the default contiguous layout.
    UnsupportedMemoryFormat { format: String },
    /// In-place operators must go through `dispatch_in_place`.
    InPlaceViaFunctionalDispatch(TensorOp),
    /// `dispatch_in_place` reached an operator without in-place plumbing.
    NotAnInPlaceOp(TensorOp),
    /// vmap requires at least one argument.
    EmptyArgumentList,
    /// in_axes length must match the argument count.
    AxesCountMismatch { expected: usize, actual: usize },
    /// A requested vmap axis is out of bounds for its argument.
    AxisOutOfBounds { axis: i64, rank: usize },
    /// vmap requires at least one batched argument.
    NoBatchedArgument,
    /// vmap over a zero-sized batch axis.
    EmptyBatch,
    /// Batched arguments disagree on the batch size.
    MismatchedBatchSizes { expected: usize, actual: usize },
}

impl std::fmt::Display for BatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoBatchRule(op) => {
                write!(f, "no batching rule registered for operator: {}", op.as_str())
            }
            Self::BatchDimOutOfBounds { bdim, rank } => {
                write!(f, "batch dimension {} out of bounds for rank {}", bdim, rank)
            }
            Self::Dim(err) => write!(f, "{err}"),
            Self::Kernel(msg) => write!(f, "batch kernel error: {msg}"),
            Self::Tensor(msg) => write!(f, "batch tensor error: {msg}"),
            Self::Param { op, key, detail } => {
                write!(f, "bad param '{}' for {}: {}", key, op.as_str(), detail)
            }
            Self::ArityMismatch {
                op,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "arity mismatch for {}: expected {}, got {}",
                    op.as_str(),
                    expected,
                    actual
                )
            }
            Self::InvalidDiagRank { rank } => {
                write!(
                    f,
                    "diag batching is defined only for logical rank 1 or 2, got rank {}",
                    rank
                )
            }
            Self::UnsupportedMemoryFormat { format } => {
                write!(
                    f,
                    "resize_: batching rule only supports the default contiguous memory \
                     format, got '{format}'"
                )
            }
            Self::InPlaceViaFunctionalDispatch(op) => {
                write!(
                    f,
                    "{} mutates in place and must go through dispatch_in_place",
                    op.as_str()
                )
            }
            Self::NotAnInPlaceOp(op) => {
                write!(f, "{} has no in-place plumbing registered", op.as_str())
            }
            Self::EmptyArgumentList => write!(f, "vmap requires at least one argument"),
            Self::AxesCountMismatch { expected, actual } => {
                write!(
                    f,
                    "in_axes count mismatch: expected {}, got {}",
                    expected, actual
                )
            }
            Self::AxisOutOfBounds { axis, rank } => {
                write!(f, "vmap axis {} out of bounds for rank {}", axis, rank)
            }
            Self::NoBatchedArgument => {
                write!(f, "vmap requires at least one batched argument")
            }
            Self::EmptyBatch => write!(f, "vmap over an empty batch axis"),
            Self::MismatchedBatchSizes { expected, actual } => {
                write!(
                    f,
                    "batched arguments disagree on batch size: expected {}, got {}",
                    expected, actual
                )
            }
        }
    }
}

impl std::error::Error for BatchError {}

impl From<DimError> for BatchError {
    fn from(value: DimError) -> Self {
        Self::Dim(value)
    }
}

pub(crate) fn kernel_err(err: kernels::KernelError) -> BatchError {
    BatchError::Kernel(err.to_string())
}

pub(crate) fn tensor_err(err: fv_core::ValueError) -> BatchError {
    BatchError::Tensor(err.to_string())
}

// ── Dispatch registry ──────────────────────────────────────────────

pub type BatchRuleFn = fn(&[BatchedValue], &OpParams) -> Result<BatchedValue, BatchError>;
pub type DecompositionFn =
    fn(&BatchDispatcher<'_>, &[BatchedValue], &OpParams) -> Result<BatchedValue, BatchError>;
pub type InPlaceRuleFn = fn(&VmapContext, &BatchedTensor, &OpParams) -> Result<(), BatchError>;

/// How one operator is handled under vectorized execution. Exactly one
/// strategy per operator.
#[derive(Debug, Clone, Copy)]
pub enum BatchingStrategy {
    /// Hand-written batch rule.
    Rule(BatchRuleFn),
    /// Composition of other already-batched operators.
    Decomposition(DecompositionFn),
    /// Generic per-slice loop-and-stack plumbing.
    Fallback,
    /// Bespoke plumbing for a mutating operator.
    InPlace(InPlaceRuleFn),
}

/// Operator-identity to strategy table. Built once at startup and
/// read-only afterward; lookup is by exact identity.
pub struct BatchRuleRegistry {
    table: FxHashMap<TensorOp, BatchingStrategy>,
}

impl BatchRuleRegistry {
    /// The default registration set.
    #[must_use]
    pub fn with_default_rules() -> Self {
        use crate::batching as rules;
        let mut table: FxHashMap<TensorOp, BatchingStrategy> = FxHashMap::default();

        table.insert(
            TensorOp::Unsqueeze,
            BatchingStrategy::Rule(rules::unsqueeze_batch_rule),
        );
        table.insert(
            TensorOp::Repeat,
            BatchingStrategy::Rule(rules::repeat_batch_rule),
        );
        table.insert(TensorOp::Diag, BatchingStrategy::Rule(rules::diag_batch_rule));
        table.insert(
            TensorOp::Diagonal,
            BatchingStrategy::Rule(rules::diagonal_batch_rule),
        );
        table.insert(
            TensorOp::UnsafeView,
            BatchingStrategy::Rule(rules::unsafe_view_batch_rule),
        );
        table.insert(TensorOp::Flip, BatchingStrategy::Rule(rules::flip_batch_rule));
        table.insert(TensorOp::Sum, BatchingStrategy::Rule(rules::sum_batch_rule));
        table.insert(
            TensorOp::BroadcastTo,
            BatchingStrategy::Rule(rules::broadcast_to_batch_rule),
        );
        table.insert(TensorOp::Slice, BatchingStrategy::Rule(rules::slice_batch_rule));
        table.insert(TensorOp::Tril, BatchingStrategy::Rule(rules::tril_batch_rule));
        table.insert(TensorOp::Triu, BatchingStrategy::Rule(rules::triu_batch_rule));

        table.insert(
            TensorOp::Trace,
            BatchingStrategy::Decomposition(rules::trace_decomposition),
        );
        table.insert(
            TensorOp::ExpandAs,
            BatchingStrategy::Decomposition(rules::expand_as_decomposition),
        );
        table.insert(
            TensorOp::Narrow,
            BatchingStrategy::Decomposition(rules::narrow_decomposition),
        );
        table.insert(
            TensorOp::Flatten,
            BatchingStrategy::Decomposition(rules::flatten_decomposition),
        );

        table.insert(TensorOp::Cumsum, BatchingStrategy::Fallback);
        table.insert(TensorOp::Movedim, BatchingStrategy::Fallback);

        table.insert(TensorOp::Resize, BatchingStrategy::InPlace(resize_plumbing));

        Self { table }
    }

    #[must_use]
    pub fn strategy(&self, op: TensorOp) -> Option<BatchingStrategy> {
        self.table.get(&op).copied()
    }

    #[must_use]
    pub fn is_registered(&self, op: TensorOp) -> bool {
        self.table.contains_key(&op)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

// ── Vectorized-execution context ───────────────────────────────────

/// Explicit context for vectorized execution: owns the stack of nesting
/// levels (innermost = highest number) and the interception-exclusion
/// flag. Passed by reference into everything that needs it; there is no
/// ambient global state.
#[derive(Debug)]
pub struct VmapContext {
    levels: RefCell<Vec<usize>>,
    next_level: Cell<usize>,
    excluded: Cell<bool>,
}

impl VmapContext {
    #[must_use]
    pub fn new() -> Self {
        Self {
            levels: RefCell::new(Vec::new()),
            next_level: Cell::new(1),
            excluded: Cell::new(false),
        }
    }

    /// The current (top-of-stack) level, or `None` outside any vectorized
    /// evaluation.
    #[must_use]
    pub fn current_level(&self) -> Option<usize> {
        self.levels.borrow().last().copied()
    }

    #[must_use]
    pub fn level_depth(&self) -> usize {
        self.levels.borrow().len()
    }

    /// Run `f` inside a fresh nesting level. The level is popped on every
    /// exit path, unwinding included.
    pub fn with_level<R>(&self, f: impl FnOnce(&Self, usize) -> R) -> R {
        let level = self.next_level.get();
        self.next_level.set(level + 1);
        self.levels.borrow_mut().push(level);
        let _pop = LevelPopGuard { ctx: self };
        f(self, level)
    }

    #[must_use]
    pub fn is_batching_excluded(&self) -> bool {
        self.excluded.get()
    }

    /// Suppress batching interception until the returned guard drops.
    /// The prior state is restored on every exit path.
    #[must_use]
    pub fn exclude_batching(&self) -> ExclusionGuard<'_> {
        let prev = self.excluded.replace(true);
        ExclusionGuard { ctx: self, prev }
    }
}

impl Default for VmapContext {
    fn default() -> Self {
        Self::new()
    }
}

struct LevelPopGuard<'a> {
    ctx: &'a VmapContext,
}

impl Drop for LevelPopGuard<'_> {
    fn drop(&mut self) {
        self.ctx.levels.borrow_mut().pop();
    }
}

/// Scoped suppression of batching interception, acquired immediately
/// before the one underlying call it must shield.
pub struct ExclusionGuard<'a> {
    ctx: &'a VmapContext,
    prev: bool,
}

impl Drop for ExclusionGuard<'_> {
    fn drop(&mut self) {
        self.ctx.excluded.set(self.prev);
    }
}

// ── Batched tensor wrapper ─────────────────────────────────────────

/// Persistent wrapper associating shared tensor storage with one
/// `(level, batch dim)` pair and a cached logical-size vector.
///
/// Nested vectorization wraps one `BatchedTensor` per level; a wrapper
/// never carries more than one batch dim. After an in-place mutation of
/// the storage, [`BatchedTensor::refresh_sizes`] must be called or the
/// cached metadata is observably stale.
#[derive(Debug, Clone)]
pub struct BatchedTensor {
    storage: Rc<RefCell<TensorValue>>,
    bdim: usize,
    level: usize,
    logical_sizes: RefCell<Vec<u32>>,
}

impl BatchedTensor {
    pub fn new(tensor: TensorValue, bdim: usize, level: usize) -> Result<Self, BatchError> {
        Self::from_shared(Rc::new(RefCell::new(tensor)), bdim, level)
    }

    /// Wrap already-shared storage. Aliases of the `Rc` observe in-place
    /// mutations made through the wrapper.
    pub fn from_shared(
        storage: Rc<RefCell<TensorValue>>,
        bdim: usize,
        level: usize,
    ) -> Result<Self, BatchError> {
        let rank = storage.borrow().rank();
        if bdim >= rank {
            return Err(BatchError::BatchDimOutOfBounds { bdim, rank });
        }
        let wrapper = Self {
            storage,
            bdim,
            level,
            logical_sizes: RefCell::new(Vec::new()),
        };
        wrapper.refresh_sizes();
        Ok(wrapper)
    }

    #[must_use]
    pub fn bdim(&self) -> usize {
        self.bdim
    }

    #[must_use]
    pub fn level(&self) -> usize {
        self.level
    }

    /// The cached shape the caller sees, excluding the batch axis.
    #[must_use]
    pub fn logical_sizes(&self) -> Vec<u32> {
        self.logical_sizes.borrow().clone()
    }

    /// The physical shape of the underlying storage.
    #[must_use]
    pub fn storage_sizes(&self) -> Vec<u32> {
        self.storage.borrow().shape.dims.clone()
    }

    #[must_use]
    pub fn storage_snapshot(&self) -> TensorValue {
        self.storage.borrow().clone()
    }

    /// Unwrap into a `(tensor, batch dim)` pair, but only when this
    /// wrapper is batched at `level`.
    #[must_use]
    pub fn unwrap_at_level(&self, level: usize) -> Option<(TensorValue, usize)> {
        (self.level == level).then(|| (self.storage.borrow().clone(), self.bdim))
    }

    /// Recompute the cached logical sizes from the underlying storage.
    pub fn refresh_sizes(&self) {
        let storage = self.storage.borrow();
        let mut sizes = storage.shape.dims.clone();
        if self.bdim < sizes.len() {
            sizes.remove(self.bdim);
        }
        *self.logical_sizes.borrow_mut() = sizes;
    }

    fn replace_storage(&self, tensor: TensorValue) {
        *self.storage.borrow_mut() = tensor;
    }
}

// ── Dispatch ───────────────────────────────────────────────────────

/// Registry-plus-context handle handed to vmapped callers and to
/// decompositions; `call` is the interception entry.
#[derive(Clone, Copy)]
pub struct BatchDispatcher<'a> {
    pub registry: &'a BatchRuleRegistry,
    pub ctx: &'a VmapContext,
}

impl<'a> BatchDispatcher<'a> {
    #[must_use]
    pub fn new(registry: &'a BatchRuleRegistry, ctx: &'a VmapContext) -> Self {
        Self { registry, ctx }
    }

    pub fn call(
        &self,
        op: TensorOp,
        inputs: &[BatchedValue],
        params: &OpParams,
    ) -> Result<BatchedValue, BatchError> {
        dispatch(self.registry, self.ctx, op, inputs, params)
    }
}

/// Route one operator invocation to its registered strategy.
///
/// Decompositions always run compositionally. For every other strategy,
/// an all-unbatched input set (or an exclusion guard being held) routes
/// straight to the unbatched kernel, which is what makes a batch rule
/// invoked with absent batch dims behave identically to a direct call.
pub fn dispatch(
    registry: &BatchRuleRegistry,
    ctx: &VmapContext,
    op: TensorOp,
    inputs: &[BatchedValue],
    params: &OpParams,
) -> Result<BatchedValue, BatchError> {
    let strategy = registry.strategy(op).ok_or(BatchError::NoBatchRule(op))?;

    if let BatchingStrategy::Decomposition(decomposition) = strategy {
        let dispatcher = BatchDispatcher { registry, ctx };
        return decomposition(&dispatcher, inputs, params);
    }
    if let BatchingStrategy::InPlace(_) = strategy {
        return Err(BatchError::InPlaceViaFunctionalDispatch(op));
    }

    if ctx.is_batching_excluded() || inputs.iter().all(|input| input.bdim.is_none()) {
        let values: Vec<TensorValue> = inputs.iter().map(|input| input.value.clone()).collect();
        let result = kernels::eval_op(op, &values, params).map_err(kernel_err)?;
        return Ok(BatchedValue::unbatched(result));
    }

    match strategy {
        BatchingStrategy::Rule(rule) => rule(inputs, params),
        BatchingStrategy::Fallback => batching::loop_and_stack(op, inputs, params),
        BatchingStrategy::Decomposition(_) | BatchingStrategy::InPlace(_) => {
            unreachable!("handled above")
        }
    }
}

/// Route a mutating operator to its registered in-place plumbing.
pub fn dispatch_in_place(
    registry: &BatchRuleRegistry,
    ctx: &VmapContext,
    op: TensorOp,
    value: &BatchedTensor,
    params: &OpParams,
) -> Result<(), BatchError> {
    match registry.strategy(op).ok_or(BatchError::NoBatchRule(op))? {
        BatchingStrategy::InPlace(plumbing) => plumbing(ctx, value, params),
        _ => Err(BatchError::NotAnInPlaceOp(op)),
    }
}

// ── In-place plumbing ──────────────────────────────────────────────

/// Resize a batched value in place: the underlying storage is resized to
/// `[batch] + size` and the wrapper's cached metadata refreshed. Only the
/// default contiguous memory format is supported, and the call must occur
/// inside an active vectorized-execution context.
pub fn resize_(
    registry: &BatchRuleRegistry,
    ctx: &VmapContext,
    value: &BatchedTensor,
    size: &[i64],
    memory_format: Option<MemoryFormat>,
) -> Result<(), BatchError> {
    let mut params = OpParams::new();
    params.insert("size".to_owned(), batching::format_csv(size));
    if let Some(format) = memory_format {
        params.insert("memory_format".to_owned(), format.as_str().to_owned());
    }
    dispatch_in_place(registry, ctx, TensorOp::Resize, value, &params)
}

fn resize_plumbing(
    ctx: &VmapContext,
    value: &BatchedTensor,
    params: &OpParams,
) -> Result<(), BatchError> {
    if let Some(format) = params.get("memory_format")
        && format != MemoryFormat::Contiguous.as_str()
    {
        return Err(BatchError::UnsupportedMemoryFormat {
            format: format.clone(),
        });
    }

    let Some(cur_level) = ctx.current_level() else {
        panic!("resize_ plumbing called outside an active vectorized-execution context");
    };
    let Some((tensor, bdim)) = value.unwrap_at_level(cur_level) else {
        panic!("resize_ plumbing expects a value batched at level {cur_level}");
    };
    // Supporting other positions needs the ability to rewrite the batch
    // dim metadata of a live wrapper, which the model does not provide.
    assert!(bdim == 0, "NYI: resize_ batch rule for batch dim != 0");

    let size = batching::parse_i64_list(TensorOp::Resize, "size", params)?;
    let requested: Vec<u32> = size
        .iter()
        .map(|&d| {
            u32::try_from(d).map_err(|_| BatchError::Param {
                op: TensorOp::Resize,
                key: "size",
                detail: format!("invalid dim {d}"),
            })
        })
        .collect::<Result<_, _>>()?;

    // Keep batching interception out of the underlying mutating call.
    let _guard = ctx.exclude_batching();

    let mut resized = move_batch_dim_to_front(&tensor, Some(bdim))?;
    let mut new_size = Vec::with_capacity(requested.len() + 1);
    new_size.push(resized.shape.dims[bdim]);
    new_size.extend_from_slice(&requested);
    kernels::resize_(&mut resized, &new_size).map_err(kernel_err)?;

    value.replace_storage(resized);
    value.refresh_sizes();
    Ok(())
}

// ── vmap driver ────────────────────────────────────────────────────

/// Vectorized map: enter a fresh nesting level, hand the caller's closure
/// batched views of `args` (per `in_axes`, `None` meaning broadcast), and
/// canonicalize the result with its batch axis at the front.
pub fn vmap<F>(
    registry: &BatchRuleRegistry,
    ctx: &VmapContext,
    args: &[TensorValue],
    in_axes: &[Option<i64>],
    f: F,
) -> Result<TensorValue, BatchError>
where
    F: FnOnce(&BatchDispatcher<'_>, &[BatchedValue]) -> Result<BatchedValue, BatchError>,
{
    if args.is_empty() {
        return Err(BatchError::EmptyArgumentList);
    }
    if in_axes.len() != args.len() {
        return Err(BatchError::AxesCountMismatch {
            expected: args.len(),
            actual: in_axes.len(),
        });
    }

    let mut batch_size: Option<u32> = None;
    let mut resolved: Vec<Option<usize>> = Vec::with_capacity(args.len());
    for (arg, axis) in args.iter().zip(in_axes) {
        match axis {
            None => resolved.push(None),
            Some(axis) => {
                let wrapped =
                    maybe_wrap_dim(*axis, arg.rank()).map_err(|_| BatchError::AxisOutOfBounds {
                        axis: *axis,
                        rank: arg.rank(),
                    })?;
                let size = arg.shape.dims[wrapped];
                match batch_size {
                    None => batch_size = Some(size),
                    Some(expected) if expected != size => {
                        return Err(BatchError::MismatchedBatchSizes {
                            expected: expected as usize,
                            actual: size as usize,
                        });
                    }
                    Some(_) => {}
                }
                resolved.push(Some(wrapped));
            }
        }
    }
    let Some(batch_size) = batch_size else {
        return Err(BatchError::NoBatchedArgument);
    };
    if batch_size == 0 {
        return Err(BatchError::EmptyBatch);
    }

    ctx.with_level(|ctx, _level| {
        let wrapped_args: Vec<BatchedValue> = args
            .iter()
            .zip(&resolved)
            .map(|(arg, axis)| match axis {
                Some(bdim) => BatchedValue::batched(arg.clone(), *bdim),
                None => BatchedValue::unbatched(arg.clone()),
            })
            .collect();
        let dispatcher = BatchDispatcher { registry, ctx };
        let out = f(&dispatcher, &wrapped_args)?;
        match out.bdim {
            Some(0) => Ok(out.value),
            Some(bdim) => move_batch_dim_to_front(&out.value, Some(bdim)),
            None => {
                // output independent of the mapped axis: replicate it
                // across the batch
                let mut size: Vec<i64> = vec![i64::from(batch_size)];
                size.extend(out.value.shape.dims.iter().map(|&d| i64::from(d)));
                kernels::broadcast_to(&out.value, &size).map_err(kernel_err)
            }
        }
    })
}
