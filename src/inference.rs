//! Scoped inference mode.
//!
//! candle records an autograd graph for every op that touches a `Var`
//! (weights created through a `VarMap`). Inside an [`InferenceMode`] scope the
//! model modules detach their outputs, so the graph is dropped as soon as each
//! forward pass returns. The scope ends when the guard is dropped, whether the
//! call returned normally, early, or with an error.

use std::cell::Cell;
use std::marker::PhantomData;

use candle_core::Tensor;

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// RAII guard: inference mode is active on this thread while it lives.
///
/// Guards nest. The guard is `!Send` because the mode is thread-local.
#[must_use = "inference mode ends as soon as the guard is dropped"]
pub struct InferenceMode {
    _not_send: PhantomData<*const ()>,
}

impl InferenceMode {
    pub fn enter() -> Self {
        DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for InferenceMode {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Whether an [`InferenceMode`] guard is alive on this thread.
pub fn is_active() -> bool {
    DEPTH.with(|depth| depth.get() > 0)
}

/// Detach `tensor` from the autograd graph when inference mode is active.
pub fn detach_if_active(tensor: Tensor) -> Tensor {
    if is_active() { tensor.detach() } else { tensor }
}
