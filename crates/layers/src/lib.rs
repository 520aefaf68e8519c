//! Building blocks for the encoder stack.
//!
//! Every component here is a thin, shape-checked wrapper over Candle
//! primitives operating on `(batch, seq, hidden)` tensors. Forward passes take
//! an [`ExecutionContext`] so device placement, train/eval mode and dropout
//! randomness are explicit at every call site.

pub mod activations;
pub mod checks;
pub mod context;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;
pub mod residual;

pub use context::{ExecutionContext, ForwardMode};
pub use dtypes::PrecisionPolicy;
