//! Self-attention strategies for the encoder stack.
//!
//! Strategies consume head-partitioned tensors with layout
//! `[batch, head, length, d_tensor]` and return a tensor with the shape and
//! dtype of `V`. Two strategies are provided, both linear in sequence length:
//!
//! * [`AdditiveAttention`]: position-aligned additive scoring normalised by a
//!   softmax over positions.
//! * [`RobustAttention`]: block-wise cosine-reweighted linear attention built
//!   from running sums.
//!
//! [`MultiHeadAttention`] wraps a [`Strategy`] with the usual input projections
//! and head split. Key-padding masks are documented in [`masks`].

pub mod additive;
pub mod core;
pub mod masks;
pub mod multi_head;
pub mod robust;
pub mod strategy;

pub use additive::AdditiveAttention;
pub use core::{AttentionError, AttentionKind, AttentionStrategy, BlockRemainder};
pub use multi_head::MultiHeadAttention;
pub use robust::RobustAttention;
pub use strategy::Strategy;
