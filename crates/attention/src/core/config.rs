//! Construction-time selection of the attention strategy.
//!
//! [`AttentionKind`] is the serialisable description stored in encoder
//! configuration files; [`Strategy`](crate::strategy::Strategy) is the runtime
//! value built from it.

use serde::{Deserialize, Serialize};

/// Default window length for robust attention.
pub const DEFAULT_BLOCK_SIZE: usize = 15;

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

/// How robust attention treats a sequence length that is not a multiple of
/// the block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockRemainder {
    /// The shorter final block is processed independently with its own length.
    #[default]
    Partial,
    /// Indivisible lengths are rejected with a shape error.
    Reject,
}

/// Closed set of attention strategies.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AttentionKind {
    /// Position-aligned additive scoring.
    #[default]
    Additive,
    /// Block-wise linear-complexity cosine-reweighted attention.
    Robust {
        #[serde(default = "default_block_size")]
        block_size: usize,
        #[serde(default)]
        remainder: BlockRemainder,
    },
}

impl AttentionKind {
    /// Robust attention with the default block size and partial final blocks.
    pub fn robust() -> Self {
        AttentionKind::Robust {
            block_size: DEFAULT_BLOCK_SIZE,
            remainder: BlockRemainder::Partial,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn robust_defaults_fill_in_missing_fields() {
        let kind: AttentionKind = serde_json::from_str(r#"{"type": "robust"}"#).unwrap();
        assert_eq!(kind, AttentionKind::robust());

        let kind: AttentionKind =
            serde_json::from_str(r#"{"type": "robust", "block_size": 10, "remainder": "reject"}"#)
                .unwrap();
        assert_eq!(
            kind,
            AttentionKind::Robust {
                block_size: 10,
                remainder: BlockRemainder::Reject
            }
        );
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        assert!(serde_json::from_str::<AttentionKind>(r#"{"type": "softmax"}"#).is_err());
        let additive: AttentionKind = serde_json::from_str(r#"{"type": "additive"}"#).unwrap();
        assert_eq!(additive, AttentionKind::default());
    }
}
