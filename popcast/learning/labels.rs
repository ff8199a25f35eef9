//! Ground-truth cascade sizes and the label transform.
//!
//! Sizes are clamped to at least one and mapped through `log2(size + 1)` before they reach the
//! loss. Training, evaluation and metrics all go through [`transform_size`]; only reporting
//! inverts it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stream::CascadeId;

/// Smallest size a cascade is credited with.
pub const MIN_CASCADE_SIZE: f64 = 1.0;

/// Maps a raw cascade size onto the training scale.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn transform_size(size: f64) -> f32 {
    (size.max(MIN_CASCADE_SIZE) + 1.0).log2() as f32
}

/// Maps a value on the training scale back to a cascade size.
#[must_use]
pub fn inverse_transform(value: f32) -> f64 {
    f64::from(value).exp2() - 1.0
}

/// Errors raised by label lookups.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LabelError {
    /// A batch referenced a cascade missing from the decoder table.
    #[error("cascade {0} has no ground-truth size")]
    UnknownCascade(CascadeId),
}

/// Read-only mapping from cascade id to final size.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DecoderTable {
    sizes: HashMap<CascadeId, f64>,
}

impl DecoderTable {
    /// Wraps an existing mapping.
    #[must_use]
    pub const fn new(sizes: HashMap<CascadeId, f64>) -> Self {
        Self { sizes }
    }

    /// Number of cascades with a known size.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    /// True when no sizes are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// Whether the cascade has a known size.
    #[must_use]
    pub fn contains(&self, cascade: CascadeId) -> bool {
        self.sizes.contains_key(&cascade)
    }

    /// Raw final size.
    pub fn size(&self, cascade: CascadeId) -> Result<f64, LabelError> {
        self.sizes
            .get(&cascade)
            .copied()
            .ok_or(LabelError::UnknownCascade(cascade))
    }

    /// Transformed label for one cascade.
    pub fn label(&self, cascade: CascadeId) -> Result<f32, LabelError> {
        self.size(cascade).map(transform_size)
    }

    /// Transformed labels for the cascades of a batch subset.
    pub fn labels(&self, cascades: &[CascadeId]) -> Result<Vec<f32>, LabelError> {
        cascades.iter().map(|cascade| self.label(*cascade)).collect()
    }
}

impl FromIterator<(CascadeId, f64)> for DecoderTable {
    fn from_iter<I: IntoIterator<Item = (CascadeId, f64)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_clamps_small_sizes() {
        assert_eq!(transform_size(0.0), 1.0);
        assert_eq!(transform_size(1.0), 1.0);
        assert_eq!(transform_size(3.0), 2.0);
    }

    #[test]
    fn inverse_recovers_sizes() {
        assert!((inverse_transform(transform_size(31.0)) - 31.0).abs() < 1e-4);
    }

    #[test]
    fn unknown_cascade_is_an_error() {
        let table: DecoderTable = [(7, 15.0)].into_iter().collect();
        assert_eq!(table.labels(&[7]).unwrap(), vec![4.0]);
        assert_eq!(table.label(8), Err(LabelError::UnknownCascade(8)));
    }

    #[test]
    fn table_deserialises_from_json_object() {
        let table: DecoderTable = serde_json::from_str(r#"{"1": 3.0, "2": 7}"#).unwrap();
        assert_eq!(table.size(2).unwrap(), 7.0);
        assert_eq!(table.len(), 2);
    }
}
