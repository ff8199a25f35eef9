use indexmap::IndexMap;
use ndarray::{Array, ArrayD, Dimension};
use serde::{Deserialize, Serialize};

use super::ModelError;

/// Ordered collection of named learnable tensors (or their gradients).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamStore {
    tensors: IndexMap<String, ArrayD<f32>>,
}

impl ParamStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a tensor.
    pub fn insert<D: Dimension>(&mut self, name: impl Into<String>, tensor: Array<f32, D>) {
        self.tensors.insert(name.into(), tensor.into_dyn());
    }

    /// Builder-style [`ParamStore::insert`].
    #[must_use]
    pub fn with<D: Dimension>(mut self, name: impl Into<String>, tensor: Array<f32, D>) -> Self {
        self.insert(name, tensor);
        self
    }

    /// Tensor by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(name)
    }

    /// Mutable tensor by name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut ArrayD<f32>> {
        self.tensors.get_mut(name)
    }

    /// Tensor by name, converted to a fixed dimensionality and checked against `shape`.
    pub fn typed<D: Dimension>(
        &self,
        name: &str,
        shape: &[usize],
    ) -> Result<Array<f32, D>, ModelError> {
        let tensor = self
            .get(name)
            .ok_or_else(|| ModelError::MissingParameter(name.to_string()))?;
        if tensor.shape() != shape {
            return Err(ModelError::ParameterShape {
                name: name.to_string(),
                expected: shape.to_vec(),
                found: tensor.shape().to_vec(),
            });
        }
        tensor
            .clone()
            .into_dimensionality::<D>()
            .map_err(|_| ModelError::ParameterShape {
                name: name.to_string(),
                expected: shape.to_vec(),
                found: tensor.shape().to_vec(),
            })
    }

    /// `(name, tensor)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArrayD<f32>)> {
        self.tensors.iter().map(|(name, tensor)| (name.as_str(), tensor))
    }

    /// Number of tensors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// True when the store holds no tensors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total scalar count.
    #[must_use]
    pub fn num_elements(&self) -> usize {
        self.tensors.values().map(ArrayD::len).sum()
    }

    /// Store with the same names and shapes, filled with zeros.
    #[must_use]
    pub fn zeros_like(&self) -> Self {
        Self {
            tensors: self
                .tensors
                .iter()
                .map(|(name, tensor)| (name.clone(), ArrayD::zeros(tensor.raw_dim())))
                .collect(),
        }
    }

    /// Fails unless `other` has exactly the same names and shapes.
    pub fn check_layout(&self, other: &Self) -> Result<(), ModelError> {
        for (name, tensor) in &self.tensors {
            let found = other
                .get(name)
                .ok_or_else(|| ModelError::MissingParameter(name.clone()))?;
            if found.shape() != tensor.shape() {
                return Err(ModelError::ParameterShape {
                    name: name.clone(),
                    expected: tensor.shape().to_vec(),
                    found: found.shape().to_vec(),
                });
            }
        }
        if let Some(extra) = other
            .tensors
            .keys()
            .find(|name| !self.tensors.contains_key(*name))
        {
            return Err(ModelError::UnexpectedParameter(extra.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, Ix2};

    #[test]
    fn typed_access_checks_shape() {
        let store = ParamStore::new().with("w", arr2(&[[1.0_f32, 2.0], [3.0, 4.0]]));
        let w = store.typed::<Ix2>("w", &[2, 2]).unwrap();
        assert_eq!(w[[1, 0]], 3.0);
        assert!(matches!(
            store.typed::<Ix2>("w", &[2, 3]),
            Err(ModelError::ParameterShape { .. })
        ));
        assert!(matches!(
            store.typed::<Ix2>("v", &[2]),
            Err(ModelError::MissingParameter(_))
        ));
    }

    #[test]
    fn layout_check_rejects_extra_tensors() {
        let store = ParamStore::new().with("b", arr1(&[0.0_f32]));
        let other = store.clone().with("extra", arr1(&[1.0_f32]));
        assert!(matches!(
            store.check_layout(&other),
            Err(ModelError::UnexpectedParameter(_))
        ));
        assert_eq!(store.zeros_like().num_elements(), 1);
    }
}
