//! Training objective: Gaussian likelihood of the transformed label, optionally regularised by
//! the KL divergence between the model's initial-state distribution and a fixed prior.

use std::f32::consts::PI;

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    model::{FirstPoint, OutputGrad},
    roles::RoleMask,
};

/// Objective variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    /// Gaussian NLL plus KL(first point || prior).
    #[default]
    GaussianWithPrior,
    /// Gaussian NLL only.
    GaussianOnly,
}

/// Isotropic Gaussian prior over the latent initial state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaussianPrior {
    /// Prior mean, shared by every component.
    pub mean: f32,
    /// Prior standard deviation.
    pub std: f32,
}

impl Default for GaussianPrior {
    fn default() -> Self {
        Self { mean: 0.0, std: 1.0 }
    }
}

/// Errors raised while computing the loss.
#[derive(Debug, Error, PartialEq)]
pub enum LossError {
    /// The subset selects no rows.
    #[error("loss requested on an empty subset")]
    EmptySubset,
    /// Labels do not line up with the selected rows.
    #[error("{labels} labels supplied for {rows} selected rows")]
    LabelCount {
        /// Selected rows.
        rows: usize,
        /// Labels supplied.
        labels: usize,
    },
    /// The subset mask does not cover the batch.
    #[error("subset mask covers {mask} rows, batch has {rows}")]
    MaskLength {
        /// Batch height.
        rows: usize,
        /// Mask length.
        mask: usize,
    },
    /// A standard deviation is not strictly positive.
    #[error("standard deviation must be positive, got {0}")]
    InvalidStd(f32),
}

/// Scalar loss over a subset together with its output gradients.
#[derive(Debug, Clone, PartialEq)]
pub struct LossValue {
    /// Mean of `nll + kl` over the subset.
    pub value: f32,
    /// Mean negative log-likelihood.
    pub nll: f32,
    /// Mean KL term (zero for [`LossKind::GaussianOnly`]).
    pub kl: f32,
    /// Rows that contributed.
    pub count: usize,
    /// Gradients of `value`, full batch height, zero outside the subset.
    pub grad: OutputGrad,
}

/// Computes the loss on the rows of `subset`.
///
/// `labels` holds one transformed label per selected row, in row order.
#[allow(clippy::cast_precision_loss)]
pub fn compute_loss(
    kind: LossKind,
    prediction: &Array1<f32>,
    labels: &[f32],
    subset: &RoleMask,
    first_point: &FirstPoint,
    prior: GaussianPrior,
    observe_std: f32,
) -> Result<LossValue, LossError> {
    let rows = prediction.len();
    if subset.len() != rows {
        return Err(LossError::MaskLength {
            rows,
            mask: subset.len(),
        });
    }
    let selected = subset.indices();
    if selected.is_empty() {
        return Err(LossError::EmptySubset);
    }
    if labels.len() != selected.len() {
        return Err(LossError::LabelCount {
            rows: selected.len(),
            labels: labels.len(),
        });
    }
    for std in [observe_std, prior.std, first_point.std] {
        if std.is_nan() || std <= 0.0 {
            return Err(LossError::InvalidStd(std));
        }
    }

    let n = selected.len() as f32;
    let with_prior = kind == LossKind::GaussianWithPrior;
    let variance = observe_std * observe_std;
    let prior_variance = prior.std * prior.std;
    let nll_constant = observe_std.ln() + 0.5 * (2.0 * PI).ln();
    let kl_constant = (prior.std / first_point.std).ln() + first_point.std * first_point.std
        / (2.0 * prior_variance)
        - 0.5;

    let mut grad = OutputGrad::zeros(rows, first_point.mean.ncols());
    let mut nll = 0.0;
    let mut kl = 0.0;
    for (&row, &label) in selected.iter().zip(labels) {
        let residual = prediction[row] - label;
        nll += 0.5 * residual * residual / variance + nll_constant;
        grad.prediction[row] = residual / (variance * n);
        if with_prior {
            let mean = first_point.mean.row(row);
            for (component, &mu) in mean.iter().enumerate() {
                let offset = mu - prior.mean;
                kl += kl_constant + offset * offset / (2.0 * prior_variance);
                grad.first_point_mean[[row, component]] = offset / (prior_variance * n);
            }
        }
    }
    let nll = nll / n;
    let kl = kl / n;
    Ok(LossValue {
        value: nll + kl,
        nll,
        kl,
        count: selected.len(),
        grad,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, Array2};

    fn first_point(mean: Array2<f32>) -> FirstPoint {
        FirstPoint { mean, std: 1.0 }
    }

    #[test]
    fn perfect_prediction_leaves_only_the_normaliser() {
        let loss = compute_loss(
            LossKind::GaussianOnly,
            &arr1(&[2.0, 3.0]),
            &[2.0, 3.0],
            &RoleMask::new(vec![true, true]),
            &first_point(Array2::zeros((2, 2))),
            GaussianPrior::default(),
            1.0,
        )
        .unwrap();
        assert!((loss.value - 0.5 * (2.0 * PI).ln()).abs() < 1e-6);
        assert_eq!(loss.kl, 0.0);
        assert!(loss.grad.prediction.iter().all(|g| *g == 0.0));
    }

    #[test]
    fn prior_term_vanishes_when_first_point_matches_prior() {
        let loss = compute_loss(
            LossKind::GaussianWithPrior,
            &arr1(&[1.0]),
            &[1.0],
            &RoleMask::new(vec![true]),
            &first_point(Array2::zeros((1, 3))),
            GaussianPrior::default(),
            1.0,
        )
        .unwrap();
        assert!(loss.kl.abs() < 1e-6);
    }

    #[test]
    fn only_subset_rows_receive_gradient() {
        let loss = compute_loss(
            LossKind::GaussianWithPrior,
            &arr1(&[1.0, 5.0, 2.0]),
            &[4.0],
            &RoleMask::new(vec![false, true, false]),
            &first_point(arr2(&[[0.3], [0.5], [0.7]])),
            GaussianPrior::default(),
            0.5,
        )
        .unwrap();
        assert_eq!(loss.count, 1);
        assert!((loss.grad.prediction[1] - 4.0).abs() < 1e-5);
        assert_eq!(loss.grad.prediction[0], 0.0);
        assert!((loss.grad.first_point_mean[[1, 0]] - 0.5).abs() < 1e-6);
        assert_eq!(loss.grad.first_point_mean[[2, 0]], 0.0);
    }

    #[test]
    fn prediction_gradient_matches_finite_difference() {
        let mask = RoleMask::new(vec![true, true]);
        let fp = first_point(Array2::zeros((2, 1)));
        let eval = |p0: f32| {
            compute_loss(
                LossKind::GaussianOnly,
                &arr1(&[p0, 1.0]),
                &[2.5, 1.5],
                &mask,
                &fp,
                GaussianPrior::default(),
                0.8,
            )
            .unwrap()
        };
        let eps = 1e-2;
        let numeric = (eval(1.0 + eps).value - eval(1.0 - eps).value) / (2.0 * eps);
        assert!((numeric - eval(1.0).grad.prediction[0]).abs() < 1e-3);
    }

    #[test]
    fn degenerate_inputs_are_rejected() {
        let fp = first_point(Array2::zeros((1, 1)));
        let prediction = arr1(&[1.0]);
        let run = |mask: Vec<bool>, labels: &[f32], std: f32| {
            compute_loss(
                LossKind::GaussianWithPrior,
                &prediction,
                labels,
                &RoleMask::new(mask),
                &fp,
                GaussianPrior::default(),
                std,
            )
        };
        assert_eq!(run(vec![false], &[], 1.0), Err(LossError::EmptySubset));
        assert!(matches!(run(vec![true], &[], 1.0), Err(LossError::LabelCount { .. })));
        assert!(matches!(run(vec![true, true], &[1.0], 1.0), Err(LossError::MaskLength { .. })));
        assert_eq!(run(vec![true], &[1.0], 0.0), Err(LossError::InvalidStd(0.0)));
    }
}
