use serde::{Deserialize, Serialize};

use super::{ModelError, ParamStore};

/// Adam hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamConfig {
    /// Learning rate.
    pub lr: f32,
    /// First-moment decay.
    pub beta1: f32,
    /// Second-moment decay.
    pub beta2: f32,
    /// Denominator epsilon.
    pub eps: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

/// Adam optimizer keeping one pair of moment estimates per named tensor.
#[derive(Debug, Clone)]
pub struct Adam {
    config: AdamConfig,
    step: i32,
    first: Option<ParamStore>,
    second: Option<ParamStore>,
}

impl Adam {
    /// Optimizer with no accumulated moments.
    #[must_use]
    pub const fn new(config: AdamConfig) -> Self {
        Self {
            config,
            step: 0,
            first: None,
            second: None,
        }
    }

    /// Hyperparameters.
    #[must_use]
    pub const fn config(&self) -> AdamConfig {
        self.config
    }

    /// Number of steps taken.
    #[must_use]
    pub const fn steps(&self) -> i32 {
        self.step
    }

    /// Applies one update in place. `grads` must have the same layout as `params`.
    pub fn step(&mut self, params: &mut ParamStore, grads: &ParamStore) -> Result<(), ModelError> {
        params.check_layout(grads)?;
        let first = self.first.get_or_insert_with(|| params.zeros_like());
        let second = self.second.get_or_insert_with(|| params.zeros_like());
        first.check_layout(params)?;
        self.step = self.step.saturating_add(1);
        let AdamConfig {
            lr,
            beta1,
            beta2,
            eps,
        } = self.config;
        let first_correction = 1.0 - beta1.powi(self.step);
        let second_correction = 1.0 - beta2.powi(self.step);

        let names: Vec<String> = params.iter().map(|(name, _)| name.to_string()).collect();
        for name in &names {
            let (Some(param), Some(grad), Some(m), Some(v)) = (
                params.get_mut(name),
                grads.get(name),
                first.get_mut(name),
                second.get_mut(name),
            ) else {
                return Err(ModelError::MissingParameter(name.clone()));
            };
            ndarray::Zip::from(param)
                .and(grad)
                .and(m)
                .and(v)
                .for_each(|p, &g, m, v| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / first_correction;
                    let v_hat = *v / second_correction;
                    *p -= lr * m_hat / (v_hat.sqrt() + eps);
                });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn first_step_moves_by_learning_rate() {
        let mut params = ParamStore::new().with("x", arr1(&[1.0_f32, -1.0]));
        let grads = ParamStore::new().with("x", arr1(&[0.5_f32, -2.0]));
        let mut adam = Adam::new(AdamConfig {
            lr: 0.1,
            ..AdamConfig::default()
        });
        adam.step(&mut params, &grads).unwrap();
        let x = params.get("x").unwrap();
        assert!((x[[0]] - 0.9).abs() < 1e-4);
        assert!((x[[1]] + 0.9).abs() < 1e-4);
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn minimises_a_quadratic() {
        let mut params = ParamStore::new().with("x", arr1(&[3.0_f32]));
        let mut adam = Adam::new(AdamConfig {
            lr: 0.1,
            ..AdamConfig::default()
        });
        for _ in 0..300 {
            let x = params.get("x").unwrap()[[0]];
            let grads = ParamStore::new().with("x", arr1(&[2.0 * x]));
            adam.step(&mut params, &grads).unwrap();
        }
        assert!(params.get("x").unwrap()[[0]].abs() < 0.1);
    }

    #[test]
    fn rejects_mismatched_gradients() {
        let mut params = ParamStore::new().with("x", arr1(&[1.0_f32]));
        let grads = ParamStore::new().with("y", arr1(&[1.0_f32]));
        let mut adam = Adam::new(AdamConfig::default());
        assert!(adam.step(&mut params, &grads).is_err());
        assert_eq!(adam.steps(), 0);
    }
}
