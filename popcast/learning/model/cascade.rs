//! Reference cascade memory model with hand-written gradients.

use indexmap::IndexSet;
use ndarray::{arr1, Array1, Array2, Axis, Ix1, Ix2};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{
    memory::{CascadeMemory, ExternalMemory, UserActivity},
    FirstPoint, ForwardOutput, ModelError, OutputGrad, ParamStore, StatefulModel,
};
use crate::{
    device_manager::Device,
    roles::RoleMask,
    stream::{Event, EventBatch},
};

/// Width of the per-event input vector: bias, event age, source activity, destination
/// activity, external-memory context.
pub const INPUT_FEATURES: usize = 5;

/// Hyperparameters of [`CascadeMemoryModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeModelConfig {
    /// Width of each cascade's memory vector.
    pub memory_dim: usize,
    /// Per-event decay applied to a cascade's memory before new input is added.
    pub decay: f32,
    /// Per-interaction decay of user activity levels.
    pub activity_decay: f32,
    /// Capacity of the external memory (0 disables it).
    pub external_memory_size: usize,
    /// Standard deviation of the latent initial state.
    pub first_point_std: f32,
    /// Event ages are divided by this before entering the model.
    pub time_scale: f64,
    /// Seed for parameter initialisation.
    pub seed: u64,
}

impl Default for CascadeModelConfig {
    fn default() -> Self {
        Self {
            memory_dim: 16,
            decay: 0.9,
            activity_decay: 0.95,
            external_memory_size: 16,
            first_point_std: 1.0,
            time_scale: 1.0,
            seed: 0,
        }
    }
}

/// Backward cache of [`CascadeMemoryModel::forward`].
#[derive(Debug, Clone, Default)]
pub struct CascadeTape {
    rows: Vec<TapeRow>,
}

impl CascadeTape {
    /// Number of rows recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when no row was computed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone)]
struct TapeRow {
    row: usize,
    hidden: Array1<f32>,
    // d(pre-activation)/d(input weights), shared by every memory component.
    sensitivity: Array1<f32>,
}

/// Cascade popularity model with decaying per-cascade memory.
///
/// For an event of cascade `c` with input `x`, `pre = decay * m_c + W x`, `h = tanh(pre)` and
/// the prediction is `v . h + b`; `h` doubles as the mean of the latent initial state.
/// Committing the event sets `m_c = pre`. Gradients reach earlier batches through each cell's
/// trace `dm_c/dW` until the next detach.
#[derive(Debug, Clone)]
pub struct CascadeMemoryModel {
    config: CascadeModelConfig,
    device: Device,
    w: Array2<f32>,
    v: Array1<f32>,
    b: f32,
    memory: CascadeMemory,
    users: UserActivity,
    external: ExternalMemory,
    training: bool,
}

impl CascadeMemoryModel {
    /// Creates a model with seeded random weights and empty memory.
    #[must_use]
    pub fn new(config: CascadeModelConfig, device: Device) -> Self {
        let mut rng = SmallRng::seed_from_u64(config.seed);
        let dim = config.memory_dim;
        let w = Array2::from_shape_fn((dim, INPUT_FEATURES), |_| rng.gen_range(-0.1_f32..0.1));
        let v = Array1::from_shape_fn(dim, |_| rng.gen_range(-0.1_f32..0.1));
        Self {
            memory: CascadeMemory::new(dim, INPUT_FEATURES),
            users: UserActivity::new(config.activity_decay),
            external: ExternalMemory::new(config.external_memory_size),
            config,
            device,
            w,
            v,
            b: 0.0,
            training: true,
        }
    }

    /// Hyperparameters.
    #[must_use]
    pub const fn config(&self) -> &CascadeModelConfig {
        &self.config
    }

    /// Per-cascade memory.
    #[must_use]
    pub const fn memory(&self) -> &CascadeMemory {
        &self.memory
    }

    /// Bounded external memory.
    #[must_use]
    pub const fn external_memory(&self) -> &ExternalMemory {
        &self.external
    }

    /// Whether gradient links are being recorded.
    #[must_use]
    pub const fn is_training(&self) -> bool {
        self.training
    }

    #[allow(clippy::cast_possible_truncation)]
    fn features(&self, event: &Event, context: f32) -> Array1<f32> {
        let age = (event.age() / self.config.time_scale).ln_1p() as f32;
        arr1(&[
            1.0,
            age,
            self.users.level(event.source).ln_1p(),
            self.users.level(event.destination).ln_1p(),
            context,
        ])
    }

    fn check_device(&self, batch: &EventBatch) -> Result<(), ModelError> {
        if batch.device() == self.device {
            Ok(())
        } else {
            Err(ModelError::DeviceMismatch {
                model: self.device,
                batch: batch.device(),
            })
        }
    }
}

impl StatefulModel for CascadeMemoryModel {
    type Tape = CascadeTape;

    fn device(&self) -> Device {
        self.device
    }

    fn forward(
        &self,
        batch: &EventBatch,
        target: &RoleMask,
    ) -> Result<ForwardOutput<CascadeTape>, ModelError> {
        self.check_device(batch)?;
        if target.len() != batch.len() {
            return Err(ModelError::ShapeMismatch {
                what: "target mask",
                expected: batch.len(),
                found: target.len(),
            });
        }
        let rows = batch.len();
        let mut prediction = Array1::zeros(rows);
        let mut mean = Array2::zeros((rows, self.config.memory_dim));
        let mut tape = CascadeTape::default();
        let context = self.external.context();
        for (row, event) in batch.events().iter().enumerate() {
            if !target.contains(row) {
                continue;
            }
            let cell = self.memory.cell_or_zero(event.cascade);
            let x = self.features(event, context);
            let pre = cell.value() * self.config.decay + self.w.dot(&x);
            let hidden = pre.mapv(f32::tanh);
            prediction[row] = self.v.dot(&hidden) + self.b;
            mean.row_mut(row).assign(&hidden);
            tape.rows.push(TapeRow {
                row,
                hidden,
                sensitivity: cell.trace() * self.config.decay + &x,
            });
        }
        Ok(ForwardOutput {
            prediction,
            first_point: FirstPoint {
                mean,
                std: self.config.first_point_std,
            },
            target: target.clone(),
            tape,
        })
    }

    fn backward(
        &self,
        output: &ForwardOutput<CascadeTape>,
        grad: &OutputGrad,
    ) -> Result<ParamStore, ModelError> {
        let rows = output.prediction.len();
        if grad.prediction.len() != rows {
            return Err(ModelError::ShapeMismatch {
                what: "prediction gradient",
                expected: rows,
                found: grad.prediction.len(),
            });
        }
        if grad.first_point_mean.dim() != (rows, self.config.memory_dim) {
            return Err(ModelError::ShapeMismatch {
                what: "first point gradient",
                expected: rows,
                found: grad.first_point_mean.nrows(),
            });
        }
        let mut grad_w = Array2::<f32>::zeros(self.w.raw_dim());
        let mut grad_v = Array1::<f32>::zeros(self.v.len());
        let mut grad_b = 0.0_f32;
        for entry in &output.tape.rows {
            let grad_y = grad.prediction[entry.row];
            let grad_hidden = &self.v * grad_y + &grad.first_point_mean.row(entry.row);
            let grad_pre = grad_hidden * &entry.hidden.mapv(|h| 1.0 - h * h);
            let outer = grad_pre
                .view()
                .insert_axis(Axis(1))
                .dot(&entry.sensitivity.view().insert_axis(Axis(0)));
            grad_w += &outer;
            grad_v.scaled_add(grad_y, &entry.hidden);
            grad_b += grad_y;
        }
        Ok(ParamStore::new()
            .with("w", grad_w)
            .with("v", grad_v)
            .with("b", arr1(&[grad_b])))
    }

    fn parameters(&self) -> ParamStore {
        ParamStore::new()
            .with("w", self.w.clone())
            .with("v", self.v.clone())
            .with("b", arr1(&[self.b]))
    }

    fn load_parameters(&mut self, params: &ParamStore) -> Result<(), ModelError> {
        self.parameters().check_layout(params)?;
        let dim = self.config.memory_dim;
        let w = params.typed::<Ix2>("w", &[dim, INPUT_FEATURES])?;
        let v = params.typed::<Ix1>("v", &[dim])?;
        let b = params.typed::<Ix1>("b", &[1])?;
        self.w = w;
        self.v = v;
        self.b = b[0];
        Ok(())
    }

    fn update_state(&mut self, batch: &EventBatch) -> Result<(), ModelError> {
        self.check_device(batch)?;
        let context = self.external.context();
        let mut touched = IndexSet::new();
        for event in batch.events() {
            let cell = self.memory.cell_or_zero(event.cascade);
            let x = self.features(event, context);
            let value = cell.value() * self.config.decay + self.w.dot(&x);
            let trace = if self.training {
                cell.trace() * self.config.decay + &x
            } else {
                Array1::zeros(INPUT_FEATURES)
            };
            let first_touch = touched.insert(event.cascade);
            self.memory
                .commit(event.cascade, value, trace, first_touch && self.training);
            self.users.observe(event.source);
            self.users.observe(event.destination);
        }
        for cascade in touched {
            if let Some(cell) = self.memory.get(cascade) {
                let summary = cell.value().mapv(f32::tanh).mean().unwrap_or(0.0);
                self.external.push(summary);
            }
        }
        Ok(())
    }

    fn detach_state(&mut self) {
        self.memory.detach();
    }

    fn reset_state(&mut self) {
        self.memory.reset();
        self.users.reset();
    }

    fn reset_memory(&mut self) {
        self.external.reset();
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}
