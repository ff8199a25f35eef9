//! Stateful model contract and the reference cascade memory model.
//!
//! The engine only talks to models through [`StatefulModel`]. Memory is owned by the model and
//! mutated exclusively through the lifecycle calls (`update_state`, `detach_state`,
//! `reset_state`, `reset_memory`), which the orchestrator sequences via
//! [`crate::lifecycle::ModelSession`].

/// Reference model with per-cascade memory.
pub mod cascade;
/// Memory stores used by the reference model.
pub mod memory;
/// Adam optimizer over parameter stores.
pub mod optim;
/// Named parameter stores.
pub mod params;

use ndarray::{Array1, Array2};
use thiserror::Error;

use crate::{device_manager::Device, roles::RoleMask, stream::EventBatch};

pub use cascade::{CascadeMemoryModel, CascadeModelConfig};
pub use optim::{Adam, AdamConfig};
pub use params::ParamStore;

/// Contract violations raised by models. All of them are fatal for the run.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    /// Two inputs that must line up row by row do not.
    #[error("{what}: expected {expected} rows, found {found}")]
    ShapeMismatch {
        /// Which input disagreed.
        what: &'static str,
        /// Expected row count.
        expected: usize,
        /// Actual row count.
        found: usize,
    },
    /// The batch lives on a different device than the model.
    #[error("batch on {batch} cannot be fed to a model on {model}")]
    DeviceMismatch {
        /// Model placement.
        model: Device,
        /// Batch placement.
        batch: Device,
    },
    /// A parameter store lacks a tensor the model needs.
    #[error("missing parameter `{0}`")]
    MissingParameter(String),
    /// A parameter store carries a tensor the model does not know.
    #[error("unexpected parameter `{0}`")]
    UnexpectedParameter(String),
    /// A tensor has the wrong shape.
    #[error("parameter `{name}` has shape {found:?}, expected {expected:?}")]
    ParameterShape {
        /// Tensor name.
        name: String,
        /// Shape the model requires.
        expected: Vec<usize>,
        /// Shape that was supplied.
        found: Vec<usize>,
    },
}

/// Distribution of the latent initial state, one row per batch event.
#[derive(Debug, Clone, PartialEq)]
pub struct FirstPoint {
    /// Mean of the latent state.
    pub mean: Array2<f32>,
    /// Standard deviation shared by every component.
    pub std: f32,
}

/// Result of a forward pass over one batch.
///
/// `prediction` and `first_point` cover every row of the batch; rows outside the target mask
/// are zero and must be ignored.
#[derive(Debug, Clone)]
pub struct ForwardOutput<T> {
    /// Predicted transformed popularity per event.
    pub prediction: Array1<f32>,
    /// Latent initial-state distribution per event.
    pub first_point: FirstPoint,
    /// Rows the forward pass computed.
    pub target: RoleMask,
    /// Model-private cache consumed by [`StatefulModel::backward`].
    pub tape: T,
}

/// Loss gradients with respect to the forward outputs, full batch height.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputGrad {
    /// `dL/dprediction`.
    pub prediction: Array1<f32>,
    /// `dL/dfirst_point.mean`.
    pub first_point_mean: Array2<f32>,
}

impl OutputGrad {
    /// Zero gradients for a batch of `rows` events and `dim`-wide first points.
    #[must_use]
    pub fn zeros(rows: usize, dim: usize) -> Self {
        Self {
            prediction: Array1::zeros(rows),
            first_point_mean: Array2::zeros((rows, dim)),
        }
    }
}

/// Lifecycle and compute contract of a model carrying per-entity memory.
pub trait StatefulModel {
    /// Backward cache produced by `forward`.
    type Tape;

    /// Device the model's parameters and memory live on.
    fn device(&self) -> Device;

    /// Predicts for the rows selected by `target` using the current memory. Never mutates
    /// memory.
    fn forward(
        &self,
        batch: &EventBatch,
        target: &RoleMask,
    ) -> Result<ForwardOutput<Self::Tape>, ModelError>;

    /// Parameter gradients for the given output gradients.
    fn backward(
        &self,
        output: &ForwardOutput<Self::Tape>,
        grad: &OutputGrad,
    ) -> Result<ParamStore, ModelError>;

    /// Copy of the learnable parameters.
    fn parameters(&self) -> ParamStore;

    /// Replaces the learnable parameters. Names and shapes must match exactly.
    fn load_parameters(&mut self, params: &ParamStore) -> Result<(), ModelError>;

    /// Incorporates a fully processed batch into memory.
    fn update_state(&mut self, batch: &EventBatch) -> Result<(), ModelError>;

    /// Cuts the memory's gradient link to earlier batches, keeping its values.
    fn detach_state(&mut self);

    /// Restores the epoch-zero memory.
    fn reset_state(&mut self);

    /// Clears the auxiliary bounded memory, when the model has one.
    fn reset_memory(&mut self) {}

    /// Switches between training (gradient links recorded) and evaluation.
    fn set_training(&mut self, training: bool);
}
