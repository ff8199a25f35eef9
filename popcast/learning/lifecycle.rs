//! Runtime enforcement of the per-pass model lifecycle.
//!
//! A pass starts from reset memory and walks every batch through
//! `forward -> (optimize) -> update -> (detach)`. [`ModelSession`] owns the model for the
//! duration of a pass and rejects any call that would break that order.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    model::{Adam, ForwardOutput, ModelError, OutputGrad, StatefulModel},
    roles::RoleMask,
    stream::EventBatch,
};

/// Kind of pass a session drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    /// Gradient-carrying training epoch.
    Train,
    /// Forward-only evaluation.
    Eval,
}

impl fmt::Display for PassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Train => "train",
            Self::Eval => "eval",
        })
    }
}

/// Position of a session inside the per-batch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassPhase {
    /// Memory reset, no batch seen yet.
    Reset,
    /// A batch was forwarded and awaits its update.
    Forwarded,
    /// The optimizer stepped on the forwarded batch.
    Optimized,
    /// The batch was committed to memory.
    Updated,
    /// Memory was detached after the update.
    Detached,
}

impl fmt::Display for PassPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Lifecycle violations. All of them are programming errors and fatal for the run.
#[derive(Debug, Error, PartialEq)]
pub enum LifecycleError {
    /// The operation is not allowed in the current phase.
    #[error("`{operation}` is not allowed during a {kind} pass in phase {phase}")]
    IllegalTransition {
        /// Rejected operation.
        operation: &'static str,
        /// Pass kind.
        kind: PassKind,
        /// Phase the session was in.
        phase: PassPhase,
    },
    /// `update` received a different batch than the one forwarded.
    #[error("update for batch {found} but batch {expected} was forwarded")]
    BatchMismatch {
        /// Index of the forwarded batch.
        expected: usize,
        /// Index passed to update.
        found: usize,
    },
    /// The model rejected the call.
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Counters reported when a pass ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassStats {
    /// Pass kind.
    pub kind: PassKind,
    /// Batches committed to memory.
    pub batches: usize,
    /// Events committed to memory.
    pub events: usize,
}

/// Exclusive handle on a model for one pass.
#[derive(Debug)]
pub struct ModelSession<'m, M: StatefulModel> {
    model: &'m mut M,
    kind: PassKind,
    phase: PassPhase,
    pending: Option<usize>,
    batches: usize,
    events: usize,
}

impl<'m, M: StatefulModel> ModelSession<'m, M> {
    /// Switches the model's mode and resets both memories.
    pub fn begin(model: &'m mut M, kind: PassKind) -> Self {
        model.set_training(kind == PassKind::Train);
        model.reset_state();
        model.reset_memory();
        Self {
            model,
            kind,
            phase: PassPhase::Reset,
            pending: None,
            batches: 0,
            events: 0,
        }
    }

    /// Pass kind.
    #[must_use]
    pub const fn kind(&self) -> PassKind {
        self.kind
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> PassPhase {
        self.phase
    }

    /// Read access to the model.
    #[must_use]
    pub fn model(&self) -> &M {
        self.model
    }

    fn illegal(&self, operation: &'static str) -> LifecycleError {
        LifecycleError::IllegalTransition {
            operation,
            kind: self.kind,
            phase: self.phase,
        }
    }

    /// Runs the model forward on `batch` for the rows in `target`.
    pub fn forward(
        &mut self,
        batch: &EventBatch,
        target: &RoleMask,
    ) -> Result<ForwardOutput<M::Tape>, LifecycleError> {
        let ready = match self.kind {
            PassKind::Train => matches!(self.phase, PassPhase::Reset | PassPhase::Detached),
            PassKind::Eval => matches!(self.phase, PassPhase::Reset | PassPhase::Updated),
        };
        if !ready {
            return Err(self.illegal("forward"));
        }
        let output = self.model.forward(batch, target)?;
        self.pending = Some(batch.index());
        self.phase = PassPhase::Forwarded;
        Ok(output)
    }

    /// Backpropagates `grad` through `output` and applies one optimizer step.
    pub fn optimize(
        &mut self,
        output: &ForwardOutput<M::Tape>,
        grad: &OutputGrad,
        optimizer: &mut Adam,
    ) -> Result<(), LifecycleError> {
        if self.kind != PassKind::Train || self.phase != PassPhase::Forwarded {
            return Err(self.illegal("optimize"));
        }
        let grads = self.model.backward(output, grad)?;
        let mut params = self.model.parameters();
        optimizer.step(&mut params, &grads)?;
        self.model.load_parameters(&params)?;
        self.phase = PassPhase::Optimized;
        Ok(())
    }

    /// Commits the forwarded batch to memory.
    pub fn update(&mut self, batch: &EventBatch) -> Result<(), LifecycleError> {
        if !matches!(self.phase, PassPhase::Forwarded | PassPhase::Optimized) {
            return Err(self.illegal("update"));
        }
        if let Some(expected) = self.pending {
            if expected != batch.index() {
                return Err(LifecycleError::BatchMismatch {
                    expected,
                    found: batch.index(),
                });
            }
        }
        self.model.update_state(batch)?;
        self.pending = None;
        self.batches += 1;
        self.events += batch.len();
        self.phase = PassPhase::Updated;
        Ok(())
    }

    /// Drops the memory's gradient history.
    pub fn detach(&mut self) -> Result<(), LifecycleError> {
        if self.kind != PassKind::Train || self.phase != PassPhase::Updated {
            return Err(self.illegal("detach"));
        }
        self.model.detach_state();
        self.phase = PassPhase::Detached;
        Ok(())
    }

    /// Closes the pass. Fails when a forwarded batch was never committed.
    pub fn finish(self) -> Result<PassStats, LifecycleError> {
        if matches!(self.phase, PassPhase::Forwarded | PassPhase::Optimized) {
            return Err(self.illegal("finish"));
        }
        Ok(PassStats {
            kind: self.kind,
            batches: self.batches,
            events: self.events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device_manager::Device,
        model::{AdamConfig, CascadeMemoryModel, CascadeModelConfig},
        roles::Role,
        stream::Event,
    };

    fn model() -> CascadeMemoryModel {
        CascadeMemoryModel::new(
            CascadeModelConfig {
                memory_dim: 3,
                ..CascadeModelConfig::default()
            },
            Device::Cpu,
        )
    }

    fn batch(index: usize) -> EventBatch {
        let event = Event {
            source: 1,
            destination: 2,
            cascade: 5,
            transfer_time: 1.0 + index as f64,
            publish_time: 0.0,
            role: Role::Train,
        };
        EventBatch::new(index, vec![event], Device::Cpu)
    }

    fn all(batch: &EventBatch) -> RoleMask {
        RoleMask::new(vec![true; batch.len()])
    }

    #[test]
    fn training_cycle_is_accepted() {
        let mut model = model();
        let mut adam = Adam::new(AdamConfig::default());
        let mut session = ModelSession::begin(&mut model, PassKind::Train);
        for index in 0..3 {
            let batch = batch(index);
            let output = session.forward(&batch, &all(&batch)).unwrap();
            let mut grad = OutputGrad::zeros(1, 3);
            grad.prediction.fill(1.0);
            session.optimize(&output, &grad, &mut adam).unwrap();
            session.update(&batch).unwrap();
            session.detach().unwrap();
        }
        let stats = session.finish().unwrap();
        assert_eq!(stats.batches, 3);
        assert_eq!(stats.events, 3);
        assert_eq!(adam.steps(), 3);
    }

    #[test]
    fn training_requires_detach_before_next_forward() {
        let mut model = model();
        let mut session = ModelSession::begin(&mut model, PassKind::Train);
        let first = batch(0);
        session.forward(&first, &all(&first)).unwrap();
        session.update(&first).unwrap();
        let second = batch(1);
        assert!(matches!(
            session.forward(&second, &all(&second)),
            Err(LifecycleError::IllegalTransition { operation: "forward", .. })
        ));
    }

    #[test]
    fn eval_rejects_optimizer_and_detach() {
        let mut model = model();
        let mut adam = Adam::new(AdamConfig::default());
        let mut session = ModelSession::begin(&mut model, PassKind::Eval);
        let batch = batch(0);
        let output = session.forward(&batch, &all(&batch)).unwrap();
        assert!(session
            .optimize(&output, &OutputGrad::zeros(1, 3), &mut adam)
            .is_err());
        session.update(&batch).unwrap();
        assert!(session.detach().is_err());
        assert!(session.finish().is_ok());
    }

    #[test]
    fn update_without_forward_is_rejected() {
        let mut model = model();
        let mut session = ModelSession::begin(&mut model, PassKind::Eval);
        assert!(matches!(
            session.update(&batch(0)),
            Err(LifecycleError::IllegalTransition { operation: "update", phase: PassPhase::Reset, .. })
        ));
    }

    #[test]
    fn update_must_match_forwarded_batch() {
        let mut model = model();
        let mut session = ModelSession::begin(&mut model, PassKind::Eval);
        let first = batch(0);
        session.forward(&first, &all(&first)).unwrap();
        assert_eq!(
            session.update(&batch(1)),
            Err(LifecycleError::BatchMismatch {
                expected: 0,
                found: 1
            })
        );
    }

    #[test]
    fn finishing_mid_batch_is_rejected() {
        let mut model = model();
        let mut session = ModelSession::begin(&mut model, PassKind::Eval);
        let first = batch(0);
        session.forward(&first, &all(&first)).unwrap();
        assert!(session.finish().is_err());
    }

    #[test]
    fn begin_resets_memory_and_mode() {
        let mut model = model();
        model.update_state(&batch(0)).unwrap();
        let session = ModelSession::begin(&mut model, PassKind::Eval);
        assert!(session.model().memory().is_empty());
        assert!(!session.model().is_training());
    }
}
