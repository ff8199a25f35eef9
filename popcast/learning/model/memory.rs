//! Memory stores behind the reference model.

use std::collections::{HashMap, VecDeque};

use ndarray::Array1;

use crate::stream::{CascadeId, EntityId};

/// Memory vector of one cascade together with its gradient trace.
///
/// The trace records how the value depends on the input weights accumulated since the last
/// detach; a zero trace means gradients cannot flow past this cell.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryCell {
    value: Array1<f32>,
    trace: Array1<f32>,
    linked_batches: usize,
}

impl MemoryCell {
    fn zeros(dim: usize, trace_dim: usize) -> Self {
        Self {
            value: Array1::zeros(dim),
            trace: Array1::zeros(trace_dim),
            linked_batches: 0,
        }
    }

    /// Current memory value.
    #[must_use]
    pub const fn value(&self) -> &Array1<f32> {
        &self.value
    }

    /// Gradient trace with respect to the input weights.
    #[must_use]
    pub const fn trace(&self) -> &Array1<f32> {
        &self.trace
    }

    /// Batches whose computation graph this value is still linked to.
    #[must_use]
    pub const fn linked_batches(&self) -> usize {
        self.linked_batches
    }

    /// Whether any gradient history is attached.
    #[must_use]
    pub fn has_history(&self) -> bool {
        self.linked_batches > 0 || self.trace.iter().any(|value| *value != 0.0)
    }
}

/// Per-cascade memory store.
#[derive(Debug, Clone)]
pub struct CascadeMemory {
    dim: usize,
    trace_dim: usize,
    cells: HashMap<CascadeId, MemoryCell>,
}

impl CascadeMemory {
    /// Empty memory with `dim`-sized vectors and `trace_dim`-sized traces.
    #[must_use]
    pub fn new(dim: usize, trace_dim: usize) -> Self {
        Self {
            dim,
            trace_dim,
            cells: HashMap::new(),
        }
    }

    /// Memory width.
    #[must_use]
    pub const fn dim(&self) -> usize {
        self.dim
    }

    /// Cell of a cascade, if it has seen any event.
    #[must_use]
    pub fn get(&self, cascade: CascadeId) -> Option<&MemoryCell> {
        self.cells.get(&cascade)
    }

    /// Cell of a cascade, or the epoch-zero cell.
    #[must_use]
    pub fn cell_or_zero(&self, cascade: CascadeId) -> MemoryCell {
        self.cells
            .get(&cascade)
            .cloned()
            .unwrap_or_else(|| MemoryCell::zeros(self.dim, self.trace_dim))
    }

    /// Stores a new value and trace for a cascade. `link` marks the first write of a batch.
    pub fn commit(
        &mut self,
        cascade: CascadeId,
        value: Array1<f32>,
        trace: Array1<f32>,
        link: bool,
    ) {
        let (dim, trace_dim) = (self.dim, self.trace_dim);
        let cell = self
            .cells
            .entry(cascade)
            .or_insert_with(|| MemoryCell::zeros(dim, trace_dim));
        cell.value = value;
        if link {
            cell.linked_batches += 1;
        }
        if trace.iter().all(|value| *value == 0.0) {
            cell.linked_batches = 0;
        }
        cell.trace = trace;
    }

    /// Drops every gradient trace, keeping values.
    pub fn detach(&mut self) {
        for cell in self.cells.values_mut() {
            cell.trace.fill(0.0);
            cell.linked_batches = 0;
        }
    }

    /// Forgets every cascade.
    pub fn reset(&mut self) {
        self.cells.clear();
    }

    /// Number of cascades with memory.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// True when no cascade has memory.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Whether any cell still carries gradient history.
    #[must_use]
    pub fn has_history(&self) -> bool {
        self.cells.values().any(MemoryCell::has_history)
    }

    /// Copies of every value, keyed by cascade.
    #[must_use]
    pub fn values(&self) -> HashMap<CascadeId, Array1<f32>> {
        self.cells
            .iter()
            .map(|(cascade, cell)| (*cascade, cell.value.clone()))
            .collect()
    }
}

/// Exponentially decayed activity level per user. Not differentiable.
#[derive(Debug, Clone)]
pub struct UserActivity {
    decay: f32,
    levels: HashMap<EntityId, f32>,
}

impl UserActivity {
    /// Empty store; each observation first decays the user's level by `decay`.
    #[must_use]
    pub fn new(decay: f32) -> Self {
        Self {
            decay,
            levels: HashMap::new(),
        }
    }

    /// Current level of a user (zero when never seen).
    #[must_use]
    pub fn level(&self, user: EntityId) -> f32 {
        self.levels.get(&user).copied().unwrap_or(0.0)
    }

    /// Records one interaction of `user`.
    pub fn observe(&mut self, user: EntityId) {
        let level = self.levels.entry(user).or_insert(0.0);
        *level = *level * self.decay + 1.0;
    }

    /// Forgets every user.
    pub fn reset(&mut self) {
        self.levels.clear();
    }
}

/// Bounded FIFO of recent cascade summaries shared by every prediction.
#[derive(Debug, Clone)]
pub struct ExternalMemory {
    capacity: usize,
    slots: VecDeque<f32>,
}

impl ExternalMemory {
    /// Memory holding at most `capacity` summaries. Zero capacity disables it.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: VecDeque::with_capacity(capacity),
        }
    }

    /// Appends a summary, evicting the oldest when full.
    pub fn push(&mut self, summary: f32) {
        if self.capacity == 0 {
            return;
        }
        if self.slots.len() == self.capacity {
            self.slots.pop_front();
        }
        self.slots.push_back(summary);
    }

    /// Mean of the stored summaries, zero when empty.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn context(&self) -> f32 {
        if self.slots.is_empty() {
            0.0
        } else {
            self.slots.iter().sum::<f32>() / self.slots.len() as f32
        }
    }

    /// Number of stored summaries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Maximum number of summaries.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Clears every slot.
    pub fn reset(&mut self) {
        self.slots.clear();
    }
}
