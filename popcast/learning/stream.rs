//! Chronological event stream and mini-batches.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    device_manager::Device,
    roles::{PerSplit, Role, RolePartition, Split},
};

/// Identifier of a user (source or destination of a propagation event).
pub type EntityId = u64;
/// Identifier of a cascade.
pub type CascadeId = u64;

/// One propagation event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// User the item was propagated from.
    pub source: EntityId,
    /// User the item was propagated to.
    pub destination: EntityId,
    /// Cascade the event belongs to.
    pub cascade: CascadeId,
    /// When the propagation happened.
    pub transfer_time: f64,
    /// When the cascade's root item was published.
    pub publish_time: f64,
    /// Role of the event for training and evaluation.
    pub role: Role,
}

impl Event {
    /// Time elapsed between publication and this event, never negative.
    #[must_use]
    pub fn age(&self) -> f64 {
        (self.transfer_time - self.publish_time).max(0.0)
    }
}

/// Errors raised while building or iterating a stream.
#[derive(Debug, Error, PartialEq)]
pub enum StreamError {
    /// Transfer timestamps decrease somewhere in the stream.
    #[error("event {index} at t={current} precedes the previous event at t={previous}")]
    OutOfOrder {
        /// Position of the offending event.
        index: usize,
        /// Transfer time of the event before it.
        previous: f64,
        /// Transfer time of the offending event.
        current: f64,
    },
    /// A timestamp is NaN or infinite.
    #[error("event {index} has a non-finite timestamp")]
    NonFiniteTime {
        /// Position of the offending event.
        index: usize,
    },
    /// Batches must hold at least one event.
    #[error("batch size must be positive")]
    ZeroBatchSize,
}

/// A contiguous chronological slice of the stream.
#[derive(Debug, Clone)]
pub struct EventBatch {
    index: usize,
    events: Vec<Event>,
    device: Device,
}

impl EventBatch {
    /// Creates a batch resident on `device`.
    #[must_use]
    pub const fn new(index: usize, events: Vec<Event>, device: Device) -> Self {
        Self {
            index,
            events,
            device,
        }
    }

    /// Position of the batch within its pass.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True for a batch without events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events in chronological order.
    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Device the batch resides on.
    #[must_use]
    pub const fn device(&self) -> Device {
        self.device
    }

    /// Moves the batch to another device.
    #[must_use]
    pub fn to_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Source user column.
    #[must_use]
    pub fn sources(&self) -> Vec<EntityId> {
        self.events.iter().map(|event| event.source).collect()
    }

    /// Destination user column.
    #[must_use]
    pub fn destinations(&self) -> Vec<EntityId> {
        self.events.iter().map(|event| event.destination).collect()
    }

    /// Cascade id column.
    #[must_use]
    pub fn cascades(&self) -> Vec<CascadeId> {
        self.events.iter().map(|event| event.cascade).collect()
    }

    /// Transfer timestamp column.
    #[must_use]
    pub fn transfer_times(&self) -> Vec<f64> {
        self.events.iter().map(|event| event.transfer_time).collect()
    }

    /// Publish timestamp column.
    #[must_use]
    pub fn publish_times(&self) -> Vec<f64> {
        self.events.iter().map(|event| event.publish_time).collect()
    }

    /// Role column.
    #[must_use]
    pub fn roles(&self) -> Vec<Role> {
        self.events.iter().map(|event| event.role).collect()
    }

    /// Train/val/test masks for this batch.
    #[must_use]
    pub fn partition(&self) -> RolePartition {
        RolePartition::from_roles(&self.roles())
    }
}

/// Globally time-ordered stream of propagation events.
#[derive(Debug, Clone)]
pub struct EventStream {
    events: Vec<Event>,
    device: Device,
}

impl EventStream {
    /// Validates ordering and builds a CPU-resident stream.
    pub fn new(events: Vec<Event>) -> Result<Self, StreamError> {
        let mut previous: Option<f64> = None;
        for (index, event) in events.iter().enumerate() {
            if !event.transfer_time.is_finite() || !event.publish_time.is_finite() {
                return Err(StreamError::NonFiniteTime { index });
            }
            if let Some(previous) = previous {
                if event.transfer_time < previous {
                    return Err(StreamError::OutOfOrder {
                        index,
                        previous,
                        current: event.transfer_time,
                    });
                }
            }
            previous = Some(event.transfer_time);
        }
        Ok(Self {
            events,
            device: Device::Cpu,
        })
    }

    /// Places every batch produced by this stream on `device`.
    #[must_use]
    pub fn on_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Device batches are placed on.
    #[must_use]
    pub const fn device(&self) -> Device {
        self.device
    }

    /// Total event count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True for a stream without events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// All events, chronological.
    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Number of batches one pass produces.
    #[must_use]
    pub fn batch_count(&self, batch_size: usize) -> usize {
        if batch_size == 0 {
            0
        } else {
            self.events.len().div_ceil(batch_size)
        }
    }

    /// Events per observed split.
    #[must_use]
    pub fn role_counts(&self) -> PerSplit<usize> {
        let mut counts = PerSplit::<usize>::default();
        for event in &self.events {
            if let Some(split) = event.role.split() {
                counts[split] += 1;
            }
        }
        counts
    }

    /// Events of `split`.
    #[must_use]
    pub fn count(&self, split: Split) -> usize {
        self.role_counts()[split]
    }

    /// Fresh iterator over the stream from its first event.
    pub fn loader(&self, batch_size: usize) -> Result<BatchLoader<'_>, StreamError> {
        if batch_size == 0 {
            return Err(StreamError::ZeroBatchSize);
        }
        Ok(BatchLoader {
            chunks: self.events.chunks(batch_size),
            next_index: 0,
            device: self.device,
        })
    }
}

/// Iterator over the chronological batches of one pass.
#[derive(Debug)]
pub struct BatchLoader<'a> {
    chunks: std::slice::Chunks<'a, Event>,
    next_index: usize,
    device: Device,
}

impl Iterator for BatchLoader<'_> {
    type Item = EventBatch;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.chunks.next()?;
        let batch = EventBatch::new(self.next_index, chunk.to_vec(), self.device);
        self.next_index += 1;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

impl ExactSizeIterator for BatchLoader<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(cascade: CascadeId, transfer_time: f64, role: Role) -> Event {
        Event {
            source: 1,
            destination: 2,
            cascade,
            transfer_time,
            publish_time: 0.0,
            role,
        }
    }

    fn stream() -> EventStream {
        EventStream::new(vec![
            event(1, 0.0, Role::Train),
            event(2, 1.0, Role::Val),
            event(1, 1.0, Role::Unobserved),
            event(3, 2.5, Role::Test),
            event(2, 3.0, Role::Train),
        ])
        .unwrap()
    }

    #[test]
    fn rejects_out_of_order_events() {
        let err = EventStream::new(vec![event(1, 2.0, Role::Train), event(1, 1.0, Role::Train)])
            .unwrap_err();
        assert!(matches!(err, StreamError::OutOfOrder { index: 1, .. }));
    }

    #[test]
    fn rejects_non_finite_times() {
        let err = EventStream::new(vec![event(1, f64::NAN, Role::Train)]).unwrap_err();
        assert_eq!(err, StreamError::NonFiniteTime { index: 0 });
    }

    #[test]
    fn loader_restarts_from_the_first_event() {
        let stream = stream();
        assert_eq!(stream.batch_count(2), 3);
        for _ in 0..2 {
            let batches: Vec<EventBatch> = stream.loader(2).unwrap().collect();
            assert_eq!(batches.len(), 3);
            assert_eq!(batches[0].events()[0].transfer_time, 0.0);
            assert_eq!(batches[2].len(), 1);
            assert_eq!(batches[2].index(), 2);
        }
        assert_eq!(stream.loader(0).unwrap_err(), StreamError::ZeroBatchSize);
    }

    #[test]
    fn batches_inherit_the_stream_device() {
        let stream = stream().on_device(Device::Cuda(0));
        let batch = stream.loader(4).unwrap().next().unwrap();
        assert_eq!(batch.device(), Device::Cuda(0));
        assert_eq!(batch.to_device(Device::Cpu).device(), Device::Cpu);
    }

    #[test]
    fn batch_columns_follow_event_order() {
        let mut events = stream().events().to_vec();
        events[3].source = 7;
        events[3].destination = 8;
        events[3].publish_time = 2.0;
        let batch = EventStream::new(events).unwrap().loader(2).unwrap().nth(1).unwrap();
        assert_eq!(batch.sources(), vec![1, 7]);
        assert_eq!(batch.destinations(), vec![2, 8]);
        assert_eq!(batch.cascades(), vec![1, 3]);
        assert_eq!(batch.transfer_times(), vec![1.0, 2.5]);
        assert_eq!(batch.publish_times(), vec![0.0, 2.0]);
        assert_eq!(batch.roles(), vec![Role::Unobserved, Role::Test]);
    }

    #[test]
    fn role_counts_skip_unobserved_events() {
        let counts = stream().role_counts();
        assert_eq!((counts.train, counts.val, counts.test), (2, 1, 1));
    }
}
