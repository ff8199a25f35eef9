//! Seeded generator of interleaved cascades with known final sizes.
//!
//! Each cascade gets a publish time, a final size and a prefix of early events whose count grows
//! with the final size, so the popularity signal is learnable from the stream. A cascade whose
//! observation window has not closed by the end of the stream is left unobserved.

use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{
    dataloader::{DataLoaderError, Dataset},
    labels::DecoderTable,
    roles::Role,
    stream::{Event, EventStream},
};

/// Generator parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    /// Number of cascades.
    pub cascades: usize,
    /// Fewest observed events per cascade.
    pub min_events: usize,
    /// Most observed events per cascade.
    pub max_events: usize,
    /// Size of the user population.
    pub users: u64,
    /// Publish times are drawn from `[0, horizon)`.
    pub horizon: f64,
    /// Observation window after publication.
    pub observe_time: f64,
    /// Share of observed cascades assigned to validation.
    pub val_fraction: f64,
    /// Share of observed cascades assigned to test.
    pub test_fraction: f64,
    /// Random seed.
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            cascades: 200,
            min_events: 2,
            max_events: 20,
            users: 500,
            horizon: 100.0,
            observe_time: 10.0,
            val_fraction: 0.15,
            test_fraction: 0.15,
            seed: 0,
        }
    }
}

/// Generates a dataset. The same config always yields the same dataset.
#[allow(clippy::cast_precision_loss)]
pub fn generate(config: &SyntheticConfig) -> Result<Dataset, DataLoaderError> {
    let mut rng = SmallRng::seed_from_u64(config.seed);
    let min_events = config.min_events.max(1);
    let max_events = config.max_events.max(min_events);
    let users = config.users.max(2);
    let last_publish = config.horizon.max(0.0);

    let mut events = Vec::new();
    let mut sizes = Vec::with_capacity(config.cascades);
    for cascade in 0..config.cascades as u64 {
        let publish_time = if last_publish > 0.0 {
            rng.gen_range(0.0..last_publish)
        } else {
            0.0
        };
        let observed = rng.gen_range(min_events..=max_events);
        let growth = rng.gen_range(1.5..3.0);
        sizes.push((cascade, (observed as f64 * growth).round()));

        let role = if publish_time + config.observe_time > last_publish {
            Role::Unobserved
        } else {
            let draw: f64 = rng.gen();
            if draw < config.test_fraction {
                Role::Test
            } else if draw < config.test_fraction + config.val_fraction {
                Role::Val
            } else {
                Role::Train
            }
        };

        let mut ages: Vec<f64> = (1..observed)
            .map(|_| {
                let u: f64 = rng.gen();
                config.observe_time * u * u
            })
            .collect();
        ages.push(0.0);
        ages.sort_by(f64::total_cmp);
        let mut participants = vec![rng.gen_range(0..users)];
        for age in ages {
            let source = participants[rng.gen_range(0..participants.len())];
            let destination = rng.gen_range(0..users);
            participants.push(destination);
            events.push(Event {
                source,
                destination,
                cascade,
                transfer_time: publish_time + age,
                publish_time,
                role,
            });
        }
    }
    let decoder: DecoderTable = sizes.into_iter().collect();
    events.sort_by(|a, b| a.transfer_time.total_cmp(&b.transfer_time));
    Dataset::new(EventStream::new(events)?, decoder)
}
