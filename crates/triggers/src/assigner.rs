//! Sticky weighted variant assignment.

use std::sync::Arc;

use dashmap::DashMap;
use paywall_core::collaborators::AssignmentStore;
use paywall_core::types::{Experiment, StoredAssignment, Variant};
use paywall_core::{PaywallError, PaywallResult};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

/// Assigns users to experiment variants and keeps the choice stable until
/// the experiment definition changes.
pub struct ExperimentAssigner {
    store: Arc<dyn AssignmentStore>,
    /// One lock per (user, experiment) pair with an assignment in progress;
    /// distinct pairs never contend.
    locks: DashMap<(String, String), Arc<Mutex<()>>>,
    rng: Mutex<StdRng>,
}

impl ExperimentAssigner {
    pub fn new(store: Arc<dyn AssignmentStore>) -> Self {
        Self::with_rng(store, StdRng::from_entropy())
    }

    /// Seeded draws, for reproducible simulations.
    pub fn with_seed(store: Arc<dyn AssignmentStore>, seed: u64) -> Self {
        Self::with_rng(store, StdRng::seed_from_u64(seed))
    }

    fn with_rng(store: Arc<dyn AssignmentStore>, rng: StdRng) -> Self {
        Self {
            store,
            locks: DashMap::new(),
            rng: Mutex::new(rng),
        }
    }

    /// Returns the variant `user_id` is assigned to in `experiment`, drawing
    /// and persisting one on first use.
    ///
    /// A failed persistence write does not fail the call: the drawn variant
    /// is returned for this evaluation only and the next call draws again.
    pub fn assign(&self, user_id: &str, experiment: &Experiment) -> PaywallResult<Variant> {
        if experiment.variants.is_empty() {
            return Err(PaywallError::Evaluation(format!(
                "experiment {} has no variants",
                experiment.id
            )));
        }

        let key = (user_id.to_string(), experiment.id.clone());
        let lock = self.locks.entry(key.clone()).or_default().clone();
        let result = {
            let _guard = lock.lock();
            self.assign_locked(user_id, experiment)
        };
        drop(lock);
        // Forget the pair once no other caller holds its lock.
        self.locks.remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    fn assign_locked(&self, user_id: &str, experiment: &Experiment) -> PaywallResult<Variant> {
        let version_hash = experiment.version_hash();

        match self.store.get(user_id, &experiment.id) {
            Ok(Some(stored)) if stored.version_hash == version_hash => {
                if let Some(variant) = experiment.variant(&stored.variant_id) {
                    debug!(
                        user_id = %user_id,
                        experiment_id = %experiment.id,
                        variant_id = %variant.id,
                        "Sticky assignment reused"
                    );
                    return Ok(variant.clone());
                }
            }
            Ok(Some(_)) => {
                info!(
                    user_id = %user_id,
                    experiment_id = %experiment.id,
                    "Experiment changed, reassigning"
                );
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    experiment_id = %experiment.id,
                    error = %e,
                    "Failed to read sticky assignment"
                );
            }
        }

        let variant = self.draw(experiment)?.clone();
        let record = StoredAssignment {
            variant_id: variant.id.clone(),
            version_hash,
        };

        match self.store.put(user_id, &experiment.id, record) {
            Ok(()) => {
                info!(
                    user_id = %user_id,
                    experiment_id = %experiment.id,
                    variant_id = %variant.id,
                    "Sticky assignment committed"
                );
            }
            Err(e) => {
                metrics::counter!("paywall.assignment.fallback").increment(1);
                warn!(
                    user_id = %user_id,
                    experiment_id = %experiment.id,
                    error = %e,
                    "Failed to persist assignment, using it for this evaluation only"
                );
            }
        }

        Ok(variant)
    }

    /// Weighted draw over the variants in ascending id order.
    fn draw<'a>(&self, experiment: &'a Experiment) -> PaywallResult<&'a Variant> {
        let mut ordered: Vec<&Variant> = experiment.variants.iter().collect();
        ordered.sort_by(|a, b| a.id.cmp(&b.id));

        let total: f64 = ordered.iter().map(|v| v.weight.max(0.0)).sum();
        if !total.is_finite() || total <= 0.0 {
            return Err(PaywallError::Evaluation(format!(
                "experiment {} has no positive variant weight",
                experiment.id
            )));
        }

        let roll: f64 = self.rng.lock().gen();
        let mut cumulative = 0.0;
        for variant in &ordered {
            cumulative += variant.weight.max(0.0) / total;
            if roll < cumulative {
                return Ok(*variant);
            }
        }

        // Rounding left the roll past the last boundary.
        ordered
            .iter()
            .rev()
            .find(|v| v.weight > 0.0)
            .copied()
            .ok_or_else(|| PaywallError::Evaluation("no variant selected".to_string()))
    }
}
