//! Trigger evaluation: maps a tracked event to an experiment outcome and
//! keeps per-user variant assignments sticky.

pub mod assigner;
pub mod evaluator;
pub mod predicates;
pub mod store;

pub use assigner::ExperimentAssigner;
pub use evaluator::TriggerEvaluator;
pub use store::InMemoryAssignmentStore;
