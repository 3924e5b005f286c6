#![warn(clippy::unwrap_used)]

pub mod store;
pub mod unit;

pub use store::PaywallCache;
pub use unit::{PresentationUnit, UnitStatus};
