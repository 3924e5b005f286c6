//! Presentation pipeline: evaluates tracked events, prepares paywalls and
//! drives a single active presentation to exactly one terminal result.

pub mod channel;
pub mod coordinator;
pub mod request;
pub mod state_machine;

pub use channel::{result_channel, ResultChannel, ResultSender, ResultStream};
pub use coordinator::{Dependencies, PresentationCoordinator, SlotState};
pub use request::{PaywallAction, PaywallOverrides};
pub use state_machine::{Affordances, LoadingState, PresentationStateMachine};
