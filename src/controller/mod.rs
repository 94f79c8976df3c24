pub mod accessor;
pub mod clock;
pub mod kinds;
pub mod readiness;
pub mod source;
pub mod status;
pub mod tracker;
pub mod workload;

#[cfg(test)]
pub mod fixtures;

pub use kinds::{select_controller, CanaryController, Context, ControllerError};
