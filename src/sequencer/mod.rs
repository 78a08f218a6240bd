//! Startup sequencing: the state machine and the runner that drives it.

pub mod runner;
pub mod state;

pub use runner::Sequencer;
pub use state::{StartupState, StateMachine, Transition};
