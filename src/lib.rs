pub mod config;
pub mod errors;
pub mod logging;
pub mod migrate;
pub mod process;
pub mod sequencer;
pub mod server;
pub mod ui;
