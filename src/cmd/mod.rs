//! CLI command implementations.
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `run`     | `Run` (default)  |
//! | `migrate` | `Migrate`        |
//! | `status`  | `Status`         |
//! | `config`  | `Config`         |

pub mod config;
pub mod migrate;
pub mod run;
pub mod status;

pub use config::cmd_config;
pub use migrate::cmd_migrate;
pub use run::cmd_run;
pub use status::cmd_status;
