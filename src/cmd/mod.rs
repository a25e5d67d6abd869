//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                 |
//! |-----------------|----------------------------------|
//! | `run`           | `Run`                            |
//! | `status`        | `Status`                         |
//! | `maintenance`   | `Reconcile`, `Cleanup`           |
//! | `cache`         | `Cache`                          |
//! | `state`         | `State`                          |

pub mod cache;
pub mod maintenance;
pub mod run;
pub mod state;
pub mod status;

pub use cache::cmd_cache;
pub use maintenance::{cmd_cleanup, cmd_reconcile};
pub use run::{RunArgs, cmd_run};
pub use state::cmd_state_rebuild;
pub use status::cmd_status;
