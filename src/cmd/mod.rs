//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                                   |
//! |-----------------|-----------------------------------------------------|
//! | `setup`         | `Init`, `Enroll`                                   |
//! | `queue`         | `Submit`, `Drain`, `Status`                        |
//! | `run`           | `Run`                                              |

pub mod queue;
pub mod run;
pub mod setup;

pub use queue::{SubmitArgs, cmd_drain, cmd_status, cmd_submit};
pub use run::cmd_run;
pub use setup::{cmd_enroll, cmd_init};
