//! CLI command implementations.
//!
//! | Module   | Commands handled     |
//! |----------|----------------------|
//! | `init`   | `Init`               |
//! | `run`    | `Run`                |
//! | `status` | `Status`, `Reset`    |
//! | `config` | `Config`             |
//! | `policy` | `Policy`             |

pub mod config;
pub mod init;
pub mod policy;
pub mod run;
pub mod status;

pub use config::cmd_config;
pub use init::cmd_init;
pub use policy::cmd_policy;
pub use run::cmd_run;
pub use status::{cmd_reset, cmd_status};
