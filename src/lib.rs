pub mod args;
pub mod bootstrap;
pub mod builtin;
pub mod config;
pub mod error;
pub mod example;
pub mod logging;
pub mod manager;
pub mod mount;
pub mod plugin;
pub mod publisher;
pub mod reaper;
pub mod rpc;
pub mod shimenv;
pub mod shutdown;
pub mod socket;
pub mod sys;
pub mod tuning;

pub use args::{Action, Invocation};
pub use bootstrap::run;
pub use config::{BinaryOpt, Config};
pub use error::{Result, ShimError};
pub use manager::{BootstrapParams, Manager, StartOpts, StopStatus};
pub use plugin::{Registration, Registry};
pub use shutdown::ShutdownService;
