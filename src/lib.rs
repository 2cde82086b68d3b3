pub mod config;
pub mod environment;
pub mod error;
pub mod exit_code;
pub mod feature;
pub mod queue;
pub mod scopes;
pub mod shutdown;
pub mod task;
pub mod worker;
