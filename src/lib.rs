//! Terraform execution harness.
//!
//! Runs terraform for a working group with a prepared working directory,
//! filters its output as it streams, and serves a local IPC socket the
//! child can call back into.

pub mod config;
pub mod executor;
pub mod filter;
pub mod ipc;
pub mod notify;
pub mod paths;
pub mod prompt;
pub mod secrets;
