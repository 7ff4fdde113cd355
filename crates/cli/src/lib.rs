//! Library half of the `vitlora` binary: configuration, logging and the
//! subcommand bodies.

pub mod commands;
pub mod config;
pub mod logging;
