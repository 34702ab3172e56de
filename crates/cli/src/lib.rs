//! Command line front end for `extvol`.
//!
//! The binary parses [`cli::Cli`], installs logging, and hands the parsed
//! command to [`commands::dispatch`]. Every command reports through the
//! [`output`] envelope.

pub mod cli;
pub mod commands;
pub mod error;
pub mod logging;
pub mod output;
pub mod prompt;
pub mod styles;
