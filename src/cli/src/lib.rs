//! crypto-cli command-line interface.

pub mod commands;
