//! crypto-cli Core - Foundational Types and Abstractions
//!
//! This crate provides the foundational types used across crypto-cli:
//! the error taxonomy, cryptographic options, and the ephemeral workspace
//! that owns all intermediate files of a push or pull workflow.

pub mod config;
pub mod error;
pub mod workspace;

// Re-export commonly used types
pub use config::{CryptoOpts, EncAlgo, Passphrase};
pub use error::{CryptoCliError, ErrorSet, Result};
pub use workspace::Workspace;

/// crypto-cli version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
