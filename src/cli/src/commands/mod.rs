//! CLI command definitions and dispatch.

mod pull;
mod push;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crypto_cli_core::config::{EncAlgo, Passphrase};
use crypto_cli_core::error::{CryptoCliError, Result};

/// crypto-cli — encrypted container images on standard registries.
#[derive(Parser)]
#[command(name = "crypto-cli", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Encrypt a local image and upload it to its registry
    Push(push::PushArgs),
    /// Download an image, decrypt it, and load it into the local daemon
    Pull(pull::PullArgs),
}

/// Flags shared by push and pull.
#[derive(Args)]
pub struct CryptoArgs {
    /// Passphrase; prompted on stdin without echo when absent
    #[arg(long)]
    pub pass: Option<String>,

    /// Encryption algorithm
    #[arg(long = "type", default_value = "pbkdf2-aes256-gcm")]
    pub enc_type: EncAlgo,

    /// Keep standard media types so unencrypted clients can read plain
    /// layers
    #[arg(long)]
    pub compat: bool,
}

impl CryptoArgs {
    /// The passphrase from the flag, or a no-echo prompt.
    pub fn passphrase(&self) -> Result<Passphrase> {
        match &self.pass {
            Some(pass) => Ok(Passphrase::new(pass.clone())),
            None => {
                let pass = rpassword::prompt_password("Enter passphrase: ")
                    .map_err(|e| CryptoCliError::Other(format!("Failed to read passphrase: {e}")))?;
                Ok(Passphrase::new(pass))
            }
        }
    }
}

/// A token cancelled by Ctrl-C.
pub(crate) fn cancellation_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling");
            child.cancel();
        }
    });
    token
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Push(args) => push::execute(args).await,
        Command::Pull(args) => pull::execute(args).await,
    }
}
