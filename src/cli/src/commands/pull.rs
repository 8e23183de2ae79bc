//! `crypto-cli pull` command — Download an image, decrypting if necessary.

use clap::Args;

use crypto_cli_core::error::Result;
use crypto_cli_runtime::{pull_image, Credentials, DockerCli, ImageRef};

#[derive(Args)]
pub struct PullArgs {
    /// Image reference (NAME[:TAG])
    pub image: String,

    #[command(flatten)]
    pub crypto: super::CryptoArgs,
}

pub async fn execute(args: PullArgs) -> Result<()> {
    let reference = ImageRef::parse(&args.image)?;
    let passphrase = args.crypto.passphrase()?;

    let daemon = DockerCli::new();
    let credentials = Credentials::resolve(&reference.registry);
    let cancel = super::cancellation_token();

    pull_image(&daemon, &reference, &passphrase, credentials, cancel).await?;

    println!("Pulled {}", reference);
    Ok(())
}
