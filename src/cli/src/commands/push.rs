//! `crypto-cli push` command — Encrypt an image and upload it.

use clap::Args;

use crypto_cli_core::config::CryptoOpts;
use crypto_cli_core::error::Result;
use crypto_cli_runtime::{push_image, Credentials, DockerCli, ImageRef};

#[derive(Args)]
pub struct PushArgs {
    /// Image reference (NAME[:TAG])
    pub image: String,

    #[command(flatten)]
    pub crypto: super::CryptoArgs,
}

pub async fn execute(args: PushArgs) -> Result<()> {
    let reference = ImageRef::parse(&args.image)?;
    let passphrase = args.crypto.passphrase()?;
    let opts = CryptoOpts {
        algo: args.crypto.enc_type,
        compat: args.crypto.compat,
    };

    let daemon = DockerCli::new();
    let credentials = Credentials::resolve(&reference.registry);
    let cancel = super::cancellation_token();

    let digest = push_image(&daemon, &reference, &passphrase, &opts, credentials, cancel).await?;

    println!("Pushed {} ({})", reference, digest);
    Ok(())
}
