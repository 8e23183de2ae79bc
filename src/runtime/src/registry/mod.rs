//! Registry protocol client: bearer auth, blob transfer, manifest PUT/GET.

mod auth;
mod client;
mod credentials;

pub use auth::{parse_challenge, Authenticator, BearerChallenge};
pub use client::RegistryClient;
pub use credentials::{CredentialStore, Credentials};
