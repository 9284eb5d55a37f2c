pub mod credential_cache;
pub mod credential_provider;

pub use credential_cache::CredentialCache;
pub use credential_provider::CredentialProvider;
