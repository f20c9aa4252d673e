// Authentication module
// Manages the bearer credential lifecycle for the privileged process

mod manager;
mod provider;
mod scheduler;
mod store;
mod types;

pub use manager::CredentialManager;
pub use provider::{HttpIdentityProvider, IdentityEndpoints, IdentityProvider};
pub use scheduler::{RefreshScheduler, ScheduledTask};
pub use store::{CredentialStore, MemoryCredentialStore, SqliteCredentialStore, StoreError};
pub use types::{
    Credential, CredentialError, CredentialRecord, FetchMode, IdentityEvent, RefreshPolicy,
    TokenGrant, TokenState, User,
};
