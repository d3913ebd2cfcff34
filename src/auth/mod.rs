// Authentication module
// Manages the session lifecycle: token decoding, persistence, proactive
// renewal and single-flight re-authentication

mod clock;
mod codec;
mod coordinator;
mod credentials;
mod exchange;
mod manager;
mod remote;
mod store;
mod types;

pub use clock::SessionClock;
pub use codec::{decode, DecodedClaims};
pub use coordinator::ReauthCoordinator;
pub use credentials::SqliteStorage;
pub use exchange::{AuthExchange, ProfileLookup};
pub use manager::{SessionManager, SessionManagerBuilder};
pub use remote::WordPressAuth;
pub use store::{CredentialStore, MemoryStorage, PersistedStorage, StoreLifetimes};
pub use types::{
    AccessGrant, Credentials, Identity, LoginGrant, NetworkErrorPolicy, RefreshGrant, Session,
    SessionPhase, SessionPolicy,
};
