//! Credential pool management for the gateway: source loading and
//! write-back, access token caching and refresh, strict round-robin
//! rotation, rate governance and per-credential fingerprints.

pub mod cache;
pub mod credential;
pub mod error;
pub mod fingerprint;
pub mod governor;
pub mod persist;
pub mod refresh;
pub mod rotator;
pub mod store;
pub mod tuning;
pub mod usage;
pub mod user_tokens;

pub use cache::{CachedToken, TokenManager};
pub use credential::{AuthKind, Credential, CredentialSet, CredentialSource, key_for_index};
pub use error::{AuthError, AuthResult};
pub use fingerprint::{Fingerprint, FingerprintRegistry};
pub use governor::{GovernorConfig, RateGovernor, TokenStateSnapshot, is_suspension_signal};
pub use refresh::{TokenInfo, TokenRefresher};
pub use rotator::Rotator;
pub use store::{StoredToken, TokenStore, TokenStorePatch};
pub use tuning::Tuning;
pub use usage::{ProbeOutcome, UsageChecker, UsageLimits, available_credit};
pub use user_tokens::UserTokenCache;
