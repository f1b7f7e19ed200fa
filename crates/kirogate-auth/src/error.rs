use std::error::Error;
use std::fmt;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Clone)]
pub enum AuthError {
    /// No credential survived the rotation sweep.
    NoTokenAvailable,
    /// The upstream identity service rejected the refresh secret.
    RefreshRejected(String),
    /// Network or decoding failure talking to the identity service.
    RefreshTransport(String),
    /// The quota probe failed (non-fatal for the request path).
    UsageProbe(String),
    InvalidConfig(String),
    Persistence(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::NoTokenAvailable => write!(f, "no token available"),
            AuthError::RefreshRejected(msg) => write!(f, "refresh rejected: {msg}"),
            AuthError::RefreshTransport(msg) => write!(f, "refresh transport: {msg}"),
            AuthError::UsageProbe(msg) => write!(f, "usage probe: {msg}"),
            AuthError::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            AuthError::Persistence(msg) => write!(f, "persistence: {msg}"),
        }
    }
}

impl Error for AuthError {}
