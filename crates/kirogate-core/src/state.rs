use std::sync::Arc;
use std::time::Duration;

use kirogate_auth::{TokenManager, TokenRefresher, UserTokenCache};

use crate::auth::ClientAuth;

/// Process-wide dependencies, constructed once before the HTTP surface
/// binds and injected by reference into every handler.
pub struct AppState {
    pub client_auth: ClientAuth,
    pub manager: Arc<TokenManager>,
    pub user_tokens: Arc<UserTokenCache>,
    pub refresher: TokenRefresher,
    pub client: wreq::Client,
    pub request_deadline: Duration,
}
