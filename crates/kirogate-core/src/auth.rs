//! Inbound client authentication against the configured gateway secret.

use http::HeaderMap;

use crate::error::GatewayError;

/// Resolved caller identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// Standard mode: serve from the gateway's own credential pool.
    Pool,
    /// Multi-tenant mode: the caller supplied its own refresh secret as
    /// `<secret>:<refresh-token>`.
    UserToken(String),
}

#[derive(Debug, Clone)]
pub struct ClientAuth {
    secret: String,
}

impl ClientAuth {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, GatewayError> {
        let Some(presented) = extract_bearer(headers) else {
            return Err(GatewayError::auth_missing());
        };

        if presented == self.secret {
            return Ok(Identity::Pool);
        }

        // Multi-tenant key form: "<secret>:<refresh-token>".
        if let Some(rest) = presented.strip_prefix(&self.secret) {
            if let Some(user_token) = rest.strip_prefix(':') {
                if !user_token.is_empty() {
                    return Ok(Identity::UserToken(user_token.to_string()));
                }
            }
        }

        Err(GatewayError::auth_bad_secret())
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        let value = value.trim();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }

    let auth = headers.get("authorization")?.to_str().ok()?.trim();
    if let Some(token) = auth.strip_prefix("Bearer ") {
        return Some(token.trim().to_string());
    }
    if let Some(token) = auth.strip_prefix("bearer ") {
        return Some(token.trim().to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert("authorization", HeaderValue::from_str(value).unwrap());
        map
    }

    #[test]
    fn accepts_matching_secret() {
        let auth = ClientAuth::new("s3cret".to_string());
        let identity = auth.authenticate(&headers("Bearer s3cret")).unwrap();
        assert_eq!(identity, Identity::Pool);
    }

    #[test]
    fn accepts_x_api_key_header() {
        let auth = ClientAuth::new("s3cret".to_string());
        let mut map = HeaderMap::new();
        map.insert("x-api-key", HeaderValue::from_static("s3cret"));
        assert_eq!(auth.authenticate(&map).unwrap(), Identity::Pool);
    }

    #[test]
    fn multi_tenant_key_yields_user_token() {
        let auth = ClientAuth::new("s3cret".to_string());
        let identity = auth
            .authenticate(&headers("Bearer s3cret:rt-user-1"))
            .unwrap();
        assert_eq!(identity, Identity::UserToken("rt-user-1".to_string()));
    }

    #[test]
    fn missing_header_is_401() {
        let auth = ClientAuth::new("s3cret".to_string());
        let err = auth.authenticate(&HeaderMap::new()).unwrap_err();
        assert_eq!(err.status, http::StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn wrong_secret_is_401() {
        let auth = ClientAuth::new("s3cret".to_string());
        assert!(auth.authenticate(&headers("Bearer nope")).is_err());
        assert!(auth.authenticate(&headers("Bearer s3cret:")).is_err());
        assert!(auth.authenticate(&headers("Bearer s3cretx")).is_err());
    }
}
