use hyper::HeaderMap;
use std::sync::Arc;

/// Header carrying the shared secret
pub const AUTH_TOKEN_HEADER: &str = "x-auth-token";

/// Shared-secret check for the control endpoints.
///
/// An empty token means no token is configured and every request passes.
#[derive(Debug, Clone, Default)]
pub struct TokenAuth {
    token: Option<Arc<str>>,
}

impl TokenAuth {
    pub fn new(token: &str) -> Self {
        Self {
            token: (!token.is_empty()).then(|| Arc::from(token)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }

    pub fn is_authorized(&self, headers: &HeaderMap) -> bool {
        let Some(ref expected) = self.token else {
            return true;
        };

        headers
            .get(AUTH_TOKEN_HEADER)
            .map(|provided| constant_time_eq(provided.as_bytes(), expected.as_bytes()))
            .unwrap_or(false)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
