//! Static bearer-token authentication for the `/api/v1` routes.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

use super::api::{ApiError, SharedState};

/// Outcome of checking one request's credentials.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Missing,
    Invalid,
    /// Auth is required but no tokens are configured
    Unconfigured,
}

pub fn decide(tokens: &[String], required: bool, authorization: Option<&str>) -> AuthDecision {
    if tokens.is_empty() {
        return if required {
            AuthDecision::Unconfigured
        } else {
            AuthDecision::Allow
        };
    }
    let Some(presented) = authorization.and_then(|h| h.strip_prefix("Bearer ")) else {
        return AuthDecision::Missing;
    };
    let presented = presented.trim();
    // Check every configured token so timing does not reveal which one matched.
    let matched = tokens
        .iter()
        .fold(false, |hit, t| constant_time_eq(t.as_bytes(), presented.as_bytes()) | hit);
    if matched {
        AuthDecision::Allow
    } else {
        AuthDecision::Invalid
    }
}

/// Byte comparison whose running time depends only on the lengths.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub async fn require_token(State(state): State<SharedState>, request: Request, next: Next) -> Response {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    match decide(&state.auth.api_tokens, state.auth.required, authorization) {
        AuthDecision::Allow => next.run(request).await,
        AuthDecision::Missing => {
            debug!(path = %request.uri().path(), "Rejected request without bearer token");
            ApiError::Unauthorized("Missing bearer token".to_string()).into_response()
        }
        AuthDecision::Invalid => {
            debug!(path = %request.uri().path(), "Rejected request with unknown bearer token");
            ApiError::Unauthorized("Invalid bearer token".to_string()).into_response()
        }
        AuthDecision::Unconfigured => {
            ApiError::Unavailable("Authentication is required but no API tokens are configured".to_string())
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens() -> Vec<String> {
        vec!["alpha".to_string(), "beta".to_string()]
    }

    #[test]
    fn test_open_when_no_tokens() {
        assert_eq!(decide(&[], false, None), AuthDecision::Allow);
        assert_eq!(decide(&[], false, Some("Bearer whatever")), AuthDecision::Allow);
        assert_eq!(decide(&[], true, Some("Bearer alpha")), AuthDecision::Unconfigured);
    }

    #[test]
    fn test_token_checks() {
        assert_eq!(decide(&tokens(), false, Some("Bearer beta")), AuthDecision::Allow);
        assert_eq!(decide(&tokens(), true, Some("Bearer alpha ")), AuthDecision::Allow);
        assert_eq!(decide(&tokens(), false, None), AuthDecision::Missing);
        assert_eq!(decide(&tokens(), false, Some("Basic YWxwaGE=")), AuthDecision::Missing);
        assert_eq!(decide(&tokens(), false, Some("Bearer gamma")), AuthDecision::Invalid);
        assert_eq!(decide(&tokens(), false, Some("Bearer alph")), AuthDecision::Invalid);
        assert_eq!(decide(&tokens(), false, Some("Bearer alphaa")), AuthDecision::Invalid);
        assert_eq!(decide(&tokens(), false, Some("Bearer ")), AuthDecision::Invalid);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"alpha", b"alpha"));
        assert!(constant_time_eq(b"", b""));
        assert!(!constant_time_eq(b"alpha", b"alphb"));
        assert!(!constant_time_eq(b"alpha", b"alph"));
    }
}
