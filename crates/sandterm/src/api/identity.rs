//! Caller identity.
//!
//! Authentication happens upstream; the trusted proxy forwards the user id
//! in a header.

use axum::{extract::FromRequestParts, http::request::Parts};

use super::error::ApiError;

/// Header carrying the authenticated user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// The calling user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity(String);

impl UserIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }

    pub fn into_id(self) -> String {
        self.0
    }
}

impl<S> FromRequestParts<S> for UserIdentity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| ApiError::unauthorized("missing X-User-Id header"))?;
        let id = value
            .to_str()
            .map_err(|_| ApiError::unauthorized("invalid X-User-Id header"))?
            .trim();
        if id.is_empty() {
            return Err(ApiError::unauthorized("empty X-User-Id header"));
        }
        Ok(UserIdentity(id.to_string()))
    }
}
