//! Caller identity extraction
//!
//! The gateway sits behind the embedding application's authentication
//! layer, which forwards the verified identity in `x-caller-id` and
//! `x-caller-role` headers. Protected routes reject requests arriving
//! without an identity; role decides admin-only access.

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use super::types::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerRole {
    Admin,
    User,
}

/// Authenticated caller identity.
#[derive(Debug, Clone)]
pub struct Caller {
    pub id: String,
    pub role: CallerRole,
}

impl Caller {
    pub fn is_admin(&self) -> bool {
        self.role == CallerRole::Admin
    }

    /// Admin-only gate.
    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(ApiError::forbidden("Admin access required"))
        }
    }

    /// Owner-or-admin gate for per-record access.
    pub fn require_owner_or_admin(&self, owner_id: &str) -> Result<(), ApiError> {
        if self.is_admin() || self.id == owner_id {
            Ok(())
        } else {
            Err(ApiError::forbidden("Access denied"))
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get("x-caller-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::unauthorized("Missing caller identity"))?
            .to_string();

        let role = match parts
            .headers
            .get("x-caller-role")
            .and_then(|v| v.to_str().ok())
        {
            Some("admin") => CallerRole::Admin,
            _ => CallerRole::User,
        };

        Ok(Caller { id, role })
    }
}
