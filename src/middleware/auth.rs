//! Authentication middleware for Axum
//!
//! Validates session tokens from cookies and exposes the authenticated
//! user as an extractor. Every chat belongs to exactly one user, so every
//! handler that touches a chat requires this.

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::cookie::CookieJar;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

/// Authenticated user information extracted from the session cookie
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    pub email: String,
}

/// Cookie name for session token
pub const SESSION_COOKIE_NAME: &str = "delver.session-token";

/// Secure cookie name (for HTTPS)
pub const SESSION_COOKIE_NAME_SECURE: &str = "__Secure-delver.session-token";

/// Auth error response
#[derive(Debug, Serialize)]
pub struct AuthError {
    pub error: String,
}

impl AuthError {
    fn unauthorized() -> Self {
        Self {
            error: "Unauthorized".to_string(),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, Json(self)).into_response()
    }
}

/// Extractor that requires authentication
///
/// ```ignore
/// async fn protected_handler(user: AuthUser) -> impl IntoResponse {
///     format!("Hello, {}!", user.email)
/// }
/// ```
#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    SqlitePool: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);

        // Try both cookie names (secure and non-secure)
        let session_token = jar
            .get(SESSION_COOKIE_NAME_SECURE)
            .or_else(|| jar.get(SESSION_COOKIE_NAME))
            .map(|c| c.value().to_string());

        let Some(session_token) = session_token else {
            return Err(AuthError::unauthorized());
        };

        let pool = SqlitePool::from_ref(state);

        validate_session(&pool, &session_token)
            .await
            .map_err(|_| AuthError::unauthorized())
    }
}

/// Validate a session token and return the associated user
pub async fn validate_session(pool: &SqlitePool, session_token: &str) -> crate::Result<AuthUser> {
    let row: Option<(String, String)> = sqlx::query_as(
        r#"
        SELECT u.id, u.email
        FROM app_auth_sessions s
        JOIN app_users u ON s.user_id = u.id
        WHERE s.session_token = $1 AND s.expires > datetime('now')
        "#,
    )
    .bind(session_token)
    .fetch_optional(pool)
    .await?;

    match row {
        Some((id, email)) => Ok(AuthUser { id, email }),
        None => Err(crate::Error::Unauthorized(
            "Invalid or expired session".into(),
        )),
    }
}

/// Create a new session for a user
pub async fn create_session(
    pool: &SqlitePool,
    user_id: &str,
    session_token: &str,
    expires: DateTime<Utc>,
) -> crate::Result<()> {
    let session_id = crate::ids::generate_id(
        crate::ids::AUTH_SESSION_PREFIX,
        &[user_id, session_token],
    );

    sqlx::query(
        r#"
        INSERT INTO app_auth_sessions (id, session_token, user_id, expires)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(session_id)
    .bind(session_token)
    .bind(user_id)
    .bind(expires.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

/// Delete a session by token
pub async fn delete_session(pool: &SqlitePool, session_token: &str) -> crate::Result<()> {
    sqlx::query("DELETE FROM app_auth_sessions WHERE session_token = $1")
        .bind(session_token)
        .execute(pool)
        .await?;

    Ok(())
}

/// Cleanup expired sessions
pub async fn cleanup_expired_sessions(pool: &SqlitePool) -> crate::Result<u64> {
    let result = sqlx::query("DELETE FROM app_auth_sessions WHERE expires < datetime('now')")
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}
