use crate::error::AppError;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

/// Authenticated user id, propagated by the fronting BFF in the `X-User-ID`
/// header. Only trusted because the BFF authenticates the session before
/// forwarding; this service never sees end-user credentials.
#[derive(Debug, Clone, Copy)]
pub struct UserId(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get("X-User-ID")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                AppError::Unauthorized(anyhow::anyhow!("Missing X-User-ID header"))
            })?;

        let user_id = raw
            .parse::<Uuid>()
            .map_err(|_| AppError::Unauthorized(anyhow::anyhow!("Invalid X-User-ID header")))?;

        tracing::Span::current().record("user_id", raw);

        Ok(UserId(user_id))
    }
}
