use axum::http::HeaderMap;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Pluggable user-existence check consulted by the Upgrade Handler (spec
/// §4.11, §9: "ambient service-wide objects... pass explicit context
/// objects"). JWT validation, session lookups, and the user repository
/// itself are external collaborators outside this subsystem's scope; this
/// trait is the seam a host application wires them in through.
#[axum::async_trait]
pub trait UserDirectory: Send + Sync {
    /// `Ok(true)` admits the upgrade, `Ok(false)` yields HTTP 404, `Err`
    /// yields HTTP 500 (spec §4.11 step 2).
    async fn validate_user(&self, user_id: Uuid) -> AppResult<bool>;
}

/// Default directory used when no host-supplied `UserDirectory` is wired
/// in: every user id is accepted. Suitable for local development and for
/// deployments that front this gateway with their own auth layer and trust
/// the extracted `X-User-ID` header.
pub struct AllowAllDirectory;

#[axum::async_trait]
impl UserDirectory for AllowAllDirectory {
    async fn validate_user(&self, _user_id: Uuid) -> AppResult<bool> {
        Ok(true)
    }
}

const SHARED_SECRET_HEADER: &str = "x-internal-service-secret";
const SOURCE_SERVICE_HEADER: &str = "x-source-service";

/// Validate the `/broadcast` ingestion endpoint's auth headers (spec §6,
/// §4.10): a shared secret plus a source-service identifier, both required.
/// Returns the source service name on success for logging/attribution.
pub fn validate_ingestion_auth(headers: &HeaderMap, expected_secret: &str) -> AppResult<String> {
    let provided = headers
        .get(SHARED_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("missing X-Internal-Service-Secret".to_string()))?;

    if provided != expected_secret {
        return Err(AppError::Unauthorized("invalid internal service secret".to_string()));
    }

    let source = headers
        .get(SOURCE_SERVICE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("missing X-Source-Service".to_string()))?;

    Ok(source.to_string())
}
