//! Auth & pairing endpoints.
//!
//! | Route                                  | Who calls it                     |
//! |----------------------------------------|----------------------------------|
//! | `POST /api/auth/pair`                  | Mobile (enters / scans a code)   |
//! | `GET  /api/auth/pair/check`            | Mobile (pre-validate a code)     |
//! | `POST /api/auth/login`                 | Mobile / web (passphrase login)  |
//! | `POST /api/auth/device`                | Mobile (verify a stored token)   |
//! | `POST /api/auth/refresh`               | Mobile (rotate its token)        |
//! | `POST /api/auth/logout`                | Mobile                           |
//! | `GET/DELETE /api/auth/devices[/:id]`   | Desktop (manage paired devices)  |
//! | `GET /api/auth/passphrase[/regenerate]`| Desktop (display / rotate)       |
//! | `POST /api/auth/password`              | Desktop (set custom password)    |
//! | `GET/POST /api/auth/settings`          | Desktop                          |
//! | `/api/auth/pairing/*`                  | Desktop (code + approval UI)     |

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::credentials::CredentialError;
use crate::events::HostEvent;
use crate::http::auth::AuthPrincipal;
use crate::http::error::ApiError;
use crate::pairing::model::PairRequest;
use crate::AppContext;

/// Devices minted by password login without "remember this device" expire
/// after 30 days; remembered devices never expire.
const LOGIN_DEVICE_TTL_SECS: i64 = 30 * 24 * 60 * 60;

fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

// ─── Pairing ─────────────────────────────────────────────────────────────────

/// `POST /api/auth/pair {code, deviceName?}` — may block up to the approval
/// deadline when the host requires approval.
pub async fn pair(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(req): Json<PairRequest>,
) -> Result<Json<Value>, ApiError> {
    let ua = user_agent(&headers);
    let name = req.device_name.as_deref().unwrap_or_default();
    let outcome = ctx.pairing.consume(&req.code, name, &ua).await?;
    Ok(Json(serde_json::to_value(outcome).unwrap_or_default()))
}

#[derive(Deserialize)]
pub struct CheckQuery {
    #[serde(default)]
    code: String,
}

/// `GET /api/auth/pair/check?code=…` → `{valid}`.
pub async fn pair_check(
    State(ctx): State<Arc<AppContext>>,
    Query(q): Query<CheckQuery>,
) -> Json<Value> {
    Json(json!({ "valid": ctx.pairing.is_valid(&q.code).await }))
}

// ─── Login & device credentials ──────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    password: String,
    #[serde(default)]
    device_name: Option<String>,
    #[serde(default)]
    remember_device: bool,
}

/// `POST /api/auth/login {password, deviceName?, rememberDevice?}`.
pub async fn login(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> Result<Json<Value>, ApiError> {
    if !ctx.credentials.verify(&req.password).await {
        return Err(ApiError::Unauthorized);
    }

    let expires_at = if req.remember_device {
        None
    } else {
        Some(Utc::now().timestamp() + LOGIN_DEVICE_TTL_SECS)
    };
    let name = req.device_name.as_deref().unwrap_or("New device");
    let (device_id, device_token, expires_at) = ctx
        .devices
        .register(name, &user_agent(&headers), expires_at)
        .await?;

    Ok(Json(json!({
        "success": true,
        "deviceToken": device_token,
        "deviceId": device_id,
        "expiresAt": expires_at,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCheckRequest {
    device_token: String,
}

/// `POST /api/auth/device {deviceToken}` — verify a stored credential.
pub async fn device_check(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<DeviceCheckRequest>,
) -> Result<Json<Value>, ApiError> {
    let device_id = ctx.devices.validate(&req.device_token).await?;
    Ok(Json(json!({ "success": true, "deviceId": device_id })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    device_id: String,
    token: String,
}

/// `POST /api/auth/refresh {deviceId, token}` — rotate the secret half.
pub async fn refresh(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<Value>, ApiError> {
    let (device_token, expires_at) = ctx.devices.refresh(&req.device_id, &req.token).await?;
    Ok(Json(json!({
        "success": true,
        "deviceToken": device_token,
        "expiresAt": expires_at,
    })))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LogoutRequest {
    #[serde(default)]
    device_id: Option<String>,
}

/// `POST /api/auth/logout {deviceId?}` — end every session owned by the
/// presented token, or by the named device.
pub async fn logout(
    State(ctx): State<Arc<AppContext>>,
    Extension(principal): Extension<AuthPrincipal>,
    body: Option<Json<LogoutRequest>>,
) -> Json<Value> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let ended = match req.device_id {
        Some(device_id) => ctx.sessions.end_sessions_for_device(&device_id).await,
        None => {
            ctx.sessions
                .end_sessions_for_token(principal.owner_token())
                .await
        }
    };
    Json(json!({ "success": true, "endedSessions": ended }))
}

// ─── Device management ───────────────────────────────────────────────────────

/// `GET /api/auth/devices` — redacted records only.
pub async fn list_devices(
    State(ctx): State<Arc<AppContext>>,
) -> Result<Json<Value>, ApiError> {
    let devices = ctx.devices.list().await?;
    Ok(Json(json!({ "devices": devices })))
}

/// `DELETE /api/auth/devices/:deviceId` — revoke and kick live sessions.
pub async fn revoke_device(
    State(ctx): State<Arc<AppContext>>,
    Path(device_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let revoked = ctx.devices.revoke(&device_id).await?;
    if !revoked {
        return Err(ApiError::NotFound(format!("device {device_id}")));
    }
    // Revocation also terminates live sessions credentialed by this device.
    let ended = ctx.sessions.end_sessions_for_device(&device_id).await;
    ctx.broadcaster.broadcast(HostEvent::DeviceRevoked {
        device_id: device_id.clone(),
    });
    Ok(Json(json!({ "revoked": true, "endedSessions": ended })))
}

// ─── Passphrase & password ───────────────────────────────────────────────────

/// `GET /api/auth/passphrase` — displayable in the host UI only.
pub async fn get_passphrase(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    Json(json!({
        "passphrase": ctx.credentials.passphrase().await,
        "useCustom": ctx.credentials.use_custom().await,
    }))
}

/// `POST /api/auth/passphrase/regenerate` — new passphrase, rotated access
/// token, and bulk-invalidation of sessions held under the old token.
/// Paired devices are untouched.
pub async fn regenerate_passphrase(
    State(ctx): State<Arc<AppContext>>,
) -> Result<Json<Value>, ApiError> {
    let old_access = ctx.credentials.access_token().await;
    let passphrase = ctx.credentials.regenerate().await?;
    ctx.credentials.rotate_access_token().await;
    ctx.sessions.end_sessions_for_token(&old_access).await;
    ctx.identity.bump_generation().await;
    Ok(Json(json!({ "success": true, "passphrase": passphrase })))
}

#[derive(Deserialize)]
pub struct SetPasswordRequest {
    password: String,
}

/// `POST /api/auth/password {password}` — set the custom password.
pub async fn set_password(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<SetPasswordRequest>,
) -> Response {
    match ctx.credentials.set_custom_password(&req.password).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(CredentialError::InvalidPolicy(reasons)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_policy", "reasons": reasons })),
        )
            .into_response(),
    }
}

// ─── Settings ────────────────────────────────────────────────────────────────

pub async fn get_settings(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    Json(json!({
        "useCustom": ctx.credentials.use_custom().await,
        "requireApproval": ctx.pairing.require_approval(),
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsRequest {
    #[serde(default)]
    use_custom: Option<bool>,
    #[serde(default)]
    require_approval: Option<bool>,
}

pub async fn update_settings(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<SettingsRequest>,
) -> Result<Json<Value>, ApiError> {
    if let Some(use_custom) = req.use_custom {
        if !ctx.credentials.set_use_custom(use_custom).await {
            return Err(ApiError::Conflict("no custom password set".to_string()));
        }
    }
    if let Some(require) = req.require_approval {
        ctx.pairing.set_require_approval(require);
    }
    Ok(Json(json!({
        "useCustom": ctx.credentials.use_custom().await,
        "requireApproval": ctx.pairing.require_approval(),
    })))
}

// ─── Pairing code + approval UI ──────────────────────────────────────────────

/// `GET /api/auth/pairing/code` — the code the host UI displays.
pub async fn pairing_code(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let info = ctx.pairing.current_code().await;
    Json(serde_json::to_value(info).unwrap_or_default())
}

/// `POST /api/auth/pairing/code/refresh` — mint a replacement code.
pub async fn refresh_pairing_code(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let info = ctx.pairing.refresh_code().await;
    Json(serde_json::to_value(info).unwrap_or_default())
}

pub async fn pending_approvals(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    Json(json!({ "requests": ctx.pairing.pending_requests().await }))
}

pub async fn approve_request(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !ctx.pairing.approve(&id).await {
        return Err(ApiError::NotFound(format!("approval request {id}")));
    }
    Ok(Json(json!({ "approved": true })))
}

pub async fn deny_request(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !ctx.pairing.deny(&id).await {
        return Err(ApiError::NotFound(format!("approval request {id}")));
    }
    Ok(Json(json!({ "denied": true })))
}
