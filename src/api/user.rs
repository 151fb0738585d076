//! User registration and sessions.
//!
//! Wallet signature verification happens in the wallet-connect flow in
//! front of this API; by the time a request lands here the wallet address
//! is trusted glue, so registration and login are deliberately thin.

use axum::{
    extract::{Json, State},
    routing::{get, patch, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    models::{new_id, Role, User, UserStats},
    session_auth::{issue_token, AuthedUser},
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(register))
        .route("/login", post(login))
        .route("/me", get(me))
        .route("/me/github-token", patch(refresh_github_token))
}

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    pub wallet_address: String,
    pub display_name: String,
    pub github_username: Option<String>,
    pub github_token: Option<String>,
    pub role: Role,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub user: User,
    pub token: String,
}

async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterBody>,
) -> Result<Json<SessionResponse>> {
    if payload.wallet_address.trim().is_empty() {
        return Err(Error::Validation {
            field: "wallet_address",
            reason: "wallet address is required".into(),
        });
    }
    let user = state
        .engine
        .store()
        .create_user(User {
            id: new_id(),
            wallet_address: payload.wallet_address,
            display_name: payload.display_name,
            github_username: payload.github_username,
            github_token: payload.github_token,
            role: payload.role,
            stats: UserStats::default(),
            created_at: Utc::now(),
        })
        .await?;
    let token = issue_token(&user.id, &state.session_secret)?;
    Ok(Json(SessionResponse { user, token }))
}

#[derive(Debug, Deserialize)]
pub struct LoginBody {
    pub wallet_address: String,
}

async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginBody>,
) -> Result<Json<SessionResponse>> {
    let user = state
        .engine
        .store()
        .get_user_by_wallet(&payload.wallet_address)
        .await?
        .ok_or(Error::Unauthorized("unknown wallet address"))?;
    let token = issue_token(&user.id, &state.session_secret)?;
    Ok(Json(SessionResponse { user, token }))
}

async fn me(AuthedUser(user): AuthedUser) -> Json<User> {
    Json(user)
}

#[derive(Debug, Deserialize)]
pub struct RefreshTokenBody {
    pub github_token: String,
}

/// Credential refresh on login, mirrored from the oauth callback flow.
async fn refresh_github_token(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
    Json(payload): Json<RefreshTokenBody>,
) -> Result<Json<User>> {
    state
        .engine
        .store()
        .update_user_token(&user.id, &payload.github_token)
        .await?;
    let user = state
        .engine
        .store()
        .get_user(&user.id)
        .await?
        .ok_or(Error::Unauthorized("session user no longer exists"))?;
    Ok(Json(user))
}
