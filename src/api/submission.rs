use axum::{
    extract::{Json, Path, State},
    routing::{patch, post},
    Router,
};
use serde::Deserialize;

use crate::{error::Result, models::Bounty, session_auth::AuthedUser, AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(submit))
        .route("/:id/approve", patch(approve))
        .route("/:id/request-changes", patch(request_changes))
}

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    pub bounty_id: String,
    pub pr_url: String,
}

/// Assignee hands in a pull request; `in_progress -> under_review`.
async fn submit(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
    Json(payload): Json<SubmitBody>,
) -> Result<Json<Bounty>> {
    let bounty = state
        .engine
        .submit_work(&user, &payload.bounty_id, &payload.pr_url)
        .await?;
    Ok(Json(bounty))
}

/// Creator approves the submitted work and releases the payout.
/// `:id` is the bounty id; the submission under review is part of it.
async fn approve(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
) -> Result<Json<Bounty>> {
    Ok(Json(state.engine.approve(&user, &id).await?))
}

#[derive(Debug, Deserialize)]
pub struct RequestChangesBody {
    pub feedback: String,
}

/// Creator sends the work back with feedback; `under_review -> in_progress`.
async fn request_changes(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
    Json(payload): Json<RequestChangesBody>,
) -> Result<Json<Bounty>> {
    let bounty = state
        .engine
        .request_changes(&user, &id, &payload.feedback)
        .await?;
    Ok(Json(bounty))
}
