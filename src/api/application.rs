use axum::{
    extract::{Json, Path, State},
    routing::{patch, post},
    Router,
};
use serde::Deserialize;

use crate::{
    error::Result,
    models::Application,
    review::{ReviewAction, SubmitApplication},
    session_auth::AuthedUser,
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(submit))
        .route("/:id/review", patch(review))
        .route("/:id/withdraw", patch(withdraw))
}

async fn submit(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
    Json(payload): Json<SubmitApplication>,
) -> Result<Json<Application>> {
    Ok(Json(state.engine.submit_application(&user, payload).await?))
}

#[derive(Debug, Deserialize)]
pub struct ReviewBody {
    pub action: ReviewAction,
    pub comment: Option<String>,
}

/// Accept or reject a pending application. Accepting assigns the bounty
/// and rejects the remaining pending applications.
async fn review(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
    Json(payload): Json<ReviewBody>,
) -> Result<Json<Application>> {
    let application = state
        .engine
        .review_application(&user, &id, payload.action, payload.comment)
        .await?;
    Ok(Json(application))
}

async fn withdraw(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
) -> Result<Json<Application>> {
    Ok(Json(state.engine.withdraw_application(&user, &id).await?))
}
