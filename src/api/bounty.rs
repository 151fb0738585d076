use axum::{
    extract::{Json, Path, Query, State},
    routing::{get, patch, post},
    Router,
};
use serde::Deserialize;

use crate::{
    engine::CreateBounty,
    error::{Error, Result},
    models::{Application, Bounty, BountyStatus},
    session_auth::AuthedUser,
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create).get(list))
        .route("/:id", get(get_one))
        .route("/:id/applications", get(list_applications))
        .route("/:id/cancel", patch(cancel))
        .route("/:id/close", patch(close))
        .route("/:id/retry-lock", patch(retry_lock))
}

/// Create a bounty; drives `pending_github -> pending_blockchain -> open`.
async fn create(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
    Json(payload): Json<CreateBounty>,
) -> Result<Json<Bounty>> {
    Ok(Json(state.engine.create_bounty(&user, payload).await?))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<BountyStatus>,
    pub project_id: Option<String>,
}

async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Bounty>>> {
    let bounties = state
        .engine
        .store()
        .list_bounties(query.status, query.project_id.as_deref())
        .await?;
    Ok(Json(bounties))
}

async fn get_one(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Bounty>> {
    let bounty = state
        .engine
        .store()
        .get_bounty(&id)
        .await?
        .ok_or_else(|| Error::NotFound { kind: "bounty", id })?;
    Ok(Json(bounty))
}

/// The creator sees every application; anyone else only their own.
async fn list_applications(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
) -> Result<Json<Vec<Application>>> {
    let bounty = state
        .engine
        .store()
        .get_bounty(&id)
        .await?
        .ok_or_else(|| Error::NotFound {
            kind: "bounty",
            id: id.clone(),
        })?;
    let mut applications = state.engine.store().list_applications(&id).await?;
    if bounty.creator_id != user.id {
        applications.retain(|a| a.applicant_id == user.id);
    }
    Ok(Json(applications))
}

async fn cancel(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
) -> Result<Json<Bounty>> {
    Ok(Json(state.engine.cancel(&user, &id).await?))
}

async fn close(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
) -> Result<Json<Bounty>> {
    Ok(Json(state.engine.close(&user, &id).await?))
}

/// Re-attempt the funds lock for a bounty stuck in `pending_blockchain`.
async fn retry_lock(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
) -> Result<Json<Bounty>> {
    Ok(Json(state.engine.retry_lock(&user, &id).await?))
}
