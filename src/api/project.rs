use axum::{
    extract::{Json, Path, State},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;

use crate::{
    error::{Error, Result},
    models::{new_id, Project, ProjectCounters, ProjectSettings, RepoRef},
    session_auth::AuthedUser,
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create).get(list))
        .route("/:id", get(get_one).delete(remove))
}

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    pub owner: String,
    pub name: String,
    #[serde(default)]
    pub settings: Option<ProjectSettings>,
}

async fn create(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
    Json(payload): Json<CreateBody>,
) -> Result<Json<Project>> {
    if !user.role.can_maintain() {
        return Err(Error::Unauthorized("only maintainers can create projects"));
    }
    if payload.owner.trim().is_empty() || payload.name.trim().is_empty() {
        return Err(Error::Validation {
            field: "repo",
            reason: "owner and name are required".into(),
        });
    }
    let project = state
        .engine
        .store()
        .create_project(Project {
            id: new_id(),
            maintainer_id: user.id,
            repo: RepoRef {
                owner: payload.owner,
                name: payload.name,
            },
            counters: ProjectCounters::default(),
            settings: payload.settings.unwrap_or_default(),
            created_at: Utc::now(),
        })
        .await?;
    Ok(Json(project))
}

async fn list(State(state): State<AppState>) -> Result<Json<Vec<Project>>> {
    Ok(Json(state.engine.store().list_projects().await?))
}

async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Project>> {
    let project = state
        .engine
        .store()
        .get_project(&id)
        .await?
        .ok_or_else(|| Error::NotFound {
            kind: "project",
            id,
        })?;
    Ok(Json(project))
}

/// Delete a project; refused while it still has active bounties.
async fn remove(
    State(state): State<AppState>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let project = state
        .engine
        .store()
        .get_project(&id)
        .await?
        .ok_or_else(|| Error::NotFound {
            kind: "project",
            id: id.clone(),
        })?;
    if project.maintainer_id != user.id {
        return Err(Error::Unauthorized("not the project maintainer"));
    }
    state.engine.store().delete_project(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}
