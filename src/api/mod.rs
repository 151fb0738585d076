pub mod application;
pub mod bounty;
pub mod project;
pub mod submission;
pub mod user;
pub mod webhook;

use axum::{routing::get, Router};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .nest("/users", user::router())
        .nest("/projects", project::router())
        .nest("/bounty-issues", bounty::router())
        .nest("/applications", application::router())
        .nest("/work-submissions", submission::router())
        .nest("/github", webhook::router())
}

async fn health() -> &'static str {
    "health!"
}
