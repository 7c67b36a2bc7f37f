use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::handlers::{
    assets_info, create_project, delete_project, download_boundaries, get_project, get_task,
    healthz, list_projects, new_event, odm_webhook, preview_split_by_square, process_imagery,
    project_centroids, readyz, task_states, upload_task_boundaries, user_task_stats,
};
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/projects", get(list_projects).post(create_project))
        .route("/projects/centroids", get(project_centroids))
        .route("/projects/:id", get(get_project).delete(delete_project))
        .route(
            "/projects/:id/upload-task-boundaries",
            post(upload_task_boundaries),
        )
        .route(
            "/projects/preview-split-by-square",
            post(preview_split_by_square),
        )
        .route("/projects/:id/download-boundaries", get(download_boundaries))
        .route(
            "/projects/process_imagery/:project_id/:task_id",
            post(process_imagery),
        )
        .route("/projects/assets/:project_id", get(assets_info))
        // NodeODM is given the trailing-slash form.
        .route(
            "/projects/odm/webhook/:user_id/:project_id/:task_id",
            post(odm_webhook),
        )
        .route(
            "/projects/odm/webhook/:user_id/:project_id/:task_id/",
            post(odm_webhook),
        )
        .route("/tasks/statistics", get(user_task_stats))
        .route("/tasks/states/:project_id", get(task_states))
        .route("/tasks/event/:project_id/:task_id", post(new_event))
        .route("/tasks/:task_id", get(get_task));

    let prefix = state.settings.api_prefix.clone();
    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz));
    let router = if prefix.is_empty() {
        router.merge(api)
    } else {
        router.nest(&prefix, api)
    };

    let body_limit = DefaultBodyLimit::max(state.settings.max_upload_bytes);
    router
        .layer(body_limit)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
