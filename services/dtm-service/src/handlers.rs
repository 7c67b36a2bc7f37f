use axum::{
    body::Bytes,
    extract::{Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use uuid::Uuid;

use crate::models::{
    AssetsParams, CreateProjectForm, DeleteProjectParams, DownloadParams, ListProjectsParams,
    NewEvent, ProcessImageryRequest, SplitPreviewForm, UploadedFile, UserStatsParams,
};
use crate::service::{self, ServiceError};
use crate::state::AppState;

pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

pub async fn readyz(State(state): State<AppState>) -> StatusCode {
    match service::readiness(&state).await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub async fn list_projects(
    State(state): State<AppState>,
    Query(params): Query<ListProjectsParams>,
) -> impl IntoResponse {
    match service::list_projects(&state, params).await {
        Ok(projects) => (StatusCode::OK, Json(projects)).into_response(),
        Err(err) => (err.status, Json(err.body)).into_response(),
    }
}

pub async fn create_project(
    State(state): State<AppState>,
    multipart: Multipart,
) -> impl IntoResponse {
    let mut form = CreateProjectForm::default();
    let parts = match read_multipart(multipart).await {
        Ok(parts) => parts,
        Err(err) => return (err.status, Json(err.body)).into_response(),
    };
    for (name, file) in parts {
        match name.as_str() {
            "project_info" => form.project_info = Some(file.data),
            "dem" => form.dem = Some(file),
            "image" => form.image = Some(file),
            _ => {}
        }
    }

    match service::create_project(&state, form).await {
        Ok(response) => (StatusCode::CREATED, Json(response)).into_response(),
        Err(err) => (err.status, Json(err.body)).into_response(),
    }
}

pub async fn project_centroids(State(state): State<AppState>) -> impl IntoResponse {
    match service::project_centroids(&state).await {
        Ok(centroids) => (StatusCode::OK, Json(centroids)).into_response(),
        Err(err) => (err.status, Json(err.body)).into_response(),
    }
}

pub async fn get_project(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> impl IntoResponse {
    match service::get_project(&state, project_id).await {
        Ok(project) => (StatusCode::OK, Json(project)).into_response(),
        Err(err) => (err.status, Json(err.body)).into_response(),
    }
}

pub async fn delete_project(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Query(params): Query<DeleteProjectParams>,
) -> impl IntoResponse {
    match service::delete_project(&state, project_id, params.user_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => (err.status, Json(err.body)).into_response(),
    }
}

pub async fn upload_task_boundaries(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    multipart: Multipart,
) -> impl IntoResponse {
    let file = match read_multipart(multipart).await {
        Ok(parts) => parts
            .into_iter()
            .find(|(name, _)| name == "geojson")
            .map(|(_, file)| file),
        Err(err) => return (err.status, Json(err.body)).into_response(),
    };

    match service::upload_task_boundaries(&state, project_id, file).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => (err.status, Json(err.body)).into_response(),
    }
}

pub async fn preview_split_by_square(
    State(state): State<AppState>,
    multipart: Multipart,
) -> impl IntoResponse {
    let mut form = SplitPreviewForm::default();
    let parts = match read_multipart(multipart).await {
        Ok(parts) => parts,
        Err(err) => return (err.status, Json(err.body)).into_response(),
    };
    for (name, file) in parts {
        match name.as_str() {
            "project_geojson" => form.project_geojson = Some(file),
            "no_fly_zones" => form.no_fly_zones = Some(file),
            "dimension" => form.dimension = Some(String::from_utf8_lossy(&file.data).into_owned()),
            _ => {}
        }
    }

    match service::preview_split_by_square(&state, form).await {
        Ok(collection) => (StatusCode::OK, Json(collection)).into_response(),
        Err(err) => (err.status, Json(err.body)).into_response(),
    }
}

pub async fn download_boundaries(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Query(params): Query<DownloadParams>,
) -> Response {
    match service::download_boundaries(&state, project_id, params).await {
        Ok(file) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, file.content_type.to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", file.file_name),
                ),
            ],
            file.body,
        )
            .into_response(),
        Err(err) => (err.status, Json(err.body)).into_response(),
    }
}

pub async fn process_imagery(
    State(state): State<AppState>,
    Path((project_id, task_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<ProcessImageryRequest>,
) -> impl IntoResponse {
    match service::process_imagery(&state, project_id, task_id, payload).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => (err.status, Json(err.body)).into_response(),
    }
}

pub async fn assets_info(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Query(params): Query<AssetsParams>,
) -> impl IntoResponse {
    match service::assets_info(&state, project_id, params).await {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(err) => (err.status, Json(err.body)).into_response(),
    }
}

/// Takes the raw body so malformed callbacks get our own 400 payload.
pub async fn odm_webhook(
    State(state): State<AppState>,
    Path((user_id, project_id, task_id)): Path<(String, Uuid, Uuid)>,
    body: Bytes,
) -> impl IntoResponse {
    match service::odm_webhook(&state, user_id, project_id, task_id, &body).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => (err.status, Json(err.body)).into_response(),
    }
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> impl IntoResponse {
    match service::get_task(&state, task_id).await {
        Ok(task) => (StatusCode::OK, Json(task)).into_response(),
        Err(err) => (err.status, Json(err.body)).into_response(),
    }
}

pub async fn task_states(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> impl IntoResponse {
    match service::task_states(&state, project_id).await {
        Ok(states) => (StatusCode::OK, Json(states)).into_response(),
        Err(err) => (err.status, Json(err.body)).into_response(),
    }
}

pub async fn new_event(
    State(state): State<AppState>,
    Path((project_id, task_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<NewEvent>,
) -> impl IntoResponse {
    match service::new_event(&state, project_id, task_id, payload).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => (err.status, Json(err.body)).into_response(),
    }
}

pub async fn user_task_stats(
    State(state): State<AppState>,
    Query(params): Query<UserStatsParams>,
) -> impl IntoResponse {
    match service::user_task_stats(&state, params).await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(err) => (err.status, Json(err.body)).into_response(),
    }
}

/// Reads every named part of a multipart form into memory.
async fn read_multipart(mut multipart: Multipart) -> Result<Vec<(String, UploadedFile)>, ServiceError> {
    let invalid = |err: axum::extract::multipart::MultipartError| {
        ServiceError::new(
            StatusCode::BAD_REQUEST,
            "invalid_multipart",
            format!("invalid multipart body: {err}"),
        )
    };

    let mut parts = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let data = field.bytes().await.map_err(invalid)?;
        parts.push((
            name,
            UploadedFile {
                file_name,
                content_type,
                data: data.to_vec(),
            },
        ));
    }
    Ok(parts)
}
