use axum::http::StatusCode;
use geo_types::{MultiPolygon, Polygon};
use tokio_postgres::error::SqlState;
use uuid::Uuid;

use crate::db;
use crate::geocode;
use crate::geojson::{Feature, FeatureCollection, GeoJson, Geometry};
use crate::geometry::{self, GeometryError};
use crate::kml;
use crate::models::{
    AssetsInfo, AssetsParams, AssetsResponse, Attachment, CentroidOut, CreateProjectForm,
    DownloadParams, ErrorResponse, EventResponse, ListProjectsParams, MessageResponse, NewEvent,
    NewProject, OdmWebhookPayload, Pagination, ProcessImageryRequest, ProjectIn, ProjectInfo,
    ProjectListResponse, SplitPreviewForm, TaskDetail, TaskStateOut, UploadedFile, UserStatsParams,
    UserTaskStats, WebhookResponse,
};
use crate::odm::{self, OdmImage};
use crate::state::AppState;
use crate::storage;
use crate::task_state::{
    validate_event, webhook_action, EventContext, EventType, OdmStatus, Transition,
    TransitionError, WebhookAction,
};
use crate::wkb;

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;
const DEFAULT_STATS_LIMIT: i64 = 50;

#[derive(Debug)]
pub struct ServiceError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ServiceError {
    pub fn new(status: StatusCode, code: &'static str, message: String) -> Self {
        Self {
            status,
            body: ErrorResponse {
                code,
                message,
                reasons: Vec::new(),
            },
        }
    }

    fn bad_request(code: &'static str, message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message.to_string())
    }

    fn not_found(code: &'static str, message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message.to_string())
    }

    fn database(err: String) -> Self {
        tracing::error!(error = %err, "database operation failed");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "db_error",
            "database error".to_string(),
        )
    }

    fn storage(err: String) -> Self {
        tracing::error!(error = %err, "object storage request failed");
        Self::new(
            StatusCode::BAD_GATEWAY,
            "storage_error",
            "object storage request failed".to_string(),
        )
    }

    fn unavailable(code: &'static str, message: &str) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, code, message.to_string())
    }
}

impl From<GeometryError> for ServiceError {
    fn from(err: GeometryError) -> Self {
        match err {
            GeometryError::InvalidDimension(_) => {
                ServiceError::new(StatusCode::BAD_REQUEST, "invalid_dimension", err.to_string())
            }
            other => ServiceError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_geometry",
                other.to_string(),
            ),
        }
    }
}

impl From<TransitionError> for ServiceError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::WrongState { .. } => {
                ServiceError::new(StatusCode::CONFLICT, "invalid_transition", err.to_string())
            }
            TransitionError::NotAuthor(_) | TransitionError::NotLockHolder => {
                ServiceError::new(StatusCode::FORBIDDEN, "forbidden", err.to_string())
            }
        }
    }
}

pub async fn readiness(state: &AppState) -> Result<(), ServiceError> {
    let db = state.db.lock().await;
    db.simple_query("SELECT 1")
        .await
        .map_err(|err| ServiceError::database(format!("readiness probe failed: {err}")))?;
    Ok(())
}

pub async fn list_projects(
    state: &AppState,
    params: ListProjectsParams,
) -> Result<ProjectListResponse, ServiceError> {
    let (page, per_page, offset) = page_window(params.page, params.results_per_page)?;
    let owner = if params.filter_by_owner {
        let Some(user_id) = non_blank(params.user_id) else {
            return Err(ServiceError::bad_request(
                "missing_user_id",
                "user_id is required when filtering by owner",
            ));
        };
        Some(user_id)
    } else {
        None
    };
    let search = non_blank(params.search);

    let db = state.db.lock().await;
    let total = db::count_projects(&db, owner.as_deref(), search.as_deref())
        .await
        .map_err(ServiceError::database)?;
    let results = db::list_projects(&db, owner.as_deref(), search.as_deref(), offset, per_page)
        .await
        .map_err(ServiceError::database)?;

    Ok(ProjectListResponse {
        results,
        pagination: Pagination {
            page,
            per_page,
            total,
        },
    })
}

pub async fn create_project(
    state: &AppState,
    form: CreateProjectForm,
) -> Result<MessageResponse, ServiceError> {
    let Some(raw_info) = form.project_info else {
        return Err(ServiceError::bad_request(
            "missing_project_info",
            "project_info is required",
        ));
    };
    let info: ProjectIn = serde_json::from_slice(&raw_info).map_err(|err| {
        ServiceError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_project_info",
            format!("project_info is invalid: {err}"),
        )
    })?;

    let Some(name) = non_blank(info.name) else {
        return Err(ServiceError::bad_request("missing_name", "name is required"));
    };
    let Some(author_id) = non_blank(info.author_id) else {
        return Err(ServiceError::bad_request(
            "missing_author",
            "author_id is required",
        ));
    };
    let Some(outline) = info.outline else {
        return Err(ServiceError::bad_request(
            "missing_outline",
            "outline is required",
        ));
    };
    let task_split_dimension = match info.task_split_dimension {
        Some(dimension) if dimension <= 0 => {
            return Err(ServiceError::bad_request(
                "invalid_dimension",
                "task_split_dimension must be positive",
            ));
        }
        Some(dimension) => dimension,
        None => i32::try_from(state.settings.default_split_dimension).unwrap_or(i32::MAX),
    };

    let (outline, no_fly_zones) = build_outline(outline, info.no_fly_zones)?;
    let location_str = match (&state.settings.nominatim_url, geometry::centroid(&outline)) {
        (Some(url), Some(point)) => {
            geocode::address_from_lat_lon(&state.http, url, point.y(), point.x()).await
        }
        _ => None,
    };

    let project = NewProject {
        id: Uuid::new_v4(),
        name,
        author_id,
        short_description: info.short_description,
        description: info.description,
        per_task_instructions: info.per_task_instructions,
        outline: wkb::encode(&outline),
        no_fly_zones: no_fly_zones.map(|zones| wkb::encode(&zones.into())),
        gsd_cm_px: info.gsd_cm_px,
        overlap_percent: info.overlap_percent,
        gimble_angles_degrees: info.gimble_angles_degrees,
        task_split_dimension: Some(task_split_dimension),
        requires_approval_from_manager_for_locking: info.requires_approval_from_manager_for_locking,
        location_str,
    };

    let project_id = {
        let db = state.db.lock().await;
        match db::insert_project(&*db, &project).await {
            Ok(id) => id,
            Err(err) => {
                if let Some(db_err) = err.as_db_error() {
                    if db_err.code() == &SqlState::UNIQUE_VIOLATION {
                        return Err(ServiceError::new(
                            StatusCode::CONFLICT,
                            "project_exists",
                            format!("project named {} already exists", project.name),
                        ));
                    }
                }
                return Err(ServiceError::database(format!("insert project failed: {err}")));
            }
        }
    };
    tracing::info!(project_id = %project_id, name = project.name.as_str(), "project created");

    store_project_assets(state, project_id, form.dem, form.image).await;

    Ok(MessageResponse {
        message: "Project successfully created".to_string(),
        project_id: Some(project_id),
    })
}

/// Uploads the optional DEM and map screenshot. Failures are logged and
/// leave the project without the asset URL.
async fn store_project_assets(
    state: &AppState,
    project_id: Uuid,
    dem: Option<UploadedFile>,
    image: Option<UploadedFile>,
) {
    if dem.is_none() && image.is_none() {
        return;
    }
    let Some(storage) = state.storage.as_ref() else {
        tracing::warn!(project_id = %project_id, "object storage not configured; project files dropped");
        return;
    };

    let mut dem_url = None;
    if let Some(dem) = dem {
        let key = storage::dem_key(project_id);
        match storage.put_object(&key, dem.data, Some("image/tiff")).await {
            Ok(()) => dem_url = Some(storage.object_url(&key)),
            Err(err) => tracing::error!(project_id = %project_id, error = %err, "dem upload failed"),
        }
    }

    let mut image_url = None;
    if let Some(image) = image {
        let key = storage::screenshot_key(project_id);
        let content_type = image.content_type.as_deref().unwrap_or("image/png");
        match storage.put_object(&key, image.data, Some(content_type)).await {
            Ok(()) => image_url = Some(storage.object_url(&key)),
            Err(err) => {
                tracing::error!(project_id = %project_id, error = %err, "map screenshot upload failed")
            }
        }
    }

    if dem_url.is_none() && image_url.is_none() {
        return;
    }
    let db = state.db.lock().await;
    if let Err(err) =
        db::update_project_assets(&db, project_id, dem_url.as_deref(), image_url.as_deref()).await
    {
        tracing::error!(project_id = %project_id, error = %err, "recording project assets failed");
    }
}

pub async fn project_centroids(state: &AppState) -> Result<Vec<CentroidOut>, ServiceError> {
    let db = state.db.lock().await;
    db::project_centroids(&db)
        .await
        .map_err(ServiceError::database)
}

pub async fn get_project(state: &AppState, project_id: Uuid) -> Result<ProjectInfo, ServiceError> {
    let db = state.db.lock().await;
    let project = db::select_project(&db, project_id)
        .await
        .map_err(ServiceError::database)?
        .ok_or_else(|| ServiceError::not_found("project_not_found", "project not found"))?;
    let tasks = db::list_tasks(&db, project_id)
        .await
        .map_err(ServiceError::database)?;
    Ok(ProjectInfo { project, tasks })
}

pub async fn delete_project(
    state: &AppState,
    project_id: Uuid,
    user_id: Option<String>,
) -> Result<(), ServiceError> {
    let mut db = state.db.lock().await;
    let project = db::select_project(&db, project_id)
        .await
        .map_err(ServiceError::database)?
        .ok_or_else(|| ServiceError::not_found("project_not_found", "project not found"))?;
    if let Some(user_id) = non_blank(user_id) {
        if user_id != project.author_id {
            return Err(ServiceError::new(
                StatusCode::FORBIDDEN,
                "not_project_author",
                "only the project author may delete the project".to_string(),
            ));
        }
    }

    let transaction = db
        .transaction()
        .await
        .map_err(|err| ServiceError::database(format!("start transaction failed: {err}")))?;
    db::delete_project(&transaction, project_id)
        .await
        .map_err(ServiceError::database)?;
    transaction
        .commit()
        .await
        .map_err(|err| ServiceError::database(format!("commit failed: {err}")))?;

    drop(db);
    tracing::info!(project_id = %project_id, "project deleted");

    if let Some(storage) = state.storage.clone() {
        tokio::spawn(async move {
            match storage.delete_prefix(&storage::project_prefix(project_id)).await {
                Ok(removed) => {
                    tracing::info!(project_id = %project_id, removed, "project files removed")
                }
                Err(err) => {
                    tracing::warn!(project_id = %project_id, error = %err, "project file cleanup failed")
                }
            }
        });
    }
    Ok(())
}

pub async fn upload_task_boundaries(
    state: &AppState,
    project_id: Uuid,
    file: Option<UploadedFile>,
) -> Result<MessageResponse, ServiceError> {
    let Some(file) = file else {
        return Err(ServiceError::bad_request(
            "missing_geojson",
            "geojson file is required",
        ));
    };
    let polygons = boundary_polygons(&file.data)?;

    let mut db = state.db.lock().await;
    if db::select_project(&db, project_id)
        .await
        .map_err(ServiceError::database)?
        .is_none()
    {
        return Err(ServiceError::not_found("project_not_found", "project not found"));
    }

    let transaction = db
        .transaction()
        .await
        .map_err(|err| ServiceError::database(format!("start transaction failed: {err}")))?;
    let replaced = db::delete_project_tasks(&transaction, project_id)
        .await
        .map_err(ServiceError::database)?;
    for (index, polygon) in polygons.into_iter().enumerate() {
        let index = i32::try_from(index + 1).map_err(|_| {
            ServiceError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "too_many_tasks",
                "too many task boundaries".to_string(),
            )
        })?;
        let outline = wkb::encode(&polygon.into());
        db::insert_task(&transaction, Uuid::new_v4(), project_id, index, &outline)
            .await
            .map_err(ServiceError::database)?;
    }
    transaction
        .commit()
        .await
        .map_err(|err| ServiceError::database(format!("commit failed: {err}")))?;

    tracing::info!(project_id = %project_id, replaced, "task boundaries uploaded");
    Ok(MessageResponse {
        message: "Project Boundary Uploaded".to_string(),
        project_id: Some(project_id),
    })
}

pub async fn preview_split_by_square(
    state: &AppState,
    form: SplitPreviewForm,
) -> Result<FeatureCollection, ServiceError> {
    let Some(boundary) = form.project_geojson else {
        return Err(ServiceError::bad_request(
            "missing_geojson",
            "project_geojson file is required",
        ));
    };
    if !boundary.file_name.as_deref().is_some_and(is_geojson_file) {
        return Err(ServiceError::bad_request(
            "invalid_file_type",
            "the uploaded file must be in GeoJSON format",
        ));
    }
    let meters = parse_dimension(
        form.dimension.as_deref(),
        state.settings.default_split_dimension,
    )?;
    let zones = form.no_fly_zones.map(|file| file.data);
    preview_split(&boundary.data, zones.as_deref(), meters)
}

pub async fn download_boundaries(
    state: &AppState,
    project_id: Uuid,
    params: DownloadParams,
) -> Result<Attachment, ServiceError> {
    let format = ExportFormat::parse(params.export_type.as_deref())?;

    let collection = {
        let db = state.db.lock().await;
        if !params.split_area {
            let project = db::select_project(&db, project_id)
                .await
                .map_err(ServiceError::database)?
                .ok_or_else(|| ServiceError::not_found("project_not_found", "project not found"))?;
            project.outline.map(|outline| FeatureCollection::new(vec![outline]))
        } else if let Some(task_id) = params.task_id {
            db::select_task_outline(&db, project_id, task_id)
                .await
                .map_err(ServiceError::database)?
                .map(|outline| {
                    FeatureCollection::new(vec![Feature::new(Geometry::from(&outline))
                        .with_id(task_id.to_string())])
                })
        } else {
            let tasks = db::list_tasks(&db, project_id)
                .await
                .map_err(ServiceError::database)?;
            Some(FeatureCollection::new(
                tasks.into_iter().map(|task| task.outline).collect(),
            ))
            .filter(|collection| !collection.is_empty())
        }
    };
    let Some(collection) = collection else {
        return Err(ServiceError::not_found("geometry_not_found", "geometry not found"));
    };

    let file_name = export_file_name(params.task_id, params.split_area, format);
    let body = match format {
        ExportFormat::GeoJson => serde_json::to_vec(&GeoJson::FeatureCollection(collection))
            .map_err(|err| {
                ServiceError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "encode_error",
                    format!("encode geojson failed: {err}"),
                )
            })?,
        ExportFormat::Kml => kml::feature_collection_to_kml(&collection).into_bytes(),
    };
    Ok(Attachment {
        file_name,
        content_type: format.content_type(),
        body,
    })
}

pub async fn process_imagery(
    state: &AppState,
    project_id: Uuid,
    task_id: Uuid,
    payload: ProcessImageryRequest,
) -> Result<MessageResponse, ServiceError> {
    let Some(user_id) = non_blank(payload.user_id) else {
        return Err(ServiceError::bad_request("missing_user_id", "user_id is required"));
    };
    if state.storage.is_none() {
        return Err(ServiceError::unavailable(
            "storage_unavailable",
            "object storage is not configured",
        ));
    }
    if state.odm.is_none() {
        return Err(ServiceError::unavailable(
            "odm_unavailable",
            "image processing is not configured",
        ));
    }
    {
        let db = state.db.lock().await;
        if db::task_state(&db, project_id, task_id)
            .await
            .map_err(ServiceError::database)?
            .is_none()
        {
            return Err(ServiceError::not_found("task_not_found", "task not found"));
        }
    }

    let background = state.clone();
    tokio::spawn(async move {
        if let Err(err) = submit_drone_images(&background, project_id, task_id, &user_id).await {
            tracing::error!(
                project_id = %project_id,
                task_id = %task_id,
                error = %err,
                "image processing submission failed"
            );
        }
    });

    Ok(MessageResponse {
        message: "Processing started".to_string(),
        project_id: Some(project_id),
    })
}

async fn submit_drone_images(
    state: &AppState,
    project_id: Uuid,
    task_id: Uuid,
    user_id: &str,
) -> Result<(), String> {
    let (Some(storage), Some(odm)) = (state.storage.as_ref(), state.odm.as_ref()) else {
        return Err("processing backends not configured".to_string());
    };
    let keys = storage::image_keys(
        storage
            .list_keys(&storage::task_images_prefix(project_id, task_id))
            .await?,
    );
    if keys.is_empty() {
        return Err("no images uploaded for task".to_string());
    }

    let mut images = Vec::with_capacity(keys.len());
    for key in &keys {
        images.push(OdmImage {
            name: storage::file_name(key).to_string(),
            data: storage.get_object(key).await?,
        });
    }
    let webhook = state.settings.odm_webhook_url(user_id, project_id, task_id);
    let odm_task = odm
        .create_task(
            &format!("dtm-{project_id}-{task_id}"),
            images,
            &odm::default_options(),
            &webhook,
        )
        .await?;
    tracing::info!(
        project_id = %project_id,
        task_id = %task_id,
        odm_task = odm_task.as_str(),
        images = keys.len(),
        "images submitted for processing"
    );
    Ok(())
}

pub async fn assets_info(
    state: &AppState,
    project_id: Uuid,
    params: AssetsParams,
) -> Result<AssetsResponse, ServiceError> {
    let Some(storage) = state.storage.as_ref() else {
        return Err(ServiceError::unavailable(
            "storage_unavailable",
            "object storage is not configured",
        ));
    };

    let db = state.db.lock().await;
    if db::select_project(&db, project_id)
        .await
        .map_err(ServiceError::database)?
        .is_none()
    {
        return Err(ServiceError::not_found("project_not_found", "project not found"));
    }

    match params.task_id {
        Some(task_id) => {
            let row = db::task_state(&db, project_id, task_id)
                .await
                .map_err(ServiceError::database)?
                .ok_or_else(|| ServiceError::not_found("task_not_found", "task not found"))?;
            drop(db);
            let mut info = task_assets(storage, project_id, task_id).await?;
            info.state = Some(row.state);
            Ok(AssetsResponse::Task(info))
        }
        None => {
            let tasks = db::list_tasks(&db, project_id)
                .await
                .map_err(ServiceError::database)?;
            drop(db);
            let mut infos = Vec::with_capacity(tasks.len());
            for task in tasks {
                infos.push(task_assets(storage, project_id, task.id).await?);
            }
            Ok(AssetsResponse::Project(infos))
        }
    }
}

async fn task_assets(
    storage: &storage::StorageClient,
    project_id: Uuid,
    task_id: Uuid,
) -> Result<AssetsInfo, ServiceError> {
    let keys = storage
        .list_keys(&storage::task_images_prefix(project_id, task_id))
        .await
        .map_err(ServiceError::storage)?;
    let assets_key = storage::task_assets_key(project_id, task_id);
    let assets_url = storage
        .object_exists(&assets_key)
        .await
        .map_err(ServiceError::storage)?
        .then(|| storage.object_url(&assets_key));
    Ok(AssetsInfo {
        project_id,
        task_id,
        image_count: storage::image_keys(keys).len(),
        assets_url,
        state: None,
    })
}

pub async fn odm_webhook(
    state: &AppState,
    user_id: String,
    project_id: Uuid,
    task_id: Uuid,
    body: &[u8],
) -> Result<WebhookResponse, ServiceError> {
    let (odm_task, code) = parse_webhook(body)?;
    tracing::info!(
        project_id = %project_id,
        task_id = %task_id,
        odm_task = odm_task.as_str(),
        code,
        "odm webhook received"
    );

    let current = {
        let db = state.db.lock().await;
        db::task_state(&db, project_id, task_id)
            .await
            .map_err(ServiceError::database)?
            .ok_or_else(|| ServiceError::not_found("task_not_found", "task not found"))?
            .state
    };

    match webhook_action(OdmStatus::from(code), current) {
        WebhookAction::CollectAssets { transition } => {
            spawn_asset_collection(
                state,
                odm_task.clone(),
                project_id,
                task_id,
                user_id,
                Some(transition),
            );
        }
        WebhookAction::MarkFailed { transition } => {
            let recorded = {
                let db = state.db.lock().await;
                record_transition(&db, project_id, task_id, &user_id, &transition)
                    .await
                    .map_err(ServiceError::database)?
            };
            if !recorded {
                tracing::warn!(
                    task_id = %task_id,
                    current = %current,
                    "task not awaiting processing; failure not recorded"
                );
            }
            spawn_asset_collection(state, odm_task.clone(), project_id, task_id, user_id, None);
        }
        WebhookAction::Ignore { reason } => {
            tracing::info!(task_id = %task_id, current = %current, code, reason, "odm webhook ignored");
        }
    }

    Ok(WebhookResponse {
        message: "Webhook received",
        task_id: odm_task,
    })
}

fn spawn_asset_collection(
    state: &AppState,
    odm_task: String,
    project_id: Uuid,
    task_id: Uuid,
    user_id: String,
    transition: Option<Transition>,
) {
    let state = state.clone();
    tokio::spawn(async move {
        match collect_odm_assets(&state, &odm_task, project_id, task_id, &user_id, transition).await
        {
            Ok(()) => tracing::info!(task_id = %task_id, odm_task = odm_task.as_str(), "odm assets stored"),
            Err(err) => tracing::error!(
                task_id = %task_id,
                odm_task = odm_task.as_str(),
                error = %err,
                "odm asset collection failed"
            ),
        }
    });
}

/// Copies the ODM output archive into storage, then applies `transition`.
async fn collect_odm_assets(
    state: &AppState,
    odm_task: &str,
    project_id: Uuid,
    task_id: Uuid,
    user_id: &str,
    transition: Option<Transition>,
) -> Result<(), String> {
    let (Some(storage), Some(odm)) = (state.storage.as_ref(), state.odm.as_ref()) else {
        return Err("processing backends not configured".to_string());
    };
    let archive = odm.download_assets(odm_task).await?;
    storage
        .put_object(
            &storage::task_assets_key(project_id, task_id),
            archive,
            Some("application/zip"),
        )
        .await?;

    if let Some(transition) = transition {
        let db = state.db.lock().await;
        if !record_transition(&db, project_id, task_id, user_id, &transition).await? {
            return Err(format!(
                "task left {} before assets were stored",
                transition.from
            ));
        }
    }
    Ok(())
}

async fn record_transition(
    db: &tokio_postgres::Client,
    project_id: Uuid,
    task_id: Uuid,
    user_id: &str,
    transition: &Transition,
) -> Result<bool, String> {
    db::insert_task_event_if_state(
        db,
        project_id,
        task_id,
        user_id,
        transition.comment,
        transition.from,
        transition.to,
    )
    .await
}

pub async fn get_task(state: &AppState, task_id: Uuid) -> Result<TaskDetail, ServiceError> {
    let db = state.db.lock().await;
    db::select_task(&db, task_id)
        .await
        .map_err(ServiceError::database)?
        .ok_or_else(|| ServiceError::not_found("task_not_found", "task not found"))
}

pub async fn task_states(
    state: &AppState,
    project_id: Uuid,
) -> Result<Vec<TaskStateOut>, ServiceError> {
    let db = state.db.lock().await;
    db::task_states(&db, project_id)
        .await
        .map_err(ServiceError::database)
}

pub async fn new_event(
    state: &AppState,
    project_id: Uuid,
    task_id: Uuid,
    payload: NewEvent,
) -> Result<EventResponse, ServiceError> {
    let Some(user_id) = non_blank(payload.user_id) else {
        return Err(ServiceError::bad_request("missing_user_id", "user_id is required"));
    };

    let db = state.db.lock().await;
    let project = db::select_project(&db, project_id)
        .await
        .map_err(ServiceError::database)?
        .ok_or_else(|| ServiceError::not_found("project_not_found", "project not found"))?;
    let current = db::task_state(&db, project_id, task_id)
        .await
        .map_err(ServiceError::database)?
        .ok_or_else(|| ServiceError::not_found("task_not_found", "task not found"))?;

    let (transition, comment) = plan_event(
        payload.event,
        &EventContext {
            current: current.state,
            requires_approval: project.requires_approval_from_manager_for_locking,
            user_id: &user_id,
            project_author: &project.author_id,
            last_actor: current.last_user.as_deref(),
        },
        payload.comment,
    )?;

    let recorded = db::insert_task_event_if_state(
        &*db,
        project_id,
        task_id,
        &user_id,
        &comment,
        transition.from,
        transition.to,
    )
    .await
    .map_err(ServiceError::database)?;
    ensure_recorded(recorded, &transition)?;

    tracing::info!(
        project_id = %project_id,
        task_id = %task_id,
        event = payload.event.as_str(),
        from = %transition.from,
        to = %transition.to,
        "task state updated"
    );
    Ok(EventResponse {
        project_id,
        task_id,
        state: transition.to,
        comment,
    })
}

/// Validates `event` against the task's current state and the acting user,
/// and picks the comment to record with it.
fn plan_event(
    event: EventType,
    context: &EventContext<'_>,
    comment: Option<String>,
) -> Result<(Transition, String), ServiceError> {
    let transition = validate_event(event, context)?;
    let comment = non_blank(comment).unwrap_or_else(|| transition.comment.to_string());
    Ok((transition, comment))
}

/// The conditional insert finds no row when another writer moved the task
/// off `transition.from` after it was read.
fn ensure_recorded(recorded: bool, transition: &Transition) -> Result<(), ServiceError> {
    if recorded {
        return Ok(());
    }
    Err(ServiceError::new(
        StatusCode::CONFLICT,
        "state_changed",
        format!("task is no longer {}", transition.from),
    ))
}

pub async fn user_task_stats(
    state: &AppState,
    params: UserStatsParams,
) -> Result<Vec<UserTaskStats>, ServiceError> {
    let Some(user_id) = non_blank(params.user_id) else {
        return Err(ServiceError::bad_request("missing_user_id", "user_id is required"));
    };
    let role = non_blank(params.role).unwrap_or_else(|| "PROJECT_CREATOR".to_string());
    let skip = params.skip.unwrap_or(0);
    let limit = params.limit.unwrap_or(DEFAULT_STATS_LIMIT);
    if skip < 0 || !(1..=MAX_PAGE_SIZE).contains(&limit) {
        return Err(ServiceError::bad_request(
            "invalid_pagination",
            "skip must be >= 0 and limit between 1 and 100",
        ));
    }

    let db = state.db.lock().await;
    db::user_task_stats(&db, &user_id, &role.to_ascii_uppercase(), skip, limit)
        .await
        .map_err(ServiceError::database)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    GeoJson,
    Kml,
}

impl ExportFormat {
    fn parse(raw: Option<&str>) -> Result<Self, ServiceError> {
        match raw.map(str::trim).map(str::to_ascii_lowercase).as_deref() {
            None | Some("") | Some("geojson") => Ok(ExportFormat::GeoJson),
            Some("kml") => Ok(ExportFormat::Kml),
            Some(other) => Err(ServiceError::bad_request(
                "invalid_export_type",
                &format!("unsupported export type {other}; use geojson or kml"),
            )),
        }
    }

    fn extension(self) -> &'static str {
        match self {
            ExportFormat::GeoJson => "geojson",
            ExportFormat::Kml => "kml",
        }
    }

    fn content_type(self) -> &'static str {
        match self {
            ExportFormat::GeoJson => "application/geo+json",
            ExportFormat::Kml => "application/vnd.google-earth.kml+xml",
        }
    }
}

fn export_file_name(task_id: Option<Uuid>, split_area: bool, format: ExportFormat) -> String {
    let extension = format.extension();
    match (split_area, task_id) {
        (false, _) => format!("project_aoi.{extension}"),
        (true, Some(task_id)) => format!("task_{task_id}.{extension}"),
        (true, None) => format!("project_outline.{extension}"),
    }
}

/// Returns (page, per_page, offset) for 1-based paging.
fn page_window(page: Option<i64>, per_page: Option<i64>) -> Result<(i64, i64, i64), ServiceError> {
    let page = page.unwrap_or(1);
    let per_page = per_page.unwrap_or(DEFAULT_PAGE_SIZE);
    if page < 1 {
        return Err(ServiceError::bad_request("invalid_page", "page must be >= 1"));
    }
    if !(1..=MAX_PAGE_SIZE).contains(&per_page) {
        return Err(ServiceError::bad_request(
            "invalid_page_size",
            "results_per_page must be between 1 and 100",
        ));
    }
    Ok((page, per_page, (page - 1) * per_page))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn is_geojson_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".geojson") || lower.ends_with(".json")
}

fn parse_dimension(raw: Option<&str>, default: u32) -> Result<f64, ServiceError> {
    match raw.map(str::trim).filter(|value| !value.is_empty()) {
        None => Ok(f64::from(default)),
        Some(value) => match value.parse::<f64>() {
            Ok(meters) if meters.is_finite() && meters > 0.0 => Ok(meters),
            _ => Err(ServiceError::bad_request(
                "invalid_dimension",
                "dimension must be a positive number of meters",
            )),
        },
    }
}

fn parse_webhook(body: &[u8]) -> Result<(String, i64), ServiceError> {
    let payload: OdmWebhookPayload = serde_json::from_slice(body).map_err(|err| {
        tracing::warn!(error = %err, "odm webhook body is not valid json");
        ServiceError::bad_request("invalid_json", "invalid JSON body")
    })?;
    let uuid = payload.uuid.filter(|uuid| !uuid.is_empty());
    let code = payload.status.and_then(|status| status.code);
    match (uuid, code) {
        (Some(uuid), Some(code)) => Ok((uuid, code)),
        _ => Err(ServiceError::bad_request(
            "invalid_payload",
            "invalid webhook payload",
        )),
    }
}

fn parse_zones(geojson: GeoJson) -> Result<Vec<Polygon<f64>>, ServiceError> {
    let collection = geometry::normalise_feature_collection(geometry::to_feature_collection(geojson));
    Ok(geometry::collect_polygons(&collection)?)
}

/// Project outline with no-fly zones cut out, plus the zones themselves.
fn build_outline(
    outline: GeoJson,
    no_fly_zones: Option<GeoJson>,
) -> Result<(geo_types::Geometry<f64>, Option<MultiPolygon<f64>>), ServiceError> {
    let outline = geometry::outline_from_geojson(outline)?;
    let zones = match no_fly_zones {
        Some(zones) => parse_zones(zones)?,
        None => Vec::new(),
    };
    if zones.is_empty() {
        return Ok((outline, None));
    }

    let Some(area) = geometry::as_multipolygon(&outline) else {
        return Ok((outline, Some(geometry::union_polygons(zones))));
    };
    let zones = geometry::union_polygons(zones);
    let mut remaining = geometry::subtract_no_fly_zones(&area, zones.0.clone());
    let outline = match remaining.0.len() {
        0 => {
            return Err(ServiceError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "empty_outline",
                "no-fly zones cover the whole project area".to_string(),
            ));
        }
        1 => geo_types::Geometry::Polygon(remaining.0.remove(0)),
        _ => geo_types::Geometry::MultiPolygon(remaining),
    };
    Ok((outline, Some(zones)))
}

fn boundary_polygons(bytes: &[u8]) -> Result<Vec<Polygon<f64>>, ServiceError> {
    let collection = geometry::parse_feature_collection(bytes).map_err(|err| {
        ServiceError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_geojson",
            err.to_string(),
        )
    })?;
    let collection = geometry::multipolygon_to_polygon(geometry::filter_main_geometry_type(
        geometry::normalise_feature_collection(collection),
    ));
    let polygons = geometry::collect_polygons(&collection)?;
    if polygons.is_empty() {
        return Err(GeometryError::NoPolygons.into());
    }
    Ok(polygons)
}

fn preview_split(
    boundary: &[u8],
    no_fly_zones: Option<&[u8]>,
    meters: f64,
) -> Result<FeatureCollection, ServiceError> {
    let invalid = |err: GeometryError| {
        ServiceError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_geojson",
            err.to_string(),
        )
    };
    let merged = geometry::merge_multipolygon(
        geometry::parse_feature_collection(boundary).map_err(invalid)?,
    )?;
    let zones = match no_fly_zones {
        Some(bytes) => {
            let collection = geometry::parse_feature_collection(bytes).map_err(invalid)?;
            geometry::collect_polygons(&geometry::normalise_feature_collection(collection))?
        }
        None => Vec::new(),
    };

    let area = geometry::subtract_no_fly_zones(&MultiPolygon::new(vec![merged]), zones);
    if area.0.is_empty() {
        return Err(ServiceError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "empty_outline",
            "no-fly zones cover the whole project area".to_string(),
        ));
    }
    Ok(geometry::split_by_square(&area, meters)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_state::State;
    use rstest::rstest;
    use serde_json::json;

    fn square(x: f64, y: f64, size: f64) -> serde_json::Value {
        json!({
            "type": "Feature",
            "properties": {},
            "geometry": {
                "type": "Polygon",
                "coordinates": [[[x, y], [x + size, y], [x + size, y + size], [x, y + size], [x, y]]]
            }
        })
    }

    fn collection(features: Vec<serde_json::Value>) -> Vec<u8> {
        serde_json::to_vec(&json!({ "type": "FeatureCollection", "features": features })).unwrap()
    }

    #[test]
    fn paging_defaults_and_bounds() {
        assert_eq!(page_window(None, None).unwrap(), (1, 20, 0));
        assert_eq!(page_window(Some(3), Some(10)).unwrap(), (3, 10, 20));
        assert_eq!(page_window(Some(0), None).unwrap_err().body.code, "invalid_page");
        assert_eq!(
            page_window(None, Some(101)).unwrap_err().body.code,
            "invalid_page_size"
        );
    }

    #[test]
    fn export_names_follow_the_requested_scope() {
        let task = Uuid::from_u128(5);
        assert_eq!(
            export_file_name(Some(task), false, ExportFormat::GeoJson),
            "project_aoi.geojson"
        );
        assert_eq!(
            export_file_name(Some(task), true, ExportFormat::Kml),
            format!("task_{task}.kml")
        );
        assert_eq!(
            export_file_name(None, true, ExportFormat::GeoJson),
            "project_outline.geojson"
        );
    }

    #[test]
    fn export_formats() {
        assert_eq!(ExportFormat::parse(None).unwrap(), ExportFormat::GeoJson);
        assert_eq!(ExportFormat::parse(Some("KML")).unwrap(), ExportFormat::Kml);
        let err = ExportFormat::parse(Some("shp")).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(ExportFormat::Kml.content_type(), "application/vnd.google-earth.kml+xml");
    }

    #[test]
    fn webhook_payload_validation() {
        let body = serde_json::to_vec(&json!({ "uuid": "odm-1", "status": { "code": 40 } })).unwrap();
        assert_eq!(parse_webhook(&body).unwrap(), ("odm-1".to_string(), 40));

        let err = parse_webhook(b"not json").unwrap_err();
        assert_eq!((err.status, err.body.code), (StatusCode::BAD_REQUEST, "invalid_json"));

        let missing = serde_json::to_vec(&json!({ "uuid": "odm-1" })).unwrap();
        assert_eq!(parse_webhook(&missing).unwrap_err().body.code, "invalid_payload");
    }

    #[test]
    fn dimensions_and_file_names() {
        assert_eq!(parse_dimension(None, 100).unwrap(), 100.0);
        assert_eq!(parse_dimension(Some(" 250 "), 100).unwrap(), 250.0);
        assert!(parse_dimension(Some("-5"), 100).is_err());
        assert!(parse_dimension(Some("wide"), 100).is_err());
        assert!(is_geojson_file("aoi.GeoJSON"));
        assert!(is_geojson_file("aoi.json"));
        assert!(!is_geojson_file("aoi.kml"));
    }

    #[test]
    fn boundary_upload_explodes_multipolygons() {
        let multi = json!({
            "type": "Feature",
            "properties": { "name": "two parts" },
            "geometry": {
                "type": "MultiPolygon",
                "coordinates": [
                    [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]],
                    [[[2.0, 0.0], [3.0, 0.0], [3.0, 1.0], [2.0, 0.0]]]
                ]
            }
        });
        let point = json!({
            "type": "Feature",
            "properties": {},
            "geometry": { "type": "Point", "coordinates": [5.0, 5.0] }
        });
        let polygons = boundary_polygons(&collection(vec![multi, point])).unwrap();
        assert_eq!(polygons.len(), 2);
    }

    #[test]
    fn boundary_upload_rejects_bad_input() {
        let err = boundary_polygons(b"{ nope").unwrap_err();
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);

        let points = collection(vec![json!({
            "type": "Feature",
            "properties": {},
            "geometry": { "type": "Point", "coordinates": [5.0, 5.0] }
        })]);
        assert_eq!(boundary_polygons(&points).unwrap_err().status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn outline_subtracts_no_fly_zones() {
        let outline = GeoJson::from_value(square(0.0, 0.0, 1.0)).unwrap();
        let zone = GeoJson::from_value(square(0.5, 0.5, 1.0)).unwrap();
        let (outline, zones) = build_outline(outline, Some(zone)).unwrap();
        assert!(zones.is_some());
        let area = geo::Area::unsigned_area(&outline);
        assert!((area - 0.75).abs() < 1e-9, "area was {area}");
    }

    #[test]
    fn outline_fully_covered_is_rejected() {
        let outline = GeoJson::from_value(square(0.0, 0.0, 1.0)).unwrap();
        let zone = GeoJson::from_value(square(-1.0, -1.0, 3.0)).unwrap();
        let err = build_outline(outline, Some(zone)).unwrap_err();
        assert_eq!(err.body.code, "empty_outline");
    }

    #[test]
    fn preview_split_numbers_cells() {
        let boundary = collection(vec![square(30.0, 0.0, 0.01)]);
        let cells = preview_split(&boundary, None, 1000.0).unwrap();
        assert!(!cells.features.is_empty());
        let first = cells.features[0].properties.clone().unwrap_or_default();
        assert_eq!(first["task_index"], 1);
    }

    #[test]
    fn geometry_errors_map_to_statuses() {
        let err: ServiceError = GeometryError::InvalidDimension(0.0).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        let err: ServiceError = GeometryError::NoPolygons.into();
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn transition_errors_map_to_statuses() {
        let err: ServiceError = TransitionError::WrongState {
            current: State::UnlockedDone,
            expected: State::LockedForMapping,
        }
        .into();
        assert_eq!(err.status, StatusCode::CONFLICT);
        let err: ServiceError = TransitionError::NotLockHolder.into();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
    }

    fn event_context(current: State, user_id: &str) -> EventContext<'_> {
        EventContext {
            current,
            requires_approval: true,
            user_id,
            project_author: "author",
            last_actor: Some("pilot"),
        }
    }

    #[rstest]
    #[case::request_on_locked_task(EventType::Request, State::LockedForMapping, "pilot")]
    #[case::finish_before_lock(EventType::Finish, State::UnlockedToMap, "pilot")]
    #[case::good_on_done_task(EventType::Good, State::UnlockedDone, "author")]
    fn events_from_the_wrong_state_conflict(
        #[case] event: EventType,
        #[case] current: State,
        #[case] user_id: &str,
    ) {
        let err = plan_event(event, &event_context(current, user_id), None).unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.body.code, "invalid_transition");
    }

    #[rstest]
    #[case::map_by_pilot(EventType::Map, State::RequestForMapping)]
    #[case::reject_by_pilot(EventType::Reject, State::RequestForMapping)]
    #[case::unlock_by_someone_else(EventType::Unlock, State::LockedForMapping)]
    fn events_by_the_wrong_user_are_forbidden(#[case] event: EventType, #[case] current: State) {
        let err = plan_event(event, &event_context(current, "intruder"), None).unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn event_comment_defaults_to_the_transition() {
        let context = event_context(State::UnlockedToMap, "pilot");
        let (transition, comment) = plan_event(EventType::Request, &context, None).unwrap();
        assert_eq!(transition.to, State::RequestForMapping);
        assert_eq!(comment, "Request for mapping");

        let (_, blank) =
            plan_event(EventType::Request, &context, Some("  ".to_string())).unwrap();
        assert_eq!(blank, "Request for mapping");

        let (_, custom) =
            plan_event(EventType::Request, &context, Some(" north edge first ".to_string()))
                .unwrap();
        assert_eq!(custom, "north edge first");
    }

    #[test]
    fn concurrent_requests_record_only_once() {
        // Both users read the task as unlocked; only the first insert finds it there.
        let first = plan_event(
            EventType::Request,
            &event_context(State::UnlockedToMap, "pilot"),
            None,
        )
        .unwrap()
        .0;
        let second = plan_event(
            EventType::Request,
            &event_context(State::UnlockedToMap, "other-pilot"),
            None,
        )
        .unwrap()
        .0;
        assert_eq!(first, second);

        assert!(ensure_recorded(true, &first).is_ok());
        let err = ensure_recorded(false, &second).unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.body.code, "state_changed");
        assert!(err.body.message.contains("UNLOCKED_TO_MAP"), "{}", err.body.message);
    }
}
