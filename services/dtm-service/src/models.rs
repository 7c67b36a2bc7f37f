use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geojson::{Feature, GeoJson, Geometry};
use crate::task_state::{EventType, State};

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
    pub reasons: Vec<String>,
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub short_description: Option<String>,
    pub description: Option<String>,
    pub per_task_instructions: Option<String>,
    pub author_id: String,
    pub status: String,
    pub visibility: String,
    pub requires_approval_from_manager_for_locking: bool,
    pub task_split_dimension: Option<i32>,
    pub gsd_cm_px: Option<f64>,
    pub overlap_percent: Option<f64>,
    pub gimble_angles_degrees: Option<Vec<i16>>,
    pub dem_url: Option<String>,
    pub image_url: Option<String>,
    pub location_str: Option<String>,
    pub outline: Option<Feature>,
    pub created_at: String,
    pub total_task_count: i64,
}

/// `project_info` part of the create-project form.
#[derive(Debug, Deserialize)]
pub struct ProjectIn {
    pub name: Option<String>,
    pub author_id: Option<String>,
    pub short_description: Option<String>,
    pub description: Option<String>,
    pub per_task_instructions: Option<String>,
    pub outline: Option<GeoJson>,
    pub no_fly_zones: Option<GeoJson>,
    pub gsd_cm_px: Option<f64>,
    pub overlap_percent: Option<f64>,
    pub gimble_angles_degrees: Option<Vec<i16>>,
    pub task_split_dimension: Option<i32>,
    #[serde(default)]
    pub requires_approval_from_manager_for_locking: bool,
}

/// Validated project ready for insertion. Geometries are WKB.
pub struct NewProject {
    pub id: Uuid,
    pub name: String,
    pub author_id: String,
    pub short_description: Option<String>,
    pub description: Option<String>,
    pub per_task_instructions: Option<String>,
    pub outline: Vec<u8>,
    pub no_fly_zones: Option<Vec<u8>>,
    pub gsd_cm_px: Option<f64>,
    pub overlap_percent: Option<f64>,
    pub gimble_angles_degrees: Option<Vec<i16>>,
    pub task_split_dimension: Option<i32>,
    pub requires_approval_from_manager_for_locking: bool,
    pub location_str: Option<String>,
}

/// A file part read from a multipart form.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct CreateProjectForm {
    pub project_info: Option<Vec<u8>>,
    pub dem: Option<UploadedFile>,
    pub image: Option<UploadedFile>,
}

#[derive(Debug, Default)]
pub struct SplitPreviewForm {
    pub project_geojson: Option<UploadedFile>,
    pub no_fly_zones: Option<UploadedFile>,
    pub dimension: Option<String>,
}

/// File returned with a `Content-Disposition: attachment` header.
pub struct Attachment {
    pub file_name: String,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub struct ListProjectsParams {
    #[serde(default)]
    pub filter_by_owner: bool,
    pub user_id: Option<String>,
    pub search: Option<String>,
    pub page: Option<i64>,
    pub results_per_page: Option<i64>,
}

#[derive(Serialize)]
pub struct Pagination {
    pub page: i64,
    pub per_page: i64,
    pub total: i64,
}

#[derive(Serialize)]
pub struct ProjectListResponse {
    pub results: Vec<Project>,
    pub pagination: Pagination,
}

#[derive(Serialize)]
pub struct ProjectInfo {
    #[serde(flatten)]
    pub project: Project,
    pub tasks: Vec<TaskOut>,
}

#[derive(Serialize)]
pub struct CentroidOut {
    pub id: Uuid,
    pub name: String,
    pub centroid: Option<Geometry>,
    pub total_task_count: i64,
    pub ongoing_task_count: i64,
    pub completed_task_count: i64,
}

#[derive(Debug, Deserialize)]
pub struct DeleteProjectParams {
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskOut {
    pub id: Uuid,
    pub project_task_index: i32,
    pub outline: Feature,
    pub task_area: f64,
    pub state: State,
}

#[derive(Serialize)]
pub struct TaskDetail {
    pub id: Uuid,
    pub project_id: Uuid,
    pub project_name: String,
    pub project_task_index: i32,
    pub per_task_instructions: Option<String>,
    pub outline: Feature,
    pub task_area: f64,
    pub state: State,
}

#[derive(Serialize)]
pub struct TaskStateOut {
    pub task_id: Uuid,
    pub project_id: Uuid,
    pub state: State,
}

#[derive(Debug, Deserialize)]
pub struct UserStatsParams {
    pub user_id: Option<String>,
    pub role: Option<String>,
    pub skip: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Serialize)]
pub struct UserTaskStats {
    pub task_id: Uuid,
    pub project_id: Uuid,
    pub task_area: f64,
    pub created_at: String,
    pub state: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct NewEvent {
    pub event: EventType,
    pub user_id: Option<String>,
    pub comment: Option<String>,
}

#[derive(Serialize)]
pub struct EventResponse {
    pub project_id: Uuid,
    pub task_id: Uuid,
    pub state: State,
    pub comment: String,
}

#[derive(Debug, Deserialize)]
pub struct DownloadParams {
    pub task_id: Option<Uuid>,
    #[serde(default)]
    pub split_area: bool,
    pub export_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AssetsParams {
    pub task_id: Option<Uuid>,
}

#[derive(Serialize)]
pub struct AssetsInfo {
    pub project_id: Uuid,
    pub task_id: Uuid,
    pub image_count: usize,
    pub assets_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<State>,
}

/// One task when `task_id` is given, otherwise every task of the project.
#[derive(Serialize)]
#[serde(untagged)]
pub enum AssetsResponse {
    Task(AssetsInfo),
    Project(Vec<AssetsInfo>),
}

#[derive(Debug, Deserialize)]
pub struct ProcessImageryRequest {
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OdmWebhookPayload {
    pub uuid: Option<String>,
    pub status: Option<OdmWebhookStatus>,
}

#[derive(Debug, Deserialize)]
pub struct OdmWebhookStatus {
    pub code: Option<i64>,
}

#[derive(Serialize)]
pub struct WebhookResponse {
    pub message: &'static str,
    pub task_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn project_info_accepts_geojson_outline() {
        let info: ProjectIn = serde_json::from_value(json!({
            "name": "Kathmandu survey",
            "author_id": "110878106282210575794",
            "outline": {
                "type": "Feature",
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[[85.3, 27.7], [85.31, 27.7], [85.31, 27.71], [85.3, 27.7]]]
                },
                "properties": {}
            },
            "gimble_angles_degrees": [-90, -45]
        }))
        .unwrap();
        assert!(matches!(info.outline, Some(GeoJson::Feature(_))));
        assert!(!info.requires_approval_from_manager_for_locking);
        assert_eq!(info.gimble_angles_degrees, Some(vec![-90, -45]));
    }

    #[test]
    fn webhook_payload_tolerates_missing_fields() {
        let payload: OdmWebhookPayload =
            serde_json::from_value(json!({ "uuid": "abc", "status": { "code": 40 } })).unwrap();
        assert_eq!(payload.status.and_then(|status| status.code), Some(40));

        let empty: OdmWebhookPayload = serde_json::from_value(json!({})).unwrap();
        assert!(empty.uuid.is_none() && empty.status.is_none());
    }

    #[test]
    fn new_event_parses_wire_names() {
        let event: NewEvent =
            serde_json::from_value(json!({ "event": "finish", "user_id": "u1" })).unwrap();
        assert_eq!(event.event, EventType::Finish);
        assert!(event.comment.is_none());
    }
}
