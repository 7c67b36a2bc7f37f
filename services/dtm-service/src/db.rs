use tokio_postgres::{Client, GenericClient, Row};
use uuid::Uuid;

use crate::geojson::{Feature, Geometry};
use crate::geometry;
use crate::models::{CentroidOut, NewProject, Project, TaskDetail, TaskOut, TaskStateOut, UserTaskStats};
use crate::task_state::State;
use crate::wkb;

macro_rules! project_select {
    ($tail:literal) => {
        concat!(
            "SELECT p.id, p.name, p.short_description, p.description, p.per_task_instructions, \
p.author_id, p.status, p.visibility, p.requires_approval_from_manager_for_locking, \
p.task_split_dimension, p.gsd_cm_px, p.overlap_percent, p.gimble_angles_degrees, \
p.dem_url, p.image_url, p.location_str, ST_AsBinary(p.outline) AS outline, \
p.created_at::text AS created_at, \
(SELECT COUNT(*) FROM tasks t WHERE t.project_id = p.id) AS total_task_count \
FROM projects p ",
            $tail
        )
    };
}

const SQL_LIST_PROJECTS: &str = project_select!(
    "WHERE ($1::text IS NULL OR p.author_id = $1) \
AND ($2::text IS NULL OR p.name ILIKE '%' || $2 || '%') \
ORDER BY p.created_at DESC OFFSET $3 LIMIT $4"
);
const SQL_COUNT_PROJECTS: &str = "SELECT COUNT(*) AS total FROM projects p \
WHERE ($1::text IS NULL OR p.author_id = $1) \
AND ($2::text IS NULL OR p.name ILIKE '%' || $2 || '%')";
const SQL_SELECT_PROJECT: &str = project_select!("WHERE p.id = $1");
const SQL_INSERT_PROJECT: &str = "INSERT INTO projects (id, name, short_description, description, \
per_task_instructions, author_id, status, visibility, outline, no_fly_zones, centroid, gsd_cm_px, \
overlap_percent, gimble_angles_degrees, task_split_dimension, \
requires_approval_from_manager_for_locking, location_str) \
VALUES ($1, $2, $3, $4, $5, $6, 'DRAFT', 'PUBLIC', ST_GeomFromWKB($7, 4326), \
ST_GeomFromWKB($8, 4326), ST_Centroid(ST_GeomFromWKB($7, 4326)), $9, $10, $11, $12, $13, $14) \
RETURNING id";
const SQL_UPDATE_PROJECT_ASSETS: &str = "UPDATE projects \
SET dem_url = COALESCE($2, dem_url), image_url = COALESCE($3, image_url) WHERE id = $1";
const SQL_DELETE_PROJECT_EVENTS: &str = "DELETE FROM task_events WHERE project_id = $1";
const SQL_DELETE_PROJECT_TASKS: &str = "DELETE FROM tasks WHERE project_id = $1";
const SQL_DELETE_PROJECT: &str = "DELETE FROM projects WHERE id = $1";
const SQL_INSERT_TASK: &str = "INSERT INTO tasks (id, project_id, project_task_index, outline) \
VALUES ($1, $2, $3, ST_GeomFromWKB($4, 4326))";
const SQL_LIST_TASKS: &str = "SELECT t.id, t.project_task_index, ST_AsBinary(t.outline) AS outline, \
COALESCE(e.state, 'UNLOCKED_TO_MAP') AS state \
FROM tasks t \
LEFT JOIN LATERAL (SELECT state FROM task_events te WHERE te.task_id = t.id \
ORDER BY te.created_at DESC LIMIT 1) e ON TRUE \
WHERE t.project_id = $1 ORDER BY t.project_task_index";
const SQL_SELECT_TASK: &str = "SELECT t.id, t.project_id, p.name AS project_name, \
p.per_task_instructions, t.project_task_index, ST_AsBinary(t.outline) AS outline, \
COALESCE(e.state, 'UNLOCKED_TO_MAP') AS state \
FROM tasks t JOIN projects p ON p.id = t.project_id \
LEFT JOIN LATERAL (SELECT state FROM task_events te WHERE te.task_id = t.id \
ORDER BY te.created_at DESC LIMIT 1) e ON TRUE \
WHERE t.id = $1";
const SQL_SELECT_TASK_OUTLINE: &str = "SELECT ST_AsBinary(outline) AS outline FROM tasks \
WHERE project_id = $1 AND id = $2";
const SQL_TASK_STATE: &str = "SELECT COALESCE(e.state, 'UNLOCKED_TO_MAP') AS state, e.user_id \
FROM tasks t \
LEFT JOIN LATERAL (SELECT state, user_id FROM task_events te WHERE te.task_id = t.id \
ORDER BY te.created_at DESC LIMIT 1) e ON TRUE \
WHERE t.project_id = $1 AND t.id = $2";
const SQL_TASK_STATES: &str = "SELECT t.id AS task_id, t.project_id, \
COALESCE(e.state, 'UNLOCKED_TO_MAP') AS state \
FROM tasks t \
LEFT JOIN LATERAL (SELECT state FROM task_events te WHERE te.task_id = t.id \
ORDER BY te.created_at DESC LIMIT 1) e ON TRUE \
WHERE t.project_id = $1 ORDER BY t.project_task_index";
// Inserts only when the latest recorded state (or the implicit initial one)
// still equals $6.
const SQL_INSERT_EVENT_IF_STATE: &str = "WITH latest AS (\
SELECT state FROM task_events WHERE project_id = $1 AND task_id = $2 \
ORDER BY created_at DESC LIMIT 1) \
INSERT INTO task_events (event_id, project_id, task_id, user_id, comment, state, created_at) \
SELECT $3, $1, $2, $4, $5, $7, clock_timestamp() \
WHERE COALESCE((SELECT state FROM latest), 'UNLOCKED_TO_MAP') = $6 \
RETURNING state";
const SQL_PROJECT_CENTROIDS: &str = "SELECT p.id, p.name, ST_AsBinary(p.centroid) AS centroid, \
COUNT(t.id) AS total_task_count, \
COUNT(t.id) FILTER (WHERE e.state IN ('REQUEST_FOR_MAPPING', 'LOCKED_FOR_MAPPING', \
'IMAGE_UPLOADED')) AS ongoing_task_count, \
COUNT(t.id) FILTER (WHERE e.state IN ('UNLOCKED_DONE', 'IMAGE_PROCESSED')) AS completed_task_count \
FROM projects p \
LEFT JOIN tasks t ON t.project_id = p.id \
LEFT JOIN LATERAL (SELECT state FROM task_events te WHERE te.task_id = t.id \
ORDER BY te.created_at DESC LIMIT 1) e ON TRUE \
GROUP BY p.id ORDER BY p.created_at DESC";
// Pilots see tasks they acted on; everyone else sees tasks of projects
// they created.
const SQL_USER_TASK_STATS: &str = "SELECT DISTINCT ON (t.id) t.id AS task_id, te.project_id, \
ST_Area(t.outline::geography) / 1000000 AS task_area, \
te.created_at::text AS created_at, te.state \
FROM task_events te JOIN tasks t ON t.id = te.task_id \
WHERE ($2 = 'DRONE_PILOT' AND te.user_id = $1) \
OR ($2 <> 'DRONE_PILOT' AND te.project_id IN (SELECT id FROM projects WHERE author_id = $1)) \
ORDER BY t.id, te.created_at DESC OFFSET $3 LIMIT $4";

/// Latest recorded state of a task and the user who recorded it.
pub struct TaskStateRow {
    pub state: State,
    pub last_user: Option<String>,
}

fn parse_state(row: &Row) -> Result<State, String> {
    let raw: String = row.get("state");
    raw.parse::<State>().map_err(|err| err.to_string())
}

fn decode_outline(bytes: &[u8]) -> Result<geo_types::Geometry<f64>, String> {
    wkb::decode(bytes).map_err(|err| format!("decode outline failed: {err}"))
}

fn project_from_row(row: &Row) -> Result<Project, String> {
    let id: Uuid = row.get("id");
    let outline = row
        .get::<_, Option<Vec<u8>>>("outline")
        .map(|bytes| decode_outline(&bytes))
        .transpose()?
        .map(|geometry| {
            Feature::new(Geometry::from(&geometry))
                .with_id(id.to_string())
                .with_property("id", id.to_string())
        });

    Ok(Project {
        id,
        name: row.get("name"),
        short_description: row.get("short_description"),
        description: row.get("description"),
        per_task_instructions: row.get("per_task_instructions"),
        author_id: row.get("author_id"),
        status: row.get("status"),
        visibility: row.get("visibility"),
        requires_approval_from_manager_for_locking: row
            .get("requires_approval_from_manager_for_locking"),
        task_split_dimension: row.get("task_split_dimension"),
        gsd_cm_px: row.get("gsd_cm_px"),
        overlap_percent: row.get("overlap_percent"),
        gimble_angles_degrees: row.get("gimble_angles_degrees"),
        dem_url: row.get("dem_url"),
        image_url: row.get("image_url"),
        location_str: row.get("location_str"),
        outline,
        created_at: row.get("created_at"),
        total_task_count: row.get("total_task_count"),
    })
}

fn task_feature(id: Uuid, index: i32, geometry: &geo_types::Geometry<f64>) -> Feature {
    Feature::new(Geometry::from(geometry))
        .with_id(id.to_string())
        .with_property("id", id.to_string())
        .with_property("project_task_index", index)
}

pub async fn list_projects(
    db: &Client,
    owner: Option<&str>,
    search: Option<&str>,
    offset: i64,
    limit: i64,
) -> Result<Vec<Project>, String> {
    let rows = db
        .query(SQL_LIST_PROJECTS, &[&owner, &search, &offset, &limit])
        .await
        .map_err(|err| format!("list projects failed: {err}"))?;
    rows.iter().map(project_from_row).collect()
}

pub async fn count_projects(
    db: &Client,
    owner: Option<&str>,
    search: Option<&str>,
) -> Result<i64, String> {
    let row = db
        .query_one(SQL_COUNT_PROJECTS, &[&owner, &search])
        .await
        .map_err(|err| format!("count projects failed: {err}"))?;
    Ok(row.get("total"))
}

pub async fn select_project(db: &Client, project_id: Uuid) -> Result<Option<Project>, String> {
    let row = db
        .query_opt(SQL_SELECT_PROJECT, &[&project_id])
        .await
        .map_err(|err| format!("select project failed: {err}"))?;
    row.as_ref().map(project_from_row).transpose()
}

/// The raw driver error is returned so callers can detect duplicate names.
pub async fn insert_project(
    db: &impl GenericClient,
    project: &NewProject,
) -> Result<Uuid, tokio_postgres::Error> {
    let row = db
        .query_one(
            SQL_INSERT_PROJECT,
            &[
                &project.id,
                &project.name,
                &project.short_description,
                &project.description,
                &project.per_task_instructions,
                &project.author_id,
                &project.outline,
                &project.no_fly_zones,
                &project.gsd_cm_px,
                &project.overlap_percent,
                &project.gimble_angles_degrees,
                &project.task_split_dimension,
                &project.requires_approval_from_manager_for_locking,
                &project.location_str,
            ],
        )
        .await?;
    Ok(row.get("id"))
}

pub async fn update_project_assets(
    db: &Client,
    project_id: Uuid,
    dem_url: Option<&str>,
    image_url: Option<&str>,
) -> Result<(), String> {
    db.execute(SQL_UPDATE_PROJECT_ASSETS, &[&project_id, &dem_url, &image_url])
        .await
        .map_err(|err| format!("update project assets failed: {err}"))?;
    Ok(())
}

/// Removes the project with its tasks and events. Returns whether a
/// project row was deleted.
pub async fn delete_project(db: &impl GenericClient, project_id: Uuid) -> Result<bool, String> {
    delete_project_tasks(db, project_id).await?;
    let deleted = db
        .execute(SQL_DELETE_PROJECT, &[&project_id])
        .await
        .map_err(|err| format!("delete project failed: {err}"))?;
    Ok(deleted > 0)
}

pub async fn delete_project_tasks(db: &impl GenericClient, project_id: Uuid) -> Result<u64, String> {
    db.execute(SQL_DELETE_PROJECT_EVENTS, &[&project_id])
        .await
        .map_err(|err| format!("delete task events failed: {err}"))?;
    db.execute(SQL_DELETE_PROJECT_TASKS, &[&project_id])
        .await
        .map_err(|err| format!("delete tasks failed: {err}"))
}

pub async fn insert_task(
    db: &impl GenericClient,
    task_id: Uuid,
    project_id: Uuid,
    index: i32,
    outline: &[u8],
) -> Result<(), String> {
    db.execute(SQL_INSERT_TASK, &[&task_id, &project_id, &index, &outline])
        .await
        .map_err(|err| format!("insert task {index} failed: {err}"))?;
    Ok(())
}

pub async fn list_tasks(db: &Client, project_id: Uuid) -> Result<Vec<TaskOut>, String> {
    let rows = db
        .query(SQL_LIST_TASKS, &[&project_id])
        .await
        .map_err(|err| format!("list tasks failed: {err}"))?;

    rows.iter()
        .map(|row| {
            let id: Uuid = row.get("id");
            let index: i32 = row.get("project_task_index");
            let geometry = decode_outline(row.get::<_, &[u8]>("outline"))?;
            Ok(TaskOut {
                id,
                project_task_index: index,
                task_area: geometry::area_km2(&geometry),
                outline: task_feature(id, index, &geometry),
                state: parse_state(row)?,
            })
        })
        .collect()
}

pub async fn select_task(db: &Client, task_id: Uuid) -> Result<Option<TaskDetail>, String> {
    let Some(row) = db
        .query_opt(SQL_SELECT_TASK, &[&task_id])
        .await
        .map_err(|err| format!("select task failed: {err}"))?
    else {
        return Ok(None);
    };

    let index: i32 = row.get("project_task_index");
    let geometry = decode_outline(row.get::<_, &[u8]>("outline"))?;
    Ok(Some(TaskDetail {
        id: row.get("id"),
        project_id: row.get("project_id"),
        project_name: row.get("project_name"),
        project_task_index: index,
        per_task_instructions: row.get("per_task_instructions"),
        task_area: geometry::area_km2(&geometry),
        outline: task_feature(task_id, index, &geometry),
        state: parse_state(&row)?,
    }))
}

pub async fn select_task_outline(
    db: &Client,
    project_id: Uuid,
    task_id: Uuid,
) -> Result<Option<geo_types::Geometry<f64>>, String> {
    let row = db
        .query_opt(SQL_SELECT_TASK_OUTLINE, &[&project_id, &task_id])
        .await
        .map_err(|err| format!("select task outline failed: {err}"))?;
    row.map(|row| decode_outline(row.get::<_, &[u8]>("outline")))
        .transpose()
}

/// `None` when the task does not belong to the project.
pub async fn task_state(
    db: &Client,
    project_id: Uuid,
    task_id: Uuid,
) -> Result<Option<TaskStateRow>, String> {
    let row = db
        .query_opt(SQL_TASK_STATE, &[&project_id, &task_id])
        .await
        .map_err(|err| format!("select task state failed: {err}"))?;
    row.map(|row| {
        Ok(TaskStateRow {
            state: parse_state(&row)?,
            last_user: row.get("user_id"),
        })
    })
    .transpose()
}

pub async fn task_states(db: &Client, project_id: Uuid) -> Result<Vec<TaskStateOut>, String> {
    let rows = db
        .query(SQL_TASK_STATES, &[&project_id])
        .await
        .map_err(|err| format!("list task states failed: {err}"))?;
    rows.iter()
        .map(|row| {
            Ok(TaskStateOut {
                task_id: row.get("task_id"),
                project_id: row.get("project_id"),
                state: parse_state(row)?,
            })
        })
        .collect()
}

/// Records a transition if the task is still in `from`. Returns `false`
/// when another state was recorded in the meantime.
pub async fn insert_task_event_if_state(
    db: &impl GenericClient,
    project_id: Uuid,
    task_id: Uuid,
    user_id: &str,
    comment: &str,
    from: State,
    to: State,
) -> Result<bool, String> {
    let event_id = Uuid::new_v4();
    let row = db
        .query_opt(
            SQL_INSERT_EVENT_IF_STATE,
            &[
                &project_id,
                &task_id,
                &event_id,
                &user_id,
                &comment,
                &from.as_str(),
                &to.as_str(),
            ],
        )
        .await
        .map_err(|err| format!("insert task event failed: {err}"))?;
    Ok(row.is_some())
}

pub async fn project_centroids(db: &Client) -> Result<Vec<CentroidOut>, String> {
    let rows = db
        .query(SQL_PROJECT_CENTROIDS, &[])
        .await
        .map_err(|err| format!("project centroids failed: {err}"))?;

    rows.iter()
        .map(|row| {
            let centroid = row
                .get::<_, Option<&[u8]>>("centroid")
                .map(|bytes| {
                    wkb::decode(bytes)
                        .map(|point| Geometry::from(&point))
                        .map_err(|err| format!("decode centroid failed: {err}"))
                })
                .transpose()?;
            Ok(CentroidOut {
                id: row.get("id"),
                name: row.get("name"),
                centroid,
                total_task_count: row.get("total_task_count"),
                ongoing_task_count: row.get("ongoing_task_count"),
                completed_task_count: row.get("completed_task_count"),
            })
        })
        .collect()
}

pub async fn user_task_stats(
    db: &Client,
    user_id: &str,
    role: &str,
    skip: i64,
    limit: i64,
) -> Result<Vec<UserTaskStats>, String> {
    let rows = db
        .query(SQL_USER_TASK_STATS, &[&user_id, &role, &skip, &limit])
        .await
        .map_err(|err| format!("user task statistics failed: {err}"))?;

    rows.iter()
        .map(|row| {
            Ok(UserTaskStats {
                task_id: row.get("task_id"),
                project_id: row.get("project_id"),
                task_area: row.get("task_area"),
                created_at: row.get("created_at"),
                state: parse_state(row)?.stats_label(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::polygon;

    #[test]
    fn project_queries_share_the_column_list() {
        for sql in [SQL_LIST_PROJECTS, SQL_SELECT_PROJECT] {
            assert!(sql.starts_with("SELECT p.id, p.name"));
            assert!(sql.contains("ST_AsBinary(p.outline) AS outline"));
            assert!(sql.contains("FROM projects p WHERE"));
        }
    }

    #[test]
    fn list_and_count_filter_the_same_way() {
        let filter = "WHERE ($1::text IS NULL OR p.author_id = $1) \
AND ($2::text IS NULL OR p.name ILIKE '%' || $2 || '%')";
        assert!(SQL_LIST_PROJECTS.contains(filter));
        assert!(SQL_COUNT_PROJECTS.contains(filter));
    }

    #[test]
    fn tasks_without_events_default_to_unlocked() {
        for sql in [SQL_LIST_TASKS, SQL_SELECT_TASK, SQL_TASK_STATE, SQL_TASK_STATES] {
            assert!(sql.contains("COALESCE(e.state, 'UNLOCKED_TO_MAP')"));
        }
        assert!(SQL_INSERT_EVENT_IF_STATE.contains("'UNLOCKED_TO_MAP') = $6"));
        assert_eq!(State::default().as_str(), "UNLOCKED_TO_MAP");
    }

    #[test]
    fn task_features_carry_identifiers() {
        let id = Uuid::from_u128(3);
        let square = geo_types::Geometry::Polygon(polygon![
            (x: 0.0, y: 0.0),
            (x: 1.0, y: 0.0),
            (x: 1.0, y: 1.0),
            (x: 0.0, y: 0.0),
        ]);
        let feature = task_feature(id, 4, &square);
        assert_eq!(feature.geometry_type(), Some("Polygon"));
        let properties = feature.properties.unwrap_or_default();
        assert_eq!(properties["project_task_index"], 4);
        assert_eq!(properties["id"], id.to_string());
    }
}
