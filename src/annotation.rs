use crate::cancel::Cancellation;
use crate::error::{ServiceError, ServiceResult};
use lru::LruCache;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, instrument};
use uuid::Uuid;

pub const EMPTY_ANNOTATION: &str = r#"{"entities":{}}"#;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub remark: String,
    pub spec_json: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Video {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub frame_urls: Vec<String>,
    pub created_at: i64,
}

/// A project with its videos and their annotation documents, keyed by video
/// name. Produced by export and accepted by import.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectBundle {
    pub project: BundleProject,
    #[serde(default)]
    pub videos: Vec<BundleVideo>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleProject {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub spec_json: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleVideo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub frame_urls: Vec<String>,
}

pub fn parse_id(raw: &str) -> ServiceResult<i64> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| ServiceError::InvalidId(raw.to_string()))
}

fn missing_field(name: &str) -> ServiceError {
    ServiceError::InvalidRequest(format!("missing field: {}", name))
}

// Unique violations are conflicts; a dangling project reference means the
// project is gone.
fn map_constraint(e: rusqlite::Error) -> ServiceError {
    if let rusqlite::Error::SqliteFailure(ref failure, _) = e {
        match failure.extended_code {
            rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
            | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                return ServiceError::Conflict
            }
            rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                return ServiceError::NotFound
            }
            _ => {}
        }
    }
    e.into()
}

/// Per-video write locks.
///
/// The map is an LRU bounded to `capacity`, but only entries nobody holds or
/// waits on are evicted. A lock in use is never dropped and replaced by a
/// fresh one, so the map can exceed `capacity` while every entry is busy.
pub struct VideoLocks {
    inner: Mutex<LruCache<i64, Arc<AsyncMutex<()>>>>,
    capacity: usize,
}

impl VideoLocks {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::unbounded()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn handle(&self, video_id: i64) -> Arc<AsyncMutex<()>> {
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let handle = map
            .get_or_insert(video_id, || Arc::new(AsyncMutex::new(())))
            .clone();

        while map.len() > self.capacity {
            // The map holds one reference; anything more is a holder or waiter.
            let idle = map
                .iter()
                .rev()
                .find(|(_, lock)| Arc::strong_count(lock) == 1)
                .map(|(id, _)| *id);
            match idle {
                Some(id) => {
                    map.pop(&id);
                }
                None => break,
            }
        }
        handle
    }

    /// Takes the lock for `video_id`, or gives up when `cancel` fires.
    pub async fn lock(
        &self,
        video_id: i64,
        cancel: &Cancellation,
    ) -> ServiceResult<OwnedMutexGuard<()>> {
        let handle = self.handle(video_id);
        tokio::select! {
            biased;
            err = cancel.fired() => Err(err),
            guard = handle.lock_owned() => Ok(guard),
        }
    }
}

/// Projects, videos, and the versioned annotation document of each video.
pub struct AnnotationStore {
    pool: Pool<SqliteConnectionManager>,
    locks: VideoLocks,
}

impl AnnotationStore {
    pub fn new(pool: Pool<SqliteConnectionManager>, lock_capacity: usize) -> Self {
        Self {
            pool,
            locks: VideoLocks::new(lock_capacity),
        }
    }

    pub fn locks(&self) -> &VideoLocks {
        &self.locks
    }

    async fn with_conn<T, F>(&self, f: F) -> ServiceResult<T>
    where
        F: FnOnce(&mut Connection) -> ServiceResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut *conn)
        })
        .await?
    }

    #[instrument(skip(self, spec_json), err)]
    pub async fn create_project(
        &self,
        name: &str,
        remark: &str,
        spec_json: Option<String>,
    ) -> ServiceResult<Project> {
        if name.is_empty() {
            return Err(missing_field("name"));
        }
        let name = name.to_string();
        let remark = remark.to_string();
        let project = self
            .with_conn(move |conn| {
                let created_at = chrono::Utc::now().timestamp();
                conn.execute(
                    "INSERT INTO projects (name, remark, spec_json, created_at)
                     VALUES (?, ?, ?, ?)",
                    params![name, remark, spec_json, created_at],
                )
                .map_err(map_constraint)?;
                Ok(Project {
                    id: conn.last_insert_rowid(),
                    name,
                    remark,
                    spec_json,
                    created_at,
                })
            })
            .await?;
        info!(project = project.id, "created project");
        Ok(project)
    }

    pub async fn list_projects(&self) -> ServiceResult<Vec<Project>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, remark, spec_json, created_at
                 FROM projects ORDER BY name ASC",
            )?;
            let rows = stmt.query_map([], project_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    pub async fn get_project(&self, id: i64) -> ServiceResult<Project> {
        self.with_conn(move |conn| select_project(conn, id)).await
    }

    pub async fn update_project(
        &self,
        id: i64,
        name: &str,
        remark: &str,
    ) -> ServiceResult<Project> {
        if name.is_empty() {
            return Err(missing_field("name"));
        }
        let name = name.to_string();
        let remark = remark.to_string();
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE projects SET name = ?, remark = ? WHERE id = ?",
                    params![name, remark, id],
                )
                .map_err(map_constraint)?;
            if changed == 0 {
                return Err(ServiceError::NotFound);
            }
            select_project(conn, id)
        })
        .await
    }

    /// Deletes the project and, through the foreign key, all of its videos.
    #[instrument(skip(self), err)]
    pub async fn delete_project(&self, id: i64) -> ServiceResult<Project> {
        self.with_conn(move |conn| {
            let project = select_project(conn, id)?;
            conn.execute("DELETE FROM projects WHERE id = ?", [id])?;
            Ok(project)
        })
        .await
    }

    #[instrument(skip(self, frame_urls), err)]
    pub async fn create_video(
        &self,
        project_id: i64,
        name: &str,
        frame_urls: Vec<String>,
    ) -> ServiceResult<Video> {
        if name.is_empty() {
            return Err(missing_field("name"));
        }
        let name = name.to_string();
        let frames = serde_json::to_string(&frame_urls)
            .map_err(|e| ServiceError::Internal(e.into()))?;
        let video = self
            .with_conn(move |conn| {
                let created_at = chrono::Utc::now().timestamp();
                conn.execute(
                    "INSERT INTO videos
                        (project_id, name, frame_urls, annotation_version, created_at)
                     VALUES (?, ?, ?, ?, ?)",
                    params![
                        project_id,
                        name,
                        frames,
                        Uuid::new_v4().to_string(),
                        created_at
                    ],
                )
                .map_err(map_constraint)?;
                Ok(Video {
                    id: conn.last_insert_rowid(),
                    project_id,
                    name,
                    frame_urls,
                    created_at,
                })
            })
            .await?;
        info!(video = video.id, project = project_id, "created video");
        Ok(video)
    }

    pub async fn get_video(&self, id: i64) -> ServiceResult<Video> {
        self.with_conn(move |conn| select_video(conn, id)).await
    }

    pub async fn list_videos(&self, project_id: i64) -> ServiceResult<Vec<Video>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, project_id, name, frame_urls, created_at
                 FROM videos WHERE project_id = ? ORDER BY name ASC",
            )?;
            let rows = stmt.query_map([project_id], video_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    pub async fn update_video(&self, id: i64, name: &str) -> ServiceResult<Video> {
        if name.is_empty() {
            return Err(missing_field("name"));
        }
        let name = name.to_string();
        self.with_conn(move |conn| {
            let changed = conn
                .execute("UPDATE videos SET name = ? WHERE id = ?", params![name, id])
                .map_err(map_constraint)?;
            if changed == 0 {
                return Err(ServiceError::NotFound);
            }
            select_video(conn, id)
        })
        .await
    }

    /// Deletes the video together with its annotation document.
    #[instrument(skip(self), err)]
    pub async fn delete_video(&self, id: i64) -> ServiceResult<Video> {
        self.with_conn(move |conn| {
            let video = select_video(conn, id)?;
            conn.execute("DELETE FROM videos WHERE id = ?", [id])?;
            Ok(video)
        })
        .await
    }

    /// Creates a project and all of its videos in one transaction. Each video
    /// starts at a fresh version with the document found under its name in
    /// `annotations`, if any.
    #[instrument(skip(self, bundle), fields(project = %bundle.project.name), err)]
    pub async fn import_project(&self, bundle: ProjectBundle) -> ServiceResult<Project> {
        if bundle.project.name.is_empty() {
            return Err(missing_field("project.name"));
        }
        let mut rows = Vec::with_capacity(bundle.videos.len());
        for video in bundle.videos {
            if video.name.is_empty() {
                return Err(missing_field("videos.name"));
            }
            let annotation = match bundle.annotations.get(&video.name) {
                Some(doc) if !doc.is_empty() => {
                    serde_json::from_str::<serde_json::Value>(doc).map_err(|e| {
                        ServiceError::InvalidRequest(format!(
                            "malformed annotation for video {}: {}",
                            video.name, e
                        ))
                    })?;
                    Some(doc.clone())
                }
                _ => None,
            };
            let frames = serde_json::to_string(&video.frame_urls)
                .map_err(|e| ServiceError::Internal(e.into()))?;
            rows.push((video.name, frames, annotation));
        }

        let BundleProject {
            name,
            remark,
            spec_json,
        } = bundle.project;
        let videos = rows.len();
        let project = self
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let created_at = chrono::Utc::now().timestamp();
                tx.execute(
                    "INSERT INTO projects (name, remark, spec_json, created_at)
                     VALUES (?, ?, ?, ?)",
                    params![name, remark, spec_json, created_at],
                )
                .map_err(map_constraint)?;
                let project_id = tx.last_insert_rowid();
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO videos
                            (project_id, name, frame_urls, annotation_json,
                             annotation_version, created_at)
                         VALUES (?, ?, ?, ?, ?, ?)",
                    )?;
                    for (video_name, frames, annotation) in &rows {
                        stmt.execute(params![
                            project_id,
                            video_name,
                            frames,
                            annotation,
                            Uuid::new_v4().to_string(),
                            created_at
                        ])
                        .map_err(map_constraint)?;
                    }
                }
                tx.commit()?;
                Ok(Project {
                    id: project_id,
                    name,
                    remark,
                    spec_json,
                    created_at,
                })
            })
            .await?;
        info!(project = project.id, videos, "imported project");
        Ok(project)
    }

    /// Reads a project back as a bundle that `import_project` accepts.
    /// Videos never annotated are left out of `annotations`.
    pub async fn export_project(&self, id: i64) -> ServiceResult<ProjectBundle> {
        self.with_conn(move |conn| {
            let project = select_project(conn, id)?;
            let mut stmt = conn.prepare(
                "SELECT name, frame_urls, annotation_json
                 FROM videos WHERE project_id = ? ORDER BY name ASC",
            )?;
            let mut videos = Vec::new();
            let mut annotations = BTreeMap::new();
            let mut rows = stmt.query([id])?;
            while let Some(row) = rows.next()? {
                let name: String = row.get(0)?;
                let frames: String = row.get(1)?;
                let frame_urls = serde_json::from_str(&frames)
                    .map_err(|e| ServiceError::Internal(e.into()))?;
                if let Some(doc) = row.get::<_, Option<String>>(2)? {
                    annotations.insert(name.clone(), doc);
                }
                videos.push(BundleVideo { name, frame_urls });
            }
            Ok(ProjectBundle {
                project: BundleProject {
                    name: project.name,
                    remark: project.remark,
                    spec_json: project.spec_json,
                },
                videos,
                annotations,
            })
        })
        .await
    }

    /// Returns the document, `None` if it was never written, and its version.
    pub async fn get_annotation(
        &self,
        video_id: i64,
    ) -> ServiceResult<(Option<String>, String)> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT annotation_json, annotation_version FROM videos WHERE id = ?",
                [video_id],
                |row| Ok((row.get::<_, Option<String>>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?
            .ok_or(ServiceError::NotFound)
        })
        .await
    }

    /// Applies an RFC 7396 merge patch if `expected_version` is still current
    /// and returns the new version.
    ///
    /// A stale version, or a video that does not exist, is a `Conflict`;
    /// callers re-read and retry.
    #[instrument(skip(self, merge_patch, cancel), err)]
    pub async fn patch_annotation(
        &self,
        id: i64,
        merge_patch: &str,
        expected_version: &str,
        cancel: &Cancellation,
    ) -> ServiceResult<String> {
        if merge_patch.trim().is_empty() {
            return Err(missing_field("json_merge_patch"));
        }
        serde_json::from_str::<serde_json::Value>(merge_patch).map_err(|e| {
            ServiceError::InvalidRequest(format!("malformed merge patch: {}", e))
        })?;

        // SQLite has no row locks; concurrent patches of one video queue here.
        let _guard = self.locks.lock(id, cancel).await?;
        if let Some(err) = cancel.is_fired() {
            return Err(err);
        }

        let patch = merge_patch.to_string();
        let expected = expected_version.to_string();
        let new_version = Uuid::new_v4().to_string();
        let changed = self
            .with_conn({
                let new_version = new_version.clone();
                move |conn| {
                    Ok(conn.execute(
                        "UPDATE videos SET
                            annotation_json = json_patch(COALESCE(annotation_json, ?), ?),
                            annotation_version = ?
                         WHERE id = ? AND annotation_version = ?",
                        params![EMPTY_ANNOTATION, patch, new_version, id, expected],
                    )?)
                }
            })
            .await?;

        if changed == 0 {
            debug!(video = id, "annotation patch lost the version check");
            return Err(ServiceError::Conflict);
        }
        debug!(video = id, version = %new_version, "patched annotation");
        Ok(new_version)
    }
}

fn project_from_row(row: &rusqlite::Row) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        remark: row.get(2)?,
        spec_json: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn video_from_row(row: &rusqlite::Row) -> rusqlite::Result<Video> {
    let frames: String = row.get(3)?;
    let frame_urls = serde_json::from_str(&frames).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Video {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        frame_urls,
        created_at: row.get(4)?,
    })
}

fn select_project(conn: &Connection, id: i64) -> ServiceResult<Project> {
    conn.query_row(
        "SELECT id, name, remark, spec_json, created_at FROM projects WHERE id = ?",
        [id],
        project_from_row,
    )
    .optional()?
    .ok_or(ServiceError::NotFound)
}

fn select_video(conn: &Connection, id: i64) -> ServiceResult<Video> {
    conn.query_row(
        "SELECT id, project_id, name, frame_urls, created_at FROM videos WHERE id = ?",
        [id],
        video_from_row,
    )
    .optional()?
    .ok_or(ServiceError::NotFound)
}
