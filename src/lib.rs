use crate::annotation::AnnotationStore;
use crate::blob_store::{BlobStore, LocalBlobStore};
use crate::broker::Broker;
use crate::cache::ResultCache;
use crate::decoder::{decoder_uuid, DecoderArtifact};
use crate::embedding::EmbedService;
use crate::worker::pool::WorkerPool;
use crate::worker::{WorkerClient, WorkerEndpoint, WorkerSlot};
use anyhow::Result;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use rusqlite_migration::{Migrations, M};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

pub mod annotation;
pub mod app;
pub mod blob_store;
pub mod broker;
pub mod cache;
pub mod cancel;
pub mod decoder;
pub mod embedding;
pub mod error;
pub mod worker;

pub mod test_utils;

pub const DEFAULT_LOCK_CAPACITY: usize = 1024;

pub struct AppState {
    pub annotations: AnnotationStore,
    pub public_store: Arc<dyn BlobStore>,
    // None when online segmentation is disabled.
    pub embed_service: Option<Arc<EmbedService>>,
    pub request_timeout: Duration,
    pub shutdown_token: CancellationToken,
    // Keep temp files and dirs alive for as long as a test state lives.
    #[allow(dead_code)]
    temp_db_path: Option<tempfile::NamedTempFile>,
    #[allow(dead_code)]
    temp_dirs: Vec<tempfile::TempDir>,
}

pub struct AppConfig {
    pub db_pool: Pool<SqliteConnectionManager>,
    pub public_store: Arc<dyn BlobStore>,
    pub embed_service: Option<Arc<EmbedService>>,
    pub request_timeout: Duration,
    pub lock_capacity: usize,
    pub shutdown_token: CancellationToken,
}

pub fn create_app_state(config: AppConfig) -> Arc<AppState> {
    Arc::new(AppState {
        annotations: AnnotationStore::new(
            config.db_pool,
            config.lock_capacity,
        ),
        public_store: config.public_store,
        embed_service: config.embed_service,
        request_timeout: config.request_timeout,
        shutdown_token: config.shutdown_token,
        temp_db_path: None,
        temp_dirs: Vec::new(),
    })
}

impl AppState {
    /// A state backed by a temp database and temp public dir, with online
    /// segmentation disabled.
    pub fn new_for_testing() -> Self {
        let temp_db_file = tempfile::NamedTempFile::new()
            .expect("Failed to create temporary database file");
        let db_path = temp_db_file
            .path()
            .to_str()
            .expect("Failed to get temp file path")
            .to_string();
        let pool = create_db_pool(&db_path).expect("Failed to create pool");
        {
            let mut conn = pool.get().expect("Failed to get connection");
            init_db(&mut conn).expect("Failed to initialize database");
        }

        let public_dir =
            tempfile::tempdir().expect("Failed to create public dir");
        let public_store: Arc<dyn BlobStore> =
            Arc::new(LocalBlobStore::new(public_dir.path(), "/public/"));

        Self {
            annotations: AnnotationStore::new(pool, DEFAULT_LOCK_CAPACITY),
            public_store,
            embed_service: None,
            request_timeout: Duration::from_secs(10),
            shutdown_token: CancellationToken::new(),
            temp_db_path: Some(temp_db_file),
            temp_dirs: vec![public_dir],
        }
    }

    /// Like [`AppState::new_for_testing`], with online segmentation served by
    /// `workers` slots that all talk through `client`. Must be called inside a
    /// tokio runtime.
    pub fn new_for_testing_with_worker(
        client: Arc<dyn WorkerClient>,
        workers: usize,
    ) -> Self {
        let mut state = Self::new_for_testing();

        let decoder_dir =
            tempfile::tempdir().expect("Failed to create decoder dir");
        let decoder_path = decoder_dir.path().join("decoder.onnx");
        let decoder_bytes = b"test-decoder";
        std::fs::write(&decoder_path, decoder_bytes)
            .expect("Failed to write decoder");
        let decoder = Arc::new(DecoderArtifact {
            encoder_type: "vit_b".to_string(),
            uuid: decoder_uuid("vit_b", decoder_bytes),
            path: decoder_path,
            feed_js: "// feed".to_string(),
        });
        let data_dir = tempfile::tempdir().expect("Failed to create data dir");

        let slots = (0..workers)
            .map(|i| {
                WorkerSlot::new(
                    i,
                    "cpu",
                    WorkerEndpoint::new(20000 + i as u16),
                    client.clone(),
                )
            })
            .collect();
        let (broker, _handle) = Broker::start(
            Arc::new(WorkerPool::new(slots)),
            state.shutdown_token.clone(),
        );

        state.embed_service = Some(Arc::new(EmbedService::new(
            broker,
            ResultCache::new(state.public_store.clone()),
            decoder,
            Some(data_dir.path().to_path_buf()),
        )));
        state.temp_dirs.push(decoder_dir);
        state.temp_dirs.push(data_dir);
        state
    }

    /// Data dir of the embed service, if one is configured.
    pub fn data_dir(&self) -> Option<PathBuf> {
        self.embed_service
            .as_ref()
            .and_then(|s| s.data_dir().map(|p| p.to_path_buf()))
    }
}

/// Connections enforce foreign keys and wait on a busy database instead of
/// failing right away.
pub fn create_db_pool(path: &str) -> Result<Pool<SqliteConnectionManager>> {
    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")
    });
    Ok(Pool::new(manager)?)
}

fn migration_steps() -> Vec<M<'static>> {
    vec![M::up(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            remark TEXT NOT NULL DEFAULT '',
            spec_json TEXT,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS videos (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id INTEGER NOT NULL
                REFERENCES projects(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            frame_urls TEXT NOT NULL DEFAULT '[]',
            annotation_json TEXT,              -- NULL until the first patch
            annotation_version TEXT NOT NULL,  -- replaced on every patch
            created_at INTEGER NOT NULL,
            UNIQUE(project_id, name)
        );
        "#,
    )]
}

// Database initialization
#[instrument(skip(conn))]
pub fn init_db(conn: &mut Connection) -> Result<()> {
    info!("Initializing annotation database");
    conn.pragma_update(None, "journal_mode", "WAL")?;

    let migrations = Migrations::new(migration_steps());
    migrations.to_latest(conn)?;

    Ok(())
}

#[cfg(test)]
mod migration_tests {
    use super::{init_db, migration_steps};
    use anyhow::Result;
    use rusqlite::Connection;
    use rusqlite_migration::Migrations;

    #[test]
    fn migrations_are_valid() {
        assert!(Migrations::new(migration_steps()).validate().is_ok());
    }

    #[test]
    fn init_db_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut conn = Connection::open(dir.path().join("db.sqlite"))?;
        init_db(&mut conn)?;
        init_db(&mut conn)?;

        let tables: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type = 'table' AND name IN ('projects', 'videos')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(tables, 2);
        Ok(())
    }
}
