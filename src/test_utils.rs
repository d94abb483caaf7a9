use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize test logging once across all tests, even when several test
/// binaries run in parallel.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .finish();

        // Another test harness may have installed one already.
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// A migrated database in a temp file, removed on drop.
pub struct TestDb {
    pub pool: Pool<SqliteConnectionManager>,
    _file: tempfile::NamedTempFile,
}

impl TestDb {
    pub fn new() -> Self {
        let file = tempfile::NamedTempFile::new()
            .expect("Failed to create temporary database file");
        let path = file
            .path()
            .to_str()
            .expect("Failed to get temp file path")
            .to_string();
        let pool = crate::create_db_pool(&path).expect("Failed to create pool");
        {
            let mut conn = pool.get().expect("Failed to get connection");
            crate::init_db(&mut conn).expect("Failed to initialize database");
        }
        Self { pool, _file: file }
    }
}

impl Default for TestDb {
    fn default() -> Self {
        Self::new()
    }
}
