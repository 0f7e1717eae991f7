#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;

use depot::catalog::{Catalog, ChangePublisher, DbDirectory, DbProject, DbUser};
use depot::server::AppState;
use depot::uploads::{
    Assembler, BlockRequestWriter, BlockTracker, ChunkRequest, DirService, IdRequest, IdService,
    RequestPath, UploadService,
};

pub const TEST_USER: &str = "test";
pub const TEST_APIKEY: &str = "test";
pub const TEST_PROJECT: &str = "test";
pub const TEST_DIR: &str = "test";

pub const OTHER_USER: &str = "other";
pub const OTHER_APIKEY: &str = "other-key";

/// Initialize tracing for tests with proper test output handling
pub fn tracing_init() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_target(false)
        .try_init();
}

/// A fully seeded server environment on a temp directory: one user
/// ("test") owning one project ("test") with its root directory ("test").
pub struct TestEnv {
    pub state: AppState,
    pub catalog: Catalog,
    pub tracker: Arc<BlockTracker>,
    pub paths: RequestPath,
    pub changes: ChangePublisher,
    _tmp: TempDir,
}

impl TestEnv {
    pub async fn new() -> Self {
        let tmp = TempDir::new().expect("Failed to create temp root");
        let mcdir = tmp.path().join("mcdir");
        std::fs::create_dir_all(mcdir.join("upload")).expect("Failed to create mcdir");

        let db_path = tmp.path().join("catalog.db");
        let catalog = Catalog::new(db_path.to_str().unwrap())
            .await
            .expect("Failed to create catalog");

        seed_catalog(&catalog).await;

        let paths = RequestPath::new(mcdir);
        let state = AppState::new(catalog.clone(), paths.clone());

        TestEnv {
            catalog,
            tracker: state.tracker.clone(),
            paths,
            changes: state.changes.clone(),
            state,
            _tmp: tmp,
        }
    }

    pub fn id_service(&self) -> IdService {
        IdService::new(self.catalog.clone(), self.tracker.clone(), self.paths.clone())
    }

    pub fn upload_service(&self) -> UploadService {
        let assembler = Assembler::new(
            self.catalog.clone(),
            self.tracker.clone(),
            self.paths.clone(),
            self.changes.clone(),
        );
        UploadService::new(
            self.catalog.clone(),
            self.tracker.clone(),
            Arc::new(BlockRequestWriter),
            self.paths.clone(),
            assembler,
        )
    }

    pub fn dir_service(&self) -> DirService {
        DirService::new(self.catalog.clone())
    }

    /// A create request against the seeded project and root directory.
    pub fn id_request(&self, filename: &str, size: i64, chunk_size: i64, checksum: &str) -> IdRequest {
        IdRequest {
            user: TEST_USER.to_string(),
            project_id: TEST_PROJECT.to_string(),
            directory_id: TEST_DIR.to_string(),
            filename: filename.to_string(),
            file_size: size,
            file_mtime: Utc::now(),
            chunk_size,
            checksum: checksum.to_string(),
            host: "127.0.0.1".to_string(),
        }
    }

    pub fn chunk_request(
        &self,
        upload_id: &str,
        chunk_number: u64,
        total_chunks: u64,
        total_size: i64,
        chunk_size: i64,
        filename: &str,
        bytes: &[u8],
    ) -> ChunkRequest {
        ChunkRequest {
            upload_id: upload_id.to_string(),
            chunk_number,
            chunk_size,
            total_chunks,
            total_size,
            filename: filename.to_string(),
            project_id: TEST_PROJECT.to_string(),
            directory_id: TEST_DIR.to_string(),
            chunk: bytes.to_vec(),
        }
    }
}

async fn seed_catalog(catalog: &Catalog) {
    catalog
        .insert_user(&DbUser {
            id: TEST_USER.to_string(),
            name: "Test User".to_string(),
            apikey: TEST_APIKEY.to_string(),
            created_at: Utc::now(),
        })
        .await
        .expect("Failed to seed user");

    catalog
        .insert_user(&DbUser {
            id: OTHER_USER.to_string(),
            name: "Other User".to_string(),
            apikey: OTHER_APIKEY.to_string(),
            created_at: Utc::now(),
        })
        .await
        .expect("Failed to seed second user");

    catalog
        .insert_project(&DbProject {
            id: TEST_PROJECT.to_string(),
            name: TEST_PROJECT.to_string(),
            owner: TEST_USER.to_string(),
            created_at: Utc::now(),
        })
        .await
        .expect("Failed to seed project");

    catalog
        .insert_directory(&DbDirectory {
            id: TEST_DIR.to_string(),
            path: TEST_PROJECT.to_string(),
            project_id: TEST_PROJECT.to_string(),
            parent_id: String::new(),
            owner: TEST_USER.to_string(),
            created_at: Utc::now(),
        })
        .await
        .expect("Failed to seed root directory");
}

/// Serve the environment's router on an ephemeral port and return its
/// base URL.
pub async fn spawn_server(state: AppState) -> String {
    let app = depot::server::router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let addr = listener.local_addr().expect("Failed to read listener addr");

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("test server died");
    });

    format!("http://{}", addr)
}
