use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::catalog::models::*;
use crate::error::Result;

/// Catalog database handle.
///
/// Wraps a sqlite pool; clones share the pool, so services can hold their
/// own copy without coordination.
#[derive(Debug, Clone)]
pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    /// Open the catalog database, creating it and its tables if needed.
    pub async fn new(database_path: &str) -> Result<Self> {
        // Use sqlite:// with ?mode=rwc to create if it doesn't exist
        let database_url = format!("sqlite://{}?mode=rwc", database_path);
        info!("Connecting to {}", database_url);
        let pool = SqlitePool::connect(&database_url).await?;

        let catalog = Catalog { pool };
        catalog.create_tables().await?;
        Ok(catalog)
    }

    async fn create_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                apikey TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                owner TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Access beyond the owner is granted through membership rows.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS project_members (
                project_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                PRIMARY KEY (project_id, user_id),
                FOREIGN KEY (project_id) REFERENCES projects (id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS directories (
                id TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                project_id TEXT NOT NULL,
                parent_id TEXT NOT NULL DEFAULT '',
                owner TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (path, project_id),
                FOREIGN KEY (project_id) REFERENCES projects (id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                owner TEXT NOT NULL,
                size INTEGER NOT NULL DEFAULT 0,
                checksum TEXT NOT NULL DEFAULT '',
                mtime TEXT NOT NULL,
                directory_id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                current BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TEXT NOT NULL,
                FOREIGN KEY (directory_id) REFERENCES directories (id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS uploads (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                project_id TEXT NOT NULL,
                directory_id TEXT NOT NULL,
                filename TEXT NOT NULL,
                size INTEGER NOT NULL,
                mtime TEXT NOT NULL,
                checksum TEXT NOT NULL,
                chunk_size INTEGER NOT NULL,
                host TEXT NOT NULL DEFAULT '',
                num_blocks INTEGER NOT NULL,
                blocks BLOB NOT NULL,
                is_existing BOOLEAN NOT NULL DEFAULT FALSE,
                server_restarted BOOLEAN NOT NULL DEFAULT FALSE,
                birthtime TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_directories_project_id ON directories (project_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_files_directory_id ON files (directory_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_uploads_project_id ON uploads (project_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ---- users ----

    pub async fn insert_user(&self, user: &DbUser) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, name, apikey, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&user.id)
        .bind(&user.name)
        .bind(&user.apikey)
        .bind(user.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn user_by_apikey(&self, apikey: &str) -> Result<Option<DbUser>> {
        let row = sqlx::query("SELECT * FROM users WHERE apikey = ?")
            .bind(apikey)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row_to_user(&row)))
    }

    /// All users, used by the API-key cache refresher.
    pub async fn list_users(&self) -> Result<Vec<DbUser>> {
        let rows = sqlx::query("SELECT * FROM users")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(row_to_user).collect())
    }

    // ---- projects ----

    pub async fn insert_project(&self, project: &DbProject) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO projects (id, name, owner, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&project.id)
        .bind(&project.name)
        .bind(&project.owner)
        .bind(project.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn project_by_id(&self, id: &str) -> Result<Option<DbProject>> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| DbProject {
            id: row.get("id"),
            name: row.get("name"),
            owner: row.get("owner"),
            created_at: parse_time(&row, "created_at"),
        }))
    }

    pub async fn add_project_member(&self, project_id: &str, user_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO project_members (project_id, user_id) VALUES (?, ?)",
        )
        .bind(project_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// True when the user owns the project or is a member of it.
    pub async fn user_has_access(&self, project_id: &str, user_id: &str) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT 1 FROM projects p
            LEFT JOIN project_members m
                ON m.project_id = p.id AND m.user_id = ?
            WHERE p.id = ? AND (p.owner = ? OR m.user_id IS NOT NULL)
            "#,
        )
        .bind(user_id)
        .bind(project_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    // ---- directories ----

    pub async fn insert_directory(&self, dir: &DbDirectory) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO directories (id, path, project_id, parent_id, owner, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&dir.id)
        .bind(&dir.path)
        .bind(&dir.project_id)
        .bind(&dir.parent_id)
        .bind(&dir.owner)
        .bind(dir.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn directory_by_path(
        &self,
        path: &str,
        project_id: &str,
    ) -> Result<Option<DbDirectory>> {
        let row = sqlx::query("SELECT * FROM directories WHERE path = ? AND project_id = ?")
            .bind(path)
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row_to_directory(&row)))
    }

    pub async fn directory_by_id(&self, id: &str) -> Result<Option<DbDirectory>> {
        let row = sqlx::query("SELECT * FROM directories WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row_to_directory(&row)))
    }

    // ---- files ----

    pub async fn insert_file(&self, file: &DbFile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO files (
                id, name, owner, size, checksum, mtime,
                directory_id, project_id, current, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&file.id)
        .bind(&file.name)
        .bind(&file.owner)
        .bind(file.size)
        .bind(&file.checksum)
        .bind(file.mtime.to_rfc3339())
        .bind(&file.directory_id)
        .bind(&file.project_id)
        .bind(file.current)
        .bind(file.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn file_by_id(&self, id: &str) -> Result<Option<DbFile>> {
        let row = sqlx::query("SELECT * FROM files WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row_to_file(&row)))
    }

    /// The current file with this (name, checksum) in a directory, if any.
    /// This is the dedup lookup used at create time and at commit time.
    pub async fn current_file_in_directory(
        &self,
        directory_id: &str,
        name: &str,
        checksum: &str,
    ) -> Result<Option<DbFile>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM files
            WHERE directory_id = ? AND name = ? AND checksum = ? AND current = TRUE
            "#,
        )
        .bind(directory_id)
        .bind(name)
        .bind(checksum)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| row_to_file(&row)))
    }

    /// Commit a file: record its final checksum, size and mtime and flip
    /// it to current.
    pub async fn commit_file(
        &self,
        id: &str,
        checksum: &str,
        size: i64,
        mtime: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE files SET checksum = ?, size = ?, mtime = ?, current = TRUE WHERE id = ?",
        )
        .bind(checksum)
        .bind(size)
        .bind(mtime.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete_file(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ---- uploads ----

    pub async fn insert_upload(&self, upload: &DbUpload) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO uploads (
                id, owner, project_id, directory_id, filename, size, mtime,
                checksum, chunk_size, host, num_blocks, blocks,
                is_existing, server_restarted, birthtime
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&upload.id)
        .bind(&upload.owner)
        .bind(&upload.project_id)
        .bind(&upload.directory_id)
        .bind(&upload.filename)
        .bind(upload.size)
        .bind(upload.mtime.to_rfc3339())
        .bind(&upload.checksum)
        .bind(upload.chunk_size)
        .bind(&upload.host)
        .bind(upload.num_blocks)
        .bind(&upload.blocks)
        .bind(upload.is_existing)
        .bind(upload.server_restarted)
        .bind(upload.birthtime.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn upload_by_id(&self, id: &str) -> Result<Option<DbUpload>> {
        let row = sqlx::query("SELECT * FROM uploads WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row_to_upload(&row)))
    }

    /// Look up an upload by its natural key. A second create with the same
    /// tuple resumes this request instead of making a new one.
    pub async fn upload_by_natural_key(
        &self,
        project_id: &str,
        directory_id: &str,
        filename: &str,
        size: i64,
        checksum: &str,
    ) -> Result<Option<DbUpload>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM uploads
            WHERE project_id = ? AND directory_id = ? AND filename = ?
              AND size = ? AND checksum = ?
            "#,
        )
        .bind(project_id)
        .bind(directory_id)
        .bind(filename)
        .bind(size)
        .bind(checksum)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| row_to_upload(&row)))
    }

    pub async fn uploads_for_project(&self, project_id: &str) -> Result<Vec<DbUpload>> {
        let rows = sqlx::query("SELECT * FROM uploads WHERE project_id = ? ORDER BY birthtime")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(row_to_upload).collect())
    }

    pub async fn update_upload_blocks(&self, id: &str, blocks: &[u8]) -> Result<()> {
        sqlx::query("UPDATE uploads SET blocks = ? WHERE id = ?")
            .bind(blocks)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn mark_upload_restarted(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE uploads SET server_restarted = TRUE WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn delete_upload(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM uploads WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

fn parse_time(row: &SqliteRow, column: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&row.get::<String, _>(column))
        .unwrap()
        .with_timezone(&Utc)
}

fn row_to_user(row: &SqliteRow) -> DbUser {
    DbUser {
        id: row.get("id"),
        name: row.get("name"),
        apikey: row.get("apikey"),
        created_at: parse_time(row, "created_at"),
    }
}

fn row_to_directory(row: &SqliteRow) -> DbDirectory {
    DbDirectory {
        id: row.get("id"),
        path: row.get("path"),
        project_id: row.get("project_id"),
        parent_id: row.get("parent_id"),
        owner: row.get("owner"),
        created_at: parse_time(row, "created_at"),
    }
}

fn row_to_file(row: &SqliteRow) -> DbFile {
    DbFile {
        id: row.get("id"),
        name: row.get("name"),
        owner: row.get("owner"),
        size: row.get("size"),
        checksum: row.get("checksum"),
        mtime: parse_time(row, "mtime"),
        directory_id: row.get("directory_id"),
        project_id: row.get("project_id"),
        current: row.get("current"),
        created_at: parse_time(row, "created_at"),
    }
}

fn row_to_upload(row: &SqliteRow) -> DbUpload {
    DbUpload {
        id: row.get("id"),
        owner: row.get("owner"),
        project_id: row.get("project_id"),
        directory_id: row.get("directory_id"),
        filename: row.get("filename"),
        size: row.get("size"),
        mtime: parse_time(row, "mtime"),
        checksum: row.get("checksum"),
        chunk_size: row.get("chunk_size"),
        host: row.get("host"),
        num_blocks: row.get("num_blocks"),
        blocks: row.get("blocks"),
        is_existing: row.get("is_existing"),
        server_restarted: row.get("server_restarted"),
        birthtime: parse_time(row, "birthtime"),
    }
}
