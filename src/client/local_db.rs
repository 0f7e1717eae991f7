use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::client::ClientError;

/// The project a tracking database belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalProject {
    pub project_id: String,
    pub name: String,
    pub path: String,
}

/// A directory known to the server, keyed locally by its slashed path.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalDirectory {
    pub id: i64,
    pub directory_id: String,
    pub path: String,
}

/// A file we have uploaded before. `last_upload` decides whether a
/// changed file needs another round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalFile {
    pub id: i64,
    pub file_id: String,
    pub name: String,
    pub directory: i64,
    pub checksum: String,
    pub size: i64,
    pub mtime: DateTime<Utc>,
    pub last_upload: DateTime<Utc>,
}

/// Per-project upload tracking database.
///
/// Lives next to the tree being uploaded. Clones share the pool, so each
/// worker holds its own handle.
#[derive(Debug, Clone)]
pub struct ProjectDb {
    pool: SqlitePool,
}

impl ProjectDb {
    pub async fn new(database_path: &str) -> Result<Self, ClientError> {
        let database_url = format!("sqlite://{}?mode=rwc", database_path);
        let pool = SqlitePool::connect(&database_url).await?;

        let db = ProjectDb { pool };
        db.create_tables().await?;
        Ok(db)
    }

    async fn create_tables(&self) -> Result<(), ClientError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS project (
                project_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                path TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS directories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                directory_id TEXT NOT NULL,
                path TEXT NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_id TEXT NOT NULL DEFAULT '',
                name TEXT NOT NULL,
                directory INTEGER NOT NULL,
                checksum TEXT NOT NULL DEFAULT '',
                size INTEGER NOT NULL DEFAULT 0,
                mtime TEXT NOT NULL,
                last_upload TEXT NOT NULL,
                UNIQUE (name, directory),
                FOREIGN KEY (directory) REFERENCES directories (id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn set_project(&self, project: &LocalProject) -> Result<(), ClientError> {
        sqlx::query(
            r#"
            INSERT INTO project (project_id, name, path) VALUES (?, ?, ?)
            ON CONFLICT (project_id) DO UPDATE SET name = excluded.name, path = excluded.path
            "#,
        )
        .bind(&project.project_id)
        .bind(&project.name)
        .bind(&project.path)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn project(&self) -> Result<Option<LocalProject>, ClientError> {
        let row = sqlx::query("SELECT * FROM project LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| LocalProject {
            project_id: row.get("project_id"),
            name: row.get("name"),
            path: row.get("path"),
        }))
    }

    pub async fn find_directory(&self, path: &str) -> Result<Option<LocalDirectory>, ClientError> {
        let row = sqlx::query("SELECT * FROM directories WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row_to_directory(&row)))
    }

    pub async fn insert_directory(
        &self,
        directory_id: &str,
        path: &str,
    ) -> Result<LocalDirectory, ClientError> {
        sqlx::query(
            "INSERT OR IGNORE INTO directories (directory_id, path) VALUES (?, ?)",
        )
        .bind(directory_id)
        .bind(path)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM directories WHERE path = ?")
            .bind(path)
            .fetch_one(&self.pool)
            .await?;
        Ok(row_to_directory(&row))
    }

    pub async fn find_file(
        &self,
        name: &str,
        directory: i64,
    ) -> Result<Option<LocalFile>, ClientError> {
        let row = sqlx::query("SELECT * FROM files WHERE name = ? AND directory = ?")
            .bind(name)
            .bind(directory)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row_to_file(&row)))
    }

    pub async fn insert_file(&self, file: &LocalFile) -> Result<(), ClientError> {
        sqlx::query(
            r#"
            INSERT INTO files (file_id, name, directory, checksum, size, mtime, last_upload)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&file.file_id)
        .bind(&file.name)
        .bind(file.directory)
        .bind(&file.checksum)
        .bind(file.size)
        .bind(file.mtime.to_rfc3339())
        .bind(file.last_upload.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn update_file(&self, file: &LocalFile) -> Result<(), ClientError> {
        sqlx::query(
            r#"
            UPDATE files
            SET file_id = ?, checksum = ?, size = ?, mtime = ?, last_upload = ?
            WHERE id = ?
            "#,
        )
        .bind(&file.file_id)
        .bind(&file.checksum)
        .bind(file.size)
        .bind(file.mtime.to_rfc3339())
        .bind(file.last_upload.to_rfc3339())
        .bind(file.id)
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

fn row_to_directory(row: &SqliteRow) -> LocalDirectory {
    LocalDirectory {
        id: row.get("id"),
        directory_id: row.get("directory_id"),
        path: row.get("path"),
    }
}

fn row_to_file(row: &SqliteRow) -> LocalFile {
    LocalFile {
        id: row.get("id"),
        file_id: row.get("file_id"),
        name: row.get("name"),
        directory: row.get("directory"),
        checksum: row.get("checksum"),
        size: row.get("size"),
        mtime: parse_time(row, "mtime"),
        last_upload: parse_time(row, "last_upload"),
    }
}
