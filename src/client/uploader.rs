use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::checksum::md5_file;
use crate::client::local_db::{LocalDirectory, LocalFile, LocalProject, ProjectDb};
use crate::client::server_api::{FlowRequest, ServerApi};
use crate::client::walker::{spawn_tree_walk, TreeEntry};
use crate::client::{Backoff, ClientError};
use crate::server::{CreateUploadRequest, DEFAULT_CHUNK_SIZE};
use crate::uploads::id_service::count_blocks;

/// What a finished run did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UploadSummary {
    pub files_uploaded: usize,
    pub files_skipped: usize,
    pub dirs_registered: usize,
}

#[derive(Default)]
struct Counters {
    files_uploaded: AtomicUsize,
    files_skipped: AtomicUsize,
    dirs_registered: AtomicUsize,
}

impl Counters {
    fn summary(&self) -> UploadSummary {
        UploadSummary {
            files_uploaded: self.files_uploaded.load(Ordering::Relaxed),
            files_skipped: self.files_skipped.load(Ordering::Relaxed),
            dirs_registered: self.dirs_registered.load(Ordering::Relaxed),
        }
    }
}

/// Walk the registered project tree and upload whatever is new or
/// changed, with `num_threads` parallel workers. Closing the `done`
/// channel (setting it to true) stops workers after their current entry.
pub async fn upload_project_tree(
    db: ProjectDb,
    api: ServerApi,
    backoff: Backoff,
    num_threads: usize,
    done: watch::Receiver<bool>,
) -> Result<UploadSummary, ClientError> {
    let project = db
        .project()
        .await?
        .ok_or_else(|| ClientError::Database("no project registered".to_string()))?;

    let entries = spawn_tree_walk(PathBuf::from(&project.path));
    let entries = Arc::new(Mutex::new(entries));
    let counters = Arc::new(Counters::default());

    let mut workers = FuturesUnordered::new();
    for _ in 0..num_threads.max(1) {
        let uploader = Uploader {
            db: db.clone(),
            api: api.clone(),
            project: project.clone(),
            backoff: backoff.clone(),
            done: done.clone(),
            counters: counters.clone(),
        };
        let entries = entries.clone();
        workers.push(tokio::spawn(async move {
            uploader.upload_entries(entries).await
        }));
    }

    let mut first_error = None;
    while let Some(joined) = workers.next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(error = %err, "upload worker failed");
                first_error.get_or_insert(err);
            }
            Err(join_err) => {
                error!(error = %join_err, "upload worker panicked");
                first_error.get_or_insert(ClientError::Database(join_err.to_string()));
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(counters.summary()),
    }
}

/// One worker draining the tree-entry channel. Each worker owns its own
/// database handle.
struct Uploader {
    db: ProjectDb,
    api: ServerApi,
    project: LocalProject,
    backoff: Backoff,
    done: watch::Receiver<bool>,
    counters: Arc<Counters>,
}

impl Uploader {
    async fn upload_entries(
        &self,
        entries: Arc<Mutex<mpsc::Receiver<TreeEntry>>>,
    ) -> Result<(), ClientError> {
        loop {
            if *self.done.borrow() {
                return Ok(());
            }
            let entry = { entries.lock().await.recv().await };
            let entry = match entry {
                Some(entry) => entry,
                None => return Ok(()),
            };

            match self.upload_entry(&entry).await {
                Ok(()) => {}
                Err(ClientError::Cancelled) => return Ok(()),
                // A broken tracking database or an exhausted retry budget
                // takes the worker down; anything else is logged and the
                // walk keeps going.
                Err(err @ ClientError::Database(_)) => return Err(err),
                Err(err @ ClientError::RetriesExhausted(_)) => return Err(err),
                Err(err) => {
                    error!(path = %entry.path.display(), error = %err, "skipping entry after error");
                }
            }
        }
    }

    async fn upload_entry(&self, entry: &TreeEntry) -> Result<(), ClientError> {
        if entry.is_dir {
            self.handle_dir_entry(entry).await
        } else {
            self.handle_file_entry(entry).await
        }
    }

    async fn handle_dir_entry(&self, entry: &TreeEntry) -> Result<(), ClientError> {
        let dir_path = self.server_path(&entry.rel_path);
        if self.db.find_directory(&dir_path).await?.is_none() {
            self.register_directory(&dir_path).await?;
        }
        Ok(())
    }

    /// Ask the server for the directory id (creating the path remotely if
    /// needed) and remember it locally.
    async fn register_directory(&self, dir_path: &str) -> Result<LocalDirectory, ClientError> {
        let directory_id = self
            .with_retry("ensure directory", || {
                self.api.get_directory(&self.project.project_id, dir_path)
            })
            .await?;

        let dir = self.db.insert_directory(&directory_id, dir_path).await?;
        self.counters.dirs_registered.fetch_add(1, Ordering::Relaxed);
        Ok(dir)
    }

    async fn handle_file_entry(&self, entry: &TreeEntry) -> Result<(), ClientError> {
        if entry.size == 0 {
            // A zero-size file has no blocks to send and its request
            // could never complete.
            debug!(path = %entry.path.display(), "skipping empty file");
            self.counters.files_skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let parent_rel = match entry.rel_path.rsplit_once('/') {
            Some((parent, _)) => parent.to_string(),
            None => String::new(),
        };
        let dir = self.get_or_register_directory(&parent_rel).await?;

        let name = entry
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| entry.rel_path.clone());
        let known = self.db.find_file(&name, dir.id).await?;

        let needs_upload = match &known {
            None => true,
            Some(file) => entry.mtime > file.last_upload,
        };
        if !needs_upload {
            self.counters.files_skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        self.upload_file(entry, &name, known, &dir).await
    }

    /// Workers process entries in parallel, so a file can arrive here
    /// before the worker holding its parent directory has registered it.
    /// Fall through to the same registration path in that case.
    async fn get_or_register_directory(
        &self,
        parent_rel: &str,
    ) -> Result<LocalDirectory, ClientError> {
        let dir_path = self.server_path(parent_rel);
        match self.db.find_directory(&dir_path).await? {
            Some(dir) => Ok(dir),
            None => self.register_directory(&dir_path).await,
        }
    }

    async fn upload_file(
        &self,
        entry: &TreeEntry,
        name: &str,
        known: Option<LocalFile>,
        dir: &LocalDirectory,
    ) -> Result<(), ClientError> {
        let checksum = md5_file(&entry.path)
            .await
            .map_err(|err| ClientError::Io(std::io::Error::other(err.to_string())))?;

        let create_req = CreateUploadRequest {
            project_id: self.project.project_id.clone(),
            directory_id: dir.directory_id.clone(),
            directory_path: String::new(),
            filename: name.to_string(),
            filesize: entry.size,
            chunk_size: DEFAULT_CHUNK_SIZE,
            filemtime: entry.mtime.to_rfc2822(),
            checksum: checksum.clone(),
        };
        let created = self
            .with_retry("create upload request", || {
                self.api.create_upload_request(&create_req)
            })
            .await?;

        debug!(
            path = %entry.path.display(),
            request = %created.request_id,
            starting_block = created.starting_block,
            "streaming file"
        );

        let file_id = self
            .send_chunks(entry, name, dir, &created.request_id)
            .await?;

        let now = Utc::now();
        match known {
            Some(mut file) => {
                file.file_id = file_id;
                file.checksum = checksum;
                file.size = entry.size;
                file.mtime = entry.mtime;
                file.last_upload = now;
                self.db.update_file(&file).await?;
            }
            None => {
                self.db
                    .insert_file(&LocalFile {
                        id: 0,
                        file_id,
                        name: name.to_string(),
                        directory: dir.id,
                        checksum,
                        size: entry.size,
                        mtime: entry.mtime,
                        last_upload: now,
                    })
                    .await?;
            }
        }

        self.counters.files_uploaded.fetch_add(1, Ordering::Relaxed);
        info!(path = %entry.path.display(), "uploaded");
        Ok(())
    }

    /// Stream the file as chunks numbered from 1 until the server reports
    /// the upload done. Blocks the server already holds are no-ops there.
    async fn send_chunks(
        &self,
        entry: &TreeEntry,
        name: &str,
        dir: &LocalDirectory,
        request_id: &str,
    ) -> Result<String, ClientError> {
        let mut file = tokio::fs::File::open(&entry.path).await?;
        let total_chunks = count_blocks(entry.size, DEFAULT_CHUNK_SIZE);
        let mut chunk_number: u64 = 1;
        let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE as usize];

        loop {
            let n = fill_chunk(&mut file, &mut buf).await?;
            if n == 0 {
                return Err(ClientError::Protocol(format!(
                    "{}: file ended before the server reported the upload done",
                    entry.path.display()
                )));
            }

            let flow_req = FlowRequest {
                chunk_number,
                total_chunks,
                chunk_size: n as i64,
                total_size: entry.size,
                identifier: request_id.to_string(),
                filename: name.to_string(),
                relative_path: entry.rel_path.clone(),
                project_id: self.project.project_id.clone(),
                directory_id: dir.directory_id.clone(),
                chunk: buf[..n].to_vec(),
            };
            let response = self
                .with_retry("send chunk", || self.api.send_flow_data(&flow_req))
                .await?;

            if response.done {
                return Ok(response.file_id);
            }
            chunk_number += 1;
        }
    }

    fn server_path(&self, rel: &str) -> String {
        if rel.is_empty() {
            self.project.name.clone()
        } else {
            format!("{}/{}", self.project.name, rel)
        }
    }

    /// Run an operation, retrying transport failures with randomized
    /// backoff. Unbounded unless a retry cap is configured; cancellation
    /// is honored between attempts.
    async fn with_retry<T, Fut>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Fut,
    ) -> Result<T, ClientError>
    where
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut attempts: u32 = 0;
        loop {
            if *self.done.borrow() {
                return Err(ClientError::Cancelled);
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    attempts += 1;
                    if let Some(cap) = self.backoff.max_retries {
                        if attempts >= cap {
                            return Err(ClientError::RetriesExhausted(format!(
                                "{}: {}",
                                what, err
                            )));
                        }
                    }
                    warn!(what, attempt = attempts, error = %err, "retrying");
                    tokio::time::sleep(self.backoff.delay()).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Fill the buffer from the reader, tolerating short reads. Returns the
/// number of bytes placed in the buffer; less than the buffer length only
/// at end of file.
async fn fill_chunk(
    file: &mut tokio::fs::File,
    buf: &mut [u8],
) -> Result<usize, ClientError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
