use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::de::DeserializeOwned;

use crate::client::ClientError;
use crate::config::ClientConfig;
use crate::server::{
    CreateUploadRequest, CreateUploadResponse, DirectoryRequest, DirectoryResponse,
    UploadChunkResponse, UploadEntry,
};

/// One chunk as sent over the wire.
#[derive(Debug, Clone)]
pub struct FlowRequest {
    pub chunk_number: u64,
    pub total_chunks: u64,
    pub chunk_size: i64,
    pub total_size: i64,
    pub identifier: String,
    pub filename: String,
    pub relative_path: String,
    pub project_id: String,
    pub directory_id: String,
    pub chunk: Vec<u8>,
}

/// HTTP client for the upload service.
#[derive(Debug, Clone)]
pub struct ServerApi {
    client: Client,
    base_url: String,
    apikey: String,
}

impl ServerApi {
    pub fn new(config: &ClientConfig) -> Self {
        ServerApi {
            client: Client::new(),
            base_url: config.mcurl.trim_end_matches('/').to_string(),
            apikey: config.apikey.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Ask the server for an upload id and the block to start at.
    pub async fn create_upload_request(
        &self,
        req: &CreateUploadRequest,
    ) -> Result<CreateUploadResponse, ClientError> {
        let response = self
            .client
            .post(self.url("/upload"))
            .header("apikey", &self.apikey)
            .json(req)
            .send()
            .await?;
        json_or_error(response).await
    }

    /// Send one chunk as a multipart form.
    pub async fn send_flow_data(
        &self,
        req: &FlowRequest,
    ) -> Result<UploadChunkResponse, ClientError> {
        let form = Form::new()
            .text("flowChunkNumber", req.chunk_number.to_string())
            .text("flowTotalChunks", req.total_chunks.to_string())
            .text("flowChunkSize", req.chunk_size.to_string())
            .text("flowTotalSize", req.total_size.to_string())
            .text("flowIdentifier", req.identifier.clone())
            .text("flowFilename", req.filename.clone())
            .text("flowRelativePath", req.relative_path.clone())
            .text("projectID", req.project_id.clone())
            .text("directoryID", req.directory_id.clone())
            .part(
                "file",
                Part::bytes(req.chunk.clone()).file_name(req.filename.clone()),
            );

        let response = self
            .client
            .post(self.url("/upload/chunk"))
            .header("apikey", &self.apikey)
            .multipart(form)
            .send()
            .await?;
        json_or_error(response).await
    }

    /// Look up (or create) a directory path in a project and return its id.
    pub async fn get_directory(
        &self,
        project_id: &str,
        path: &str,
    ) -> Result<String, ClientError> {
        let response = self
            .client
            .post(self.url("/directory"))
            .header("apikey", &self.apikey)
            .json(&DirectoryRequest {
                project_id: project_id.to_string(),
                path: path.to_string(),
            })
            .send()
            .await?;
        let dir: DirectoryResponse = json_or_error(response).await?;
        Ok(dir.directory_id)
    }

    pub async fn list_upload_requests(
        &self,
        project_id: &str,
    ) -> Result<Vec<UploadEntry>, ClientError> {
        let response = self
            .client
            .get(self.url(&format!("/upload/{}", project_id)))
            .header("apikey", &self.apikey)
            .send()
            .await?;
        json_or_error(response).await
    }

    pub async fn delete_upload_request(&self, request_id: &str) -> Result<(), ClientError> {
        let response = self
            .client
            .delete(self.url(&format!("/upload/{}", request_id)))
            .header("apikey", &self.apikey)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error(response).await)
        }
    }
}

async fn json_or_error<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    if response.status().is_success() {
        Ok(response.json().await?)
    } else {
        Err(status_error(response).await)
    }
}

async fn status_error(response: reqwest::Response) -> ClientError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    ClientError::Server { status, message }
}
