use std::path::Path;
use std::sync::Arc;

use futures_util::TryStreamExt;
use reqwest::{Body, Client, StatusCode, multipart};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::io::ReaderStream;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://app.folderfort.com";

/// Remote folder identifier as issued by the API.
pub type FolderId = u64;

/// Invoked with the byte length of each upload body chunk as it goes out.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("api response carried no folder id")]
    MissingFolderId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    Quota,
    Conflict,
    Network,
}

#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl DriveClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DriveError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DriveError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// Lists folders, either the account root (`parent` = `None`) or the
    /// children of a specific folder.
    pub async fn list_folders(
        &self,
        parent: Option<FolderId>,
    ) -> Result<Vec<FolderEntry>, DriveError> {
        let mut url = self.endpoint("/api/v1/drive/file-entries")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("type", "folder");
            if let Some(parent) = parent {
                query.append_pair("parentIds", &parent.to_string());
            }
        }
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let payload: FolderListResponse = Self::handle_response(response).await?;
        Ok(payload.into_entries())
    }

    pub async fn create_folder(
        &self,
        name: &str,
        parent: Option<FolderId>,
    ) -> Result<FolderId, DriveError> {
        let name = padded_folder_name(name);
        let url = self.endpoint("/api/v1/folders")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&CreateFolderRequest {
                name: &name,
                entry_type: "folder",
                parent_id: parent,
            })
            .send()
            .await?;
        let created: CreatedFolderResponse = Self::handle_response(response).await?;
        created.folder_id().ok_or(DriveError::MissingFolderId)
    }

    /// Uploads one file into `folder_id` as a streamed multipart request.
    /// `progress` is called with the length of every file chunk written to
    /// the request body, before the server has acknowledged it.
    pub async fn upload_file(
        &self,
        folder_id: FolderId,
        source: &Path,
        progress: ProgressFn,
    ) -> Result<(), DriveError> {
        let url = self.endpoint("/api/v1/uploads")?;
        let file = tokio::fs::File::open(source).await?;
        let size = file.metadata().await?.len();
        let file_name = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let mime = mime_guess::from_path(source).first_or_octet_stream();

        let counted = ReaderStream::new(file).inspect_ok(move |chunk| progress(chunk.len() as u64));
        let part = multipart::Part::stream_with_length(Body::wrap_stream(counted), size)
            .file_name(file_name)
            .mime_str(mime.essence_str())?;
        let form = multipart::Form::new()
            .text("parentId", folder_id.to_string())
            .part("file", part);

        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .multipart(form)
            .send()
            .await?;
        // The API acknowledges a stored upload with 201 and nothing else.
        if response.status() != StatusCode::CREATED {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DriveError::Api { status, body });
        }
        Ok(())
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, DriveError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DriveError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DriveError::Api { status, body })
        }
    }
}

impl DriveError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DriveError::Api { status, .. } => Some(classify_api_status(*status)),
            DriveError::Request(_) => Some(ApiErrorClass::Network),
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if matches!(
        status,
        StatusCode::PAYMENT_REQUIRED | StatusCode::PAYLOAD_TOO_LARGE | StatusCode::INSUFFICIENT_STORAGE
    ) {
        ApiErrorClass::Quota
    } else if status == StatusCode::CONFLICT {
        ApiErrorClass::Conflict
    } else {
        ApiErrorClass::Network
    }
}

/// The API rejects folder names shorter than 3 characters; pad with
/// underscores the way the official uploader does.
pub fn padded_folder_name(name: &str) -> String {
    let mut padded = name.to_string();
    while padded.chars().count() < 3 {
        padded.push('_');
    }
    padded
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FolderEntry {
    pub id: FolderId,
    pub name: String,
    #[serde(default, alias = "parentId")]
    pub parent_id: Option<FolderId>,
}

// Some deployments wrap listings in `{"data": [...]}`, others return the
// bare array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FolderListResponse {
    Wrapped { data: Vec<FolderEntry> },
    Bare(Vec<FolderEntry>),
}

impl FolderListResponse {
    fn into_entries(self) -> Vec<FolderEntry> {
        match self {
            FolderListResponse::Wrapped { data } => data,
            FolderListResponse::Bare(entries) => entries,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateFolderRequest<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    entry_type: &'a str,
    #[serde(rename = "parentId", skip_serializing_if = "Option::is_none")]
    parent_id: Option<FolderId>,
}

// Folder creation answers either `{"id": ..}` or `{"folder": {"id": ..}}`.
#[derive(Debug, Deserialize)]
struct CreatedFolderResponse {
    #[serde(default)]
    id: Option<FolderId>,
    #[serde(default)]
    folder: Option<FolderRef>,
}

#[derive(Debug, Deserialize)]
struct FolderRef {
    id: FolderId,
}

impl CreatedFolderResponse {
    fn folder_id(&self) -> Option<FolderId> {
        self.id.or_else(|| self.folder.as_ref().map(|f| f.id))
    }
}
