//! Google Drive v3 resumable uploads.

use async_trait::async_trait;
use reqwest::header::{CONTENT_RANGE, LOCATION, RANGE};
use serde::Deserialize;
use serde_json::json;
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::{ChunkProgress, ChunkStep, UploadBackend, UploadSession, UploadedFile};
use crate::error::UploadError;

const FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const RESUME_INCOMPLETE: u16 = 308;

pub struct DriveBackend {
    http: reqwest::Client,
    token: String,
    chunk_size: u64,
}

#[derive(Debug, Deserialize)]
struct CreatedFolder {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompletedUpload {
    id: String,
    name: String,
    size: Option<String>,
    web_content_link: Option<String>,
}

impl DriveBackend {
    pub fn new(token: String, chunk_size: u64) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
            chunk_size,
        }
    }

    async fn read_chunk(&self, session: &UploadSession) -> Result<Vec<u8>, UploadError> {
        let mut file = File::open(&session.path).await?;
        file.seek(SeekFrom::Start(session.offset)).await?;
        let len = self.chunk_size.min(session.total_size.saturating_sub(session.offset));
        let mut buf = Vec::with_capacity(len as usize);
        file.take(len).read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, UploadError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(UploadError::Status { status, body })
}

/// Next offset from a `Range: bytes=0-N` header; absent means nothing stored yet.
fn next_offset(range: Option<&str>) -> Result<u64, UploadError> {
    let Some(range) = range else {
        return Ok(0);
    };
    range
        .rsplit('-')
        .next()
        .and_then(|end| end.parse::<u64>().ok())
        .map(|end| end + 1)
        .ok_or_else(|| UploadError::Decode(format!("bad Range header '{range}'")))
}

#[async_trait]
impl UploadBackend for DriveBackend {
    async fn create_folder(&self, name: &str, parent: Option<&str>) -> Result<String, UploadError> {
        let mut metadata = json!({ "name": name, "mimeType": FOLDER_MIME });
        if let Some(parent) = parent {
            metadata["parents"] = json!([parent]);
        }
        let response = self
            .http
            .post(FILES_URL)
            .query(&[("supportsAllDrives", "true"), ("fields", "id")])
            .bearer_auth(&self.token)
            .json(&metadata)
            .send()
            .await?;
        let folder: CreatedFolder = check(response).await?.json().await?;
        Ok(folder.id)
    }

    async fn open_session(
        &self,
        path: &Path,
        name: &str,
        parent: Option<&str>,
    ) -> Result<UploadSession, UploadError> {
        let total_size = tokio::fs::metadata(path).await?.len();
        let mut metadata = json!({ "name": name });
        if let Some(parent) = parent {
            metadata["parents"] = json!([parent]);
        }
        let response = self
            .http
            .post(UPLOAD_URL)
            .query(&[
                ("uploadType", "resumable"),
                ("supportsAllDrives", "true"),
                ("fields", "id,name,size,webContentLink"),
            ])
            .bearer_auth(&self.token)
            .header("X-Upload-Content-Length", total_size)
            .json(&metadata)
            .send()
            .await?;
        let response = check(response).await?;
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| UploadError::Decode("resumable session without Location".into()))?
            .to_string();

        Ok(UploadSession {
            name: name.to_string(),
            path: path.to_path_buf(),
            location,
            offset: 0,
            total_size,
        })
    }

    async fn next_chunk(&self, session: &mut UploadSession) -> Result<ChunkStep, UploadError> {
        let chunk = self.read_chunk(session).await?;
        let range = if session.total_size == 0 {
            "bytes */0".to_string()
        } else {
            format!(
                "bytes {}-{}/{}",
                session.offset,
                session.offset + chunk.len() as u64 - 1,
                session.total_size
            )
        };
        let response = self
            .http
            .put(&session.location)
            .header(CONTENT_RANGE, range)
            .body(chunk)
            .send()
            .await?;

        if response.status().as_u16() == RESUME_INCOMPLETE {
            let range = response.headers().get(RANGE).and_then(|v| v.to_str().ok());
            session.offset = next_offset(range)?;
            return Ok(ChunkStep::Partial(ChunkProgress {
                resumable_progress: session.offset,
                total_size: session.total_size,
            }));
        }

        let done: CompletedUpload = check(response).await?.json().await?;
        session.offset = session.total_size;
        let size = done
            .size
            .and_then(|s| s.parse().ok())
            .unwrap_or(session.total_size);
        let link = done
            .web_content_link
            .unwrap_or_else(|| format!("https://drive.google.com/file/d/{}/view", done.id));
        Ok(ChunkStep::Done(UploadedFile {
            id: done.id,
            name: done.name,
            size,
            link,
        }))
    }

    fn folder_url(&self, folder_id: &str) -> String {
        format!("https://drive.google.com/drive/folders/{folder_id}")
    }
}
