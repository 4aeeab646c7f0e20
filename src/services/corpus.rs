use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use reqwest::Client;
use serde::Deserialize;

use crate::models::photo::{CorpusEntry, PhotoHandle};

const DRIVE_FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";

/// The external photo repository searched by every job.
#[async_trait]
pub trait PhotoCorpusSource: Send + Sync {
    /// Lazily list every candidate photo, session by session, in a stable
    /// order. Each call starts a fresh listing.
    fn enumerate(&self) -> BoxStream<'_, Result<CorpusEntry, RetrievalError>>;

    /// Download the raw bytes of one photo.
    async fn fetch(&self, photo: &PhotoHandle) -> Result<Vec<u8>, RetrievalError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Photo unavailable: {0}")]
    Unavailable(String),
}

/// Google Drive folders, one folder per session.
pub struct DriveCorpus {
    http: Client,
    access_token: String,
    folder_ids: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct DriveFile {
    id: String,
    name: String,
}

impl DriveCorpus {
    pub fn new(access_token: String, folder_ids: Vec<String>) -> Self {
        Self {
            http: Client::new(),
            access_token,
            folder_ids,
        }
    }

    async fn list_page(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<FileList, RetrievalError> {
        let q = format!(
            "'{folder_id}' in parents and trashed = false and mimeType contains 'image/'"
        );
        let mut request = self
            .http
            .get(DRIVE_FILES_URL)
            .bearer_auth(&self.access_token)
            .query(&[
                ("q", q.as_str()),
                ("pageSize", "1000"),
                ("orderBy", "name"),
                ("fields", "nextPageToken,files(id,name)"),
            ]);
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }

        let page = request
            .send()
            .await?
            .error_for_status()?
            .json::<FileList>()
            .await?;
        Ok(page)
    }

    fn folder<'a>(
        &'a self,
        folder_id: &'a str,
    ) -> impl Stream<Item = Result<CorpusEntry, RetrievalError>> + Send + 'a {
        // `None` state means the folder has been fully listed.
        stream::try_unfold(Some(None::<String>), move |cursor| async move {
            let Some(page_token) = cursor else {
                return Ok::<_, RetrievalError>(None);
            };
            let page = self.list_page(folder_id, page_token.as_deref()).await?;
            let next = page.next_page_token.map(Some);
            let entries = page
                .files
                .into_iter()
                .map(|file| Ok(drive_entry(folder_id, file)))
                .collect::<Vec<_>>();
            Ok(Some((stream::iter(entries), next)))
        })
        .try_flatten()
    }
}

fn drive_entry(folder_id: &str, file: DriveFile) -> CorpusEntry {
    CorpusEntry {
        session_id: folder_id.to_string(),
        photo: PhotoHandle {
            retrieval_ref: format!("{DRIVE_FILES_URL}/{}?alt=media", file.id),
            view_url: Some(format!(
                "https://drive.google.com/uc?export=view&id={}",
                file.id
            )),
            external_id: file.id,
            display_name: file.name,
        },
    }
}

#[async_trait]
impl PhotoCorpusSource for DriveCorpus {
    fn enumerate(&self) -> BoxStream<'_, Result<CorpusEntry, RetrievalError>> {
        stream::iter(self.folder_ids.iter())
            .flat_map(move |folder_id| self.folder(folder_id))
            .boxed()
    }

    async fn fetch(&self, photo: &PhotoHandle) -> Result<Vec<u8>, RetrievalError> {
        let bytes = self
            .http
            .get(&photo.retrieval_ref)
            .bearer_auth(&self.access_token)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }
}
