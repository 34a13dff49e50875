//! Hosted backend-as-a-service over REST.
//!
//! Objects live under `/storage/v1/object/{bucket}/{path}`, tables under
//! `/rest/v1/{table}`.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use url::Url;
use crate::core::{
    MetadataStore,
    NewHistoryEvent,
    NewMediaAsset,
    NewUploadChunk,
    NewUploadSession,
    ObjectStorage,
    PutOptions,
    Result,
    SessionStatus,
    UploadError,
};

pub const UPLOAD_SESSIONS_TABLE: &str = "upload_sessions";
pub const UPLOAD_CHUNKS_TABLE: &str = "upload_chunks";
pub const MEDIA_ASSETS_TABLE: &str = "media_assets";
pub const HISTORY_TABLE: &str = "draft_history";

#[derive(Debug, Clone)]
pub struct RestConfig {
    pub base_url: String,
    pub api_key: String,
    /// User session token, falls back to the api key
    pub access_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RestBackend {
    client: Client,
    base_url: Url,
    headers: HeaderMap,
}

#[derive(Deserialize)]
struct InsertedRow {
    id: serde_json::Value,
}

impl RestBackend {
    pub fn new(config: RestConfig) -> Result<Self> {
        let mut base_url = Url::parse(&config.base_url)
            .map_err(|err| UploadError::internal(format!("Invalid url {:?}: {}", config.base_url, err)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let token = config.access_token.as_deref().unwrap_or(&config.api_key);
        let mut headers = HeaderMap::new();
        headers.insert("apikey", header_value(&config.api_key)?);
        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {token}"))?);

        Ok(Self {
            client: Client::new(),
            base_url,
            headers,
        })
    }

    pub fn object_url(&self, bucket: &str, path: &str) -> Result<Url> {
        self.url_for(["storage", "v1", "object", bucket].into_iter().chain(path.split('/')))
    }

    pub fn table_url(&self, table: &str) -> Result<Url> {
        self.url_for(["rest", "v1", table])
    }

    /// Append `segments` to the base path, percent-encoding each one
    fn url_for<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| UploadError::internal(format!("Base url {} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn insert(&self, table: &str, body: serde_json::Value, prefer: &'static str) -> Result<Response> {
        let mut url = self.table_url(table)?;
        if table == UPLOAD_CHUNKS_TABLE {
            url.query_pairs_mut().append_pair("on_conflict", "session_id,chunk_index");
        }

        let response = self.client
            .post(url)
            .headers(self.headers.clone())
            .header("Prefer", prefer)
            .json(&body)
            .send()
            .await?;

        check_status(response, table).await
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|err| UploadError::internal(format!("Invalid header value: {err}")))
}

async fn check_status(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(UploadError::metadata(format!("{what}: status {status}: {body}")))
}

#[async_trait]
impl ObjectStorage for RestBackend {
    async fn put_object(&self, bucket: &str, path: &str, data: Bytes, options: PutOptions) -> Result<()> {
        let url = self.object_url(bucket, path)?;
        let content_type = options
            .content_type
            .as_deref()
            .unwrap_or("application/octet-stream");
        let size = data.len();

        let response = self.client
            .post(url)
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, header_value(content_type)?)
            .header("x-upsert", if options.overwrite { "true" } else { "false" })
            .body(data)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::storage(format!("{path}: status {status}: {body}")));
        }

        debug!(bucket, path, size, "object stored");
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        self.url_for(["storage", "v1", "object", "public", bucket].into_iter().chain(path.split('/')))
            .map(String::from)
            .unwrap_or_else(|_| format!("{}storage/v1/object/public/{bucket}/{path}", self.base_url))
    }
}

#[async_trait]
impl MetadataStore for RestBackend {
    async fn create_upload_session(&self, session: NewUploadSession) -> Result<String> {
        let body = json!({
            "user_id": session.owner_id,
            "draft_id": session.draft_id,
            "file_name": session.file_name,
            "file_size": session.file_size,
            "mime_type": session.mime_type,
            "chunk_size": session.chunk_size,
            "total_chunks": session.total_chunks,
            "status": SessionStatus::Uploading,
        });
        let response = self.insert(UPLOAD_SESSIONS_TABLE, body, "return=representation").await?;

        let rows: Vec<InsertedRow> = response.json().await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| UploadError::metadata("No row returned for upload session"))?;

        match row.id {
            serde_json::Value::String(id) => Ok(id),
            serde_json::Value::Number(id) => Ok(id.to_string()),
            other => Err(UploadError::metadata(format!("Unexpected session id: {other}"))),
        }
    }

    async fn update_upload_session(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        let mut url = self.table_url(UPLOAD_SESSIONS_TABLE)?;
        url.query_pairs_mut().append_pair("id", &format!("eq.{session_id}"));

        let response = self.client
            .patch(url)
            .headers(self.headers.clone())
            .json(&json!({
                "status": status,
                "updated_at": chrono::Utc::now(),
            }))
            .send()
            .await?;

        check_status(response, UPLOAD_SESSIONS_TABLE).await?;
        Ok(())
    }

    async fn insert_upload_chunk(&self, chunk: NewUploadChunk) -> Result<()> {
        let body = serde_json::to_value(&chunk)?;
        self.insert(UPLOAD_CHUNKS_TABLE, body, "resolution=merge-duplicates").await?;
        Ok(())
    }

    async fn insert_media_asset(&self, asset: NewMediaAsset) -> Result<()> {
        let body = json!({
            "user_id": asset.owner_id,
            "draft_id": asset.draft_id,
            "file_path": asset.path,
            "asset_type": asset.asset_type,
            "file_size": asset.file_size,
            "mime_type": asset.mime_type,
            "original_filename": asset.original_filename,
            "status": asset.status,
        });
        self.insert(MEDIA_ASSETS_TABLE, body, "return=minimal").await?;
        Ok(())
    }

    async fn insert_history_event(&self, event: NewHistoryEvent) -> Result<()> {
        let body = json!({
            "draft_id": event.draft_id,
            "user_id": event.owner_id,
            "event_type": event.event_type,
            "event_data": event.event_data,
        });
        self.insert(HISTORY_TABLE, body, "return=minimal").await?;
        Ok(())
    }
}
