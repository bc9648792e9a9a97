use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::StorageSection;
use crate::errors::UploadError;

pub const MARKDOWN_CONTENT_TYPE: &str = "text/markdown; charset=utf-8";

const STORAGE_API_VERSION: &str = "2023-11-03";

/// One stored document as reported by [`BlobSink::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BlobEntry {
    pub name: String,
    pub size: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Destination for generated documents. `put` overwrites any existing object
/// at `path` and creates the container if it does not exist yet.
#[async_trait]
pub trait BlobSink: Send + Sync {
    async fn put(
        &self,
        container: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), UploadError>;

    /// Documents whose name starts with `prefix`, in name order.
    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<BlobEntry>, UploadError>;

    async fn get(&self, container: &str, path: &str) -> Result<Vec<u8>, UploadError>;
}

/// The storage backend the settings describe, if they describe a usable one.
///
/// A local directory wins over remote blob storage. Remote storage needs both
/// an endpoint (or account name) and a SAS token; with only half of that
/// nothing is configured.
pub fn configured(storage: &StorageSection) -> Option<Arc<dyn BlobSink>> {
    if let Some(root) = &storage.local_dir {
        info!(root = %root.display(), "Using local directory for research documents");
        return Some(Arc::new(LocalDirSink::new(root.clone())));
    }
    let endpoint = storage.blob_endpoint()?;
    match storage.sas_token.as_deref().map(str::trim) {
        Some(token) if !token.is_empty() => {
            info!(endpoint = %endpoint, "Using blob storage for research documents");
            Some(Arc::new(AzureBlobSink::new(endpoint, Some(token.to_string()))))
        }
        _ => {
            warn!(endpoint = %endpoint, "Blob storage has no SAS token; storage disabled");
            None
        }
    }
}

/// Sink for generated documents: the configured backend, otherwise one that
/// discards everything.
pub fn from_settings(storage: &StorageSection) -> Arc<dyn BlobSink> {
    configured(storage).unwrap_or_else(|| {
        info!("No storage configured; research documents will not be persisted");
        Arc::new(DiscardSink)
    })
}

// ── Azure blob storage ────────────────────────────────────────────────

/// Block blob uploads over the storage REST API, authorized with a SAS token.
pub struct AzureBlobSink {
    client: reqwest::Client,
    endpoint: String,
    sas_token: Option<String>,
}

impl AzureBlobSink {
    pub fn new(endpoint: impl Into<String>, sas_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            sas_token: sas_token.map(|t| t.trim_start_matches('?').to_string()),
        }
    }

    fn url(&self, resource: &str, extra_query: Option<&str>) -> String {
        let mut query: Vec<&str> = Vec::new();
        if let Some(extra) = extra_query {
            query.push(extra);
        }
        if let Some(token) = self.sas_token.as_deref() {
            query.push(token);
        }
        if query.is_empty() {
            format!("{}/{}", self.endpoint, resource)
        } else {
            format!("{}/{}?{}", self.endpoint, resource, query.join("&"))
        }
    }

    async fn ensure_container(&self, container: &str) -> Result<(), UploadError> {
        let resp = self
            .client
            .put(self.url(container, Some("restype=container")))
            .header("x-ms-version", STORAGE_API_VERSION)
            .header("Content-Length", "0")
            .send()
            .await
            .map_err(|source| UploadError::Request {
                path: container.to_string(),
                source,
            })?;
        let status = resp.status();
        // 409: container already exists
        if status.is_success() || status == reqwest::StatusCode::CONFLICT {
            return Ok(());
        }
        Err(UploadError::Rejected {
            path: container.to_string(),
            status: status.as_u16(),
            message: resp.text().await.unwrap_or_default(),
        })
    }

    async fn list_page(
        &self,
        container: &str,
        prefix: &str,
        marker: Option<&str>,
    ) -> Result<BlobListPage, UploadError> {
        let mut query = vec![
            ("restype", "container".to_string()),
            ("comp", "list".to_string()),
            ("prefix", prefix.to_string()),
        ];
        if let Some(marker) = marker {
            query.push(("marker", marker.to_string()));
        }
        let request_err = |source| UploadError::Request {
            path: container.to_string(),
            source,
        };

        let resp = self
            .client
            .get(self.url(container, None))
            .query(&query)
            .header("x-ms-version", STORAGE_API_VERSION)
            .send()
            .await
            .map_err(request_err)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(UploadError::Rejected {
                path: container.to_string(),
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        let body = resp.text().await.map_err(request_err)?;
        parse_blob_list(&body).map_err(|message| UploadError::Decode {
            path: container.to_string(),
            message,
        })
    }
}

#[async_trait]
impl BlobSink for AzureBlobSink {
    async fn put(
        &self,
        container: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), UploadError> {
        self.ensure_container(container).await?;

        let blob = format!("{}/{}", container, path);
        let resp = self
            .client
            .put(self.url(&blob, None))
            .header("x-ms-version", STORAGE_API_VERSION)
            .header("x-ms-blob-type", "BlockBlob")
            .header("Content-Type", content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|source| UploadError::Request {
                path: blob.clone(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(UploadError::Rejected {
                path: blob,
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        info!(container = %container, path = %path, "Uploaded document");
        Ok(())
    }

    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<BlobEntry>, UploadError> {
        let mut entries = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let page = self.list_page(container, prefix, marker.as_deref()).await?;
            entries.extend(page.entries);
            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        Ok(entries)
    }

    async fn get(&self, container: &str, path: &str) -> Result<Vec<u8>, UploadError> {
        let blob = format!("{}/{}", container, path);
        let request_err = |source| UploadError::Request {
            path: blob.clone(),
            source,
        };
        let resp = self
            .client
            .get(self.url(&blob, None))
            .header("x-ms-version", STORAGE_API_VERSION)
            .send()
            .await
            .map_err(request_err)?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(UploadError::NotFound { path: blob.clone() });
        }
        if !status.is_success() {
            return Err(UploadError::Rejected {
                path: blob.clone(),
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(resp.bytes().await.map_err(request_err)?.to_vec())
    }
}

/// One page of a List Blobs response.
#[derive(Debug, Default)]
struct BlobListPage {
    entries: Vec<BlobEntry>,
    next_marker: Option<String>,
}

/// Pull names, sizes and modification times out of a List Blobs XML body.
fn parse_blob_list(xml: &str) -> Result<BlobListPage, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut page = BlobListPage::default();
    let mut elements: Vec<String> = Vec::new();
    let mut current: Option<BlobEntry> = None;

    loop {
        match reader.read_event().map_err(|e| e.to_string())? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if name == "Blob" {
                    current = Some(BlobEntry::default());
                }
                elements.push(name);
            }
            Event::End(_) => {
                if elements.pop().as_deref() == Some("Blob")
                    && let Some(entry) = current.take()
                {
                    page.entries.push(entry);
                }
            }
            Event::Text(text) => {
                let text = text.unescape().map_err(|e| e.to_string())?.into_owned();
                match (elements.last().map(String::as_str), current.as_mut()) {
                    (Some("Name"), Some(entry)) => entry.name = text,
                    (Some("Content-Length"), Some(entry)) => entry.size = text.parse().ok(),
                    (Some("Last-Modified"), Some(entry)) => {
                        entry.last_modified = DateTime::parse_from_rfc2822(&text)
                            .ok()
                            .map(|at| at.with_timezone(&Utc));
                    }
                    (Some("NextMarker"), None) if !text.is_empty() => {
                        page.next_marker = Some(text);
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(page)
}

// ── Local directory ───────────────────────────────────────────────────

/// Stores documents as files under `<root>/<container>/<path>`.
pub struct LocalDirSink {
    root: PathBuf,
}

impl LocalDirSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn target(&self, container: &str, path: &str) -> Result<PathBuf, UploadError> {
        let relative = Path::new(container).join(path);
        // Keep reads and writes inside the root
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(UploadError::Io {
                path: relative,
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "path must be relative and must not contain '..'",
                ),
            });
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobSink for LocalDirSink {
    async fn put(
        &self,
        container: &str,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), UploadError> {
        let target = self.target(container, path)?;
        let io_err = |source| UploadError::Io {
            path: target.clone(),
            source,
        };
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::write(&target, bytes).await.map_err(io_err)?;
        info!(path = %target.display(), "Wrote document");
        Ok(())
    }

    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<BlobEntry>, UploadError> {
        let dir = self.target(container, "")?;
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || list_files(&dir, &prefix))
            .await
            .map_err(|e| UploadError::Io {
                path: PathBuf::from(container),
                source: std::io::Error::other(e),
            })
    }

    async fn get(&self, container: &str, path: &str) -> Result<Vec<u8>, UploadError> {
        let target = self.target(container, path)?;
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(UploadError::NotFound {
                path: format!("{}/{}", container, path),
            }),
            Err(source) => Err(UploadError::Io {
                path: target,
                source,
            }),
        }
    }
}

/// Files under `dir` whose `/`-joined relative name starts with `prefix`.
/// A missing directory lists as empty.
fn list_files(dir: &Path, prefix: &str) -> Vec<BlobEntry> {
    let mut entries = Vec::new();
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if !name.starts_with(prefix) {
            continue;
        }
        let metadata = entry.metadata().ok();
        entries.push(BlobEntry {
            name,
            size: metadata.as_ref().map(|m| m.len()),
            last_modified: metadata
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from),
        });
    }
    entries
}

// ── Discard ───────────────────────────────────────────────────────────

/// Used when no storage is configured. Accepts writes and keeps nothing.
pub struct DiscardSink;

#[async_trait]
impl BlobSink for DiscardSink {
    async fn put(
        &self,
        container: &str,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), UploadError> {
        debug!(container = %container, path = %path, bytes = bytes.len(), "Storage not configured, skipping upload");
        Ok(())
    }

    async fn list(&self, _container: &str, _prefix: &str) -> Result<Vec<BlobEntry>, UploadError> {
        Ok(Vec::new())
    }

    async fn get(&self, container: &str, path: &str) -> Result<Vec<u8>, UploadError> {
        Err(UploadError::NotFound {
            path: format!("{}/{}", container, path),
        })
    }
}
