//! # Object Stores
//!
//! Byte-oriented key/value stores holding corpus manifests and segments.
//! The segmented context reads through [`ObjectStore::get`]; the corpus
//! writer appends through [`ObjectStore::put`].
//!
//! Keys are `/`-separated relative paths such as `team/segments/00000001.txt`.

use crate::error::{self, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use uuid::Uuid;

/// Remote or local object store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Fetch the bytes stored under `key`. Missing keys are `StorageNotFound`.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Store `bytes` under `key`, replacing any previous value
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
}

/// In-memory store (volatile, but useful for testing)
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    data: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let data = match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut keys: Vec<String> = data.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let data = self
            .data
            .read()
            .map_err(|_| error::storage_failed("memory store lock poisoned"))?;
        data.get(key)
            .cloned()
            .ok_or_else(|| error::storage_not_found(key))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let mut data = self
            .data
            .write()
            .map_err(|_| error::storage_failed("memory store lock poisoned"))?;
        data.insert(key.to_string(), bytes);
        Ok(())
    }
}

/// Directory-backed store (persistent)
#[derive(Debug, Clone)]
pub struct FileObjectStore {
    base_path: PathBuf,
}

impl FileObjectStore {
    pub fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)
            .map_err(|e| error::io_error(format!("Failed to create store dir: {}", e)))?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Map a key to a path below the base directory
    fn key_to_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(error::invalid_argument(format!("invalid store key '{}'", key))
                .with_context("key", key));
        }
        Ok(self.base_path.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FileObjectStore {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.key_to_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(error::storage_not_found(key)),
            Err(e) => Err(error::storage_failed(format!("Failed to read {}: {}", path.display(), e))
                .set_source(e)),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.key_to_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                error::io_error(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        // write-then-rename so readers never observe a torn object; each
        // writer gets its own temp file
        let tmp = temp_path(&path);
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| error::io_error(format!("Failed to write {}: {}", tmp.display(), e)))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(error::io_error(format!("Failed to rename {}: {}", path.display(), e)));
        }
        Ok(())
    }
}

/// Hidden sibling of `path`, unique per call
fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
}

/// HTTP store: `GET`/`PUT {base_url}/{key}`
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| error::storage_failed(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token: None,
        })
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim_start_matches('/'))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) if !token.is_empty() => req.bearer_auth(token),
            _ => req,
        }
    }
}

/// Classify a non-success HTTP status for retry purposes
fn status_error(key: &str, status: StatusCode, body: String) -> crate::error::Error {
    if status == StatusCode::NOT_FOUND {
        return error::storage_not_found(key);
    }
    let err = error::storage_failed(format!("HTTP {} for '{}': {}", status.as_u16(), key, body))
        .with_context("key", key)
        .with_context("status", status.as_u16().to_string());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        err.temporary()
    } else {
        err
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .authorize(self.client.get(self.url(key)))
            .send()
            .await
            .map_err(|e| error::network_failed(format!("GET {}: {}", key, e)).set_source(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(key, status, body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| error::network_failed(format!("GET {} body: {}", key, e)).set_source(e))?;
        Ok(bytes.to_vec())
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let response = self
            .authorize(self.client.put(self.url(key)).body(bytes))
            .send()
            .await
            .map_err(|e| error::network_failed(format!("PUT {}: {}", key, e)).set_source(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(key, status, body));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryObjectStore::new();
        store.put("a/b", b"hello".to_vec()).await.unwrap();
        assert_eq!(store.get("a/b").await.unwrap(), b"hello");

        let err = store.get("missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageNotFound);
        assert_eq!(store.keys(), vec!["a/b".to_string()]);
    }

    #[tokio::test]
    async fn test_file_store_nested_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileObjectStore::new(dir.path()).unwrap();

        store
            .put("corpus/segments/00000000.txt", b"segment".to_vec())
            .await
            .unwrap();
        assert_eq!(
            store.get("corpus/segments/00000000.txt").await.unwrap(),
            b"segment"
        );
        assert!(dir.path().join("corpus/segments/00000000.txt").exists());

        let err = store.get("corpus/manifest.json").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageNotFound);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_file_store_concurrent_puts_to_one_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileObjectStore::new(dir.path()).unwrap();

        let writers: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.put("team/manifest.json", format!("v{}", i).into_bytes()).await })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let stored = String::from_utf8(store.get("team/manifest.json").await.unwrap()).unwrap();
        assert!((0..16).any(|i| stored == format!("v{}", i)), "{}", stored);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("team"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("manifest.json")]);
    }

    #[tokio::test]
    async fn test_file_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileObjectStore::new(dir.path()).unwrap();

        let err = store.get("../etc/passwd").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = store.put("/abs", Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_http_store_get_and_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/c/manifest.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/c/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/c/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let store = HttpObjectStore::new(server.uri(), Duration::from_secs(5)).unwrap();
        assert_eq!(store.get("c/manifest.json").await.unwrap(), b"{}");

        let err = store.get("c/missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageNotFound);
        assert!(!err.is_retryable());

        let err = store.get("c/flaky").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageFailed);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_http_store_put() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/c/segments/00000000.txt"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let store = HttpObjectStore::new(format!("{}/", server.uri()), Duration::from_secs(5)).unwrap();
        store
            .put("c/segments/00000000.txt", b"text".to_vec())
            .await
            .unwrap();
    }
}
