//! External data fetchers
//!
//! A [`Fetch`] implementation performs the one externally visible step
//! of a [`Source`](crate::node::Source): retrieve raw data or fail.
//! Built-ins: chunked local-file read, include (file read + recursive
//! document parse), and HTTP GET.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::debug;
use url::Url;

use crate::error::EngineError;
use crate::loader;
use crate::value::{Map, Value};

/// Retrieval contract for fetchable sources.
#[async_trait]
pub trait Fetch: fmt::Debug + Send + Sync {
    /// Fetch and return raw data. Failures surface as
    /// [`EngineError::Fetch`]; a non-success outcome is never an empty
    /// success.
    async fn fetch(&self) -> Result<Value, EngineError>;
}

fn fetch_err(locator: impl fmt::Display, message: impl Into<String>) -> EngineError {
    EngineError::Fetch {
        locator: locator.to_string(),
        message: message.into(),
    }
}

const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Reads a local file as text, chunk by chunk, yielding to the
/// scheduler between chunks.
#[derive(Debug, Clone)]
pub struct FileFetcher {
    path: PathBuf,
    chunk_size: usize,
}

impl FileFetcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    async fn read_text(&self) -> Result<String, EngineError> {
        let display = self.path.display();
        let mut file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|err| fetch_err(&display, err.to_string()))?;
        let mut buffer = Vec::new();
        let mut chunk = vec![0u8; self.chunk_size];
        loop {
            let n = file
                .read(&mut chunk)
                .await
                .map_err(|err| fetch_err(&display, err.to_string()))?;
            if n == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..n]);
            tokio::task::yield_now().await;
        }
        String::from_utf8(buffer).map_err(|_| fetch_err(&display, "file is not valid UTF-8"))
    }
}

#[async_trait]
impl Fetch for FileFetcher {
    async fn fetch(&self) -> Result<Value, EngineError> {
        debug!(path = %self.path.display(), "reading file source");
        Ok(Value::Str(self.read_text().await?))
    }
}

/// Reads another declarative document and parses it through the loader.
/// Do not use it to load untrusted documents.
#[derive(Debug, Clone)]
pub struct IncludeFetcher {
    file: FileFetcher,
}

impl IncludeFetcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: FileFetcher::new(path),
        }
    }
}

#[async_trait]
impl Fetch for IncludeFetcher {
    async fn fetch(&self) -> Result<Value, EngineError> {
        let text = self.file.read_text().await?;
        let mut documents = loader::load_documents(&text)
            .map_err(|err| fetch_err(self.file.path.display(), err.to_string()))?;
        Ok(if documents.len() == 1 {
            documents.remove(0)
        } else {
            Value::Seq(documents)
        })
    }
}

/// Fetches a URL with an HTTP GET. Success yields a mapping of
/// `status`, `headers` and `data`; a non-success status is a fetch
/// failure.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    url: Url,
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(url: &str) -> Result<Self, EngineError> {
        Ok(Self {
            url: Url::parse(url).map_err(|err| EngineError::Load(format!("invalid url '{url}': {err}")))?,
            client: reqwest::Client::new(),
        })
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self) -> Result<Value, EngineError> {
        debug!(url = %self.url, "fetching http source");
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|err| fetch_err(&self.url, err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(fetch_err(&self.url, format!("http status {status}")));
        }
        let headers: Map = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    Value::Str(String::from_utf8_lossy(value.as_bytes()).into_owned()),
                )
            })
            .collect();
        let data = response
            .text()
            .await
            .map_err(|err| fetch_err(&self.url, err.to_string()))?;

        let mut result = Map::new();
        result.insert("status".into(), Value::Int(i64::from(status.as_u16())));
        result.insert("headers".into(), Value::Map(headers));
        result.insert("data".into(), Value::Str(data));
        Ok(Value::Map(result))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn file_fetcher_reads_across_chunks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let content = "line one\nline two\n".repeat(64);
        file.write_all(content.as_bytes()).unwrap();

        let fetcher = FileFetcher::new(file.path()).with_chunk_size(32);
        let value = fetcher.fetch().await.unwrap();
        assert_eq!(value, Value::Str(content));
    }

    #[tokio::test]
    async fn file_fetcher_missing_file_fails() {
        let fetcher = FileFetcher::new("/nonexistent/datapick-test");
        let err = fetcher.fetch().await.unwrap_err();
        assert!(matches!(err, EngineError::Fetch { .. }));
    }

    #[tokio::test]
    async fn include_fetcher_parses_documents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"name: emma\nshadow: !property 0.name\n")
            .unwrap();

        let fetcher = IncludeFetcher::new(file.path());
        let value = fetcher.fetch().await.unwrap();
        let Value::Map(map) = value else {
            panic!("expected mapping")
        };
        assert_eq!(map["name"], Value::Str("emma".into()));
        assert!(matches!(map["shadow"], Value::Node(_)));
    }

    #[tokio::test]
    async fn include_fetcher_multiple_documents_become_sequence() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"a: 1\n---\nb: 2\n").unwrap();

        let fetcher = IncludeFetcher::new(file.path());
        let value = fetcher.fetch().await.unwrap();
        assert!(matches!(value, Value::Seq(ref docs) if docs.len() == 2));
    }

    #[test]
    fn http_fetcher_rejects_invalid_url() {
        assert!(matches!(
            HttpFetcher::new("not a url"),
            Err(EngineError::Load(_))
        ));
    }
}
