//! Durable term storage + document fetch utilities for regwatch.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::{Reader, Writer};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "regwatch-store";

/// Durable mapping of tracked search terms, persisted as a sorted,
/// de-duplicated JSON array of strings.
///
/// All operations serialize through one mutex so a background poll task and an
/// interactive command handler never interleave a read-modify-write. Every
/// mutation rewrites the full file via atomic temp-file rename before
/// returning.
#[derive(Debug)]
pub struct TermStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TermStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted term sequence. Missing or malformed storage is
    /// treated as "no persisted terms": a diagnostic is logged and an empty
    /// sequence returned, never an error.
    pub async fn load(&self) -> Vec<String> {
        let _guard = self.lock.lock().await;
        self.load_unlocked().await
    }

    /// Insert `term` if absent (exact string equality), persist, and return
    /// the resulting sorted sequence. Blank and whitespace-only terms are
    /// rejected here: no write, current sequence returned.
    pub async fn add(&self, term: &str) -> anyhow::Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        let mut terms = self.load_unlocked().await;
        let term = term.trim();
        if term.is_empty() || terms.iter().any(|t| t == term) {
            return Ok(terms);
        }
        terms.push(term.to_string());
        self.persist(&mut terms).await?;
        Ok(terms)
    }

    /// Remove `term` by exact string equality, persist, and return the
    /// resulting sequence. Removing an absent term is a no-op that still
    /// returns the current sequence.
    pub async fn remove(&self, term: &str) -> anyhow::Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        let mut terms = self.load_unlocked().await;
        let before = terms.len();
        terms.retain(|t| t != term);
        if terms.len() == before {
            return Ok(terms);
        }
        self.persist(&mut terms).await?;
        Ok(terms)
    }

    async fn load_unlocked(&self) -> Vec<String> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to read term store");
                return Vec::new();
            }
        };
        match serde_json::from_str::<Vec<String>>(&text) {
            Ok(terms) => terms,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "malformed term store; treating as empty");
                Vec::new()
            }
        }
    }

    async fn persist(&self, terms: &mut Vec<String>) -> anyhow::Result<()> {
        terms.sort();
        terms.dedup();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating term store directory {}", parent.display()))?;
        }

        let bytes = serde_json::to_vec_pretty(terms).context("serializing term list")?;
        let temp_name = format!(".{}.tmp", Uuid::new_v4());
        let temp_path = match self.path.parent() {
            Some(parent) => parent.join(temp_name),
            None => PathBuf::from(temp_name),
        };

        fs::write(&temp_path, &bytes)
            .await
            .with_context(|| format!("writing temp term file {}", temp_path.display()))?;
        match fs::rename(&temp_path, &self.path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp term file {} -> {}",
                        temp_path.display(),
                        self.path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed xml: {0}")]
    Xml(String),
}

/// Seam for retrieving the matchable text of a document-bearing item, so the
/// scan pipeline can run against test doubles.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Retrieve and normalize the document at `url`. Any failure yields an
    /// empty string; never an error.
    async fn fetch_normalized(&self, run_id: Uuid, url: &str) -> String;
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// HTTP fetcher that round-trips the response body through an XML parser so
/// later substring matching is not thrown off by encoding or escaping quirks.
#[derive(Debug)]
pub struct DocumentFetcher {
    client: reqwest::Client,
}

impl DocumentFetcher {
    pub fn new(config: FetchConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    async fn try_fetch(&self, url: &str) -> Result<String, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        let body = resp.bytes().await?;
        normalize_xml(&body)
    }
}

#[async_trait]
impl ContentFetcher for DocumentFetcher {
    async fn fetch_normalized(&self, run_id: Uuid, url: &str) -> String {
        let span = info_span!("document_fetch", %run_id, url);
        let _guard = span.enter();
        match self.try_fetch(url).await {
            Ok(text) => text,
            Err(err) => {
                warn!(url, error = %err, "failed to fetch and normalize document");
                String::new()
            }
        }
    }
}

/// Parse `bytes` as XML and re-serialize the event stream to a canonical
/// string. Rejects malformed documents instead of matching against garbage.
pub fn normalize_xml(bytes: &[u8]) -> Result<String, FetchError> {
    let mut reader = Reader::from_reader(bytes);
    let mut writer = Writer::new(Vec::new());
    let mut buf = Vec::new();
    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| FetchError::Xml(e.to_string()))?;
        if matches!(event, Event::Eof) {
            break;
        }
        writer
            .write_event(event)
            .map_err(|e| FetchError::Xml(e.to_string()))?;
        buf.clear();
    }
    String::from_utf8(writer.into_inner()).map_err(|e| FetchError::Xml(e.to_string()))
}
