//! Scan pipeline orchestration: term matching, 8-K detection, and the
//! poll/rescan traversal over the aggregator inbox.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use regwatch_core::{FeedItem, MatchResult, EIGHT_K_TERM};
use regwatch_feeds::{
    classify_item, FeverConfig, FeverProvider, ItemProvider, Notifier, WebhookNotifier,
};
use regwatch_store::{ContentFetcher, DocumentFetcher, FetchConfig, TermStore};
use tracing::{info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "regwatch-scan";

/// Seed terms used when no persisted term file exists yet.
pub const DEFAULT_SEARCH_TERMS: &[&str] = &["Deep Sea Mining"];

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub fever_endpoint: String,
    pub fever_api_key: String,
    pub webhook_url: String,
    pub terms_path: PathBuf,
    pub refresh_interval: Duration,
    pub http_timeout: Duration,
    pub user_agent: String,
}

impl ScanConfig {
    pub fn from_env() -> Self {
        Self {
            fever_endpoint: std::env::var("REGWATCH_FEVER_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:8080/api/fever.php".to_string()),
            fever_api_key: std::env::var("REGWATCH_FEVER_API_KEY").unwrap_or_default(),
            webhook_url: std::env::var("REGWATCH_WEBHOOK_URL").unwrap_or_default(),
            terms_path: std::env::var("REGWATCH_TERMS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/search_terms.json")),
            refresh_interval: Duration::from_secs(
                std::env::var("REGWATCH_REFRESH_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
            ),
            http_timeout: Duration::from_secs(
                std::env::var("REGWATCH_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(20),
            ),
            user_agent: std::env::var("REGWATCH_USER_AGENT")
                .unwrap_or_else(|_| "regwatch/0.1".to_string()),
        }
    }
}

/// Return the subset of `terms` contained case-insensitively in `text`,
/// preserving the input term order. Empty text never matches.
pub fn match_terms(text: &str, terms: &[String]) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let haystack = text.to_lowercase();
    terms
        .iter()
        .filter(|term| !term.is_empty() && haystack.contains(&term.to_lowercase()))
        .cloned()
        .collect()
}

/// Structured context extracted from an 8-K filing title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EightKFiling {
    pub company: String,
    pub context: String,
}

/// Recognize filings whose title carries the "8-K" marker.
///
/// When the stricter "form 8-k" pattern is present, the issuer name is the
/// text before it, stripped of surrounding whitespace and a trailing dash.
/// A bare "8-K" marker falls back to the whole title for both fields; issuer
/// extraction from free-text titles is heuristic and the permissive fallback
/// is deliberate.
pub fn detect_8k(title: &str) -> Option<EightKFiling> {
    let lower = title.to_ascii_lowercase();
    if let Some(pos) = lower.find("form 8-k") {
        let company = title[..pos]
            .trim()
            .trim_end_matches(['-', '\u{2013}', '\u{2014}'])
            .trim_end()
            .to_string();
        Some(EightKFiling {
            company,
            context: title.to_string(),
        })
    } else if lower.contains("8-k") {
        Some(EightKFiling {
            company: title.to_string(),
            context: title.to_string(),
        })
    } else {
        None
    }
}

/// Single-owner in-memory cache over the durable [`TermStore`].
///
/// Mutations write through to the store and refresh the cache; scans read an
/// immutable snapshot so a mid-run add never exposes a partially-updated
/// list.
pub struct TermList {
    store: TermStore,
    cached: RwLock<Vec<String>>,
}

impl TermList {
    /// Load persisted terms, seeding from `defaults` when the store is empty.
    /// Defaults are not persisted until the first mutation.
    pub async fn open(store: TermStore, defaults: &[&str]) -> Self {
        let persisted = store.load().await;
        let terms = if persisted.is_empty() {
            defaults.iter().map(ToString::to_string).collect()
        } else {
            persisted
        };
        Self {
            store,
            cached: RwLock::new(terms),
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.cached.read().expect("term cache not poisoned").clone()
    }

    /// Returns false for blanks and duplicates; true once the term is
    /// durably persisted.
    pub async fn add(&self, term: &str) -> bool {
        let term = term.trim();
        if term.is_empty() || self.snapshot().iter().any(|t| t == term) {
            return false;
        }
        match self.store.add(term).await {
            Ok(terms) => {
                *self.cached.write().expect("term cache not poisoned") = terms;
                info!(term, "added search term");
                true
            }
            Err(err) => {
                warn!(term, error = %err, "failed to persist term add");
                false
            }
        }
    }

    /// Returns false for blanks and absent terms; true once the removal is
    /// durably persisted.
    pub async fn remove(&self, term: &str) -> bool {
        let term = term.trim();
        if term.is_empty() || !self.snapshot().iter().any(|t| t == term) {
            return false;
        }
        match self.store.remove(term).await {
            Ok(terms) => {
                *self.cached.write().expect("term cache not poisoned") = terms;
                info!(term, "removed search term");
                true
            }
            Err(err) => {
                warn!(term, error = %err, "failed to persist term removal");
                false
            }
        }
    }
}

/// Orchestrates one traversal over the item batch: classify, fetch/extract
/// text, match terms, detect 8-K filings, and (for poll runs only) notify and
/// mark items read.
pub struct Scanner {
    provider: Arc<dyn ItemProvider>,
    fetcher: Arc<dyn ContentFetcher>,
    notifier: Arc<dyn Notifier>,
    terms: TermList,
}

impl Scanner {
    pub fn new(
        provider: Arc<dyn ItemProvider>,
        fetcher: Arc<dyn ContentFetcher>,
        notifier: Arc<dyn Notifier>,
        terms: TermList,
    ) -> Self {
        Self {
            provider,
            fetcher,
            notifier,
            terms,
        }
    }

    /// Run one pipeline pass. `full_history = true` audits the complete item
    /// collection with every side effect suppressed; `false` processes only
    /// the unread subset, sending notifications and acknowledging each item.
    pub async fn run(&self, full_history: bool) -> Vec<MatchResult> {
        let run_id = Uuid::new_v4();
        let span = info_span!("scan_run", %run_id, full_history);
        let _guard = span.enter();

        let batch = if full_history {
            self.provider.all_items().await
        } else {
            self.provider.unread_items().await
        };
        let batch = match batch {
            Ok(batch) => batch,
            Err(err) => {
                warn!(error = %err, "failed to fetch item batch");
                return Vec::new();
            }
        };
        if batch.is_empty() {
            return Vec::new();
        }

        let terms = self.terms.snapshot();
        let mut results = Vec::new();

        for raw in &batch {
            let item = match classify_item(raw) {
                Ok(Some(item)) => item,
                Ok(None) => continue,
                Err(err) => {
                    warn!(item_id = %raw.id, error = %err, "skipping unclassifiable item");
                    continue;
                }
            };

            match item {
                FeedItem::FederalRegister { id, document_url } => {
                    let text = self.fetcher.fetch_normalized(run_id, &document_url).await;
                    if text.is_empty() {
                        // unread state intentionally left alone: next poll retries
                        continue;
                    }
                    let found = match_terms(&text, &terms);
                    if !found.is_empty() {
                        info!(item_id = %id, url = %document_url, terms = %found.join(", "), "terms found in Federal Register document");
                        if !full_history {
                            self.notify_terms(&found, &document_url, &id).await;
                        }
                        results.push(MatchResult::for_terms(&id, &document_url, found));
                    }
                    if !full_history {
                        self.mark_read(&id).await;
                    }
                }
                FeedItem::SecFiling { id, url, title } => {
                    if let Some(filing) = detect_8k(&title) {
                        info!(item_id = %id, company = %filing.company, "8-K filing detected");
                        if !full_history {
                            if let Err(err) = self
                                .notifier
                                .send_8k(&filing.company, &filing.context, &url, Some(&id))
                                .await
                            {
                                warn!(item_id = %id, error = %err, "8-K notification delivery failed");
                            }
                        }
                        results.push(MatchResult::for_8k(&id, &url, filing.company, filing.context));
                    }

                    // the sentinel term is owned by the detector above
                    let generic: Vec<String> = terms
                        .iter()
                        .filter(|t| !t.eq_ignore_ascii_case(EIGHT_K_TERM))
                        .cloned()
                        .collect();
                    let found = match_terms(&title, &generic);
                    if !found.is_empty() {
                        info!(item_id = %id, url = %url, terms = %found.join(", "), "terms found in SEC filing title");
                        if !full_history {
                            self.notify_terms(&found, &url, &id).await;
                        }
                        results.push(MatchResult::for_terms(&id, &url, found));
                    }
                    if !full_history {
                        self.mark_read(&id).await;
                    }
                }
            }
        }

        results
    }

    async fn notify_terms(&self, terms: &[String], url: &str, item_id: &str) {
        if let Err(err) = self.notifier.send(terms, url, Some(item_id)).await {
            warn!(item_id, error = %err, "notification delivery failed");
        }
    }

    async fn mark_read(&self, item_id: &str) {
        if let Err(err) = self.provider.mark_as_read(item_id).await {
            warn!(item_id, error = %err, "failed to mark item read");
        }
    }

    // Command surface consumed by the interactive front end.

    pub fn list_terms(&self) -> Vec<String> {
        self.terms.snapshot()
    }

    pub async fn add_term(&self, term: &str) -> bool {
        self.terms.add(term).await
    }

    pub async fn remove_term(&self, term: &str) -> bool {
        self.terms.remove(term).await
    }

    /// Side-effect-free audit over the full historical item set.
    pub async fn rescan(&self) -> Vec<MatchResult> {
        self.run(true).await
    }
}

pub async fn scanner_from_config(config: &ScanConfig) -> anyhow::Result<Scanner> {
    let provider = FeverProvider::new(FeverConfig {
        endpoint: config.fever_endpoint.clone(),
        api_key: config.fever_api_key.clone(),
        timeout: config.http_timeout,
        user_agent: Some(config.user_agent.clone()),
    })?;
    let fetcher = DocumentFetcher::new(FetchConfig {
        timeout: config.http_timeout,
        user_agent: Some(config.user_agent.clone()),
    })?;
    let notifier = WebhookNotifier::new(config.webhook_url.clone(), config.http_timeout)?;
    let terms = TermList::open(TermStore::new(config.terms_path.clone()), DEFAULT_SEARCH_TERMS).await;
    Ok(Scanner::new(
        Arc::new(provider),
        Arc::new(fetcher),
        Arc::new(notifier),
        terms,
    ))
}

pub async fn scanner_from_env() -> anyhow::Result<Scanner> {
    scanner_from_config(&ScanConfig::from_env()).await
}

/// Long-lived background poll: one side-effecting unread pass per interval.
pub async fn run_poll_loop(scanner: Arc<Scanner>, interval: Duration) {
    info!(
        terms = %scanner.list_terms().join(", "),
        interval_secs = interval.as_secs(),
        "starting feed monitoring"
    );
    loop {
        let found = scanner.run(false).await;
        if !found.is_empty() {
            info!(count = found.len(), "processing complete; matching articles found");
        }
        tokio::time::sleep(interval).await;
    }
}
