//! Pipeline traversal tests backed by stub provider/fetcher/notifier
//! implementations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use regwatch_core::{MatchResult, RawItem};
use regwatch_feeds::{ItemProvider, Notifier, ProviderError};
use regwatch_scan::{Scanner, TermList};
use regwatch_store::{ContentFetcher, TermStore};
use tempfile::tempdir;
use uuid::Uuid;

struct StubProvider {
    items: Vec<RawItem>,
    allow_marks: bool,
    marked: Mutex<Vec<String>>,
}

impl StubProvider {
    fn new(items: Vec<RawItem>, allow_marks: bool) -> Arc<Self> {
        Arc::new(Self {
            items,
            allow_marks,
            marked: Mutex::new(Vec::new()),
        })
    }

    fn marked(&self) -> Vec<String> {
        self.marked.lock().unwrap().clone()
    }
}

#[async_trait]
impl ItemProvider for StubProvider {
    async fn unread_items(&self) -> Result<Vec<RawItem>, ProviderError> {
        Ok(self.items.clone())
    }

    async fn all_items(&self) -> Result<Vec<RawItem>, ProviderError> {
        Ok(self.items.clone())
    }

    async fn mark_as_read(&self, item_id: &str) -> Result<bool, ProviderError> {
        assert!(
            self.allow_marks,
            "mark_as_read must not be called during a rescan"
        );
        self.marked.lock().unwrap().push(item_id.to_string());
        Ok(true)
    }
}

struct FailingProvider;

#[async_trait]
impl ItemProvider for FailingProvider {
    async fn unread_items(&self) -> Result<Vec<RawItem>, ProviderError> {
        Err(ProviderError::InvalidItemId("boom".to_string()))
    }

    async fn all_items(&self) -> Result<Vec<RawItem>, ProviderError> {
        Err(ProviderError::InvalidItemId("boom".to_string()))
    }

    async fn mark_as_read(&self, _item_id: &str) -> Result<bool, ProviderError> {
        panic!("mark_as_read must not be reached when the batch fails");
    }
}

struct StubNotifier {
    allow_sends: bool,
    sent: Mutex<Vec<String>>,
}

impl StubNotifier {
    fn new(allow_sends: bool) -> Arc<Self> {
        Arc::new(Self {
            allow_sends,
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for StubNotifier {
    async fn send(&self, terms: &[String], url: &str, item_id: Option<&str>) -> anyhow::Result<()> {
        assert!(self.allow_sends, "send must not be called during a rescan");
        self.sent.lock().unwrap().push(format!(
            "terms:{}@{url}#{}",
            terms.join(","),
            item_id.unwrap_or("-")
        ));
        Ok(())
    }

    async fn send_8k(
        &self,
        company: &str,
        _context: &str,
        url: &str,
        item_id: Option<&str>,
    ) -> anyhow::Result<()> {
        assert!(self.allow_sends, "send_8k must not be called during a rescan");
        self.sent
            .lock()
            .unwrap()
            .push(format!("8k:{company}@{url}#{}", item_id.unwrap_or("-")));
        Ok(())
    }
}

struct StubFetcher {
    documents: HashMap<String, String>,
}

#[async_trait]
impl ContentFetcher for StubFetcher {
    async fn fetch_normalized(&self, _run_id: Uuid, url: &str) -> String {
        self.documents.get(url).cloned().unwrap_or_default()
    }
}

fn federal_item(id: &str, document_url: &str) -> RawItem {
    RawItem {
        id: id.to_string(),
        feed_id: 2,
        title: None,
        url: None,
        html: Some(format!(r#"Summary<br> <a href="{document_url}">XML</a>"#)),
        published: None,
    }
}

fn sec_item(id: &str, url: &str, title: &str) -> RawItem {
    RawItem {
        id: id.to_string(),
        feed_id: 3,
        title: Some(title.to_string()),
        url: Some(url.to_string()),
        html: None,
        published: None,
    }
}

async fn scanner_with(
    provider: Arc<StubProvider>,
    notifier: Arc<StubNotifier>,
    documents: &[(&str, &str)],
    seed_terms: &[&str],
    dir: &tempfile::TempDir,
) -> Scanner {
    let fetcher = StubFetcher {
        documents: documents
            .iter()
            .map(|(url, text)| (url.to_string(), text.to_string()))
            .collect(),
    };
    let terms = TermList::open(TermStore::new(dir.path().join("terms.json")), seed_terms).await;
    Scanner::new(provider, Arc::new(fetcher), notifier, terms)
}

#[tokio::test]
async fn rescan_over_mixed_batch_is_side_effect_free() {
    let dir = tempdir().expect("tempdir");
    let provider = StubProvider::new(
        vec![
            federal_item("a", "http://x/a.xml"),
            sec_item("b", "http://x/b", "Beta update"),
        ],
        false,
    );
    let notifier = StubNotifier::new(false);
    let scanner = scanner_with(
        provider.clone(),
        notifier.clone(),
        &[("http://x/a.xml", "alpha beta content")],
        &["alpha", "beta"],
        &dir,
    )
    .await;

    let results = scanner.rescan().await;

    assert_eq!(
        results,
        vec![
            MatchResult::for_terms(
                "a",
                "http://x/a.xml",
                vec!["alpha".to_string(), "beta".to_string()]
            ),
            MatchResult::for_terms("b", "http://x/b", vec!["beta".to_string()]),
        ]
    );
    assert!(provider.marked().is_empty());
    assert!(notifier.sent().is_empty());
}

#[tokio::test]
async fn sec_item_can_produce_detector_and_term_results() {
    let dir = tempdir().expect("tempdir");
    let provider = StubProvider::new(
        vec![sec_item("b", "http://x/b", "Acme Form 8-K: also mentions alpha")],
        false,
    );
    let notifier = StubNotifier::new(false);
    let scanner = scanner_with(provider, notifier, &[], &["alpha"], &dir).await;

    let results = scanner.rescan().await;

    assert_eq!(results.len(), 2);
    assert_eq!(
        results[0],
        MatchResult::for_8k(
            "b",
            "http://x/b",
            "Acme",
            "Acme Form 8-K: also mentions alpha"
        )
    );
    assert_eq!(
        results[1],
        MatchResult::for_terms("b", "http://x/b", vec!["alpha".to_string()])
    );
}

#[tokio::test]
async fn tracked_eight_k_term_is_left_to_the_detector() {
    let dir = tempdir().expect("tempdir");
    let provider = StubProvider::new(
        vec![sec_item("b", "http://x/b", "Acme Form 8-K alpha")],
        false,
    );
    let notifier = StubNotifier::new(false);
    let scanner = scanner_with(provider, notifier, &[], &["8-K", "alpha"], &dir).await;

    let results = scanner.rescan().await;

    assert_eq!(results.len(), 2);
    // the generic pass never re-reports the detector-owned term
    assert_eq!(results[1].terms, vec!["alpha".to_string()]);
}

#[tokio::test]
async fn poll_run_notifies_and_marks_read() {
    let dir = tempdir().expect("tempdir");
    let provider = StubProvider::new(
        vec![
            federal_item("a", "http://x/a.xml"),
            sec_item("b", "http://x/b", "Beta update"),
            federal_item("c", "http://x/missing.xml"),
            sec_item("d", "http://x/d", "nothing tracked here"),
        ],
        true,
    );
    let notifier = StubNotifier::new(true);
    let scanner = scanner_with(
        provider.clone(),
        notifier.clone(),
        &[("http://x/a.xml", "alpha beta content")],
        &["alpha", "beta"],
        &dir,
    )
    .await;

    let results = scanner.run(false).await;

    assert_eq!(results.len(), 2);
    // an unfetchable document skips the item entirely, unread state included
    assert_eq!(
        provider.marked(),
        vec!["a".to_string(), "b".to_string(), "d".to_string()]
    );
    assert_eq!(
        notifier.sent(),
        vec![
            "terms:alpha,beta@http://x/a.xml#a".to_string(),
            "terms:beta@http://x/b#b".to_string(),
        ]
    );
}

#[tokio::test]
async fn untracked_feed_ids_are_ignored() {
    let dir = tempdir().expect("tempdir");
    let mut oddball = sec_item("z", "http://x/z", "alpha everywhere");
    oddball.feed_id = 9;
    let provider = StubProvider::new(vec![oddball], false);
    let notifier = StubNotifier::new(false);
    let scanner = scanner_with(provider, notifier, &[], &["alpha"], &dir).await;

    assert!(scanner.rescan().await.is_empty());
}

#[tokio::test]
async fn provider_failure_degrades_to_an_empty_batch() {
    let dir = tempdir().expect("tempdir");
    let notifier = StubNotifier::new(false);
    let fetcher = StubFetcher {
        documents: HashMap::new(),
    };
    let terms = TermList::open(TermStore::new(dir.path().join("terms.json")), &["alpha"]).await;
    let scanner = Scanner::new(
        Arc::new(FailingProvider),
        Arc::new(fetcher),
        notifier,
        terms,
    );

    assert!(scanner.run(false).await.is_empty());
    assert!(scanner.rescan().await.is_empty());
}
