//! Upstream item source + notification sink contracts for regwatch, with the
//! Fever-API provider and webhook notifier implementations.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::DateTime;
use regwatch_core::{FeedItem, RawItem, FEDERAL_REGISTER_FEED_ID, SEC_FILINGS_FEED_ID};
use scraper::{Html, Selector};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "regwatch-feeds";

/// Fever item endpoints page in blocks of 50.
const FEVER_PAGE_SIZE: usize = 50;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("non-numeric item id {0:?}")]
    InvalidItemId(String),
}

/// Upstream read/unread item collection. At-least-once semantics: an item
/// stays in the unread set until `mark_as_read` succeeds.
#[async_trait]
pub trait ItemProvider: Send + Sync {
    async fn unread_items(&self) -> Result<Vec<RawItem>, ProviderError>;
    async fn all_items(&self) -> Result<Vec<RawItem>, ProviderError>;
    async fn mark_as_read(&self, item_id: &str) -> Result<bool, ProviderError>;
}

/// Notification sink. Implementations own their delivery failures; the scan
/// pipeline logs a returned error and moves on without retrying.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, terms: &[String], url: &str, item_id: Option<&str>) -> anyhow::Result<()>;
    async fn send_8k(
        &self,
        company: &str,
        context: &str,
        url: &str,
        item_id: Option<&str>,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("item {item_id} carries no XML document link")]
    MissingDocumentLink { item_id: String },
}

/// Dispatch a raw provider item into its feed kind. Items from feeds the
/// pipeline does not track classify to `None`.
pub fn classify_item(raw: &RawItem) -> Result<Option<FeedItem>, ClassifyError> {
    match raw.feed_id {
        FEDERAL_REGISTER_FEED_ID => {
            let document_url = raw
                .html
                .as_deref()
                .and_then(extract_document_url)
                .ok_or_else(|| ClassifyError::MissingDocumentLink {
                    item_id: raw.id.clone(),
                })?;
            Ok(Some(FeedItem::FederalRegister {
                id: raw.id.clone(),
                document_url,
            }))
        }
        SEC_FILINGS_FEED_ID => Ok(Some(FeedItem::SecFiling {
            id: raw.id.clone(),
            url: raw.url.clone().unwrap_or_default(),
            title: raw.title.clone().unwrap_or_default(),
        })),
        _ => Ok(None),
    }
}

/// Find the `XML` document link inside a Federal Register item body. The feed
/// renders each entry with an anchor labeled "XML" pointing at the full
/// document.
pub fn extract_document_url(html: &str) -> Option<String> {
    let fragment = Html::parse_fragment(html);
    let selector = Selector::parse("a[href]").ok()?;
    fragment
        .select(&selector)
        .find(|anchor| {
            anchor
                .text()
                .collect::<String>()
                .trim()
                .eq_ignore_ascii_case("xml")
        })
        .and_then(|anchor| anchor.value().attr("href"))
        .map(ToString::to_string)
}

#[derive(Debug, Clone)]
pub struct FeverConfig {
    /// Base endpoint, e.g. `https://rss.example.net/api/fever.php`.
    pub endpoint: String,
    pub api_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

/// Fever-API client for a FreshRSS-style aggregator.
#[derive(Debug)]
pub struct FeverProvider {
    client: reqwest::Client,
    config: FeverConfig,
}

#[derive(Debug, Deserialize)]
struct FeverItemsResponse {
    #[serde(default)]
    items: Vec<FeverItem>,
}

#[derive(Debug, Deserialize)]
struct FeverItem {
    id: u64,
    feed_id: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    html: String,
    #[serde(default)]
    created_on_time: i64,
}

#[derive(Debug, Deserialize)]
struct FeverUnreadResponse {
    #[serde(default)]
    unread_item_ids: String,
}

impl From<FeverItem> for RawItem {
    fn from(item: FeverItem) -> Self {
        let text_or_none = |s: String| if s.is_empty() { None } else { Some(s) };
        RawItem {
            id: item.id.to_string(),
            feed_id: item.feed_id,
            title: text_or_none(item.title),
            url: text_or_none(item.url),
            html: text_or_none(item.html),
            published: DateTime::from_timestamp(item.created_on_time, 0),
        }
    }
}

fn parse_unread_ids(ids: &str) -> Vec<u64> {
    ids.split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

impl FeverProvider {
    pub fn new(config: FeverConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, config })
    }

    async fn call<T: DeserializeOwned>(&self, action: &str) -> Result<T, ProviderError> {
        let url = format!("{}?api&{}", self.config.endpoint, action);
        let resp = self
            .client
            .post(&url)
            .form(&[("api_key", self.config.api_key.as_str())])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ProviderError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp.json::<T>().await?)
    }

    async fn items_by_ids(&self, ids: &[u64]) -> Result<Vec<RawItem>, ProviderError> {
        let mut items = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(FEVER_PAGE_SIZE) {
            let joined = chunk
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let page: FeverItemsResponse = self.call(&format!("items&with_ids={joined}")).await?;
            items.extend(page.items.into_iter().map(RawItem::from));
        }
        Ok(items)
    }
}

#[async_trait]
impl ItemProvider for FeverProvider {
    async fn unread_items(&self) -> Result<Vec<RawItem>, ProviderError> {
        let unread: FeverUnreadResponse = self.call("unread_item_ids").await?;
        let ids = parse_unread_ids(&unread.unread_item_ids);
        self.items_by_ids(&ids).await
    }

    async fn all_items(&self) -> Result<Vec<RawItem>, ProviderError> {
        let mut items = Vec::new();
        let mut since_id = 0u64;
        loop {
            let page: FeverItemsResponse =
                self.call(&format!("items&since_id={since_id}")).await?;
            let count = page.items.len();
            let max_id = page.items.iter().map(|item| item.id).max();
            items.extend(page.items.into_iter().map(RawItem::from));
            match max_id {
                Some(max) if count == FEVER_PAGE_SIZE => since_id = max,
                _ => break,
            }
        }
        Ok(items)
    }

    async fn mark_as_read(&self, item_id: &str) -> Result<bool, ProviderError> {
        let id: u64 = item_id
            .parse()
            .map_err(|_| ProviderError::InvalidItemId(item_id.to_string()))?;
        let _: serde_json::Value = self.call(&format!("mark=item&as=read&id={id}")).await?;
        Ok(true)
    }
}

/// Chat-webhook notification sink posting a `{"content": ...}` JSON body.
#[derive(Debug)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl WebhookNotifier {
    pub fn new(webhook_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            webhook_url: webhook_url.into(),
        })
    }

    async fn post_content(&self, message: &str) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&serde_json::json!({ "content": message }))
            .send()
            .await
            .context("posting webhook notification")?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("webhook rejected notification with status {status}");
        }
        Ok(())
    }
}

pub fn format_term_message(terms: &[String], url: &str, item_id: Option<&str>) -> String {
    let mut message = format!("{} was found in this document!", terms.join(", "));
    if let Some(id) = item_id {
        message.push_str(&format!(" (Article ID: {id})"));
    }
    message.push('\n');
    message.push_str(url);
    message
}

pub fn format_8k_message(company: &str, context: &str, url: &str, item_id: Option<&str>) -> String {
    let mut message = format!("{company} filed a Form 8-K: {context}");
    if let Some(id) = item_id {
        message.push_str(&format!(" (Filing ID: {id})"));
    }
    message.push('\n');
    message.push_str(url);
    message
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, terms: &[String], url: &str, item_id: Option<&str>) -> anyhow::Result<()> {
        let message = format_term_message(terms, url, item_id);
        self.post_content(&message).await?;
        info!(terms = %terms.join(", "), "notification sent");
        Ok(())
    }

    async fn send_8k(
        &self,
        company: &str,
        context: &str,
        url: &str,
        item_id: Option<&str>,
    ) -> anyhow::Result<()> {
        let message = format_8k_message(company, context, url, item_id);
        self.post_content(&message).await?;
        info!(company, "8-K notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(feed_id: u64) -> RawItem {
        RawItem {
            id: "10".to_string(),
            feed_id,
            title: Some("Beta update".to_string()),
            url: Some("http://x/b".to_string()),
            html: Some(r#"Summary<br>\n <a href="http://x/a.xml">XML</a>"#.to_string()),
            published: None,
        }
    }

    #[test]
    fn document_url_comes_from_the_xml_anchor() {
        let html = r#"<a href="http://x/page">HTML</a> <a href="http://x/a.xml">XML</a>"#;
        assert_eq!(
            extract_document_url(html).as_deref(),
            Some("http://x/a.xml")
        );
    }

    #[test]
    fn missing_xml_anchor_yields_none() {
        assert!(extract_document_url("<p>no links</p>").is_none());
        assert!(extract_document_url(r#"<a href="http://x/page">HTML</a>"#).is_none());
    }

    #[test]
    fn federal_register_items_classify_with_document_url() {
        let item = classify_item(&raw(FEDERAL_REGISTER_FEED_ID)).expect("classify");
        assert_eq!(
            item,
            Some(FeedItem::FederalRegister {
                id: "10".to_string(),
                document_url: "http://x/a.xml".to_string(),
            })
        );
    }

    #[test]
    fn federal_register_item_without_link_is_an_error() {
        let mut item = raw(FEDERAL_REGISTER_FEED_ID);
        item.html = Some("<p>plain summary</p>".to_string());
        assert!(classify_item(&item).is_err());
    }

    #[test]
    fn sec_items_classify_with_title_and_url() {
        let item = classify_item(&raw(SEC_FILINGS_FEED_ID)).expect("classify");
        assert_eq!(
            item,
            Some(FeedItem::SecFiling {
                id: "10".to_string(),
                url: "http://x/b".to_string(),
                title: "Beta update".to_string(),
            })
        );
    }

    #[test]
    fn unknown_feeds_classify_to_none() {
        assert_eq!(classify_item(&raw(7)).expect("classify"), None);
    }

    #[test]
    fn fever_items_decode_into_raw_items() {
        let payload = r#"{
            "api_version": 3,
            "items": [
                {"id": 42, "feed_id": 2, "title": "", "url": "http://x/a",
                 "html": "<a href=\"http://x/a.xml\">XML</a>", "created_on_time": 1700000000}
            ]
        }"#;
        let decoded: FeverItemsResponse = serde_json::from_str(payload).expect("decode");
        let item = RawItem::from(decoded.items.into_iter().next().expect("one item"));
        assert_eq!(item.id, "42");
        assert_eq!(item.feed_id, 2);
        assert!(item.title.is_none());
        assert_eq!(item.url.as_deref(), Some("http://x/a"));
        assert!(item.published.is_some());
    }

    #[test]
    fn unread_id_lists_tolerate_blanks() {
        assert_eq!(parse_unread_ids("1, 2,3"), vec![1, 2, 3]);
        assert!(parse_unread_ids("").is_empty());
    }

    #[test]
    fn term_message_includes_terms_id_and_url() {
        let terms = vec!["alpha".to_string(), "beta".to_string()];
        let message = format_term_message(&terms, "http://x/a.xml", Some("42"));
        assert_eq!(
            message,
            "alpha, beta was found in this document! (Article ID: 42)\nhttp://x/a.xml"
        );
    }

    #[test]
    fn eight_k_message_names_the_company() {
        let message = format_8k_message("Acme Corp", "Acme Corp - Form 8-K filing", "http://x/b", None);
        assert_eq!(
            message,
            "Acme Corp filed a Form 8-K: Acme Corp - Form 8-K filing\nhttp://x/b"
        );
    }
}
