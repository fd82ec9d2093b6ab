//! Core domain model for regwatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "regwatch-core";

/// Numeric feed discriminator for the Federal Register document feed.
pub const FEDERAL_REGISTER_FEED_ID: u64 = 2;
/// Numeric feed discriminator for the SEC filings feed.
pub const SEC_FILINGS_FEED_ID: u64 = 3;

/// Sentinel term reported for filings recognized by the 8-K detector.
pub const EIGHT_K_TERM: &str = "8-K";

/// Item projection as handed over by the upstream aggregator. Field
/// availability varies by originating feed; classification into a
/// [`FeedItem`] decides which fields actually matter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawItem {
    pub id: String,
    pub feed_id: u64,
    pub title: Option<String>,
    pub url: Option<String>,
    pub html: Option<String>,
    pub published: Option<DateTime<Utc>>,
}

/// Feed-kind sum type. Each variant carries only the fields valid for that
/// kind, so the scan pipeline dispatches exhaustively instead of branching on
/// a bare numeric discriminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedItem {
    /// Document-bearing feed: matching runs over a remote XML document.
    FederalRegister { id: String, document_url: String },
    /// Title-bearing feed: matching runs over the inline title.
    SecFiling {
        id: String,
        url: String,
        title: String,
    },
}

/// One finding produced by a pipeline pass. Transient: returned to the
/// caller, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    pub id: String,
    pub url: Option<String>,
    pub terms: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl MatchResult {
    /// Result for the generic text-search path.
    pub fn for_terms(id: impl Into<String>, url: impl Into<String>, terms: Vec<String>) -> Self {
        Self {
            id: id.into(),
            url: Some(url.into()),
            terms,
            company: None,
            context: None,
        }
    }

    /// Result for the specialized 8-K detection path. The term list is the
    /// singleton sentinel.
    pub fn for_8k(
        id: impl Into<String>,
        url: impl Into<String>,
        company: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            url: Some(url.into()),
            terms: vec![EIGHT_K_TERM.to_string()],
            company: Some(company.into()),
            context: Some(context.into()),
        }
    }
}
