//! Source clients + record normalizers: one adapter per upstream source kind.
//!
//! An adapter fetches raw pages for its source and maps them into exactly one
//! canonical record shape. Per-record problems are reported as
//! [`UpstreamFormatError`]s and never fail the batch; an unreadable payload or a
//! network failure fails the whole attempt.

use std::borrow::Cow;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dwatch_core::{CanonicalBatch, SourceId};
use dwatch_storage::{FetchError, HttpFetcher};
use scraper::Html;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod contracts;
pub mod news;
pub mod quotes;
mod rss;

pub use contracts::{ContractsAdapter, ListingFormat};
pub use news::NewsFeedAdapter;
pub use quotes::{Instrument, QuoteAdapter};

pub const CRATE_NAME: &str = "dwatch-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(fetched_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at,
        }
    }
}

/// One outbound request. `label` names the subject (company), `key` an upstream id (ticker).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchTarget {
    pub url: String,
    pub label: Option<String>,
    pub key: Option<String>,
}

impl FetchTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            label: None,
            key: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub target: FetchTarget,
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPage {
    /// Build a page from an in-memory body (fixtures, replays).
    pub fn from_body(
        target: FetchTarget,
        body: impl Into<Vec<u8>>,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            final_url: target.url.clone(),
            target,
            status: 200,
            body: body.into(),
            fetched_at,
        }
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    pub source_id: SourceId,
    pub pages: Vec<FetchedPage>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{source_id} payload from {url} is unreadable: {message}")]
    Payload {
        source_id: SourceId,
        url: String,
        message: String,
    },
    #[error("adapter for {expected} was handed a {found} payload")]
    SourceMismatch { expected: SourceId, found: SourceId },
}

/// A single upstream record that could not be mapped to its canonical shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{source_id} record {index} from {url}: {reason}")]
pub struct UpstreamFormatError {
    pub source_id: SourceId,
    pub url: String,
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome<T> {
    Parsed(T),
    Skipped(UpstreamFormatError),
}

/// Result of one normalization pass.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizeReport {
    pub batch: CanonicalBatch,
    pub skipped: Vec<UpstreamFormatError>,
    /// Upstream entries considered before per-record validation.
    pub raw_entries: usize,
}

impl NormalizeReport {
    pub fn from_outcomes<T>(
        outcomes: Vec<RecordOutcome<T>>,
        wrap: fn(Vec<T>) -> CanonicalBatch,
    ) -> Self {
        let raw_entries = outcomes.len();
        let mut records = Vec::with_capacity(raw_entries);
        let mut skipped = Vec::new();
        for outcome in outcomes {
            match outcome {
                RecordOutcome::Parsed(record) => records.push(record),
                RecordOutcome::Skipped(reason) => skipped.push(reason),
            }
        }
        Self {
            batch: wrap(records),
            skipped,
            raw_entries,
        }
    }

    /// Upstream was well-formed but had nothing in it.
    pub fn is_empty_result(&self) -> bool {
        self.raw_entries == 0
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> SourceId;
    fn targets(&self) -> Vec<FetchTarget>;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<RawPayload, AdapterError> {
        fetch_targets(http, ctx, self.source_id(), self.targets(), |_| false).await
    }

    fn normalize(
        &self,
        payload: &RawPayload,
        ctx: &AdapterContext,
    ) -> Result<NormalizeReport, AdapterError>;
}

/// Fetch every target in order. Errors for which `tolerate` returns true become a
/// body-less page carrying the status, left for the normalizer to skip.
pub async fn fetch_targets(
    http: &HttpFetcher,
    ctx: &AdapterContext,
    source_id: SourceId,
    targets: Vec<FetchTarget>,
    tolerate: fn(&FetchError) -> bool,
) -> Result<RawPayload, AdapterError> {
    let mut pages = Vec::with_capacity(targets.len());
    for target in targets {
        match http.fetch_bytes(ctx.run_id, source_id.as_str(), &target.url).await {
            Ok(resp) => pages.push(FetchedPage {
                target,
                status: resp.status.as_u16(),
                final_url: resp.final_url,
                body: resp.body,
                fetched_at: Utc::now(),
            }),
            Err(err) if tolerate(&err) => {
                let status = match &err {
                    FetchError::HttpStatus { status, .. } => *status,
                    _ => 0,
                };
                tracing::warn!(
                    %source_id,
                    url = %target.url,
                    error = %err,
                    "tolerated fetch failure"
                );
                pages.push(FetchedPage {
                    final_url: target.url.clone(),
                    target,
                    status,
                    body: Vec::new(),
                    fetched_at: Utc::now(),
                });
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(RawPayload { source_id, pages })
}

pub(crate) fn ensure_source(expected: SourceId, payload: &RawPayload) -> Result<(), AdapterError> {
    if payload.source_id != expected {
        return Err(AdapterError::SourceMismatch {
            expected,
            found: payload.source_id,
        });
    }
    Ok(())
}

pub(crate) fn skip<T>(
    source_id: SourceId,
    url: &str,
    index: usize,
    reason: impl Into<String>,
) -> RecordOutcome<T> {
    RecordOutcome::Skipped(UpstreamFormatError {
        source_id,
        url: url.to_string(),
        index,
        reason: reason.into(),
    })
}

pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub(crate) fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Plain text of an HTML fragment, whitespace collapsed.
pub(crate) fn strip_markup(fragment: &str) -> String {
    if !fragment.contains('<') {
        return collapse_whitespace(fragment);
    }
    let parsed = Html::parse_fragment(fragment);
    collapse_whitespace(&parsed.root_element().text().collect::<String>())
}

/// Resolve a possibly relative link against a site base.
pub(crate) fn absolutize(base: &str, href: &str) -> String {
    let href = href.trim();
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    if let Some(rest) = href.strip_prefix("//") {
        return format!("https://{rest}");
    }
    format!("{}/{}", base.trim_end_matches('/'), href.trim_start_matches('/'))
}
