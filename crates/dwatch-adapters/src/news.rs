//! Company-scoped news search feeds (one RSS request per tracked company).

use async_trait::async_trait;
use dwatch_core::{CanonicalBatch, NewsItem, SourceId};

use crate::rss::{normalize_pub_date, parse_feed};
use crate::{
    ensure_source, skip, text_or_none, AdapterContext, AdapterError, FetchTarget, FetchedPage,
    NormalizeReport, RawPayload, RecordOutcome, SourceAdapter,
};

pub const DEFAULT_FEED_URL_TEMPLATE: &str = "https://news.google.com/rss/search?q={query}+defense";
pub const DEFAULT_MAX_ITEMS_PER_COMPANY: usize = 5;

#[derive(Debug, Clone)]
pub struct NewsFeedAdapter {
    feed_url_template: String,
    companies: Vec<String>,
    max_items_per_company: usize,
}

impl NewsFeedAdapter {
    pub fn new(
        feed_url_template: impl Into<String>,
        companies: Vec<String>,
        max_items_per_company: usize,
    ) -> Self {
        Self {
            feed_url_template: feed_url_template.into(),
            companies,
            max_items_per_company,
        }
    }

    pub fn feed_url(&self, company: &str) -> String {
        self.feed_url_template.replace("{query}", &encode_query(company))
    }
}

/// Search-query encoding: spaces become `+`, reserved characters are percent-escaped.
pub fn encode_query(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for ch in term.trim().chars() {
        match ch {
            ' ' => out.push('+'),
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '.' | '~' => out.push(ch),
            other => {
                let mut buf = [0u8; 4];
                for byte in other.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("%{byte:02X}"));
                }
            }
        }
    }
    out
}

/// Map one company's feed page to news items, keeping at most `max_items` entries.
pub fn normalize_feed_page(
    page: &FetchedPage,
    max_items: usize,
) -> Result<Vec<RecordOutcome<NewsItem>>, AdapterError> {
    let entries = parse_feed(&page.text()).map_err(|e| AdapterError::Payload {
        source_id: SourceId::News,
        url: page.final_url.clone(),
        message: e.to_string(),
    })?;
    let company = page.target.label.as_deref().and_then(text_or_none);

    Ok(entries
        .into_iter()
        .take(max_items)
        .enumerate()
        .map(|(index, entry)| {
            let Some(company) = company.clone() else {
                return skip(SourceId::News, &page.final_url, index, "feed has no company label");
            };
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let reason = format!("malformed item: {e}");
                    return skip(SourceId::News, &page.final_url, index, reason);
                }
            };
            let Some(title) = entry.title.as_deref().and_then(text_or_none) else {
                return skip(SourceId::News, &page.final_url, index, "missing title");
            };
            let Some(link) = entry.link.as_deref().and_then(text_or_none) else {
                return skip(SourceId::News, &page.final_url, index, "missing link");
            };
            RecordOutcome::Parsed(NewsItem {
                company,
                title,
                link,
                published: entry
                    .pub_date
                    .as_deref()
                    .map(normalize_pub_date)
                    .unwrap_or_default(),
            })
        })
        .collect())
}

#[async_trait]
impl SourceAdapter for NewsFeedAdapter {
    fn source_id(&self) -> SourceId {
        SourceId::News
    }

    fn targets(&self) -> Vec<FetchTarget> {
        self.companies
            .iter()
            .map(|company| FetchTarget::new(self.feed_url(company)).with_label(company.clone()))
            .collect()
    }

    fn normalize(
        &self,
        payload: &RawPayload,
        _ctx: &AdapterContext,
    ) -> Result<NormalizeReport, AdapterError> {
        ensure_source(SourceId::News, payload)?;
        let mut outcomes = Vec::new();
        for page in &payload.pages {
            outcomes.extend(normalize_feed_page(page, self.max_items_per_company)?);
        }
        Ok(NormalizeReport::from_outcomes(outcomes, CanonicalBatch::News))
    }
}
