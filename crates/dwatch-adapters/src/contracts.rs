//! Government contract announcements, read from the RSS feed or scraped from the listing page.

use async_trait::async_trait;
use dwatch_core::{CanonicalBatch, ContractItem, SourceId};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};

use crate::rss::parse_feed;
use crate::{
    absolutize, collapse_whitespace, ensure_source, skip, strip_markup, text_or_none,
    AdapterContext, AdapterError, FetchTarget, FetchedPage, NormalizeReport, RawPayload,
    RecordOutcome, SourceAdapter,
};

pub const DEFAULT_RSS_URL: &str = "https://www.defense.gov/News/Contracts/?rss";
pub const DEFAULT_HTML_URL: &str = "https://www.defense.gov/News/Contracts/";
pub const DEFAULT_LINK_BASE: &str = "https://www.defense.gov";
pub const DEFAULT_MAX_ITEMS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingFormat {
    Rss,
    Html,
}

#[derive(Debug, Clone)]
pub struct ContractsAdapter {
    url: String,
    format: ListingFormat,
    link_base: String,
    max_items: usize,
}

impl ContractsAdapter {
    pub fn new(
        url: impl Into<String>,
        format: ListingFormat,
        link_base: impl Into<String>,
        max_items: usize,
    ) -> Self {
        Self {
            url: url.into(),
            format,
            link_base: link_base.into(),
            max_items,
        }
    }

    pub fn rss() -> Self {
        Self::new(DEFAULT_RSS_URL, ListingFormat::Rss, DEFAULT_LINK_BASE, DEFAULT_MAX_ITEMS)
    }

    pub fn html() -> Self {
        Self::new(DEFAULT_HTML_URL, ListingFormat::Html, DEFAULT_LINK_BASE, DEFAULT_MAX_ITEMS)
    }

    pub fn format(&self) -> ListingFormat {
        self.format
    }
}

fn payload_error(page: &FetchedPage, message: impl Into<String>) -> AdapterError {
    AdapterError::Payload {
        source_id: SourceId::Contracts,
        url: page.final_url.clone(),
        message: message.into(),
    }
}

/// Every feed item becomes a contract; `date` keeps the feed's own date text.
pub fn normalize_rss_page(
    page: &FetchedPage,
    link_base: &str,
) -> Result<Vec<RecordOutcome<ContractItem>>, AdapterError> {
    let entries = parse_feed(&page.text()).map_err(|e| payload_error(page, e.to_string()))?;
    Ok(entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let reason = format!("malformed item: {e}");
                    return skip(SourceId::Contracts, &page.final_url, index, reason);
                }
            };
            let Some(title) = entry.title.as_deref().and_then(text_or_none) else {
                return skip(SourceId::Contracts, &page.final_url, index, "missing title");
            };
            let Some(href) = entry.link.as_deref().and_then(text_or_none) else {
                return skip(SourceId::Contracts, &page.final_url, index, "missing link");
            };
            RecordOutcome::Parsed(ContractItem {
                date: entry
                    .pub_date
                    .as_deref()
                    .map(|d| d.trim().to_string())
                    .unwrap_or_default(),
                title: collapse_whitespace(&title),
                summary: entry
                    .description
                    .as_deref()
                    .map(strip_markup)
                    .unwrap_or_default(),
                link: absolutize(link_base, &href),
            })
        })
        .collect())
}

/// Scrape `article` blocks: first `h4` is the title, first `a[href]` the link, first `p`
/// the summary. The listing carries no per-article date, so the fetch date is used.
/// That date is the UTC calendar date, so every host writes the same snapshot for the
/// same fetch instant.
pub fn normalize_html_page(
    page: &FetchedPage,
    link_base: &str,
    max_items: usize,
) -> Result<Vec<RecordOutcome<ContractItem>>, AdapterError> {
    let document = Html::parse_document(&page.text());
    let article = selector("article", page)?;
    let heading = selector("h4", page)?;
    let anchor = selector("a[href]", page)?;
    let paragraph = selector("p", page)?;
    let date = page.fetched_at.format("%Y-%m-%d").to_string();

    Ok(document
        .select(&article)
        .take(max_items)
        .enumerate()
        .map(|(index, block)| {
            let Some(title) = first_text(block, &heading) else {
                let reason = "no h4 title in article";
                return skip(SourceId::Contracts, &page.final_url, index, reason);
            };
            let Some(href) = block
                .select(&anchor)
                .next()
                .and_then(|a| a.value().attr("href"))
                .and_then(text_or_none)
            else {
                return skip(SourceId::Contracts, &page.final_url, index, "no link in article");
            };
            RecordOutcome::Parsed(ContractItem {
                date: date.clone(),
                title,
                summary: first_text(block, &paragraph).unwrap_or_default(),
                link: absolutize(link_base, &href),
            })
        })
        .collect())
}

fn selector(css: &str, page: &FetchedPage) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| payload_error(page, format!("selector `{css}`: {e}")))
}

fn first_text(block: ElementRef<'_>, sel: &Selector) -> Option<String> {
    block
        .select(sel)
        .next()
        .and_then(|n| text_or_none(&collapse_whitespace(&n.text().collect::<String>())))
}

#[async_trait]
impl SourceAdapter for ContractsAdapter {
    fn source_id(&self) -> SourceId {
        SourceId::Contracts
    }

    fn targets(&self) -> Vec<FetchTarget> {
        vec![FetchTarget::new(self.url.clone())]
    }

    fn normalize(
        &self,
        payload: &RawPayload,
        _ctx: &AdapterContext,
    ) -> Result<NormalizeReport, AdapterError> {
        ensure_source(SourceId::Contracts, payload)?;
        let mut outcomes = Vec::new();
        for page in &payload.pages {
            let page_outcomes = match self.format {
                ListingFormat::Rss => normalize_rss_page(page, &self.link_base)?,
                ListingFormat::Html => normalize_html_page(page, &self.link_base, self.max_items)?,
            };
            outcomes.extend(page_outcomes);
        }
        Ok(NormalizeReport::from_outcomes(outcomes, CanonicalBatch::Contracts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ctx, fixture, payload};

    fn normalize(adapter: &ContractsAdapter, body: String) -> NormalizeReport {
        let target = adapter.targets().remove(0);
        adapter
            .normalize(&payload(SourceId::Contracts, vec![(target, body)]), &ctx())
            .unwrap()
    }

    fn contracts(report: &NormalizeReport) -> &[ContractItem] {
        match &report.batch {
            CanonicalBatch::Contracts(items) => items,
            other => panic!("expected contracts batch, got {other:?}"),
        }
    }

    #[test]
    fn rss_fixture_maps_every_well_formed_item() {
        let adapter = ContractsAdapter::rss();
        let report = normalize(&adapter, fixture("contracts/defense_gov.rss"));
        let items = contracts(&report);

        assert_eq!(report.raw_entries, 4);
        assert_eq!(items.len(), 3);
        assert_eq!(report.skipped.len(), 1);
        assert!(report.skipped[0].reason.contains("title"));

        assert_eq!(items[0].title, "Contracts For Oct. 13, 2026");
        assert_eq!(items[0].date, "Tue, 13 Oct 2026 21:00:00 -0400");
        assert!(items[0]
            .summary
            .starts_with("Lockheed Martin Corp., Grand Prairie, Texas, has been awarded"));
        assert!(!items[0].summary.contains('<'));
        assert_eq!(
            items[0].link,
            "https://www.defense.gov/News/Contracts/Contract/Article/4001001/"
        );
        // Relative links are resolved, missing descriptions default to empty.
        assert_eq!(
            items[2].link,
            "https://www.defense.gov/News/Contracts/Contract/Article/4000998/"
        );
        assert_eq!(items[2].summary, "");
    }

    #[test]
    fn malformed_rss_item_is_skipped_not_fatal() {
        let adapter = ContractsAdapter::rss();
        let good = "<item><title>Contracts For Oct. 14, 2026</title><link>/c/1</link></item>";
        let bad_items = [
            "<item><title>Dup</title><link>/c/2</link><link>/c/3</link></item>",
            "<item><title>Contracts <b>For</b> Oct. 15</title><link>/c/2</link></item>",
            "<item><title>Soci&eacute;t&eacute;</title><link>/c/2</link></item>",
        ];
        for bad in bad_items {
            let body = format!("<rss><channel>{good}{bad}</channel></rss>");
            let report = normalize(&adapter, body);
            assert_eq!(report.raw_entries, 2, "{bad}");
            assert_eq!(contracts(&report).len(), 1, "{bad}");
            assert_eq!(report.skipped.len(), 1, "{bad}");
            assert_eq!(report.skipped[0].index, 1);
            assert!(report.skipped[0].reason.starts_with("malformed item"));
        }
    }

    #[test]
    fn html_fixture_skips_articles_without_heading() {
        let adapter = ContractsAdapter::html();
        let report = normalize(&adapter, fixture("contracts/defense_gov_listing.html"));
        let items = contracts(&report);

        assert_eq!(report.raw_entries, 3);
        assert_eq!(items.len(), 2);
        assert_eq!(report.skipped[0].index, 1);

        assert_eq!(items[0].date, "2026-10-14");
        assert_eq!(items[0].title, "Contracts For Oct. 13, 2026");
        assert_eq!(
            items[0].link,
            "https://www.defense.gov/News/Contracts/Contract/Article/4001001/"
        );
        assert!(items[0].summary.contains("Boeing Co."));
        assert_eq!(items[1].summary, "");
    }

    #[test]
    fn html_listing_is_capped_at_max_items() {
        let adapter =
            ContractsAdapter::new(DEFAULT_HTML_URL, ListingFormat::Html, DEFAULT_LINK_BASE, 2);
        let articles: String = (0..5)
            .map(|i| {
                format!("<article><h4>Contracts {i}</h4><a href=\"/c/{i}\">x</a><p>s{i}</p></article>")
            })
            .collect();
        let report = normalize(&adapter, format!("<html><body>{articles}</body></html>"));
        let items = contracts(&report);
        assert_eq!(report.raw_entries, 2);
        assert_eq!(items[1].link, "https://www.defense.gov/c/1");
        assert_eq!(items[1].summary, "s1");
    }

    #[test]
    fn page_without_articles_is_an_empty_result() {
        let adapter = ContractsAdapter::html();
        let body = "<html><body><main>maintenance</main></body></html>".to_string();
        let report = normalize(&adapter, body);
        assert!(report.is_empty_result());
        assert!(report.batch.is_empty());
    }
}
