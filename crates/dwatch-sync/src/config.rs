//! Environment settings, the YAML source registry and the company roster.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dwatch_adapters::{
    contracts, news, quotes, ContractsAdapter, Instrument, ListingFormat, NewsFeedAdapter,
    QuoteAdapter, SourceAdapter,
};
use dwatch_core::{CompanyRecord, SourceId};
use dwatch_storage::{HttpClientConfig, SnapshotStore, TokenBucketConfig, DEFAULT_USER_AGENT};
use serde::Deserialize;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    pub companies_path: PathBuf,
    pub sources_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl WatchConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("DWATCH_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let path_var = |name: &str, default: &str| {
            std::env::var(name)
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join(default))
        };
        Self {
            data_dir: path_var("DWATCH_DATA_DIR", "data"),
            companies_path: path_var("DWATCH_COMPANIES_PATH", "config/companies.csv"),
            sources_path: path_var("DWATCH_SOURCES_PATH", "config/sources.yaml"),
            user_agent: std::env::var("DWATCH_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: std::env::var("DWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            workspace_root,
        }
    }

    /// Client settings for one source: the shared timeout, the source's own User-Agent
    /// (falling back to the global one) and its request pacing when it declares one.
    pub fn http_client_config(&self, source: &SourceConfig) -> HttpClientConfig {
        let token_bucket = source
            .requests_per_second()
            .filter(|rps| *rps > 0)
            .map(|rps| TokenBucketConfig {
                capacity: rps,
                refill_every: Duration::from_millis(1000 / u64::from(rps)),
            });
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(
                source
                    .user_agent
                    .clone()
                    .unwrap_or_else(|| self.user_agent.clone()),
            ),
            token_bucket,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn get(&self, source_id: SourceId) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for source in &self.sources {
            if !seen.insert(source.source_id) {
                bail!("source `{}` is declared more than once", source.source_id);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: SourceId,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub ttl_secs: u64,
    /// Overrides `DWATCH_USER_AGENT` for this source's requests.
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub news: Option<NewsDescriptor>,
    #[serde(default)]
    pub contracts: Option<ContractsDescriptor>,
    #[serde(default)]
    pub quotes: Option<QuotesDescriptor>,
}

fn default_enabled() -> bool {
    true
}

impl SourceConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.ttl_secs).unwrap_or(i64::MAX))
    }

    fn requests_per_second(&self) -> Option<u32> {
        match self.source_id {
            SourceId::News => self.news.as_ref().and_then(|d| d.requests_per_second),
            SourceId::Contracts => None,
            SourceId::Quotes => self.quotes.as_ref().and_then(|d| d.requests_per_second),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewsDescriptor {
    #[serde(default = "default_feed_url_template")]
    pub feed_url_template: String,
    #[serde(default = "default_max_items_per_company")]
    pub max_items_per_company: usize,
    #[serde(default)]
    pub requests_per_second: Option<u32>,
}

impl Default for NewsDescriptor {
    fn default() -> Self {
        Self {
            feed_url_template: default_feed_url_template(),
            max_items_per_company: default_max_items_per_company(),
            requests_per_second: None,
        }
    }
}

fn default_feed_url_template() -> String {
    news::DEFAULT_FEED_URL_TEMPLATE.to_string()
}

fn default_max_items_per_company() -> usize {
    news::DEFAULT_MAX_ITEMS_PER_COMPANY
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractsDescriptor {
    /// Listing URL; defaults to the feed or the HTML page depending on `format`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_listing_format")]
    pub format: ListingFormat,
    #[serde(default = "default_link_base")]
    pub link_base: String,
    #[serde(default = "default_max_items")]
    pub max_items: usize,
}

impl Default for ContractsDescriptor {
    fn default() -> Self {
        Self {
            url: None,
            format: default_listing_format(),
            link_base: default_link_base(),
            max_items: default_max_items(),
        }
    }
}

fn default_listing_format() -> ListingFormat {
    ListingFormat::Rss
}

fn default_link_base() -> String {
    contracts::DEFAULT_LINK_BASE.to_string()
}

fn default_max_items() -> usize {
    contracts::DEFAULT_MAX_ITEMS
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotesDescriptor {
    #[serde(default = "default_chart_url_template")]
    pub chart_url_template: String,
    #[serde(default = "default_range")]
    pub range: String,
    #[serde(default = "default_interval")]
    pub interval: String,
    #[serde(default)]
    pub requests_per_second: Option<u32>,
}

impl Default for QuotesDescriptor {
    fn default() -> Self {
        Self {
            chart_url_template: default_chart_url_template(),
            range: default_range(),
            interval: default_interval(),
            requests_per_second: None,
        }
    }
}

fn default_chart_url_template() -> String {
    quotes::DEFAULT_CHART_URL_TEMPLATE.to_string()
}

fn default_range() -> String {
    quotes::DEFAULT_RANGE.to_string()
}

fn default_interval() -> String {
    quotes::DEFAULT_INTERVAL.to_string()
}

pub async fn load_source_registry(path: &Path) -> Result<SourceRegistry> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    parse_source_registry(&text).with_context(|| format!("parsing {}", path.display()))
}

pub fn parse_source_registry(text: &str) -> Result<SourceRegistry> {
    let registry: SourceRegistry = serde_yaml::from_str(text)?;
    registry.validate()?;
    Ok(registry)
}

/// The roster is static reference data; a missing file is an empty roster.
pub async fn load_roster(store: &SnapshotStore, path: &Path) -> Result<Vec<CompanyRecord>> {
    let roster: Vec<CompanyRecord> = store
        .load_from_path(path)
        .await
        .with_context(|| format!("loading company roster {}", path.display()))?;
    if roster.is_empty() {
        warn!(
            path = %path.display(),
            "company roster is empty; news and quotes have nothing to track"
        );
    }
    Ok(roster)
}

/// Every named roster company is a news query.
pub fn news_queries(roster: &[CompanyRecord]) -> Vec<String> {
    roster
        .iter()
        .map(|c| c.name.trim())
        .filter(|name| !name.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Roster companies with a public ticker, in roster order.
pub fn quote_instruments(roster: &[CompanyRecord]) -> Vec<Instrument> {
    roster
        .iter()
        .filter_map(|c| {
            let ticker = c.ticker.as_deref()?;
            Some(Instrument {
                label: c.name.trim().to_string(),
                ticker: ticker.to_string(),
            })
        })
        .collect()
}

pub fn build_adapter(source: &SourceConfig, roster: &[CompanyRecord]) -> Arc<dyn SourceAdapter> {
    match source.source_id {
        SourceId::News => {
            let d = source.news.clone().unwrap_or_default();
            Arc::new(NewsFeedAdapter::new(
                d.feed_url_template,
                news_queries(roster),
                d.max_items_per_company,
            ))
        }
        SourceId::Contracts => {
            let d = source.contracts.clone().unwrap_or_default();
            let url = d.url.unwrap_or_else(|| match d.format {
                ListingFormat::Rss => contracts::DEFAULT_RSS_URL.to_string(),
                ListingFormat::Html => contracts::DEFAULT_HTML_URL.to_string(),
            });
            Arc::new(ContractsAdapter::new(url, d.format, d.link_base, d.max_items))
        }
        SourceId::Quotes => {
            let d = source.quotes.clone().unwrap_or_default();
            Arc::new(QuoteAdapter::new(
                d.chart_url_template,
                d.range,
                d.interval,
                quote_instruments(roster),
            ))
        }
    }
}
