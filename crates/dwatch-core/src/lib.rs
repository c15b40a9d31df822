//! Canonical record shapes shared by every Defense Watch pipeline stage.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "dwatch-core";

/// Sentinel written in the roster's ticker column for privately held companies.
pub const NOT_PUBLIC: &str = "not public";

/// Refreshable upstream sources. Each one owns exactly one snapshot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    News,
    Contracts,
    Quotes,
}

impl SourceId {
    pub const ALL: [SourceId; 3] = [SourceId::News, SourceId::Contracts, SourceId::Quotes];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceId::News => "news",
            SourceId::Contracts => "contracts",
            SourceId::Quotes => "quotes",
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSource(pub String);

impl fmt::Display for UnknownSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown source `{}` (expected news, contracts or quotes)", self.0)
    }
}

impl std::error::Error for UnknownSource {}

impl FromStr for SourceId {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "news" => Ok(SourceId::News),
            "contracts" => Ok(SourceId::Contracts),
            "quotes" => Ok(SourceId::Quotes),
            other => Err(UnknownSource(other.to_string())),
        }
    }
}

/// One headline from a company-scoped news search feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsItem {
    pub company: String,
    pub title: String,
    pub link: String,
    /// RFC 3339 when the upstream date parsed, otherwise the upstream text verbatim.
    pub published: String,
}

/// One government contract announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractItem {
    pub date: String,
    pub title: String,
    pub summary: String,
    pub link: String,
}

/// Roster entry for a tracked company. Static configuration, never fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub name: String,
    pub country: String,
    pub sector: String,
    #[serde(with = "ticker_or_not_public")]
    pub ticker: Option<String>,
}

impl CompanyRecord {
    pub fn is_public(&self) -> bool {
        self.ticker.is_some()
    }
}

mod ticker_or_not_public {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::NOT_PUBLIC;

    pub fn serialize<S: Serializer>(
        value: &Option<String>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(value.as_deref().unwrap_or(NOT_PUBLIC))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<String>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(NOT_PUBLIC) {
            Ok(None)
        } else {
            Ok(Some(trimmed.to_string()))
        }
    }
}

/// A single close observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub close: f64,
}

/// Latest quote plus recent close history for one listed company.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteSnapshot {
    pub label: String,
    pub ticker: String,
    pub price: Option<f64>,
    pub change_percent: Option<f64>,
    pub history: Vec<PricePoint>,
    pub market_cap: Option<f64>,
    pub beta: Option<f64>,
    pub pe_ratio: Option<f64>,
    pub volume: Option<f64>,
}

impl QuoteSnapshot {
    pub fn new(label: impl Into<String>, ticker: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ticker: ticker.into(),
            price: None,
            change_percent: None,
            history: Vec::new(),
            market_cap: None,
            beta: None,
            pe_ratio: None,
            volume: None,
        }
    }
}

/// Normalized output of one refresh, tagged with the source that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalBatch {
    News(Vec<NewsItem>),
    Contracts(Vec<ContractItem>),
    Quotes(Vec<QuoteSnapshot>),
}

impl CanonicalBatch {
    pub fn empty(source_id: SourceId) -> Self {
        match source_id {
            SourceId::News => CanonicalBatch::News(Vec::new()),
            SourceId::Contracts => CanonicalBatch::Contracts(Vec::new()),
            SourceId::Quotes => CanonicalBatch::Quotes(Vec::new()),
        }
    }

    pub fn source_id(&self) -> SourceId {
        match self {
            CanonicalBatch::News(_) => SourceId::News,
            CanonicalBatch::Contracts(_) => SourceId::Contracts,
            CanonicalBatch::Quotes(_) => SourceId::Quotes,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            CanonicalBatch::News(items) => items.len(),
            CanonicalBatch::Contracts(items) => items.len(),
            CanonicalBatch::Quotes(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
