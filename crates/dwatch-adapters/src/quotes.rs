//! Quote provider: one chart request per listed ticker.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use dwatch_core::{CanonicalBatch, PricePoint, QuoteSnapshot, SourceId};
use dwatch_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{
    ensure_source, fetch_targets, skip, text_or_none, AdapterContext, AdapterError, FetchTarget,
    FetchedPage, NormalizeReport, RawPayload, RecordOutcome, SourceAdapter,
};

pub const DEFAULT_CHART_URL_TEMPLATE: &str =
    "https://query1.finance.yahoo.com/v8/finance/chart/{ticker}?range={range}&interval={interval}";
pub const DEFAULT_RANGE: &str = "1mo";
pub const DEFAULT_INTERVAL: &str = "1d";

/// A listed company to quote: display label plus exchange ticker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub label: String,
    pub ticker: String,
}

#[derive(Debug, Clone)]
pub struct QuoteAdapter {
    chart_url_template: String,
    range: String,
    interval: String,
    instruments: Vec<Instrument>,
}

impl QuoteAdapter {
    pub fn new(
        chart_url_template: impl Into<String>,
        range: impl Into<String>,
        interval: impl Into<String>,
        instruments: Vec<Instrument>,
    ) -> Self {
        Self {
            chart_url_template: chart_url_template.into(),
            range: range.into(),
            interval: interval.into(),
            instruments,
        }
    }

    pub fn chart_url(&self, ticker: &str) -> String {
        self.chart_url_template
            .replace("{ticker}", ticker.trim())
            .replace("{range}", &self.range)
            .replace("{interval}", &self.interval)
    }

    /// Bars of a day or longer are keyed by trading date rather than bar-open instant.
    pub fn uses_trading_dates(&self) -> bool {
        let interval = self.interval.trim();
        interval.ends_with('d') || interval.ends_with("wk") || interval.ends_with("mo")
    }
}

// An unknown or delisted ticker answers 404; that is one bad record, not a dead source.
fn tolerate_missing_ticker(err: &FetchError) -> bool {
    matches!(err, FetchError::HttpStatus { status: 404, .. })
}

fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_path(value, path)?.as_str()
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    json_path(value, path)?.as_f64().filter(|v| v.is_finite())
}

fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    json_path(value, path)?.as_i64()
}

fn trading_date_midnight(instant: DateTime<Utc>, gmt_offset_secs: i64) -> DateTime<Utc> {
    let local = instant + Duration::seconds(gmt_offset_secs);
    local.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Map one chart response to a quote, or explain why it was skipped.
pub fn normalize_chart_page(
    page: &FetchedPage,
    index: usize,
    trading_dates: bool,
) -> Result<RecordOutcome<QuoteSnapshot>, AdapterError> {
    let url = page.final_url.as_str();
    if page.status == 404 || page.body.is_empty() {
        let reason = format!("no chart data (status {})", page.status);
        return Ok(skip(SourceId::Quotes, url, index, reason));
    }

    let root: JsonValue = serde_json::from_slice(&page.body).map_err(|e| AdapterError::Payload {
        source_id: SourceId::Quotes,
        url: url.to_string(),
        message: format!("invalid chart JSON: {e}"),
    })?;

    if let Some(error) = json_path(&root, &["chart", "error"]).filter(|e| !e.is_null()) {
        let description = json_str(error, &["description"])
            .or_else(|| json_str(error, &["code"]))
            .unwrap_or("provider error");
        return Ok(skip(SourceId::Quotes, url, index, description.to_string()));
    }
    let Some(result) = json_path(&root, &["chart", "result"]).and_then(|r| r.get(0)) else {
        return Ok(skip(SourceId::Quotes, url, index, "chart has no result"));
    };

    let Some(ticker) = json_str(result, &["meta", "symbol"])
        .and_then(text_or_none)
        .or_else(|| page.target.key.as_deref().and_then(text_or_none))
    else {
        return Ok(skip(SourceId::Quotes, url, index, "missing ticker symbol"));
    };
    let label = page
        .target
        .label
        .as_deref()
        .and_then(text_or_none)
        .unwrap_or_else(|| ticker.clone());

    let gmt_offset = json_i64(result, &["meta", "gmtoffset"]).unwrap_or(0);
    let timestamps = json_path(result, &["timestamp"])
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let closes = json_path(result, &["indicators", "quote"])
        .and_then(|q| q.get(0))
        .and_then(|q| q.get("close"))
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    // Keyed by timestamp: sorts the series and keeps the last bar of a duplicated date.
    let mut series: BTreeMap<DateTime<Utc>, f64> = BTreeMap::new();
    for (ts, close) in timestamps.iter().zip(closes) {
        let (Some(ts), Some(close)) = (ts.as_i64(), close.as_f64()) else {
            continue;
        };
        if !close.is_finite() {
            continue;
        }
        let Some(instant) = DateTime::<Utc>::from_timestamp(ts, 0) else {
            continue;
        };
        let key = if trading_dates {
            trading_date_midnight(instant, gmt_offset)
        } else {
            instant
        };
        series.insert(key, close);
    }
    let history: Vec<PricePoint> = series
        .into_iter()
        .map(|(timestamp, close)| PricePoint { timestamp, close })
        .collect();

    let price =
        json_f64(result, &["meta", "regularMarketPrice"]).or(history.last().map(|p| p.close));
    let Some(price) = price else {
        return Ok(skip(SourceId::Quotes, url, index, "no price and no history"));
    };
    let previous_close = json_f64(result, &["meta", "previousClose"]).or_else(|| {
        history
            .len()
            .checked_sub(2)
            .map(|i| history[i].close)
    });
    let change_percent = previous_close
        .filter(|prev| *prev > 0.0)
        .map(|prev| (price - prev) / prev * 100.0);

    Ok(RecordOutcome::Parsed(QuoteSnapshot {
        label,
        ticker,
        price: Some(price),
        change_percent,
        history,
        market_cap: json_f64(result, &["meta", "marketCap"]),
        beta: json_f64(result, &["meta", "beta"]),
        pe_ratio: json_f64(result, &["meta", "trailingPE"]),
        volume: json_f64(result, &["meta", "regularMarketVolume"]),
    }))
}

#[async_trait]
impl SourceAdapter for QuoteAdapter {
    fn source_id(&self) -> SourceId {
        SourceId::Quotes
    }

    fn targets(&self) -> Vec<FetchTarget> {
        self.instruments
            .iter()
            .map(|i| {
                FetchTarget::new(self.chart_url(&i.ticker))
                    .with_label(i.label.clone())
                    .with_key(i.ticker.clone())
            })
            .collect()
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<RawPayload, AdapterError> {
        fetch_targets(http, ctx, SourceId::Quotes, self.targets(), tolerate_missing_ticker).await
    }

    fn normalize(
        &self,
        payload: &RawPayload,
        _ctx: &AdapterContext,
    ) -> Result<NormalizeReport, AdapterError> {
        ensure_source(SourceId::Quotes, payload)?;
        let trading_dates = self.uses_trading_dates();
        let outcomes = payload
            .pages
            .iter()
            .enumerate()
            .map(|(index, page)| normalize_chart_page(page, index, trading_dates))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(NormalizeReport::from_outcomes(outcomes, CanonicalBatch::Quotes))
    }
}
