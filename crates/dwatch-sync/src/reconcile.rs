//! Cross-source views: tracked companies named in contract announcements, and an
//! equal-weighted index over quote histories.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use dwatch_core::{CompanyRecord, ContractItem, QuoteSnapshot};
use serde::Serialize;

/// Base value every contributing series is rescaled to at its first point.
pub const INDEX_BASE: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContractMatch {
    pub contract: ContractItem,
    /// Roster names found in the summary, in roster order.
    pub companies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MentionCount {
    pub company: String,
    pub mentions: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IndexPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

// Lowercased, de-duplicated, non-blank names paired with their display form.
fn tracked_names(companies: &[CompanyRecord]) -> Vec<(String, String)> {
    let mut seen = BTreeSet::new();
    companies
        .iter()
        .filter_map(|c| {
            let name = c.name.trim();
            let needle = name.to_lowercase();
            if needle.is_empty() || !seen.insert(needle.clone()) {
                return None;
            }
            Some((needle, name.to_string()))
        })
        .collect()
}

/// Contracts whose summary mentions a tracked company (case-insensitive substring).
/// Output keeps contract order; contracts with no mention are left out.
pub fn reconcile_contracts(
    contracts: &[ContractItem],
    companies: &[CompanyRecord],
) -> Vec<ContractMatch> {
    let names = tracked_names(companies);
    contracts
        .iter()
        .filter_map(|contract| {
            let summary = contract.summary.to_lowercase();
            let matched: Vec<String> = names
                .iter()
                .filter(|(needle, _)| summary.contains(needle.as_str()))
                .map(|(_, name)| name.clone())
                .collect();
            (!matched.is_empty()).then(|| ContractMatch {
                contract: contract.clone(),
                companies: matched,
            })
        })
        .collect()
}

/// Number of contract summaries mentioning each tracked company, in roster order.
pub fn mention_counts(
    contracts: &[ContractItem],
    companies: &[CompanyRecord],
) -> Vec<MentionCount> {
    let summaries: Vec<String> = contracts.iter().map(|c| c.summary.to_lowercase()).collect();
    tracked_names(companies)
        .into_iter()
        .map(|(needle, company)| MentionCount {
            mentions: summaries.iter().filter(|s| s.contains(&needle)).count(),
            company,
        })
        .collect()
}

/// Equal-weighted index of the given quote histories.
///
/// Each history is sorted and rescaled to [`INDEX_BASE`] at its first close. The
/// timeline is the union of all timestamps; every series is forward-filled across it
/// and a timestamp is kept only when all series have a value there (so nothing before
/// the latest series start survives). The value is the arithmetic mean. Histories that
/// are empty or start at a non-positive close cannot be rescaled and do not contribute.
pub fn synthetic_index(quotes: &[QuoteSnapshot]) -> Vec<IndexPoint> {
    let series: Vec<Vec<(DateTime<Utc>, f64)>> = quotes.iter().filter_map(rescaled).collect();
    if series.is_empty() {
        return Vec::new();
    }

    let timeline: BTreeSet<DateTime<Utc>> = series
        .iter()
        .flat_map(|s| s.iter().map(|(ts, _)| *ts))
        .collect();

    let mut cursors = vec![0usize; series.len()];
    let mut carried: Vec<Option<f64>> = vec![None; series.len()];
    let mut points = Vec::new();

    for ts in timeline {
        for (i, points_of) in series.iter().enumerate() {
            while cursors[i] < points_of.len() && points_of[cursors[i]].0 <= ts {
                carried[i] = Some(points_of[cursors[i]].1);
                cursors[i] += 1;
            }
        }
        let Some(mut values) = carried.iter().copied().collect::<Option<Vec<f64>>>() else {
            continue;
        };
        // Summation order fixed by value, so the result does not depend on input order.
        values.sort_by(f64::total_cmp);
        let value = values.iter().sum::<f64>() / values.len() as f64;
        points.push(IndexPoint { timestamp: ts, value });
    }
    points
}

/// Whether `quote` has a history [`synthetic_index`] can rescale.
pub fn contributes_to_index(quote: &QuoteSnapshot) -> bool {
    rescaled(quote).is_some()
}

fn rescaled(quote: &QuoteSnapshot) -> Option<Vec<(DateTime<Utc>, f64)>> {
    let mut history: Vec<(DateTime<Utc>, f64)> = quote
        .history
        .iter()
        .filter(|p| p.close.is_finite())
        .map(|p| (p.timestamp, p.close))
        .collect();
    history.sort_by_key(|(ts, _)| *ts);
    let base = history.first()?.1;
    if base <= 0.0 {
        return None;
    }
    Some(
        history
            .into_iter()
            .map(|(ts, close)| (ts, close * INDEX_BASE / base))
            .collect(),
    )
}
