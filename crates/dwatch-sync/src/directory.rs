//! Company directory: the tracked roster filtered by sector and country, plus the
//! per-sector breakdown of whatever the filter kept.

use dwatch_core::CompanyRecord;
use serde::Serialize;

/// Empty lists accept everything. Values match case-insensitively, and a company
/// passes a list when it equals any entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompanyFilter {
    pub sectors: Vec<String>,
    pub countries: Vec<String>,
}

impl CompanyFilter {
    pub fn matches(&self, company: &CompanyRecord) -> bool {
        any_of(&self.sectors, &company.sector) && any_of(&self.countries, &company.country)
    }
}

fn any_of(wanted: &[String], value: &str) -> bool {
    let value = value.trim();
    wanted.is_empty() || wanted.iter().any(|w| w.trim().eq_ignore_ascii_case(value))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectorCount {
    pub sector: String,
    pub companies: usize,
}

/// Roster entries passing `filter`, in roster order.
pub fn filter_companies<'a>(
    roster: &'a [CompanyRecord],
    filter: &CompanyFilter,
) -> Vec<&'a CompanyRecord> {
    roster.iter().filter(|c| filter.matches(c)).collect()
}

/// Companies per sector, largest first; equal counts keep first-seen order.
pub fn sector_counts(companies: &[&CompanyRecord]) -> Vec<SectorCount> {
    let mut counts: Vec<SectorCount> = Vec::new();
    for company in companies {
        let sector = company.sector.trim();
        match counts.iter_mut().find(|c| c.sector == sector) {
            Some(count) => count.companies += 1,
            None => counts.push(SectorCount {
                sector: sector.to_string(),
                companies: 1,
            }),
        }
    }
    counts.sort_by(|a, b| b.companies.cmp(&a.companies));
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn company(name: &str, country: &str, sector: &str) -> CompanyRecord {
        CompanyRecord {
            name: name.to_string(),
            country: country.to_string(),
            sector: sector.to_string(),
            ticker: None,
        }
    }

    fn roster() -> Vec<CompanyRecord> {
        vec![
            company("Lockheed Martin", "USA", "Aerospace & Defense"),
            company("Airbus", "France", "Aerospace"),
            company("Thales", "France", "Defense Electronics"),
            company("Saab", "Sweden", "Aerospace & Defense"),
            company("Dassault Aviation", "France", "Aerospace"),
            company("Northrop Grumman", "USA", "Aerospace & Defense"),
        ]
    }

    fn names(companies: &[&CompanyRecord]) -> Vec<String> {
        companies.iter().map(|c| c.name.clone()).collect()
    }

    #[test]
    fn empty_filter_keeps_the_whole_roster() {
        let roster = roster();
        assert_eq!(filter_companies(&roster, &CompanyFilter::default()).len(), 6);
    }

    #[test]
    fn sector_and_country_filters_combine() {
        let roster = roster();
        let filter = CompanyFilter {
            sectors: vec!["aerospace".to_string(), "Defense Electronics".to_string()],
            countries: vec![" FRANCE ".to_string()],
        };
        assert_eq!(
            names(&filter_companies(&roster, &filter)),
            vec!["Airbus", "Thales", "Dassault Aviation"]
        );

        let nothing = CompanyFilter {
            countries: vec!["Norway".to_string()],
            ..Default::default()
        };
        assert!(filter_companies(&roster, &nothing).is_empty());
    }

    #[test]
    fn sectors_are_counted_largest_first() {
        let roster = roster();
        let all = filter_companies(&roster, &CompanyFilter::default());
        assert_eq!(
            sector_counts(&all),
            vec![
                SectorCount { sector: "Aerospace & Defense".to_string(), companies: 3 },
                SectorCount { sector: "Aerospace".to_string(), companies: 2 },
                SectorCount { sector: "Defense Electronics".to_string(), companies: 1 },
            ]
        );
        assert!(sector_counts(&[]).is_empty());
    }
}
