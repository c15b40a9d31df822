use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use dwatch_core::{CanonicalBatch, SourceId, NOT_PUBLIC};
use dwatch_sync::{
    contributes_to_index, filter_companies, mention_counts, reconcile_contracts, sector_counts,
    synthetic_index, CompanyFilter, RefreshError, RefreshOutcome, WatchRuntime,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "dwatch")]
#[command(about = "Defense Watch: refresh and inspect defense-industry snapshots")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Refresh stale sources (or one source), keeping the last snapshot on failure.
    Refresh {
        #[arg(long)]
        source: Option<SourceId>,
        /// Refresh even if the snapshot is still fresh.
        #[arg(long)]
        force: bool,
    },
    /// Print the current snapshot of a source.
    Show {
        source: SourceId,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Tracked companies named in recent contract announcements.
    Alerts,
    /// The company roster, optionally filtered, with a per-sector count.
    Companies {
        #[arg(long = "sector")]
        sectors: Vec<String>,
        #[arg(long = "country")]
        countries: Vec<String>,
    },
    /// Equal-weighted index over the quotes snapshot.
    Index {
        #[arg(long = "ticker")]
        tickers: Vec<String>,
    },
    /// Per-source refresh phase and snapshot age.
    Status,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dwatch=info,warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let runtime = WatchRuntime::from_env()
        .await
        .context("loading Defense Watch configuration")?;

    match cli.command.unwrap_or(Commands::Refresh {
        source: None,
        force: false,
    }) {
        Commands::Refresh { source, force } => refresh(&runtime, source, force).await,
        Commands::Show { source, limit } => show(&runtime, source, limit).await?,
        Commands::Alerts => alerts(&runtime).await?,
        Commands::Companies { sectors, countries } => companies(&runtime, sectors, countries),
        Commands::Index { tickers } => index(&runtime, &tickers).await?,
        Commands::Status => status(&runtime),
    }

    Ok(())
}

async fn refresh(runtime: &WatchRuntime, source: Option<SourceId>, force: bool) {
    let orchestrator = &runtime.orchestrator;
    let now = Utc::now();
    let results = match (source, force) {
        (Some(source_id), true) => {
            vec![(source_id, orchestrator.refresh_at(source_id, now).await)]
        }
        (Some(source_id), false) => match orchestrator.poll_source_at(source_id, now).await {
            Some(result) => vec![(source_id, result)],
            None => Vec::new(),
        },
        (None, true) => {
            let mut results = Vec::new();
            for source_id in orchestrator.sources().collect::<Vec<_>>() {
                results.push((source_id, orchestrator.refresh_at(source_id, now).await));
            }
            results
        }
        (None, false) => orchestrator.poll_at(now).await,
    };

    if results.is_empty() {
        println!("all snapshots are fresh; nothing to refresh (use --force to refetch)");
    }
    for (source_id, result) in results {
        print_refresh(source_id, &result);
    }
}

fn print_refresh(source_id: SourceId, result: &Result<RefreshOutcome, RefreshError>) {
    match result {
        Ok(outcome) => {
            let hash = outcome.content_hash.get(..12).unwrap_or(&outcome.content_hash);
            println!(
                "refreshed {source_id}: rows={} skipped={} raw={} hash={hash} run_id={}",
                outcome.rows, outcome.skipped, outcome.raw_entries, outcome.run_id
            );
            if outcome.empty_result {
                println!("  upstream returned no records; snapshot is now empty");
            }
        }
        Err(err) => println!("could not refresh {source_id}: {err} (last snapshot kept)"),
    }
}

async fn show(runtime: &WatchRuntime, source: SourceId, limit: Option<usize>) -> Result<()> {
    let batch = runtime
        .orchestrator
        .load(source)
        .await
        .with_context(|| format!("loading {source} snapshot"))?;
    let limit = limit.unwrap_or(usize::MAX);
    if batch.is_empty() {
        println!("no {source} data available");
        return Ok(());
    }

    match batch {
        CanonicalBatch::News(items) => {
            for item in items.iter().take(limit) {
                println!(
                    "[{}] {} | {}\n    {}",
                    item.company, item.published, item.title, item.link
                );
            }
        }
        CanonicalBatch::Contracts(items) => {
            for item in items.iter().take(limit) {
                println!(
                    "{} | {}\n    {}\n    {}",
                    item.date, item.title, item.link, item.summary
                );
            }
        }
        CanonicalBatch::Quotes(quotes) => {
            for quote in quotes.iter().take(limit) {
                let price = quote
                    .price
                    .map(|p| format!("{p:.2}"))
                    .unwrap_or_else(|| "-".to_string());
                let change = quote
                    .change_percent
                    .map(|c| format!("{c:+.2}%"))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<28} {:<10} {:>10} {:>8}  {} closes",
                    quote.label,
                    quote.ticker,
                    price,
                    change,
                    quote.history.len()
                );
            }
        }
    }
    Ok(())
}

async fn alerts(runtime: &WatchRuntime) -> Result<()> {
    let contracts = runtime.contracts().await.context("loading contracts snapshot")?;
    if contracts.is_empty() {
        println!("no contract data available");
        return Ok(());
    }

    let matches = reconcile_contracts(&contracts, &runtime.roster);
    if matches.is_empty() {
        println!("no tracked companies found in recent contracts");
    } else {
        println!("tracked companies mentioned in {} contract(s):", matches.len());
        for m in &matches {
            println!("  {} | {} [{}]", m.contract.date, m.contract.title, m.companies.join(", "));
        }
    }

    let mut counts: Vec<_> = mention_counts(&contracts, &runtime.roster)
        .into_iter()
        .filter(|c| c.mentions > 0)
        .collect();
    counts.sort_by(|a, b| b.mentions.cmp(&a.mentions));
    if !counts.is_empty() {
        println!("mentions:");
        for count in counts {
            println!("  {:<28} {}", count.company, count.mentions);
        }
    }
    Ok(())
}

async fn index(runtime: &WatchRuntime, tickers: &[String]) -> Result<()> {
    let mut quotes = runtime.quotes().await.context("loading quotes snapshot")?;
    if !tickers.is_empty() {
        quotes.retain(|q| tickers.iter().any(|t| t.trim().eq_ignore_ascii_case(&q.ticker)));
    }

    let points = synthetic_index(&quotes);
    if points.is_empty() {
        println!("no price history available for an index");
        return Ok(());
    }
    let contributing = quotes.iter().filter(|q| contributes_to_index(q)).count();
    println!("equal-weighted index over {contributing} series (base 100):");
    for point in points {
        println!("  {}  {:>8.2}", point.timestamp.format("%Y-%m-%d"), point.value);
    }
    Ok(())
}

fn status(runtime: &WatchRuntime) {
    let statuses = runtime.orchestrator.status_at(Utc::now());
    if statuses.is_empty() {
        println!("no sources enabled");
    }
    for s in statuses {
        let age = s.age_secs.map(format_age).unwrap_or_else(|| "never".to_string());
        let name = runtime
            .registry
            .get(s.source_id)
            .and_then(|c| c.display_name.as_deref())
            .unwrap_or_default();
        println!(
            "{:<10} {:<15} age={:<8} ttl={:<6} {name}",
            s.source_id.as_str(),
            s.phase.to_string(),
            age,
            format_age(s.ttl_secs)
        );
        if let Some(error) = s.last_error {
            println!("  last error ({} in a row): {error}", s.consecutive_failures);
        }
    }
}

fn companies(runtime: &WatchRuntime, sectors: Vec<String>, countries: Vec<String>) {
    let filter = CompanyFilter { sectors, countries };
    let companies = filter_companies(&runtime.roster, &filter);
    if companies.is_empty() {
        println!("no companies match");
        return;
    }

    for company in &companies {
        println!(
            "{:<28} {:<16} {:<30} {}",
            company.name,
            company.country,
            company.sector,
            company.ticker.as_deref().unwrap_or(NOT_PUBLIC)
        );
    }
    println!("{} companies by sector:", companies.len());
    for count in sector_counts(&companies) {
        println!("  {:<30} {}", count.sector, count.companies);
    }
}

fn format_age(secs: i64) -> String {
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h{}m", s / 3600, (s % 3600) / 60),
        s => format!("{}d", s / 86_400),
    }
}
