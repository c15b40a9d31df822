//! Refresh orchestration: per-source staleness, single-flight refreshes and the
//! runtime wiring (config, roster, adapters) used by the CLI.
//!
//! Each source moves through `Fresh -> Stale -> Refreshing -> {Fresh, RefreshFailed}`.
//! A failed refresh leaves the previous snapshot on disk untouched and the source is
//! picked up again at the next check; there is no backoff and no retry budget.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use dwatch_adapters::{AdapterContext, AdapterError, SourceAdapter};
use dwatch_core::{CanonicalBatch, CompanyRecord, ContractItem, QuoteSnapshot, SourceId};
use dwatch_storage::{HttpFetcher, SnapshotStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod directory;
pub mod reconcile;

pub use config::{
    build_adapter, load_roster, load_source_registry, news_queries, quote_instruments,
    SourceConfig, SourceRegistry, WatchConfig,
};
pub use directory::{filter_companies, sector_counts, CompanyFilter, SectorCount};
pub use reconcile::{
    contributes_to_index, mention_counts, reconcile_contracts, synthetic_index, ContractMatch,
    IndexPoint, MentionCount,
};

pub const CRATE_NAME: &str = "dwatch-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPhase {
    Fresh,
    Stale,
    Refreshing,
    RefreshFailed,
}

impl fmt::Display for RefreshPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RefreshPhase::Fresh => "fresh",
            RefreshPhase::Stale => "stale",
            RefreshPhase::Refreshing => "refreshing",
            RefreshPhase::RefreshFailed => "refresh failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceState {
    pub phase: RefreshPhase,
    pub last_success: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl Default for SourceState {
    fn default() -> Self {
        Self {
            phase: RefreshPhase::Stale,
            last_success: None,
            last_attempt: None,
            last_error: None,
            consecutive_failures: 0,
        }
    }
}

impl SourceState {
    /// Phase as observed at `now`, without applying any transition. Only `Fresh`
    /// decays on its own; every other phase is left by an explicit transition.
    pub fn phase_at(&self, now: DateTime<Utc>, ttl: Duration) -> RefreshPhase {
        match (self.phase, self.last_success) {
            (RefreshPhase::Fresh, Some(at)) if now - at <= ttl => RefreshPhase::Fresh,
            (RefreshPhase::Fresh, _) => RefreshPhase::Stale,
            (phase, _) => phase,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceStatus {
    pub source_id: SourceId,
    pub phase: RefreshPhase,
    pub ttl_secs: i64,
    /// Seconds since the last successful refresh (or snapshot write).
    pub age_secs: Option<i64>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

/// What one successful refresh wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshOutcome {
    pub run_id: Uuid,
    pub source_id: SourceId,
    pub started_at: DateTime<Utc>,
    pub rows: usize,
    pub skipped: usize,
    pub raw_entries: usize,
    /// Upstream was well-formed but empty; an empty snapshot was written.
    pub empty_result: bool,
    pub content_hash: String,
    pub path: PathBuf,
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("source {0} is not configured")]
    NotConfigured(SourceId),
    #[error("a refresh of {0} is already running")]
    AlreadyRefreshing(SourceId),
    #[error("could not refresh {source_id}: {source}")]
    Adapter {
        source_id: SourceId,
        #[source]
        source: AdapterError,
    },
    #[error("could not refresh {source_id}: {source}")]
    Store {
        source_id: SourceId,
        #[source]
        source: StoreError,
    },
}

impl RefreshError {
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            RefreshError::Adapter {
                source: AdapterError::Fetch(_),
                ..
            }
        )
    }
}

pub type PollResult = Vec<(SourceId, Result<RefreshOutcome, RefreshError>)>;

struct SourceEntry {
    adapter: Arc<dyn SourceAdapter>,
    http: HttpFetcher,
    ttl: Duration,
}

pub struct RefreshOrchestrator {
    store: SnapshotStore,
    sources: BTreeMap<SourceId, SourceEntry>,
    states: Mutex<BTreeMap<SourceId, SourceState>>,
}

impl RefreshOrchestrator {
    pub fn new(store: SnapshotStore) -> Self {
        Self {
            store,
            sources: BTreeMap::new(),
            states: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register the adapter for its source. A second adapter for the same source
    /// replaces the first.
    pub fn with_source(
        mut self,
        adapter: Arc<dyn SourceAdapter>,
        http: HttpFetcher,
        ttl: Duration,
    ) -> Self {
        let source_id = adapter.source_id();
        self.sources.insert(source_id, SourceEntry { adapter, http, ttl });
        self.states
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(source_id, SourceState::default());
        self
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn sources(&self) -> impl Iterator<Item = SourceId> + '_ {
        self.sources.keys().copied()
    }

    fn lock_states(&self) -> MutexGuard<'_, BTreeMap<SourceId, SourceState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed each source's last success from its snapshot file, so snapshots written by
    /// an earlier process count as fresh until their TTL runs out.
    pub async fn hydrate(&self) -> Result<(), StoreError> {
        for source_id in self.sources.keys().copied() {
            let Some(written) = self.store.last_written(source_id).await? else {
                continue;
            };
            let mut states = self.lock_states();
            if let Some(state) = states.get_mut(&source_id) {
                if state.last_success.is_none() && state.phase == RefreshPhase::Stale {
                    state.last_success = Some(written);
                    state.phase = RefreshPhase::Fresh;
                }
            }
        }
        Ok(())
    }

    pub fn state(&self, source_id: SourceId) -> Option<SourceState> {
        self.lock_states().get(&source_id).cloned()
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> Vec<SourceStatus> {
        let states = self.lock_states();
        self.sources
            .iter()
            .filter_map(|(source_id, entry)| {
                let state = states.get(source_id)?;
                Some(SourceStatus {
                    source_id: *source_id,
                    phase: state.phase_at(now, entry.ttl),
                    ttl_secs: entry.ttl.num_seconds(),
                    age_secs: state.last_success.map(|at| (now - at).num_seconds()),
                    last_success: state.last_success,
                    last_attempt: state.last_attempt,
                    last_error: state.last_error.clone(),
                    consecutive_failures: state.consecutive_failures,
                })
            })
            .collect()
    }

    /// Apply time-driven transitions for one source and return its phase: an expired
    /// `Fresh` and a `RefreshFailed` both become `Stale`.
    pub fn check_at(&self, source_id: SourceId, now: DateTime<Utc>) -> Option<RefreshPhase> {
        let ttl = self.sources.get(&source_id)?.ttl;
        let mut states = self.lock_states();
        let state = states.get_mut(&source_id)?;
        state.phase = match state.phase_at(now, ttl) {
            RefreshPhase::RefreshFailed => RefreshPhase::Stale,
            phase => phase,
        };
        Some(state.phase)
    }

    pub async fn poll(&self) -> PollResult {
        self.poll_at(Utc::now()).await
    }

    /// Refresh every source that is stale at `now`. One source failing does not stop
    /// the others.
    pub async fn poll_at(&self, now: DateTime<Utc>) -> PollResult {
        let mut results = Vec::new();
        for source_id in self.sources.keys().copied() {
            if self.check_at(source_id, now) == Some(RefreshPhase::Stale) {
                results.push((source_id, self.refresh_at(source_id, now).await));
            }
        }
        results
    }

    /// Poll a single source: refresh it only if it is stale.
    pub async fn poll_source_at(
        &self,
        source_id: SourceId,
        now: DateTime<Utc>,
    ) -> Option<Result<RefreshOutcome, RefreshError>> {
        match self.check_at(source_id, now) {
            None => Some(Err(RefreshError::NotConfigured(source_id))),
            Some(RefreshPhase::Stale) => Some(self.refresh_at(source_id, now).await),
            Some(_) => None,
        }
    }

    /// Refresh regardless of age. Still single-flight per source.
    pub async fn refresh(&self, source_id: SourceId) -> Result<RefreshOutcome, RefreshError> {
        self.refresh_at(source_id, Utc::now()).await
    }

    pub async fn refresh_at(
        &self,
        source_id: SourceId,
        now: DateTime<Utc>,
    ) -> Result<RefreshOutcome, RefreshError> {
        let entry = self
            .sources
            .get(&source_id)
            .ok_or(RefreshError::NotConfigured(source_id))?;
        let in_flight = self.begin(source_id, now)?;

        let ctx = AdapterContext::new(now);
        let span = info_span!("refresh", %source_id, run_id = %ctx.run_id);
        match self.run_refresh(source_id, entry, &ctx).instrument(span).await {
            Ok(outcome) => {
                in_flight.succeed(now);
                info!(
                    %source_id,
                    run_id = %outcome.run_id,
                    rows = outcome.rows,
                    skipped = outcome.skipped,
                    content_hash = %outcome.content_hash,
                    "snapshot refreshed"
                );
                Ok(outcome)
            }
            Err(err) => {
                warn!(
                    %source_id,
                    run_id = %ctx.run_id,
                    error = %err,
                    "refresh failed; keeping previous snapshot"
                );
                in_flight.fail(err.to_string());
                Err(err)
            }
        }
    }

    pub async fn load(&self, source_id: SourceId) -> Result<CanonicalBatch, StoreError> {
        self.store.load_batch(source_id).await
    }

    fn begin(
        &self,
        source_id: SourceId,
        now: DateTime<Utc>,
    ) -> Result<InFlight<'_>, RefreshError> {
        let mut states = self.lock_states();
        let state = states.entry(source_id).or_default();
        if state.phase == RefreshPhase::Refreshing {
            return Err(RefreshError::AlreadyRefreshing(source_id));
        }
        state.phase = RefreshPhase::Refreshing;
        state.last_attempt = Some(now);
        Ok(InFlight {
            orchestrator: self,
            source_id,
            settled: false,
        })
    }

    async fn run_refresh(
        &self,
        source_id: SourceId,
        entry: &SourceEntry,
        ctx: &AdapterContext,
    ) -> Result<RefreshOutcome, RefreshError> {
        let adapter_err = |source| RefreshError::Adapter { source_id, source };

        let payload = entry.adapter.fetch(&entry.http, ctx).await.map_err(adapter_err)?;
        let report = entry.adapter.normalize(&payload, ctx).map_err(adapter_err)?;
        let found = report.batch.source_id();
        if found != source_id {
            return Err(adapter_err(AdapterError::SourceMismatch {
                expected: source_id,
                found,
            }));
        }

        for skipped in &report.skipped {
            warn!(
                index = skipped.index,
                url = %skipped.url,
                reason = %skipped.reason,
                "upstream record skipped"
            );
        }
        if report.is_empty_result() {
            info!("upstream returned no records; writing an empty snapshot");
        }

        let stored = self
            .store
            .save_batch(&report.batch)
            .await
            .map_err(|source| RefreshError::Store { source_id, source })?;

        Ok(RefreshOutcome {
            run_id: ctx.run_id,
            source_id,
            started_at: ctx.fetched_at,
            rows: stored.rows,
            skipped: report.skipped.len(),
            raw_entries: report.raw_entries,
            empty_result: report.is_empty_result(),
            content_hash: stored.content_hash,
            path: stored.path,
        })
    }
}

/// Holds a source in `Refreshing`. Dropping it without settling (the refresh future
/// was cancelled) marks the source failed so it is not stuck.
struct InFlight<'a> {
    orchestrator: &'a RefreshOrchestrator,
    source_id: SourceId,
    settled: bool,
}

impl InFlight<'_> {
    fn succeed(mut self, at: DateTime<Utc>) {
        self.settle(|state| {
            state.phase = RefreshPhase::Fresh;
            state.last_success = Some(at);
            state.last_error = None;
            state.consecutive_failures = 0;
        });
    }

    fn fail(mut self, error: String) {
        self.settle(|state| {
            state.phase = RefreshPhase::RefreshFailed;
            state.last_error = Some(error);
            state.consecutive_failures += 1;
        });
    }

    fn settle(&mut self, apply: impl FnOnce(&mut SourceState)) {
        self.settled = true;
        if let Some(state) = self.orchestrator.lock_states().get_mut(&self.source_id) {
            apply(state);
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        warn!(source_id = %self.source_id, "refresh abandoned before completion");
        self.settle(|state| {
            state.phase = RefreshPhase::RefreshFailed;
            state.last_error = Some("refresh abandoned before completion".to_string());
            state.consecutive_failures += 1;
        });
    }
}

/// Everything the CLI needs: settings, registry, roster, and an orchestrator over
/// the enabled sources with snapshot ages already hydrated.
pub struct WatchRuntime {
    pub config: WatchConfig,
    pub registry: SourceRegistry,
    pub roster: Vec<CompanyRecord>,
    pub orchestrator: RefreshOrchestrator,
}

impl WatchRuntime {
    pub async fn from_env() -> Result<Self> {
        Self::from_config(WatchConfig::from_env()).await
    }

    pub async fn from_config(config: WatchConfig) -> Result<Self> {
        let registry = load_source_registry(&config.sources_path).await?;
        let store = SnapshotStore::new(config.data_dir.clone());
        let roster = load_roster(&store, &config.companies_path).await?;

        let mut orchestrator = RefreshOrchestrator::new(store);
        for source in registry.enabled() {
            let http = HttpFetcher::new(config.http_client_config(source))
                .with_context(|| format!("building http client for {}", source.source_id))?;
            let adapter = build_adapter(source, &roster);
            orchestrator = orchestrator.with_source(adapter, http, source.ttl());
        }
        orchestrator
            .hydrate()
            .await
            .context("reading snapshot modification times")?;

        Ok(Self {
            config,
            registry,
            roster,
            orchestrator,
        })
    }

    pub async fn contracts(&self) -> Result<Vec<ContractItem>, StoreError> {
        self.orchestrator.store().load().await
    }

    pub async fn quotes(&self) -> Result<Vec<QuoteSnapshot>, StoreError> {
        self.orchestrator.store().load_quotes().await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use dwatch_adapters::{
        quotes, ContractsAdapter, FetchTarget, FetchedPage, Instrument, NormalizeReport,
        QuoteAdapter, RawPayload,
    };
    use dwatch_storage::{FetchError, HttpClientConfig};
    use tokio::sync::Notify;

    use super::*;

    const TTL_SECS: i64 = 300;

    enum Step {
        Body(String),
        Network,
        Gated(Arc<Notify>, String),
        Hang,
    }

    /// A real adapter behind a scripted transport: each fetch consumes one step and
    /// hands the body for the first target to the real normalizer.
    struct ScriptedSource {
        inner: Arc<dyn SourceAdapter>,
        script: std::sync::Mutex<VecDeque<Step>>,
        fetches: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(inner: Arc<dyn SourceAdapter>, steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                inner,
                script: std::sync::Mutex::new(steps.into()),
                fetches: AtomicUsize::new(0),
            })
        }

        fn contracts(steps: Vec<Step>) -> Arc<Self> {
            Self::new(Arc::new(ContractsAdapter::rss()), steps)
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SourceAdapter for ScriptedSource {
        fn source_id(&self) -> SourceId {
            self.inner.source_id()
        }

        fn targets(&self) -> Vec<FetchTarget> {
            self.inner.targets()
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            ctx: &AdapterContext,
        ) -> Result<RawPayload, AdapterError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let step = self.script.lock().unwrap().pop_front().expect("script exhausted");
            let body = match step {
                Step::Body(body) => body,
                Step::Network => {
                    return Err(AdapterError::Fetch(FetchError::HttpStatus {
                        status: 503,
                        url: self.targets().remove(0).url,
                    }))
                }
                Step::Gated(gate, body) => {
                    gate.notified().await;
                    body
                }
                Step::Hang => std::future::pending().await,
            };
            let target = self.targets().remove(0);
            Ok(RawPayload {
                source_id: self.source_id(),
                pages: vec![FetchedPage::from_body(target, body, ctx.fetched_at)],
            })
        }

        fn normalize(
            &self,
            payload: &RawPayload,
            ctx: &AdapterContext,
        ) -> Result<NormalizeReport, AdapterError> {
            self.inner.normalize(payload, ctx)
        }
    }

    fn fixture(relative: &str) -> String {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures")
            .join(relative);
        std::fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }

    fn feed() -> String {
        fixture("contracts/defense_gov.rss")
    }

    fn one_item_feed(title: &str) -> String {
        format!(
            "<rss><channel><item><title>{title}</title><link>/c/1</link>\
             <description>Boeing awarded $200 million contract</description></item></channel></rss>"
        )
    }

    fn orchestrator(dir: &std::path::Path, adapter: Arc<ScriptedSource>) -> RefreshOrchestrator {
        RefreshOrchestrator::new(SnapshotStore::new(dir)).with_source(
            adapter,
            HttpFetcher::new(HttpClientConfig::default()).unwrap(),
            Duration::seconds(TTL_SECS),
        )
    }

    async fn contracts(orch: &RefreshOrchestrator) -> Vec<ContractItem> {
        match orch.load(SourceId::Contracts).await.unwrap() {
            CanonicalBatch::Contracts(items) => items,
            other => panic!("expected contracts, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn successful_refresh_writes_snapshot_and_marks_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = ScriptedSource::contracts(vec![Step::Body(feed())]);
        let orch = orchestrator(dir.path(), adapter.clone());
        let now = Utc::now();

        let outcome = orch.refresh_at(SourceId::Contracts, now).await.unwrap();
        assert_eq!(outcome.rows, 3);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.raw_entries, 4);
        assert!(!outcome.empty_result);
        assert_eq!(outcome.content_hash.len(), 64);
        assert!(outcome.path.ends_with("contracts.csv"));

        let state = orch.state(SourceId::Contracts).unwrap();
        assert_eq!(state.phase, RefreshPhase::Fresh);
        assert_eq!(state.last_success, Some(now));
        assert_eq!(contracts(&orch).await.len(), 3);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_snapshot_and_retries_next_poll() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = ScriptedSource::contracts(vec![
            Step::Body(feed()),
            Step::Network,
            Step::Body(one_item_feed("Contracts For Oct. 15, 2026")),
        ]);
        let orch = orchestrator(dir.path(), adapter.clone());
        let t0 = Utc::now();

        orch.refresh_at(SourceId::Contracts, t0).await.unwrap();
        let before = contracts(&orch).await;

        let t1 = t0 + Duration::seconds(TTL_SECS + 1);
        let polled = orch.poll_at(t1).await;
        assert_eq!(polled.len(), 1);
        let err = polled[0].1.as_ref().unwrap_err();
        assert!(err.is_network());
        assert!(err.to_string().contains("503"));

        let state = orch.state(SourceId::Contracts).unwrap();
        assert_eq!(state.phase, RefreshPhase::RefreshFailed);
        assert_eq!(state.consecutive_failures, 1);
        assert_eq!(state.last_success, Some(t0));
        assert_eq!(contracts(&orch).await, before);

        // Next check: failed -> stale -> refreshed.
        assert_eq!(orch.check_at(SourceId::Contracts, t1), Some(RefreshPhase::Stale));
        let polled = orch.poll_at(t1).await;
        let outcome = polled[0].1.as_ref().unwrap();
        assert_eq!(outcome.rows, 1);
        assert_eq!(adapter.fetches(), 3);

        let state = orch.state(SourceId::Contracts).unwrap();
        assert_eq!(state.phase, RefreshPhase::Fresh);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.last_error, None);
        assert_eq!(contracts(&orch).await[0].summary, "Boeing awarded $200 million contract");
    }

    #[tokio::test]
    async fn fresh_sources_are_not_polled_until_ttl_expires() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = ScriptedSource::contracts(vec![Step::Body(feed()), Step::Body(feed())]);
        let orch = orchestrator(dir.path(), adapter.clone());
        let t0 = Utc::now();

        // Never refreshed: stale from the start.
        assert_eq!(orch.poll_at(t0).await.len(), 1);
        assert!(orch.poll_at(t0 + Duration::seconds(60)).await.is_empty());
        assert!(orch.poll_at(t0 + Duration::seconds(TTL_SECS)).await.is_empty());
        assert_eq!(adapter.fetches(), 1);

        let polled = orch.poll_at(t0 + Duration::seconds(TTL_SECS + 1)).await;
        assert!(polled[0].1.is_ok());
        assert_eq!(adapter.fetches(), 2);
    }

    #[tokio::test]
    async fn forced_refresh_ignores_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = ScriptedSource::contracts(vec![Step::Body(feed()), Step::Body(feed())]);
        let orch = orchestrator(dir.path(), adapter.clone());
        let t0 = Utc::now();

        orch.refresh_at(SourceId::Contracts, t0).await.unwrap();
        assert!(orch
            .poll_source_at(SourceId::Contracts, t0 + Duration::seconds(1))
            .await
            .is_none());
        orch.refresh_at(SourceId::Contracts, t0 + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(adapter.fetches(), 2);
    }

    #[tokio::test]
    async fn empty_upstream_writes_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = ScriptedSource::contracts(vec![
            Step::Body(feed()),
            Step::Body("<rss><channel><title>Contracts</title></channel></rss>".to_string()),
        ]);
        let orch = orchestrator(dir.path(), adapter);
        let now = Utc::now();
        orch.refresh_at(SourceId::Contracts, now).await.unwrap();

        let outcome = orch.refresh_at(SourceId::Contracts, now).await.unwrap();
        assert!(outcome.empty_result);
        assert_eq!(outcome.rows, 0);
        assert!(contracts(&orch).await.is_empty());
        assert_eq!(orch.state(SourceId::Contracts).unwrap().phase, RefreshPhase::Fresh);
    }

    #[tokio::test]
    async fn unreadable_payload_fails_without_touching_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = ScriptedSource::contracts(vec![
            Step::Body(feed()),
            Step::Body("<html><body>Access Denied</body></html>".to_string()),
        ]);
        let orch = orchestrator(dir.path(), adapter);
        let now = Utc::now();
        orch.refresh_at(SourceId::Contracts, now).await.unwrap();
        let before = contracts(&orch).await;

        let err = orch.refresh_at(SourceId::Contracts, now).await.unwrap_err();
        assert!(matches!(
            err,
            RefreshError::Adapter {
                source: AdapterError::Payload { .. },
                ..
            }
        ));
        assert!(!err.is_network());
        assert_eq!(contracts(&orch).await, before);
    }

    #[tokio::test]
    async fn failed_quotes_refresh_keeps_previous_history() {
        let dir = tempfile::tempdir().unwrap();
        let lmt = QuoteAdapter::new(
            quotes::DEFAULT_CHART_URL_TEMPLATE,
            quotes::DEFAULT_RANGE,
            quotes::DEFAULT_INTERVAL,
            vec![Instrument {
                label: "Lockheed Martin".to_string(),
                ticker: "LMT".to_string(),
            }],
        );
        let adapter = ScriptedSource::new(
            Arc::new(lmt),
            vec![Step::Body(fixture("quotes/lmt_chart.json")), Step::Network],
        );
        let orch = orchestrator(dir.path(), adapter);
        let t0 = Utc::now();

        orch.refresh_at(SourceId::Quotes, t0).await.unwrap();
        let before = orch.load(SourceId::Quotes).await.unwrap();
        let CanonicalBatch::Quotes(quotes_before) = &before else {
            panic!("expected quotes, got {before:?}");
        };
        assert_eq!(quotes_before.len(), 1);
        assert_eq!(quotes_before[0].ticker, "LMT");
        assert_eq!(quotes_before[0].history.len(), 3);

        let err = orch
            .refresh_at(SourceId::Quotes, t0 + Duration::seconds(TTL_SECS + 1))
            .await
            .unwrap_err();
        assert!(err.is_network());
        assert_eq!(
            orch.state(SourceId::Quotes).unwrap().phase,
            RefreshPhase::RefreshFailed
        );
        assert_eq!(orch.load(SourceId::Quotes).await.unwrap(), before);
    }

    #[tokio::test]
    async fn store_failure_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("data");
        std::fs::write(&blocker, "not a directory").unwrap();
        let adapter = ScriptedSource::contracts(vec![Step::Body(feed())]);
        let orch = orchestrator(&blocker, adapter);

        let err = orch.refresh(SourceId::Contracts).await.unwrap_err();
        assert!(matches!(err, RefreshError::Store { .. }));
        assert_eq!(
            orch.state(SourceId::Contracts).unwrap().phase,
            RefreshPhase::RefreshFailed
        );
    }

    #[tokio::test]
    async fn empty_store_loads_empty_contracts() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path(), ScriptedSource::contracts(vec![]));
        assert!(contracts(&orch).await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_refresh_of_same_source_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let adapter = ScriptedSource::contracts(vec![Step::Gated(gate.clone(), feed())]);
        let orch = orchestrator(dir.path(), adapter.clone());
        let now = Utc::now();

        let (first, second) = tokio::join!(orch.refresh_at(SourceId::Contracts, now), async {
            let second = orch.refresh_at(SourceId::Contracts, now).await;
            gate.notify_one();
            second
        });

        assert_eq!(first.unwrap().rows, 3);
        assert!(matches!(second, Err(RefreshError::AlreadyRefreshing(SourceId::Contracts))));
        assert_eq!(adapter.fetches(), 1);
    }

    #[tokio::test]
    async fn abandoned_refresh_does_not_stay_refreshing() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = ScriptedSource::contracts(vec![Step::Hang, Step::Body(feed())]);
        let orch = orchestrator(dir.path(), adapter);
        let now = Utc::now();

        let timed_out = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            orch.refresh_at(SourceId::Contracts, now),
        )
        .await;
        assert!(timed_out.is_err());

        let state = orch.state(SourceId::Contracts).unwrap();
        assert_eq!(state.phase, RefreshPhase::RefreshFailed);
        assert!(state.last_error.unwrap().contains("abandoned"));

        assert!(orch.refresh_at(SourceId::Contracts, now).await.is_ok());
    }

    #[tokio::test]
    async fn hydrate_treats_recent_snapshot_as_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        store
            .save(&[ContractItem {
                date: "2026-10-13".to_string(),
                title: "Contracts For Oct. 13, 2026".to_string(),
                summary: String::new(),
                link: "https://www.defense.gov/c/1".to_string(),
            }])
            .await
            .unwrap();

        let orch = orchestrator(dir.path(), ScriptedSource::contracts(vec![]));
        orch.hydrate().await.unwrap();

        let now = Utc::now();
        assert!(orch.poll_at(now).await.is_empty());
        let status = orch.status_at(now);
        assert_eq!(status[0].phase, RefreshPhase::Fresh);
        assert_eq!(status[0].ttl_secs, TTL_SECS);
        assert!(status[0].age_secs.is_some_and(|age| (0..TTL_SECS).contains(&age)));

        let later = now + Duration::seconds(TTL_SECS + 5);
        assert_eq!(orch.status_at(later)[0].phase, RefreshPhase::Stale);
    }

    #[tokio::test]
    async fn unregistered_source_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path(), ScriptedSource::contracts(vec![]));
        assert!(matches!(
            orch.refresh(SourceId::Quotes).await,
            Err(RefreshError::NotConfigured(SourceId::Quotes))
        ));
        assert!(matches!(
            orch.poll_source_at(SourceId::News, Utc::now()).await,
            Some(Err(RefreshError::NotConfigured(SourceId::News)))
        ));
        assert_eq!(orch.sources().collect::<Vec<_>>(), vec![SourceId::Contracts]);
    }

    #[tokio::test]
    async fn runtime_wires_enabled_sources_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let sources_path = dir.path().join("sources.yaml");
        std::fs::write(
            &sources_path,
            "sources:\n  - {source_id: contracts, ttl_secs: 300}\n  - {source_id: quotes, ttl_secs: 900, enabled: false}\n",
        )
        .unwrap();
        let companies_path = dir.path().join("companies.csv");
        std::fs::write(
            &companies_path,
            "name,country,sector,ticker\nBoeing,USA,Aerospace,BA\nAnduril Industries,USA,Autonomous Systems,not public\n",
        )
        .unwrap();

        let runtime = WatchRuntime::from_config(WatchConfig {
            workspace_root: dir.path().to_path_buf(),
            data_dir: dir.path().join("data"),
            companies_path,
            sources_path,
            user_agent: "dwatch-test".to_string(),
            http_timeout_secs: 2,
        })
        .await
        .unwrap();

        assert_eq!(runtime.roster.len(), 2);
        assert_eq!(
            runtime.orchestrator.sources().collect::<Vec<_>>(),
            vec![SourceId::Contracts]
        );
        assert!(runtime.contracts().await.unwrap().is_empty());
        assert!(runtime.quotes().await.unwrap().is_empty());
    }
}
