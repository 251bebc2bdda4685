//! One scrape/merge run, from configuration to summary.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use mps_adapters::{
    parse_listing, ChromiumOptions, ChromiumPage, Credentials, ListingSource, MerPubNavigator, NavigatorConfig,
    SearchParams,
};
use mps_core::RawArtifactBundle;
use mps_storage::{ArtifactCache, DirDumpSink};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::acquisition::{Acquisition, AcquisitionEvent, AcquisitionRequest};
use crate::store::{BidStore, MergeOutcome};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub work_dir: PathBuf,
    pub dump_dir: PathBuf,
    pub chromium_path: Option<PathBuf>,
    pub headless: bool,
    pub max_login_attempts: usize,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://database.sqlite3?mode=rwc".to_string()),
            work_dir: std::env::var("MPS_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./__workdir__")),
            dump_dir: std::env::var("MPS_DUMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./__dump__")),
            chromium_path: std::env::var("MPS_CHROMIUM_PATH").ok().map(PathBuf::from),
            headless: std::env::var("MPS_HEADLESS")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
            max_login_attempts: std::env::var("MPS_MAX_LOGIN_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
        }
    }

    pub fn with_database_url(mut self, database_url: impl Into<String>) -> Self {
        self.database_url = database_url.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct ScrapeOptions {
    pub credentials: Credentials,
    pub search: SearchParams,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// `None` skips the browser and works from the local cache only.
    pub scrape: Option<ScrapeOptions>,
    pub save_files: bool,
    pub only_missing: bool,
    pub merge: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub expected: usize,
    pub fetched: usize,
    pub parsed: usize,
    pub merged: usize,
    /// Fetched or cached listings found already stored at merge time.
    pub skipped_existing: usize,
    /// Search results never fetched because they were in the skip set.
    pub skipped_known: usize,
    pub failed: usize,
}

impl RunSummary {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            expected: 0,
            fetched: 0,
            parsed: 0,
            merged: 0,
            skipped_existing: 0,
            skipped_known: 0,
            failed: 0,
        }
    }

    /// True when fewer listings ended up in the store than were expected.
    /// Skip-set hits are already left out of `expected`.
    pub fn fell_short(&self) -> bool {
        self.merged + self.skipped_existing < self.expected
    }
}

/// The store and cache a run works against.
pub struct Pipeline {
    store: BidStore,
    cache: ArtifactCache,
    save_files: bool,
    merge: bool,
}

impl Pipeline {
    pub fn new(store: BidStore, cache: ArtifactCache, save_files: bool, merge: bool) -> Self {
        Self {
            store,
            cache,
            save_files,
            merge,
        }
    }

    pub fn store(&self) -> &BidStore {
        &self.store
    }

    /// Identifiers already in the store or in the local cache.
    pub async fn skip_set(&self) -> Result<HashSet<String>> {
        let mut skip = self.store.stored_bid_ids().await?;
        let cached = self.cache.listing_ids().await?;
        skip.extend(cached);
        info!(count = skip.len(), "built skip set from store and local cache");
        Ok(skip)
    }

    /// Saves, parses and merges one bundle. Failures are logged and counted,
    /// never propagated.
    async fn process(&self, bundle: &RawArtifactBundle, save: bool, summary: &mut RunSummary) {
        let idn = bundle.idn.as_str();
        if save {
            match self.cache.save(bundle).await {
                Ok(saved) if saved.unchanged() => info!(idn, "cached files unchanged"),
                Ok(saved) => info!(idn, dir = %saved.directory.display(), "listing saved locally"),
                Err(err) => warn!(idn, error = %format!("{err:#}"), "could not save listing locally"),
            }
        }
        if !self.merge {
            return;
        }
        match self.store.contains_bid(idn).await {
            Ok(true) => {
                info!(idn, "bid already stored; not parsing again");
                summary.skipped_existing += 1;
                return;
            }
            Ok(false) => {}
            Err(err) => {
                error!(idn, error = %format!("{err:#}"), "could not check the store");
                summary.failed += 1;
                return;
            }
        }
        let parsed = match parse_listing(bundle) {
            Ok(parsed) => parsed,
            Err(err) => {
                error!(idn, error = %err, "could not parse listing; skipping");
                summary.failed += 1;
                return;
            }
        };
        summary.parsed += 1;
        match self.store.merge(&parsed).await {
            Ok(MergeOutcome::Inserted) => summary.merged += 1,
            Ok(MergeOutcome::AlreadyStored) => summary.skipped_existing += 1,
            Err(err) => {
                error!(idn, error = %format!("{err:#}"), "could not merge listing; skipping");
                summary.failed += 1;
            }
        }
    }

    /// Drives an acquisition to completion, or until `shutdown` resolves
    /// between two listings.
    pub async fn scrape<S, F>(
        &self,
        source: &mut S,
        request: AcquisitionRequest,
        shutdown: F,
        summary: &mut RunSummary,
    ) -> Result<()>
    where
        S: ListingSource + ?Sized,
        F: Future<Output = ()>,
    {
        let acquisition = Acquisition::start(source, request)
            .await
            .context("acquiring search results")?;
        let initial_expected = acquisition.expected();
        let mut skipped = 0usize;
        let mut fatal = None;

        let stream = acquisition.into_stream();
        tokio::pin!(stream);
        tokio::pin!(shutdown);
        loop {
            let event = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    warn!("interrupted; stopping before the next listing");
                    break;
                }
                event = stream.next() => event,
            };
            let Some(event) = event else {
                break;
            };
            match event {
                AcquisitionEvent::Skipped { .. } => {
                    skipped += 1;
                    summary.skipped_known += 1;
                }
                AcquisitionEvent::Fetched { idn, bundle } => {
                    summary.fetched += 1;
                    let span = info_span!("listing", idn = %idn);
                    self.process(&bundle, self.save_files, summary).instrument(span).await;
                }
                AcquisitionEvent::Failed { idn, error } => {
                    summary.failed += 1;
                    if error.is_fatal() {
                        fatal = Some((idn, error));
                    }
                }
            }
        }
        summary.expected += initial_expected.saturating_sub(skipped);

        match fatal {
            Some((idn, error)) => Err(anyhow::Error::new(error).context(format!("session lost while fetching {idn}"))),
            None => Ok(()),
        }
    }

    /// Parses and merges every listing in the local cache.
    pub async fn merge_cached(&self, summary: &mut RunSummary) -> Result<()> {
        let bundles = self.cache.load_all().await.context("loading cached listings")?;
        summary.expected += bundles.len();
        for bundle in bundles {
            let span = info_span!("listing", idn = %bundle.idn);
            self.process(&bundle, false, summary).instrument(span).await;
        }
        Ok(())
    }
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "cannot listen for Ctrl-C; run can only be stopped by killing it");
        std::future::pending::<()>().await;
    }
}

fn finish(mut summary: RunSummary) -> RunSummary {
    summary.finished_at = Utc::now();
    if summary.fell_short() {
        warn!(
            expected = summary.expected,
            merged = summary.merged,
            "fewer listings merged than expected"
        );
    }
    info!(
        run_id = %summary.run_id,
        expected = summary.expected,
        fetched = summary.fetched,
        parsed = summary.parsed,
        merged = summary.merged,
        skipped_existing = summary.skipped_existing,
        skipped_known = summary.skipped_known,
        failed = summary.failed,
        "run finished"
    );
    summary
}

/// Connects to the store, optionally scrapes, and merges.
pub async fn run(config: &SyncConfig, options: RunOptions) -> Result<RunSummary> {
    let mut summary = RunSummary::new();
    let store = BidStore::connect(&config.database_url).await?;
    store.migrate().await?;
    let pipeline = Pipeline::new(store, ArtifactCache::new(&config.work_dir), options.save_files, options.merge);

    let Some(scrape) = options.scrape else {
        if options.merge {
            pipeline.merge_cached(&mut summary).await?;
        }
        return Ok(finish(summary));
    };

    let skip = if options.only_missing {
        pipeline.skip_set().await?
    } else {
        HashSet::new()
    };

    let page = ChromiumPage::launch(ChromiumOptions {
        executable: config.chromium_path.clone(),
        headless: config.headless,
        download_dir: config.work_dir.join(".downloads"),
    })
    .await
    .context("creating browser session")?;
    let navigator_config = NavigatorConfig {
        max_login_attempts: config.max_login_attempts,
        ..NavigatorConfig::default()
    };
    let mut navigator = MerPubNavigator::new(
        Box::new(page),
        scrape.credentials,
        navigator_config,
        Arc::new(DirDumpSink::new(&config.dump_dir)),
    );

    let request = AcquisitionRequest {
        search: scrape.search,
        limit: scrape.limit,
        skip,
    };
    let result = pipeline.scrape(&mut navigator, request, ctrl_c(), &mut summary).await;
    if let Err(err) = navigator.close().await {
        warn!(%err, "could not close browser session");
    }
    result?;

    if summary.fetched == 0 && options.merge {
        info!("nothing was scraped; merging the local cache instead");
        pipeline.merge_cached(&mut summary).await?;
    }
    Ok(finish(summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use async_trait::async_trait;
    use chrono::NaiveDate;
    use mps_adapters::NavigatorError;
    use mps_core::VirtualFile;

    const FIXTURE_IDN: &str = "2241-15-COT24";

    fn fixture_cache() -> ArtifactCache {
        ArtifactCache::new(Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/agil"))
    }

    async fn memory_store() -> BidStore {
        let store = BidStore::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    /// Replays bundles from the fixture cache as if they were being scraped.
    struct CachedSource {
        ids: Vec<String>,
        cache: ArtifactCache,
    }

    #[async_trait]
    impl ListingSource for CachedSource {
        async fn search(&mut self, _params: &SearchParams) -> Result<Option<VirtualFile<String>>, NavigatorError> {
            let rows: String = self.ids.iter().map(|id| format!("<tr><td>{id}</td></tr>")).collect();
            Ok(Some(VirtualFile::new(
                "BuscarCotizacion.xls",
                format!("<table><tr><th>ID</th></tr>{rows}</table>"),
            )))
        }

        async fn fetch_listing(&mut self, idn: &str) -> Result<RawArtifactBundle, NavigatorError> {
            self.cache
                .load(idn)
                .await
                .map_err(|_| NavigatorError::ListingNotFound { idn: idn.to_string() })
        }
    }

    fn request(skip: &[&str]) -> AcquisitionRequest {
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        AcquisitionRequest {
            search: SearchParams {
                from: day,
                until: day,
                status: None,
            },
            limit: None,
            skip: skip.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn cached_listings_merge_once() {
        let pipeline = Pipeline::new(memory_store().await, fixture_cache(), false, true);

        let mut first = RunSummary::new();
        pipeline.merge_cached(&mut first).await.unwrap();
        assert_eq!((first.expected, first.parsed, first.merged, first.failed), (1, 1, 1, 0));

        let mut second = RunSummary::new();
        pipeline.merge_cached(&mut second).await.unwrap();
        assert_eq!((second.parsed, second.merged, second.skipped_existing), (0, 0, 1));
        assert!(pipeline.store().contains_bid(FIXTURE_IDN).await.unwrap());
    }

    #[tokio::test]
    async fn scraped_listings_are_saved_and_merged() {
        let work = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(memory_store().await, ArtifactCache::new(work.path()), true, true);
        let mut source = CachedSource {
            ids: vec![FIXTURE_IDN.to_string(), "0-0-MISSING".to_string()],
            cache: fixture_cache(),
        };

        let mut summary = RunSummary::new();
        pipeline
            .scrape(&mut source, request(&[]), std::future::pending::<()>(), &mut summary)
            .await
            .unwrap();
        assert_eq!(summary.expected, 2);
        assert_eq!(summary.fetched, 1);
        assert_eq!(summary.merged, 1);
        assert_eq!(summary.failed, 1);
        assert!(summary.fell_short());
        assert!(work.path().join(FIXTURE_IDN).join("bid.html").exists());
    }

    #[tokio::test]
    async fn clean_scrape_does_not_fall_short() {
        let pipeline = Pipeline::new(memory_store().await, fixture_cache(), false, true);
        let mut source = CachedSource {
            ids: vec![FIXTURE_IDN.to_string()],
            cache: fixture_cache(),
        };
        let mut summary = RunSummary::new();
        pipeline
            .scrape(&mut source, request(&[]), std::future::pending::<()>(), &mut summary)
            .await
            .unwrap();
        assert_eq!((summary.expected, summary.merged), (1, 1));
        assert!(!summary.fell_short());
    }

    #[tokio::test]
    async fn skipped_results_do_not_hide_failures() {
        let pipeline = Pipeline::new(memory_store().await, fixture_cache(), false, true);
        let mut source = CachedSource {
            ids: vec!["2241-1-COT24".to_string(), "0-0-MISSING".to_string()],
            cache: fixture_cache(),
        };
        let mut summary = RunSummary::new();
        pipeline
            .scrape(&mut source, request(&["2241-1-COT24"]), std::future::pending::<()>(), &mut summary)
            .await
            .unwrap();
        assert_eq!(summary.expected, 1);
        assert_eq!((summary.skipped_known, summary.skipped_existing), (1, 0));
        assert_eq!((summary.merged, summary.failed), (0, 1));
        assert!(summary.fell_short());
    }

    #[tokio::test]
    async fn only_missing_skips_stored_and_cached() {
        let pipeline = Pipeline::new(memory_store().await, fixture_cache(), false, true);
        let skip = pipeline.skip_set().await.unwrap();
        assert!(skip.contains(FIXTURE_IDN));

        let mut source = CachedSource {
            ids: vec![FIXTURE_IDN.to_string()],
            cache: fixture_cache(),
        };
        let mut summary = RunSummary::new();
        let skip: Vec<&str> = skip.iter().map(String::as_str).collect();
        pipeline
            .scrape(&mut source, request(&skip), std::future::pending::<()>(), &mut summary)
            .await
            .unwrap();
        assert_eq!((summary.expected, summary.fetched, summary.skipped_known), (0, 0, 1));
        assert_eq!(summary.skipped_existing, 0);
        assert!(!summary.fell_short());
    }

    #[tokio::test]
    async fn shutdown_stops_before_fetching() {
        let pipeline = Pipeline::new(memory_store().await, fixture_cache(), false, true);
        let mut source = CachedSource {
            ids: vec![FIXTURE_IDN.to_string()],
            cache: fixture_cache(),
        };
        let mut summary = RunSummary::new();
        pipeline
            .scrape(&mut source, request(&[]), std::future::ready(()), &mut summary)
            .await
            .unwrap();
        assert_eq!(summary.fetched, 0);
        assert!(!pipeline.store().contains_bid(FIXTURE_IDN).await.unwrap());
    }
}
