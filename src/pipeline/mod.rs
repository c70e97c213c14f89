//! One pipeline run: gate, fetch, then enrich, compress, publish and record
//! each new entry in turn.
//!
//! Every collaborator is a trait object so the run can be driven entirely by
//! fakes. Entries are handled strictly one after another with a randomized
//! pause between posts.

mod clock;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::content::{Enrichment, ImageAsset};
use crate::feed::{FeedEntry, FetchError};
use crate::publish::{PostRef, PublishError, Publisher};
use crate::storage::{DedupRecord, DedupStore, LockError, RunLock, StoreError};

pub use clock::{Clock, Jitter, SystemClock, ThreadJitter};

/// Produces the ordered list of candidate entries.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<FeedEntry>, FetchError>;
}

/// Scrapes an entry's page. Never fails; degrades to a fallback instead.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn enrich(&self, entry: &FeedEntry) -> Enrichment;
}

/// Downloads and size-fits an image. `None` when it can't be used.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn compress(&self, url: &Url) -> Option<ImageAsset>;
}

/// Errors that end a run early.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Feed fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Could not persist dedup store: {0}")]
    Store(#[from] StoreError),

    #[error("Could not take run lock: {0}")]
    Lock(#[source] LockError),
}

/// Knobs for a single run.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Only the first N feed entries are considered per run.
    pub max_entries: usize,
    pub gate_min: Duration,
    pub gate_max: Duration,
    pub pacing_min: Duration,
    pub pacing_max: Duration,
    /// Leave failed publishes unrecorded so the next run tries them again.
    pub retry_failed_posts: bool,
    /// Age after which another run's lock is considered abandoned.
    pub lock_stale: Duration,
    /// Skip the fetch-interval gate.
    pub force: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_entries: 8,
            gate_min: Duration::from_secs(30 * 60),
            gate_max: Duration::from_secs(120 * 60),
            pacing_min: Duration::from_secs(120),
            pacing_max: Duration::from_secs(300),
            retry_failed_posts: false,
            lock_stale: Duration::from_secs(360 * 60),
            force: false,
        }
    }
}

/// Counters for a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Entries the feed returned (before the per-run cap).
    pub fetched: usize,
    /// Candidates skipped because they were already recorded.
    pub already_seen: usize,
    pub published: usize,
    pub failed: usize,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Too soon since the last fetch; nothing was touched.
    Gated,
    /// Another run holds the lock.
    Overlapping,
    Completed(RunReport),
}

impl RunOutcome {
    pub fn log(&self) {
        match self {
            RunOutcome::Gated => tracing::info!("Run gated, nothing to do"),
            RunOutcome::Overlapping => tracing::warn!("Previous run still active"),
            RunOutcome::Completed(report) => tracing::info!(
                fetched = report.fetched,
                published = report.published,
                failed = report.failed,
                "Run finished"
            ),
        }
    }
}

/// The collaborators a [`Pipeline`] drives.
pub struct Components {
    pub feed: Arc<dyn FeedSource>,
    pub pages: Arc<dyn PageSource>,
    pub images: Arc<dyn ImageSource>,
    pub publisher: Publisher,
    pub clock: Arc<dyn Clock>,
    pub jitter: Arc<dyn Jitter>,
}

pub struct Pipeline {
    store: DedupStore,
    settings: PipelineSettings,
    feed: Arc<dyn FeedSource>,
    pages: Arc<dyn PageSource>,
    images: Arc<dyn ImageSource>,
    publisher: Publisher,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn Jitter>,
}

impl Pipeline {
    pub fn new(store: DedupStore, settings: PipelineSettings, components: Components) -> Self {
        let Components {
            feed,
            pages,
            images,
            publisher,
            clock,
            jitter,
        } = components;
        Self {
            store,
            settings,
            feed,
            pages,
            images,
            publisher,
            clock,
            jitter,
        }
    }

    /// Runs the pipeline once.
    ///
    /// # Ordering
    ///
    /// The fetch timestamp is stamped and saved *before* the feed is fetched,
    /// so a failing feed still counts as an attempt for gating. The store is
    /// saved after every entry and once more at the end; an abort mid-entry
    /// leaves that entry unrecorded.
    ///
    /// # Errors
    ///
    /// Fetch failures, store write failures and lock I/O failures end the run.
    /// Enrichment, image and publish failures do not.
    pub async fn run_once(&self) -> Result<RunOutcome, PipelineError> {
        let now = self.clock.now_ms();
        let lock_path = RunLock::path_for(self.store.path());
        let _lock = match RunLock::acquire(&lock_path, self.settings.lock_stale, now) {
            Ok(lock) => lock,
            Err(LockError::Held { pid, age_secs }) => {
                tracing::warn!(pid, age_secs, "Another run is in progress, skipping");
                return Ok(RunOutcome::Overlapping);
            }
            Err(e) => return Err(PipelineError::Lock(e)),
        };

        let mut record = self.store.load();

        if !self.settings.force && self.is_gated(&record, now) {
            return Ok(RunOutcome::Gated);
        }

        record.stamp_fetch(now);
        self.persist(&record)?;

        let entries = self.feed.fetch().await?;
        let mut report = RunReport {
            fetched: entries.len(),
            ..RunReport::default()
        };
        tracing::info!(
            fetched = entries.len(),
            limit = self.settings.max_entries,
            "Fetched feed"
        );

        let mut handled_any = false;
        for entry in entries.iter().take(self.settings.max_entries) {
            if record.contains(&entry.id) {
                tracing::debug!(id = %entry.id, "Already published, skipping");
                report.already_seen += 1;
                continue;
            }

            if handled_any {
                let pause = self
                    .jitter
                    .between(self.settings.pacing_min, self.settings.pacing_max);
                tracing::debug!(secs = pause.as_secs(), "Pacing before next post");
                self.clock.sleep(pause).await;
            }
            handled_any = true;

            match self.process(entry).await {
                Ok(_) => {
                    report.published += 1;
                    record.record(&entry.id);
                }
                Err(e) => {
                    tracing::error!(id = %entry.id, error = %e, "Publish failed");
                    report.failed += 1;
                    if !self.settings.retry_failed_posts {
                        record.record(&entry.id);
                    }
                }
            }

            self.persist(&record)?;
        }

        self.persist(&record)?;
        tracing::info!(
            published = report.published,
            failed = report.failed,
            already_seen = report.already_seen,
            "Run complete"
        );
        Ok(RunOutcome::Completed(report))
    }

    /// Triggers [`run_once`](Self::run_once) every `interval` until
    /// `shutdown` resolves.
    ///
    /// `shutdown` is watched during runs as well as between them. A run cut
    /// short is dropped where it stands: the entry in flight stays unrecorded
    /// and the run lock is released. Failed runs are logged and the loop
    /// carries on.
    pub async fn run_until<F>(&self, interval: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = interval.as_secs(), "Starting daemon loop");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }

            tokio::select! {
                result = self.run_once() => match result {
                    Ok(outcome) => outcome.log(),
                    Err(e) => tracing::error!(error = %e, "Pipeline run failed"),
                },
                _ = &mut shutdown => {
                    tracing::info!("Interrupted mid-run, entry in flight left unrecorded");
                    return;
                }
            }
        }
    }

    fn is_gated(&self, record: &DedupRecord, now: i64) -> bool {
        let threshold = self
            .jitter
            .between(self.settings.gate_min, self.settings.gate_max);
        let threshold_ms = i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX);
        let elapsed_ms = now.saturating_sub(record.last_fetch_time());

        if elapsed_ms < threshold_ms {
            tracing::info!(
                elapsed_mins = elapsed_ms / 60_000,
                threshold_mins = threshold_ms / 60_000,
                "Fetched recently, skipping run"
            );
            return true;
        }
        false
    }

    async fn process(&self, entry: &FeedEntry) -> Result<PostRef, PublishError> {
        tracing::info!(id = %entry.id, url = %entry.link, "Processing entry");

        let enrichment = self.pages.enrich(entry).await;
        let image = match &enrichment.image_url {
            Some(url) => self.images.compress(url).await,
            None => None,
        };

        self.publisher
            .publish_entry(entry, &enrichment, image.as_ref())
            .await
    }

    fn persist(&self, record: &DedupRecord) -> Result<(), StoreError> {
        self.store.save(record).inspect_err(|e| {
            tracing::error!(path = %self.store.path().display(), error = %e, "Failed to save dedup store");
        })
    }
}
