//! Ingestion driver: window → fetch → upsert → checkpoint, once or on a schedule.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use g2b_adapters::{
    fetch_window, FetchContext, FetchError, NoticeSource, PortalConfig, PublicDataPortalAdapter,
    DEFAULT_BASE_URL, DEFAULT_PAGE_SIZE,
};
use g2b_core::{
    compute_window, next_watermark, Checkpoint, FetchWindow, WatermarkState, WatermarkStrategy,
    WindowPolicy,
};
use g2b_storage::{
    CheckpointError, CheckpointStore, FileCheckpointStore, HttpClientConfig, HttpFetcher,
    NoticeStore, RunRecord, StoreOptions, WriteError,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "g2b-sync";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {key}")]
    Missing { key: &'static str },
    #[error("invalid value `{value}` for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Clone)]
pub struct IngestConfig {
    pub api_key: String,
    pub api_base_url: String,
    pub page_size: u32,
    pub inquiry_div: String,
    pub max_pages: u32,
    pub database_url: String,
    pub checkpoint_path: PathBuf,
    pub poll_interval: Duration,
    pub sync_cron: Option<String>,
    pub window: WindowPolicy,
    pub watermark_strategy: WatermarkStrategy,
    pub http_timeout: Duration,
    pub store_timeout: Duration,
    pub utc_offset: FixedOffset,
    pub user_agent: String,
}

impl fmt::Debug for IngestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestConfig")
            .field("api_key", &"<redacted>")
            .field("api_base_url", &self.api_base_url)
            .field("page_size", &self.page_size)
            .field("inquiry_div", &self.inquiry_div)
            .field("max_pages", &self.max_pages)
            .field("database_url", &self.database_url)
            .field("checkpoint_path", &self.checkpoint_path)
            .field("poll_interval", &self.poll_interval)
            .field("sync_cron", &self.sync_cron)
            .field("window", &self.window)
            .field("watermark_strategy", &self.watermark_strategy)
            .field("http_timeout", &self.http_timeout)
            .field("store_timeout", &self.store_timeout)
            .field("utc_offset", &self.utc_offset)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

/// When continuous mode fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Every(Duration),
    Cron(String),
}

impl IngestConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let api_key = get("G2B_API_KEY").ok_or(ConfigError::Missing { key: "G2B_API_KEY" })?;

        let page_size = positive("G2B_PAGE_SIZE", get("G2B_PAGE_SIZE"), DEFAULT_PAGE_SIZE)?;
        let max_pages = positive("G2B_MAX_PAGES", get("G2B_MAX_PAGES"), 1000)?;
        let poll_secs = positive("G2B_POLL_INTERVAL_SECS", get("G2B_POLL_INTERVAL_SECS"), 300u64)?;
        let default_lookback = bounded_minutes(
            "G2B_DEFAULT_LOOKBACK_MINUTES",
            get("G2B_DEFAULT_LOOKBACK_MINUTES"),
            5,
            1,
        )?;
        let overlap = bounded_minutes(
            "G2B_WINDOW_OVERLAP_MINUTES",
            get("G2B_WINDOW_OVERLAP_MINUTES"),
            0,
            0,
        )?;
        let http_secs = positive("G2B_HTTP_TIMEOUT_SECS", get("G2B_HTTP_TIMEOUT_SECS"), 20u64)?;
        let store_secs = positive("G2B_STORE_TIMEOUT_SECS", get("G2B_STORE_TIMEOUT_SECS"), 10u64)?;

        let watermark_strategy = match get("G2B_WATERMARK_STRATEGY") {
            Some(raw) => raw.parse().map_err(|reason| ConfigError::Invalid {
                key: "G2B_WATERMARK_STRATEGY",
                value: raw,
                reason,
            })?,
            None => WatermarkStrategy::default(),
        };

        let offset_hours: i32 = parsed("G2B_UTC_OFFSET_HOURS", get("G2B_UTC_OFFSET_HOURS"), 9)?;
        let utc_offset = (-12..=14)
            .contains(&offset_hours)
            .then(|| FixedOffset::east_opt(offset_hours * 3600))
            .flatten()
            .ok_or_else(|| ConfigError::Invalid {
                key: "G2B_UTC_OFFSET_HOURS",
                value: offset_hours.to_string(),
                reason: "expected an hour offset between -12 and 14".into(),
            })?;

        Ok(Self {
            api_key,
            api_base_url: get("G2B_API_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            page_size,
            inquiry_div: get("G2B_INQUIRY_DIV").unwrap_or_else(|| "1".to_string()),
            max_pages,
            database_url: get("DATABASE_URL").unwrap_or_else(|| "sqlite://bids_raw.db".to_string()),
            checkpoint_path: get("G2B_CHECKPOINT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("last_collected_time.json")),
            poll_interval: Duration::from_secs(poll_secs),
            sync_cron: get("G2B_SYNC_CRON"),
            window: WindowPolicy {
                default_lookback,
                overlap,
            },
            watermark_strategy,
            http_timeout: Duration::from_secs(http_secs),
            store_timeout: Duration::from_secs(store_secs),
            utc_offset,
            user_agent: get("G2B_USER_AGENT").unwrap_or_else(|| "g2b-collector/0.1".to_string()),
        })
    }

    /// Wall-clock "now" in the portal's local time.
    pub fn now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.utc_offset).naive_local()
    }

    pub fn schedule(&self) -> Schedule {
        match &self.sync_cron {
            Some(expr) => Schedule::Cron(expr.clone()),
            None => Schedule::Every(self.poll_interval),
        }
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            call_timeout: self.store_timeout,
            ..StoreOptions::default()
        }
    }

    pub fn portal_config(&self) -> PortalConfig {
        PortalConfig {
            base_url: self.api_base_url.clone(),
            service_key: self.api_key.clone(),
            page_size: self.page_size,
            inquiry_div: self.inquiry_div.clone(),
        }
    }
}

fn parsed<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match raw {
        Some(value) => value.parse().map_err(|err: T::Err| ConfigError::Invalid {
            key,
            reason: err.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

/// Longest lookback or overlap accepted: one year.
const MAX_WINDOW_MINUTES: i64 = 525_600;

fn bounded_minutes(
    key: &'static str,
    raw: Option<String>,
    default: i64,
    min: i64,
) -> Result<chrono::Duration, ConfigError> {
    let minutes: i64 = parsed(key, raw, default)?;
    if !(min..=MAX_WINDOW_MINUTES).contains(&minutes) {
        return Err(ConfigError::Invalid {
            key,
            value: minutes.to_string(),
            reason: format!("expected minutes between {min} and {MAX_WINDOW_MINUTES}"),
        });
    }
    chrono::Duration::try_minutes(minutes).ok_or_else(|| ConfigError::Invalid {
        key,
        value: minutes.to_string(),
        reason: "out of range".into(),
    })
}

fn positive<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default + fmt::Display,
    T::Err: fmt::Display,
{
    let value = parsed(key, raw, default)?;
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(value)
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("write phase failed: {0}")]
    Write(#[from] WriteError),
    #[error("notices committed but checkpoint not advanced: {0}")]
    Checkpoint(#[from] CheckpointError),
}

#[derive(Debug)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub window: FetchWindow,
    pub pages: u32,
    pub fetched: usize,
    pub written: usize,
    /// Fetched notices that repeated an identifier already seen in this run.
    pub duplicates: usize,
    pub watermark_before: Option<Checkpoint>,
    /// Watermark in effect once the run ended.
    pub watermark_after: Option<Checkpoint>,
    pub error: Option<RunError>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn status(&self) -> &'static str {
        match &self.error {
            None => "completed",
            Some(RunError::Fetch(_)) => "fetch_failed",
            Some(RunError::Write(_)) => "write_failed",
            Some(RunError::Checkpoint(_)) => "checkpoint_failed",
        }
    }

    pub fn to_record(&self) -> RunRecord {
        RunRecord {
            run_id: self.run_id.to_string(),
            started_at: self.started_at,
            duration_ms: i64::try_from(self.duration.as_millis()).unwrap_or(i64::MAX),
            window_start: self.window.start,
            window_end: self.window.end,
            pages: i64::from(self.pages),
            fetched: self.fetched as i64,
            written: self.written as i64,
            watermark_after: self.watermark_after.map(|cp| cp.to_string()),
            status: self.status().to_string(),
            error: self.error.as_ref().map(|err| err.to_string()),
        }
    }
}

pub struct IngestPipeline {
    config: IngestConfig,
    source: Arc<dyn NoticeSource>,
    checkpoints: Arc<dyn CheckpointStore>,
    store: NoticeStore,
    in_flight: Mutex<()>,
}

impl IngestPipeline {
    pub fn new(
        config: IngestConfig,
        source: Arc<dyn NoticeSource>,
        checkpoints: Arc<dyn CheckpointStore>,
        store: NoticeStore,
    ) -> Self {
        Self {
            config,
            source,
            checkpoints,
            store,
            in_flight: Mutex::new(()),
        }
    }

    /// Wires the portal adapter, the file checkpoint and a migrated store.
    pub async fn connect(config: IngestConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
        })?;
        let source = PublicDataPortalAdapter::new(http, config.portal_config());
        Self::connect_with_source(config, Arc::new(source)).await
    }

    pub async fn connect_with_source(config: IngestConfig, source: Arc<dyn NoticeSource>) -> Result<Self> {
        let store = NoticeStore::open(&config.database_url, &config.store_options())
            .await
            .with_context(|| format!("opening notice store {}", config.database_url))?;
        store.migrate().await?;
        let checkpoints = Arc::new(FileCheckpointStore::new(config.checkpoint_path.clone()));
        Ok(Self::new(config, source, checkpoints, store))
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn store(&self) -> &NoticeStore {
        &self.store
    }

    /// Runs one cycle, waiting for any in-flight cycle to finish first.
    pub async fn run_once(&self) -> RunSummary {
        self.run_once_at(self.config.now()).await
    }

    pub async fn run_once_at(&self, now: NaiveDateTime) -> RunSummary {
        let _guard = self.in_flight.lock().await;
        self.run_cycle(now).await
    }

    /// Runs one cycle unless another is in flight, in which case `None`.
    pub async fn try_run_once(&self) -> Option<RunSummary> {
        let _guard = self.in_flight.try_lock().ok()?;
        Some(self.run_cycle(self.config.now()).await)
    }

    async fn run_cycle(&self, now: NaiveDateTime) -> RunSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id);
        async move {
            let started_at = Utc::now();
            let clock = Instant::now();

            let state = self.load_watermark().await;
            let window = compute_window(&state, now, &self.config.window);
            let watermark_before = state.checkpoint().copied();
            info!(%window, seed = ?window.seed, "ingest run starting");

            let mut summary = RunSummary {
                run_id,
                started_at,
                duration: Duration::ZERO,
                window,
                pages: 0,
                fetched: 0,
                written: 0,
                duplicates: 0,
                watermark_before,
                watermark_after: watermark_before,
                error: None,
            };

            let ctx = FetchContext { run_id };
            if let Err(err) = self.execute(&ctx, &mut summary).await {
                summary.error = Some(err);
            }
            summary.duration = clock.elapsed();

            log_summary(&summary);
            if let Err(err) = self.store.record_run(&summary.to_record()).await {
                warn!(error = %err, "could not record ingest run");
            }
            summary
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, ctx: &FetchContext, summary: &mut RunSummary) -> Result<(), RunError> {
        let outcome = match fetch_window(
            self.source.as_ref(),
            ctx,
            &summary.window,
            self.config.max_pages,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                summary.pages = err.page;
                return Err(err.into());
            }
        };
        summary.pages = outcome.pages_requested;
        summary.fetched = outcome.notices.len();
        if outcome.notices.is_empty() {
            return Ok(());
        }

        let report = self.store.upsert_batch(&outcome.notices).await?;
        summary.written = report.written;
        summary.duplicates = report.received.saturating_sub(report.written);

        if let Some(next) = next_watermark(
            summary.watermark_before.as_ref(),
            &outcome.notices,
            self.config.watermark_strategy,
        ) {
            self.save_watermark(&next).await?;
            summary.watermark_after = Some(next);
        }
        Ok(())
    }

    async fn load_watermark(&self) -> WatermarkState {
        match tokio::time::timeout(self.config.store_timeout, self.checkpoints.load()).await {
            Ok(Ok(Some(checkpoint))) => WatermarkState::Present(checkpoint),
            Ok(Ok(None)) => {
                info!("no checkpoint recorded yet; using default lookback");
                WatermarkState::Absent
            }
            Ok(Err(err)) => {
                warn!(error = %err, "checkpoint unreadable; falling back to default lookback");
                WatermarkState::Unreadable
            }
            Err(_) => {
                warn!(
                    after = ?self.config.store_timeout,
                    "checkpoint load timed out; falling back to default lookback"
                );
                WatermarkState::Unreadable
            }
        }
    }

    async fn save_watermark(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        match tokio::time::timeout(self.config.store_timeout, self.checkpoints.save(checkpoint)).await {
            Ok(result) => result,
            Err(_) => Err(CheckpointError::Timeout {
                op: "save",
                after: self.config.store_timeout,
            }),
        }
    }
}

fn log_summary(summary: &RunSummary) {
    let watermark = summary
        .watermark_after
        .map(|cp| cp.to_string())
        .unwrap_or_else(|| "none".to_string());
    let duration_ms = summary.duration.as_millis() as u64;

    match &summary.error {
        None => info!(
            window = %summary.window,
            pages = summary.pages,
            fetched = summary.fetched,
            written = summary.written,
            duplicates = summary.duplicates,
            %watermark,
            duration_ms,
            "ingest run completed"
        ),
        Some(RunError::Fetch(err)) => error!(
            window = %summary.window,
            page = err.page,
            fetched_so_far = err.fetched_so_far,
            %watermark,
            duration_ms,
            error = %err,
            "ingest run failed during fetch; nothing written"
        ),
        Some(err) => error!(
            window = %summary.window,
            pages = summary.pages,
            fetched = summary.fetched,
            written = summary.written,
            %watermark,
            duration_ms,
            error = %err,
            "ingest run failed"
        ),
    }
}

/// Builds the continuous-mode job. Ticks that land while a run is in flight are skipped.
pub async fn build_scheduler(pipeline: Arc<IngestPipeline>, schedule: &Schedule) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let job = match schedule {
        Schedule::Every(interval) => Job::new_repeated_async(*interval, move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move { scheduled_tick(&pipeline).await })
        })
        .with_context(|| format!("creating scheduler job every {interval:?}"))?,
        Schedule::Cron(expr) => Job::new_async(expr.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move { scheduled_tick(&pipeline).await })
        })
        .with_context(|| format!("creating scheduler job for cron {expr}"))?,
    };
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

async fn scheduled_tick(pipeline: &IngestPipeline) {
    if pipeline.try_run_once().await.is_none() {
        warn!("previous ingest run still in progress; skipping this tick");
    }
}

/// Runs one cycle immediately, then keeps the schedule going until `shutdown` resolves.
pub async fn run_until_shutdown(
    pipeline: Arc<IngestPipeline>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    pipeline.run_once().await;

    let schedule = pipeline.config().schedule();
    let mut sched = build_scheduler(pipeline.clone(), &schedule).await?;
    sched.start().await.context("starting scheduler")?;
    info!(?schedule, "scheduler started");

    shutdown.await;
    info!("shutdown requested; stopping scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn missing_api_key_is_fatal() {
        let err = IngestConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { key: "G2B_API_KEY" }));

        let err = IngestConfig::from_lookup(lookup(&[("G2B_API_KEY", "   ")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { .. }));
    }

    #[test]
    fn defaults_match_portal_conventions() {
        let config = IngestConfig::from_lookup(lookup(&[("G2B_API_KEY", "k")])).unwrap();
        assert_eq!(config.api_base_url, DEFAULT_BASE_URL);
        assert_eq!(config.page_size, 100);
        assert_eq!(config.inquiry_div, "1");
        assert_eq!(config.database_url, "sqlite://bids_raw.db");
        assert_eq!(config.checkpoint_path, PathBuf::from("last_collected_time.json"));
        assert_eq!(config.window.default_lookback, chrono::Duration::minutes(5));
        assert_eq!(config.window.overlap, chrono::Duration::zero());
        assert_eq!(config.watermark_strategy, WatermarkStrategy::LastInResponse);
        assert_eq!(config.utc_offset, FixedOffset::east_opt(9 * 3600).unwrap());
        assert_eq!(config.schedule(), Schedule::Every(Duration::from_secs(300)));
    }

    #[test]
    fn overrides_are_applied() {
        let config = IngestConfig::from_lookup(lookup(&[
            ("G2B_API_KEY", "k"),
            ("G2B_PAGE_SIZE", "50"),
            ("G2B_DEFAULT_LOOKBACK_MINUTES", "15"),
            ("G2B_WINDOW_OVERLAP_MINUTES", "1"),
            ("G2B_WATERMARK_STRATEGY", "max"),
            ("G2B_SYNC_CRON", "0 */5 * * * *"),
            ("G2B_UTC_OFFSET_HOURS", "0"),
            ("DATABASE_URL", "sqlite:///var/lib/g2b/bids.db"),
        ]))
        .unwrap();
        assert_eq!(config.page_size, 50);
        assert_eq!(config.window.default_lookback, chrono::Duration::minutes(15));
        assert_eq!(config.window.overlap, chrono::Duration::minutes(1));
        assert_eq!(config.watermark_strategy, WatermarkStrategy::MaxBidOpen);
        assert_eq!(config.schedule(), Schedule::Cron("0 */5 * * * *".into()));
        assert_eq!(config.utc_offset, FixedOffset::east_opt(0).unwrap());
        assert_eq!(config.database_url, "sqlite:///var/lib/g2b/bids.db");
    }

    #[test]
    fn invalid_values_are_rejected() {
        for (key, value) in [
            ("G2B_PAGE_SIZE", "0"),
            ("G2B_PAGE_SIZE", "lots"),
            ("G2B_POLL_INTERVAL_SECS", "-5"),
            ("G2B_DEFAULT_LOOKBACK_MINUTES", "0"),
            ("G2B_DEFAULT_LOOKBACK_MINUTES", "1000000000000"),
            ("G2B_DEFAULT_LOOKBACK_MINUTES", "9223372036854775807"),
            ("G2B_DEFAULT_LOOKBACK_MINUTES", "525601"),
            ("G2B_WINDOW_OVERLAP_MINUTES", "-1"),
            ("G2B_WINDOW_OVERLAP_MINUTES", "99999999999"),
            ("G2B_WATERMARK_STRATEGY", "newest"),
            ("G2B_UTC_OFFSET_HOURS", "30"),
        ] {
            let err = IngestConfig::from_lookup(lookup(&[("G2B_API_KEY", "k"), (key, value)])).unwrap_err();
            match err {
                ConfigError::Invalid { key: got, .. } => assert_eq!(got, key),
                other => panic!("{key}={value}: unexpected {other}"),
            }
        }
    }

    #[test]
    fn debug_output_hides_api_key() {
        let config = IngestConfig::from_lookup(lookup(&[("G2B_API_KEY", "super-secret")])).unwrap();
        assert!(!format!("{config:?}").contains("super-secret"));
    }
}
