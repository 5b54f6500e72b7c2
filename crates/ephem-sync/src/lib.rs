//! Ephemeris pipeline orchestration: configuration, the single-date run,
//! the batch runner, month coverage checks and the cron scheduler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use ephem_adapters::{
    GenerationClient, GenerationError, OpenAiChatGenerator, OpenAiConfig, DEFAULT_OPENAI_BASE_URL,
    DEFAULT_OPENAI_MODEL,
};
use ephem_core::{
    days_in_month, month_name, CategoryAdjustment, Clock, DateError, DateResolver, EphemerisRecord,
    PublicationKey, SystemClock, TargetSource, DEFAULT_TIMEZONE,
};
use ephem_storage::{ConflictPolicy, EphemerisStore, PgEphemerisStore, StoreError, WriteOutcome};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ephem-sync";

pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_CRON: &str = "0 0 21 * * *";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Loads `.env.local` then `.env` when present. Real environment wins.
pub fn load_env_files() {
    for name in [".env.local", ".env"] {
        match dotenvy::from_filename(name) {
            Ok(path) => debug!(path = %path.display(), "loaded env file"),
            Err(err) if env_file_missing(&err) => {}
            Err(err) => warn!(file = name, error = %err, "ignoring unreadable env file"),
        }
    }
}

fn env_file_missing(err: &dotenvy::Error) -> bool {
    matches!(err, dotenvy::Error::Io(io) if io.kind() == std::io::ErrorKind::NotFound)
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Option<String> {
    lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_optional<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(lookup, var) {
        Some(raw) => raw.parse().map_err(|err: T::Err| ConfigError::Invalid {
            var,
            reason: err.to_string(),
        }),
        None => Ok(default),
    }
}

/// Privileged write connection string, for commands that only touch storage.
pub fn write_database_url_from_env() -> Result<String, ConfigError> {
    non_empty(&|k: &str| std::env::var(k).ok(), "DATABASE_URL")
        .ok_or(ConfigError::Missing(vec!["DATABASE_URL"]))
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub openai_model: String,
    pub openai_timeout_secs: u64,
    pub resolver: DateResolver,
    pub on_conflict: ConflictPolicy,
    pub batch_delay: Duration,
    pub cron: String,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Missing credentials are collected and reported together.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = non_empty(&lookup, "DATABASE_URL");
        let openai_api_key = non_empty(&lookup, "OPENAI_API_KEY");
        let (database_url, openai_api_key) = match (database_url, openai_api_key) {
            (Some(db), Some(key)) => (db, key),
            (db, key) => {
                let mut missing = Vec::new();
                if db.is_none() {
                    missing.push("DATABASE_URL");
                }
                if key.is_none() {
                    missing.push("OPENAI_API_KEY");
                }
                return Err(ConfigError::Missing(missing));
            }
        };

        let resolver = match non_empty(&lookup, "EPHEMERIS_TIMEZONE") {
            Some(name) => DateResolver::from_name(&name).map_err(|err| ConfigError::Invalid {
                var: "EPHEMERIS_TIMEZONE",
                reason: err.to_string(),
            })?,
            None => DateResolver::new(DEFAULT_TIMEZONE),
        };

        Ok(Self {
            database_url,
            openai_api_key,
            openai_base_url: non_empty(&lookup, "OPENAI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            openai_model: non_empty(&lookup, "OPENAI_MODEL")
                .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            openai_timeout_secs: parse_optional(&lookup, "OPENAI_TIMEOUT_SECS", 60)?,
            resolver,
            on_conflict: parse_optional(&lookup, "EPHEMERIS_ON_CONFLICT", ConflictPolicy::Overwrite)?,
            batch_delay: Duration::from_secs(parse_optional(
                &lookup,
                "EPHEMERIS_BATCH_DELAY_SECS",
                DEFAULT_BATCH_DELAY.as_secs(),
            )?),
            cron: non_empty(&lookup, "EPHEMERIS_CRON").unwrap_or_else(|| DEFAULT_CRON.to_string()),
        })
    }

    pub fn openai_config(&self) -> OpenAiConfig {
        OpenAiConfig {
            base_url: self.openai_base_url.clone(),
            model: self.openai_model.clone(),
            timeout: Duration::from_secs(self.openai_timeout_secs),
            ..OpenAiConfig::new(self.openai_api_key.clone())
        }
    }
}

/// Stage at which a run stopped. Normalization never fails, so it has no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    ResolveDate,
    CheckExisting,
    Generate,
    Validate,
    Persist,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("could not resolve target date: {0}")]
    InvalidDate(#[from] DateError),
    #[error("existence check for {key} failed: {source}")]
    ExistenceCheck {
        key: PublicationKey,
        #[source]
        source: StoreError,
    },
    #[error("generation for {key} failed: {source}")]
    Generation {
        key: PublicationKey,
        #[source]
        source: GenerationError,
    },
    #[error("date validation failed: expected {expected}; content: {content}")]
    Validation {
        key: PublicationKey,
        expected: String,
        content: String,
    },
    #[error("persisting {key} failed: {source}")]
    Persist {
        key: PublicationKey,
        #[source]
        source: StoreError,
    },
}

impl PipelineError {
    /// The stage the run was in when it stopped.
    pub fn stage(&self) -> PipelineStage {
        match self {
            PipelineError::InvalidDate(_) => PipelineStage::ResolveDate,
            PipelineError::ExistenceCheck { .. } => PipelineStage::CheckExisting,
            PipelineError::Generation { .. } => PipelineStage::Generate,
            PipelineError::Validation { .. } => PipelineStage::Validate,
            PipelineError::Persist { .. } => PipelineStage::Persist,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Skipped {
        key: PublicationKey,
    },
    Persisted {
        key: PublicationKey,
        write: WriteOutcome,
        record: EphemerisRecord,
    },
}

impl RunOutcome {
    pub fn key(&self) -> PublicationKey {
        match self {
            RunOutcome::Skipped { key } | RunOutcome::Persisted { key, .. } => *key,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Regenerate even when the key already has a record. The write then
    /// follows the configured [`ConflictPolicy`].
    pub force: bool,
}

/// One pipeline run per publication key:
/// resolve → check existing → generate → normalize → validate → persist.
pub struct EphemerisPipeline {
    store: Arc<dyn EphemerisStore>,
    generation: GenerationClient,
    resolver: DateResolver,
    clock: Arc<dyn Clock>,
    on_conflict: ConflictPolicy,
}

impl EphemerisPipeline {
    pub fn new(
        store: Arc<dyn EphemerisStore>,
        generation: GenerationClient,
        resolver: DateResolver,
    ) -> Self {
        Self {
            store,
            generation,
            resolver,
            clock: Arc::new(SystemClock),
            on_conflict: ConflictPolicy::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.on_conflict = policy;
        self
    }

    pub fn store(&self) -> &Arc<dyn EphemerisStore> {
        &self.store
    }

    pub async fn run(
        &self,
        override_date: Option<&str>,
        options: RunOptions,
    ) -> Result<RunOutcome, PipelineError> {
        let now = self.clock.now();
        let target = self.resolver.resolve_target(override_date, now)?;
        match target.source {
            TargetSource::Override => info!(key = %target.key, "target date from override"),
            TargetSource::TomorrowInZone => info!(
                key = %target.key,
                timezone = %self.resolver.timezone(),
                "target date is tomorrow in zone"
            ),
        }

        self.run_at(target.key, now, options).await
    }

    /// Runs for an already parsed key, skipping date resolution.
    pub async fn run_key(
        &self,
        key: PublicationKey,
        options: RunOptions,
    ) -> Result<RunOutcome, PipelineError> {
        self.run_at(key, self.clock.now(), options).await
    }

    async fn run_at(
        &self,
        key: PublicationKey,
        now: DateTime<Utc>,
        options: RunOptions,
    ) -> Result<RunOutcome, PipelineError> {
        let span = info_span!("ephemeris_run", key = %key, force = options.force);
        self.run_for_key(key, now, options).instrument(span).await
    }

    async fn run_for_key(
        &self,
        key: PublicationKey,
        now: DateTime<Utc>,
        options: RunOptions,
    ) -> Result<RunOutcome, PipelineError> {
        if options.force {
            info!("forced run, existing record check bypassed");
        } else {
            let exists = self
                .store
                .exists(key)
                .await
                .map_err(|source| PipelineError::ExistenceCheck { key, source })?;
            if exists {
                info!("ephemeris already exists, skipping");
                return Ok(RunOutcome::Skipped { key });
            }
            info!("no existing ephemeris, generating");
        }

        let mut candidate = self
            .generation
            .generate(&key, now.year())
            .await
            .map_err(|source| PipelineError::Generation { key, source })?;
        info!(title = %candidate.title, raw_category = %candidate.category, "candidate generated");

        let normalized = candidate.normalize_category();
        match &normalized.adjustment {
            Some(CategoryAdjustment::Mapped { original }) => warn!(
                original = %original,
                category = %normalized.category,
                "category not in whitelist, mapped"
            ),
            Some(CategoryAdjustment::Fallback { original }) => warn!(
                original = %original,
                category = %normalized.category,
                "category not recognized, falling back"
            ),
            None => {}
        }

        if !candidate.mentions_date(&key) {
            return Err(PipelineError::Validation {
                key,
                expected: format!("{} {}, {}", key.month_name(), key.day(), key.year()),
                content: format!("{} - {}", candidate.title, candidate.description),
            });
        }
        info!("date validation passed");

        let record = EphemerisRecord::new(key, candidate, normalized.category);
        let write = self
            .store
            .upsert(&record, self.on_conflict)
            .await
            .map_err(|source| PipelineError::Persist { key, source })?;
        info!(?write, policy = %self.on_conflict, "ephemeris persisted");

        Ok(RunOutcome::Persisted { key, write, record })
    }
}

/// Wires the production collaborators once per process.
pub async fn build_pipeline(config: &PipelineConfig) -> Result<EphemerisPipeline> {
    let store = PgEphemerisStore::connect(&config.database_url)
        .await
        .context("connecting to the write database")?;
    let generator = OpenAiChatGenerator::new(config.openai_config())
        .context("building the generation client")?;
    Ok(EphemerisPipeline::new(
        Arc::new(store),
        GenerationClient::new(Arc::new(generator)),
        config.resolver,
    )
    .with_conflict_policy(config.on_conflict))
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSuccess {
    pub date: String,
    pub outcome: RunOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub date: String,
    pub stage: PipelineStage,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub successes: Vec<BatchSuccess>,
    pub failures: Vec<BatchFailure>,
}

impl BatchSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn to_text(&self) -> String {
        let rule = "=".repeat(60);
        let mut lines = vec![
            rule.clone(),
            format!("Backfill summary (run {})", self.run_id),
            rule,
            format!("succeeded: {}/{}", self.succeeded, self.total),
            format!("failed:    {}/{}", self.failed, self.total),
        ];
        if !self.failures.is_empty() {
            lines.push(String::new());
            lines.push("errors:".to_string());
            for failure in &self.failures {
                lines.push(format!("  - {}: {}", failure.date, failure.error));
            }
        }
        lines.join("\n")
    }
}

/// Runs the pipeline for each date in order, pausing between runs. A failed
/// date is recorded and the rest still run.
pub struct BatchRunner<'a> {
    pipeline: &'a EphemerisPipeline,
    delay: Duration,
    options: RunOptions,
}

impl<'a> BatchRunner<'a> {
    pub fn new(pipeline: &'a EphemerisPipeline) -> Self {
        Self {
            pipeline,
            delay: DEFAULT_BATCH_DELAY,
            options: RunOptions::default(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub async fn run(&self, dates: &[String]) -> BatchSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut successes = Vec::new();
        let mut failures = Vec::new();
        info!(%run_id, dates = dates.len(), "backfill started");

        for (idx, date) in dates.iter().enumerate() {
            info!(%run_id, %date, position = idx + 1, total = dates.len(), "regenerating date");
            // Every entry must be an explicit date; blank never means "tomorrow" here.
            let result = match PublicationKey::parse(date) {
                Ok(key) => self.pipeline.run_key(key, self.options).await,
                Err(err) => Err(PipelineError::InvalidDate(err)),
            };
            match result {
                Ok(outcome) => {
                    info!(%run_id, %date, "date completed");
                    successes.push(BatchSuccess {
                        date: date.clone(),
                        outcome,
                    });
                }
                Err(err) => {
                    error!(%run_id, %date, stage = ?err.stage(), error = %err, "date failed");
                    failures.push(BatchFailure {
                        date: date.clone(),
                        stage: err.stage(),
                        error: err.to_string(),
                    });
                }
            }

            if idx + 1 < dates.len() && !self.delay.is_zero() {
                info!(delay_secs = self.delay.as_secs_f64(), "waiting before next date");
                tokio::time::sleep(self.delay).await;
            }
        }

        BatchSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            total: dates.len(),
            succeeded: successes.len(),
            failed: failures.len(),
            successes,
            failures,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CoverageRow {
    pub id: Uuid,
    pub day: u32,
    pub category: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonthCoverage {
    pub year: i32,
    pub month: u32,
    pub expected_days: u32,
    pub rows: Vec<CoverageRow>,
    pub filled_days: Vec<u32>,
    pub missing_days: Vec<u32>,
}

impl MonthCoverage {
    pub fn is_complete(&self) -> bool {
        self.missing_days.is_empty()
    }

    pub fn to_text(&self) -> String {
        let name = month_name(self.month).unwrap_or("?");
        let mut lines = vec![
            format!("Ephemerides for {name} {}", self.year),
            String::new(),
            "DAY | CATEGORY  | TITLE".to_string(),
            "----+-----------+---------------------------------------------".to_string(),
        ];
        for row in &self.rows {
            let title: String = row.title.chars().take(40).collect();
            lines.push(format!("{:02}  | {:<9} | {title}", row.day, row.category));
        }
        lines.push(String::new());
        lines.push(format!(
            "days filled: {}",
            self.filled_days
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ));
        lines.push(format!("total records: {}", self.rows.len()));
        if self.is_complete() {
            lines.push(format!(
                "complete: {name} {} has {}/{} days",
                self.year, self.expected_days, self.expected_days
            ));
        } else {
            lines.push(format!(
                "gaps: {} ({} days missing)",
                self.missing_days
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
                self.missing_days.len()
            ));
        }
        lines.join("\n")
    }
}

/// Read-only scan of one publication month reporting filled and missing days.
pub async fn verify_month(store: &dyn EphemerisStore, year: i32, month: u32) -> Result<MonthCoverage> {
    let expected_days = days_in_month(year, month)
        .with_context(|| format!("{year}-{month:02} is not a valid month"))?;
    let stored = store
        .list_month(year, month)
        .await
        .with_context(|| format!("scanning ephemerides for {year}-{month:02}"))?;

    let rows: Vec<CoverageRow> = stored
        .into_iter()
        .map(|s| CoverageRow {
            id: s.id,
            day: s.record.key.day(),
            category: s.record.category.to_string(),
            title: s.record.title,
            created_at: s.created_at,
        })
        .collect();
    let mut filled_days: Vec<u32> = rows.iter().map(|r| r.day).collect();
    filled_days.sort_unstable();
    filled_days.dedup();
    let missing_days = (1..=expected_days)
        .filter(|d| filled_days.binary_search(d).is_err())
        .collect();

    Ok(MonthCoverage {
        year,
        month,
        expected_days,
        rows,
        filled_days,
        missing_days,
    })
}

/// Registers the daily job. Runs are serialised so at most one is in flight.
pub async fn build_scheduler(pipeline: Arc<EphemerisPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let gate = Arc::new(Mutex::new(()));
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        let gate = gate.clone();
        Box::pin(async move {
            let _running = gate.lock().await;
            match pipeline.run(None, RunOptions::default()).await {
                Ok(outcome) => info!(key = %outcome.key(), "scheduled ephemeris run finished"),
                Err(err) => error!(stage = ?err.stage(), error = %err, "scheduled ephemeris run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn run_scheduler(pipeline: Arc<EphemerisPipeline>, cron: &str) -> Result<()> {
    let mut sched = build_scheduler(pipeline, cron).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron, "scheduler running, ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
