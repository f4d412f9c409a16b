//! Sync pipeline: read profile URLs, fetch each profile, upsert it into the sheet.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sbt_adapters::{ProfileError, ProfileSource, SkillsBoostProfileSource, DEFAULT_PROFILE_PREFIX};
use sbt_core::{ProfileRecord, ProgressTable};
use sbt_storage::{
    GoogleSheetsBackend, HttpClientConfig, HttpFetcher, InMemorySheetBackend, SheetBackend,
    SheetError, SheetUpserter, UpsertOutcome,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sbt-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetBackendKind {
    Google,
    Memory,
}

/// How a run reacts to a failing line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Record the failure and continue with the next URL.
    Isolated,
    /// Abort the run on the first failure.
    FailFast,
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub listen_addr: String,
    pub port: u16,
    pub profiles_file: PathBuf,
    pub sheet_name: String,
    pub credentials_path: PathBuf,
    pub progress_rules_path: PathBuf,
    pub profile_prefix: String,
    pub sheet_backend: SheetBackendKind,
    pub run_mode: RunMode,
    pub dedupe_urls: bool,
    pub http_timeout_secs: Option<u64>,
    pub user_agent: String,
    pub sync_cron: Option<String>,
}

fn flag(value: Option<String>, default: bool) -> bool {
    value
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(default)
}

impl TrackerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            listen_addr: lookup("TRACKER_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: lookup("TRACKER_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5000),
            profiles_file: lookup("TRACKER_PROFILES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("updated_entries.csv")),
            sheet_name: lookup("TRACKER_SHEET_NAME").unwrap_or_else(|| "GCSJ Tracker".to_string()),
            credentials_path: lookup("TRACKER_CREDENTIALS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("credentials.json")),
            progress_rules_path: lookup("TRACKER_PROGRESS_RULES")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("rules/progress.yaml")),
            profile_prefix: lookup("TRACKER_PROFILE_PREFIX")
                .unwrap_or_else(|| DEFAULT_PROFILE_PREFIX.to_string()),
            sheet_backend: match lookup("TRACKER_SHEET_BACKEND").as_deref() {
                Some("memory") => SheetBackendKind::Memory,
                _ => SheetBackendKind::Google,
            },
            run_mode: if flag(lookup("TRACKER_FAIL_FAST"), false) {
                RunMode::FailFast
            } else {
                RunMode::Isolated
            },
            dedupe_urls: flag(lookup("TRACKER_DEDUPE_URLS"), true),
            http_timeout_secs: lookup("TRACKER_HTTP_TIMEOUT_SECS").and_then(|v| v.parse().ok()),
            user_agent: lookup("TRACKER_USER_AGENT").unwrap_or_else(|| "sbt-bot/0.1".to_string()),
            sync_cron: lookup("TRACKER_SYNC_CRON").filter(|v| !v.trim().is_empty()),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

pub async fn load_progress_table(path: &Path) -> Result<ProgressTable> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let table: ProgressTable =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    table
        .validate()
        .with_context(|| format!("validating {}", path.display()))?;
    Ok(table)
}

fn http_fetcher(config: &TrackerConfig) -> Result<HttpFetcher> {
    HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout_secs.map(Duration::from_secs),
        user_agent: Some(config.user_agent.clone()),
    })
}

/// Live profile fetcher rated against the configured rules file.
pub async fn profile_source_from_config(config: &TrackerConfig) -> Result<SkillsBoostProfileSource> {
    let table = load_progress_table(&config.progress_rules_path).await?;
    Ok(SkillsBoostProfileSource::new(http_fetcher(config)?, Arc::new(table))
        .with_prefix(config.profile_prefix.clone()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileLine {
    /// 1-based line number in the input file.
    pub line: usize,
    pub url: String,
}

/// Trims each line, skips blanks, and optionally keeps only the first
/// occurrence of a repeated URL. A leading byte-order mark is ignored.
pub fn parse_profile_urls(text: &str, dedupe: bool) -> Vec<ProfileLine> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut seen = HashSet::new();
    text.lines()
        .enumerate()
        .filter_map(|(idx, raw)| {
            let url = raw.trim();
            if url.is_empty() {
                return None;
            }
            if dedupe && !seen.insert(url.to_string()) {
                return None;
            }
            Some(ProfileLine {
                line: idx + 1,
                url: url.to_string(),
            })
        })
        .collect()
}

pub async fn read_profile_urls(path: &Path, dedupe: bool) -> Result<Vec<ProfileLine>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(parse_profile_urls(&text, dedupe))
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Fetch(#[from] ProfileError),
    #[error(transparent)]
    Upsert(#[from] SheetError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Fetch,
    Upsert,
}

impl ProcessError {
    pub fn stage(&self) -> FailureStage {
        match self {
            ProcessError::Fetch(_) => FailureStage::Fetch,
            ProcessError::Upsert(_) => FailureStage::Upsert,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Inserted { name: String },
    Updated { name: String },
    Failed { stage: FailureStage, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UrlOutcome {
    pub line: usize,
    pub url: String,
    #[serde(flatten)]
    pub status: OutcomeStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sheet_name: String,
    pub urls: usize,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
    pub outcomes: Vec<UrlOutcome>,
}

pub struct SyncPipeline {
    config: TrackerConfig,
    profiles: Arc<dyn ProfileSource>,
    upserter: SheetUpserter,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(
        config: TrackerConfig,
        profiles: Arc<dyn ProfileSource>,
        sheets: Arc<dyn SheetBackend>,
    ) -> Self {
        Self {
            config,
            profiles,
            upserter: SheetUpserter::new(sheets),
            run_lock: Mutex::new(()),
        }
    }

    /// Wire the live profile fetcher and the configured sheet backend.
    pub async fn from_config(config: TrackerConfig) -> Result<Self> {
        let profiles = profile_source_from_config(&config).await?;

        let sheets: Arc<dyn SheetBackend> = match config.sheet_backend {
            SheetBackendKind::Google => {
                let http = http_fetcher(&config)?;
                Arc::new(
                    GoogleSheetsBackend::from_credentials_file(
                        http.client().clone(),
                        &config.credentials_path,
                    )
                    .await?,
                )
            }
            SheetBackendKind::Memory => {
                warn!("using in-memory sheet backend; rows are discarded on exit");
                Arc::new(InMemorySheetBackend::new())
            }
        };

        Ok(Self::new(config, Arc::new(profiles), sheets))
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Fetch one profile and upsert it into the configured sheet.
    pub async fn process_one(
        &self,
        url: &str,
    ) -> Result<(ProfileRecord, UpsertOutcome), ProcessError> {
        let record = self.profiles.fetch_profile(url).await?;
        info!(url, name = %record.name, skill_badges = record.skill_badges, arcade_game = record.arcade_game, "fetched profile");
        let outcome = self.upserter.upsert(&self.config.sheet_name, &record).await?;
        Ok((record, outcome))
    }

    /// Process every URL of the input file in order. Runs never overlap.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let _running = self.run_lock.lock().await;
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let lines = read_profile_urls(&self.config.profiles_file, self.config.dedupe_urls).await?;
        info!(%run_id, urls = lines.len(), sheet = %self.config.sheet_name, "sync started");

        let mut outcomes = Vec::with_capacity(lines.len());
        let mut fetched = 0usize;

        for line in &lines {
            let status = match self.process_one(&line.url).await {
                Ok((record, UpsertOutcome::Inserted)) => {
                    fetched += 1;
                    OutcomeStatus::Inserted { name: record.name }
                }
                Ok((record, UpsertOutcome::Updated)) => {
                    fetched += 1;
                    OutcomeStatus::Updated { name: record.name }
                }
                Err(err) => {
                    if self.config.run_mode == RunMode::FailFast {
                        return Err(anyhow::Error::new(err)
                            .context(format!("line {}: {}", line.line, line.url)));
                    }
                    if err.stage() == FailureStage::Upsert {
                        fetched += 1;
                    }
                    warn!(%run_id, line = line.line, url = %line.url, error = %err, "profile skipped");
                    OutcomeStatus::Failed {
                        stage: err.stage(),
                        reason: err.to_string(),
                    }
                }
            };
            outcomes.push(UrlOutcome {
                line: line.line,
                url: line.url.clone(),
                status,
            });
        }

        let count = |pred: fn(&OutcomeStatus) -> bool| outcomes.iter().filter(|o| pred(&o.status)).count();
        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sheet_name: self.config.sheet_name.clone(),
            urls: lines.len(),
            fetched,
            inserted: count(|s| matches!(s, OutcomeStatus::Inserted { .. })),
            updated: count(|s| matches!(s, OutcomeStatus::Updated { .. })),
            failed: count(|s| matches!(s, OutcomeStatus::Failed { .. })),
            outcomes,
        };
        info!(
            %run_id,
            inserted = summary.inserted,
            updated = summary.updated,
            failed = summary.failed,
            "sync complete"
        );
        Ok(summary)
    }

    /// Schedule periodic runs when a cron expression (with seconds) is configured.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        let Some(cron) = &self.config.sync_cron else {
            return Ok(None);
        };

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                if let Err(err) = pipeline.run_once().await {
                    warn!(error = %format!("{err:#}"), "scheduled sync failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = TrackerConfig::from_env();
    let pipeline = SyncPipeline::from_config(config).await?;
    pipeline.run_once().await
}
