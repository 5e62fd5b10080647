//! Competitor change-detection workflow, batch runs and scheduling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use scoperival_adapters::{
    DirectFingerprintSource, EndpointFingerprintSource, FingerprintError, FingerprintSource,
    HttpClientConfig,
};
use scoperival_core::{
    ChangeRecord, Competitor, CompetitorPatch, CompetitorStatus, JobStatus, MonitoringJob,
    NewChangeRecord, Session,
};
use scoperival_storage::{MemoryStore, PgStore, RetryingStore, Store, StoreError, StorePolicy};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "scoperival-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintMode {
    Endpoint,
    Direct,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub fingerprint_mode: FingerprintMode,
    pub fingerprint_endpoint: Option<String>,
    pub fingerprint_timeout_secs: u64,
    pub user_agent: String,
    pub serialize_checks: bool,
    pub scheduler_enabled: bool,
    pub check_cron: String,
    pub store_policy: StorePolicy,
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let fingerprint_endpoint = std::env::var("SCOPERIVAL_FINGERPRINT_ENDPOINT")
            .ok()
            .filter(|v| !v.trim().is_empty());
        let fingerprint_mode = match std::env::var("SCOPERIVAL_FINGERPRINT_MODE").as_deref() {
            Ok("direct") => FingerprintMode::Direct,
            Ok("endpoint") => FingerprintMode::Endpoint,
            _ if fingerprint_endpoint.is_some() => FingerprintMode::Endpoint,
            _ => FingerprintMode::Direct,
        };
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            fingerprint_mode,
            fingerprint_endpoint,
            fingerprint_timeout_secs: std::env::var("SCOPERIVAL_FINGERPRINT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            user_agent: std::env::var("SCOPERIVAL_USER_AGENT")
                .unwrap_or_else(|_| "scoperival-bot/0.1".to_string()),
            serialize_checks: env_flag("SCOPERIVAL_SERIALIZE_CHECKS", true),
            scheduler_enabled: env_flag("SCOPERIVAL_SCHEDULER_ENABLED", false),
            check_cron: std::env::var("SCOPERIVAL_CHECK_CRON")
                .unwrap_or_else(|_| "0 0 */6 * * *".to_string()),
            store_policy: StorePolicy::from_env(),
        }
    }

    pub fn checker_config(&self) -> CheckerConfig {
        CheckerConfig {
            fingerprint_timeout: Duration::from_secs(self.fingerprint_timeout_secs),
            serialize_checks: self.serialize_checks,
        }
    }

    pub fn build_fingerprint_source(&self) -> Result<Arc<dyn FingerprintSource>> {
        let http = HttpClientConfig {
            timeout: Duration::from_secs(self.fingerprint_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        };
        match self.fingerprint_mode {
            FingerprintMode::Endpoint => {
                let endpoint = self
                    .fingerprint_endpoint
                    .clone()
                    .context("SCOPERIVAL_FINGERPRINT_ENDPOINT is required in endpoint mode")?;
                let source = EndpointFingerprintSource::new(endpoint, http)
                    .context("building fingerprint endpoint client")?;
                Ok(Arc::new(source))
            }
            FingerprintMode::Direct => {
                let source =
                    DirectFingerprintSource::new(http).context("building direct page client")?;
                Ok(Arc::new(source))
            }
        }
    }

    /// Postgres when `DATABASE_URL` is set, otherwise a process-local store.
    pub async fn connect_store(&self) -> Result<Arc<dyn Store>> {
        match &self.database_url {
            Some(url) => {
                let pg = PgStore::connect(url).await?;
                pg.migrate().await?;
                Ok(Arc::new(RetryingStore::new(pg, self.store_policy)))
            }
            None => {
                warn!("DATABASE_URL not set; using in-memory store");
                Ok(Arc::new(RetryingStore::new(MemoryStore::new(), self.store_policy)))
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CheckerConfig {
    pub fingerprint_timeout: Duration,
    /// Hold a per-competitor permit for the whole check so overlapping
    /// invocations for one id run one after another.
    pub serialize_checks: bool,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            fingerprint_timeout: Duration::from_secs(30),
            serialize_checks: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckOutcome {
    ChangesDetected {
        competitor_id: Uuid,
        competitor_name: String,
        fingerprint: String,
        changes_detected: u32,
        /// `None` when the history write failed but the competitor update succeeded.
        change_record: Option<ChangeRecord>,
    },
    NoChanges {
        competitor_id: Uuid,
        competitor_name: String,
        fingerprint: String,
        /// First successful check: the fingerprint only seeded the baseline.
        baseline_seeded: bool,
    },
}

impl CheckOutcome {
    pub fn competitor_name(&self) -> &str {
        match self {
            Self::ChangesDetected {
                competitor_name, ..
            }
            | Self::NoChanges {
                competitor_name, ..
            } => competitor_name,
        }
    }

    pub fn is_change(&self) -> bool {
        matches!(self, Self::ChangesDetected { .. })
    }

    pub fn message(&self) -> String {
        match self {
            Self::ChangesDetected {
                competitor_name, ..
            } => format!("Changes detected! New changes found on {competitor_name}"),
            Self::NoChanges {
                competitor_name, ..
            } => format!("No changes found. {competitor_name} appears unchanged."),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckError {
    #[error("Monitoring service is temporarily unavailable: {message}")]
    SourceUnavailable { message: String },
    #[error("Network error: {message}")]
    NetworkError { message: String },
    #[error("Failed to fetch competitor data: {message}")]
    StoreReadFailed { message: String },
    #[error("Failed to update competitor data: {message}")]
    StoreWriteFailed { message: String },
    #[error("Competitor {id} not found")]
    NotFound { id: Uuid },
    #[error("Check cancelled")]
    Cancelled,
    #[error("Session rejected: {message}")]
    Unauthorized { message: String },
}

impl CheckError {
    fn from_fingerprint(err: FingerprintError) -> Self {
        if err.is_network() {
            Self::NetworkError {
                message: err.to_string(),
            }
        } else {
            Self::SourceUnavailable {
                message: err.to_string(),
            }
        }
    }

    fn store_read(err: StoreError) -> Self {
        match err {
            StoreError::Unauthorized(e) => Self::Unauthorized {
                message: e.to_string(),
            },
            other => Self::StoreReadFailed {
                message: other.to_string(),
            },
        }
    }

    fn store_write(err: StoreError) -> Self {
        match err {
            StoreError::Unauthorized(e) => Self::Unauthorized {
                message: e.to_string(),
            },
            other => Self::StoreWriteFailed {
                message: other.to_string(),
            },
        }
    }

    /// Whether the competitor row should be flipped to `error` after this failure.
    fn marks_competitor(&self) -> bool {
        !matches!(self, Self::NotFound { .. } | Self::Unauthorized { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckFailure {
    pub competitor_id: Uuid,
    pub competitor_name: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckRunSummary {
    pub run_id: Uuid,
    pub owner_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub checked: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub failures: Vec<CheckFailure>,
}

pub struct ChangeChecker {
    store: Arc<dyn Store>,
    source: Arc<dyn FingerprintSource>,
    config: CheckerConfig,
    per_competitor: Arc<PermitMap>,
}

type PermitMap = Mutex<HashMap<Uuid, Arc<Semaphore>>>;

async fn mark_error(store: &dyn Store, session: &Session, id: Uuid) {
    if let Err(err) = store
        .update_competitor(session, id, &CompetitorPatch::status(CompetitorStatus::Error))
        .await
    {
        warn!(error = %err, "could not mark competitor as errored");
    }
}

async fn release_entry(map: &PermitMap, id: Uuid) {
    let mut map = map.lock().await;
    // Only the map holds the semaphore once nobody else holds or waits on it.
    if map.get(&id).is_some_and(|s| Arc::strong_count(s) == 1) {
        map.remove(&id);
    }
}

/// Settles one check: error marking and the single-flight entry. If the check
/// future is dropped before [`CheckGuard::finish`], `Drop` does the same work
/// on a spawned task so the row never stays `checking`.
struct CheckGuard {
    store: Arc<dyn Store>,
    session: Session,
    competitor_id: Uuid,
    permits: Option<Arc<PermitMap>>,
    permit: Option<OwnedSemaphorePermit>,
    /// Set once the check may have written `checking`.
    started: bool,
    finished: bool,
}

impl CheckGuard {
    async fn finish(mut self, result: &Result<CheckOutcome, CheckError>) {
        self.finished = true;
        if let Err(err) = result {
            if self.started && err.marks_competitor() {
                mark_error(self.store.as_ref(), &self.session, self.competitor_id).await;
            }
        }
        drop(self.permit.take());
        if let Some(map) = self.permits.take() {
            release_entry(&map, self.competitor_id).await;
        }
    }
}

impl Drop for CheckGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        drop(self.permit.take());
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        warn!(competitor_id = %self.competitor_id, "check dropped before completion");
        let store = self.store.clone();
        let session = self.session.clone();
        let id = self.competitor_id;
        let started = self.started;
        let permits = self.permits.take();
        handle.spawn(async move {
            if started {
                mark_error(store.as_ref(), &session, id).await;
            }
            if let Some(map) = permits {
                release_entry(&map, id).await;
            }
        });
    }
}

impl ChangeChecker {
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn FingerprintSource>,
        config: CheckerConfig,
    ) -> Self {
        Self {
            store,
            source,
            config,
            per_competitor: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Number of competitors with a live single-flight permit entry.
    pub async fn in_flight_checks(&self) -> usize {
        self.per_competitor.lock().await.len()
    }

    pub async fn check_by_id(&self, session: &Session, id: Uuid) -> Result<CheckOutcome, CheckError> {
        let competitor = self
            .store
            .get_competitor(session, id)
            .await
            .map_err(CheckError::store_read)?
            .ok_or(CheckError::NotFound { id })?;
        self.check_for_changes(session, &competitor).await
    }

    pub async fn check_for_changes(
        &self,
        session: &Session,
        competitor: &Competitor,
    ) -> Result<CheckOutcome, CheckError> {
        self.check_for_changes_with_cancel(session, competitor, &CancellationToken::new())
            .await
    }

    /// Run one check. Cancelling `cancel` while the check waits for its turn or
    /// fetches aborts it with [`CheckError::Cancelled`]; a check cancelled
    /// before its turn writes nothing.
    pub async fn check_for_changes_with_cancel(
        &self,
        session: &Session,
        competitor: &Competitor,
        cancel: &CancellationToken,
    ) -> Result<CheckOutcome, CheckError> {
        session.ensure_valid().map_err(|e| CheckError::Unauthorized {
            message: e.to_string(),
        })?;

        let span = info_span!("check_competitor", competitor_id = %competitor.id, source = self.source.name());
        let mut guard = CheckGuard {
            store: self.store.clone(),
            session: session.clone(),
            competitor_id: competitor.id,
            permits: None,
            permit: None,
            started: false,
            finished: false,
        };

        let result = self
            .run_in_turn(&mut guard, session, competitor, cancel)
            .instrument(span.clone())
            .await;

        if let Err(err) = &result {
            span.in_scope(|| warn!(error = %err, "check failed"));
        }
        guard.finish(&result).instrument(span).await;
        result
    }

    async fn run_in_turn(
        &self,
        guard: &mut CheckGuard,
        session: &Session,
        competitor: &Competitor,
        cancel: &CancellationToken,
    ) -> Result<CheckOutcome, CheckError> {
        if self.config.serialize_checks {
            let semaphore = self.semaphore_for(competitor.id).await;
            guard.permits = Some(self.per_competitor.clone());
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CheckError::Cancelled),
                // Semaphores in the map are never closed.
                permit = semaphore.acquire_owned() => guard.permit = permit.ok(),
            }
        }
        if cancel.is_cancelled() {
            return Err(CheckError::Cancelled);
        }
        guard.started = true;
        self.run_check(session, competitor, cancel).await
    }

    async fn run_check(
        &self,
        session: &Session,
        competitor: &Competitor,
        cancel: &CancellationToken,
    ) -> Result<CheckOutcome, CheckError> {
        if let Err(err) = self
            .store
            .update_competitor(
                session,
                competitor.id,
                &CompetitorPatch::status(CompetitorStatus::Checking),
            )
            .await
        {
            warn!(error = %err, "could not mark competitor as checking");
        }

        let timeout = self.config.fingerprint_timeout;
        let fingerprint = tokio::select! {
            _ = cancel.cancelled() => return Err(CheckError::Cancelled),
            fetched = tokio::time::timeout(timeout, self.source.fingerprint(&competitor.url)) => {
                match fetched {
                    Err(_) => {
                        return Err(CheckError::NetworkError {
                            message: format!("fingerprint request timed out after {timeout:?}"),
                        })
                    }
                    Ok(result) => result.map_err(CheckError::from_fingerprint)?,
                }
            }
        };

        if cancel.is_cancelled() {
            return Err(CheckError::Cancelled);
        }

        let current = self
            .store
            .get_competitor(session, competitor.id)
            .await
            .map_err(CheckError::store_read)?
            .ok_or(CheckError::NotFound { id: competitor.id })?;

        let changed = current
            .baseline_fingerprint()
            .is_some_and(|previous| previous != fingerprint.hash);
        let now = Utc::now();

        if changed {
            let change_record = match self
                .store
                .insert_change_record(session, NewChangeRecord::content_updated(&current, now))
                .await
            {
                Ok(record) => Some(record),
                Err(err) => {
                    error!(error = %err, "could not record detected change");
                    None
                }
            };

            let changes_detected = current.changes_detected.saturating_add(1);
            self.store
                .update_competitor(
                    session,
                    current.id,
                    &CompetitorPatch::checked(fingerprint.hash.clone(), now)
                        .with_changes_detected(changes_detected),
                )
                .await
                .map_err(CheckError::store_write)?;

            info!(changes_detected, "changes detected");
            Ok(CheckOutcome::ChangesDetected {
                competitor_id: current.id,
                competitor_name: current.name,
                fingerprint: fingerprint.hash,
                changes_detected,
                change_record,
            })
        } else {
            let baseline_seeded = current.baseline_fingerprint().is_none();
            self.store
                .update_competitor(
                    session,
                    current.id,
                    &CompetitorPatch::checked(fingerprint.hash.clone(), now),
                )
                .await
                .map_err(CheckError::store_write)?;

            info!(baseline_seeded, "no changes");
            Ok(CheckOutcome::NoChanges {
                competitor_id: current.id,
                competitor_name: current.name,
                fingerprint: fingerprint.hash,
                baseline_seeded,
            })
        }
    }

    async fn semaphore_for(&self, id: Uuid) -> Arc<Semaphore> {
        let mut map = self.per_competitor.lock().await;
        map.entry(id)
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    /// Check every competitor the session owns, one after another, leaving a
    /// monitoring job row per competitor.
    pub async fn check_all(&self, session: &Session) -> Result<CheckRunSummary, CheckError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let competitors = self
            .store
            .list_competitors(session)
            .await
            .map_err(CheckError::store_read)?;

        let mut summary = CheckRunSummary {
            run_id,
            owner_id: session.user_id(),
            started_at,
            finished_at: started_at,
            checked: 0,
            changed: 0,
            unchanged: 0,
            failed: 0,
            failures: Vec::new(),
        };

        for competitor in &competitors {
            let job = match self
                .store
                .create_monitoring_job(
                    session,
                    MonitoringJob::running(competitor.id, session.user_id(), Utc::now()),
                )
                .await
            {
                Ok(job) => Some(job),
                Err(err) => {
                    warn!(%run_id, competitor_id = %competitor.id, error = %err, "could not open monitoring job");
                    None
                }
            };

            let result = self.check_for_changes(session, competitor).await;
            summary.checked += 1;
            let (status, error_message) = match &result {
                Ok(outcome) if outcome.is_change() => {
                    summary.changed += 1;
                    (JobStatus::Completed, None)
                }
                Ok(_) => {
                    summary.unchanged += 1;
                    (JobStatus::Completed, None)
                }
                Err(err) => {
                    summary.failed += 1;
                    summary.failures.push(CheckFailure {
                        competitor_id: competitor.id,
                        competitor_name: competitor.name.clone(),
                        message: err.to_string(),
                    });
                    (JobStatus::Failed, Some(err.to_string()))
                }
            };

            if let Some(job) = job {
                if let Err(err) = self
                    .store
                    .finish_monitoring_job(session, job.id, status, error_message, Utc::now())
                    .await
                {
                    warn!(%run_id, job_id = %job.id, error = %err, "could not close monitoring job");
                }
            }
        }

        summary.finished_at = Utc::now();
        info!(
            %run_id,
            owner_id = %summary.owner_id,
            checked = summary.checked,
            changed = summary.changed,
            failed = summary.failed,
            "check run complete"
        );
        Ok(summary)
    }

    /// Service-level run across every owner, each under its own service session.
    pub async fn check_all_owners(&self) -> Result<Vec<CheckRunSummary>, CheckError> {
        let owners = self
            .store
            .list_owner_ids()
            .await
            .map_err(CheckError::store_read)?;
        let mut summaries = Vec::with_capacity(owners.len());
        for owner_id in owners {
            let session = Session::service(owner_id);
            match self.check_all(&session).await {
                Ok(summary) => summaries.push(summary),
                Err(err) => warn!(%owner_id, error = %err, "check run failed for owner"),
            }
        }
        Ok(summaries)
    }
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    checker: Arc<ChangeChecker>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = &config.check_cron;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let checker = checker.clone();
        Box::pin(async move {
            match checker.check_all_owners().await {
                Ok(summaries) => info!(owners = summaries.len(), "scheduled check run finished"),
                Err(err) => error!(error = %err, "scheduled check run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn build_checker_from_env(config: &SyncConfig) -> Result<ChangeChecker> {
    let store = config.connect_store().await?;
    let source = config.build_fingerprint_source()?;
    Ok(ChangeChecker::new(store, source, config.checker_config()))
}
