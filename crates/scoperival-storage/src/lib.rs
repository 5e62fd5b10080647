//! Persistent store contracts, insert notifications and store backends for ScopeRival.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scoperival_core::{
    ChangeRecord, Competitor, CompetitorPatch, JobStatus, MonitoringJob, NewChangeRecord,
    NewCompetitor, Session, SessionError,
};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

mod pg;

pub use pg::PgStore;

pub const CRATE_NAME: &str = "scoperival-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("session rejected: {0}")]
    Unauthorized(#[from] SessionError),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn competitor_not_found(id: Uuid) -> Self {
        Self::NotFound {
            entity: "competitor",
            id,
        }
    }

    /// Errors worth retrying for an idempotent read.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Unavailable(_))
    }
}

/// Insert notification for a change record, tagged with the owning account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub owner_id: Uuid,
    pub record: ChangeRecord,
}

/// Push feed of change-record inserts.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeNotification>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, notification: ChangeNotification) {
        // No receivers is fine; observers are optional.
        let _ = self.tx.send(notification);
    }

    pub fn receiver(&self) -> broadcast::Receiver<ChangeNotification> {
        self.tx.subscribe()
    }

    /// Run `on_insert` for every change record inserted for the session's owner
    /// until the returned handle is cancelled or dropped.
    pub fn subscribe<F>(&self, session: &Session, on_insert: F) -> Subscription
    where
        F: Fn(ChangeRecord) + Send + 'static,
    {
        let owner_id = session.user_id();
        let mut rx = self.receiver();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(notification) if notification.owner_id == owner_id => {
                        on_insert(notification.record)
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%owner_id, skipped, "change feed subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription {
            handle: Some(handle),
        }
    }
}

/// Cancellation handle returned by [`ChangeFeed::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn cancel(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Owner-scoped access to competitors, their change history and monitoring jobs.
///
/// Every call takes the caller's [`Session`]; implementations must reject
/// expired sessions and never expose rows belonging to another owner.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_competitor(
        &self,
        session: &Session,
        new: NewCompetitor,
    ) -> Result<Competitor, StoreError>;

    async fn get_competitor(
        &self,
        session: &Session,
        id: Uuid,
    ) -> Result<Option<Competitor>, StoreError>;

    /// Newest first by `added_at`.
    async fn list_competitors(&self, session: &Session) -> Result<Vec<Competitor>, StoreError>;

    async fn update_competitor(
        &self,
        session: &Session,
        id: Uuid,
        patch: &CompetitorPatch,
    ) -> Result<Competitor, StoreError>;

    /// Removes the competitor together with its change records and jobs.
    async fn delete_competitor(&self, session: &Session, id: Uuid) -> Result<(), StoreError>;

    async fn insert_change_record(
        &self,
        session: &Session,
        new: NewChangeRecord,
    ) -> Result<ChangeRecord, StoreError>;

    /// Newest first by `detected_at`, across all of the owner's competitors.
    async fn list_change_records(&self, session: &Session)
        -> Result<Vec<ChangeRecord>, StoreError>;

    async fn create_monitoring_job(
        &self,
        session: &Session,
        job: MonitoringJob,
    ) -> Result<MonitoringJob, StoreError>;

    async fn finish_monitoring_job(
        &self,
        session: &Session,
        job_id: Uuid,
        status: JobStatus,
        error_message: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn list_monitoring_jobs(
        &self,
        session: &Session,
        competitor_id: Uuid,
    ) -> Result<Vec<MonitoringJob>, StoreError>;

    /// Service-level listing of accounts that own at least one competitor.
    async fn list_owner_ids(&self) -> Result<Vec<Uuid>, StoreError>;

    fn change_feed(&self) -> &ChangeFeed;
}

#[async_trait]
impl<S: Store + ?Sized> Store for Arc<S> {
    async fn create_competitor(
        &self,
        session: &Session,
        new: NewCompetitor,
    ) -> Result<Competitor, StoreError> {
        (**self).create_competitor(session, new).await
    }

    async fn get_competitor(
        &self,
        session: &Session,
        id: Uuid,
    ) -> Result<Option<Competitor>, StoreError> {
        (**self).get_competitor(session, id).await
    }

    async fn list_competitors(&self, session: &Session) -> Result<Vec<Competitor>, StoreError> {
        (**self).list_competitors(session).await
    }

    async fn update_competitor(
        &self,
        session: &Session,
        id: Uuid,
        patch: &CompetitorPatch,
    ) -> Result<Competitor, StoreError> {
        (**self).update_competitor(session, id, patch).await
    }

    async fn delete_competitor(&self, session: &Session, id: Uuid) -> Result<(), StoreError> {
        (**self).delete_competitor(session, id).await
    }

    async fn insert_change_record(
        &self,
        session: &Session,
        new: NewChangeRecord,
    ) -> Result<ChangeRecord, StoreError> {
        (**self).insert_change_record(session, new).await
    }

    async fn list_change_records(
        &self,
        session: &Session,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        (**self).list_change_records(session).await
    }

    async fn create_monitoring_job(
        &self,
        session: &Session,
        job: MonitoringJob,
    ) -> Result<MonitoringJob, StoreError> {
        (**self).create_monitoring_job(session, job).await
    }

    async fn finish_monitoring_job(
        &self,
        session: &Session,
        job_id: Uuid,
        status: JobStatus,
        error_message: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        (**self)
            .finish_monitoring_job(session, job_id, status, error_message, completed_at)
            .await
    }

    async fn list_monitoring_jobs(
        &self,
        session: &Session,
        competitor_id: Uuid,
    ) -> Result<Vec<MonitoringJob>, StoreError> {
        (**self).list_monitoring_jobs(session, competitor_id).await
    }

    async fn list_owner_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        (**self).list_owner_ids().await
    }

    fn change_feed(&self) -> &ChangeFeed {
        (**self).change_feed()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    competitors: Vec<Competitor>,
    change_records: Vec<ChangeRecord>,
    jobs: Vec<MonitoringJob>,
}

impl MemoryState {
    fn owned_mut(&mut self, owner_id: Uuid, id: Uuid) -> Result<&mut Competitor, StoreError> {
        self.competitors
            .iter_mut()
            .find(|c| c.id == id && c.owner_id == owner_id)
            .ok_or_else(|| StoreError::competitor_not_found(id))
    }

    fn owns(&self, owner_id: Uuid, id: Uuid) -> bool {
        self.competitors
            .iter()
            .any(|c| c.id == id && c.owner_id == owner_id)
    }
}

/// Process-local store used by tests, demos and single-node deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    feed: ChangeFeed,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_competitor(
        &self,
        session: &Session,
        new: NewCompetitor,
    ) -> Result<Competitor, StoreError> {
        session.ensure_valid()?;
        let competitor = Competitor::from_new(session.user_id(), new, Utc::now());
        self.state.write().await.competitors.push(competitor.clone());
        debug!(competitor_id = %competitor.id, "competitor created");
        Ok(competitor)
    }

    async fn get_competitor(
        &self,
        session: &Session,
        id: Uuid,
    ) -> Result<Option<Competitor>, StoreError> {
        session.ensure_valid()?;
        let owner_id = session.user_id();
        Ok(self
            .state
            .read()
            .await
            .competitors
            .iter()
            .find(|c| c.id == id && c.owner_id == owner_id)
            .cloned())
    }

    async fn list_competitors(&self, session: &Session) -> Result<Vec<Competitor>, StoreError> {
        session.ensure_valid()?;
        let owner_id = session.user_id();
        let mut rows = self
            .state
            .read()
            .await
            .competitors
            .iter()
            .rev()
            .filter(|c| c.owner_id == owner_id)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.added_at.cmp(&a.added_at));
        Ok(rows)
    }

    async fn update_competitor(
        &self,
        session: &Session,
        id: Uuid,
        patch: &CompetitorPatch,
    ) -> Result<Competitor, StoreError> {
        session.ensure_valid()?;
        let mut state = self.state.write().await;
        let competitor = state.owned_mut(session.user_id(), id)?;
        competitor.apply(patch);
        Ok(competitor.clone())
    }

    async fn delete_competitor(&self, session: &Session, id: Uuid) -> Result<(), StoreError> {
        session.ensure_valid()?;
        let mut state = self.state.write().await;
        if !state.owns(session.user_id(), id) {
            return Err(StoreError::competitor_not_found(id));
        }
        state.competitors.retain(|c| c.id != id);
        state.change_records.retain(|r| r.competitor_id != id);
        state.jobs.retain(|j| j.competitor_id != id);
        Ok(())
    }

    async fn insert_change_record(
        &self,
        session: &Session,
        new: NewChangeRecord,
    ) -> Result<ChangeRecord, StoreError> {
        session.ensure_valid()?;
        let record = {
            let mut state = self.state.write().await;
            if !state.owns(session.user_id(), new.competitor_id) {
                return Err(StoreError::competitor_not_found(new.competitor_id));
            }
            let record = ChangeRecord::from_new(new);
            state.change_records.push(record.clone());
            record
        };
        self.feed.publish(ChangeNotification {
            owner_id: session.user_id(),
            record: record.clone(),
        });
        Ok(record)
    }

    async fn list_change_records(
        &self,
        session: &Session,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        session.ensure_valid()?;
        let owner_id = session.user_id();
        let state = self.state.read().await;
        let mut rows = state
            .change_records
            .iter()
            .rev()
            .filter(|r| state.owns(owner_id, r.competitor_id))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        Ok(rows)
    }

    async fn create_monitoring_job(
        &self,
        session: &Session,
        job: MonitoringJob,
    ) -> Result<MonitoringJob, StoreError> {
        session.ensure_valid()?;
        let mut state = self.state.write().await;
        if job.owner_id != session.user_id() || !state.owns(job.owner_id, job.competitor_id) {
            return Err(StoreError::competitor_not_found(job.competitor_id));
        }
        state.jobs.push(job.clone());
        Ok(job)
    }

    async fn finish_monitoring_job(
        &self,
        session: &Session,
        job_id: Uuid,
        status: JobStatus,
        error_message: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        session.ensure_valid()?;
        let owner_id = session.user_id();
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id && j.owner_id == owner_id)
            .ok_or(StoreError::NotFound {
                entity: "monitoring job",
                id: job_id,
            })?;
        job.status = status;
        job.error_message = error_message;
        job.completed_at = Some(completed_at);
        Ok(())
    }

    async fn list_monitoring_jobs(
        &self,
        session: &Session,
        competitor_id: Uuid,
    ) -> Result<Vec<MonitoringJob>, StoreError> {
        session.ensure_valid()?;
        let owner_id = session.user_id();
        let mut rows = self
            .state
            .read()
            .await
            .jobs
            .iter()
            .rev()
            .filter(|j| j.owner_id == owner_id && j.competitor_id == competitor_id)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.scheduled_at.cmp(&a.scheduled_at));
        Ok(rows)
    }

    async fn list_owner_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut owners = self
            .state
            .read()
            .await
            .competitors
            .iter()
            .map(|c| c.owner_id)
            .collect::<Vec<_>>();
        owners.sort();
        owners.dedup();
        Ok(owners)
    }

    fn change_feed(&self) -> &ChangeFeed {
        &self.feed
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// The one timeout/retry policy applied to every store call.
#[derive(Debug, Clone, Copy)]
pub struct StorePolicy {
    pub timeout: Duration,
    pub read_backoff: BackoffPolicy,
}

impl Default for StorePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            read_backoff: BackoffPolicy::default(),
        }
    }
}

impl StorePolicy {
    pub fn from_env() -> Self {
        let mut policy = Self::default();
        if let Some(secs) = std::env::var("SCOPERIVAL_STORE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            policy.timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = std::env::var("SCOPERIVAL_STORE_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            policy.read_backoff.max_retries = retries;
        }
        policy
    }
}

/// Wraps a store so every call is bounded by a timeout and idempotent reads are
/// retried with exponential backoff on transient failures. Writes are never retried.
#[derive(Debug)]
pub struct RetryingStore<S> {
    inner: S,
    policy: StorePolicy,
}

impl<S: Store> RetryingStore<S> {
    pub fn new(inner: S, policy: StorePolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn bounded<T, Fut>(&self, fut: Fut) -> Result<T, StoreError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.policy.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.policy.timeout)),
        }
    }

    async fn read<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let backoff = self.policy.read_backoff;
        let mut attempt = 0;
        loop {
            match self.bounded(call()).await {
                Err(err) if err.is_transient() && attempt < backoff.max_retries => {
                    let delay = backoff.delay_for_attempt(attempt);
                    warn!(op, attempt, ?delay, error = %err, "retrying store read");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl<S: Store> Store for RetryingStore<S> {
    async fn create_competitor(
        &self,
        session: &Session,
        new: NewCompetitor,
    ) -> Result<Competitor, StoreError> {
        self.bounded(self.inner.create_competitor(session, new)).await
    }

    async fn get_competitor(
        &self,
        session: &Session,
        id: Uuid,
    ) -> Result<Option<Competitor>, StoreError> {
        let inner = &self.inner;
        self.read("get_competitor", move || inner.get_competitor(session, id))
            .await
    }

    async fn list_competitors(&self, session: &Session) -> Result<Vec<Competitor>, StoreError> {
        let inner = &self.inner;
        self.read("list_competitors", move || inner.list_competitors(session))
            .await
    }

    async fn update_competitor(
        &self,
        session: &Session,
        id: Uuid,
        patch: &CompetitorPatch,
    ) -> Result<Competitor, StoreError> {
        self.bounded(self.inner.update_competitor(session, id, patch))
            .await
    }

    async fn delete_competitor(&self, session: &Session, id: Uuid) -> Result<(), StoreError> {
        self.bounded(self.inner.delete_competitor(session, id)).await
    }

    async fn insert_change_record(
        &self,
        session: &Session,
        new: NewChangeRecord,
    ) -> Result<ChangeRecord, StoreError> {
        self.bounded(self.inner.insert_change_record(session, new))
            .await
    }

    async fn list_change_records(
        &self,
        session: &Session,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        let inner = &self.inner;
        self.read("list_change_records", move || {
            inner.list_change_records(session)
        })
        .await
    }

    async fn create_monitoring_job(
        &self,
        session: &Session,
        job: MonitoringJob,
    ) -> Result<MonitoringJob, StoreError> {
        self.bounded(self.inner.create_monitoring_job(session, job))
            .await
    }

    async fn finish_monitoring_job(
        &self,
        session: &Session,
        job_id: Uuid,
        status: JobStatus,
        error_message: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.bounded(self.inner.finish_monitoring_job(
            session,
            job_id,
            status,
            error_message,
            completed_at,
        ))
        .await
    }

    async fn list_monitoring_jobs(
        &self,
        session: &Session,
        competitor_id: Uuid,
    ) -> Result<Vec<MonitoringJob>, StoreError> {
        let inner = &self.inner;
        self.read("list_monitoring_jobs", move || {
            inner.list_monitoring_jobs(session, competitor_id)
        })
        .await
    }

    async fn list_owner_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        let inner = &self.inner;
        self.read("list_owner_ids", move || inner.list_owner_ids())
            .await
    }

    fn change_feed(&self) -> &ChangeFeed {
        self.inner.change_feed()
    }
}
