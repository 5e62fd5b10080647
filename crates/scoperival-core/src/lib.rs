//! Core domain model and session types for ScopeRival.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "scoperival-core";

/// Description attached to every change the checker records.
pub const CONTENT_UPDATED_DESCRIPTION: &str = "Website content has been updated";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompetitorStatus {
    Active,
    Checking,
    Error,
    /// Present in the stored schema; nothing in the check workflow sets or reads it.
    Paused,
}

impl CompetitorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Checking => "checking",
            Self::Error => "error",
            Self::Paused => "paused",
        }
    }
}

impl fmt::Display for CompetitorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompetitorStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "checking" => Ok(Self::Checking),
            "error" => Ok(Self::Error),
            "paused" => Ok(Self::Paused),
            other => Err(UnknownVariant {
                kind: "competitor_status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Content,
    Design,
    Structure,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Design => "design",
            Self::Structure => "structure",
        }
    }
}

impl FromStr for ChangeType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "content" => Ok(Self::Content),
            "design" => Ok(Self::Design),
            "structure" => Ok(Self::Structure),
            other => Err(UnknownVariant {
                kind: "change_type",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeSeverity {
    Low,
    Medium,
    High,
}

impl ChangeSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl FromStr for ChangeSeverity {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(UnknownVariant {
                kind: "change_severity",
                value: other.to_string(),
            }),
        }
    }
}

/// A tracked competitor website, owned by exactly one user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Competitor {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub url: String,
    pub status: CompetitorStatus,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_fingerprint: Option<String>,
    pub changes_detected: u32,
    pub added_at: DateTime<Utc>,
}

impl Competitor {
    /// Fresh row as the store creates it from a validated add request.
    pub fn from_new(owner_id: Uuid, new: NewCompetitor, added_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            name: new.name,
            url: new.url,
            status: CompetitorStatus::Active,
            last_checked: None,
            last_fingerprint: None,
            changes_detected: 0,
            added_at,
        }
    }

    /// The stored fingerprint, treating an empty string the same as none.
    pub fn baseline_fingerprint(&self) -> Option<&str> {
        self.last_fingerprint.as_deref().filter(|f| !f.is_empty())
    }

    pub fn apply(&mut self, patch: &CompetitorPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(last_checked) = patch.last_checked {
            self.last_checked = Some(last_checked);
        }
        if let Some(fingerprint) = &patch.last_fingerprint {
            self.last_fingerprint = Some(fingerprint.clone());
        }
        if let Some(changes) = patch.changes_detected {
            self.changes_detected = changes;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("competitor name must not be empty")]
    EmptyName,
    #[error("competitor url must not be empty")]
    EmptyUrl,
    #[error("competitor url must not contain whitespace: {0}")]
    InvalidUrl(String),
}

/// Add request for a competitor. Construct through [`NewCompetitor::new`] so the
/// name is trimmed and the url carries a scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCompetitor {
    pub name: String,
    pub url: String,
}

impl NewCompetitor {
    pub fn new(name: &str, url: &str) -> Result<Self, ValidationError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        Ok(Self {
            name: name.to_string(),
            url: normalize_url(url)?,
        })
    }
}

/// Prepends `https://` unless the caller already supplied an http(s) scheme.
pub fn normalize_url(input: &str) -> Result<String, ValidationError> {
    let url = input.trim();
    if url.is_empty() {
        return Err(ValidationError::EmptyUrl);
    }
    if url.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidUrl(url.to_string()));
    }
    let lower = url.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        Ok(url.to_string())
    } else {
        Ok(format!("https://{url}"))
    }
}

/// Partial competitor update. Only the fields the check workflow owns are patchable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompetitorPatch {
    pub status: Option<CompetitorStatus>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_fingerprint: Option<String>,
    pub changes_detected: Option<u32>,
}

impl CompetitorPatch {
    pub fn status(status: CompetitorStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Successful check: new baseline, timestamp, back to active.
    pub fn checked(fingerprint: impl Into<String>, checked_at: DateTime<Utc>) -> Self {
        Self {
            status: Some(CompetitorStatus::Active),
            last_checked: Some(checked_at),
            last_fingerprint: Some(fingerprint.into()),
            changes_detected: None,
        }
    }

    pub fn with_changes_detected(mut self, changes: u32) -> Self {
        self.changes_detected = Some(changes);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.last_checked.is_none()
            && self.last_fingerprint.is_none()
            && self.changes_detected.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewChangeRecord {
    pub competitor_id: Uuid,
    pub competitor_name: String,
    pub change_type: ChangeType,
    pub description: String,
    pub severity: ChangeSeverity,
    pub detected_at: DateTime<Utc>,
}

impl NewChangeRecord {
    /// The record written when a competitor's fingerprint moves.
    pub fn content_updated(competitor: &Competitor, detected_at: DateTime<Utc>) -> Self {
        Self {
            competitor_id: competitor.id,
            competitor_name: competitor.name.clone(),
            change_type: ChangeType::Content,
            description: CONTENT_UPDATED_DESCRIPTION.to_string(),
            severity: ChangeSeverity::Medium,
            detected_at,
        }
    }
}

/// Immutable history entry. `competitor_name` is a snapshot taken at detection time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: Uuid,
    pub competitor_id: Uuid,
    pub competitor_name: String,
    pub change_type: ChangeType,
    pub description: String,
    pub severity: ChangeSeverity,
    pub detected_at: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn from_new(new: NewChangeRecord) -> Self {
        Self {
            id: Uuid::new_v4(),
            competitor_id: new.competitor_id,
            competitor_name: new.competitor_name,
            change_type: new.change_type,
            description: new.description,
            severity: new.severity,
            detected_at: new.detected_at,
        }
    }
}

/// Headline figures for one owner's dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardSummary {
    pub total_competitors: usize,
    pub checks_in_progress: usize,
    pub changes_last_24h: usize,
}

impl DashboardSummary {
    pub fn from_rows(
        competitors: &[Competitor],
        changes: &[ChangeRecord],
        now: DateTime<Utc>,
    ) -> Self {
        let since = now - chrono::Duration::hours(24);
        Self {
            total_competitors: competitors.len(),
            checks_in_progress: competitors
                .iter()
                .filter(|c| c.status == CompetitorStatus::Checking)
                .count(),
            changes_last_24h: changes.iter().filter(|r| r.detected_at > since).count(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for JobStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownVariant {
                kind: "job_status",
                value: other.to_string(),
            }),
        }
    }
}

/// Audit row for an unattended (batch or scheduled) check of one competitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringJob {
    pub id: Uuid,
    pub competitor_id: Uuid,
    pub owner_id: Uuid,
    pub status: JobStatus,
    pub scheduled_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl MonitoringJob {
    pub fn running(competitor_id: Uuid, owner_id: Uuid, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            competitor_id,
            owner_id,
            status: JobStatus::Running,
            scheduled_at,
            completed_at: None,
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionKind {
    User,
    Service,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session has expired")]
    Expired,
    #[error("session was signed out")]
    Invalidated,
}

/// Authenticated caller identity. Passed explicitly to every store and checker
/// call; all row access is scoped to [`Session::user_id`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    user_id: Uuid,
    email: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    kind: SessionKind,
    invalidated: bool,
}

impl Session {
    /// Session created after the identity provider verified a user's token.
    pub fn authenticated(
        user_id: Uuid,
        email: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            user_id,
            email,
            expires_at,
            kind: SessionKind::User,
            invalidated: false,
        }
    }

    /// Non-expiring session used by scheduled runs acting on behalf of an owner.
    pub fn service(owner_id: Uuid) -> Self {
        Self {
            user_id: owner_id,
            email: None,
            expires_at: None,
            kind: SessionKind::Service,
            invalidated: false,
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_service(&self) -> bool {
        self.kind == SessionKind::Service
    }

    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }

    pub fn ensure_valid_at(&self, now: DateTime<Utc>) -> Result<(), SessionError> {
        if self.invalidated {
            return Err(SessionError::Invalidated);
        }
        match self.expires_at {
            Some(expires_at) if expires_at <= now => Err(SessionError::Expired),
            _ => Ok(()),
        }
    }

    pub fn ensure_valid(&self) -> Result<(), SessionError> {
        self.ensure_valid_at(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap()
    }

    #[test]
    fn url_without_scheme_gets_https() {
        assert_eq!(normalize_url("acme.com").unwrap(), "https://acme.com");
        assert_eq!(normalize_url("  acme.com/pricing ").unwrap(), "https://acme.com/pricing");
        assert_eq!(normalize_url("httpbin.org").unwrap(), "https://httpbin.org");
    }

    #[test]
    fn url_with_scheme_is_kept() {
        assert_eq!(normalize_url("http://acme.com").unwrap(), "http://acme.com");
        assert_eq!(normalize_url("HTTPS://Acme.com").unwrap(), "HTTPS://Acme.com");
    }

    #[test]
    fn bad_add_requests_are_rejected() {
        assert_eq!(NewCompetitor::new("  ", "acme.com"), Err(ValidationError::EmptyName));
        assert_eq!(NewCompetitor::new("Acme", ""), Err(ValidationError::EmptyUrl));
        assert!(matches!(
            NewCompetitor::new("Acme", "acme .com"),
            Err(ValidationError::InvalidUrl(_))
        ));
    }

    #[test]
    fn new_competitor_starts_active_without_baseline() {
        let owner = Uuid::new_v4();
        let competitor =
            Competitor::from_new(owner, NewCompetitor::new(" Acme ", "acme.com").unwrap(), ts());
        assert_eq!(competitor.name, "Acme");
        assert_eq!(competitor.status, CompetitorStatus::Active);
        assert_eq!(competitor.changes_detected, 0);
        assert!(competitor.baseline_fingerprint().is_none());
        assert!(competitor.last_checked.is_none());
    }

    #[test]
    fn empty_fingerprint_is_not_a_baseline() {
        let mut competitor = Competitor::from_new(
            Uuid::new_v4(),
            NewCompetitor::new("Acme", "acme.com").unwrap(),
            ts(),
        );
        competitor.last_fingerprint = Some(String::new());
        assert!(competitor.baseline_fingerprint().is_none());
        competitor.last_fingerprint = Some("abc".into());
        assert_eq!(competitor.baseline_fingerprint(), Some("abc"));
    }

    #[test]
    fn patch_only_touches_set_fields() {
        let mut competitor = Competitor::from_new(
            Uuid::new_v4(),
            NewCompetitor::new("Acme", "acme.com").unwrap(),
            ts(),
        );
        competitor.changes_detected = 2;
        competitor.apply(&CompetitorPatch::status(CompetitorStatus::Checking));
        assert_eq!(competitor.status, CompetitorStatus::Checking);
        assert_eq!(competitor.changes_detected, 2);

        competitor.apply(&CompetitorPatch::checked("xyz", ts()).with_changes_detected(3));
        assert_eq!(competitor.status, CompetitorStatus::Active);
        assert_eq!(competitor.last_fingerprint.as_deref(), Some("xyz"));
        assert_eq!(competitor.changes_detected, 3);
        assert_eq!(competitor.last_checked, Some(ts()));
    }

    #[test]
    fn enums_round_trip_through_their_storage_names() {
        for status in [
            CompetitorStatus::Active,
            CompetitorStatus::Checking,
            CompetitorStatus::Error,
            CompetitorStatus::Paused,
        ] {
            assert_eq!(status.as_str().parse::<CompetitorStatus>().unwrap(), status);
        }
        assert_eq!("medium".parse::<ChangeSeverity>().unwrap(), ChangeSeverity::Medium);
        assert_eq!("structure".parse::<ChangeType>().unwrap(), ChangeType::Structure);
        assert!("archived".parse::<CompetitorStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&CompetitorStatus::Checking).unwrap(),
            "\"checking\""
        );
    }

    #[test]
    fn dashboard_counts_checks_in_progress_and_recent_changes() {
        let owner = Uuid::new_v4();
        let mut idle = Competitor::from_new(owner, NewCompetitor::new("Acme", "acme.com").unwrap(), ts());
        let mut busy = idle.clone();
        busy.id = Uuid::new_v4();
        busy.status = CompetitorStatus::Checking;
        idle.status = CompetitorStatus::Error;

        let recent = ChangeRecord::from_new(NewChangeRecord::content_updated(&idle, ts() - Duration::hours(2)));
        let old = ChangeRecord::from_new(NewChangeRecord::content_updated(&idle, ts() - Duration::hours(30)));

        let summary = DashboardSummary::from_rows(&[idle, busy], &[recent, old], ts());
        assert_eq!(
            summary,
            DashboardSummary {
                total_competitors: 2,
                checks_in_progress: 1,
                changes_last_24h: 1,
            }
        );
    }

    #[test]
    fn session_expiry_and_sign_out() {
        let mut session =
            Session::authenticated(Uuid::new_v4(), None, Some(ts() + Duration::minutes(5)));
        assert!(session.ensure_valid_at(ts()).is_ok());
        assert_eq!(
            session.ensure_valid_at(ts() + Duration::minutes(5)),
            Err(SessionError::Expired)
        );
        session.invalidate();
        assert_eq!(session.ensure_valid_at(ts()), Err(SessionError::Invalidated));

        let service = Session::service(Uuid::new_v4());
        assert!(service.is_service());
        assert!(service.ensure_valid_at(ts() + Duration::days(3650)).is_ok());
    }
}
