//! Allowlist certificate eligibility and generation.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info};

use courseware_core::allowlist::{evaluate_allowlist, AllowlistFacts, AllowlistOutcome};
use courseware_core::certificates::{
    CertificateError, CertificateIssue, CertificateMode, CertificateStatus, GeneratedCertificate,
};
use courseware_core::CourseKey;
use courseware_remote::ModuleStoreError;
use courseware_storage::{CertificateStoreError, Database, UserError};

use crate::outline_sync::CourseTreeSource;
use crate::problem::{internal_error, parse_course_key, ProblemResponse};
use crate::router::AppState;
use crate::tasks::{Task, TaskQueue, TaskQueueError};
use crate::tracker::Tracker;

/// Global switch for automatic certificate generation.
pub const AUTO_CERTIFICATE_GENERATION_SWITCH: &str = "certificates.auto_certificate_generation";
/// Course-scoped flag opting a run into allowlist certificates.
pub const USE_ALLOWLIST_FLAG: &str = "certificates_revamp.use_allowlist";

/// Answers the allowlist chain's questions from the database.
#[derive(Clone)]
pub struct CertificateGate {
    storage: Database,
    auto_generation_default: bool,
}

impl CertificateGate {
    /// `auto_generation_default` applies while the switch has never been set.
    pub fn new(storage: Database, auto_generation_default: bool) -> Self {
        Self {
            storage,
            auto_generation_default,
        }
    }
}

#[async_trait]
impl AllowlistFacts for CertificateGate {
    type Error = GateError;

    async fn auto_generation_enabled(&self) -> Result<bool, GateError> {
        let stored = self
            .storage
            .flags()
            .switch_state(AUTO_CERTIFICATE_GENERATION_SWITCH)
            .await?;
        Ok(stored.unwrap_or(self.auto_generation_default))
    }

    async fn has_invalidation(&self, user_id: i64, course: &CourseKey) -> Result<bool, GateError> {
        Ok(self
            .storage
            .invalidations()
            .has_invalidation(user_id, course)
            .await?)
    }

    async fn course_uses_allowlist(&self, course: &CourseKey) -> Result<bool, GateError> {
        Ok(self
            .storage
            .flags()
            .course_flag_enabled(USE_ALLOWLIST_FLAG, course)
            .await?)
    }

    async fn is_allowlisted(&self, user_id: i64, course: &CourseKey) -> Result<bool, GateError> {
        Ok(self.storage.allowlist().is_allowlisted(user_id, course).await?)
    }

    async fn certificate_for(
        &self,
        user_id: i64,
        course: &CourseKey,
    ) -> Result<Option<GeneratedCertificate>, GateError> {
        Ok(self
            .storage
            .certificates()
            .certificate_for_student(user_id, course)
            .await?)
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("failed to read feature flags: {0}")]
    Flags(#[from] sqlx::Error),
    #[error(transparent)]
    Certificates(#[from] CertificateStoreError),
}

/// Schedules and writes allowlist certificates.
#[derive(Clone)]
pub struct CertificateService {
    gate: CertificateGate,
    storage: Database,
    courses: Arc<dyn CourseTreeSource>,
    tasks: TaskQueue,
    tracker: Tracker,
    delay: Duration,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl CertificateService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gate: CertificateGate,
        storage: Database,
        courses: Arc<dyn CourseTreeSource>,
        tasks: TaskQueue,
        tracker: Tracker,
        delay: Duration,
        clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    ) -> Self {
        Self {
            gate,
            storage,
            courses,
            tasks,
            tracker,
            delay,
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Runs the eligibility chain for the learner in the course run.
    pub async fn can_generate_allowlist_certificate(
        &self,
        user_id: i64,
        course_key: &CourseKey,
    ) -> Result<AllowlistOutcome, GateError> {
        let outcome = evaluate_allowlist(&self.gate, user_id, course_key).await?;
        counter!("allowlist_checks_total", "reason" => outcome.reason.as_str()).increment(1);
        Ok(outcome)
    }

    /// Queues generation when the learner is eligible. Returns whether a task
    /// was submitted.
    pub async fn generate_allowlist_certificate_task(
        &self,
        user_id: i64,
        course_key: &CourseKey,
    ) -> Result<bool, GenerationError> {
        let outcome = self
            .can_generate_allowlist_certificate(user_id, course_key)
            .await?;
        if !outcome.eligible {
            info!(
                stage = "certificates",
                user_id,
                course_id = %course_key,
                reason = outcome.reason.as_str(),
                "cannot generate an allowlist certificate"
            );
            return Ok(false);
        }

        info!(
            stage = "certificates",
            user_id,
            course_id = %course_key,
            "about to create an allowlist certificate task"
        );
        self.tasks.apply_async(
            Task::GenerateCertificate {
                student: user_id,
                course_key: course_key.clone(),
                allowlist_certificate: true,
            },
            self.delay,
        )?;
        Ok(true)
    }

    /// Generates the certificate and emits `created` when it ends up passing.
    pub async fn generate_allowlist_certificate(
        &self,
        user_id: i64,
        course_key: &CourseKey,
    ) -> Result<CertificateStatus, GenerationError> {
        let cert = self.generate_certificate(user_id, course_key).await?;

        if cert.status.is_passing() {
            self.tracker.emit_certificate_event(
                "created",
                user_id,
                course_key,
                json!({
                    "user_id": user_id,
                    "course_id": course_key,
                    "certificate_id": cert.verify_uuid,
                    "enrollment_mode": cert.mode,
                }),
                self.now(),
            );
        }
        Ok(cert.status)
    }

    async fn generate_certificate(
        &self,
        user_id: i64,
        course_key: &CourseKey,
    ) -> Result<GeneratedCertificate, GenerationError> {
        let users = self.storage.users();
        users.get(user_id).await?;
        let profile = users.profile(user_id).await?;

        self.courses.published_course(course_key, 0).await?;
        let percent = self.storage.grades().read_percent(user_id, course_key).await?;
        let enrollment = self
            .storage
            .enrollments()
            .mode_for_user(user_id, course_key)
            .await?
            .ok_or_else(|| GenerationError::NotEnrolled {
                user_id,
                course_key: course_key.to_string(),
            })?;
        let mode: CertificateMode = enrollment.mode.parse()?;

        let certificates = self.storage.certificates();
        let now = self.now();
        let (mut cert, _created) = certificates.get_or_create(user_id, course_key, now).await?;
        cert.apply_issue(CertificateIssue::new(mode, percent, profile.name), now);
        certificates.save(&cert).await?;

        counter!("certificates_generated_total", "status" => cert.status.as_str()).increment(1);
        info!(
            stage = "certificates",
            user_id,
            course_id = %cert.course_id,
            status = %cert.status,
            "generated certificate"
        );
        Ok(cert)
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error(transparent)]
    User(#[from] UserError),
    #[error("failed to load course: {0}")]
    Course(#[from] ModuleStoreError),
    #[error("user {user_id} is not enrolled in {course_key}")]
    NotEnrolled { user_id: i64, course_key: String },
    #[error("enrollment cannot be certified: {0}")]
    Mode(#[from] CertificateError),
    #[error("eligibility check failed: {0}")]
    Gate(#[from] GateError),
    #[error(transparent)]
    Store(#[from] CertificateStoreError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to queue generation: {0}")]
    Queue(#[from] TaskQueueError),
}

#[derive(Debug, Deserialize)]
pub struct EligibilityQuery {
    user_id: i64,
    course_key: String,
}

pub async fn allowlist_eligibility(
    State(state): State<AppState>,
    Query(query): Query<EligibilityQuery>,
) -> Result<Json<AllowlistOutcome>, ProblemResponse> {
    let course_key = parse_course_key(&query.course_key)?;
    state
        .certificates()
        .can_generate_allowlist_certificate(query.user_id, &course_key)
        .await
        .map(Json)
        .map_err(|err| {
            error!(stage = "certificates", user_id = query.user_id, course_id = %course_key, error = %err, "allowlist check failed");
            internal_error("failed to evaluate allowlist eligibility")
        })
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    user_id: i64,
    course_key: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerateResponse {
    pub scheduled: bool,
}

pub async fn generate_allowlist(
    State(state): State<AppState>,
    Json(body): Json<GenerateRequest>,
) -> Result<(StatusCode, Json<GenerateResponse>), ProblemResponse> {
    let course_key = parse_course_key(&body.course_key)?;

    match state.storage().users().get(body.user_id).await {
        Ok(_) => {}
        Err(UserError::NotFound(_)) => {
            return Err(ProblemResponse::new(
                StatusCode::NOT_FOUND,
                "user_not_found",
                format!("user {} does not exist", body.user_id),
            ));
        }
        Err(err) => {
            error!(stage = "certificates", user_id = body.user_id, error = %err, "failed to load user");
            return Err(internal_error("failed to load user"));
        }
    }

    let scheduled = state
        .certificates()
        .generate_allowlist_certificate_task(body.user_id, &course_key)
        .await
        .map_err(|err| {
            error!(stage = "certificates", user_id = body.user_id, course_id = %course_key, error = %err, "failed to schedule certificate");
            internal_error("failed to schedule allowlist certificate")
        })?;

    let status = if scheduled {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(GenerateResponse { scheduled })))
}
