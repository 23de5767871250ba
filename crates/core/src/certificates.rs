use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::keys::CourseKey;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CertificateError {
    #[error("unknown certificate status: {0}")]
    UnknownStatus(String),
    #[error("unknown certificate mode: {0}")]
    UnknownMode(String),
}

/// Lifecycle states of a generated certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    Deleted,
    Deleting,
    Downloadable,
    Error,
    Generating,
    Notpassing,
    Restricted,
    Unavailable,
    Auditing,
    AuditPassing,
    AuditNotpassing,
    Unverified,
    Invalidated,
    Requesting,
}

impl CertificateStatus {
    pub const ALL: [Self; 14] = [
        Self::Deleted,
        Self::Deleting,
        Self::Downloadable,
        Self::Error,
        Self::Generating,
        Self::Notpassing,
        Self::Restricted,
        Self::Unavailable,
        Self::Auditing,
        Self::AuditPassing,
        Self::AuditNotpassing,
        Self::Unverified,
        Self::Invalidated,
        Self::Requesting,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deleted => "deleted",
            Self::Deleting => "deleting",
            Self::Downloadable => "downloadable",
            Self::Error => "error",
            Self::Generating => "generating",
            Self::Notpassing => "notpassing",
            Self::Restricted => "restricted",
            Self::Unavailable => "unavailable",
            Self::Auditing => "auditing",
            Self::AuditPassing => "audit_passing",
            Self::AuditNotpassing => "audit_notpassing",
            Self::Unverified => "unverified",
            Self::Invalidated => "invalidated",
            Self::Requesting => "requesting",
        }
    }

    /// Statuses that mean the learner earned the certificate.
    pub fn is_passing(self) -> bool {
        matches!(self, Self::Downloadable | Self::Generating)
    }
}

impl FromStr for CertificateStatus {
    type Err = CertificateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| CertificateError::UnknownStatus(value.to_string()))
    }
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enrollment track a certificate was issued for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertificateMode {
    Verified,
    #[default]
    Honor,
    Audit,
    Professional,
    NoIdProfessional,
    Masters,
    ExecutiveEducation,
}

impl CertificateMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::Honor => "honor",
            Self::Audit => "audit",
            Self::Professional => "professional",
            Self::NoIdProfessional => "no-id-professional",
            Self::Masters => "masters",
            Self::ExecutiveEducation => "executive-education",
        }
    }
}

impl FromStr for CertificateMode {
    type Err = CertificateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "verified" => Ok(Self::Verified),
            "honor" => Ok(Self::Honor),
            "audit" => Ok(Self::Audit),
            "professional" => Ok(Self::Professional),
            "no-id-professional" => Ok(Self::NoIdProfessional),
            "masters" => Ok(Self::Masters),
            "executive-education" => Ok(Self::ExecutiveEducation),
            other => Err(CertificateError::UnknownMode(other.to_string())),
        }
    }
}

impl fmt::Display for CertificateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Certificate record for one learner in one course run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedCertificate {
    pub id: i64,
    pub user_id: i64,
    pub course_id: CourseKey,
    pub mode: CertificateMode,
    pub grade: String,
    pub name: String,
    pub status: CertificateStatus,
    pub key: String,
    pub verify_uuid: String,
    pub download_url: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl GeneratedCertificate {
    /// Overwrites the record with a freshly issued certificate.
    pub fn apply_issue(&mut self, issue: CertificateIssue, now: DateTime<Utc>) {
        self.mode = issue.mode;
        self.grade = issue.grade;
        self.name = issue.name;
        self.download_url = String::new();
        self.key = issue.key;
        self.status = CertificateStatus::Downloadable;
        self.verify_uuid = issue.verify_uuid;
        self.modified_at = now;
    }
}

/// Values written onto a certificate each time it is (re)generated.
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateIssue {
    pub mode: CertificateMode,
    pub grade: String,
    pub name: String,
    pub key: String,
    pub verify_uuid: String,
}

impl CertificateIssue {
    /// Builds an issue with a fresh random key and verification token.
    pub fn new(mode: CertificateMode, grade_percent: f64, name: impl Into<String>) -> Self {
        let seed: f64 = rand::thread_rng().gen();
        Self {
            mode,
            grade: format_grade(grade_percent),
            name: name.into(),
            key: make_hashkey(&seed.to_string()),
            verify_uuid: new_verify_uuid(),
        }
    }
}

/// Renders a grade fraction the way it is stored on the record, always with
/// a fractional part (`1.0`, not `1`).
pub fn format_grade(percent: f64) -> String {
    format!("{percent:?}")
}

/// Returns a 32-character hex token used for public verification links.
pub fn new_verify_uuid() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Derives a 32-character hex key from `seed`.
pub fn make_hashkey(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    hex::encode(&digest[..16])
}
