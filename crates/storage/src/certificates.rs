use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use thiserror::Error;

use courseware_core::certificates::{
    CertificateError, CertificateMode, CertificateStatus, GeneratedCertificate,
};
use courseware_core::CourseKey;

use crate::{parse_rfc3339, to_rfc3339};

const CERTIFICATE_COLUMNS: &str = "id, user_id, course_id, mode, grade, name, status, key, \
     verify_uuid, download_url, created_at, modified_at";

/// Repository for generated certificate records.
#[derive(Clone)]
pub struct CertificateRepository {
    pool: SqlitePool,
}

impl CertificateRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns the learner's certificate for the course run, if any.
    pub async fn certificate_for_student(
        &self,
        user_id: i64,
        course_key: &CourseKey,
    ) -> Result<Option<GeneratedCertificate>, CertificateStoreError> {
        let sql = format!(
            "SELECT {CERTIFICATE_COLUMNS} FROM generated_certificates \
             WHERE user_id = ? AND course_id = ?"
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(course_key.without_version().to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(decode_certificate).transpose()
    }

    /// Fetches the certificate or creates an `unavailable` placeholder.
    ///
    /// The boolean is `true` when the row was created by this call.
    pub async fn get_or_create(
        &self,
        user_id: i64,
        course_key: &CourseKey,
        now: DateTime<Utc>,
    ) -> Result<(GeneratedCertificate, bool), CertificateStoreError> {
        let course_id = course_key.without_version().to_string();
        let timestamp = to_rfc3339(now);
        let inserted = sqlx::query(
            "INSERT INTO generated_certificates (user_id, course_id, status, created_at, modified_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(user_id, course_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(&course_id)
        .bind(CertificateStatus::Unavailable.as_str())
        .bind(&timestamp)
        .bind(&timestamp)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let certificate = self
            .certificate_for_student(user_id, course_key)
            .await?
            .ok_or_else(|| {
                CertificateStoreError::Decode(format!(
                    "certificate for user {user_id} in {course_id} vanished after insert"
                ))
            })?;

        Ok((certificate, inserted == 1))
    }

    /// Persists every mutable column of `certificate`.
    pub async fn save(&self, certificate: &GeneratedCertificate) -> Result<(), CertificateStoreError> {
        let updated = sqlx::query(
            "UPDATE generated_certificates \
             SET mode = ?, grade = ?, name = ?, status = ?, key = ?, verify_uuid = ?, download_url = ?, modified_at = ? \
             WHERE id = ?",
        )
        .bind(certificate.mode.as_str())
        .bind(&certificate.grade)
        .bind(&certificate.name)
        .bind(certificate.status.as_str())
        .bind(&certificate.key)
        .bind(&certificate.verify_uuid)
        .bind(&certificate.download_url)
        .bind(to_rfc3339(certificate.modified_at))
        .bind(certificate.id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(CertificateStoreError::NotFound(certificate.id));
        }
        Ok(())
    }
}

fn decode_certificate(row: &SqliteRow) -> Result<GeneratedCertificate, CertificateStoreError> {
    let course_id: String = row.get("course_id");
    let mode: String = row.get("mode");
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");
    let modified_at: String = row.get("modified_at");

    Ok(GeneratedCertificate {
        id: row.get("id"),
        user_id: row.get("user_id"),
        course_id: course_id
            .parse()
            .map_err(|_| CertificateStoreError::Decode(format!("invalid course id: {course_id}")))?,
        mode: mode.parse::<CertificateMode>()?,
        grade: row.get("grade"),
        name: row.get("name"),
        status: status.parse::<CertificateStatus>()?,
        key: row.get("key"),
        verify_uuid: row.get("verify_uuid"),
        download_url: row.get("download_url"),
        created_at: parse_timestamp(&created_at)?,
        modified_at: parse_timestamp(&modified_at)?,
    })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, CertificateStoreError> {
    parse_rfc3339(value)
        .ok_or_else(|| CertificateStoreError::Decode(format!("invalid timestamp: {value}")))
}

/// Repository for explicit certificate grants.
#[derive(Clone)]
pub struct AllowlistRepository {
    pool: SqlitePool,
}

impl AllowlistRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns `true` when an entry exists for the learner with its flag set.
    pub async fn is_allowlisted(
        &self,
        user_id: i64,
        course_key: &CourseKey,
    ) -> Result<bool, CertificateStoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM certificate_allowlist \
             WHERE user_id = ? AND course_id = ? AND allowlist = 1",
        )
        .bind(user_id)
        .bind(course_key.without_version().to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Adds the learner or updates the existing entry.
    pub async fn upsert(
        &self,
        user_id: i64,
        course_key: &CourseKey,
        allowlist: bool,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), CertificateStoreError> {
        sqlx::query(
            "INSERT INTO certificate_allowlist (user_id, course_id, allowlist, notes, created_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(user_id, course_id) DO UPDATE SET allowlist = excluded.allowlist, notes = excluded.notes",
        )
        .bind(user_id)
        .bind(course_key.without_version().to_string())
        .bind(allowlist)
        .bind(notes)
        .bind(to_rfc3339(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Repository for certificate invalidations.
#[derive(Clone)]
pub struct InvalidationRepository {
    pool: SqlitePool,
}

impl InvalidationRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns `true` when an active invalidation is attached to the learner's
    /// certificate for the course run.
    pub async fn has_invalidation(
        &self,
        user_id: i64,
        course_key: &CourseKey,
    ) -> Result<bool, CertificateStoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM certificate_invalidations i \
             JOIN generated_certificates c ON c.id = i.generated_certificate_id \
             WHERE c.user_id = ? AND c.course_id = ? AND i.active = 1 \
             LIMIT 1",
        )
        .bind(user_id)
        .bind(course_key.without_version().to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Records an invalidation for a certificate.
    pub async fn add(
        &self,
        certificate_id: i64,
        invalidated_by: Option<i64>,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), CertificateStoreError> {
        sqlx::query(
            "INSERT INTO certificate_invalidations (generated_certificate_id, invalidated_by, notes, active, created_at) \
             VALUES (?, ?, ?, 1, ?)",
        )
        .bind(certificate_id)
        .bind(invalidated_by)
        .bind(notes)
        .bind(to_rfc3339(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Marks every invalidation of the certificate inactive.
    #[cfg(test)]
    pub(crate) async fn deactivate(&self, certificate_id: i64) -> Result<u64, CertificateStoreError> {
        let updated = sqlx::query(
            "UPDATE certificate_invalidations SET active = 0 \
             WHERE generated_certificate_id = ? AND active = 1",
        )
        .bind(certificate_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated)
    }
}

/// Errors raised by the certificate repositories.
#[derive(Debug, Error)]
pub enum CertificateStoreError {
    #[error("certificate {0} not found")]
    NotFound(i64),
    #[error("stored certificate is invalid: {0}")]
    Invalid(#[from] CertificateError),
    #[error("failed to decode certificate row: {0}")]
    Decode(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
