use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use thiserror::Error;

use courseware_core::outline::{
    CourseLearningSequence, CourseOutline, CourseSection, CourseVisibility, ExamData,
    OutlineError, VisibilityData,
};
use courseware_core::{CourseKey, UsageKey};

use crate::{parse_rfc3339, to_rfc3339};

/// Repository backing the read-optimized outline store.
#[derive(Clone)]
pub struct OutlineRepository {
    pool: SqlitePool,
}

impl OutlineRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Replaces the stored outline for the course wholesale.
    ///
    /// Sections and sequences of any previous outline are removed in the same
    /// transaction, so readers never observe a mix of two publishes.
    pub async fn replace(
        &self,
        outline: &CourseOutline,
        updated_at: DateTime<Utc>,
    ) -> Result<(), OutlineStoreError> {
        let course_key = outline.course_key.to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM course_sequences WHERE course_key = ?")
            .bind(&course_key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM course_sections WHERE course_key = ?")
            .bind(&course_key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM course_outlines WHERE course_key = ?")
            .bind(&course_key)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO course_outlines \
             (course_key, title, published_at, published_version, entrance_exam_id, days_early_for_beta, self_paced, course_visibility, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&course_key)
        .bind(&outline.title)
        .bind(to_rfc3339(outline.published_at))
        .bind(&outline.published_version)
        .bind(&outline.entrance_exam_id)
        .bind(outline.days_early_for_beta)
        .bind(outline.self_paced)
        .bind(outline.course_visibility.as_str())
        .bind(to_rfc3339(updated_at))
        .execute(&mut *tx)
        .await?;

        let mut sequence_ordering = 0i64;
        for (section_ordering, section) in outline.sections.iter().enumerate() {
            let section_key = section.usage_key.to_string();
            sqlx::query(
                "INSERT INTO course_sections \
                 (course_key, ordering, usage_key, title, hide_from_toc, visible_to_staff_only) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&course_key)
            .bind(section_ordering as i64)
            .bind(&section_key)
            .bind(&section.title)
            .bind(section.visibility.hide_from_toc)
            .bind(section.visibility.visible_to_staff_only)
            .execute(&mut *tx)
            .await?;

            for sequence in &section.sequences {
                sqlx::query(
                    "INSERT INTO course_sequences \
                     (course_key, section_usage_key, ordering, usage_key, title, inaccessible_after_due, is_practice_exam, is_proctored_enabled, is_time_limited, hide_from_toc, visible_to_staff_only) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&course_key)
                .bind(&section_key)
                .bind(sequence_ordering)
                .bind(sequence.usage_key.to_string())
                .bind(&sequence.title)
                .bind(sequence.inaccessible_after_due)
                .bind(sequence.exam.is_practice_exam)
                .bind(sequence.exam.is_proctored_enabled)
                .bind(sequence.exam.is_time_limited)
                .bind(sequence.visibility.hide_from_toc)
                .bind(sequence.visibility.visible_to_staff_only)
                .execute(&mut *tx)
                .await?;
                sequence_ordering += 1;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Loads the outline most recently stored for the course.
    pub async fn get(&self, course_key: &CourseKey) -> Result<CourseOutline, OutlineStoreError> {
        let key = course_key.without_version().to_string();
        let row = sqlx::query(
            "SELECT title, published_at, published_version, entrance_exam_id, days_early_for_beta, self_paced, course_visibility \
             FROM course_outlines WHERE course_key = ?",
        )
        .bind(&key)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(OutlineStoreError::NotFound)?;

        let section_rows = sqlx::query(
            "SELECT usage_key, title, hide_from_toc, visible_to_staff_only \
             FROM course_sections WHERE course_key = ? ORDER BY ordering",
        )
        .bind(&key)
        .fetch_all(&self.pool)
        .await?;

        let sequence_rows = sqlx::query(
            "SELECT section_usage_key, usage_key, title, inaccessible_after_due, is_practice_exam, is_proctored_enabled, is_time_limited, hide_from_toc, visible_to_staff_only \
             FROM course_sequences WHERE course_key = ? ORDER BY ordering",
        )
        .bind(&key)
        .fetch_all(&self.pool)
        .await?;

        let mut sections = section_rows
            .iter()
            .map(|row| {
                Ok(CourseSection {
                    usage_key: parse_usage_key(row.get("usage_key"))?,
                    title: row.get("title"),
                    visibility: VisibilityData {
                        hide_from_toc: row.get("hide_from_toc"),
                        visible_to_staff_only: row.get("visible_to_staff_only"),
                    },
                    sequences: Vec::new(),
                })
            })
            .collect::<Result<Vec<_>, OutlineStoreError>>()?;

        for row in &sequence_rows {
            let section_key = parse_usage_key(row.get("section_usage_key"))?;
            let section = sections
                .iter_mut()
                .find(|section| section.usage_key == section_key)
                .ok_or_else(|| {
                    OutlineStoreError::Decode(format!("orphaned sequence in section {section_key}"))
                })?;
            section.sequences.push(decode_sequence(row)?);
        }

        let published_at: String = row.get("published_at");
        let visibility: String = row.get("course_visibility");
        let outline = CourseOutline::new(
            course_key.without_version(),
            row.get("title"),
            parse_rfc3339(&published_at).ok_or_else(|| {
                OutlineStoreError::Decode(format!("invalid published_at: {published_at}"))
            })?,
            row.get("published_version"),
            row.get("entrance_exam_id"),
            row.get("days_early_for_beta"),
            row.get("self_paced"),
            visibility.parse::<CourseVisibility>()?,
            sections,
        )?;

        Ok(outline)
    }

    /// Returns `true` when an outline is stored for the course.
    pub async fn exists(&self, course_key: &CourseKey) -> Result<bool, OutlineStoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM course_outlines WHERE course_key = ?")
            .bind(course_key.without_version().to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

fn decode_sequence(row: &SqliteRow) -> Result<CourseLearningSequence, OutlineStoreError> {
    Ok(CourseLearningSequence {
        usage_key: parse_usage_key(row.get("usage_key"))?,
        title: row.get("title"),
        inaccessible_after_due: row.get("inaccessible_after_due"),
        exam: ExamData {
            is_practice_exam: row.get("is_practice_exam"),
            is_proctored_enabled: row.get("is_proctored_enabled"),
            is_time_limited: row.get("is_time_limited"),
        },
        visibility: VisibilityData {
            hide_from_toc: row.get("hide_from_toc"),
            visible_to_staff_only: row.get("visible_to_staff_only"),
        },
    })
}

fn parse_usage_key(value: String) -> Result<UsageKey, OutlineStoreError> {
    value
        .parse()
        .map_err(|_| OutlineStoreError::Decode(format!("invalid usage key: {value}")))
}

/// Errors that can occur while reading or writing outlines.
#[derive(Debug, Error)]
pub enum OutlineStoreError {
    #[error("course outline not found")]
    NotFound,
    #[error("stored outline is invalid: {0}")]
    Invalid(#[from] OutlineError),
    #[error("failed to decode stored outline: {0}")]
    Decode(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
