use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use courseware_core::CourseKey;

use crate::to_rfc3339;

/// Per-course override of a feature flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideChoice {
    On,
    Off,
}

impl OverrideChoice {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }
}

/// Switches, global flags and their course-level overrides.
#[derive(Clone)]
pub struct FeatureFlagRepository {
    pool: SqlitePool,
}

impl FeatureFlagRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// State of a switch, or `None` when it was never recorded.
    pub async fn switch_state(&self, name: &str) -> Result<Option<bool>, sqlx::Error> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT active FROM waffle_switches WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(active,)| active))
    }

    pub async fn set_switch(&self, name: &str, active: bool) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO waffle_switches (name, active) VALUES (?, ?) \
             ON CONFLICT(name) DO UPDATE SET active = excluded.active",
        )
        .bind(name)
        .bind(active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Sets the global value of a flag; `None` leaves it unset for everyone.
    pub async fn set_flag(&self, name: &str, everyone: Option<bool>) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO waffle_flags (name, everyone) VALUES (?, ?) \
             ON CONFLICT(name) DO UPDATE SET everyone = excluded.everyone",
        )
        .bind(name)
        .bind(everyone)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_course_override(
        &self,
        flag: &str,
        course_key: &CourseKey,
        choice: OverrideChoice,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO waffle_flag_course_overrides (flag_name, course_id, override_choice, enabled, created_at) \
             VALUES (?, ?, ?, 1, ?) \
             ON CONFLICT(flag_name, course_id) DO UPDATE SET override_choice = excluded.override_choice, enabled = 1",
        )
        .bind(flag)
        .bind(course_key.without_version().to_string())
        .bind(choice.as_str())
        .bind(to_rfc3339(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn clear_course_override(
        &self,
        flag: &str,
        course_key: &CourseKey,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM waffle_flag_course_overrides WHERE flag_name = ? AND course_id = ?")
            .bind(flag)
            .bind(course_key.without_version().to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Resolves a course-scoped flag.
    ///
    /// An enabled course override decides; otherwise the global `everyone`
    /// value applies, and an unset or unknown flag is off.
    pub async fn course_flag_enabled(
        &self,
        flag: &str,
        course_key: &CourseKey,
    ) -> Result<bool, sqlx::Error> {
        let choice: Option<(String,)> = sqlx::query_as(
            "SELECT override_choice FROM waffle_flag_course_overrides \
             WHERE flag_name = ? AND course_id = ? AND enabled = 1",
        )
        .bind(flag)
        .bind(course_key.without_version().to_string())
        .fetch_optional(&self.pool)
        .await?;

        match choice.as_ref().map(|(value,)| value.as_str()) {
            Some("on") => return Ok(true),
            Some("off") => return Ok(false),
            _ => {}
        }

        let everyone: Option<(Option<bool>,)> =
            sqlx::query_as("SELECT everyone FROM waffle_flags WHERE name = ?")
                .bind(flag)
                .fetch_optional(&self.pool)
                .await?;
        Ok(everyone.and_then(|(value,)| value).unwrap_or(false))
    }
}
