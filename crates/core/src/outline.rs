use std::{collections::HashSet, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keys::{CourseKey, UsageKey};

/// Errors raised while building a course outline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutlineError {
    #[error("unknown course visibility: {0}")]
    UnknownVisibility(String),
    #[error("sequence {0} appears more than once in the outline")]
    DuplicateSequence(String),
    #[error("{usage_key} does not belong to course {course_key}")]
    ForeignBlock {
        course_key: String,
        usage_key: String,
    },
}

/// Who may see the course outline without being enrolled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CourseVisibility {
    Private,
    PublicOutline,
    Public,
}

impl CourseVisibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::PublicOutline => "public_outline",
            Self::Public => "public",
        }
    }
}

impl FromStr for CourseVisibility {
    type Err = OutlineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "private" => Ok(Self::Private),
            "public_outline" => Ok(Self::PublicOutline),
            "public" => Ok(Self::Public),
            other => Err(OutlineError::UnknownVisibility(other.to_string())),
        }
    }
}

impl fmt::Display for CourseVisibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamData {
    pub is_practice_exam: bool,
    pub is_proctored_enabled: bool,
    pub is_time_limited: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibilityData {
    pub hide_from_toc: bool,
    pub visible_to_staff_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseLearningSequence {
    pub usage_key: UsageKey,
    pub title: String,
    pub inaccessible_after_due: bool,
    pub exam: ExamData,
    pub visibility: VisibilityData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseSection {
    pub usage_key: UsageKey,
    pub title: String,
    pub visibility: VisibilityData,
    pub sequences: Vec<CourseLearningSequence>,
}

/// Read-optimized outline of a published course run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseOutline {
    pub course_key: CourseKey,
    pub title: String,
    pub published_at: DateTime<Utc>,
    pub published_version: String,
    pub entrance_exam_id: Option<String>,
    pub days_early_for_beta: Option<f64>,
    pub self_paced: bool,
    pub course_visibility: CourseVisibility,
    pub sections: Vec<CourseSection>,
}

impl CourseOutline {
    /// Validates and assembles an outline.
    ///
    /// Every block must live in `course_key` and no sequence may be listed
    /// under more than one section.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        course_key: CourseKey,
        title: String,
        published_at: DateTime<Utc>,
        published_version: String,
        entrance_exam_id: Option<String>,
        days_early_for_beta: Option<f64>,
        self_paced: bool,
        course_visibility: CourseVisibility,
        sections: Vec<CourseSection>,
    ) -> Result<Self, OutlineError> {
        {
            let mut seen = HashSet::new();
            for section in &sections {
                ensure_in_course(&course_key, &section.usage_key)?;
                for sequence in &section.sequences {
                    ensure_in_course(&course_key, &sequence.usage_key)?;
                    if !seen.insert(&sequence.usage_key) {
                        return Err(OutlineError::DuplicateSequence(
                            sequence.usage_key.to_string(),
                        ));
                    }
                }
            }
        }

        Ok(Self {
            course_key,
            title,
            published_at,
            published_version,
            entrance_exam_id,
            days_early_for_beta,
            self_paced,
            course_visibility,
            sections,
        })
    }

    /// Returns every sequence in outline order.
    pub fn sequences(&self) -> impl Iterator<Item = &CourseLearningSequence> {
        self.sections
            .iter()
            .flat_map(|section| section.sequences.iter())
    }

    pub fn num_sequences(&self) -> usize {
        self.sections
            .iter()
            .map(|section| section.sequences.len())
            .sum()
    }
}

fn ensure_in_course(course_key: &CourseKey, usage_key: &UsageKey) -> Result<(), OutlineError> {
    if usage_key.course_key() == course_key {
        Ok(())
    } else {
        Err(OutlineError::ForeignBlock {
            course_key: course_key.to_string(),
            usage_key: usage_key.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn course_key() -> CourseKey {
        "course-v1:TNL+7733+2021-01-22".parse().unwrap()
    }

    fn sequence(key: &CourseKey, id: &str) -> CourseLearningSequence {
        CourseLearningSequence {
            usage_key: key.make_usage_key("sequential", id).unwrap(),
            title: id.to_string(),
            inaccessible_after_due: false,
            exam: ExamData::default(),
            visibility: VisibilityData::default(),
        }
    }

    fn section(key: &CourseKey, id: &str, sequences: Vec<CourseLearningSequence>) -> CourseSection {
        CourseSection {
            usage_key: key.make_usage_key("chapter", id).unwrap(),
            title: id.to_string(),
            visibility: VisibilityData::default(),
            sequences,
        }
    }

    fn build(sections: Vec<CourseSection>) -> Result<CourseOutline, OutlineError> {
        CourseOutline::new(
            course_key(),
            "My Course".into(),
            Utc::now(),
            "5fd0c1".into(),
            None,
            None,
            false,
            CourseVisibility::Private,
            sections,
        )
    }

    #[test]
    fn sequences_follow_outline_order() {
        let key = course_key();
        let outline = build(vec![
            section(&key, "s1", vec![sequence(&key, "a"), sequence(&key, "b")]),
            section(&key, "s2", vec![sequence(&key, "c")]),
        ])
        .expect("valid outline");

        let ids: Vec<_> = outline.sequences().map(|s| s.title.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(outline.num_sequences(), 3);
    }

    #[test]
    fn rejects_sequences_listed_twice() {
        let key = course_key();
        let err = build(vec![
            section(&key, "s1", vec![sequence(&key, "a")]),
            section(&key, "s2", vec![sequence(&key, "a")]),
        ])
        .unwrap_err();
        assert!(matches!(err, OutlineError::DuplicateSequence(_)));
    }

    #[test]
    fn rejects_blocks_from_other_courses() {
        let key = course_key();
        let other: CourseKey = "course-v1:TNL+7733+2021-01-22+version@abc".parse().unwrap();
        let err = build(vec![section(&key, "s1", vec![sequence(&other, "a")])]).unwrap_err();
        assert!(matches!(err, OutlineError::ForeignBlock { .. }));
    }

    #[test]
    fn visibility_parses_known_values_only() {
        assert_eq!(
            "public_outline".parse::<CourseVisibility>().unwrap(),
            CourseVisibility::PublicOutline
        );
        assert_eq!(CourseVisibility::Public.to_string(), "public");
        assert!(matches!(
            "hidden".parse::<CourseVisibility>(),
            Err(OutlineError::UnknownVisibility(value)) if value == "hidden"
        ));
    }
}
