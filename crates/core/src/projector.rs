use chrono::Utc;

use crate::authoring::{AuthoringCourse, AuthoringSection, AuthoringSequence};
use crate::keys::CourseKey;
use crate::outline::{
    CourseLearningSequence, CourseOutline, CourseSection, CourseVisibility, ExamData,
    OutlineError, VisibilityData,
};

/// Pure projection of a published authoring tree into the outline shape.
pub struct OutlineProjector;

impl OutlineProjector {
    /// Builds the outline for `course_key` from the depth-2 published tree.
    ///
    /// Every usage key is mapped into `course_key` so versioned keys coming from
    /// the published branch do not leak into the outline store.
    pub fn project(
        course_key: &CourseKey,
        course: &AuthoringCourse,
    ) -> Result<CourseOutline, OutlineError> {
        let course_key = course_key.without_version();
        let sections = course
            .children
            .iter()
            .map(|section| Self::section(&course_key, section))
            .collect();

        CourseOutline::new(
            course_key,
            course.display_name.clone(),
            course.subtree_edited_on.with_timezone(&Utc),
            course.course_version.clone(),
            course.entrance_exam_id.clone(),
            course.days_early_for_beta,
            course.self_paced,
            course.course_visibility.parse::<CourseVisibility>()?,
            sections,
        )
    }

    fn section(course_key: &CourseKey, section: &AuthoringSection) -> CourseSection {
        CourseSection {
            usage_key: section.location.map_into_course(course_key),
            title: section.display_name.clone(),
            visibility: VisibilityData {
                hide_from_toc: section.hide_from_toc,
                visible_to_staff_only: section.visible_to_staff_only,
            },
            sequences: section
                .children
                .iter()
                .map(|sequence| Self::sequence(course_key, sequence))
                .collect(),
        }
    }

    fn sequence(course_key: &CourseKey, sequence: &AuthoringSequence) -> CourseLearningSequence {
        CourseLearningSequence {
            usage_key: sequence.location.map_into_course(course_key),
            title: sequence.display_name.clone(),
            inaccessible_after_due: sequence.hide_after_due,
            exam: ExamData {
                is_practice_exam: sequence.is_practice_exam,
                is_proctored_enabled: sequence.is_proctored_enabled,
                is_time_limited: sequence.is_timed_exam,
            },
            visibility: VisibilityData {
                hide_from_toc: sequence.hide_from_toc,
                visible_to_staff_only: sequence.visible_to_staff_only,
            },
        }
    }
}
