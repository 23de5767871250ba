//! Read model of a course tree as exposed by the authoring store.
//!
//! Only the fields the outline projection consumes are modelled. The tree is
//! always read at depth 2: course, sections ("chapter" blocks) and sequences
//! ("sequential" blocks).

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::keys::UsageKey;

/// Root block of a course in the published branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthoringCourse {
    pub location: UsageKey,
    pub display_name: String,
    /// Last edit anywhere in the subtree; the authoring store reports it with
    /// its own fixed offset.
    pub subtree_edited_on: DateTime<FixedOffset>,
    pub course_version: String,
    #[serde(default)]
    pub entrance_exam_id: Option<String>,
    #[serde(default)]
    pub days_early_for_beta: Option<f64>,
    #[serde(default)]
    pub self_paced: bool,
    pub course_visibility: String,
    #[serde(default)]
    pub children: Vec<AuthoringSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthoringSection {
    pub location: UsageKey,
    pub display_name: String,
    #[serde(default)]
    pub hide_from_toc: bool,
    #[serde(default)]
    pub visible_to_staff_only: bool,
    #[serde(default)]
    pub children: Vec<AuthoringSequence>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthoringSequence {
    pub location: UsageKey,
    pub display_name: String,
    #[serde(default)]
    pub hide_after_due: bool,
    #[serde(default)]
    pub is_practice_exam: bool,
    #[serde(default)]
    pub is_proctored_enabled: bool,
    #[serde(default)]
    pub is_timed_exam: bool,
    #[serde(default)]
    pub hide_from_toc: bool,
    #[serde(default)]
    pub visible_to_staff_only: bool,
}
