//! Eligibility chain for certificates granted through the allowlist.
//!
//! The allowlist lists users who have explicitly been granted a certificate
//! in a course run, independent of their grade.

use async_trait::async_trait;
use serde::Serialize;

use crate::certificates::{CertificateStatus, GeneratedCertificate};
use crate::keys::CourseKey;

/// Lookups the eligibility chain needs, answered by whatever backs the service.
#[async_trait]
pub trait AllowlistFacts: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Global switch for automatic certificate generation.
    async fn auto_generation_enabled(&self) -> Result<bool, Self::Error>;

    /// Whether an invalidation entry exists for the learner in the course run.
    async fn has_invalidation(&self, user_id: i64, course: &CourseKey)
        -> Result<bool, Self::Error>;

    /// Whether the course run has opted into the allowlist feature.
    async fn course_uses_allowlist(&self, course: &CourseKey) -> Result<bool, Self::Error>;

    /// Whether an allowlist entry with its flag set exists.
    async fn is_allowlisted(&self, user_id: i64, course: &CourseKey) -> Result<bool, Self::Error>;

    async fn certificate_for(
        &self,
        user_id: i64,
        course: &CourseKey,
    ) -> Result<Option<GeneratedCertificate>, Self::Error>;
}

/// Why the chain stopped where it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowlistReason {
    AutoGenerationDisabled,
    Invalidated,
    AllowlistDisabled,
    NotAllowlisted,
    CertificateDownloadable,
    NoCertificate,
    CertificateRegenerable,
}

impl AllowlistReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AutoGenerationDisabled => "auto_generation_disabled",
            Self::Invalidated => "invalidated",
            Self::AllowlistDisabled => "allowlist_disabled",
            Self::NotAllowlisted => "not_allowlisted",
            Self::CertificateDownloadable => "certificate_downloadable",
            Self::NoCertificate => "no_certificate",
            Self::CertificateRegenerable => "certificate_regenerable",
        }
    }
}

/// Result of evaluating the allowlist chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllowlistOutcome {
    pub eligible: bool,
    pub reason: AllowlistReason,
    /// Status of the existing certificate, when one was consulted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_status: Option<CertificateStatus>,
}

impl AllowlistOutcome {
    fn denied(reason: AllowlistReason) -> Self {
        Self {
            eligible: false,
            reason,
            existing_status: None,
        }
    }
}

/// Decides whether an allowlist certificate may be created (or updated) for
/// the learner in the course run.
///
/// Checks run in a fixed order and stop at the first decisive one:
/// global switch, invalidation, course flag, allowlist membership, then the
/// status of any existing certificate.
pub async fn evaluate_allowlist<F>(
    facts: &F,
    user_id: i64,
    course: &CourseKey,
) -> Result<AllowlistOutcome, F::Error>
where
    F: AllowlistFacts + ?Sized,
{
    if !facts.auto_generation_enabled().await? {
        return Ok(AllowlistOutcome::denied(
            AllowlistReason::AutoGenerationDisabled,
        ));
    }

    // invalidation overrides the allowlist
    if facts.has_invalidation(user_id, course).await? {
        return Ok(AllowlistOutcome::denied(AllowlistReason::Invalidated));
    }

    if !facts.course_uses_allowlist(course).await? {
        return Ok(AllowlistOutcome::denied(AllowlistReason::AllowlistDisabled));
    }

    if !facts.is_allowlisted(user_id, course).await? {
        return Ok(AllowlistOutcome::denied(AllowlistReason::NotAllowlisted));
    }

    let certificate = facts.certificate_for(user_id, course).await?;
    Ok(status_outcome(certificate.map(|cert| cert.status)))
}

/// Existing-certificate policy: only a `downloadable` certificate blocks
/// regeneration.
pub fn status_outcome(existing: Option<CertificateStatus>) -> AllowlistOutcome {
    match existing {
        None => AllowlistOutcome {
            eligible: true,
            reason: AllowlistReason::NoCertificate,
            existing_status: None,
        },
        Some(CertificateStatus::Downloadable) => AllowlistOutcome {
            eligible: false,
            reason: AllowlistReason::CertificateDownloadable,
            existing_status: Some(CertificateStatus::Downloadable),
        },
        Some(status) => AllowlistOutcome {
            eligible: true,
            reason: AllowlistReason::CertificateRegenerable,
            existing_status: Some(status),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificates::CertificateMode;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Debug, thiserror::Error)]
    #[error("fake lookup failed")]
    struct FakeError;

    #[derive(Default)]
    struct FakeFacts {
        auto_enabled: bool,
        invalidated: bool,
        course_flag: bool,
        allowlisted: bool,
        existing: Option<CertificateStatus>,
        fail_on_invalidation: bool,
        calls: Mutex<Vec<&'static str>>,
    }

    impl FakeFacts {
        fn eligible_path() -> Self {
            Self {
                auto_enabled: true,
                course_flag: true,
                allowlisted: true,
                ..Self::default()
            }
        }

        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AllowlistFacts for FakeFacts {
        type Error = FakeError;

        async fn auto_generation_enabled(&self) -> Result<bool, FakeError> {
            self.record("auto");
            Ok(self.auto_enabled)
        }

        async fn has_invalidation(&self, _: i64, _: &CourseKey) -> Result<bool, FakeError> {
            self.record("invalidation");
            if self.fail_on_invalidation {
                return Err(FakeError);
            }
            Ok(self.invalidated)
        }

        async fn course_uses_allowlist(&self, _: &CourseKey) -> Result<bool, FakeError> {
            self.record("course_flag");
            Ok(self.course_flag)
        }

        async fn is_allowlisted(&self, _: i64, _: &CourseKey) -> Result<bool, FakeError> {
            self.record("allowlist");
            Ok(self.allowlisted)
        }

        async fn certificate_for(
            &self,
            user_id: i64,
            course: &CourseKey,
        ) -> Result<Option<GeneratedCertificate>, FakeError> {
            self.record("certificate");
            Ok(self.existing.map(|status| GeneratedCertificate {
                id: 1,
                user_id,
                course_id: course.clone(),
                mode: CertificateMode::Verified,
                grade: "0.9".into(),
                name: "Learner".into(),
                status,
                key: String::new(),
                verify_uuid: String::new(),
                download_url: String::new(),
                created_at: Utc::now(),
                modified_at: Utc::now(),
            }))
        }
    }

    fn course() -> CourseKey {
        "course-v1:edX+DemoX+Demo_Course".parse().unwrap()
    }

    #[tokio::test]
    async fn allowlisted_without_certificate_is_eligible() {
        let facts = FakeFacts::eligible_path();
        let outcome = evaluate_allowlist(&facts, 1, &course()).await.unwrap();
        assert!(outcome.eligible);
        assert_eq!(outcome.reason, AllowlistReason::NoCertificate);
        assert_eq!(
            facts.calls(),
            ["auto", "invalidation", "course_flag", "allowlist", "certificate"]
        );
    }

    #[tokio::test]
    async fn downloadable_certificate_blocks_regeneration() {
        let facts = FakeFacts {
            existing: Some(CertificateStatus::Downloadable),
            ..FakeFacts::eligible_path()
        };
        let outcome = evaluate_allowlist(&facts, 1, &course()).await.unwrap();
        assert!(!outcome.eligible);
        assert_eq!(outcome.reason, AllowlistReason::CertificateDownloadable);
        assert_eq!(outcome.existing_status, Some(CertificateStatus::Downloadable));
    }

    #[tokio::test]
    async fn other_existing_statuses_permit_regeneration() {
        for status in CertificateStatus::ALL
            .into_iter()
            .filter(|status| *status != CertificateStatus::Downloadable)
        {
            let facts = FakeFacts {
                existing: Some(status),
                ..FakeFacts::eligible_path()
            };
            let outcome = evaluate_allowlist(&facts, 1, &course()).await.unwrap();
            assert!(outcome.eligible, "{status} should permit generation");
            assert_eq!(outcome.reason, AllowlistReason::CertificateRegenerable);
        }
    }

    #[tokio::test]
    async fn invalidation_overrides_allowlist() {
        let facts = FakeFacts {
            invalidated: true,
            ..FakeFacts::eligible_path()
        };
        let outcome = evaluate_allowlist(&facts, 1, &course()).await.unwrap();
        assert!(!outcome.eligible);
        assert_eq!(outcome.reason, AllowlistReason::Invalidated);
        assert_eq!(facts.calls(), ["auto", "invalidation"]);
    }

    #[tokio::test]
    async fn global_switch_short_circuits_everything() {
        let facts = FakeFacts {
            auto_enabled: false,
            ..FakeFacts::eligible_path()
        };
        let outcome = evaluate_allowlist(&facts, 1, &course()).await.unwrap();
        assert_eq!(outcome.reason, AllowlistReason::AutoGenerationDisabled);
        assert_eq!(facts.calls(), ["auto"]);
    }

    #[tokio::test]
    async fn course_flag_and_membership_are_required() {
        let facts = FakeFacts {
            course_flag: false,
            ..FakeFacts::eligible_path()
        };
        let outcome = evaluate_allowlist(&facts, 1, &course()).await.unwrap();
        assert_eq!(outcome.reason, AllowlistReason::AllowlistDisabled);

        let facts = FakeFacts {
            allowlisted: false,
            ..FakeFacts::eligible_path()
        };
        let outcome = evaluate_allowlist(&facts, 1, &course()).await.unwrap();
        assert_eq!(outcome.reason, AllowlistReason::NotAllowlisted);
        assert!(!facts.calls().contains(&"certificate"));
    }

    #[tokio::test]
    async fn lookup_errors_propagate() {
        let facts = FakeFacts {
            fail_on_invalidation: true,
            ..FakeFacts::eligible_path()
        };
        assert!(evaluate_allowlist(&facts, 1, &course()).await.is_err());
    }
}
