use std::{fmt, str::FromStr};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const COURSE_PREFIX: &str = "course-v1:";
const BLOCK_PREFIX: &str = "block-v1:";

/// Errors raised when parsing opaque course or usage keys.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("invalid {kind} key: {value}")]
    Invalid { kind: &'static str, value: String },
}

impl KeyError {
    fn course(value: &str) -> Self {
        Self::Invalid {
            kind: "course",
            value: value.to_string(),
        }
    }

    fn usage(value: &str) -> Self {
        Self::Invalid {
            kind: "usage",
            value: value.to_string(),
        }
    }
}

/// Identifier of a course run, e.g. `course-v1:TNL+7733+2021-01-22`.
///
/// Keys read from the authoring store may carry branch and version
/// information; two keys only compare equal when those match too.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CourseKey {
    org: String,
    course: String,
    run: String,
    branch: Option<String>,
    version: Option<String>,
}

impl CourseKey {
    /// Builds an unversioned key from its parts.
    pub fn new(
        org: impl Into<String>,
        course: impl Into<String>,
        run: impl Into<String>,
    ) -> Result<Self, KeyError> {
        let key = Self {
            org: org.into(),
            course: course.into(),
            run: run.into(),
            branch: None,
            version: None,
        };
        if [&key.org, &key.course, &key.run]
            .iter()
            .all(|part| is_valid_part(part))
        {
            Ok(key)
        } else {
            Err(KeyError::course(&key.to_string()))
        }
    }

    pub fn org(&self) -> &str {
        &self.org
    }

    pub fn course(&self) -> &str {
        &self.course
    }

    pub fn run(&self) -> &str {
        &self.run
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Returns `true` when branch or version information is attached.
    pub fn is_versioned(&self) -> bool {
        self.branch.is_some() || self.version.is_some()
    }

    /// Returns a copy of the key with branch and version information stripped.
    pub fn without_version(&self) -> Self {
        Self {
            branch: None,
            version: None,
            ..self.clone()
        }
    }

    /// Returns a copy of the key pinned to the provided version.
    pub fn with_version(&self, version: impl Into<String>) -> Self {
        Self {
            version: Some(version.into()),
            ..self.clone()
        }
    }

    /// Returns a copy of the key pinned to the provided branch.
    pub fn with_branch(&self, branch: impl Into<String>) -> Self {
        Self {
            branch: Some(branch.into()),
            ..self.clone()
        }
    }

    /// Builds the usage key of a block that lives inside this course.
    pub fn make_usage_key(
        &self,
        block_type: impl Into<String>,
        block_id: impl Into<String>,
    ) -> Result<UsageKey, KeyError> {
        let usage = UsageKey {
            course_key: self.clone(),
            block_type: block_type.into(),
            block_id: block_id.into(),
        };
        if is_valid_part(&usage.block_type) && is_valid_part(&usage.block_id) {
            Ok(usage)
        } else {
            Err(KeyError::usage(&usage.to_string()))
        }
    }

    fn write_body(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}+{}", self.org, self.course, self.run)?;
        if let Some(branch) = &self.branch {
            write!(f, "+branch@{branch}")?;
        }
        if let Some(version) = &self.version {
            write!(f, "+version@{version}")?;
        }
        Ok(())
    }
}

impl fmt::Display for CourseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(COURSE_PREFIX)?;
        self.write_body(f)
    }
}

impl FromStr for CourseKey {
    type Err = KeyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let body = value
            .strip_prefix(COURSE_PREFIX)
            .ok_or_else(|| KeyError::course(value))?;
        let parts: Vec<&str> = body.split('+').collect();
        parse_course_parts(&parts).ok_or_else(|| KeyError::course(value))
    }
}

/// Identifier of a single block inside a course, e.g.
/// `block-v1:TNL+7733+2021-01-22+type@chapter+block@intro`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsageKey {
    course_key: CourseKey,
    block_type: String,
    block_id: String,
}

impl UsageKey {
    pub fn course_key(&self) -> &CourseKey {
        &self.course_key
    }

    pub fn block_type(&self) -> &str {
        &self.block_type
    }

    pub fn block_id(&self) -> &str {
        &self.block_id
    }

    /// Re-homes the block into `course_key`.
    ///
    /// Blocks read from the published branch carry fully versioned course keys
    /// which hash and serialize differently from the bare run key; mapping into
    /// the bare key makes them comparable again.
    pub fn map_into_course(&self, course_key: &CourseKey) -> Self {
        Self {
            course_key: course_key.clone(),
            block_type: self.block_type.clone(),
            block_id: self.block_id.clone(),
        }
    }
}

impl fmt::Display for UsageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(BLOCK_PREFIX)?;
        self.course_key.write_body(f)?;
        write!(f, "+type@{}+block@{}", self.block_type, self.block_id)
    }
}

impl FromStr for UsageKey {
    type Err = KeyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let body = value
            .strip_prefix(BLOCK_PREFIX)
            .ok_or_else(|| KeyError::usage(value))?;
        let parts: Vec<&str> = body.split('+').collect();
        if parts.len() < 5 {
            return Err(KeyError::usage(value));
        }
        let (course_parts, block_parts) = parts.split_at(parts.len() - 2);
        let course_key = parse_course_parts(course_parts).ok_or_else(|| KeyError::usage(value))?;
        let block_type = block_parts[0]
            .strip_prefix("type@")
            .filter(|part| is_valid_part(part))
            .ok_or_else(|| KeyError::usage(value))?;
        let block_id = block_parts[1]
            .strip_prefix("block@")
            .filter(|part| is_valid_part(part))
            .ok_or_else(|| KeyError::usage(value))?;

        Ok(Self {
            course_key,
            block_type: block_type.to_string(),
            block_id: block_id.to_string(),
        })
    }
}

fn parse_course_parts(parts: &[&str]) -> Option<CourseKey> {
    let [org, course, run, rest @ ..] = parts else {
        return None;
    };
    if ![org, course, run].iter().all(|part| is_valid_part(part)) {
        return None;
    }

    let mut key = CourseKey {
        org: org.to_string(),
        course: course.to_string(),
        run: run.to_string(),
        branch: None,
        version: None,
    };
    for part in rest {
        if let Some(branch) = part.strip_prefix("branch@") {
            if key.branch.is_some() || key.version.is_some() || !is_valid_part(branch) {
                return None;
            }
            key.branch = Some(branch.to_string());
        } else if let Some(version) = part.strip_prefix("version@") {
            if key.version.is_some() || !is_valid_part(version) {
                return None;
            }
            key.version = Some(version.to_string());
        } else {
            return None;
        }
    }
    Some(key)
}

/// Word characters (any script) plus `-_.~:%`.
fn is_valid_part(part: &str) -> bool {
    !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '~' | ':' | '%'))
}

macro_rules! string_serde {
    ($ty:ty, $expecting:literal) => {
        impl Serialize for $ty {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let value = String::deserialize(deserializer)?;
                value
                    .parse()
                    .map_err(|_| D::Error::custom(concat!("invalid ", $expecting)))
            }
        }
    };
}

string_serde!(CourseKey, "course key");
string_serde!(UsageKey, "usage key");
