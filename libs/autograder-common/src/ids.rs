use crate::error::{AutograderError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

lazy_static! {
    static ref ID_PATTERN: Regex =
        Regex::new(r"^[a-z0-9](?:[a-z0-9._-]*[a-z0-9])?$").expect("id pattern compiles");
    static ref ADJACENT_PUNCTUATION: Regex =
        Regex::new(r"[._-]{2,}").expect("punctuation pattern compiles");
}

pub const SUBMISSION_ID_SEPARATOR: &str = "::";

/// Normalize and check a course/assignment identifier.
/// The returned value is lowercase and validating it again returns it unchanged.
pub fn validate_id(id: &str) -> Result<String> {
    let id = id.trim().to_lowercase();

    if id.is_empty() {
        return Err(AutograderError::validation("IDs must not be empty"));
    }

    if !ID_PATTERN.is_match(&id) || ADJACENT_PUNCTUATION.is_match(&id) {
        return Err(AutograderError::validation(format!(
            "IDs must only have letters, digits, and single sequences of periods, underscores, and hyphens, found '{}'",
            id
        )));
    }

    Ok(id)
}

/// Normalize a submitting user's identity (usually an email) to the form used
/// in lock keys, submission IDs and store paths.
pub fn validate_user(user: &str) -> Result<String> {
    let user = user.trim().to_lowercase();

    if user.is_empty() {
        return Err(AutograderError::validation("user must not be empty"));
    }

    let forbidden = user.contains(SUBMISSION_ID_SEPARATOR)
        || user.contains('/')
        || user.contains('\\')
        || user.contains("..")
        || user == "."
        || user.chars().any(char::is_control);
    if forbidden {
        return Err(AutograderError::validation(format!(
            "user must not contain '::', '/', '\\', or '..', found '{}'",
            user
        )));
    }

    Ok(user)
}

/// Tag for an assignment's grading image.
pub fn image_name(course_id: &str, assignment_id: &str) -> String {
    format!("autograder.{}.{}", course_id, assignment_id).to_lowercase()
}

/// `<course>::<assignment>::<user>::<short>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubmissionId {
    pub course: String,
    pub assignment: String,
    pub user: String,
    pub short: String,
}

impl SubmissionId {
    pub fn new(course: &str, assignment: &str, user: &str, short: &str) -> Self {
        Self {
            course: course.to_string(),
            assignment: assignment.to_string(),
            user: user.to_string(),
            short: short.to_string(),
        }
    }

    pub fn parse(full_id: &str) -> Result<Self> {
        let parts: Vec<&str> = full_id.split(SUBMISSION_ID_SEPARATOR).collect();
        if parts.len() != 4 || parts.iter().any(|part| part.is_empty()) {
            return Err(AutograderError::validation(format!(
                "submission ID must have exactly four non-empty '::'-separated parts, found '{}'",
                full_id
            )));
        }

        Ok(Self::new(parts[0], parts[1], parts[2], parts[3]))
    }

    pub fn short_millis(&self) -> Option<i64> {
        self.short.parse().ok()
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}{sep}{}",
            self.course,
            self.assignment,
            self.user,
            self.short,
            sep = SUBMISSION_ID_SEPARATOR
        )
    }
}

impl TryFrom<String> for SubmissionId {
    type Error = AutograderError;

    fn try_from(value: String) -> Result<Self> {
        SubmissionId::parse(&value)
    }
}

impl From<SubmissionId> for String {
    fn from(value: SubmissionId) -> Self {
        value.to_string()
    }
}
