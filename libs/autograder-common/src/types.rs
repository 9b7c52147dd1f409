use crate::error::{AutograderError, Result};
use crate::filespec::FileSpec;
use crate::fileops::{validate_file_operations, FileOperation};
use crate::ids::SubmissionId;
use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_BASE_IMAGE: &str = "edulinq/grader.base";

/// Container layout
pub const DOCKER_BASE_DIR: &str = "/autograder";
pub const DOCKER_INPUT_DIR: &str = "/autograder/input";
pub const DOCKER_OUTPUT_DIR: &str = "/autograder/output";
pub const DOCKER_WORK_DIR: &str = "/autograder/work";
pub const DOCKER_CONFIG_FILENAME: &str = "config.json";
pub const DOCKER_POST_SUBMISSION_OPS_FILENAME: &str = "post-submission-ops.sh";

pub const GRADING_INPUT_DIRNAME: &str = "input";
pub const GRADING_OUTPUT_DIRNAME: &str = "output";
pub const GRADING_WORK_DIRNAME: &str = "work";
pub const GRADER_OUTPUT_RESULT_FILENAME: &str = "result.json";

/// Marker key that identifies autograder-owned LMS comments.
pub const AUTOGRADER_COMMENT_IDENTITY_KEY: &str = "__autograder__version__";
pub const SCORING_INFO_STRUCT_VERSION: &str = "1.0.0";

/// Everything needed to build an assignment's grading image.
/// The serialized form is hashed to detect descriptor changes,
/// so `name` is excluded and field order is fixed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImageInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_static_docker_commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_static_docker_commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invocation: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub static_files: Vec<FileSpec>,
    #[serde(rename = "pre-static-files-ops", default, skip_serializing_if = "Vec::is_empty")]
    pub pre_static_file_ops: Vec<FileOperation>,
    #[serde(rename = "post-static-files-ops", default, skip_serializing_if = "Vec::is_empty")]
    pub post_static_file_ops: Vec<FileOperation>,
    #[serde(rename = "post-submission-files-ops", default, skip_serializing_if = "Vec::is_empty")]
    pub post_submission_file_ops: Vec<FileOperation>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_runtime_secs: u64,

    #[serde(skip)]
    pub name: String,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl ImageInfo {
    pub fn validate(&mut self) -> Result<()> {
        if self.name.is_empty() {
            return Err(AutograderError::validation("image info is missing a name"));
        }

        if self.image.is_empty() && self.invocation.is_empty() {
            return Err(AutograderError::validation(
                "image and invocation cannot both be empty",
            ));
        }

        if self.image.is_empty() {
            self.image = DEFAULT_BASE_IMAGE.to_string();
        }

        for spec in &self.static_files {
            spec.validate()?;
            if spec.is_abs() {
                return Err(AutograderError::validation(format!(
                    "static file paths must be relative to the assignment directory, found '{}'",
                    spec
                )));
            }
        }

        validate_file_operations(&self.pre_static_file_ops)?;
        validate_file_operations(&self.post_static_file_ops)?;
        validate_file_operations(&self.post_submission_file_ops)?;

        Ok(())
    }

    pub fn grading_config(&self) -> GradingConfig {
        GradingConfig {
            name: self.name.clone(),
            post_submission_file_ops: self.post_submission_file_ops.clone(),
        }
    }
}

/// The subset of image info baked into the image as `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GradingConfig {
    pub name: String,
    #[serde(rename = "post-submission-files-ops", default, skip_serializing_if = "Vec::is_empty")]
    pub post_submission_file_ops: Vec<FileOperation>,
}

/// One question as reported by the grader.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GradedQuestion {
    pub name: String,
    pub max_points: f64,
    pub score: f64,
    #[serde(default)]
    pub message: String,
}

/// What the grader writes to `output/result.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GradedAssignment {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub questions: Vec<GradedQuestion>,
}

impl GradedAssignment {
    /// (score, max_points)
    pub fn compute_points(&self) -> (f64, f64) {
        self.questions
            .iter()
            .fold((0.0, 0.0), |(score, max), q| (score + q.score, max + q.max_points))
    }
}

/// A parsed grader result with the submission's identity attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingInfo {
    pub id: SubmissionId,
    pub short_id: String,
    pub course_id: String,
    pub assignment_id: String,
    pub user: String,
    #[serde(default)]
    pub message: String,
    pub name: String,
    pub questions: Vec<GradedQuestion>,
    pub score: f64,
    pub max_points: f64,
    pub grading_start_time: Timestamp,
    pub grading_end_time: Timestamp,
}

impl GradingInfo {
    pub fn from_graded(
        id: SubmissionId,
        graded: GradedAssignment,
        message: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Self {
        let (score, max_points) = graded.compute_points();
        Self {
            short_id: id.short.clone(),
            course_id: id.course.clone(),
            assignment_id: id.assignment.clone(),
            user: id.user.clone(),
            id,
            message: message.to_string(),
            name: graded.name,
            questions: graded.questions,
            score,
            max_points,
            grading_start_time: start,
            grading_end_time: end,
        }
    }

    pub fn history_item(&self) -> SubmissionHistoryItem {
        SubmissionHistoryItem {
            id: self.id.clone(),
            short_id: self.short_id.clone(),
            score: self.score,
            max_points: self.max_points,
            grading_start_time: self.grading_start_time,
            grading_end_time: self.grading_end_time,
            message: self.message.clone(),
        }
    }

    pub fn scoring_info(&self) -> ScoringInfo {
        ScoringInfo {
            id: self.id.to_string(),
            submission_time: self.grading_start_time,
            raw_score: self.score,
            score: self.score,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionHistoryItem {
    pub id: SubmissionId,
    pub short_id: String,
    pub score: f64,
    pub max_points: f64,
    pub grading_start_time: Timestamp,
    pub grading_end_time: Timestamp,
    #[serde(default)]
    pub message: String,
}

/// Per-(user, assignment) grade record, embedded in an LMS comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScoringInfo {
    pub id: String,
    pub submission_time: Timestamp,
    #[serde(default)]
    pub upload_time: Timestamp,
    pub raw_score: f64,
    pub score: f64,
    #[serde(default)]
    pub lock: bool,
    #[serde(default)]
    pub reject: bool,
    #[serde(default)]
    pub num_days_late: i64,
    #[serde(default)]
    pub late_day_usage: i64,
    #[serde(rename = "__autograder__version__")]
    pub autograder_struct_version: String,

    #[serde(skip)]
    pub lms_comment_id: String,
    #[serde(skip)]
    pub lms_comment_author_id: String,
}

impl Default for ScoringInfo {
    fn default() -> Self {
        Self {
            id: String::new(),
            submission_time: Timestamp::zero(),
            upload_time: Timestamp::zero(),
            raw_score: 0.0,
            score: 0.0,
            lock: false,
            reject: false,
            num_days_late: 0,
            late_day_usage: 0,
            autograder_struct_version: SCORING_INFO_STRUCT_VERSION.to_string(),
            lms_comment_id: String::new(),
            lms_comment_author_id: String::new(),
        }
    }
}

impl ScoringInfo {
    /// Two records describe the same upload when they point at the same submission.
    pub fn same_submission(&self, other: &ScoringInfo) -> bool {
        self.id == other.id
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CourseRole {
    #[default]
    Other,
    Student,
    Grader,
    Admin,
    Owner,
}

impl fmt::Display for CourseRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CourseRole::Other => "other",
            CourseRole::Student => "student",
            CourseRole::Grader => "grader",
            CourseRole::Admin => "admin",
            CourseRole::Owner => "owner",
        };
        write!(f, "{}", text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CourseUser {
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub role: CourseRole,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lms_id: String,
}

impl CourseUser {
    pub fn new(email: &str, role: CourseRole) -> Self {
        Self {
            email: email.to_string(),
            name: String::new(),
            role,
            lms_id: String::new(),
        }
    }
}
