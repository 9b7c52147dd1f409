use crate::error::{AutograderError, Result};
use crate::ids::{image_name, validate_id};
use crate::policy::{DurationSpec, LatePolicy, SubmissionLimit};
use crate::types::ImageInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const COURSE_CONFIG_FILENAME: &str = "course.json";
pub const ASSIGNMENT_CONFIG_FILENAME: &str = "assignment.json";

/// Which LMS backend a course talks to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LmsBinding {
    /// In-process LMS, optionally seeded from a JSON fixture.
    Test {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fixture: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TaskSpec {
    pub every: DurationSpec,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CourseTasks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<TaskSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lms_sync: Option<TaskSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scoring_upload: Option<TaskSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Assignment {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lms_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_limit: Option<SubmissionLimit>,
    #[serde(default)]
    pub late_policy: LatePolicy,

    #[serde(flatten)]
    pub image_info: ImageInfo,

    #[serde(skip)]
    pub course_id: String,
    #[serde(skip)]
    pub source_dir: PathBuf,
}

impl Assignment {
    pub fn from_json(text: &str, course: &Course, source_dir: &Path) -> Result<Self> {
        let mut assignment: Assignment = serde_json::from_str(text)?;
        assignment.course_id = course.id.clone();
        assignment.source_dir = source_dir.to_path_buf();
        assignment.validate(course)?;
        Ok(assignment)
    }

    pub fn load(path: &Path, course: &Course) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| AutograderError::io(path, e))?;
        let source_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Assignment::from_json(&text, course, source_dir).map_err(|e| {
            AutograderError::validation(format!(
                "failed to load assignment '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Normalize IDs and inherit course-level defaults.
    pub fn validate(&mut self, course: &Course) -> Result<()> {
        self.id = validate_id(&self.id)?;

        if self.display_name.is_empty() {
            self.display_name = self.id.clone();
        }

        if self.submission_limit.is_none() {
            self.submission_limit = course.submission_limit.clone();
        }

        if let Some(limit) = &self.submission_limit {
            limit.validate()?;
        }

        if self.late_policy == LatePolicy::default() {
            if let Some(policy) = &course.late_policy {
                self.late_policy = policy.clone();
            }
        }
        self.late_policy.validate()?;

        self.image_info.name = self.image_name();
        self.image_info.validate()
    }

    pub fn full_id(&self) -> String {
        format!("{}::{}", self.course_id, self.id)
    }

    pub fn image_name(&self) -> String {
        image_name(&self.course_id, &self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Course {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lms: Option<LmsBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_limit: Option<SubmissionLimit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub late_policy: Option<LatePolicy>,
    /// Late days go to the assignments where they save the most points.
    #[serde(default)]
    pub optimal_late_day_allocation: bool,
    #[serde(default)]
    pub tasks: CourseTasks,

    #[serde(skip)]
    pub source_dir: PathBuf,
    #[serde(skip)]
    pub assignments: BTreeMap<String, Assignment>,
}

impl Course {
    pub fn new(id: &str) -> Result<Self> {
        Ok(Course {
            id: validate_id(id)?,
            display_name: String::new(),
            lms: None,
            submission_limit: None,
            late_policy: None,
            optimal_late_day_allocation: false,
            tasks: CourseTasks::default(),
            source_dir: PathBuf::new(),
            assignments: BTreeMap::new(),
        })
    }

    /// Load `course.json` from `dir` and every `assignment.json` beneath it.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(COURSE_CONFIG_FILENAME);
        let text = fs::read_to_string(&path).map_err(|e| AutograderError::io(&path, e))?;

        let mut course: Course = serde_json::from_str(&text)?;
        course.id = validate_id(&course.id)?;
        course.source_dir = dir.to_path_buf();
        if course.display_name.is_empty() {
            course.display_name = course.id.clone();
        }
        if let Some(policy) = &course.late_policy {
            policy.validate()?;
        }

        let mut paths = Vec::new();
        collect_assignment_paths(dir, &mut paths)?;
        paths.sort();

        for path in paths {
            let assignment = Assignment::load(&path, &course)?;
            if course.assignments.contains_key(&assignment.id) {
                return Err(AutograderError::validation(format!(
                    "duplicate assignment ID '{}' in course '{}'",
                    assignment.id, course.id
                )));
            }
            course.assignments.insert(assignment.id.clone(), assignment);
        }

        Ok(course)
    }

    pub fn add_assignment(&mut self, mut assignment: Assignment) -> Result<()> {
        assignment.course_id = self.id.clone();
        assignment.validate(self)?;
        self.assignments.insert(assignment.id.clone(), assignment);
        Ok(())
    }

    pub fn assignment(&self, id: &str) -> Option<&Assignment> {
        self.assignments.get(id)
    }
}

fn collect_assignment_paths(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir).map_err(|e| AutograderError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| AutograderError::io(dir, e))?;
        let path = entry.path();
        if path.is_dir() {
            collect_assignment_paths(&path, out)?;
        } else if path.file_name().and_then(|n| n.to_str()) == Some(ASSIGNMENT_CONFIG_FILENAME) {
            out.push(path);
        }
    }
    Ok(())
}
