/// LMS adapter seam and the in-process backend.
///
/// Users are addressed by LMS user ID on this side; the engine maps
/// emails to LMS IDs through the course roster.

use async_trait::async_trait;
use autograder_common::model::LmsBinding;
use autograder_common::types::CourseRole;
use autograder_common::{AutograderError, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub const AUTOGRADER_COMMENT_AUTHOR: &str = "autograder";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LmsUser {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub role: CourseRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LmsAssignment {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<Timestamp>,
    #[serde(default)]
    pub max_points: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SubmissionComment {
    /// Empty for comments that have not been posted yet.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SubmissionScore {
    pub user_id: String,
    pub score: f64,
    #[serde(default)]
    pub time: Timestamp,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<SubmissionComment>,
}

#[async_trait]
pub trait LmsAdapter: Send + Sync {
    async fn fetch_users(&self) -> Result<Vec<LmsUser>>;

    async fn fetch_user(&self, email: &str) -> Result<Option<LmsUser>>;

    async fn fetch_assignment(&self, lms_id: &str) -> Result<LmsAssignment>;

    async fn fetch_assignment_scores(&self, lms_id: &str) -> Result<Vec<SubmissionScore>>;

    /// Upsert grades. Comments without an ID are posted as new comments.
    async fn update_assignment_scores(&self, lms_id: &str, scores: &[SubmissionScore]) -> Result<()>;

    /// Edit existing comments in place, matched by comment ID.
    async fn update_comments(&self, lms_id: &str, comments: &[SubmissionComment]) -> Result<()>;
}

/// Build the adapter a course's binding asks for.
pub fn adapter_for(binding: &LmsBinding, course_dir: &Path) -> Result<Arc<dyn LmsAdapter>> {
    match binding {
        LmsBinding::Test { fixture } => {
            let lms = match fixture {
                Some(path) => {
                    let path = if path.is_absolute() {
                        path.clone()
                    } else {
                        course_dir.join(path)
                    };
                    MemoryLms::from_fixture(&path)?
                }
                None => MemoryLms::default(),
            };
            Ok(Arc::new(lms))
        }
    }
}

/// Seed data for [`MemoryLms`], also its fixture file format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MemoryLmsState {
    #[serde(default)]
    pub users: Vec<LmsUser>,
    #[serde(default)]
    pub assignments: Vec<LmsAssignment>,
    /// Assignment LMS ID -> scores.
    #[serde(default)]
    pub scores: BTreeMap<String, Vec<SubmissionScore>>,
}

#[derive(Default)]
pub struct MemoryLms {
    state: Mutex<MemoryLmsState>,
    next_comment_id: Mutex<u64>,
}

impl MemoryLms {
    pub fn new(state: MemoryLmsState) -> Self {
        Self {
            state: Mutex::new(state),
            next_comment_id: Mutex::new(0),
        }
    }

    pub fn from_fixture(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| AutograderError::io(path, e))?;
        let state: MemoryLmsState = serde_json::from_str(&text)?;
        debug!(path = %path.display(), users = state.users.len(), "Loaded LMS fixture");
        Ok(Self::new(state))
    }

    pub async fn snapshot(&self) -> MemoryLmsState {
        self.state.lock().await.clone()
    }

    async fn next_comment_id(&self) -> String {
        let mut next = self.next_comment_id.lock().await;
        *next += 1;
        format!("comment-{:05}", *next)
    }
}

#[async_trait]
impl LmsAdapter for MemoryLms {
    async fn fetch_users(&self) -> Result<Vec<LmsUser>> {
        Ok(self.state.lock().await.users.clone())
    }

    async fn fetch_user(&self, email: &str) -> Result<Option<LmsUser>> {
        let state = self.state.lock().await;
        Ok(state.users.iter().find(|u| u.email == email).cloned())
    }

    async fn fetch_assignment(&self, lms_id: &str) -> Result<LmsAssignment> {
        let state = self.state.lock().await;
        state
            .assignments
            .iter()
            .find(|a| a.id == lms_id)
            .cloned()
            .ok_or_else(|| AutograderError::Lms(format!("unknown LMS assignment '{}'", lms_id)))
    }

    async fn fetch_assignment_scores(&self, lms_id: &str) -> Result<Vec<SubmissionScore>> {
        let state = self.state.lock().await;
        Ok(state.scores.get(lms_id).cloned().unwrap_or_default())
    }

    async fn update_assignment_scores(&self, lms_id: &str, scores: &[SubmissionScore]) -> Result<()> {
        // Assign IDs before taking the state lock.
        let mut incoming = Vec::with_capacity(scores.len());
        for score in scores {
            let mut score = score.clone();
            for comment in &mut score.comments {
                if comment.id.is_empty() {
                    comment.id = self.next_comment_id().await;
                }
                if comment.author.is_empty() {
                    comment.author = AUTOGRADER_COMMENT_AUTHOR.to_string();
                }
            }
            incoming.push(score);
        }

        let mut state = self.state.lock().await;
        let existing = state.scores.entry(lms_id.to_string()).or_default();

        for score in incoming {
            match existing.iter_mut().find(|s| s.user_id == score.user_id) {
                Some(current) => {
                    current.score = score.score;
                    current.time = score.time;
                    current.comments.extend(score.comments);
                }
                None => existing.push(score),
            }
        }

        Ok(())
    }

    async fn update_comments(&self, lms_id: &str, comments: &[SubmissionComment]) -> Result<()> {
        let mut state = self.state.lock().await;
        let scores = state.scores.entry(lms_id.to_string()).or_default();

        for update in comments {
            let target = scores
                .iter_mut()
                .flat_map(|s| s.comments.iter_mut())
                .find(|c| c.id == update.id);

            match target {
                Some(comment) => comment.text = update.text.clone(),
                None => {
                    return Err(AutograderError::Lms(format!(
                        "no comment '{}' on LMS assignment '{}'",
                        update.id, lms_id
                    )))
                }
            }
        }

        Ok(())
    }
}
