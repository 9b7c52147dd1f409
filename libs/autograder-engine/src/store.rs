/// On-disk submission store.
///
/// Layout, per user:
/// `<base>/courses/<course>/submissions/<assignment>/<user>/<short-id>/`
/// holding `result.json`, `input.tar.gz`, `output.tar.gz`, `stdout.txt`, `stderr.txt`.

use crate::files::ensure_dir;
use autograder_common::keys::{course_dir, grading_lock_key, user_submissions_dir, USERS_FILENAME};
use autograder_common::types::{CourseUser, GradingInfo, ScoringInfo, SubmissionHistoryItem};
use autograder_common::{Assignment, AutograderError, Result, Timestamp};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const RESULT_FILENAME: &str = "result.json";
const INPUT_ARCHIVE_FILENAME: &str = "input.tar.gz";
const OUTPUT_ARCHIVE_FILENAME: &str = "output.tar.gz";
const STDOUT_FILENAME: &str = "stdout.txt";
const STDERR_FILENAME: &str = "stderr.txt";

/// Everything produced by one grading run.
#[derive(Debug, Clone, PartialEq)]
pub struct GradingResult {
    pub info: GradingInfo,
    /// gzip-tar of the submission as received.
    pub input_files_gz: Vec<u8>,
    /// gzip-tar of the grader's output dir.
    pub output_files_gz: Vec<u8>,
    pub stdout: String,
    pub stderr: String,
}

fn persistence<E: std::fmt::Display>(what: &str, path: &Path, err: E) -> AutograderError {
    AutograderError::Persistence(format!("{} '{}': {}", what, path.display(), err))
}

pub struct SubmissionStore {
    base_dir: PathBuf,
    id_locks: DashMap<String, Arc<Mutex<()>>>,
    last_issued: DashMap<String, i64>,
}

impl SubmissionStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            id_locks: DashMap::new(),
            last_issued: DashMap::new(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn user_dir(&self, assignment: &Assignment, user: &str) -> PathBuf {
        user_submissions_dir(&self.base_dir, &assignment.course_id, &assignment.id, user)
    }

    /// Short IDs stored for a user, ascending.
    fn short_ids(&self, assignment: &Assignment, user: &str) -> Result<Vec<i64>> {
        let dir = self.user_dir(assignment, user);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| persistence("failed to list", &dir, e))? {
            let entry = entry.map_err(|e| persistence("failed to list", &dir, e))?;
            if !entry.path().join(RESULT_FILENAME).exists() {
                continue;
            }
            if let Ok(id) = entry.file_name().to_string_lossy().parse::<i64>() {
                ids.push(id);
            }
        }

        ids.sort_unstable();
        Ok(ids)
    }

    /// Millisecond timestamp, strictly greater than any ID already handed out for this user.
    pub async fn next_submission_id(&self, assignment: &Assignment, user: &str) -> Result<String> {
        let key = grading_lock_key(&assignment.course_id, &assignment.id, user);
        let lock = self
            .id_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let stored = self.short_ids(assignment, user)?.last().copied().unwrap_or(0);
        let issued = self.last_issued.get(&key).map(|v| *v).unwrap_or(0);
        let last = stored.max(issued);

        let mut candidate = Timestamp::now().millis();
        if candidate <= last {
            candidate = last + 1;
        }

        self.last_issued.insert(key, candidate);
        Ok(candidate.to_string())
    }

    pub fn save_submission(&self, assignment: &Assignment, result: &GradingResult) -> Result<()> {
        let user_dir = self.user_dir(assignment, &result.info.user);
        ensure_dir(&user_dir)?;

        // Stage next to the final dir so the rename is atomic.
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&user_dir)
            .map_err(|e| persistence("failed to stage submission in", &user_dir, e))?;

        let write = |name: &str, bytes: &[u8]| -> Result<()> {
            let path = staging.path().join(name);
            fs::write(&path, bytes).map_err(|e| persistence("failed to write", &path, e))
        };

        write(
            RESULT_FILENAME,
            serde_json::to_string_pretty(&result.info)?.as_bytes(),
        )?;
        write(INPUT_ARCHIVE_FILENAME, &result.input_files_gz)?;
        write(OUTPUT_ARCHIVE_FILENAME, &result.output_files_gz)?;
        write(STDOUT_FILENAME, result.stdout.as_bytes())?;
        write(STDERR_FILENAME, result.stderr.as_bytes())?;

        let final_dir = user_dir.join(&result.info.short_id);
        if final_dir.exists() {
            return Err(AutograderError::Persistence(format!(
                "submission '{}' already exists",
                result.info.id
            )));
        }

        let staged = staging.keep();
        fs::rename(&staged, &final_dir).map_err(|e| persistence("failed to finalize", &final_dir, e))?;

        debug!(submission = %result.info.id, "Saved submission");
        Ok(())
    }

    /// History in ascending grading-start order.
    pub fn get_submission_history(
        &self,
        assignment: &Assignment,
        user: &str,
    ) -> Result<Vec<SubmissionHistoryItem>> {
        let mut history = Vec::new();
        for short in self.short_ids(assignment, user)? {
            match self.load_info(assignment, user, &short.to_string())? {
                Some(info) => history.push(info.history_item()),
                None => warn!(user = %user, short_id = short, "Submission vanished while listing"),
            }
        }

        history.sort_by(|a, b| {
            a.grading_start_time
                .cmp(&b.grading_start_time)
                .then_with(|| a.short_id.cmp(&b.short_id))
        });
        Ok(history)
    }

    fn load_info(&self, assignment: &Assignment, user: &str, short: &str) -> Result<Option<GradingInfo>> {
        let path = self.user_dir(assignment, user).join(short).join(RESULT_FILENAME);
        if !path.exists() {
            return Ok(None);
        }

        let text = fs::read_to_string(&path).map_err(|e| persistence("failed to read", &path, e))?;
        let info = serde_json::from_str(&text).map_err(|e| persistence("failed to parse", &path, e))?;
        Ok(Some(info))
    }

    pub fn get_submission_result(
        &self,
        assignment: &Assignment,
        user: &str,
        short: &str,
    ) -> Result<Option<GradingResult>> {
        let Some(info) = self.load_info(assignment, user, short)? else {
            return Ok(None);
        };

        let dir = self.user_dir(assignment, user).join(short);
        let read = |name: &str| -> Result<Vec<u8>> {
            let path = dir.join(name);
            fs::read(&path).map_err(|e| persistence("failed to read", &path, e))
        };

        Ok(Some(GradingResult {
            info,
            input_files_gz: read(INPUT_ARCHIVE_FILENAME)?,
            output_files_gz: read(OUTPUT_ARCHIVE_FILENAME)?,
            stdout: String::from_utf8_lossy(&read(STDOUT_FILENAME)?).to_string(),
            stderr: String::from_utf8_lossy(&read(STDERR_FILENAME)?).to_string(),
        }))
    }

    pub fn get_most_recent(&self, assignment: &Assignment, user: &str) -> Result<Option<GradingInfo>> {
        match self.short_ids(assignment, user)?.last() {
            Some(short) => self.load_info(assignment, user, &short.to_string()),
            None => Ok(None),
        }
    }

    /// The stored short ID immediately before `short`, if any.
    pub fn previous_submission_id(
        &self,
        assignment: &Assignment,
        user: &str,
        short: &str,
    ) -> Result<Option<String>> {
        let target: i64 = short.parse().map_err(|_| {
            AutograderError::validation(format!("short submission ID '{}' is not numeric", short))
        })?;

        Ok(self
            .short_ids(assignment, user)?
            .into_iter()
            .filter(|id| *id < target)
            .next_back()
            .map(|id| id.to_string()))
    }

    /// Returns whether anything was removed.
    pub fn remove_submission(&self, assignment: &Assignment, user: &str, short: &str) -> Result<bool> {
        let dir = self.user_dir(assignment, user).join(short);
        if !dir.exists() {
            return Ok(false);
        }

        fs::remove_dir_all(&dir).map_err(|e| persistence("failed to remove", &dir, e))?;
        Ok(true)
    }

    /// Users with at least one submission for `assignment`.
    pub fn submitting_users(&self, assignment: &Assignment) -> Result<Vec<String>> {
        let dir = course_dir(&self.base_dir, &assignment.course_id)
            .join(autograder_common::keys::SUBMISSIONS_DIRNAME)
            .join(&assignment.id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut users = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| persistence("failed to list", &dir, e))? {
            let entry = entry.map_err(|e| persistence("failed to list", &dir, e))?;
            if entry.path().is_dir() {
                users.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        users.sort();
        Ok(users)
    }

    /// Most recent submission's ScoringInfo per user, keyed by email.
    pub fn get_scoring_infos(&self, assignment: &Assignment) -> Result<BTreeMap<String, ScoringInfo>> {
        let mut infos = BTreeMap::new();
        for user in self.submitting_users(assignment)? {
            if let Some(info) = self.get_most_recent(assignment, &user)? {
                infos.insert(user, info.scoring_info());
            }
        }
        Ok(infos)
    }

    fn users_path(&self, course_id: &str) -> PathBuf {
        course_dir(&self.base_dir, course_id).join(USERS_FILENAME)
    }

    /// Course roster keyed by email. Missing file means an empty roster.
    pub fn get_users(&self, course_id: &str) -> Result<BTreeMap<String, CourseUser>> {
        let path = self.users_path(course_id);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }

        let text = fs::read_to_string(&path).map_err(|e| persistence("failed to read", &path, e))?;
        serde_json::from_str(&text).map_err(|e| persistence("failed to parse", &path, e))
    }

    pub fn save_users(&self, course_id: &str, users: &BTreeMap<String, CourseUser>) -> Result<()> {
        let path = self.users_path(course_id);
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        let text = serde_json::to_string_pretty(users)?;
        fs::write(&path, text).map_err(|e| persistence("failed to write", &path, e))
    }

    /// Roster lookup, ignoring case and surrounding whitespace in the email.
    pub fn get_user(&self, course_id: &str, email: &str) -> Result<Option<CourseUser>> {
        let email = email.trim();
        Ok(self
            .get_users(course_id)?
            .into_iter()
            .find_map(|(key, user)| key.trim().eq_ignore_ascii_case(email).then_some(user)))
    }
}
