/// Grading Engine - One Submission, End to End
///
/// **Flow:**
/// 1. Lock (course, assignment, user)
/// 2. Submission limits (may reject)
/// 3. Quick image build
/// 4. Next submission ID, snapshot of the input
/// 5. Run the grader (container or local process)
/// 6. Parse `output/result.json`, attach identity, compute points
/// 7. Persist (unless disabled), unlock
///
/// **Failure shapes:**
/// - Rejection is a normal outcome, not an error
/// - A grader failure is `AutograderError::Grader` and still carries stdout/stderr
/// - A store failure does not hide the result; it rides along with it
mod container;
mod local;

use crate::docker::{ContainerRuntime, DockerRuntime};
use crate::files::gzip_dir_to_bytes;
use crate::image::{build_image_from_source, AssignmentSource, BuildOptions, ImageLocks};
use crate::limits::{check_submission_limit, role_bypasses_limits};
use crate::lockmanager::LockManager;
use crate::store::{GradingResult, SubmissionStore};
use autograder_common::keys::grading_lock_key;
use autograder_common::types::{GradedAssignment, GradingInfo, GRADER_OUTPUT_RESULT_FILENAME};
use autograder_common::{
    validate_user, Assignment, AutograderError, Config, RejectReason, Result, SubmissionId,
    Timestamp,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct GradeOptions {
    /// Run the invocation as a local process instead of a container.
    pub no_container: bool,
    pub leave_temp_dir: bool,
    pub check_rejection: bool,
    pub no_store: bool,
}

impl Default for GradeOptions {
    fn default() -> Self {
        Self {
            no_container: false,
            leave_temp_dir: false,
            check_rejection: true,
            no_store: false,
        }
    }
}

impl GradeOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            no_container: !config.docker.enabled,
            leave_temp_dir: config.docker.keep_build_dirs,
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub enum GradeOutcome {
    Graded {
        result: Box<GradingResult>,
        /// Set when grading succeeded but the submission could not be saved.
        store_error: Option<AutograderError>,
    },
    Rejected(RejectReason),
}

/// Grader output before the submission identity is attached.
pub(crate) struct RunOutput {
    pub graded: GradedAssignment,
    pub output_files_gz: Vec<u8>,
    pub stdout: String,
    pub stderr: String,
}

pub(crate) fn timeout_message(assignment: &Assignment) -> String {
    format!(
        "Submission has run for too long and was killed. Max assignment runtime is {} seconds. Check for infinite loops/recursion and consult with your instructors/TAs.",
        assignment.image_info.max_runtime_secs
    )
}

pub(crate) fn max_runtime(assignment: &Assignment) -> Option<Duration> {
    match assignment.image_info.max_runtime_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    }
}

/// Read and parse the grader's result file, keeping stdout/stderr on failure.
pub(crate) fn collect_result(output_dir: &Path, stdout: String, stderr: String) -> Result<RunOutput> {
    let path = output_dir.join(GRADER_OUTPUT_RESULT_FILENAME);
    if !path.exists() {
        return Err(AutograderError::Grader {
            message: format!("Cannot find grader output file '{}'.", GRADER_OUTPUT_RESULT_FILENAME),
            stdout,
            stderr,
        });
    }

    let parsed = fs::read_to_string(&path)
        .map_err(|e| AutograderError::io(&path, e))
        .and_then(|text| serde_json::from_str::<GradedAssignment>(&text).map_err(Into::into));
    let graded = match parsed {
        Ok(graded) => graded,
        Err(e) => {
            return Err(AutograderError::Grader {
                message: format!("Grader output file is not valid: {}", e),
                stdout,
                stderr,
            })
        }
    };

    let output_files_gz = gzip_dir_to_bytes(output_dir)?;

    Ok(RunOutput {
        graded,
        output_files_gz,
        stdout,
        stderr,
    })
}

pub struct GradingEngine {
    config: Config,
    locks: Arc<LockManager>,
    store: Arc<SubmissionStore>,
    image_locks: Arc<ImageLocks>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
}

impl GradingEngine {
    pub fn new(config: Config, runtime: Option<Arc<dyn ContainerRuntime>>) -> Self {
        let store = Arc::new(SubmissionStore::new(config.base_dir.clone()));
        Self {
            config,
            locks: Arc::new(LockManager::new()),
            store,
            image_locks: Arc::new(ImageLocks::new()),
            runtime,
        }
    }

    /// Engine with a Docker runtime when docker is enabled in `config`.
    pub fn from_config(config: Config) -> Result<Self> {
        let runtime: Option<Arc<dyn ContainerRuntime>> = if config.docker.enabled {
            Some(Arc::new(DockerRuntime::connect()?))
        } else {
            info!("Docker is disabled, grading will use local processes");
            None
        };
        Ok(Self::new(config, runtime))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn store(&self) -> &Arc<SubmissionStore> {
        &self.store
    }

    pub fn runtime(&self) -> Option<&Arc<dyn ContainerRuntime>> {
        self.runtime.as_ref()
    }

    pub fn image_source(&self, assignment: Arc<Assignment>) -> AssignmentSource {
        AssignmentSource::new(assignment, &self.config.base_dir, &self.image_locks)
    }

    /// Build `assignment`'s image if anything changed. No-op without a runtime.
    pub async fn ensure_image(&self, assignment: Arc<Assignment>, options: &BuildOptions) -> Result<bool> {
        let Some(runtime) = self.runtime.as_deref() else {
            return Ok(false);
        };

        let source = self.image_source(assignment);
        build_image_from_source(&source, runtime, options).await
    }

    /// Limits that would apply to `user` right now.
    pub fn check_rejection(
        &self,
        assignment: &Assignment,
        user: &str,
        now: Timestamp,
    ) -> Result<Option<RejectReason>> {
        let user = validate_user(user)?;
        let user = user.as_str();

        // Users missing from the roster are throttled like students.
        if let Some(course_user) = self.store.get_user(&assignment.course_id, user)? {
            if role_bypasses_limits(course_user.role) {
                return Ok(None);
            }
        }

        let history = self.store.get_submission_history(assignment, user)?;
        Ok(check_submission_limit(
            assignment.submission_limit.as_ref(),
            &history,
            now,
        ))
    }

    pub async fn grade(
        &self,
        assignment: Arc<Assignment>,
        submission_dir: &Path,
        user: &str,
        message: &str,
        options: &GradeOptions,
    ) -> Result<GradeOutcome> {
        if !submission_dir.is_dir() {
            return Err(AutograderError::validation(format!(
                "submission dir '{}' does not exist",
                submission_dir.display()
            )));
        }

        let user = validate_user(user)?;
        let user = user.as_str();
        let key = grading_lock_key(&assignment.course_id, &assignment.id, user);
        let _guard = self.locks.lock_guard(&key).await;

        let outcome = self
            .grade_locked(assignment.clone(), submission_dir, user, message, options)
            .await;

        match &outcome {
            Ok(GradeOutcome::Graded { result, .. }) => info!(
                course = %assignment.course_id,
                assignment = %assignment.id,
                user = %user,
                submission = %result.info.id,
                score = result.info.score,
                max_points = result.info.max_points,
                "Graded submission"
            ),
            Ok(GradeOutcome::Rejected(reason)) => info!(
                course = %assignment.course_id,
                assignment = %assignment.id,
                user = %user,
                reason = reason.label(),
                "Rejected submission"
            ),
            Err(e) => error!(
                course = %assignment.course_id,
                assignment = %assignment.id,
                user = %user,
                error = %e,
                "Grading failed"
            ),
        }

        outcome
    }

    async fn grade_locked(
        &self,
        assignment: Arc<Assignment>,
        submission_dir: &Path,
        user: &str,
        message: &str,
        options: &GradeOptions,
    ) -> Result<GradeOutcome> {
        if options.check_rejection {
            if let Some(reason) = self.check_rejection(&assignment, user, Timestamp::now())? {
                return Ok(GradeOutcome::Rejected(reason));
            }
        }

        let runtime = if options.no_container {
            None
        } else {
            let runtime = self.runtime.as_deref().ok_or_else(|| {
                AutograderError::infra("docker is disabled, grade without a container instead")
            })?;

            let build = BuildOptions {
                quick: true,
                keep_build_dir: self.config.docker.keep_build_dirs,
                ..Default::default()
            };
            build_image_from_source(&self.image_source(assignment.clone()), runtime, &build).await?;
            Some(runtime)
        };

        let start = Timestamp::now();
        let short_id = self.store.next_submission_id(&assignment, user).await?;
        let id = SubmissionId::new(&assignment.course_id, &assignment.id, user, &short_id);
        let input_files_gz = gzip_dir_to_bytes(submission_dir)?;

        debug!(submission = %id, container = runtime.is_some(), "Running grader");
        let run = match runtime {
            Some(runtime) => {
                container::run_container_grader(
                    runtime,
                    &assignment,
                    submission_dir,
                    &id.to_string(),
                    options,
                    self.config.docker.max_output_bytes,
                )
                .await?
            }
            None => {
                local::run_local_grader(
                    &assignment,
                    submission_dir,
                    options,
                    self.config.docker.max_output_bytes,
                )
                .await?
            }
        };
        let end = Timestamp::now();

        let info = GradingInfo::from_graded(id, run.graded, message, start, end);
        let result = GradingResult {
            info,
            input_files_gz,
            output_files_gz: run.output_files_gz,
            stdout: run.stdout,
            stderr: run.stderr,
        };

        let store_error = if options.no_store {
            None
        } else {
            match self.store.save_submission(&assignment, &result) {
                Ok(()) => None,
                Err(e) => {
                    warn!(submission = %result.info.id, error = %e, "Failed to save grading result");
                    Some(e)
                }
            }
        };

        Ok(GradeOutcome::Graded {
            result: Box::new(result),
            store_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autograder_common::types::{CourseRole, CourseUser};
    use autograder_common::Course;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    const GRADE_SCRIPT: &str = r#"#!/bin/sh
if [ -f sub.txt ]; then score=10; else score=0; fi
cat > "$1" <<EOF
{"name": "HW0", "questions": [{"name": "Q1", "max_points": 10, "score": $score, "message": ""}]}
EOF
echo "graded"
"#;

    struct Fixture {
        _dir: TempDir,
        engine: GradingEngine,
        assignment: Arc<Assignment>,
        submission: std::path::PathBuf,
    }

    fn fixture(extra: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let source_dir = dir.path().join("course/hw0");
        fs::create_dir_all(&source_dir).unwrap();
        fs::write(source_dir.join("grade.sh"), GRADE_SCRIPT).unwrap();

        let json = format!(
            r#"{{
                "id": "hw0",
                "image": "alpine",
                "invocation": ["sh", "grade.sh", "<outpath>"],
                "static-files": ["grade.sh"],
                "post-submission-files-ops": [["cp", "input/sub.txt", "work/sub.txt"]]
                {}
            }}"#,
            extra
        );
        let course = Course::new("cs101").unwrap();
        let assignment = Assignment::from_json(&json, &course, &source_dir).unwrap();

        let submission = dir.path().join("submission");
        fs::create_dir_all(&submission).unwrap();
        fs::write(submission.join("sub.txt"), "answer").unwrap();

        let mut config = Config::with_base_dir(dir.path().join("base"));
        config.docker.enabled = false;

        Fixture {
            engine: GradingEngine::new(config, None),
            assignment: Arc::new(assignment),
            submission,
            _dir: dir,
        }
    }

    fn local() -> GradeOptions {
        GradeOptions {
            no_container: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_local_grade_stores_result() {
        let f = fixture("");
        let outcome = f
            .engine
            .grade(f.assignment.clone(), &f.submission, "a@b.c", "first", &local())
            .await
            .unwrap();

        let GradeOutcome::Graded { result, store_error } = outcome else {
            panic!("expected a graded outcome");
        };
        assert!(store_error.is_none());
        assert_eq!(result.info.score, 10.0);
        assert_eq!(result.info.max_points, 10.0);
        assert_eq!(result.info.message, "first");
        assert!(result.stdout.contains("graded"));

        let history = f.engine.store().get_submission_history(&f.assignment, "a@b.c").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].short_id, result.info.short_id);
    }

    #[tokio::test]
    async fn test_rejection_skips_grading() {
        let f = fixture(r#", "submission-limit": {"max": 0}"#);
        let outcome = f
            .engine
            .grade(f.assignment.clone(), &f.submission, "a@b.c", "", &local())
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            GradeOutcome::Rejected(RejectReason::MaxAttempts { max: 0 })
        ));
        assert!(f
            .engine
            .store()
            .get_submission_history(&f.assignment, "a@b.c")
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_staff_bypass_limits() {
        let f = fixture(r#", "submission-limit": {"max": 0}"#);
        let mut users = BTreeMap::new();
        users.insert("ta@b.c".to_string(), CourseUser::new("ta@b.c", CourseRole::Grader));
        f.engine.store().save_users("cs101", &users).unwrap();

        let outcome = f
            .engine
            .grade(f.assignment.clone(), &f.submission, "ta@b.c", "", &local())
            .await
            .unwrap();
        assert!(matches!(outcome, GradeOutcome::Graded { .. }));
    }

    #[tokio::test]
    async fn test_missing_result_is_grader_failure() {
        let f = fixture("");
        let mut assignment = (*f.assignment).clone();
        assignment.image_info.invocation = vec!["sh".into(), "-c".into(), "echo oops >&2".into()];

        let err = f
            .engine
            .grade(Arc::new(assignment), &f.submission, "a@b.c", "", &local())
            .await
            .unwrap_err();

        match err {
            AutograderError::Grader { stderr, .. } => assert!(stderr.contains("oops")),
            other => panic!("expected grader failure, got {:?}", other),
        }
        // Lock released on the error path.
        assert!(f.engine.locks().try_lock("cs101::hw0::a@b.c"));
    }

    #[tokio::test]
    async fn test_no_store_option() {
        let f = fixture("");
        let options = GradeOptions {
            no_store: true,
            ..local()
        };
        f.engine
            .grade(f.assignment.clone(), &f.submission, "a@b.c", "", &options)
            .await
            .unwrap();
        assert!(f
            .engine
            .store()
            .get_submission_history(&f.assignment, "a@b.c")
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_container_path_requires_runtime() {
        let f = fixture("");
        let err = f
            .engine
            .grade(f.assignment.clone(), &f.submission, "a@b.c", "", &GradeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AutograderError::Infrastructure(_)));
    }

    #[tokio::test]
    async fn test_user_with_path_segments_is_refused() {
        let f = fixture("");
        let base = f.engine.config().base_dir.clone();

        let err = f
            .engine
            .grade(f.assignment.clone(), &f.submission, "../../../../../escaped", "", &local())
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(!base.join("escaped").exists());
        assert!(!base.parent().unwrap().join("escaped").exists());
    }

    #[tokio::test]
    async fn test_user_with_id_separator_is_refused() {
        let f = fixture("");
        let err = f
            .engine
            .grade(f.assignment.clone(), &f.submission, "x::y@z.com", "", &local())
            .await
            .unwrap_err();
        assert!(err.is_validation());

        // The user's history stays readable and later grades still work.
        f.engine
            .grade(f.assignment.clone(), &f.submission, "y@z.com", "", &local())
            .await
            .unwrap();
        assert_eq!(
            f.engine
                .store()
                .get_submission_history(&f.assignment, "y@z.com")
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_user_case_variants_share_limit() {
        let f = fixture(r#", "submission-limit": {"max": 1}"#);
        let first = f
            .engine
            .grade(f.assignment.clone(), &f.submission, "alice@x.edu", "", &local())
            .await
            .unwrap();
        let GradeOutcome::Graded { result, .. } = first else {
            panic!("expected a graded outcome");
        };
        assert_eq!(result.info.id.user, "alice@x.edu");

        let second = f
            .engine
            .grade(f.assignment.clone(), &f.submission, " ALICE@x.edu", "", &local())
            .await
            .unwrap();
        assert!(matches!(
            second,
            GradeOutcome::Rejected(RejectReason::MaxAttempts { max: 1 })
        ));
    }

    #[test]
    fn test_collect_result_keeps_output_on_bad_json() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(GRADER_OUTPUT_RESULT_FILENAME), "not json").unwrap();

        let err = collect_result(dir.path(), "out".into(), "err".into()).err().unwrap();
        match err {
            AutograderError::Grader { stdout, stderr, .. } => {
                assert_eq!(stdout, "out");
                assert_eq!(stderr, "err");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
