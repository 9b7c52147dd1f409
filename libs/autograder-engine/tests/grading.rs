use async_trait::async_trait;
use autograder_common::policy::DurationSpec;
use autograder_common::types::{CourseRole, CourseUser, GRADER_OUTPUT_RESULT_FILENAME};
use autograder_common::{Assignment, AutograderError, Config, Course, RejectReason, Result, Timestamp};
use autograder_engine::image::need_rebuild;
use autograder_engine::lms::{LmsAssignment, MemoryLmsState, SubmissionComment, SubmissionScore};
use autograder_engine::scoring::full_assignment_scoring_and_upload;
use autograder_engine::{
    ContainerOutput, ContainerRuntime, GradeOptions, GradeOutcome, GradingEngine, LmsAdapter,
    MemoryLms, RunRequest,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Stands in for Docker: scores 1 point per line of `input/answer.txt`.
#[derive(Default)]
struct FakeRuntime {
    builds: AtomicUsize,
    runs: AtomicUsize,
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn build_image(&self, context_dir: &Path, _image_name: &str, _no_cache: bool) -> Result<String> {
        assert!(context_dir.join("Dockerfile").is_file());
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok("sha256:fake".to_string())
    }

    async fn run(&self, request: RunRequest) -> Result<ContainerOutput> {
        self.runs.fetch_add(1, Ordering::SeqCst);

        let answer = fs::read_to_string(request.input_dir.join("answer.txt")).unwrap_or_default();
        let score = answer.lines().count().min(5);
        let result = format!(
            r#"{{"name": "HW0", "questions": [{{"name": "Q1", "max_points": 5, "score": {}, "message": "ok"}}]}}"#,
            score
        );
        fs::write(request.output_dir.join(GRADER_OUTPUT_RESULT_FILENAME), result)
            .map_err(|e| AutograderError::io(&request.output_dir, e))?;

        Ok(ContainerOutput {
            stdout: format!("graded {}\n", request.run_id),
            exit_code: Some(0),
            ..Default::default()
        })
    }
}

struct Harness {
    _dir: TempDir,
    runtime: Arc<FakeRuntime>,
    engine: Arc<GradingEngine>,
    assignment: Arc<Assignment>,
    submission: PathBuf,
}

fn harness(extra: &str) -> Harness {
    let dir = TempDir::new().unwrap();
    let source_dir = dir.path().join("course").join("hw0");
    fs::create_dir_all(&source_dir).unwrap();
    fs::write(source_dir.join("grader.py"), "print('v1')").unwrap();

    let json = format!(
        r#"{{
            "id": "hw0",
            "lms-id": "001",
            "image": "python:3.12-slim",
            "invocation": ["python3", "grader.py"],
            "static-files": ["grader.py"]
            {}
        }}"#,
        extra
    );
    let course = Course::new("cs101").unwrap();
    let assignment = Assignment::from_json(&json, &course, &source_dir).unwrap();

    let submission = dir.path().join("submission");
    fs::create_dir_all(&submission).unwrap();
    fs::write(submission.join("answer.txt"), "a\nb\nc\n").unwrap();

    let runtime = Arc::new(FakeRuntime::default());
    let config = Config::with_base_dir(dir.path().join("base"));
    let engine = GradingEngine::new(config, Some(runtime.clone() as Arc<dyn ContainerRuntime>));

    Harness {
        _dir: dir,
        runtime,
        engine: Arc::new(engine),
        assignment: Arc::new(assignment),
        submission,
    }
}

async fn grade(h: &Harness, user: &str) -> GradeOutcome {
    h.engine
        .grade(h.assignment.clone(), &h.submission, user, "", &GradeOptions::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_first_grade_stores_submission() {
    let h = harness("");
    let before = Timestamp::now().millis();
    let outcome = grade(&h, "student@example.edu").await;
    let after = Timestamp::now().millis();

    let GradeOutcome::Graded { result, store_error } = outcome else {
        panic!("expected graded outcome");
    };
    assert!(store_error.is_none());

    let short: i64 = result.info.short_id.parse().unwrap();
    assert!(short >= before && short <= after + 1);
    assert_eq!(result.info.score, 3.0);
    assert_eq!(result.info.max_points, 5.0);
    assert_eq!(
        result.info.id.to_string(),
        format!("cs101::hw0::student@example.edu::{}", short)
    );

    let scoring = result.info.scoring_info();
    assert_eq!(scoring.raw_score, 3.0);
    assert_eq!(scoring.score, 3.0);

    let stored = h
        .engine
        .store()
        .get_submission_result(&h.assignment, "student@example.edu", &result.info.short_id)
        .unwrap()
        .unwrap();
    assert_eq!(stored.info, result.info);
    assert_eq!(h.runtime.builds.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_max_attempts_rejects_before_build() {
    let h = harness(r#", "submission-limit": {"max": 0}"#);
    let outcome = grade(&h, "student@example.edu").await;

    assert!(matches!(
        outcome,
        GradeOutcome::Rejected(RejectReason::MaxAttempts { max: 0 })
    ));
    assert_eq!(h.runtime.builds.load(Ordering::SeqCst), 0);
    assert_eq!(h.runtime.runs.load(Ordering::SeqCst), 0);
    assert!(h
        .engine
        .store()
        .get_submission_history(&h.assignment, "student@example.edu")
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_window_rejects_second_submission() {
    let h = harness(r#", "submission-limit": {"window": {"allowed-attempts": 1, "duration": {"days": 1000}}}"#);

    let GradeOutcome::Graded { result, .. } = grade(&h, "student@example.edu").await else {
        panic!("first submission should be graded");
    };
    let t0 = result.info.grading_start_time;

    let outcome = grade(&h, "student@example.edu").await;
    match outcome {
        GradeOutcome::Rejected(reason) => assert_eq!(
            reason,
            RejectReason::WindowMax {
                allowed: 1,
                duration: DurationSpec::days(1000),
                earliest: t0,
            }
        ),
        other => panic!("expected window rejection, got {:?}", other),
    }

    // Other users are unaffected.
    assert!(matches!(grade(&h, "other@example.edu").await, GradeOutcome::Graded { .. }));
}

#[tokio::test]
async fn test_static_file_change_triggers_single_rebuild() {
    let h = harness("");
    assert!(matches!(grade(&h, "student@example.edu").await, GradeOutcome::Graded { .. }));
    assert_eq!(h.runtime.builds.load(Ordering::SeqCst), 1);

    let source = h.engine.image_source(h.assignment.clone());
    assert!(!need_rebuild(&source, true).await.unwrap());

    fs::write(h.assignment.source_dir.join("grader.py"), "print('v2')").unwrap();
    assert!(need_rebuild(&source, true).await.unwrap());

    assert!(matches!(grade(&h, "student@example.edu").await, GradeOutcome::Graded { .. }));
    assert_eq!(h.runtime.builds.load(Ordering::SeqCst), 2);
    assert!(!need_rebuild(&source, true).await.unwrap());

    assert!(matches!(grade(&h, "student@example.edu").await, GradeOutcome::Graded { .. }));
    assert_eq!(h.runtime.builds.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_concurrent_grades_are_serialized() {
    let h = harness("");
    let user = "student@example.edu";

    let mut handles = Vec::new();
    for _ in 0..4 {
        let engine = Arc::clone(&h.engine);
        let assignment = h.assignment.clone();
        let submission = h.submission.clone();
        handles.push(tokio::spawn(async move {
            engine
                .grade(assignment, &submission, user, "", &GradeOptions::default())
                .await
        }));
    }
    for handle in handles {
        assert!(matches!(handle.await.unwrap().unwrap(), GradeOutcome::Graded { .. }));
    }

    let history = h.engine.store().get_submission_history(&h.assignment, user).unwrap();
    assert_eq!(history.len(), 4);
    for pair in history.windows(2) {
        let a: i64 = pair[0].short_id.parse().unwrap();
        let b: i64 = pair[1].short_id.parse().unwrap();
        assert!(a < b);
        assert!(pair[0].grading_start_time <= pair[1].grading_start_time);
        assert!(pair[0].grading_end_time <= pair[1].grading_start_time);
    }
}

fn roster(h: &Harness) {
    let mut student = CourseUser::new("student@example.edu", CourseRole::Student);
    student.lms_id = "lms-student".to_string();
    h.engine
        .store()
        .save_users("cs101", &BTreeMap::from([(student.email.clone(), student)]))
        .unwrap();
}

fn lms_with_comments(comments: Vec<SubmissionComment>) -> MemoryLms {
    MemoryLms::new(MemoryLmsState {
        assignments: vec![LmsAssignment {
            id: "001".to_string(),
            name: "HW0".to_string(),
            due_date: None,
            max_points: 5.0,
        }],
        scores: BTreeMap::from([(
            "001".to_string(),
            vec![SubmissionScore {
                user_id: "lms-student".to_string(),
                score: 3.0,
                time: Timestamp::zero(),
                comments,
            }],
        )]),
        ..Default::default()
    })
}

#[tokio::test]
async fn test_lms_upload_is_idempotent() {
    let h = harness("");
    roster(&h);
    let GradeOutcome::Graded { result, .. } = grade(&h, "student@example.edu").await else {
        panic!("expected graded outcome");
    };

    let existing = serde_json::to_string(&result.info.scoring_info()).unwrap();
    let lms = lms_with_comments(vec![SubmissionComment {
        id: "c1".to_string(),
        author: "autograder".to_string(),
        text: existing,
    }]);

    let course = Course::new("cs101").unwrap();
    let (_, plan) = full_assignment_scoring_and_upload(h.engine.store(), &course, &h.assignment, &lms, false)
        .await
        .unwrap();
    assert!(plan.is_empty());
}

#[tokio::test]
async fn test_lms_lock_comment_blocks_newer_submission() {
    let h = harness("");
    roster(&h);
    let GradeOutcome::Graded { result: old, .. } = grade(&h, "student@example.edu").await else {
        panic!("expected graded outcome");
    };
    assert!(matches!(grade(&h, "student@example.edu").await, GradeOutcome::Graded { .. }));

    let lms = lms_with_comments(vec![
        SubmissionComment {
            id: "c1".to_string(),
            author: "autograder".to_string(),
            text: serde_json::to_string(&old.info.scoring_info()).unwrap(),
        },
        SubmissionComment {
            id: "c2".to_string(),
            author: "instructor".to_string(),
            text: "Regraded by hand. __lock__".to_string(),
        },
    ]);

    let course = Course::new("cs101").unwrap();
    let (infos, plan) =
        full_assignment_scoring_and_upload(h.engine.store(), &course, &h.assignment, &lms, false)
            .await
            .unwrap();
    assert!(plan.is_empty());
    assert_ne!(infos["student@example.edu"].id, old.info.id.to_string());

    let posted = lms.fetch_assignment_scores("001").await.unwrap();
    assert_eq!(posted[0].comments.len(), 2);
}
