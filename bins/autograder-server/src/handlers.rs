// HTTP route handlers for the autograder server

use autograder_common::types::GradingInfo;
use autograder_common::{validate_user, AutograderError, Timestamp};
use autograder_engine::{GradeOptions, GradeOutcome};
use axum::{
    extract::{Path as UrlPath, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::{metrics, AppState};

#[derive(Debug, Deserialize)]
pub struct GradeRequest {
    pub course: String,
    pub assignment: String,
    pub user: String,
    #[serde(default)]
    pub message: String,
    /// Relative path -> base64 file contents.
    pub files: BTreeMap<String, String>,
    /// Grade without saving the submission.
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct GradeResponse {
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<GradingInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl GradeResponse {
    fn error(message: String) -> Self {
        Self {
            outcome: "error",
            message: Some(message),
            ..Default::default()
        }
    }
}

fn status_for(err: &AutograderError) -> StatusCode {
    match err {
        AutograderError::Grader { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        e if e.is_validation() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Decode the uploaded files into `dir`. Names must stay inside `dir`.
pub fn write_submission_files(dir: &Path, files: &BTreeMap<String, String>) -> autograder_common::Result<()> {
    if files.is_empty() {
        return Err(AutograderError::validation("submission has no files"));
    }

    for (name, encoded) in files {
        let relative = Path::new(name);
        let safe = !name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(AutograderError::validation(format!(
                "invalid submission file name '{}'",
                name
            )));
        }

        let bytes = STANDARD.decode(encoded).map_err(|e| {
            AutograderError::validation(format!("file '{}' is not valid base64: {}", name, e))
        })?;

        let path = dir.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| AutograderError::io(parent, e))?;
        }
        fs::write(&path, bytes).map_err(|e| AutograderError::io(&path, e))?;
    }

    Ok(())
}

/// POST /grade - Grade one submission synchronously
pub async fn grade_submission(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<GradeRequest>,
) -> Response {
    let (status, body) = grade(&state, payload).await;
    metrics::record_request("/grade", "POST", status.as_u16());
    (status, Json(body)).into_response()
}

async fn grade(state: &Arc<AppState>, payload: GradeRequest) -> (StatusCode, GradeResponse) {
    let started = Instant::now();

    let user = match validate_user(&payload.user) {
        Ok(user) => user,
        Err(e) => return (StatusCode::BAD_REQUEST, GradeResponse::error(e.user_message())),
    };

    let Some(assignment) = state
        .registry
        .get_assignment(&payload.course, &payload.assignment)
        .await
    else {
        return (
            StatusCode::NOT_FOUND,
            GradeResponse::error(format!(
                "unknown assignment '{}::{}'",
                payload.course, payload.assignment
            )),
        );
    };

    let submission = match tempfile::Builder::new()
        .prefix("autograder-submission-")
        .tempdir()
    {
        Ok(dir) => dir,
        Err(e) => {
            error!(error = %e, "Failed to create submission dir");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                GradeResponse::error("internal autograder error".to_string()),
            );
        }
    };
    if let Err(e) = write_submission_files(submission.path(), &payload.files) {
        warn!(course = %payload.course, assignment = %payload.assignment, user = %user, error = %e, "Bad submission upload");
        return (status_for(&e), GradeResponse::error(e.user_message()));
    }

    let mut options = GradeOptions::from_config(state.engine.config());
    options.no_store = payload.dry_run;

    // Grading runs on its own task so a client disconnect does not abandon
    // a half-finished submission.
    let engine = Arc::clone(&state.engine);
    let course_id = payload.course.clone();
    let assignment_id = payload.assignment.clone();
    let message = payload.message.clone();
    let task = tokio::spawn(async move {
        let outcome = engine
            .grade(assignment, submission.path(), &user, &message, &options)
            .await;
        drop(submission);
        outcome
    });

    let outcome = match task.await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(course = %course_id, assignment = %assignment_id, error = %e, "Grading task failed");
            Err(AutograderError::infra(format!("grading task failed: {}", e)))
        }
    };

    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    let (status, body) = match outcome {
        Ok(GradeOutcome::Graded { result, store_error }) => {
            let message = store_error.map(|e| {
                error!(course = %course_id, assignment = %assignment_id, error = %e, "Graded submission was not saved");
                e.user_message()
            });
            let result = *result;
            (
                StatusCode::OK,
                GradeResponse {
                    outcome: "graded",
                    result: Some(result.info),
                    message,
                    stdout: Some(result.stdout),
                    stderr: Some(result.stderr),
                },
            )
        }
        Ok(GradeOutcome::Rejected(reason)) => {
            metrics::record_rejection(reason.label());
            (
                StatusCode::OK,
                GradeResponse {
                    outcome: "rejected",
                    message: Some(reason.message(Timestamp::now())),
                    ..Default::default()
                },
            )
        }
        Err(AutograderError::Grader {
            message,
            stdout,
            stderr,
        }) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            GradeResponse {
                outcome: "failed",
                message: Some(message),
                stdout: Some(stdout),
                stderr: Some(stderr),
                ..Default::default()
            },
        ),
        Err(e) => (status_for(&e), GradeResponse::error(e.user_message())),
    };

    metrics::record_grade(&course_id, &assignment_id, body.outcome, elapsed_ms);
    (status, body)
}

/// POST /courses/:course/reload - Re-read a loaded course from its source dir
pub async fn reload_course(
    State(state): State<Arc<AppState>>,
    UrlPath(course_id): UrlPath<String>,
) -> impl IntoResponse {
    let Some(entry) = state.registry.get(&course_id).await else {
        metrics::record_request("/courses/reload", "POST", 404);
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("unknown course '{}'", course_id) })),
        );
    };

    match state
        .registry
        .update_from_source(&entry.course.source_dir, &state.scheduler)
        .await
    {
        Ok(updated) => {
            info!(course = %course_id, "Reloaded course");
            metrics::record_request("/courses/reload", "POST", 200);
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "course": updated.course.id,
                    "assignments": updated.course.assignments.keys().collect::<Vec<_>>(),
                })),
            )
        }
        Err(e) => {
            error!(course = %course_id, error = %e, "Failed to reload course");
            let status = status_for(&e);
            metrics::record_request("/courses/reload", "POST", status.as_u16());
            (status, Json(serde_json::json!({ "error": e.user_message() })))
        }
    }
}

/// GET /health - Liveness and a little context
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let courses = state.registry.course_ids().await;
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "uptime_secs": state.start_time.elapsed().as_secs(),
            "courses": courses,
        })),
    )
}

/// GET /metrics - Prometheus text format
pub async fn prometheus_metrics() -> impl IntoResponse {
    match metrics::render_metrics() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}
