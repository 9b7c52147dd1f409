/// Grading inside the assignment's image.
///
/// `input/` is a temp copy of the submission (mounted read-only),
/// `output/` is mounted read-write, and `work/` only exists inside the image.

use super::{collect_result, max_runtime, timeout_message, GradeOptions, RunOutput};
use crate::docker::{ContainerRuntime, RunRequest};
use crate::files::{cleanup_temp_dir, copy_dir_contents};
use crate::image::create_grading_dirs;
use autograder_common::{Assignment, AutograderError, Result};
use std::path::Path;
use tracing::{debug, trace};

pub(crate) async fn run_container_grader(
    runtime: &dyn ContainerRuntime,
    assignment: &Assignment,
    submission_dir: &Path,
    run_id: &str,
    options: &GradeOptions,
    max_output_bytes: usize,
) -> Result<RunOutput> {
    let temp_dir = tempfile::Builder::new()
        .prefix("autograder-grading-docker-")
        .tempdir()
        .map_err(|e| AutograderError::infra(format!("failed to create grading dir: {}", e)))?;

    let result = async {
        let (input_dir, output_dir, _) = create_grading_dirs(temp_dir.path())?;
        copy_dir_contents(submission_dir, &input_dir)?;

        let output = runtime
            .run(RunRequest {
                image: assignment.image_name(),
                input_dir,
                output_dir: output_dir.clone(),
                run_id: run_id.to_string(),
                max_output_bytes,
                max_runtime: max_runtime(assignment),
            })
            .await?;

        debug!(
            run_id = %run_id,
            exit_code = ?output.exit_code,
            execution_time_ms = output.execution_time_ms,
            "Grading container finished"
        );
        trace!(run_id = %run_id, transcript = %output.combined(), "Grading container output");

        if output.timed_out {
            return Err(AutograderError::Grader {
                message: timeout_message(assignment),
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }

        collect_result(&output_dir, output.stdout, output.stderr)
    }
    .await;

    cleanup_temp_dir(temp_dir, options.leave_temp_dir, "grading dir");
    result
}
