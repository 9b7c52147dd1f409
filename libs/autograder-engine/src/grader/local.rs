/// Grading as a local process, for hosts without Docker and for tests.
///
/// The temp dir mirrors the container layout (`input/`, `output/`, `work/`)
/// and the invocation's placeholder arguments are swapped for real paths.

use super::{collect_result, max_runtime, timeout_message, GradeOptions, RunOutput};
use crate::docker::OutputCollector;
use crate::files::{cleanup_temp_dir, copy_dir_contents, exec_file_operations};
use crate::image::{create_grading_dirs, prepare_static_files};
use autograder_common::types::GRADER_OUTPUT_RESULT_FILENAME;
use autograder_common::{Assignment, AutograderError, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

const PYTHON_GRADER_FILENAME: &str = "grader.py";
const PYTHON_IMAGE_BASENAME: &str = "edulinq/grader.python";
const PYTHON_INVOCATION: &[&str] = &[
    "python3",
    "-m",
    "autograder.cli.grading.grade-dir",
    "--grader",
    "<grader>",
    "--dir",
    "<basedir>",
    "--outpath",
    "<outpath>",
];

/// Resolve the assignment's invocation against concrete grading dirs.
pub(crate) fn local_invocation(
    assignment: &Assignment,
    base_dir: &Path,
    input_dir: &Path,
    output_dir: &Path,
    work_dir: &Path,
) -> Result<Vec<String>> {
    let info = &assignment.image_info;

    let raw: Vec<String> = if !info.invocation.is_empty() {
        info.invocation.clone()
    } else if info.image.contains(PYTHON_IMAGE_BASENAME) {
        PYTHON_INVOCATION.iter().map(|s| s.to_string()).collect()
    } else {
        return Err(AutograderError::validation(format!(
            "cannot determine a local grader invocation for '{}'",
            assignment.full_id()
        )));
    };

    let path = |p: &Path| p.to_string_lossy().to_string();

    Ok(raw
        .into_iter()
        .map(|part| match part.as_str() {
            "<grader>" => path(&work_dir.join(PYTHON_GRADER_FILENAME)),
            "<basedir>" => path(base_dir),
            "<inputdir>" => path(input_dir),
            "<outputdir>" => path(output_dir),
            "<workdir>" => path(work_dir),
            "<outpath>" => path(&output_dir.join(GRADER_OUTPUT_RESULT_FILENAME)),
            _ => part,
        })
        .collect())
}

pub(crate) async fn run_local_grader(
    assignment: &Assignment,
    submission_dir: &Path,
    options: &GradeOptions,
    max_output_bytes: usize,
) -> Result<RunOutput> {
    let temp_dir = tempfile::Builder::new()
        .prefix("autograder-grading-local-")
        .tempdir()
        .map_err(|e| AutograderError::infra(format!("failed to create grading dir: {}", e)))?;

    let result = run_in(assignment, submission_dir, temp_dir.path(), max_output_bytes).await;

    cleanup_temp_dir(temp_dir, options.leave_temp_dir, "grading dir");
    result
}

async fn run_in(
    assignment: &Assignment,
    submission_dir: &Path,
    base_dir: &Path,
    max_output_bytes: usize,
) -> Result<RunOutput> {
    let (input_dir, output_dir, work_dir) = create_grading_dirs(base_dir)?;
    let command = local_invocation(assignment, base_dir, &input_dir, &output_dir, &work_dir)?;

    let info = &assignment.image_info;
    prepare_static_files(info, &assignment.source_dir, &work_dir, base_dir).await?;
    copy_dir_contents(submission_dir, &input_dir)?;
    exec_file_operations(&info.post_submission_file_ops, base_dir)?;

    let (program, args) = command
        .split_first()
        .ok_or_else(|| AutograderError::validation("grader invocation is empty"))?;

    debug!(assignment = %assignment.full_id(), command = ?command, "Running local grader");

    let child = Command::new(program)
        .args(args)
        .current_dir(&work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AutograderError::infra(format!("failed to start local grader '{}': {}", program, e)))?;

    let output = match max_runtime(assignment) {
        Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(output) => output,
            Err(_) => {
                // Dropping the future kills the child.
                return Err(AutograderError::Grader {
                    message: timeout_message(assignment),
                    stdout: String::new(),
                    stderr: String::new(),
                });
            }
        },
        None => child.wait_with_output().await,
    }
    .map_err(|e| AutograderError::infra(format!("local grader '{}' failed to run: {}", program, e)))?;

    let mut collector = OutputCollector::new(max_output_bytes);
    collector.push_stdout(&output.stdout);
    collector.push_stderr(&output.stderr);
    let (stdout, stderr, _) = collector.finish();

    if !output.status.success() {
        debug!(status = %output.status, "Local grader exited unsuccessfully");
    }

    collect_result(&output_dir, stdout, stderr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use autograder_common::Course;
    use std::path::PathBuf;

    fn assignment(json: &str) -> Assignment {
        let course = Course::new("cs101").unwrap();
        Assignment::from_json(json, &course, Path::new(".")).unwrap()
    }

    #[test]
    fn test_placeholders_substituted() {
        let a = assignment(
            r#"{"id": "hw0", "image": "alpine", "invocation": ["run", "<grader>", "<inputdir>", "<outpath>", "--flag"]}"#,
        );
        let base = PathBuf::from("/tmp/g");
        let command = local_invocation(
            &a,
            &base,
            &base.join("input"),
            &base.join("output"),
            &base.join("work"),
        )
        .unwrap();

        assert_eq!(
            command,
            vec![
                "run",
                "/tmp/g/work/grader.py",
                "/tmp/g/input",
                "/tmp/g/output/result.json",
                "--flag"
            ]
        );
    }

    #[test]
    fn test_python_image_default_invocation() {
        let mut a = assignment(r#"{"id": "hw0", "image": "edulinq/grader.python:0.6"}"#);
        a.image_info.invocation.clear();
        let base = PathBuf::from("/b");
        let command =
            local_invocation(&a, &base, &base.join("input"), &base.join("output"), &base.join("work"))
                .unwrap();
        assert_eq!(command[0], "python3");
        assert!(command.contains(&"/b".to_string()));
    }

    #[test]
    fn test_no_invocation_errors() {
        let a = assignment(r#"{"id": "hw0", "image": "alpine"}"#);
        let base = PathBuf::from("/b");
        assert!(local_invocation(&a, &base, &base, &base, &base).is_err());
    }
}
