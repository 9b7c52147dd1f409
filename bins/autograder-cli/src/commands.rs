// CLI commands: thin wrappers over the grading engine
use anyhow::{bail, Context, Result};
use autograder_common::types::SubmissionHistoryItem;
use autograder_common::{validate_user, Assignment, Config};
use autograder_engine::image::need_rebuild as image_need_rebuild;
use autograder_engine::scoring::full_course_scoring_and_upload;
use autograder_engine::{
    BuildOptions, CourseEntry, CourseRegistry, GradeOptions, GradeOutcome, GradingEngine,
    SubmissionStore, TaskContext, TaskKind, TaskScheduler,
};
use std::path::Path;
use std::sync::Arc;

pub struct GradeFlags {
    pub no_container: bool,
    pub no_store: bool,
    pub no_rejection: bool,
    pub leave_temp_dir: bool,
    pub json: bool,
}

pub fn load_config(path: Option<&str>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    config.context("Failed to load configuration")
}

async fn load_course(course_dir: &Path) -> Result<CourseEntry> {
    CourseRegistry::new()
        .load_course(course_dir)
        .await
        .with_context(|| format!("Failed to load course from {}", course_dir.display()))
}

fn find_assignment(entry: &CourseEntry, assignment_id: &str) -> Result<Arc<Assignment>> {
    match entry.course.assignment(assignment_id) {
        Some(assignment) => Ok(Arc::new(assignment.clone())),
        None => bail!(
            "Assignment '{}' not found in course '{}'",
            assignment_id,
            entry.course.id
        ),
    }
}

fn format_history_item(item: &SubmissionHistoryItem) -> String {
    let mut line = format!(
        "{:>15}  {:>7.2} / {:<7.2}  {}",
        item.short_id,
        item.score,
        item.max_points,
        item.grading_start_time.pretty()
    );
    if !item.message.is_empty() {
        line.push_str("  ");
        line.push_str(&item.message);
    }
    line
}

pub async fn grade(
    mut config: Config,
    course_dir: &Path,
    assignment_id: &str,
    submission: &Path,
    user: &str,
    message: &str,
    flags: GradeFlags,
) -> Result<()> {
    let entry = load_course(course_dir).await?;
    let assignment = find_assignment(&entry, assignment_id)?;

    if flags.no_container {
        config.docker.enabled = false;
    }
    let engine = GradingEngine::from_config(config).context("Failed to create grading engine")?;

    let options = GradeOptions {
        no_container: flags.no_container,
        leave_temp_dir: flags.leave_temp_dir,
        check_rejection: !flags.no_rejection,
        no_store: flags.no_store,
    };

    match engine.grade(assignment, submission, user, message, &options).await {
        Ok(GradeOutcome::Graded { result, store_error }) => {
            if flags.json {
                println!("{}", serde_json::to_string_pretty(&result.info)?);
            } else {
                println!("✓ Graded {}", result.info.id);
                for question in &result.info.questions {
                    println!(
                        "  {:<20} {:>7.2} / {:<7.2} {}",
                        question.name, question.score, question.max_points, question.message
                    );
                }
                println!("  {:<20} {:>7.2} / {:<7.2}", "Total", result.info.score, result.info.max_points);
            }
            if let Some(e) = store_error {
                eprintln!("⚠️  Submission was graded but not saved: {}", e);
            }
        }
        Ok(GradeOutcome::Rejected(reason)) => {
            println!("✗ Rejected: {}", reason);
        }
        Err(autograder_common::AutograderError::Grader { message, stdout, stderr }) => {
            eprintln!("--- stdout ---\n{}", stdout);
            eprintln!("--- stderr ---\n{}", stderr);
            bail!("Grader failed: {}", message);
        }
        Err(e) => return Err(e).context("Grading failed"),
    }

    Ok(())
}

pub async fn build_images(
    config: Config,
    course_dir: &Path,
    assignment_id: Option<&str>,
    force: bool,
) -> Result<()> {
    if !config.docker.enabled {
        bail!("Docker is disabled in the configuration, cannot build images");
    }

    let entry = load_course(course_dir).await?;
    let keep_build_dir = config.docker.keep_build_dirs;
    let engine = GradingEngine::from_config(config).context("Failed to create grading engine")?;

    let assignments = match assignment_id {
        Some(id) => vec![find_assignment(&entry, id)?],
        None => entry
            .course
            .assignments
            .values()
            .map(|a| Arc::new(a.clone()))
            .collect(),
    };

    let options = BuildOptions {
        force,
        quick: true,
        keep_build_dir,
    };

    for assignment in assignments {
        let image = assignment.image_name();
        println!("🔨 Building {}", image);
        let built = engine
            .ensure_image(assignment, &options)
            .await
            .with_context(|| format!("Failed to build {}", image))?;
        if built {
            println!("✓ Built {}", image);
        } else {
            println!("✓ {} is up to date", image);
        }
    }

    Ok(())
}

pub async fn need_rebuild(config: Config, course_dir: &Path, assignment_id: &str, quick: bool) -> Result<()> {
    let entry = load_course(course_dir).await?;
    let assignment = find_assignment(&entry, assignment_id)?;

    // Only the cache is consulted, no runtime is needed.
    let engine = GradingEngine::new(config, None);
    let source = engine.image_source(assignment.clone());
    let need = image_need_rebuild(&source, quick).await?;

    println!("{}: {}", assignment.image_name(), if need { "needs rebuild" } else { "up to date" });
    Ok(())
}

pub async fn history(config: Config, course_dir: &Path, assignment_id: &str, user: &str) -> Result<()> {
    let entry = load_course(course_dir).await?;
    let assignment = find_assignment(&entry, assignment_id)?;

    let user = validate_user(user).context("Invalid user")?;
    let store = SubmissionStore::new(&config.base_dir);
    let items = store.get_submission_history(&assignment, &user)?;
    if items.is_empty() {
        println!("No submissions for {} on {}", user, assignment.full_id());
        return Ok(());
    }

    for item in &items {
        println!("{}", format_history_item(item));
    }
    Ok(())
}

pub async fn upload_scores(config: Config, course_dir: &Path, dry_run: bool) -> Result<()> {
    let entry = load_course(course_dir).await?;
    let Some(lms) = entry.lms.clone() else {
        bail!("Course '{}' has no LMS configured", entry.course.id);
    };

    let store = SubmissionStore::new(&config.base_dir);
    let scores = full_course_scoring_and_upload(&store, &entry.course, lms.as_ref(), dry_run).await?;

    for (assignment, users) in &scores {
        println!("{}: {} scored users", assignment, users.len());
    }
    if dry_run {
        println!("Dry run, nothing was uploaded");
    }
    Ok(())
}

pub async fn run_task(config: Config, course_dir: &Path, kind: TaskKind) -> Result<()> {
    let entry = load_course(course_dir).await?;

    let engine = GradingEngine::new(config.clone(), None);
    let scheduler = TaskScheduler::new(TaskContext {
        base_dir: config.base_dir.clone(),
        store: Arc::clone(engine.store()),
        locks: Arc::clone(engine.locks()),
        min_rest: config.min_task_rest(),
    });

    scheduler
        .run_now(kind, &entry.course, entry.lms.as_deref())
        .await
        .with_context(|| format!("Task '{}' failed for course '{}'", kind, entry.course.id))?;

    println!("✓ {} finished for {}", kind, entry.course.id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use autograder_common::{SubmissionId, Timestamp};
    use std::fs;
    use tempfile::TempDir;

    fn write_course(root: &Path) {
        fs::create_dir_all(root.join("hw0")).unwrap();
        fs::write(root.join("course.json"), r#"{"id": "cs101"}"#).unwrap();
        fs::write(
            root.join("hw0").join("assignment.json"),
            r#"{"id": "hw0", "image": "alpine"}"#,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_find_assignment() {
        let dir = TempDir::new().unwrap();
        write_course(dir.path());

        let entry = load_course(dir.path()).await.unwrap();
        assert_eq!(find_assignment(&entry, "hw0").unwrap().id, "hw0");
        let err = find_assignment(&entry, "hw1").unwrap_err();
        assert!(err.to_string().contains("'hw1'"));
    }

    #[test]
    fn test_format_history_item() {
        let item = SubmissionHistoryItem {
            id: SubmissionId::new("cs101", "hw0", "a@b.c", "1000"),
            short_id: "1000".to_string(),
            score: 3.0,
            max_points: 5.0,
            grading_start_time: Timestamp::from_millis(1000),
            grading_end_time: Timestamp::from_millis(2000),
            message: "first try".to_string(),
        };
        let line = format_history_item(&item);
        assert!(line.contains("1000"));
        assert!(line.contains("3.00 / 5.00"));
        assert!(line.ends_with("first try"));
    }

    #[tokio::test]
    async fn test_history_refuses_path_like_user() {
        let dir = TempDir::new().unwrap();
        write_course(dir.path());
        let config = Config::with_base_dir(dir.path().join("base"));
        let err = history(config, dir.path(), "hw0", "../../etc").await.unwrap_err();
        assert!(err.to_string().contains("Invalid user"));
    }

    #[tokio::test]
    async fn test_upload_scores_requires_lms() {
        let dir = TempDir::new().unwrap();
        write_course(dir.path());
        let err = upload_scores(Config::with_base_dir(dir.path().join("base")), dir.path(), true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no LMS"));
    }
}
