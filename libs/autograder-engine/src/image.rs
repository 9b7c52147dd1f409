/// Image Source & Build Cache
///
/// **Core Responsibility:**
/// Decide when an assignment's grading image is stale and rebuild it.
///
/// **Staleness (any of):**
/// 1. The last build failed or was never recorded
/// 2. The hashed image descriptor changed
/// 3. A `path` static file changed on disk
/// 4. A `git` static file's reference changed
///
/// **Locking:**
/// Every cache read/write for a source happens under that source's image lock,
/// and the lock is held across the whole build.
use crate::docker::ContainerRuntime;
use crate::filecache::{cache_fetch, cache_put, check_file_changes};
use crate::files::{
    cleanup_temp_dir, copy_filespecs, ensure_dir, exec_file_operations, md5_hex,
};
use autograder_common::keys::{
    assignment_cache_dir, CACHE_KEY_BUILD_SUCCESS, CACHE_KEY_IMAGE_INFO, FILE_CACHE_FILENAME,
};
use autograder_common::types::{
    ImageInfo, DOCKER_BASE_DIR, DOCKER_CONFIG_FILENAME, DOCKER_INPUT_DIR, DOCKER_OUTPUT_DIR,
    DOCKER_POST_SUBMISSION_OPS_FILENAME, DOCKER_WORK_DIR, GRADING_INPUT_DIRNAME,
    GRADING_OUTPUT_DIRNAME, GRADING_WORK_DIRNAME,
};
use autograder_common::{Assignment, AutograderError, FileSpecType, Result};
use dashmap::DashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Anything that can describe and lock a grading image.
pub trait ImageSource: Send + Sync {
    fn full_id(&self) -> String;

    /// Directory relative static files are resolved against.
    fn source_dir(&self) -> &Path;

    /// Directory holding the key/value build cache.
    fn cache_dir(&self) -> PathBuf;

    fn file_cache_path(&self) -> PathBuf {
        self.cache_dir().join(FILE_CACHE_FILENAME)
    }

    fn image_info(&self) -> &ImageInfo;

    fn image_lock(&self) -> Arc<Mutex<()>>;
}

/// Per-source build mutexes, created on first use and kept for the process lifetime.
#[derive(Default)]
pub struct ImageLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ImageLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, full_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(full_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// An assignment viewed as an image source.
pub struct AssignmentSource {
    assignment: Arc<Assignment>,
    cache_dir: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl AssignmentSource {
    pub fn new(assignment: Arc<Assignment>, base_dir: &Path, locks: &ImageLocks) -> Self {
        let cache_dir = assignment_cache_dir(base_dir, &assignment.course_id, &assignment.id);
        let lock = locks.get(&assignment.full_id());
        Self {
            assignment,
            cache_dir,
            lock,
        }
    }

    pub fn assignment(&self) -> &Assignment {
        &self.assignment
    }
}

impl ImageSource for AssignmentSource {
    fn full_id(&self) -> String {
        self.assignment.full_id()
    }

    fn source_dir(&self) -> &Path {
        &self.assignment.source_dir
    }

    fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone()
    }

    fn image_info(&self) -> &ImageInfo {
        &self.assignment.image_info
    }

    fn image_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.lock)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Build even when nothing changed, bypassing the docker layer cache.
    pub force: bool,
    /// Stop checking at the first detected change.
    pub quick: bool,
    pub keep_build_dir: bool,
}

impl BuildOptions {
    pub fn quick() -> Self {
        Self {
            quick: true,
            ..Default::default()
        }
    }
}

/// Check (under the image lock) whether `source` needs a rebuild.
pub async fn need_rebuild(source: &dyn ImageSource, quick: bool) -> Result<bool> {
    let lock = source.image_lock();
    let _guard = lock.lock().await;
    need_rebuild_locked(source, quick)
}

/// A detected change marks the last build as unsuccessful, so the source
/// stays stale until a build succeeds even though the new inputs are recorded.
fn need_rebuild_locked(source: &dyn ImageSource, quick: bool) -> Result<bool> {
    let need = detect_changes(source, quick)?;
    if need {
        cache_put(&source.cache_dir(), CACHE_KEY_BUILD_SUCCESS, false)?;
    }
    Ok(need)
}

/// Compare inputs against the cache, recording the current ones as it goes.
fn detect_changes(source: &dyn ImageSource, quick: bool) -> Result<bool> {
    let cache_dir = source.cache_dir();

    let (last_success, _) = cache_fetch(&cache_dir, CACHE_KEY_BUILD_SUCCESS)?;
    let last_build_failed = !last_success.and_then(|v| v.as_bool()).unwrap_or(false);
    if last_build_failed && quick {
        return Ok(true);
    }

    let info_hash = md5_hex(serde_json::to_string(source.image_info())?.as_bytes());
    let (old_hash, _) = cache_put(&cache_dir, CACHE_KEY_IMAGE_INFO, &info_hash)?;
    let info_changed = old_hash.as_ref().and_then(|v| v.as_str()) != Some(info_hash.as_str());
    if info_changed && quick {
        return Ok(true);
    }

    let files_changed = check_static_file_changes(source, quick)?;

    Ok(last_build_failed || info_changed || files_changed)
}

fn check_static_file_changes(source: &dyn ImageSource, quick: bool) -> Result<bool> {
    let cache_dir = source.cache_dir();
    let mut paths = Vec::new();
    let mut git_changed = false;

    for spec in &source.image_info().static_files {
        if quick && git_changed {
            return Ok(true);
        }

        match spec.kind {
            FileSpecType::Empty | FileSpecType::Nil | FileSpecType::Url => continue,
            FileSpecType::Path => paths.push(source.source_dir().join(&spec.path)),
            FileSpecType::Git => {
                if spec.reference.is_empty() {
                    warn!(
                        source = %source.full_id(),
                        repo = %spec.path,
                        "Git static file has no reference, changes upstream will not be seen"
                    );
                }

                let (old_ref, existed) = cache_put(&cache_dir, &spec.path, &spec.reference)?;
                let same = old_ref.as_ref().and_then(|v| v.as_str()) == Some(spec.reference.as_str());
                if !existed || !same {
                    git_changed = true;
                }
            }
        }
    }

    let paths_changed = check_file_changes(&source.file_cache_path(), &paths, quick)?;
    Ok(git_changed || paths_changed)
}

/// Rebuild `source`'s image if needed (or if forced).
/// Returns whether a build was attempted.
///
/// The build outcome is always recorded; a build error and a cache error are joined.
pub async fn build_image_from_source(
    source: &dyn ImageSource,
    runtime: &dyn ContainerRuntime,
    options: &BuildOptions,
) -> Result<bool> {
    let lock = source.image_lock();
    let _guard = lock.lock().await;

    let quick = options.quick && !options.force;

    let need = need_rebuild_locked(source, quick).map_err(|e| {
        AutograderError::infra(format!(
            "could not check if image needs building for '{}': {}",
            source.full_id(),
            e
        ))
    })?;

    if !options.force && !need {
        debug!(source = %source.full_id(), "No changes, skipping image build");
        return Ok(false);
    }

    let build_result = build_image(source, runtime, options).await;
    let success = build_result.is_ok();

    // A quick check may have stopped before recording every input; record them now.
    let refresh_result = if success {
        detect_changes(source, false).map(|_| ())
    } else {
        Ok(())
    };
    let cache_result = cache_put(&source.cache_dir(), CACHE_KEY_BUILD_SUCCESS, success).map(|_| ());

    AutograderError::join_results(
        build_result,
        AutograderError::join_results(refresh_result, cache_result),
    )?;

    info!(source = %source.full_id(), image = %source.image_info().name, "Built image");
    Ok(true)
}

/// Write a context dir, hand it to the runtime, and clean it up.
pub async fn build_image(
    source: &dyn ImageSource,
    runtime: &dyn ContainerRuntime,
    options: &BuildOptions,
) -> Result<()> {
    let image_info = source.image_info();
    let temp_dir = tempfile::Builder::new()
        .prefix(&format!("autograder-docker-build-{}-", image_info.name))
        .tempdir()
        .map_err(|e| AutograderError::infra(format!("failed to create build dir: {}", e)))?;

    let result = async {
        write_docker_context(source, temp_dir.path()).await?;
        runtime
            .build_image(temp_dir.path(), &image_info.name, options.force)
            .await
            .map(|_| ())
    }
    .await;

    cleanup_temp_dir(temp_dir, options.keep_build_dir, "image build dir");
    result
}

/// Create `input/`, `output/`, `work/` under `dir` and return them.
pub fn create_grading_dirs(dir: &Path) -> Result<(PathBuf, PathBuf, PathBuf)> {
    let input = dir.join(GRADING_INPUT_DIRNAME);
    let output = dir.join(GRADING_OUTPUT_DIRNAME);
    let work = dir.join(GRADING_WORK_DIRNAME);
    for path in [&input, &output, &work] {
        ensure_dir(path)?;
    }
    Ok((input, output, work))
}

/// Copy static files into `work_dir`, running pre-ops before and post-ops after.
/// Ops are relative to `ops_dir`.
pub async fn prepare_static_files(
    image_info: &ImageInfo,
    source_dir: &Path,
    work_dir: &Path,
    ops_dir: &Path,
) -> Result<()> {
    exec_file_operations(&image_info.pre_static_file_ops, ops_dir)?;
    copy_filespecs(&image_info.static_files, source_dir, work_dir, false).await?;
    exec_file_operations(&image_info.post_static_file_ops, ops_dir)
}

/// Full build context: Dockerfile, grading config, post-submission script, static files.
pub async fn write_docker_context(source: &dyn ImageSource, dir: &Path) -> Result<()> {
    let image_info = source.image_info();
    let (_, _, work_dir) = create_grading_dirs(dir)?;

    prepare_static_files(image_info, source.source_dir(), &work_dir, dir)
        .await
        .map_err(|e| AutograderError::Build {
            image: image_info.name.clone(),
            message: format!("failed to copy static files: {}", e),
        })?;

    let config_path = dir.join(DOCKER_CONFIG_FILENAME);
    let config = serde_json::to_string_pretty(&image_info.grading_config())?;
    fs::write(&config_path, config).map_err(|e| AutograderError::io(&config_path, e))?;

    let script_path = dir.join(DOCKER_POST_SUBMISSION_OPS_FILENAME);
    fs::write(&script_path, post_submission_ops_script(image_info))
        .map_err(|e| AutograderError::io(&script_path, e))?;

    let dockerfile_path = dir.join("Dockerfile");
    fs::write(&dockerfile_path, to_dockerfile(image_info, &work_dir)?)
        .map_err(|e| AutograderError::io(&dockerfile_path, e))
}

pub fn post_submission_ops_script(image_info: &ImageInfo) -> String {
    let mut lines = vec![
        "#!/bin/bash\n".to_string(),
        format!("# Post-Submission operations for '{}'.\n", image_info.name),
    ];
    lines.extend(
        image_info
            .post_submission_file_ops
            .iter()
            .map(|op| op.to_unix(".")),
    );
    lines.join("\n")
}

fn dockerfile_quote(text: &str) -> String {
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Render the Dockerfile. Every entry already in `work_dir` gets its own COPY.
pub fn to_dockerfile(image_info: &ImageInfo, work_dir: &Path) -> Result<String> {
    let mut lines = vec![format!("FROM {}", image_info.image), String::new()];

    lines.push("# Core directories".to_string());
    for dir in [DOCKER_BASE_DIR, DOCKER_INPUT_DIR, DOCKER_OUTPUT_DIR, DOCKER_WORK_DIR] {
        lines.push(format!("RUN mkdir -p '{}'", dir));
    }
    lines.push(String::new());

    lines.push(format!("WORKDIR {}", DOCKER_BASE_DIR));
    lines.push(String::new());

    lines.push(format!(
        "COPY {} {}/{}",
        DOCKER_CONFIG_FILENAME, DOCKER_BASE_DIR, DOCKER_CONFIG_FILENAME
    ));
    lines.push(String::new());
    lines.push(format!(
        "COPY {} {}/{}",
        DOCKER_POST_SUBMISSION_OPS_FILENAME, DOCKER_BASE_DIR, DOCKER_POST_SUBMISSION_OPS_FILENAME
    ));
    lines.push(String::new());

    lines.push("# Pre-Static Commands".to_string());
    lines.extend(image_info.pre_static_docker_commands.iter().cloned());
    lines.push(String::new());

    let mut names = Vec::new();
    for entry in fs::read_dir(work_dir).map_err(|e| AutograderError::io(work_dir, e))? {
        let entry = entry.map_err(|e| AutograderError::io(work_dir, e))?;
        names.push(entry.file_name().to_string_lossy().to_string());
    }
    names.sort();

    lines.push("# Static Files".to_string());
    for name in names {
        lines.push(format!(
            "COPY {} {}",
            dockerfile_quote(&format!("{}/{}", GRADING_WORK_DIRNAME, name)),
            dockerfile_quote(&format!("{}/{}", DOCKER_WORK_DIR, name))
        ));
    }
    lines.push(String::new());

    lines.push("# Post-Static Commands".to_string());
    lines.extend(image_info.post_static_docker_commands.iter().cloned());
    lines.push(String::new());

    if !image_info.invocation.is_empty() {
        let parts: Vec<String> = image_info
            .invocation
            .iter()
            .map(|part| dockerfile_quote(part))
            .collect();
        lines.push("# Invocation".to_string());
        lines.push(format!("CMD [{}]", parts.join(", ")));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::{ContainerOutput, RunRequest};
    use async_trait::async_trait;
    use autograder_common::fileops::FileOperation;
    use autograder_common::{Course, FileSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingRuntime {
        builds: AtomicUsize,
        fail: bool,
    }

    impl CountingRuntime {
        fn new(fail: bool) -> Self {
            Self {
                builds: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for CountingRuntime {
        async fn build_image(&self, context_dir: &Path, image_name: &str, _: bool) -> Result<String> {
            assert!(context_dir.join("Dockerfile").exists());
            self.builds.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AutograderError::Build {
                    image: image_name.to_string(),
                    message: "boom".into(),
                });
            }
            Ok(String::new())
        }

        async fn run(&self, _: RunRequest) -> Result<ContainerOutput> {
            Ok(ContainerOutput::default())
        }
    }

    fn fixture() -> (TempDir, AssignmentSource, ImageLocks) {
        let dir = TempDir::new().unwrap();
        let source_dir = dir.path().join("src");
        fs::create_dir_all(&source_dir).unwrap();
        fs::write(source_dir.join("grader.py"), "print('v1')").unwrap();

        let course = Course::new("cs101").unwrap();
        let json = r#"{
            "id": "hw0",
            "image": "python:3.12-slim",
            "invocation": ["python3", "grader.py"],
            "static-files": ["grader.py"],
            "post-submission-files-ops": [["cp", "input/sub.py", "work/sub.py"]]
        }"#;
        let assignment = Assignment::from_json(json, &course, &source_dir).unwrap();

        let locks = ImageLocks::new();
        let source = AssignmentSource::new(Arc::new(assignment), &dir.path().join("base"), &locks);
        (dir, source, locks)
    }

    #[tokio::test]
    async fn test_fresh_source_needs_rebuild() {
        let (_dir, source, _locks) = fixture();
        assert!(need_rebuild(&source, true).await.unwrap());
    }

    #[tokio::test]
    async fn test_static_file_change_triggers_rebuild() {
        let (_dir, source, _locks) = fixture();
        let runtime = CountingRuntime::new(false);

        assert!(build_image_from_source(&source, &runtime, &BuildOptions::quick())
            .await
            .unwrap());
        assert!(!need_rebuild(&source, true).await.unwrap());

        fs::write(source.source_dir().join("grader.py"), "print('v2')").unwrap();
        assert!(need_rebuild(&source, true).await.unwrap());
        // Still stale: checking alone does not consume the change.
        assert!(need_rebuild(&source, true).await.unwrap());

        assert!(build_image_from_source(&source, &runtime, &BuildOptions::quick())
            .await
            .unwrap());
        assert!(!need_rebuild(&source, true).await.unwrap());
        assert_eq!(runtime.builds.load(Ordering::SeqCst), 2);

        let force = BuildOptions {
            force: true,
            ..Default::default()
        };
        assert!(build_image_from_source(&source, &runtime, &force).await.unwrap());
        assert_eq!(runtime.builds.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unchanged_source_skips_build() {
        let (_dir, source, _locks) = fixture();
        let runtime = CountingRuntime::new(false);

        build_image_from_source(&source, &runtime, &BuildOptions::quick())
            .await
            .unwrap();
        let built = build_image_from_source(&source, &runtime, &BuildOptions::quick())
            .await
            .unwrap();
        assert!(!built);
        assert_eq!(runtime.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_build_is_cached_and_retried() {
        let (_dir, source, _locks) = fixture();
        let failing = CountingRuntime::new(true);

        let err = build_image_from_source(&source, &failing, &BuildOptions::quick())
            .await
            .unwrap_err();
        assert!(matches!(err, AutograderError::Build { .. }));

        let (value, existed) = cache_fetch(&source.cache_dir(), CACHE_KEY_BUILD_SUCCESS).unwrap();
        assert!(existed);
        assert_eq!(value.and_then(|v| v.as_bool()), Some(false));
        assert!(need_rebuild(&source, true).await.unwrap());
    }

    #[tokio::test]
    async fn test_git_reference_change() {
        let (dir, _source, locks) = fixture();
        let course = Course::new("cs101").unwrap();

        let mut assignment = Assignment::from_json(
            r#"{"id": "hw1", "image": "alpine"}"#,
            &course,
            dir.path(),
        )
        .unwrap();
        assignment.image_info.static_files = vec![FileSpec::git("https://host/tests.git", "v1")];
        let base = dir.path().join("base");
        let source = AssignmentSource::new(Arc::new(assignment.clone()), &base, &locks);

        // Non-quick pass records everything.
        assert!(need_rebuild(&source, false).await.unwrap());
        assert!(!check_static_file_changes(&source, false).unwrap());

        assignment.image_info.static_files = vec![FileSpec::git("https://host/tests.git", "v2")];
        let source = AssignmentSource::new(Arc::new(assignment), &base, &locks);
        assert!(check_static_file_changes(&source, false).unwrap());
    }

    #[tokio::test]
    async fn test_docker_context_layout() {
        let (dir, source, _locks) = fixture();
        let context = dir.path().join("context");
        write_docker_context(&source, &context).await.unwrap();

        assert!(context.join("work/grader.py").exists());
        assert!(context.join(DOCKER_CONFIG_FILENAME).exists());

        let dockerfile = fs::read_to_string(context.join("Dockerfile")).unwrap();
        assert!(dockerfile.starts_with("FROM python:3.12-slim\n"));
        assert!(dockerfile.contains("RUN mkdir -p '/autograder/input'"));
        assert!(dockerfile.contains("WORKDIR /autograder"));
        assert!(dockerfile.contains("COPY config.json /autograder/config.json"));
        assert!(dockerfile.contains("COPY \"work/grader.py\" \"/autograder/work/grader.py\""));
        assert!(dockerfile.contains("CMD [\"python3\", \"grader.py\"]"));

        let script = fs::read_to_string(context.join(DOCKER_POST_SUBMISSION_OPS_FILENAME)).unwrap();
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("cp -r './input/sub.py' './work/sub.py'"));
    }

    #[test]
    fn test_post_submission_script_without_ops() {
        let info = ImageInfo {
            name: "autograder.c.a".into(),
            post_submission_file_ops: vec![FileOperation::mv("input/a", "work/a")],
            ..Default::default()
        };
        let script = post_submission_ops_script(&info);
        assert!(script.contains("'autograder.c.a'"));
        assert!(script.lines().any(|l| l.starts_with("mv ")));
    }
}
