/// Container Runtime - Image Builds and Grading Runs
///
/// **Core Responsibility:**
/// Build grading images from a prepared context dir and run one grading
/// container per submission, returning the raw stdout/stderr.
///
/// **Boundary:**
/// - The runtime knows HOW to run (Docker today, anything behind the trait later)
/// - It does NOT parse grader output or decide scores
///
/// **Run contract:**
/// - Network disabled, container removed on exit
/// - Input mounted read-only, output mounted read-write
/// - stdout and stderr each capped at `max_output_bytes`
use async_trait::async_trait;
use autograder_common::types::{DOCKER_INPUT_DIR, DOCKER_OUTPUT_DIR};
use autograder_common::{AutograderError, Result};
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    KillContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::BuildImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use futures_util::stream::StreamExt;
use lazy_static::lazy_static;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

lazy_static! {
    static ref BAD_NAME_CHARS: Regex = Regex::new(r"[^a-zA-Z0-9_.\-]").expect("name pattern compiles");
}

/// One grading run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub image: String,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Usually the full submission ID; becomes part of the container name.
    pub run_id: String,
    pub max_output_bytes: usize,
    pub max_runtime: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerOutput {
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub timed_out: bool,
    pub exit_code: Option<i64>,
    pub execution_time_ms: u64,
}

impl ContainerOutput {
    /// The run's transcript: stdout followed by stderr.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Execution backend trait
///
/// Implementations must:
/// 1. Tag the built image with exactly `image_name`
/// 2. Fail the build if the daemon reports any error entry
/// 3. Never let a grading container reach the network
/// 4. Return captured output even when the grader exits non-zero
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build `context_dir` (which must hold a `Dockerfile`) into `image_name`.
    /// Returns the build transcript.
    async fn build_image(&self, context_dir: &Path, image_name: &str, no_cache: bool)
        -> Result<String>;

    async fn run(&self, request: RunRequest) -> Result<ContainerOutput>;
}

/// Keep only `[a-zA-Z0-9_.-]` and make sure the name starts alphanumeric.
pub fn clean_container_name(text: &str) -> String {
    let cleaned = BAD_NAME_CHARS.replace_all(text, "").to_string();
    match cleaned.chars().next() {
        Some(c) if c.is_ascii_alphanumeric() => cleaned,
        _ => format!("a{}", cleaned),
    }
}

/// One output stream, capped at a fixed number of bytes.
struct CappedStream {
    bytes: Vec<u8>,
    remaining: usize,
    truncated: bool,
}

impl CappedStream {
    fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            remaining: limit,
            truncated: false,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        let take = bytes.len().min(self.remaining);
        self.remaining -= take;
        self.bytes.extend_from_slice(&bytes[..take]);
        if take < bytes.len() {
            self.truncated = true;
        }
    }

    fn finish(self, name: &str, limit: usize) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).to_string();
        if self.truncated {
            text.push_str(&format!(
                "\n\nOutput ({}) exceeds maximum size ({} bytes), output has been truncated.",
                name, limit
            ));
        }
        text
    }
}

/// Splits container output into stdout/stderr, each under its own byte budget.
pub(crate) struct OutputCollector {
    stdout: CappedStream,
    stderr: CappedStream,
    limit: usize,
}

impl OutputCollector {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            stdout: CappedStream::new(limit),
            stderr: CappedStream::new(limit),
            limit,
        }
    }

    pub(crate) fn push_stdout(&mut self, bytes: &[u8]) {
        self.stdout.push(bytes);
    }

    pub(crate) fn push_stderr(&mut self, bytes: &[u8]) {
        self.stderr.push(bytes);
    }

    /// (stdout, stderr, truncated)
    pub(crate) fn finish(self) -> (String, String, bool) {
        let truncated = self.stdout.truncated || self.stderr.truncated;
        (
            self.stdout.finish("stdout", self.limit),
            self.stderr.finish("stderr", self.limit),
            truncated,
        )
    }
}

/// Plain (uncompressed) tar of a build context.
fn tar_context(dir: &Path) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", dir)
        .map_err(|e| AutograderError::io(dir, e))?;
    builder.into_inner().map_err(|e| AutograderError::io(dir, e))
}

fn bind_mount(source: &Path, target: &str, read_only: bool) -> Mount {
    Mount {
        target: Some(target.to_string()),
        source: Some(source.to_string_lossy().to_string()),
        typ: Some(MountTypeEnum::BIND),
        read_only: Some(read_only),
        ..Default::default()
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| AutograderError::io(path, e))?;
    Ok(cwd.join(path))
}

/// Docker-backed runtime talking to the local daemon.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            AutograderError::infra(format!("failed to connect to docker daemon: {}", e))
        })?;
        Ok(Self { docker })
    }

    async fn wait_for_exit(&self, id: &str) -> Option<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Some(response.status_code),
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Some(code),
            // Auto-removal can win the race against the wait call.
            Some(Err(e)) => {
                debug!(container = %id, error = %e, "Container wait ended early");
                None
            }
            None => None,
        }
    }

    async fn remove(&self, id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(id, Some(options)).await {
            warn!(container = %id, error = %e, "Failed to remove container");
        }
    }

    async fn kill(&self, id: &str) {
        if let Err(e) = self
            .docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
        {
            debug!(container = %id, error = %e, "Failed to kill container");
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build_image(
        &self,
        context_dir: &Path,
        image_name: &str,
        no_cache: bool,
    ) -> Result<String> {
        let context = tar_context(context_dir)?;

        let options = BuildImageOptions {
            dockerfile: "Dockerfile",
            t: image_name,
            rm: true,
            nocache: no_cache,
            ..Default::default()
        };

        debug!(image = %image_name, no_cache, "Building image");
        let mut stream = self.docker.build_image(options, None, Some(context.into()));

        let mut transcript = String::new();
        let mut errors = Vec::new();

        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| AutograderError::Build {
                image: image_name.to_string(),
                message: e.to_string(),
            })?;

            if let Some(text) = info.stream {
                transcript.push_str(&text);
            }

            if let Some(error) = info.error {
                warn!(image = %image_name, message = %error, "Image build had an error entry");
                transcript.push_str(&error);
                errors.push(error);
            }
        }

        trace!(image = %image_name, output = %transcript, "Image build output");

        if !errors.is_empty() {
            return Err(AutograderError::Build {
                image: image_name.to_string(),
                message: errors.join("; "),
            });
        }

        Ok(transcript)
    }

    async fn run(&self, request: RunRequest) -> Result<ContainerOutput> {
        let name = clean_container_name(&format!("{}-{}", request.run_id, uuid::Uuid::new_v4()));
        let input_dir = absolute(&request.input_dir)?;
        let output_dir = absolute(&request.output_dir)?;

        let config = Config {
            image: Some(request.image.clone()),
            network_disabled: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(HostConfig {
                mounts: Some(vec![
                    bind_mount(&input_dir, DOCKER_INPUT_DIR, true),
                    bind_mount(&output_dir, DOCKER_OUTPUT_DIR, false),
                ]),
                auto_remove: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        debug!(container = %name, image = %request.image, "Creating container");
        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| {
                AutograderError::infra(format!("failed to create container '{}': {}", name, e))
            })?;
        let id = container.id;

        // Attach before starting so no early output is lost.
        let attach_options = AttachContainerOptions::<String> {
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            ..Default::default()
        };
        let mut output_stream = match self.docker.attach_container(&id, Some(attach_options)).await {
            Ok(AttachContainerResults { output, .. }) => Some(output),
            Err(e) => {
                warn!(container = %name, error = %e, "Failed to attach to container output");
                None
            }
        };

        let start_time = Instant::now();
        if let Err(e) = self
            .docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
        {
            // auto_remove only covers containers that started.
            self.remove(&id).await;
            return Err(AutograderError::infra(format!(
                "failed to start container '{}': {}",
                name, e
            )));
        }

        let mut collector = OutputCollector::new(request.max_output_bytes);
        let finished = async {
            if let Some(stream) = output_stream.as_mut() {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                            collector.push_stdout(&message)
                        }
                        Ok(LogOutput::StdErr { message }) => collector.push_stderr(&message),
                        Ok(_) => {}
                        Err(e) => {
                            warn!(container = %name, error = %e, "Container output stream failed");
                            break;
                        }
                    }
                }
            }
            self.wait_for_exit(&id).await
        };

        let (exit_code, timed_out) = match request.max_runtime {
            Some(limit) => match tokio::time::timeout(limit, finished).await {
                Ok(code) => (code, false),
                Err(_) => (None, true),
            },
            None => (finished.await, false),
        };

        if timed_out {
            warn!(container = %name, "Container exceeded its max runtime, killing");
            self.kill(&id).await;
        }

        let (stdout, stderr, truncated) = collector.finish();
        debug!(container = %name, exit_code = ?exit_code, timed_out, truncated, "Done with container");

        Ok(ContainerOutput {
            stdout,
            stderr,
            truncated,
            timed_out,
            exit_code,
            execution_time_ms: start_time.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_clean_container_name() {
        assert_eq!(
            clean_container_name("cs101::hw0::alice@example.edu::123-abc"),
            "cs101hw0aliceexample.edu123-abc"
        );
        assert_eq!(clean_container_name("-leading"), "a-leading");
        assert_eq!(clean_container_name("::"), "a");
    }

    #[test]
    fn test_collector_budget_is_per_stream() {
        let mut collector = OutputCollector::new(8);
        collector.push_stdout(b"12345");
        collector.push_stderr(b"abcdef");
        collector.push_stdout(b"more");

        let (stdout, stderr, truncated) = collector.finish();
        assert!(truncated);
        assert!(stdout.starts_with("12345mor\n\n"));
        assert!(stdout.contains("stdout"));
        assert!(stdout.contains("8 bytes"));
        // stderr fit in its own budget.
        assert_eq!(stderr, "abcdef");
    }

    #[test]
    fn test_collector_under_limit() {
        let mut collector = OutputCollector::new(1024);
        collector.push_stdout(b"ok");
        let (stdout, stderr, truncated) = collector.finish();
        assert_eq!(stdout, "ok");
        assert!(stderr.is_empty());
        assert!(!truncated);
    }

    #[test]
    fn test_combined_transcript() {
        let output = ContainerOutput {
            stdout: "out".into(),
            stderr: "err".into(),
            ..Default::default()
        };
        assert_eq!(output.combined(), "out\nerr");
        let quiet = ContainerOutput {
            stderr: "err".into(),
            ..Default::default()
        };
        assert_eq!(quiet.combined(), "err");
    }

    #[tokio::test]
    #[ignore] // needs a local docker daemon and the alpine image
    async fn test_failed_start_removes_container() {
        use bollard::container::ListContainersOptions;
        use std::collections::HashMap;

        let runtime = DockerRuntime::connect().unwrap();
        let context = TempDir::new().unwrap();
        fs::write(
            context.path().join("Dockerfile"),
            "FROM alpine\nCMD [\"/does-not-exist\"]\n",
        )
        .unwrap();
        let image = "autograder.test.bad-entrypoint";
        runtime.build_image(context.path(), image, false).await.unwrap();

        let input = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        let run_id = format!("failed-start-{}", uuid::Uuid::new_v4());
        let err = runtime
            .run(RunRequest {
                image: image.to_string(),
                input_dir: input.path().to_path_buf(),
                output_dir: output.path().to_path_buf(),
                run_id: run_id.clone(),
                max_output_bytes: 1024,
                max_runtime: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AutograderError::Infrastructure(_)));

        let filters = HashMap::from([("name".to_string(), vec![run_id])]);
        let left = runtime
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .unwrap();
        assert!(left.is_empty());
    }

    #[test]
    fn test_tar_context_holds_dockerfile() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM alpine").unwrap();

        let bytes = tar_context(dir.path()).unwrap();
        let mut archive = tar::Archive::new(bytes.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();
        assert!(names.iter().any(|n| n.ends_with("Dockerfile")));
    }
}
