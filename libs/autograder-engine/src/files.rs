/// File plumbing shared by image builds and grading: copying trees,
/// resolving FileSpecs, running file operations, and gzip-tar bundles.

use autograder_common::fileops::{FileOpCommand, FileOperation};
use autograder_common::{AutograderError, FileSpec, FileSpecType, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::path::{Path, PathBuf};
use tar::Builder;
use tokio::process::Command;
use tracing::{debug, warn};
use walkdir::WalkDir;

pub fn md5_hex(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

pub fn md5_file_hex(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| AutograderError::io(path, e))?;
    Ok(md5_hex(&bytes))
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| AutograderError::io(path, e))
}

/// Copy a file or directory so that it exists at `dest`.
pub fn copy_dirent(source: &Path, dest: &Path) -> Result<()> {
    if !source.exists() {
        return Err(AutograderError::io(
            source,
            std::io::Error::new(std::io::ErrorKind::NotFound, "source does not exist"),
        ));
    }

    if source.is_file() {
        if let Some(parent) = dest.parent() {
            ensure_dir(parent)?;
        }
        fs::copy(source, dest).map_err(|e| AutograderError::io(source, e))?;
        return Ok(());
    }

    ensure_dir(dest)?;

    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| AutograderError::infra(format!("walk '{}': {}", source.display(), e)))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| AutograderError::infra(e.to_string()))?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(entry.path(), &target).map_err(|e| AutograderError::io(entry.path(), e))?;
        }
    }

    Ok(())
}

/// Copy every child of the directory `source` into `dest`.
pub fn copy_dir_contents(source: &Path, dest: &Path) -> Result<()> {
    if !source.is_dir() {
        return Err(AutograderError::validation(format!(
            "'{}' is not a directory",
            source.display()
        )));
    }
    copy_dirent(source, dest)
}

pub fn exec_file_operation(op: &FileOperation, base_dir: &Path) -> Result<()> {
    op.validate()?;

    let source = base_dir.join(&op.source);
    let dest = base_dir.join(&op.dest);

    match op.command {
        FileOpCommand::Copy => copy_dirent(&source, &dest),
        FileOpCommand::Move => {
            if let Some(parent) = dest.parent() {
                ensure_dir(parent)?;
            }
            fs::rename(&source, &dest).map_err(|e| AutograderError::io(&source, e))
        }
    }
}

pub fn exec_file_operations(ops: &[FileOperation], base_dir: &Path) -> Result<()> {
    for op in ops {
        exec_file_operation(op, base_dir).map_err(|e| {
            AutograderError::infra(format!(
                "file operation '{}' failed: {}",
                op.to_unix("."),
                e
            ))
        })?;
    }
    Ok(())
}

/// Resolve one FileSpec into `dest_dir`.
/// Relative paths are taken from `base_dir`.
pub async fn copy_filespec(
    spec: &FileSpec,
    base_dir: &Path,
    dest_dir: &Path,
    only_contents: bool,
) -> Result<()> {
    match spec.kind {
        FileSpecType::Empty | FileSpecType::Nil => Ok(()),
        FileSpecType::Path => {
            let source = if Path::new(&spec.path).is_absolute() {
                PathBuf::from(&spec.path)
            } else {
                base_dir.join(&spec.path)
            };

            if only_contents && source.is_dir() {
                return copy_dir_contents(&source, dest_dir);
            }

            let name = spec.dest_name().ok_or_else(|| {
                AutograderError::validation(format!("cannot name destination for '{}'", spec))
            })?;
            copy_dirent(&source, &dest_dir.join(name))
        }
        FileSpecType::Git => clone_git(spec, dest_dir).await,
        FileSpecType::Url => download_url(spec, dest_dir).await,
    }
}

pub async fn copy_filespecs(
    specs: &[FileSpec],
    base_dir: &Path,
    dest_dir: &Path,
    only_contents: bool,
) -> Result<()> {
    ensure_dir(dest_dir)?;
    for spec in specs {
        copy_filespec(spec, base_dir, dest_dir, only_contents).await?;
    }
    Ok(())
}

async fn clone_git(spec: &FileSpec, dest_dir: &Path) -> Result<()> {
    let target = dest_dir.join(&spec.dest);
    let url = authenticated_url(spec);

    debug!(repo = %spec.path, reference = %spec.reference, "Cloning git static file");
    run_git(&["clone", "--quiet", &url, &target.to_string_lossy()], None, spec).await?;

    if !spec.reference.is_empty() {
        run_git(&["checkout", "--quiet", &spec.reference], Some(&target), spec).await?;
    }

    Ok(())
}

fn authenticated_url(spec: &FileSpec) -> String {
    if spec.token.is_empty() {
        return spec.path.clone();
    }

    let user = if spec.username.is_empty() {
        "git"
    } else {
        spec.username.as_str()
    };

    match spec.path.split_once("://") {
        Some((scheme, rest)) => format!("{}://{}:{}@{}", scheme, user, spec.token, rest),
        None => spec.path.clone(),
    }
}

async fn run_git(args: &[&str], cwd: Option<&Path>, spec: &FileSpec) -> Result<()> {
    let mut command = Command::new("git");
    command.args(args).env("GIT_TERMINAL_PROMPT", "0");
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let output = command
        .output()
        .await
        .map_err(|e| AutograderError::infra(format!("failed to run git for '{}': {}", spec, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // The token may be echoed back in git's error output.
        let stderr = if spec.token.is_empty() {
            stderr.to_string()
        } else {
            stderr.replace(&spec.token, "<token>")
        };
        return Err(AutograderError::infra(format!(
            "git {} failed for '{}': {}",
            args.first().copied().unwrap_or(""),
            spec,
            stderr.trim()
        )));
    }

    Ok(())
}

async fn download_url(spec: &FileSpec, dest_dir: &Path) -> Result<()> {
    let response = reqwest::get(&spec.path)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| AutograderError::infra(format!("failed to fetch '{}': {}", spec, e)))?;

    let bytes = response
        .bytes()
        .await
        .map_err(|e| AutograderError::infra(format!("failed to read '{}': {}", spec, e)))?;

    let target = dest_dir.join(&spec.dest);
    fs::write(&target, &bytes).map_err(|e| AutograderError::io(&target, e))
}

/// Gzip-tar the contents of `dir` (entries stored relative to `dir`).
pub fn gzip_dir_to_bytes(dir: &Path) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);

    if dir.exists() {
        builder
            .append_dir_all(".", dir)
            .map_err(|e| AutograderError::io(dir, e))?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| AutograderError::io(dir, e))?;
    encoder.finish().map_err(|e| AutograderError::io(dir, e))
}

/// Remove a temp dir unless asked to keep it around.
pub fn cleanup_temp_dir(dir: tempfile::TempDir, keep: bool, what: &str) {
    if keep {
        let path = dir.keep();
        debug!(path = %path.display(), "Leaving behind {}", what);
        return;
    }

    let path = dir.path().to_path_buf();
    if let Err(e) = dir.close() {
        warn!(path = %path.display(), error = %e, "Failed to remove {}", what);
    }
}
