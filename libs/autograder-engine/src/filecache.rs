/// File-Change Cache
///
/// Two small on-disk stores:
/// - a key/value cache per directory (`cache.json`), used for build flags,
///   descriptor hashes, and git references
/// - a path/hash cache file, used to notice edits to static files
///
/// Both are rewritten through a temp file + rename so readers never see a
/// half-written cache. Callers serialize access per cache (the image lock).
use crate::files::{ensure_dir, md5_file_hex, md5_hex};
use autograder_common::keys::CACHE_FILENAME;
use autograder_common::{AutograderError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::trace;
use walkdir::WalkDir;

type KeyValueCache = BTreeMap<String, Value>;

/// `{absolute path: md5 hex}`
type FileHashCache = BTreeMap<String, String>;

fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }

    let text = fs::read_to_string(path).map_err(|e| AutograderError::io(path, e))?;
    if text.trim().is_empty() {
        return Ok(T::default());
    }

    Ok(serde_json::from_str(&text)?)
}

fn write_json_atomic<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    ensure_dir(dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| AutograderError::io(dir, e))?;
    let text = serde_json::to_string_pretty(value)?;
    temp.write_all(text.as_bytes())
        .map_err(|e| AutograderError::io(temp.path(), e))?;
    temp.persist(path)
        .map_err(|e| AutograderError::io(path, e.error))?;

    Ok(())
}

fn cache_path(cache_dir: &Path) -> PathBuf {
    cache_dir.join(CACHE_FILENAME)
}

/// Store `value` under `key`, returning the previous value (if any) and whether it existed.
pub fn cache_put<T: Serialize>(cache_dir: &Path, key: &str, value: T) -> Result<(Option<Value>, bool)> {
    let path = cache_path(cache_dir);
    let mut cache: KeyValueCache = load_json(&path)?;

    let old = cache.insert(key.to_string(), serde_json::to_value(value)?);
    write_json_atomic(&cache, &path)?;

    let existed = old.is_some();
    Ok((old, existed))
}

pub fn cache_fetch(cache_dir: &Path, key: &str) -> Result<(Option<Value>, bool)> {
    let cache: KeyValueCache = load_json(&cache_path(cache_dir))?;
    let value = cache.get(key).cloned();
    let existed = value.is_some();
    Ok((value, existed))
}

/// Hash `paths` (recursing into directories) and compare to `cache_file`.
///
/// Any difference (including a missing path) reports a change.
/// With `quick`, checking stops at the first change.
/// Whatever was checked is written back when something changed.
pub fn check_file_changes(cache_file: &Path, paths: &[PathBuf], quick: bool) -> Result<bool> {
    let mut cache: FileHashCache = load_json(cache_file)?;
    let mut changed = false;

    for path in paths {
        if changed && quick {
            break;
        }

        let path = absolute(path)?;
        let key = path.to_string_lossy().to_string();

        if !path.exists() {
            trace!(path = %key, "Static path is missing");
            cache.remove(&key);
            changed = true;
            continue;
        }

        let hash = if path.is_dir() {
            dir_hash(&path)?
        } else {
            md5_file_hex(&path)?
        };

        if cache.get(&key) != Some(&hash) {
            trace!(path = %key, "Static path changed");
            cache.insert(key, hash);
            changed = true;
        }
    }

    if changed {
        write_json_atomic(&cache, cache_file)?;
    }

    Ok(changed)
}

/// Digest of every file under `dir`: sorted relative names plus each file's md5.
fn dir_hash(dir: &Path) -> Result<String> {
    let mut digest = String::new();

    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry
            .map_err(|e| AutograderError::infra(format!("walk '{}': {}", dir.display(), e)))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        digest.push_str(&relative.to_string_lossy());
        digest.push('\0');
        digest.push_str(&md5_file_hex(entry.path())?);
        digest.push('\n');
    }

    Ok(md5_hex(digest.as_bytes()))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }

    let cwd = std::env::current_dir().map_err(|e| AutograderError::io(path, e))?;
    Ok(cwd.join(path))
}
