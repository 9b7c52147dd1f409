/// Lock-key and cache-key semantics - defines only naming, not runtime logic.
/// Keeps the engine, scheduler, and tools agreeing on which key guards what.
use std::path::{Path, PathBuf};

pub const KEY_SEPARATOR: &str = "::";

pub const CACHE_KEY_BUILD_SUCCESS: &str = "image-build-success";
pub const CACHE_KEY_IMAGE_INFO: &str = "image-info";

pub const CACHE_FILENAME: &str = "cache.json";
pub const FILE_CACHE_FILENAME: &str = "filecache.json";

pub const COURSES_DIRNAME: &str = "courses";
/// Default root for course source trees; never shared with store data.
pub const SOURCES_DIRNAME: &str = "sources";
pub const SUBMISSIONS_DIRNAME: &str = "submissions";
pub const CACHE_DIRNAME: &str = "cache";
pub const BACKUP_DIRNAME: &str = "backup";
pub const USERS_FILENAME: &str = "users.json";

/// Key held for the duration of one grading run.
pub fn grading_lock_key(course_id: &str, assignment_id: &str, user: &str) -> String {
    [course_id, assignment_id, user].join(KEY_SEPARATOR)
}

/// Key held while a course's periodic task runs.
pub fn course_task_lock_key(course_id: &str) -> String {
    format!("course{}{}", KEY_SEPARATOR, course_id)
}

pub fn course_dir(base_dir: &Path, course_id: &str) -> PathBuf {
    base_dir.join(COURSES_DIRNAME).join(course_id)
}

pub fn assignment_cache_dir(base_dir: &Path, course_id: &str, assignment_id: &str) -> PathBuf {
    course_dir(base_dir, course_id)
        .join(CACHE_DIRNAME)
        .join(assignment_id)
}

pub fn user_submissions_dir(
    base_dir: &Path,
    course_id: &str,
    assignment_id: &str,
    user: &str,
) -> PathBuf {
    course_dir(base_dir, course_id)
        .join(SUBMISSIONS_DIRNAME)
        .join(assignment_id)
        .join(user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grading_lock_key() {
        assert_eq!(
            grading_lock_key("cs101", "hw0", "alice@example.edu"),
            "cs101::hw0::alice@example.edu"
        );
    }

    #[test]
    fn test_course_task_key_distinct_from_grading() {
        let task = course_task_lock_key("cs101");
        assert!(task.starts_with("course::"));
        assert_ne!(task, grading_lock_key("cs101", "", ""));
    }

    #[test]
    fn test_user_submissions_dir_layout() {
        let dir = user_submissions_dir(Path::new("/data"), "cs101", "hw0", "a@b.c");
        assert_eq!(
            dir,
            PathBuf::from("/data/courses/cs101/submissions/hw0/a@b.c")
        );
    }

    #[test]
    fn test_cache_dir_deterministic() {
        let a = assignment_cache_dir(Path::new("/data"), "cs101", "hw0");
        let b = assignment_cache_dir(Path::new("/data"), "cs101", "hw0");
        assert_eq!(a, b);
        assert!(a.ends_with("cache/hw0"));
    }
}
