/// Loaded courses, their LMS adapters, and reload-from-source.

use crate::lms::{adapter_for, LmsAdapter};
use crate::tasks::TaskScheduler;
use autograder_common::keys::course_task_lock_key;
use autograder_common::model::COURSE_CONFIG_FILENAME;
use autograder_common::{Assignment, AutograderError, Course, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Clone)]
pub struct CourseEntry {
    pub course: Arc<Course>,
    pub lms: Option<Arc<dyn LmsAdapter>>,
}

#[derive(Default)]
pub struct CourseRegistry {
    courses: RwLock<BTreeMap<String, CourseEntry>>,
}

impl CourseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every immediate subdirectory of `root` that has a course config.
    /// A course that fails to load is logged and skipped.
    pub async fn load_root(&self, root: &Path) -> Result<usize> {
        let mut loaded = 0;
        let entries = fs::read_dir(root).map_err(|e| AutograderError::io(root, e))?;

        let mut dirs: Vec<_> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.join(COURSE_CONFIG_FILENAME).is_file())
            .collect();
        dirs.sort();

        for dir in dirs {
            match self.load_course(&dir).await {
                Ok(_) => loaded += 1,
                Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to load course"),
            }
        }

        Ok(loaded)
    }

    pub async fn load_course(&self, dir: &Path) -> Result<CourseEntry> {
        let entry = build_entry(dir)?;
        info!(
            course = %entry.course.id,
            assignments = entry.course.assignments.len(),
            "Loaded course"
        );
        self.courses
            .write()
            .await
            .insert(entry.course.id.clone(), entry.clone());
        Ok(entry)
    }

    pub async fn insert(&self, course: Course, lms: Option<Arc<dyn LmsAdapter>>) -> CourseEntry {
        let entry = CourseEntry {
            course: Arc::new(course),
            lms,
        };
        self.courses
            .write()
            .await
            .insert(entry.course.id.clone(), entry.clone());
        entry
    }

    pub async fn get(&self, course_id: &str) -> Option<CourseEntry> {
        self.courses.read().await.get(course_id).cloned()
    }

    pub async fn get_assignment(&self, course_id: &str, assignment_id: &str) -> Option<Arc<Assignment>> {
        let courses = self.courses.read().await;
        courses
            .get(course_id)
            .and_then(|entry| entry.course.assignment(assignment_id))
            .map(|a| Arc::new(a.clone()))
    }

    pub async fn course_ids(&self) -> Vec<String> {
        self.courses.read().await.keys().cloned().collect()
    }

    /// Re-read a course from disk and swap it in, with its tasks stopped
    /// for the duration and restarted afterwards.
    pub async fn update_from_source(&self, dir: &Path, scheduler: &TaskScheduler) -> Result<CourseEntry> {
        let entry = build_entry(dir)?;
        let course_id = entry.course.id.clone();

        // Stop before taking the course lock: a task run queued on that lock
        // keeps its loop alive until the run completes.
        scheduler.stop_course(&course_id).await;

        {
            let locks = Arc::clone(&scheduler.context().locks);
            let _guard = locks.lock_guard(&course_task_lock_key(&course_id)).await;
            self.courses
                .write()
                .await
                .insert(course_id.clone(), entry.clone());
        }

        scheduler
            .schedule_course(Arc::clone(&entry.course), entry.lms.clone())
            .await;

        info!(course = %course_id, "Updated course from source");
        Ok(entry)
    }
}

fn build_entry(dir: &Path) -> Result<CourseEntry> {
    let course = Course::load_dir(dir)?;
    let lms = course
        .lms
        .as_ref()
        .map(|binding| adapter_for(binding, dir))
        .transpose()?;
    Ok(CourseEntry {
        course: Arc::new(course),
        lms,
    })
}
