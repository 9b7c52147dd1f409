/// Per-course periodic tasks.
///
/// Each enabled task gets its own timer loop. A run holds the course's task
/// lock, so two tasks of one course never overlap with each other or with a
/// course reload.

use crate::files::{ensure_dir, gzip_dir_to_bytes};
use crate::lms::LmsAdapter;
use crate::lockmanager::LockManager;
use crate::scoring::full_course_scoring_and_upload;
use crate::store::SubmissionStore;
use autograder_common::keys::{course_dir, course_task_lock_key, BACKUP_DIRNAME};
use autograder_common::model::TaskSpec;
use autograder_common::types::{CourseRole, CourseUser};
use autograder_common::{AutograderError, Course, Result, Timestamp};
use dashmap::DashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Backup,
    LmsSync,
    ScoringUpload,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TaskKind::Backup => "backup",
            TaskKind::LmsSync => "lms-sync",
            TaskKind::ScoringUpload => "scoring-upload",
        };
        write!(f, "{}", text)
    }
}

/// Shared state every task run needs.
pub struct TaskContext {
    pub base_dir: PathBuf,
    pub store: Arc<SubmissionStore>,
    pub locks: Arc<LockManager>,
    pub min_rest: Duration,
}

struct CourseTaskSet {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct TaskScheduler {
    ctx: Arc<TaskContext>,
    courses: DashMap<String, CourseTaskSet>,
}

impl TaskScheduler {
    pub fn new(ctx: TaskContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            courses: DashMap::new(),
        }
    }

    pub fn context(&self) -> &Arc<TaskContext> {
        &self.ctx
    }

    /// Start the course's enabled tasks. Any tasks already running for it are
    /// cancelled first.
    pub async fn schedule_course(&self, course: Arc<Course>, lms: Option<Arc<dyn LmsAdapter>>) {
        self.stop_course(&course.id).await;

        let token = CancellationToken::new();
        let mut handles = Vec::new();

        let specs = [
            (TaskKind::Backup, course.tasks.backup),
            (TaskKind::LmsSync, course.tasks.lms_sync),
            (TaskKind::ScoringUpload, course.tasks.scoring_upload),
        ];

        for (kind, spec) in specs {
            let Some(period) = spec.and_then(task_period) else {
                continue;
            };

            if matches!(kind, TaskKind::LmsSync | TaskKind::ScoringUpload) && lms.is_none() {
                warn!(course = %course.id, task = %kind, "Course has no LMS, not scheduling task");
                continue;
            }

            info!(course = %course.id, task = %kind, period_ms = period.as_millis() as u64, "Scheduling task");
            handles.push(tokio::spawn(task_loop(
                kind,
                period,
                Arc::clone(&self.ctx),
                Arc::clone(&course),
                lms.clone(),
                token.child_token(),
            )));
        }

        self.courses
            .insert(course.id.clone(), CourseTaskSet { token, handles });
    }

    /// Cancel a course's tasks and wait for their loops to exit.
    /// A run already in progress finishes first.
    pub async fn stop_course(&self, course_id: &str) {
        let Some((_, set)) = self.courses.remove(course_id) else {
            return;
        };

        set.token.cancel();
        for handle in set.handles {
            if let Err(e) = handle.await {
                warn!(course = %course_id, error = %e, "Task loop ended abnormally");
            }
        }
        debug!(course = %course_id, "Stopped course tasks");
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.courses.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.stop_course(&id).await;
        }
    }

    pub fn scheduled_courses(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.courses.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Run one task immediately, under the course lock.
    pub async fn run_now(
        &self,
        kind: TaskKind,
        course: &Course,
        lms: Option<&dyn LmsAdapter>,
    ) -> Result<()> {
        run_task(kind, &self.ctx, course, lms).await
    }
}

fn task_period(spec: TaskSpec) -> Option<Duration> {
    if spec.disabled {
        return None;
    }
    let millis = spec.every.total_millis();
    (millis > 0).then(|| Duration::from_millis(millis as u64))
}

async fn task_loop(
    kind: TaskKind,
    period: Duration,
    ctx: Arc<TaskContext>,
    course: Arc<Course>,
    lms: Option<Arc<dyn LmsAdapter>>,
    token: CancellationToken,
) {
    let mut last_run: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }

        if let Some(last) = last_run {
            if last.elapsed() < ctx.min_rest {
                debug!(course = %course.id, task = %kind, "Task ran too recently, skipping");
                continue;
            }
        }
        last_run = Some(Instant::now());

        // Run on its own task so a panic is contained to this run.
        let run_ctx = Arc::clone(&ctx);
        let run_course = Arc::clone(&course);
        let run_lms = lms.clone();
        let handle = tokio::spawn(async move {
            run_task(kind, &run_ctx, &run_course, run_lms.as_deref()).await
        });

        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(course = %course.id, task = %kind, error = %e, "Task failed"),
            Err(e) if e.is_panic() => {
                error!(course = %course.id, task = %kind, "Task panicked")
            }
            Err(e) => warn!(course = %course.id, task = %kind, error = %e, "Task was cancelled"),
        }
    }
}

async fn run_task(
    kind: TaskKind,
    ctx: &TaskContext,
    course: &Course,
    lms: Option<&dyn LmsAdapter>,
) -> Result<()> {
    let _guard = ctx.locks.lock_guard(&course_task_lock_key(&course.id)).await;
    let started = Instant::now();

    match kind {
        TaskKind::Backup => {
            let path = backup_course(ctx, course)?;
            info!(course = %course.id, path = %path.display(), "Backed up course");
        }
        TaskKind::LmsSync => {
            let lms = require_lms(course, lms)?;
            let summary = sync_lms_users(&ctx.store, &course.id, lms).await?;
            info!(
                course = %course.id,
                added = summary.added,
                updated = summary.updated,
                "Synced users from LMS"
            );
        }
        TaskKind::ScoringUpload => {
            let lms = require_lms(course, lms)?;
            full_course_scoring_and_upload(&ctx.store, course, lms, false).await?;
        }
    }

    debug!(
        course = %course.id,
        task = %kind,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Task finished"
    );
    Ok(())
}

fn require_lms<'a>(course: &Course, lms: Option<&'a dyn LmsAdapter>) -> Result<&'a dyn LmsAdapter> {
    lms.ok_or_else(|| AutograderError::validation(format!("course '{}' has no LMS", course.id)))
}

/// Write `<base>/backup/<course>-<millis>.tar.gz` from the course's data dir.
pub fn backup_course(ctx: &TaskContext, course: &Course) -> Result<PathBuf> {
    let source = course_dir(&ctx.base_dir, &course.id);
    ensure_dir(&source)?;

    let dest_dir = ctx.base_dir.join(BACKUP_DIRNAME);
    ensure_dir(&dest_dir)?;

    let bytes = gzip_dir_to_bytes(&source)?;
    let path = dest_dir.join(format!("{}-{}.tar.gz", course.id, Timestamp::now().millis()));
    std::fs::write(&path, bytes).map_err(|e| AutograderError::io(&path, e))?;
    Ok(path)
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub added: usize,
    pub updated: usize,
}

/// Pull the LMS roster into the course's users. Local roles win for known users.
pub async fn sync_lms_users(
    store: &SubmissionStore,
    course_id: &str,
    lms: &dyn LmsAdapter,
) -> Result<SyncSummary> {
    let lms_users = lms.fetch_users().await?;
    let mut users = store.get_users(course_id)?;
    let mut summary = SyncSummary::default();

    for lms_user in lms_users {
        // Roster keys match the normalized users that submissions are stored under.
        let email = lms_user.email.trim().to_lowercase();
        match users.get_mut(&email) {
            Some(user) => {
                let mut changed = false;
                if user.lms_id != lms_user.id {
                    user.lms_id = lms_user.id.clone();
                    changed = true;
                }
                if user.name.is_empty() && !lms_user.name.is_empty() {
                    user.name = lms_user.name.clone();
                    changed = true;
                }
                if changed {
                    summary.updated += 1;
                }
            }
            None => {
                let role = if lms_user.role == CourseRole::Other {
                    CourseRole::Student
                } else {
                    lms_user.role
                };
                let mut user = CourseUser::new(&email, role);
                user.name = lms_user.name.clone();
                user.lms_id = lms_user.id.clone();
                users.insert(email, user);
                summary.added += 1;
            }
        }
    }

    if summary != SyncSummary::default() {
        store.save_users(course_id, &users)?;
    }
    Ok(summary)
}
