/// Assignment and course scoring, and the upload that follows.

pub mod late;

use crate::lms::LmsAdapter;
use crate::reconcile::{reconcile_assignment, UploadPlan};
use crate::store::SubmissionStore;
use autograder_common::types::{CourseRole, CourseUser, ScoringInfo};
use autograder_common::{Assignment, Course, Result, Timestamp};
use late::{apply_late_policy, LateContext};
use std::collections::BTreeMap;
use tracing::{info, warn};

pub use late::{compute_late_days, LateDaysInfo};

/// Assignment ID -> user email -> scoring record.
pub type CourseScores = BTreeMap<String, BTreeMap<String, ScoringInfo>>;

/// Latest submission per student, with the late policy applied.
/// Users missing from the roster are kept so the policy can reject them.
pub async fn score_assignment(
    store: &SubmissionStore,
    course: &Course,
    assignment: &Assignment,
    users: &BTreeMap<String, CourseUser>,
    lms: &dyn LmsAdapter,
    dry_run: bool,
) -> Result<BTreeMap<String, ScoringInfo>> {
    let mut infos = store.get_scoring_infos(assignment)?;
    infos.retain(|email, _| {
        users
            .get(email)
            .map(|u| u.role == CourseRole::Student)
            .unwrap_or(true)
    });

    let ctx = LateContext {
        users,
        lms,
        optimal_allocation: course.optimal_late_day_allocation,
        dry_run,
    };
    apply_late_policy(assignment, &mut infos, &ctx).await?;

    Ok(infos)
}

/// Score one assignment and push the result to the LMS.
pub async fn full_assignment_scoring_and_upload(
    store: &SubmissionStore,
    course: &Course,
    assignment: &Assignment,
    lms: &dyn LmsAdapter,
    dry_run: bool,
) -> Result<(BTreeMap<String, ScoringInfo>, UploadPlan)> {
    let users = store.get_users(&course.id)?;
    let mut infos = score_assignment(store, course, assignment, &users, lms, dry_run).await?;
    let plan = reconcile_assignment(lms, assignment, &users, &mut infos, dry_run, Timestamp::now()).await?;
    Ok((infos, plan))
}

/// Score and upload every assignment that is bound to the LMS.
pub async fn full_course_scoring_and_upload(
    store: &SubmissionStore,
    course: &Course,
    lms: &dyn LmsAdapter,
    dry_run: bool,
) -> Result<CourseScores> {
    let mut scores = CourseScores::new();

    for assignment in course.assignments.values() {
        if assignment.lms_id.is_empty() {
            warn!(
                course = %course.id,
                assignment = %assignment.id,
                "Assignment has no LMS ID, skipping scoring"
            );
            continue;
        }

        let (infos, plan) =
            full_assignment_scoring_and_upload(store, course, assignment, lms, dry_run).await?;
        info!(
            course = %course.id,
            assignment = %assignment.id,
            users = infos.len(),
            uploads = plan.scores.len(),
            dry_run,
            "Scored assignment"
        );
        scores.insert(assignment.id.clone(), infos);
    }

    Ok(scores)
}
