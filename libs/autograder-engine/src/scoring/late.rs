/// Late-policy transforms applied to raw scores before upload.

use crate::lms::{LmsAdapter, SubmissionComment, SubmissionScore};
use crate::reconcile::LOCK_COMMENT;
use autograder_common::timestamp::MSECS_PER_DAY;
use autograder_common::types::{CourseUser, ScoringInfo, AUTOGRADER_COMMENT_IDENTITY_KEY};
use autograder_common::{Assignment, AutograderError, LatePolicy, LatePolicyType, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const LATE_DAYS_STRUCT_VERSION: &str = "1.0.0";

/// A student's late-day bank, stored as a comment on the late-days LMS assignment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LateDaysInfo {
    pub available_days: i64,
    #[serde(default)]
    pub upload_time: Timestamp,
    #[serde(default)]
    pub allocated_days: BTreeMap<String, i64>,
    /// Points per late day, per assignment.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub allocation_values: BTreeMap<String, f64>,
    #[serde(rename = "days-late", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub days_late_per_assignment: BTreeMap<String, i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub submission_times: BTreeMap<String, Timestamp>,
    #[serde(rename = "__autograder__version__")]
    pub autograder_struct_version: String,

    #[serde(skip)]
    pub lms_comment_id: String,
    #[serde(skip)]
    pub lms_comment_author_id: String,
}

/// Inputs shared by every late-policy variant.
pub struct LateContext<'a> {
    pub users: &'a BTreeMap<String, CourseUser>,
    pub lms: &'a dyn LmsAdapter,
    /// Spend late days where they save the most points instead of by submission time.
    pub optimal_allocation: bool,
    pub dry_run: bool,
}

/// Adjust `scores` (keyed by email) in place according to the assignment's policy.
pub async fn apply_late_policy(
    assignment: &Assignment,
    scores: &mut BTreeMap<String, ScoringInfo>,
    ctx: &LateContext<'_>,
) -> Result<()> {
    let policy = &assignment.late_policy;

    for score in scores.values_mut() {
        score.score = score.raw_score;
    }

    if policy.kind == LatePolicyType::Empty {
        return Ok(());
    }

    if assignment.lms_id.is_empty() {
        return Err(AutograderError::validation(format!(
            "assignment '{}' has a late policy but no LMS ID",
            assignment.full_id()
        )));
    }

    let lms_assignment = ctx.lms.fetch_assignment(&assignment.lms_id).await?;
    let due_date = lms_assignment.due_date.ok_or_else(|| {
        AutograderError::Lms(format!(
            "LMS assignment '{}' does not have a due date",
            assignment.lms_id
        ))
    })?;

    apply_baseline_policy(assignment, policy, ctx.users, scores, due_date);

    match policy.kind {
        LatePolicyType::Empty | LatePolicyType::Baseline => Ok(()),
        LatePolicyType::ConstantPenalty => {
            apply_constant_policy(scores, policy.penalty);
            Ok(())
        }
        LatePolicyType::PercentagePenalty => {
            apply_constant_policy(scores, lms_assignment.max_points * policy.penalty);
            Ok(())
        }
        LatePolicyType::LateDays => {
            let penalty = lms_assignment.max_points * policy.penalty;
            apply_late_days_policy(assignment, policy, scores, penalty, ctx).await
        }
    }
}

/// Whole days past `due + grace`, rounded up. On-time is zero.
pub fn compute_late_days(due_date: Timestamp, submission_time: Timestamp, grace_minutes: i64) -> i64 {
    let adjusted_due = due_date.plus_millis(grace_minutes * 60 * 1000);
    if adjusted_due >= submission_time {
        return 0;
    }

    let delta = submission_time.millis() - adjusted_due.millis();
    (delta + MSECS_PER_DAY - 1) / MSECS_PER_DAY
}

fn apply_baseline_policy(
    assignment: &Assignment,
    policy: &LatePolicy,
    users: &BTreeMap<String, CourseUser>,
    scores: &mut BTreeMap<String, ScoringInfo>,
    due_date: Timestamp,
) {
    for (email, score) in scores.iter_mut() {
        score.num_days_late = compute_late_days(due_date, score.submission_time, policy.grace_minutes);

        if !users.contains_key(email) {
            warn!(
                course = %assignment.course_id,
                assignment = %assignment.id,
                user = %email,
                "Cannot find user, rejecting submission"
            );
            score.reject = true;
            continue;
        }

        if policy.reject_after_days > 0 && score.num_days_late > policy.reject_after_days {
            score.reject = true;
        }
    }
}

fn apply_constant_policy(scores: &mut BTreeMap<String, ScoringInfo>, penalty: f64) {
    for score in scores.values_mut() {
        if score.num_days_late <= 0 {
            continue;
        }
        score.score = (score.raw_score - penalty * score.num_days_late as f64).max(0.0);
    }
}

async fn apply_late_days_policy(
    assignment: &Assignment,
    policy: &LatePolicy,
    scores: &mut BTreeMap<String, ScoringInfo>,
    penalty: f64,
    ctx: &LateContext<'_>,
) -> Result<()> {
    if policy.late_days_lms_id.is_empty() {
        return Err(AutograderError::validation(format!(
            "cannot apply late days for '{}': late days LMS ID is empty",
            assignment.full_id()
        )));
    }

    let mut banks = fetch_late_days(policy, ctx.lms).await?;
    let mut to_update: BTreeMap<String, LateDaysInfo> = BTreeMap::new();

    for (email, info) in scores.iter_mut() {
        if info.reject {
            continue;
        }

        let lms_id = ctx
            .users
            .get(email)
            .map(|u| u.lms_id.as_str())
            .unwrap_or_default();
        if lms_id.is_empty() {
            warn!(assignment = %assignment.full_id(), user = %email, "User has no LMS ID, rejecting submission");
            info.reject = true;
            continue;
        }

        let Some(bank) = banks.get_mut(lms_id) else {
            warn!(
                assignment = %assignment.full_id(),
                user = %email,
                lms_id = %lms_id,
                "Cannot find user late days, rejecting submission"
            );
            info.reject = true;
            continue;
        };

        let original = bank.allocated_days.clone();

        // Reclaim whatever this assignment held before reallocating.
        let mut available = bank.available_days;
        let previously_allocated = bank.allocated_days.remove(&assignment.id);
        if let Some(days) = previously_allocated {
            available += days;
        }

        if info.num_days_late <= 0 && previously_allocated.is_none() {
            continue;
        }

        let used = compute_late_day_allocation(
            bank,
            &assignment.id,
            info.num_days_late,
            penalty,
            info.submission_time,
            policy.max_late_days,
            available,
            ctx.optimal_allocation,
        );

        info.late_day_usage = used;
        let remaining = (info.num_days_late - used).max(0);
        info.score = (info.raw_score - penalty * remaining as f64).max(0.0);

        bank.allocated_days.insert(assignment.id.clone(), used);

        if bank.allocated_days != original {
            bank.upload_time = Timestamp::now();
            bank.allocation_values.insert(assignment.id.clone(), penalty);
            bank.days_late_per_assignment
                .insert(assignment.id.clone(), info.num_days_late);
            bank.submission_times
                .insert(assignment.id.clone(), info.submission_time);
            to_update.insert(lms_id.to_string(), bank.clone());
        }
    }

    update_late_days(policy, ctx, &to_update).await
}

/// Load every student's bank, keyed by LMS user ID.
async fn fetch_late_days(
    policy: &LatePolicy,
    lms: &dyn LmsAdapter,
) -> Result<BTreeMap<String, LateDaysInfo>> {
    let scores = lms.fetch_assignment_scores(&policy.late_days_lms_id).await?;
    let mut banks = BTreeMap::new();

    for score in scores {
        let mut info: Option<LateDaysInfo> = None;

        for comment in &score.comments {
            let text = comment.text.to_lowercase();
            if text.contains(LOCK_COMMENT) {
                return Err(AutograderError::Lms(format!(
                    "late days assignment '{}' for user '{}' has a lock comment, resolve it to allow grading",
                    policy.late_days_lms_id, score.user_id
                )));
            }

            if text.contains(AUTOGRADER_COMMENT_IDENTITY_KEY) {
                let mut parsed: LateDaysInfo = serde_json::from_str(&comment.text)?;
                if parsed.autograder_struct_version != LATE_DAYS_STRUCT_VERSION {
                    return Err(AutograderError::Lms(format!(
                        "late days comment version mismatch: expected '{}', found '{}'",
                        LATE_DAYS_STRUCT_VERSION, parsed.autograder_struct_version
                    )));
                }
                parsed.lms_comment_id = comment.id.clone();
                parsed.lms_comment_author_id = comment.author.clone();
                info = Some(parsed);
            }
        }

        let posted = score.score.round() as i64;
        let mut info = match info {
            Some(info) => {
                if info.available_days != posted {
                    warn!(
                        user_lms_id = %score.user_id,
                        posted_days = posted,
                        comment_days = info.available_days,
                        "Posted late days disagree with the autograder comment"
                    );
                }
                info
            }
            None => LateDaysInfo::default(),
        };

        info.available_days = posted;
        info.upload_time = Timestamp::now();
        info.autograder_struct_version = LATE_DAYS_STRUCT_VERSION.to_string();
        banks.insert(score.user_id, info);
    }

    Ok(banks)
}

async fn update_late_days(
    policy: &LatePolicy,
    ctx: &LateContext<'_>,
    to_update: &BTreeMap<String, LateDaysInfo>,
) -> Result<()> {
    let mut grades = Vec::with_capacity(to_update.len());
    let mut comments = Vec::new();

    for (user_id, bank) in to_update {
        let text = serde_json::to_string(bank)?;
        let mut new_comments = Vec::new();

        if bank.lms_comment_id.is_empty() {
            new_comments.push(SubmissionComment {
                text,
                ..Default::default()
            });
        } else {
            comments.push(SubmissionComment {
                id: bank.lms_comment_id.clone(),
                author: bank.lms_comment_author_id.clone(),
                text,
            });
        }

        grades.push(SubmissionScore {
            user_id: user_id.clone(),
            score: bank.available_days as f64,
            time: bank.upload_time,
            comments: new_comments,
        });
    }

    if ctx.dry_run {
        debug!(grades = ?grades, comments = ?comments, "Dry run: skipping late days upload");
        return Ok(());
    }

    if !grades.is_empty() {
        ctx.lms
            .update_assignment_scores(&policy.late_days_lms_id, &grades)
            .await?;
    }
    if !comments.is_empty() {
        ctx.lms.update_comments(&policy.late_days_lms_id, &comments).await?;
    }

    Ok(())
}

struct Candidate {
    assignment_id: String,
    points_per_day: f64,
    submission_time: Timestamp,
    max_days: i64,
}

/// Greedy late-day allocation across every assignment in the bank.
/// Returns the days granted to `current_id` and rewrites the others in `bank`.
#[allow(clippy::too_many_arguments)]
fn compute_late_day_allocation(
    bank: &mut LateDaysInfo,
    current_id: &str,
    current_days_late: i64,
    current_penalty: f64,
    current_time: Timestamp,
    max_per_assignment: i64,
    mut total_available: i64,
    optimal: bool,
) -> i64 {
    let mut candidates = vec![Candidate {
        assignment_id: current_id.to_string(),
        points_per_day: current_penalty,
        submission_time: current_time,
        max_days: max_per_assignment.min(current_days_late),
    }];

    for (id, days_late) in &bank.days_late_per_assignment {
        if id == current_id || *days_late <= 0 {
            continue;
        }
        let (Some(value), Some(time)) = (bank.allocation_values.get(id), bank.submission_times.get(id)) else {
            continue;
        };

        if let Some(days) = bank.allocated_days.get(id) {
            total_available += days;
        }

        candidates.push(Candidate {
            assignment_id: id.clone(),
            points_per_day: *value,
            submission_time: *time,
            max_days: max_per_assignment.min(*days_late),
        });
    }

    if optimal {
        candidates.sort_by(|a, b| {
            b.points_per_day
                .partial_cmp(&a.points_per_day)
                .unwrap_or(Ordering::Equal)
        });
    } else {
        candidates.sort_by_key(|c| c.submission_time);
    }

    let others: Vec<String> = candidates
        .iter()
        .map(|c| c.assignment_id.clone())
        .filter(|id| id != current_id)
        .collect();

    let mut remaining = total_available;
    let mut granted: BTreeMap<String, i64> = BTreeMap::new();
    for candidate in candidates {
        if remaining <= 0 {
            break;
        }
        let days = remaining.min(candidate.max_days);
        if days > 0 {
            granted.insert(candidate.assignment_id, days);
            remaining -= days;
        }
    }

    for id in others {
        let days = granted.get(&id).copied().unwrap_or(0);
        bank.allocated_days.insert(id, days);
    }

    bank.available_days = remaining;
    granted.get(current_id).copied().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lms::{LmsAssignment, MemoryLms, MemoryLmsState};
    use autograder_common::types::CourseRole;
    use autograder_common::Course;
    use std::path::Path;

    const DUE: i64 = 100 * MSECS_PER_DAY;

    fn assignment(policy: &str) -> Assignment {
        let course = Course::new("cs101").unwrap();
        let json = format!(
            r#"{{"id": "hw0", "image": "alpine", "lms-id": "001", "late-policy": {}}}"#,
            policy
        );
        Assignment::from_json(&json, &course, Path::new(".")).unwrap()
    }

    fn lms(extra_scores: BTreeMap<String, Vec<SubmissionScore>>) -> MemoryLms {
        MemoryLms::new(MemoryLmsState {
            users: Vec::new(),
            assignments: vec![LmsAssignment {
                id: "001".to_string(),
                name: "HW0".to_string(),
                due_date: Some(Timestamp::from_millis(DUE)),
                max_points: 10.0,
            }],
            scores: extra_scores,
        })
    }

    fn users() -> BTreeMap<String, CourseUser> {
        let mut alice = CourseUser::new("alice@example.edu", CourseRole::Student);
        alice.lms_id = "lms-alice".to_string();
        let mut bob = CourseUser::new("bob@example.edu", CourseRole::Student);
        bob.lms_id = "lms-bob".to_string();
        [alice, bob].into_iter().map(|u| (u.email.clone(), u)).collect()
    }

    fn info(submitted: i64, raw: f64) -> ScoringInfo {
        ScoringInfo {
            id: format!("cs101::hw0::x::{}", submitted),
            submission_time: Timestamp::from_millis(submitted),
            raw_score: raw,
            ..Default::default()
        }
    }

    #[test]
    fn test_compute_late_days() {
        let due = Timestamp::from_millis(DUE);
        assert_eq!(compute_late_days(due, due, 0), 0);
        assert_eq!(compute_late_days(due, due.plus_millis(1), 0), 1);
        assert_eq!(compute_late_days(due, due.plus_millis(MSECS_PER_DAY), 0), 1);
        assert_eq!(compute_late_days(due, due.plus_millis(MSECS_PER_DAY + 1), 0), 2);
        assert_eq!(compute_late_days(due, due.plus_millis(10 * 60 * 1000), 15), 0);
    }

    #[tokio::test]
    async fn test_empty_policy_copies_raw_score() {
        let a = assignment("{}");
        let lms = lms(BTreeMap::new());
        let users = users();
        let ctx = LateContext {
            users: &users,
            lms: &lms,
            optimal_allocation: false,
            dry_run: true,
        };

        let mut scores = BTreeMap::from([("alice@example.edu".to_string(), info(DUE * 2, 7.0))]);
        apply_late_policy(&a, &mut scores, &ctx).await.unwrap();
        assert_eq!(scores["alice@example.edu"].score, 7.0);
        assert!(!scores["alice@example.edu"].reject);
    }

    #[tokio::test]
    async fn test_constant_and_reject_after() {
        let a = assignment(r#"{"type": "constant-penalty", "penalty": 2, "reject-after-days": 3}"#);
        let lms = lms(BTreeMap::new());
        let users = users();
        let ctx = LateContext {
            users: &users,
            lms: &lms,
            optimal_allocation: false,
            dry_run: true,
        };

        let mut scores = BTreeMap::from([
            ("alice@example.edu".to_string(), info(DUE + MSECS_PER_DAY, 7.0)),
            ("bob@example.edu".to_string(), info(DUE + 5 * MSECS_PER_DAY, 7.0)),
            ("ghost@example.edu".to_string(), info(DUE - 1, 7.0)),
        ]);
        apply_late_policy(&a, &mut scores, &ctx).await.unwrap();

        assert_eq!(scores["alice@example.edu"].num_days_late, 1);
        assert_eq!(scores["alice@example.edu"].score, 5.0);
        assert!(scores["bob@example.edu"].reject);
        assert!(scores["ghost@example.edu"].reject);
    }

    #[tokio::test]
    async fn test_percentage_penalty_floors_at_zero() {
        let a = assignment(r#"{"type": "percentage-penalty", "penalty": 0.5}"#);
        let lms = lms(BTreeMap::new());
        let users = users();
        let ctx = LateContext {
            users: &users,
            lms: &lms,
            optimal_allocation: false,
            dry_run: true,
        };

        let mut scores = BTreeMap::from([
            ("alice@example.edu".to_string(), info(DUE + MSECS_PER_DAY, 8.0)),
            ("bob@example.edu".to_string(), info(DUE + 3 * MSECS_PER_DAY, 8.0)),
        ]);
        apply_late_policy(&a, &mut scores, &ctx).await.unwrap();
        assert_eq!(scores["alice@example.edu"].score, 3.0);
        assert_eq!(scores["bob@example.edu"].score, 0.0);
    }

    #[tokio::test]
    async fn test_late_days_spend_bank_and_post_comment() {
        let a = assignment(
            r#"{"type": "late-days", "penalty": 0.1, "max-late-days": 2, "late-days-lms-id": "late"}"#,
        );
        let bank_scores = BTreeMap::from([(
            "late".to_string(),
            vec![SubmissionScore {
                user_id: "lms-alice".to_string(),
                score: 3.0,
                time: Timestamp::zero(),
                comments: Vec::new(),
            }],
        )]);
        let lms = lms(bank_scores);
        let users = users();
        let ctx = LateContext {
            users: &users,
            lms: &lms,
            optimal_allocation: false,
            dry_run: false,
        };

        let mut scores = BTreeMap::from([
            ("alice@example.edu".to_string(), info(DUE + 3 * MSECS_PER_DAY, 10.0)),
            ("bob@example.edu".to_string(), info(DUE + MSECS_PER_DAY, 10.0)),
        ]);
        apply_late_policy(&a, &mut scores, &ctx).await.unwrap();

        // Three days late, two covered by the bank, one penalized at 1 point.
        let alice = &scores["alice@example.edu"];
        assert_eq!(alice.late_day_usage, 2);
        assert_eq!(alice.score, 9.0);

        // No bank for bob.
        assert!(scores["bob@example.edu"].reject);

        let posted = lms.fetch_assignment_scores("late").await.unwrap();
        assert_eq!(posted[0].score, 1.0);
        let bank: LateDaysInfo = serde_json::from_str(&posted[0].comments[0].text).unwrap();
        assert_eq!(bank.allocated_days["hw0"], 2);
        assert_eq!(bank.available_days, 1);
    }

    #[tokio::test]
    async fn test_late_days_lock_comment_fails() {
        let a = assignment(
            r#"{"type": "late-days", "penalty": 0.1, "max-late-days": 2, "late-days-lms-id": "late"}"#,
        );
        let bank_scores = BTreeMap::from([(
            "late".to_string(),
            vec![SubmissionScore {
                user_id: "lms-alice".to_string(),
                score: 3.0,
                time: Timestamp::zero(),
                comments: vec![SubmissionComment {
                    id: "c1".to_string(),
                    author: "ta".to_string(),
                    text: "__LOCK__".to_string(),
                }],
            }],
        )]);
        let lms = lms(bank_scores);
        let users = users();
        let ctx = LateContext {
            users: &users,
            lms: &lms,
            optimal_allocation: false,
            dry_run: true,
        };

        let mut scores = BTreeMap::from([("alice@example.edu".to_string(), info(DUE + 1, 10.0))]);
        assert!(apply_late_policy(&a, &mut scores, &ctx).await.is_err());
    }

    #[test]
    fn test_optimal_allocation_prefers_valuable_assignment() {
        let mut bank = LateDaysInfo {
            available_days: 0,
            allocated_days: BTreeMap::from([("hw1".to_string(), 2)]),
            allocation_values: BTreeMap::from([("hw1".to_string(), 0.5)]),
            days_late_per_assignment: BTreeMap::from([("hw1".to_string(), 2)]),
            submission_times: BTreeMap::from([("hw1".to_string(), Timestamp::from_millis(1))]),
            autograder_struct_version: LATE_DAYS_STRUCT_VERSION.to_string(),
            ..Default::default()
        };

        let used = compute_late_day_allocation(
            &mut bank,
            "hw2",
            2,
            5.0,
            Timestamp::from_millis(2),
            2,
            0,
            true,
        );
        assert_eq!(used, 2);
        assert_eq!(bank.allocated_days["hw1"], 0);
        assert_eq!(bank.available_days, 0);

        let mut standard = LateDaysInfo {
            allocated_days: BTreeMap::from([("hw1".to_string(), 2)]),
            allocation_values: BTreeMap::from([("hw1".to_string(), 0.5)]),
            days_late_per_assignment: BTreeMap::from([("hw1".to_string(), 2)]),
            submission_times: BTreeMap::from([("hw1".to_string(), Timestamp::from_millis(1))]),
            ..Default::default()
        };
        let used = compute_late_day_allocation(
            &mut standard,
            "hw2",
            2,
            5.0,
            Timestamp::from_millis(2),
            2,
            0,
            false,
        );
        assert_eq!(used, 0);
        assert_eq!(standard.allocated_days["hw1"], 2);
    }
}
