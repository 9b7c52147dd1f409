/// Submission throttling, checked before any grading work starts.

use autograder_common::policy::SubmissionLimitWindow;
use autograder_common::types::{CourseRole, SubmissionHistoryItem};
use autograder_common::{RejectReason, SubmissionLimit, Timestamp};

/// Apply `limit` to a user's history (ascending).
/// Max-attempts is checked before the window.
pub fn check_submission_limit(
    limit: Option<&SubmissionLimit>,
    history: &[SubmissionHistoryItem],
    now: Timestamp,
) -> Option<RejectReason> {
    let limit = limit?;

    if let Some(max) = limit.max {
        if max >= 0 && history.len() as i64 >= max {
            return Some(RejectReason::MaxAttempts { max });
        }
    }

    limit
        .window
        .as_ref()
        .and_then(|window| check_window(window, history, now))
}

fn check_window(
    window: &SubmissionLimitWindow,
    history: &[SubmissionHistoryItem],
    now: Timestamp,
) -> Option<RejectReason> {
    if history.len() < window.allowed_attempts {
        return None;
    }

    let window_start = now.plus_millis(-window.duration.total_millis());
    let in_window: Vec<Timestamp> = history
        .iter()
        .map(|item| item.grading_start_time)
        .filter(|start| *start > window_start)
        .collect();

    if in_window.len() < window.allowed_attempts {
        return None;
    }

    let earliest = in_window.iter().min().copied()?;
    Some(RejectReason::WindowMax {
        allowed: window.allowed_attempts,
        duration: window.duration,
        earliest,
    })
}

/// Staff are never throttled.
pub fn role_bypasses_limits(role: CourseRole) -> bool {
    role >= CourseRole::Grader
}
