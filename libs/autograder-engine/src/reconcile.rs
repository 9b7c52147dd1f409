/// Reconcile locally computed scores with what the LMS already holds.
///
/// LMS-side state is keyed by LMS user ID; local state by email.

use crate::lms::{LmsAdapter, SubmissionComment, SubmissionScore};
use autograder_common::types::{
    CourseUser, ScoringInfo, AUTOGRADER_COMMENT_IDENTITY_KEY, SCORING_INFO_STRUCT_VERSION,
};
use autograder_common::{Assignment, AutograderError, Result, Timestamp};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, trace, warn};

/// Any comment containing this (case-insensitive) freezes the user's grade.
pub const LOCK_COMMENT: &str = "__lock__";

#[derive(Debug, Default)]
pub struct ParsedComments {
    pub locks: BTreeSet<String>,
    pub existing: BTreeMap<String, ScoringInfo>,
}

pub fn parse_comments(scores: &[SubmissionScore]) -> Result<ParsedComments> {
    let mut parsed = ParsedComments::default();

    for score in scores {
        for comment in &score.comments {
            let text = comment.text.to_lowercase();

            if text.contains(LOCK_COMMENT) {
                parsed.locks.insert(score.user_id.clone());
            } else if text.contains(AUTOGRADER_COMMENT_IDENTITY_KEY) {
                let mut info: ScoringInfo = serde_json::from_str(&comment.text).map_err(|e| {
                    AutograderError::Lms(format!(
                        "could not parse LMS comment '{}' as a scoring info: {}",
                        comment.id, e
                    ))
                })?;

                if info.autograder_struct_version != SCORING_INFO_STRUCT_VERSION {
                    return Err(AutograderError::Lms(format!(
                        "scoring info version mismatch in comment '{}': expected '{}', found '{}'",
                        comment.id, SCORING_INFO_STRUCT_VERSION, info.autograder_struct_version
                    )));
                }

                info.lms_comment_id = comment.id.clone();
                info.lms_comment_author_id = comment.author.clone();

                if info.lock {
                    parsed.locks.insert(score.user_id.clone());
                }
                parsed.existing.insert(score.user_id.clone(), info);
            }
        }
    }

    Ok(parsed)
}

/// Everything one upload would send, in a stable order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct UploadPlan {
    pub assignment: String,
    pub lms_id: String,
    /// New grades, with new comments attached.
    pub scores: Vec<SubmissionScore>,
    /// Existing comments to edit in place.
    pub comments: Vec<SubmissionComment>,
}

impl UploadPlan {
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty() && self.comments.is_empty()
    }

    pub fn to_pretty_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Decide which of `infos` (keyed by email) need uploading.
/// Scheduled records get `upload_time = now`.
pub fn plan_upload(
    assignment: &Assignment,
    users: &BTreeMap<String, CourseUser>,
    infos: &mut BTreeMap<String, ScoringInfo>,
    parsed: &ParsedComments,
    now: Timestamp,
) -> Result<UploadPlan> {
    let mut plan = UploadPlan {
        assignment: assignment.full_id(),
        lms_id: assignment.lms_id.clone(),
        ..Default::default()
    };

    for (email, info) in infos.iter_mut() {
        let Some(user) = users.get(email) else {
            warn!(assignment = %assignment.full_id(), user = %email, "User does not exist, skipping grade upload");
            continue;
        };

        if info.reject {
            continue;
        }

        if user.lms_id.is_empty() {
            warn!(assignment = %assignment.full_id(), user = %email, "User has no LMS ID, skipping grade upload");
            continue;
        }

        if parsed.locks.contains(&user.lms_id) {
            trace!(assignment = %assignment.full_id(), user = %email, "Grade is locked in the LMS");
            continue;
        }

        let existing = parsed.existing.get(&user.lms_id);
        if let Some(existing) = existing {
            if existing.same_submission(info) {
                trace!(
                    assignment = %assignment.full_id(),
                    user = %email,
                    submission = %existing.id,
                    "Grade is up to date"
                );
                continue;
            }
        }

        info.upload_time = now;

        let mut new_comments = Vec::new();
        match existing {
            Some(existing) => {
                info.lms_comment_id = existing.lms_comment_id.clone();
                info.lms_comment_author_id = existing.lms_comment_author_id.clone();
                plan.comments.push(SubmissionComment {
                    id: info.lms_comment_id.clone(),
                    author: info.lms_comment_author_id.clone(),
                    text: serde_json::to_string(info)?,
                });
            }
            None => new_comments.push(SubmissionComment {
                text: serde_json::to_string(info)?,
                ..Default::default()
            }),
        }

        plan.scores.push(SubmissionScore {
            user_id: user.lms_id.clone(),
            score: info.score,
            time: info.submission_time,
            comments: new_comments,
        });
    }

    Ok(plan)
}

/// Fetch LMS state, plan, and either send the plan or log it.
pub async fn reconcile_assignment(
    lms: &dyn LmsAdapter,
    assignment: &Assignment,
    users: &BTreeMap<String, CourseUser>,
    infos: &mut BTreeMap<String, ScoringInfo>,
    dry_run: bool,
    now: Timestamp,
) -> Result<UploadPlan> {
    if assignment.lms_id.is_empty() {
        return Err(AutograderError::validation(format!(
            "assignment '{}' has no LMS ID",
            assignment.full_id()
        )));
    }

    let lms_scores = lms.fetch_assignment_scores(&assignment.lms_id).await?;
    let parsed = parse_comments(&lms_scores)?;
    let plan = plan_upload(assignment, users, infos, &parsed, now)?;

    if dry_run {
        info!(
            assignment = %assignment.full_id(),
            plan = %plan.to_pretty_json()?,
            "Dry run: skipping upload of final grades"
        );
        return Ok(plan);
    }

    if !plan.scores.is_empty() {
        lms.update_assignment_scores(&assignment.lms_id, &plan.scores).await?;
    }
    if !plan.comments.is_empty() {
        lms.update_comments(&assignment.lms_id, &plan.comments).await?;
    }

    info!(
        assignment = %assignment.full_id(),
        grades = plan.scores.len(),
        comments = plan.comments.len(),
        "Uploaded final grades"
    );

    Ok(plan)
}
