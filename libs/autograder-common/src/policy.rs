use crate::error::{AutograderError, Result};
use crate::timestamp::Timestamp;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Span of time written either as `{"days": 1, "hours": 2}` or as a compact
/// string like `"1d2h"`, `"90m"`, `"30s"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct DurationSpec {
    #[serde(skip_serializing_if = "is_zero")]
    pub days: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub hours: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub minutes: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub seconds: i64,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Text(String),
    Object {
        #[serde(default)]
        days: i64,
        #[serde(default)]
        hours: i64,
        #[serde(default)]
        minutes: i64,
        #[serde(default)]
        seconds: i64,
    },
}

impl<'de> Deserialize<'de> for DurationSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let spec = match RawDuration::deserialize(deserializer)? {
            RawDuration::Text(text) => {
                DurationSpec::parse(&text).map_err(serde::de::Error::custom)?
            }
            RawDuration::Object {
                days,
                hours,
                minutes,
                seconds,
            } => DurationSpec {
                days,
                hours,
                minutes,
                seconds,
            },
        };

        spec.validate().map_err(serde::de::Error::custom)?;
        Ok(spec)
    }
}

impl DurationSpec {
    pub fn days(days: i64) -> Self {
        DurationSpec {
            days,
            ..Default::default()
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut spec = DurationSpec::default();
        let mut number = String::new();

        for ch in text.trim().chars() {
            if ch.is_ascii_digit() {
                number.push(ch);
                continue;
            }

            let value: i64 = number.parse().map_err(|_| {
                AutograderError::validation(format!("malformed duration '{}'", text))
            })?;
            number.clear();

            let slot = match ch.to_ascii_lowercase() {
                'd' => &mut spec.days,
                'h' => &mut spec.hours,
                'm' => &mut spec.minutes,
                's' => &mut spec.seconds,
                _ => {
                    return Err(AutograderError::validation(format!(
                        "unknown duration unit '{}' in '{}'",
                        ch, text
                    )))
                }
            };
            *slot = slot.checked_add(value).ok_or_else(|| {
                AutograderError::validation(format!("duration '{}' is too large", text))
            })?;
        }

        if !number.is_empty() || text.trim().is_empty() {
            return Err(AutograderError::validation(format!(
                "malformed duration '{}'",
                text
            )));
        }

        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        if self.days < 0 || self.hours < 0 || self.minutes < 0 || self.seconds < 0 {
            return Err(AutograderError::validation(format!(
                "duration components must not be negative, found '{}'",
                self
            )));
        }
        if self.checked_total_millis().is_none() {
            return Err(AutograderError::validation(format!(
                "duration '{}' is too large",
                self
            )));
        }
        Ok(())
    }

    pub fn checked_total_millis(&self) -> Option<i64> {
        self.days
            .checked_mul(24)?
            .checked_add(self.hours)?
            .checked_mul(60)?
            .checked_add(self.minutes)?
            .checked_mul(60)?
            .checked_add(self.seconds)?
            .checked_mul(1000)
    }

    /// Saturates at `i64::MAX` for a spec that skipped `validate`.
    pub fn total_millis(&self) -> i64 {
        self.checked_total_millis().unwrap_or(i64::MAX)
    }
}

impl fmt::Display for DurationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut wrote = false;
        for (value, unit) in [
            (self.days, 'd'),
            (self.hours, 'h'),
            (self.minutes, 'm'),
            (self.seconds, 's'),
        ] {
            if value != 0 {
                write!(f, "{}{}", value, unit)?;
                wrote = true;
            }
        }

        if !wrote {
            write!(f, "0s")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SubmissionLimitWindow {
    pub allowed_attempts: usize,
    pub duration: DurationSpec,
}

/// Per-assignment submission throttling.
/// A negative or absent `max` means unlimited attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SubmissionLimit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<SubmissionLimitWindow>,
}

impl SubmissionLimit {
    pub fn validate(&self) -> Result<()> {
        if let Some(window) = &self.window {
            if window.allowed_attempts == 0 {
                return Err(AutograderError::validation(
                    "submission window must allow at least one attempt",
                ));
            }
            window.duration.validate()?;
        }
        Ok(())
    }
}

/// Why a submission was refused before grading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RejectReason {
    MaxAttempts {
        max: i64,
    },
    WindowMax {
        allowed: usize,
        duration: DurationSpec,
        earliest: Timestamp,
    },
}

impl RejectReason {
    pub fn label(&self) -> &'static str {
        match self {
            RejectReason::MaxAttempts { .. } => "max-attempts",
            RejectReason::WindowMax { .. } => "window-max",
        }
    }

    /// Student-facing explanation, relative to `now`.
    pub fn message(&self, now: Timestamp) -> String {
        match self {
            RejectReason::MaxAttempts { max } => {
                format!("Reached the number of max attempts: {}.", max)
            }
            RejectReason::WindowMax {
                allowed,
                duration,
                earliest,
            } => {
                let next = earliest.plus_millis(duration.total_millis());
                let wait_secs = ((next.millis() - now.millis()).max(0) + 999) / 1000;
                format!(
                    "Reached the number of max attempts ({}) within submission window ({}). Next allowed submission time is {} (in {}s).",
                    allowed,
                    duration,
                    next.pretty(),
                    wait_secs
                )
            }
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message(Timestamp::now()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LatePolicyType {
    /// No late policy at all.
    #[default]
    #[serde(rename = "")]
    Empty,
    /// Rejection checks only.
    #[serde(rename = "baseline")]
    Baseline,
    #[serde(rename = "constant-penalty")]
    ConstantPenalty,
    #[serde(rename = "percentage-penalty")]
    PercentagePenalty,
    #[serde(rename = "late-days")]
    LateDays,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LatePolicy {
    #[serde(rename = "type", default, deserialize_with = "deserialize_policy_type")]
    pub kind: LatePolicyType,
    #[serde(default)]
    pub penalty: f64,
    #[serde(default)]
    pub reject_after_days: i64,
    #[serde(rename = "grace-mins", default)]
    pub grace_minutes: i64,
    #[serde(default)]
    pub max_late_days: i64,
    #[serde(rename = "late-days-lms-id", default, skip_serializing_if = "String::is_empty")]
    pub late_days_lms_id: String,
    #[serde(rename = "late-days-lms-name", default, skip_serializing_if = "String::is_empty")]
    pub late_days_lms_name: String,
}

fn deserialize_policy_type<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<LatePolicyType, D::Error> {
    let text = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
    match text.trim().to_lowercase().as_str() {
        "" => Ok(LatePolicyType::Empty),
        "baseline" => Ok(LatePolicyType::Baseline),
        "constant-penalty" => Ok(LatePolicyType::ConstantPenalty),
        "percentage-penalty" => Ok(LatePolicyType::PercentagePenalty),
        "late-days" => Ok(LatePolicyType::LateDays),
        other => Err(serde::de::Error::custom(format!(
            "unknown late policy type '{}'",
            other
        ))),
    }
}

impl LatePolicy {
    pub fn validate(&self) -> Result<()> {
        if self.reject_after_days < 0 {
            return Err(AutograderError::validation(format!(
                "reject-after-days is negative ({}), use zero to disable",
                self.reject_after_days
            )));
        }

        if self.grace_minutes < 0 {
            return Err(AutograderError::validation(format!(
                "grace-mins is negative ({}), use zero to disable",
                self.grace_minutes
            )));
        }

        match self.kind {
            LatePolicyType::Empty | LatePolicyType::Baseline => {}
            LatePolicyType::ConstantPenalty => {
                if self.penalty <= 0.0 {
                    return Err(AutograderError::validation(format!(
                        "constant-penalty: penalty must be larger than zero, found {}",
                        self.penalty
                    )));
                }
            }
            LatePolicyType::PercentagePenalty => self.check_fractional_penalty("percentage-penalty")?,
            LatePolicyType::LateDays => {
                self.check_fractional_penalty("late-days")?;

                if self.max_late_days < 1 {
                    return Err(AutograderError::validation(format!(
                        "late-days: max late days must be at least 1, found {}",
                        self.max_late_days
                    )));
                }

                if self.reject_after_days > 0 && self.max_late_days > self.reject_after_days {
                    return Err(AutograderError::validation(format!(
                        "late-days: max late days must be in [1, {}], found {}",
                        self.reject_after_days, self.max_late_days
                    )));
                }

                if self.late_days_lms_id.is_empty() && self.late_days_lms_name.is_empty() {
                    return Err(AutograderError::validation(
                        "late-days: the late days LMS assignment needs an ID or a name",
                    ));
                }
            }
        }

        Ok(())
    }

    fn check_fractional_penalty(&self, name: &str) -> Result<()> {
        if self.penalty <= 0.0 || self.penalty > 1.0 {
            return Err(AutograderError::validation(format!(
                "{}: penalty must be in (0.0, 1.0], found {}",
                name, self.penalty
            )));
        }
        Ok(())
    }
}
