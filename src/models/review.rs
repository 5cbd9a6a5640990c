use mongodb::bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ApiError, ApiResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Approve,
    Reject,
    Revision,
    SiteVisit,
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecisionKind::Approve => "approve",
            DecisionKind::Reject => "reject",
            DecisionKind::Revision => "revision",
            DecisionKind::SiteVisit => "site_visit",
        };
        f.write_str(s)
    }
}

/// One reviewer verdict, immutable once appended to a report's history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub decision: DecisionKind,
    pub comment: String,
    pub made_by: ObjectId,
    pub made_at: DateTime,
    /// Only meaningful for `revision`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_changes: Option<Vec<String>>,
    /// Only meaningful for `site_visit`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_date: Option<DateTime>,
}

/// Decision submission payload; dates arrive as ISO 8601.
#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub decision: DecisionKind,
    #[serde(default)]
    pub comment: String,
    pub required_changes: Option<Vec<String>>,
    pub scheduled_date: Option<chrono::DateTime<chrono::Utc>>,
}

impl DecisionRequest {
    pub fn into_decision(self, made_by: ObjectId, made_at: DateTime) -> ReviewDecision {
        ReviewDecision {
            decision: self.decision,
            comment: self.comment,
            made_by,
            made_at,
            required_changes: self.required_changes,
            scheduled_date: self
                .scheduled_date
                .map(|date| DateTime::from_millis(date.timestamp_millis())),
        }
    }
}

/// What applying a decision does to the report beyond the status change.
#[derive(Clone, Debug, PartialEq)]
pub enum DecisionEffect {
    Approved { approved_at: DateTime },
    Rejected,
    /// The report goes back to the RM: assignment is released and the
    /// change list is kept on the report.
    RevisionRequested { required_changes: Vec<String> },
    /// A visit record gets created; the reviewer stays assigned.
    SiteVisitScheduled { scheduled_date: DateTime },
}

impl ReviewDecision {
    /// Shape validation, enforced before any status transition is attempted.
    pub fn validate(&self, now: DateTime) -> ApiResult<()> {
        match self.decision {
            DecisionKind::Approve => Ok(()),
            DecisionKind::Reject => {
                if self.comment.trim().is_empty() {
                    Err(ApiError::validation("a rejection requires a comment"))
                } else {
                    Ok(())
                }
            }
            DecisionKind::Revision => {
                let has_changes = self
                    .required_changes
                    .as_ref()
                    .is_some_and(|changes| changes.iter().any(|c| !c.trim().is_empty()));
                if self.comment.trim().is_empty() && !has_changes {
                    Err(ApiError::validation(
                        "a revision request needs a comment or at least one required change",
                    ))
                } else {
                    Ok(())
                }
            }
            DecisionKind::SiteVisit => match self.scheduled_date {
                Some(date) if date >= now => Ok(()),
                Some(_) => Err(ApiError::validation(
                    "a site visit cannot be scheduled in the past",
                )),
                None => Err(ApiError::validation("a site visit requires a scheduled date")),
            },
        }
    }

    pub fn effect(&self) -> DecisionEffect {
        match self.decision {
            DecisionKind::Approve => DecisionEffect::Approved {
                approved_at: self.made_at,
            },
            DecisionKind::Reject => DecisionEffect::Rejected,
            DecisionKind::Revision => DecisionEffect::RevisionRequested {
                required_changes: self.required_changes.clone().unwrap_or_default(),
            },
            DecisionKind::SiteVisit => DecisionEffect::SiteVisitScheduled {
                // validate() guarantees the date is present
                scheduled_date: self.scheduled_date.unwrap_or_else(DateTime::now),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(kind: DecisionKind, comment: &str) -> ReviewDecision {
        ReviewDecision {
            decision: kind,
            comment: comment.to_string(),
            made_by: ObjectId::new(),
            made_at: DateTime::now(),
            required_changes: None,
            scheduled_date: None,
        }
    }

    #[test]
    fn reject_requires_a_comment() {
        let now = DateTime::now();
        assert!(decision(DecisionKind::Reject, "  ").validate(now).is_err());
        assert!(decision(DecisionKind::Reject, "missing photos")
            .validate(now)
            .is_ok());
    }

    #[test]
    fn approve_needs_nothing_extra() {
        assert!(decision(DecisionKind::Approve, "")
            .validate(DateTime::now())
            .is_ok());
    }

    #[test]
    fn revision_accepts_changes_instead_of_comment() {
        let now = DateTime::now();
        let mut d = decision(DecisionKind::Revision, "");
        assert!(d.validate(now).is_err());

        d.required_changes = Some(vec!["   ".to_string()]);
        assert!(d.validate(now).is_err());

        d.required_changes = Some(vec!["re-measure block C".to_string()]);
        assert!(d.validate(now).is_ok());
    }

    #[test]
    fn site_visit_needs_a_future_date() {
        let now = DateTime::now();
        let mut d = decision(DecisionKind::SiteVisit, "checking progress");
        assert!(d.validate(now).is_err());

        d.scheduled_date = Some(DateTime::from_millis(now.timestamp_millis() - 86_400_000));
        assert!(d.validate(now).is_err());

        d.scheduled_date = Some(DateTime::from_millis(now.timestamp_millis() + 86_400_000));
        assert!(d.validate(now).is_ok());
    }

    #[test]
    fn revision_effect_carries_the_change_list() {
        let mut d = decision(DecisionKind::Revision, "fix X");
        d.required_changes = Some(vec!["fix X".to_string()]);
        assert_eq!(
            d.effect(),
            DecisionEffect::RevisionRequested {
                required_changes: vec!["fix X".to_string()]
            }
        );
    }
}
