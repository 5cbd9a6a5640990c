use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ApiError, ApiResult};

use super::review::DecisionKind;

/// Canonical internal status vocabulary. The store and the HTTP API exchange
/// the PascalCase [`ReportStatusRepr`]; everything inside the crate compares
/// against this enum only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ReportStatusRepr", into = "ReportStatusRepr")]
pub enum ReportStatus {
    Draft,
    PendingQsReview,
    UnderReview,
    RevisionRequested,
    SiteVisitScheduled,
    Approved,
    Rejected,
    Archived,
}

/// Wire/store representation of a report status. Kept as a separate enum so
/// the mapping to the internal vocabulary stays total in both directions:
/// adding a status without extending both `From` impls fails to compile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportStatusRepr {
    Draft,
    PendingQsReview,
    UnderReview,
    RevisionRequested,
    SiteVisitScheduled,
    Approved,
    Rejected,
    Archived,
}

impl From<ReportStatusRepr> for ReportStatus {
    fn from(repr: ReportStatusRepr) -> Self {
        match repr {
            ReportStatusRepr::Draft => ReportStatus::Draft,
            ReportStatusRepr::PendingQsReview => ReportStatus::PendingQsReview,
            ReportStatusRepr::UnderReview => ReportStatus::UnderReview,
            ReportStatusRepr::RevisionRequested => ReportStatus::RevisionRequested,
            ReportStatusRepr::SiteVisitScheduled => ReportStatus::SiteVisitScheduled,
            ReportStatusRepr::Approved => ReportStatus::Approved,
            ReportStatusRepr::Rejected => ReportStatus::Rejected,
            ReportStatusRepr::Archived => ReportStatus::Archived,
        }
    }
}
impl From<ReportStatus> for ReportStatusRepr {
    fn from(status: ReportStatus) -> Self {
        match status {
            ReportStatus::Draft => ReportStatusRepr::Draft,
            ReportStatus::PendingQsReview => ReportStatusRepr::PendingQsReview,
            ReportStatus::UnderReview => ReportStatusRepr::UnderReview,
            ReportStatus::RevisionRequested => ReportStatusRepr::RevisionRequested,
            ReportStatus::SiteVisitScheduled => ReportStatusRepr::SiteVisitScheduled,
            ReportStatus::Approved => ReportStatusRepr::Approved,
            ReportStatus::Rejected => ReportStatusRepr::Rejected,
            ReportStatus::Archived => ReportStatusRepr::Archived,
        }
    }
}

impl ReportStatus {
    pub const ALL: [ReportStatus; 8] = [
        ReportStatus::Draft,
        ReportStatus::PendingQsReview,
        ReportStatus::UnderReview,
        ReportStatus::RevisionRequested,
        ReportStatus::SiteVisitScheduled,
        ReportStatus::Approved,
        ReportStatus::Rejected,
        ReportStatus::Archived,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReportStatus::Approved | ReportStatus::Rejected | ReportStatus::Archived
        )
    }

    /// Report content may only be mutated by the owning RM in these states.
    pub fn is_editable(&self) -> bool {
        matches!(self, ReportStatus::Draft | ReportStatus::RevisionRequested)
    }

    /// Store-side filter value for conditional updates.
    pub fn as_repr_str(&self) -> &'static str {
        match self {
            ReportStatus::Draft => "Draft",
            ReportStatus::PendingQsReview => "PendingQsReview",
            ReportStatus::UnderReview => "UnderReview",
            ReportStatus::RevisionRequested => "RevisionRequested",
            ReportStatus::SiteVisitScheduled => "SiteVisitScheduled",
            ReportStatus::Approved => "Approved",
            ReportStatus::Rejected => "Rejected",
            ReportStatus::Archived => "Archived",
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReportStatus::Draft => "draft",
            ReportStatus::PendingQsReview => "pending_qs_review",
            ReportStatus::UnderReview => "under_review",
            ReportStatus::RevisionRequested => "revision_requested",
            ReportStatus::SiteVisitScheduled => "site_visit_scheduled",
            ReportStatus::Approved => "approved",
            ReportStatus::Rejected => "rejected",
            ReportStatus::Archived => "archived",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    RelationshipManager,
    QuantitySurveyor,
    Admin,
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UserRole::RelationshipManager => "relationship_manager",
            UserRole::QuantitySurveyor => "quantity_surveyor",
            UserRole::Admin => "admin",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportTrigger {
    Submit,
    Assign,
    StartReview,
    Decide(DecisionKind),
    Resubmit,
    Archive,
}

impl fmt::Display for ReportTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportTrigger::Submit => f.write_str("submit"),
            ReportTrigger::Assign => f.write_str("assign"),
            ReportTrigger::StartReview => f.write_str("start_review"),
            ReportTrigger::Decide(kind) => write!(f, "decide({kind})"),
            ReportTrigger::Resubmit => f.write_str("resubmit"),
            ReportTrigger::Archive => f.write_str("archive"),
        }
    }
}

/// Everything the transition guards need to know about the caller and the
/// report, detached from persistence so the table is testable as a pure
/// function.
#[derive(Clone, Copy, Debug)]
pub struct TransitionCtx<'a> {
    pub caller: &'a ObjectId,
    pub role: UserRole,
    pub rm_id: &'a ObjectId,
    pub qs_id: Option<&'a ObjectId>,
    /// Client, RM and project identifier all present on the report.
    pub submit_ready: bool,
}

impl TransitionCtx<'_> {
    fn is_owning_rm(&self) -> bool {
        self.role == UserRole::RelationshipManager && self.caller == self.rm_id
    }
    fn is_assigned_qs(&self) -> bool {
        self.role == UserRole::QuantitySurveyor && self.qs_id == Some(self.caller)
    }
}

/// The report lifecycle transition table. Every `(status, trigger, caller)` pair
/// not listed fails with `InvalidTransition` and must leave the report
/// unchanged; callers apply the returned status only on `Ok`.
pub fn next_status(
    status: ReportStatus,
    trigger: ReportTrigger,
    ctx: &TransitionCtx,
) -> ApiResult<ReportStatus> {
    let invalid = || ApiError::InvalidTransition {
        from: status,
        trigger,
        role: ctx.role,
    };

    match (status, trigger) {
        (ReportStatus::Draft, ReportTrigger::Submit) => {
            if !ctx.is_owning_rm() {
                return Err(invalid());
            }
            if !ctx.submit_ready {
                return Err(ApiError::validation(
                    "client, relationship manager and project identifier are required to submit",
                ));
            }
            Ok(ReportStatus::PendingQsReview)
        }
        (ReportStatus::PendingQsReview, ReportTrigger::Assign) => {
            if ctx.role != UserRole::QuantitySurveyor {
                return Err(invalid());
            }
            if ctx.qs_id.is_some() {
                return Err(ApiError::AlreadyAssigned);
            }
            Ok(ReportStatus::PendingQsReview)
        }
        (ReportStatus::PendingQsReview, ReportTrigger::StartReview) => {
            if !ctx.is_assigned_qs() {
                return Err(invalid());
            }
            Ok(ReportStatus::UnderReview)
        }
        (
            ReportStatus::PendingQsReview | ReportStatus::UnderReview,
            ReportTrigger::Decide(kind),
        ) => {
            if !ctx.is_assigned_qs() {
                return Err(invalid());
            }
            Ok(match kind {
                DecisionKind::Approve => ReportStatus::Approved,
                DecisionKind::Reject => ReportStatus::Rejected,
                DecisionKind::Revision => ReportStatus::RevisionRequested,
                DecisionKind::SiteVisit => ReportStatus::SiteVisitScheduled,
            })
        }
        (ReportStatus::RevisionRequested, ReportTrigger::Resubmit) => {
            if !ctx.is_owning_rm() {
                return Err(invalid());
            }
            Ok(ReportStatus::PendingQsReview)
        }
        (_, ReportTrigger::Archive) => {
            if ctx.role != UserRole::Admin || status == ReportStatus::Archived {
                return Err(invalid());
            }
            Ok(ReportStatus::Archived)
        }
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (ObjectId, ObjectId, ObjectId) {
        (ObjectId::new(), ObjectId::new(), ObjectId::new())
    }

    fn ctx<'a>(
        caller: &'a ObjectId,
        role: UserRole,
        rm: &'a ObjectId,
        qs: Option<&'a ObjectId>,
    ) -> TransitionCtx<'a> {
        TransitionCtx {
            caller,
            role,
            rm_id: rm,
            qs_id: qs,
            submit_ready: true,
        }
    }

    #[test]
    fn submit_moves_draft_to_pending() {
        let (rm, _, _) = ids();
        let c = ctx(&rm, UserRole::RelationshipManager, &rm, None);
        assert_eq!(
            next_status(ReportStatus::Draft, ReportTrigger::Submit, &c).unwrap(),
            ReportStatus::PendingQsReview
        );
    }

    #[test]
    fn submit_requires_complete_report() {
        let (rm, _, _) = ids();
        let mut c = ctx(&rm, UserRole::RelationshipManager, &rm, None);
        c.submit_ready = false;
        assert!(matches!(
            next_status(ReportStatus::Draft, ReportTrigger::Submit, &c),
            Err(ApiError::Validation(_))
        ));
    }

    #[test]
    fn submit_by_non_owner_is_invalid() {
        let (rm, other, _) = ids();
        let c = ctx(&other, UserRole::RelationshipManager, &rm, None);
        assert!(matches!(
            next_status(ReportStatus::Draft, ReportTrigger::Submit, &c),
            Err(ApiError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn assign_on_taken_report_fails() {
        let (rm, qs_a, qs_b) = ids();
        let c = ctx(&qs_b, UserRole::QuantitySurveyor, &rm, Some(&qs_a));
        assert_eq!(
            next_status(ReportStatus::PendingQsReview, ReportTrigger::Assign, &c),
            Err(ApiError::AlreadyAssigned)
        );
    }

    #[test]
    fn only_assigned_qs_may_decide() {
        let (rm, qs_a, qs_b) = ids();
        let c = ctx(&qs_b, UserRole::QuantitySurveyor, &rm, Some(&qs_a));
        for from in [ReportStatus::PendingQsReview, ReportStatus::UnderReview] {
            assert!(matches!(
                next_status(from, ReportTrigger::Decide(DecisionKind::Approve), &c),
                Err(ApiError::InvalidTransition { .. })
            ));
        }
    }

    #[test]
    fn decisions_map_to_statuses() {
        let (rm, qs, _) = ids();
        let c = ctx(&qs, UserRole::QuantitySurveyor, &rm, Some(&qs));
        let cases = [
            (DecisionKind::Approve, ReportStatus::Approved),
            (DecisionKind::Reject, ReportStatus::Rejected),
            (DecisionKind::Revision, ReportStatus::RevisionRequested),
            (DecisionKind::SiteVisit, ReportStatus::SiteVisitScheduled),
        ];
        for (kind, expected) in cases {
            assert_eq!(
                next_status(ReportStatus::UnderReview, ReportTrigger::Decide(kind), &c).unwrap(),
                expected
            );
        }
    }

    #[test]
    fn archive_needs_admin_and_skips_archived() {
        let (rm, admin, _) = ids();
        let c = ctx(&admin, UserRole::Admin, &rm, None);
        for from in ReportStatus::ALL {
            let result = next_status(from, ReportTrigger::Archive, &c);
            if from == ReportStatus::Archived {
                assert!(result.is_err());
            } else {
                assert_eq!(result.unwrap(), ReportStatus::Archived);
            }
        }
        let c = ctx(&rm, UserRole::RelationshipManager, &rm, None);
        assert!(next_status(ReportStatus::Draft, ReportTrigger::Archive, &c).is_err());
    }

    // Everything off the table must fail, for every role, and report which
    // transition was attempted.
    #[test]
    fn off_table_combinations_are_rejected() {
        let (rm, qs, admin) = ids();
        let triggers = [
            ReportTrigger::Submit,
            ReportTrigger::Assign,
            ReportTrigger::StartReview,
            ReportTrigger::Decide(DecisionKind::Approve),
            ReportTrigger::Resubmit,
        ];
        let callers = [
            (&rm, UserRole::RelationshipManager),
            (&qs, UserRole::QuantitySurveyor),
            (&admin, UserRole::Admin),
        ];
        for status in ReportStatus::ALL {
            for trigger in triggers {
                for (caller, role) in callers {
                    let c = ctx(caller, role, &rm, Some(&qs));
                    let allowed = matches!(
                        (status, trigger, role),
                        (ReportStatus::Draft, ReportTrigger::Submit, UserRole::RelationshipManager)
                            | (
                                ReportStatus::PendingQsReview,
                                ReportTrigger::StartReview | ReportTrigger::Decide(_),
                                UserRole::QuantitySurveyor,
                            )
                            | (
                                ReportStatus::UnderReview,
                                ReportTrigger::Decide(_),
                                UserRole::QuantitySurveyor,
                            )
                            | (
                                ReportStatus::RevisionRequested,
                                ReportTrigger::Resubmit,
                                UserRole::RelationshipManager,
                            )
                    ) && match trigger {
                        ReportTrigger::StartReview | ReportTrigger::Decide(_) => caller == &qs,
                        ReportTrigger::Submit | ReportTrigger::Resubmit => caller == &rm,
                        _ => true,
                    };
                    let result = next_status(status, trigger, &c);
                    assert_eq!(
                        result.is_ok(),
                        allowed,
                        "status={status} trigger={trigger} role={role}: got {result:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn repr_mapping_is_total_and_reversible() {
        for status in ReportStatus::ALL {
            let repr = ReportStatusRepr::from(status);
            assert_eq!(ReportStatus::from(repr), status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_repr_str()));
            let back: ReportStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(back, status);
        }
    }

    #[test]
    fn editability_follows_lifecycle() {
        assert!(ReportStatus::Draft.is_editable());
        assert!(ReportStatus::RevisionRequested.is_editable());
        for status in ReportStatus::ALL {
            if !matches!(status, ReportStatus::Draft | ReportStatus::RevisionRequested) {
                assert!(!status.is_editable(), "{status} should be locked");
            }
        }
    }
}
