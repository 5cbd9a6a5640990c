use crate::database::get_db;
use crate::error::{ApiError, ApiResult};
use futures::StreamExt;
use mongodb::{
    bson::{doc, oid::ObjectId, to_bson, DateTime, Document},
    options::{FindOneAndUpdateOptions, FindOptions, ReturnDocument},
    Collection, Database,
};
use serde::{Deserialize, Serialize};

use super::geotag::{self, GeotagData};
use super::report_status::{next_status, ReportStatus, ReportTrigger, TransitionCtx, UserRole};
use super::review::{DecisionEffect, ReviewDecision};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    InProgress,
    Resolved,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WorkProgress {
    pub category: String,
    pub description: String,
    /// 0–100
    pub percentage: u8,
    pub notes: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Issue {
    pub title: String,
    pub description: String,
    pub severity: IssueSeverity,
    pub status: IssueStatus,
}

/// Server-side record of an uploaded site photo and its resolved geotag.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReportPhoto {
    pub _id: ObjectId,
    pub extension: String,
    pub geotag: GeotagData,
    pub description: Option<String>,
    pub uploaded_at: DateTime,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Attachment {
    pub _id: ObjectId,
    pub name: String,
    pub extension: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Comment {
    pub author_id: ObjectId,
    pub body: String,
    pub created_at: DateTime,
}

/// The central aggregate: one construction-loan site-visit report.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Report {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,
    pub report_number: String,
    pub status: ReportStatus,
    pub visit_date: DateTime,
    pub submitted_at: Option<DateTime>,
    pub reviewed_at: Option<DateTime>,
    pub approved_at: Option<DateTime>,
    /// Creator; fixed after creation.
    pub rm_id: ObjectId,
    /// Current reviewer. Set only through the atomic assignment rule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qs_id: Option<ObjectId>,
    pub client_name: String,
    pub project_code: String,
    /// External facility/loan reference, opaque here.
    pub ibps_number: Option<String>,
    pub site_address: String,
    pub coordinates: Option<GeotagData>,
    pub weather: Option<String>,
    pub temperature_c: Option<f64>,
    pub work_progress: Vec<WorkProgress>,
    pub issues: Vec<Issue>,
    pub photos: Vec<ReportPhoto>,
    pub attachments: Vec<Attachment>,
    /// Append-only.
    pub decisions: Vec<ReviewDecision>,
    /// Append-only.
    pub comments: Vec<Comment>,
    /// Change list from the latest revision request.
    pub required_changes: Vec<String>,
    pub created_at: DateTime,
}

#[derive(Debug, Default)]
pub struct ReportQuery {
    pub rm_id: Option<ObjectId>,
    pub qs_id: Option<ObjectId>,
    pub status: Option<ReportStatus>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ReportRequest {
    pub client_name: String,
    pub project_code: String,
    pub ibps_number: Option<String>,
    pub site_address: String,
    pub visit_date: chrono::DateTime<chrono::Utc>,
    pub coordinates: Option<GeotagData>,
    pub weather: Option<String>,
    pub temperature_c: Option<f64>,
}

/// RM-editable content, applied only while the report is editable.
#[derive(Debug, Deserialize)]
pub struct ReportContentUpdate {
    pub site_address: Option<String>,
    pub coordinates: Option<GeotagData>,
    pub weather: Option<String>,
    pub temperature_c: Option<f64>,
    pub work_progress: Option<Vec<WorkProgress>>,
    pub issues: Option<Vec<Issue>>,
}

impl Report {
    pub fn new(rm_id: ObjectId, request: ReportRequest) -> Self {
        let now = DateTime::now();
        Report {
            _id: None,
            report_number: String::new(),
            status: ReportStatus::Draft,
            visit_date: DateTime::from_millis(request.visit_date.timestamp_millis()),
            submitted_at: None,
            reviewed_at: None,
            approved_at: None,
            rm_id,
            qs_id: None,
            client_name: request.client_name,
            project_code: request.project_code,
            ibps_number: request.ibps_number,
            site_address: request.site_address,
            coordinates: request.coordinates,
            weather: request.weather,
            temperature_c: request.temperature_c,
            work_progress: Vec::new(),
            issues: Vec::new(),
            photos: Vec::new(),
            attachments: Vec::new(),
            decisions: Vec::new(),
            comments: Vec::new(),
            required_changes: Vec::new(),
            created_at: now,
        }
    }

    fn ctx<'a>(&'a self, caller: &'a ObjectId, role: UserRole) -> TransitionCtx<'a> {
        TransitionCtx {
            caller,
            role,
            rm_id: &self.rm_id,
            qs_id: self.qs_id.as_ref(),
            submit_ready: !self.client_name.trim().is_empty()
                && !self.project_code.trim().is_empty(),
        }
    }

    // --- pure transitions -----------------------------------------------
    //
    // Each of these either fully applies or returns an error with the
    // report untouched; persistence happens afterwards at the route layer.

    /// `submit` from draft, `resubmit` after a revision request. Sets
    /// `submitted_at` exactly once, on the first submission.
    pub fn submit(&mut self, caller: &ObjectId, role: UserRole) -> ApiResult<()> {
        let trigger = if self.status == ReportStatus::RevisionRequested {
            ReportTrigger::Resubmit
        } else {
            ReportTrigger::Submit
        };
        self.status = next_status(self.status, trigger, &self.ctx(caller, role))?;
        if self.submitted_at.is_none() {
            self.submitted_at = Some(DateTime::now());
        }
        Ok(())
    }

    /// Assigned reviewer marks the report as actively being reviewed.
    pub fn start_review(&mut self, caller: &ObjectId, role: UserRole) -> ApiResult<()> {
        self.status = next_status(self.status, ReportTrigger::StartReview, &self.ctx(caller, role))?;
        if self.reviewed_at.is_none() {
            self.reviewed_at = Some(DateTime::now());
        }
        Ok(())
    }

    pub fn archive(&mut self, caller: &ObjectId, role: UserRole) -> ApiResult<()> {
        self.status = next_status(self.status, ReportTrigger::Archive, &self.ctx(caller, role))?;
        Ok(())
    }

    /// Validate a reviewer decision, append it to history, derive the new
    /// status and apply its side effect on the aggregate. All-or-nothing:
    /// any guard failure leaves the report exactly as it was.
    pub fn apply_decision(
        &mut self,
        caller: &ObjectId,
        role: UserRole,
        decision: ReviewDecision,
    ) -> ApiResult<DecisionEffect> {
        decision.validate(DateTime::now())?;
        let next = next_status(
            self.status,
            ReportTrigger::Decide(decision.decision),
            &self.ctx(caller, role),
        )?;

        let effect = decision.effect();
        if self.reviewed_at.is_none() {
            self.reviewed_at = Some(decision.made_at);
        }
        match &effect {
            DecisionEffect::Approved { approved_at } => {
                self.approved_at = Some(*approved_at);
            }
            DecisionEffect::Rejected => {}
            DecisionEffect::RevisionRequested { required_changes } => {
                // ownership returns to the RM, the review slot reopens
                self.qs_id = None;
                self.required_changes = required_changes.clone();
            }
            DecisionEffect::SiteVisitScheduled { .. } => {}
        }
        self.decisions.push(decision);
        self.status = next;
        Ok(effect)
    }

    /// RM content edits, only while `draft` or `revision_requested`.
    pub fn apply_content_update(
        &mut self,
        caller: &ObjectId,
        role: UserRole,
        update: ReportContentUpdate,
    ) -> ApiResult<()> {
        self.check_editable(caller, role)?;
        if let Some(progress) = &update.work_progress {
            if progress.iter().any(|item| item.percentage > 100) {
                return Err(ApiError::validation(
                    "work progress percentage must be between 0 and 100",
                ));
            }
        }

        if let Some(address) = update.site_address {
            self.site_address = address;
        }
        if let Some(coordinates) = update.coordinates {
            self.coordinates = Some(coordinates);
        }
        if let Some(weather) = update.weather {
            self.weather = Some(weather);
        }
        if let Some(temperature) = update.temperature_c {
            self.temperature_c = Some(temperature);
        }
        if let Some(progress) = update.work_progress {
            self.work_progress = progress;
        }
        if let Some(issues) = update.issues {
            self.issues = issues;
        }
        Ok(())
    }

    pub fn add_photo(&mut self, caller: &ObjectId, role: UserRole, photo: ReportPhoto) -> ApiResult<()> {
        self.check_editable(caller, role)?;
        self.photos.push(photo);
        Ok(())
    }

    pub fn add_attachment(
        &mut self,
        caller: &ObjectId,
        role: UserRole,
        attachment: Attachment,
    ) -> ApiResult<()> {
        self.check_editable(caller, role)?;
        self.attachments.push(attachment);
        Ok(())
    }

    pub fn add_comment(&mut self, author_id: ObjectId, body: String) -> ApiResult<()> {
        if body.trim().is_empty() {
            return Err(ApiError::validation("a comment cannot be empty"));
        }
        self.comments.push(Comment {
            author_id,
            body,
            created_at: DateTime::now(),
        });
        Ok(())
    }

    /// Ownership and lock check on its own, for callers that must refuse
    /// before doing any work with side effects (file writes in particular).
    pub fn ensure_editable(&self, caller: &ObjectId, role: UserRole) -> ApiResult<()> {
        self.check_editable(caller, role)
    }

    /// True when the caller may read this report's upload queue: the owning
    /// RM, the assigned QS, or an admin.
    pub fn is_participant(&self, caller: &ObjectId, role: UserRole) -> bool {
        role == UserRole::Admin || &self.rm_id == caller || self.qs_id.as_ref() == Some(caller)
    }

    fn check_editable(&self, caller: &ObjectId, role: UserRole) -> ApiResult<()> {
        if role != UserRole::RelationshipManager || caller != &self.rm_id {
            return Err(ApiError::Unauthorized);
        }
        if !self.status.is_editable() {
            return Err(ApiError::ReportLocked {
                status: self.status,
            });
        }
        Ok(())
    }

    /// Photo ids grouped by proximity of their geotags (seed-based greedy
    /// partition, see `geotag::group_by_location`).
    pub fn photo_location_groups(&self, max_distance_m: f64) -> Vec<Vec<ObjectId>> {
        let geotags: Vec<GeotagData> = self.photos.iter().map(|p| p.geotag.clone()).collect();
        geotag::group_by_location(&geotags, max_distance_m)
            .into_iter()
            .map(|group| group.into_iter().map(|i| self.photos[i]._id).collect())
            .collect()
    }

    // --- persistence ----------------------------------------------------

    fn collection() -> Collection<Report> {
        let db: Database = get_db();
        db.collection::<Report>("reports")
    }

    pub async fn save(&mut self) -> ApiResult<ObjectId> {
        let _id = ObjectId::new();
        self._id = Some(_id);
        if self.report_number.is_empty() {
            // human-readable and unique: creation date plus id tail
            self.report_number = format!(
                "SVR-{}-{}",
                chrono::Utc::now().format("%Y%m%d"),
                &_id.to_hex()[18..]
            );
        }
        Self::collection()
            .insert_one(&*self, None)
            .await
            .map_err(|error| ApiError::Database(error.to_string()))
            .map(|_| _id)
    }

    pub async fn find_by_id(_id: &ObjectId) -> ApiResult<Option<Report>> {
        Self::collection()
            .find_one(doc! { "_id": _id }, None)
            .await
            .map_err(|error| ApiError::Database(error.to_string()))
    }

    pub async fn find_many(query: &ReportQuery) -> ApiResult<Vec<Report>> {
        let mut filter = Document::new();
        if let Some(rm_id) = query.rm_id {
            filter.insert("rm_id", rm_id);
        }
        if let Some(qs_id) = query.qs_id {
            filter.insert("qs_id", qs_id);
        }
        if let Some(status) = &query.status {
            filter.insert("status", status.as_repr_str());
        }
        let options = FindOptions::builder().limit(query.limit).build();

        let mut cursor = Self::collection()
            .find(filter, options)
            .await
            .map_err(|error| ApiError::Database(error.to_string()))?;

        let mut reports: Vec<Report> = Vec::new();
        while let Some(Ok(report)) = cursor.next().await {
            reports.push(report);
        }
        Ok(reports)
    }

    /// Persist the whole aggregate back to its document.
    pub async fn update(&self) -> ApiResult<ObjectId> {
        let _id = self._id.ok_or(ApiError::NotFound("REPORT"))?;
        Self::collection()
            .update_one(
                doc! { "_id": _id },
                doc! { "$set": to_bson::<Report>(self)
                    .map_err(|error| ApiError::Database(error.to_string()))? },
                None,
            )
            .await
            .map_err(|error| ApiError::Database(error.to_string()))
            .map(|_| _id)
    }

    /// Atomic check-and-set assignment: one conditional update claims the
    /// review slot, so of two near-simultaneous reviewers exactly one wins
    /// and the other gets `AlreadyAssigned`.
    pub async fn assign_qs(report_id: &ObjectId, qs_id: &ObjectId) -> ApiResult<Report> {
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        let claimed = Self::collection()
            .find_one_and_update(
                doc! {
                    "_id": report_id,
                    "qs_id": null,
                    "status": ReportStatus::PendingQsReview.as_repr_str(),
                },
                doc! { "$set": { "qs_id": qs_id } },
                options,
            )
            .await
            .map_err(|error| ApiError::Database(error.to_string()))?;

        match claimed {
            Some(report) => Ok(report),
            // Lost the race or wrong state; look again to say which.
            None => match Self::find_by_id(report_id).await? {
                Some(report) if report.qs_id.is_some() => Err(ApiError::AlreadyAssigned),
                Some(report) => Err(ApiError::InvalidTransition {
                    from: report.status,
                    trigger: ReportTrigger::Assign,
                    role: UserRole::QuantitySurveyor,
                }),
                None => Err(ApiError::NotFound("REPORT")),
            },
        }
    }
}
