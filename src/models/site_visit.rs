use crate::database::get_db;
use crate::error::{ApiError, ApiResult};
use futures::StreamExt;
use mongodb::{
    bson::{doc, oid::ObjectId, to_bson, DateTime},
    Collection, Database,
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteVisitStatus {
    Scheduled,
    Completed,
    Cancelled,
    Rescheduled,
}

/// Visit record created when a reviewer decides `site_visit`. Lives its own
/// lifecycle; the parent report only references it.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ScheduledSiteVisit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,
    pub report_id: ObjectId,
    pub qs_id: ObjectId,
    pub scheduled_date: DateTime,
    pub status: SiteVisitStatus,
    pub created_at: DateTime,
}

#[derive(Debug, Deserialize)]
pub struct SiteVisitUpdateRequest {
    pub status: SiteVisitStatus,
    pub scheduled_date: Option<chrono::DateTime<chrono::Utc>>,
}

impl ScheduledSiteVisit {
    pub fn new(report_id: ObjectId, qs_id: ObjectId, scheduled_date: DateTime) -> Self {
        ScheduledSiteVisit {
            _id: None,
            report_id,
            qs_id,
            scheduled_date,
            status: SiteVisitStatus::Scheduled,
            created_at: DateTime::now(),
        }
    }

    fn collection() -> Collection<ScheduledSiteVisit> {
        let db: Database = get_db();
        db.collection::<ScheduledSiteVisit>("site-visits")
    }

    pub async fn save(&mut self) -> ApiResult<ObjectId> {
        self._id = Some(ObjectId::new());
        Self::collection()
            .insert_one(&*self, None)
            .await
            .map_err(|error| ApiError::Database(error.to_string()))
            .map(|_| self._id.unwrap())
    }

    pub async fn find_by_id(_id: &ObjectId) -> ApiResult<Option<ScheduledSiteVisit>> {
        Self::collection()
            .find_one(doc! { "_id": _id }, None)
            .await
            .map_err(|error| ApiError::Database(error.to_string()))
    }

    pub async fn find_by_report(report_id: &ObjectId) -> ApiResult<Vec<ScheduledSiteVisit>> {
        let mut cursor = Self::collection()
            .find(doc! { "report_id": report_id }, None)
            .await
            .map_err(|error| ApiError::Database(error.to_string()))?;

        let mut visits: Vec<ScheduledSiteVisit> = Vec::new();
        while let Some(Ok(visit)) = cursor.next().await {
            visits.push(visit);
        }
        Ok(visits)
    }

    pub async fn find_by_qs(qs_id: &ObjectId) -> ApiResult<Vec<ScheduledSiteVisit>> {
        let mut cursor = Self::collection()
            .find(doc! { "qs_id": qs_id }, None)
            .await
            .map_err(|error| ApiError::Database(error.to_string()))?;

        let mut visits: Vec<ScheduledSiteVisit> = Vec::new();
        while let Some(Ok(visit)) = cursor.next().await {
            visits.push(visit);
        }
        Ok(visits)
    }

    /// Rescheduling requires the new date; plain status flips keep the old
    /// one.
    pub async fn apply_update(&mut self, update: SiteVisitUpdateRequest) -> ApiResult<ObjectId> {
        if update.status == SiteVisitStatus::Rescheduled {
            match update.scheduled_date {
                Some(date) => {
                    self.scheduled_date = DateTime::from_millis(date.timestamp_millis());
                }
                None => {
                    return Err(ApiError::validation(
                        "rescheduling a visit requires a new date",
                    ))
                }
            }
        }
        self.status = update.status;

        let _id = self._id.ok_or(ApiError::NotFound("SITE_VISIT"))?;
        Self::collection()
            .update_one(
                doc! { "_id": _id },
                doc! { "$set": to_bson::<ScheduledSiteVisit>(self)
                    .map_err(|error| ApiError::Database(error.to_string()))? },
                None,
            )
            .await
            .map_err(|error| ApiError::Database(error.to_string()))
            .map(|_| _id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_visits_start_scheduled() {
        let visit = ScheduledSiteVisit::new(ObjectId::new(), ObjectId::new(), DateTime::now());
        assert_eq!(visit.status, SiteVisitStatus::Scheduled);
        assert!(visit._id.is_none());
    }
}
