use actix_web::{get, put, web, HttpMessage, HttpRequest, HttpResponse};
use mongodb::bson::oid::ObjectId;

use crate::error::{ApiError, ApiResult};
use crate::models::{
    report_status::UserRole,
    site_visit::{ScheduledSiteVisit, SiteVisitUpdateRequest},
    user::UserAuthentication,
};

fn issuer(req: &HttpRequest) -> ApiResult<UserAuthentication> {
    req.extensions()
        .get::<UserAuthentication>()
        .cloned()
        .ok_or(ApiError::Unauthorized)
}

#[get("/reports/{report_id}/site-visits")]
pub async fn get_report_site_visits(
    report_id: web::Path<String>,
    req: HttpRequest,
) -> ApiResult<HttpResponse> {
    issuer(&req)?;
    let report_id: ObjectId = report_id
        .parse()
        .map_err(|_| ApiError::validation("invalid object id"))?;
    let visits = ScheduledSiteVisit::find_by_report(&report_id).await?;
    Ok(HttpResponse::Ok().json(visits))
}

#[get("/site-visits")]
pub async fn get_my_site_visits(req: HttpRequest) -> ApiResult<HttpResponse> {
    let issuer = issuer(&req)?;
    if issuer.role != UserRole::QuantitySurveyor {
        return Err(ApiError::Unauthorized);
    }
    let visits = ScheduledSiteVisit::find_by_qs(&issuer._id).await?;
    Ok(HttpResponse::Ok().json(visits))
}

/// Complete, cancel or reschedule a visit. Only the reviewer who scheduled
/// it may change it.
#[put("/site-visits/{visit_id}")]
pub async fn update_site_visit(
    visit_id: web::Path<String>,
    payload: web::Json<SiteVisitUpdateRequest>,
    req: HttpRequest,
) -> ApiResult<HttpResponse> {
    let issuer = issuer(&req)?;
    let visit_id: ObjectId = visit_id
        .parse()
        .map_err(|_| ApiError::validation("invalid object id"))?;

    let mut visit = ScheduledSiteVisit::find_by_id(&visit_id)
        .await?
        .ok_or(ApiError::NotFound("SITE_VISIT"))?;
    if visit.qs_id != issuer._id {
        return Err(ApiError::Unauthorized);
    }
    visit.apply_update(payload.into_inner()).await?;
    Ok(HttpResponse::Ok().json(visit))
}
