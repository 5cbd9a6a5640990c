use actix_multipart::form::{tempfile::TempFile, text::Text, MultipartForm};
use actix_web::{get, post, put, web, HttpMessage, HttpRequest, HttpResponse};
use mime_guess::get_mime_extensions_str;
use mongodb::bson::{oid::ObjectId, DateTime};
use serde::Deserialize;
use std::{
    fs::{create_dir_all, rename},
    path::PathBuf,
    sync::Mutex,
};
use tracing::{error, info};

use crate::error::{ApiError, ApiResult};
use crate::models::{
    geotag::{self, GeotagData, SuppliedFix, DEFAULT_CLUSTER_DISTANCE_M, DEFAULT_FIX_TIMEOUT_MS},
    report::{Attachment, Report, ReportContentUpdate, ReportPhoto, ReportQuery, ReportRequest},
    report_status::{ReportStatus, UserRole},
    review::{DecisionEffect, DecisionRequest},
    site_visit::ScheduledSiteVisit,
    upload::UploadRegistry,
    user::UserAuthentication,
};

fn issuer(req: &HttpRequest) -> ApiResult<UserAuthentication> {
    req.extensions()
        .get::<UserAuthentication>()
        .cloned()
        .ok_or(ApiError::Unauthorized)
}

fn parse_id(raw: &str) -> ApiResult<ObjectId> {
    raw.parse()
        .map_err(|_| ApiError::validation("invalid object id"))
}

async fn load_report(_id: &ObjectId) -> ApiResult<Report> {
    Report::find_by_id(_id)
        .await?
        .ok_or(ApiError::NotFound("REPORT"))
}

#[derive(Debug, Deserialize)]
pub struct ReportQueryParams {
    pub status: Option<ReportStatus>,
    pub mine: Option<bool>,
    pub limit: Option<i64>,
}

#[post("/reports")]
pub async fn create_report(
    payload: web::Json<ReportRequest>,
    req: HttpRequest,
) -> ApiResult<HttpResponse> {
    let issuer = issuer(&req)?;
    if issuer.role != UserRole::RelationshipManager {
        return Err(ApiError::Unauthorized);
    }

    let mut report = Report::new(issuer._id, payload.into_inner());
    report.save().await?;
    info!(report = %report.report_number, "report created");
    Ok(HttpResponse::Created().json(report))
}

#[get("/reports")]
pub async fn get_reports(
    query: web::Query<ReportQueryParams>,
    req: HttpRequest,
) -> ApiResult<HttpResponse> {
    let issuer = issuer(&req)?;
    let mut report_query = ReportQuery {
        status: query.status,
        limit: query.limit,
        ..ReportQuery::default()
    };
    if query.mine.unwrap_or(false) {
        match issuer.role {
            UserRole::RelationshipManager => report_query.rm_id = Some(issuer._id),
            UserRole::QuantitySurveyor => report_query.qs_id = Some(issuer._id),
            UserRole::Admin => {}
        }
    }
    let reports = Report::find_many(&report_query).await?;
    Ok(HttpResponse::Ok().json(reports))
}

#[get("/reports/{report_id}")]
pub async fn get_report(report_id: web::Path<String>, req: HttpRequest) -> ApiResult<HttpResponse> {
    issuer(&req)?;
    let report = load_report(&parse_id(&report_id)?).await?;
    Ok(HttpResponse::Ok().json(report))
}

#[put("/reports/{report_id}")]
pub async fn update_report(
    report_id: web::Path<String>,
    payload: web::Json<ReportContentUpdate>,
    req: HttpRequest,
) -> ApiResult<HttpResponse> {
    let issuer = issuer(&req)?;
    let mut report = load_report(&parse_id(&report_id)?).await?;
    report.apply_content_update(&issuer._id, issuer.role, payload.into_inner())?;
    let _id = report.update().await?;
    Ok(HttpResponse::Ok().body(_id.to_string()))
}

/// Submit from draft, resubmit after a revision request.
#[post("/reports/{report_id}/submit")]
pub async fn submit_report(
    report_id: web::Path<String>,
    req: HttpRequest,
) -> ApiResult<HttpResponse> {
    let issuer = issuer(&req)?;
    let mut report = load_report(&parse_id(&report_id)?).await?;
    report.submit(&issuer._id, issuer.role)?;
    report.update().await?;
    info!(report = %report.report_number, "report submitted for review");
    Ok(HttpResponse::Ok().json(report))
}

/// Exclusive self-assignment. The losing side of a race gets a 409
/// `ALREADY_ASSIGNED`, never a silent overwrite.
#[post("/reports/{report_id}/assign")]
pub async fn assign_report(
    report_id: web::Path<String>,
    req: HttpRequest,
) -> ApiResult<HttpResponse> {
    let issuer = issuer(&req)?;
    if issuer.role != UserRole::QuantitySurveyor {
        return Err(ApiError::Unauthorized);
    }
    let report = Report::assign_qs(&parse_id(&report_id)?, &issuer._id).await?;
    info!(report = %report.report_number, "report assigned");
    Ok(HttpResponse::Ok().json(report))
}

#[post("/reports/{report_id}/review")]
pub async fn start_review(
    report_id: web::Path<String>,
    req: HttpRequest,
) -> ApiResult<HttpResponse> {
    let issuer = issuer(&req)?;
    let mut report = load_report(&parse_id(&report_id)?).await?;
    report.start_review(&issuer._id, issuer.role)?;
    report.update().await?;
    Ok(HttpResponse::Ok().json(report))
}

#[post("/reports/{report_id}/decision")]
pub async fn record_decision(
    report_id: web::Path<String>,
    payload: web::Json<DecisionRequest>,
    req: HttpRequest,
) -> ApiResult<HttpResponse> {
    let issuer = issuer(&req)?;
    let report_id = parse_id(&report_id)?;
    let mut report = load_report(&report_id).await?;

    let decision = payload.into_inner().into_decision(issuer._id, DateTime::now());
    let effect = report.apply_decision(&issuer._id, issuer.role, decision)?;
    report.update().await?;

    if let DecisionEffect::SiteVisitScheduled { scheduled_date } = effect {
        let mut visit = ScheduledSiteVisit::new(report_id, issuer._id, scheduled_date);
        if let Err(error) = visit.save().await {
            error!(%error, "scheduled site visit could not be stored");
        }
    }
    info!(report = %report.report_number, status = %report.status, "decision recorded");
    Ok(HttpResponse::Ok().json(report))
}

#[post("/reports/{report_id}/archive")]
pub async fn archive_report(
    report_id: web::Path<String>,
    req: HttpRequest,
) -> ApiResult<HttpResponse> {
    let issuer = issuer(&req)?;
    let mut report = load_report(&parse_id(&report_id)?).await?;
    report.archive(&issuer._id, issuer.role)?;
    report.update().await?;
    Ok(HttpResponse::Ok().json(report))
}

#[derive(Debug, Deserialize)]
pub struct CommentRequest {
    pub body: String,
}

#[post("/reports/{report_id}/comments")]
pub async fn add_comment(
    report_id: web::Path<String>,
    payload: web::Json<CommentRequest>,
    req: HttpRequest,
) -> ApiResult<HttpResponse> {
    let issuer = issuer(&req)?;
    let mut report = load_report(&parse_id(&report_id)?).await?;
    report.add_comment(issuer._id, payload.into_inner().body)?;
    report.update().await?;
    Ok(HttpResponse::Ok().json(report))
}

#[derive(Debug, MultipartForm)]
pub struct ReportPhotoMultipartRequest {
    #[multipart(rename = "photo")]
    pub photo: TempFile,
    /// JSON-encoded `GeotagData` from the device, used as the live fix when
    /// the image has no EXIF GPS block.
    pub geotag: Option<Text<String>>,
    /// JSON-encoded device info; stored alongside nothing, logged only.
    pub metadata: Option<Text<String>>,
    pub description: Option<Text<String>>,
}

/// Geotagged photo ingestion: EXIF first, supplied device fix second,
/// placeholder last. A failed upload is recorded on the queue entry and
/// never fails the report as a whole.
#[post("/reports/{report_id}/photos")]
pub async fn upload_photo(
    report_id: web::Path<String>,
    form: MultipartForm<ReportPhotoMultipartRequest>,
    registry: web::Data<Mutex<UploadRegistry>>,
    req: HttpRequest,
) -> ApiResult<HttpResponse> {
    let issuer = issuer(&req)?;
    let report_id = parse_id(&report_id)?;
    let mut report = load_report(&report_id).await?;
    // refuse up front: nothing may be queued or written for a report the
    // caller cannot edit
    report.ensure_editable(&issuer._id, issuer.role)?;

    let photo_id = ObjectId::new();
    {
        let mut registry = registry.lock().unwrap();
        let queue = registry.for_report(report_id);
        queue.enqueue(photo_id);
        queue.start(&photo_id)?;
    }

    match store_photo(&mut report, &issuer, photo_id, form.into_inner()).await {
        Ok(()) => {
            let mut registry = registry.lock().unwrap();
            let queue = registry.for_report(report_id);
            queue.progress(&photo_id, 100)?;
            queue.complete(&photo_id)?;
            Ok(HttpResponse::Created().json(report))
        }
        Err(error) => {
            registry
                .lock()
                .unwrap()
                .for_report(report_id)
                .fail(&photo_id, error.to_string())?;
            Err(error)
        }
    }
}

async fn store_photo(
    report: &mut Report,
    issuer: &UserAuthentication,
    photo_id: ObjectId,
    form: ReportPhotoMultipartRequest,
) -> ApiResult<()> {
    let report_id = report._id.ok_or(ApiError::NotFound("REPORT"))?;
    report.ensure_editable(&issuer._id, issuer.role)?;

    let bytes = std::fs::read(form.photo.file.path())
        .map_err(|error| ApiError::Upload(error.to_string()))?;

    let supplied_fix = match form.geotag {
        Some(text) => {
            let fix: GeotagData = serde_json::from_str(text.as_str())
                .map_err(|_| ApiError::validation("geotag field is not valid JSON"))?;
            Some(SuppliedFix(fix))
        }
        None => None,
    };
    let geotag = geotag::resolve_geotag(
        &bytes,
        supplied_fix.as_ref().map(|p| p as &dyn geotag::LocationProvider),
        DEFAULT_FIX_TIMEOUT_MS,
    )
    .await?;

    if let Some(metadata) = &form.metadata {
        info!(photo = %photo_id, metadata = %metadata.as_str(), "photo device metadata");
    }

    let mime = form
        .photo
        .content_type
        .as_ref()
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| "image/jpeg".to_string());
    let extension = get_mime_extensions_str(&mime)
        .and_then(|extensions| extensions.first())
        .copied()
        .ok_or_else(|| ApiError::Upload(format!("unsupported content type {mime}")))?;

    let save_dir = format!("./files/reports/photos/{report_id}/");
    create_dir_all(&save_dir).map_err(|error| ApiError::Upload(error.to_string()))?;
    let file_path = PathBuf::from(format!("{save_dir}{photo_id}.{extension}"));
    rename(form.photo.file.path(), &file_path)
        .map_err(|error| ApiError::Upload(error.to_string()))?;

    report.add_photo(
        &issuer._id,
        issuer.role,
        ReportPhoto {
            _id: photo_id,
            extension: extension.to_string(),
            geotag,
            description: form.description.map(|text| text.0),
            uploaded_at: DateTime::now(),
        },
    )?;
    report.update().await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct PhotoGroupParams {
    pub max_distance_m: Option<f64>,
}

#[get("/reports/{report_id}/photo-groups")]
pub async fn get_photo_groups(
    report_id: web::Path<String>,
    query: web::Query<PhotoGroupParams>,
    req: HttpRequest,
) -> ApiResult<HttpResponse> {
    issuer(&req)?;
    let report = load_report(&parse_id(&report_id)?).await?;
    let groups =
        report.photo_location_groups(query.max_distance_m.unwrap_or(DEFAULT_CLUSTER_DISTANCE_M));
    Ok(HttpResponse::Ok().json(groups))
}

/// The report whose queue is being touched, after checking the caller is a
/// participant of that report (owning RM, assigned QS, or admin).
async fn queue_report(report_id: &ObjectId, issuer: &UserAuthentication) -> ApiResult<Report> {
    let report = load_report(report_id).await?;
    if !report.is_participant(&issuer._id, issuer.role) {
        return Err(ApiError::Unauthorized);
    }
    Ok(report)
}

#[get("/reports/{report_id}/uploads")]
pub async fn get_uploads(
    report_id: web::Path<String>,
    registry: web::Data<Mutex<UploadRegistry>>,
    req: HttpRequest,
) -> ApiResult<HttpResponse> {
    let issuer = issuer(&req)?;
    let report_id = parse_id(&report_id)?;
    queue_report(&report_id, &issuer).await?;
    let snapshot = registry.lock().unwrap().snapshot(&report_id);
    Ok(HttpResponse::Ok().json(snapshot))
}

#[post("/reports/{report_id}/uploads/retry")]
pub async fn retry_uploads(
    report_id: web::Path<String>,
    registry: web::Data<Mutex<UploadRegistry>>,
    req: HttpRequest,
) -> ApiResult<HttpResponse> {
    let issuer = issuer(&req)?;
    let report_id = parse_id(&report_id)?;
    queue_report(&report_id, &issuer).await?;
    let reset = registry.lock().unwrap().for_report(report_id).retry_failed();
    Ok(HttpResponse::Ok().body(format!("Reset {reset} upload")))
}

#[post("/reports/{report_id}/uploads/clear")]
pub async fn clear_uploads(
    report_id: web::Path<String>,
    registry: web::Data<Mutex<UploadRegistry>>,
    req: HttpRequest,
) -> ApiResult<HttpResponse> {
    let issuer = issuer(&req)?;
    let report_id = parse_id(&report_id)?;
    queue_report(&report_id, &issuer).await?;
    let removed = registry
        .lock()
        .unwrap()
        .for_report(report_id)
        .clear_completed();
    Ok(HttpResponse::Ok().body(format!("Cleared {removed} upload")))
}

#[derive(Debug, MultipartForm)]
pub struct ReportAttachmentMultipartRequest {
    #[multipart(rename = "file")]
    pub file: TempFile,
    /// Display name; falls back to the uploaded file name.
    pub name: Option<Text<String>>,
}

#[post("/reports/{report_id}/attachments")]
pub async fn upload_attachment(
    report_id: web::Path<String>,
    form: MultipartForm<ReportAttachmentMultipartRequest>,
    req: HttpRequest,
) -> ApiResult<HttpResponse> {
    let issuer = issuer(&req)?;
    let report_id = parse_id(&report_id)?;
    let mut report = load_report(&report_id).await?;
    report.ensure_editable(&issuer._id, issuer.role)?;

    let form = form.into_inner();
    let attachment_id = ObjectId::new();
    let mime = form
        .file
        .content_type
        .as_ref()
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let extension = get_mime_extensions_str(&mime)
        .and_then(|extensions| extensions.first())
        .copied()
        .unwrap_or("bin");
    let name = form
        .name
        .map(|text| text.0)
        .or_else(|| form.file.file_name.clone())
        .unwrap_or_else(|| attachment_id.to_hex());

    let save_dir = format!("./files/reports/attachments/{report_id}/");
    create_dir_all(&save_dir).map_err(|error| ApiError::Upload(error.to_string()))?;
    let file_path = PathBuf::from(format!("{save_dir}{attachment_id}.{extension}"));
    rename(form.file.file.path(), &file_path)
        .map_err(|error| ApiError::Upload(error.to_string()))?;

    report.add_attachment(
        &issuer._id,
        issuer.role,
        Attachment {
            _id: attachment_id,
            name,
            extension: extension.to_string(),
        },
    )?;
    report.update().await?;
    Ok(HttpResponse::Created().json(report))
}
