use actix_web::{get, web, HttpResponse};
use mime_guess::from_path;
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    ReportPhoto,
    ReportAttachment,
    UserImage,
}

#[derive(Deserialize)]
pub struct FileQueryParams {
    pub kind: FileKind,
    pub report_id: Option<String>,
    pub name: String,
}

pub mod report;
pub mod site_visit;
pub mod user;

#[get("/files")]
pub async fn get_file(query: web::Query<FileQueryParams>) -> HttpResponse {
    let report_id = query.report_id.as_deref().unwrap_or_default();
    let path = match query.kind {
        FileKind::ReportPhoto => format!("./files/reports/photos/{}/{}", report_id, query.name),
        FileKind::ReportAttachment => {
            format!("./files/reports/attachments/{}/{}", report_id, query.name)
        }
        FileKind::UserImage => format!("./files/users/{}", query.name),
    };
    if let Ok(file) = fs::read(path.clone()) {
        let mime = from_path(path).first_or_octet_stream();
        HttpResponse::Ok().content_type(mime).body(file)
    } else {
        HttpResponse::NotFound().body("CONTENT_NOT_FOUND")
    }
}
