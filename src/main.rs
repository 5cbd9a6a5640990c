use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use std::{io, sync::Mutex};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod database;
mod error;
mod models;
mod routes;

use models::{upload::UploadRegistry, user::UserAuthenticationMiddlewareFactory};

#[actix_web::main]
async fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let db_uri: String =
        std::env::var("MONGODB_URI").unwrap_or_else(|_| String::from("mongodb://localhost:27017"));
    let bind_addr: String =
        std::env::var("BIND_ADDR").unwrap_or_else(|_| String::from("127.0.0.1:8000"));

    models::user::load_keys();
    database::connect(db_uri).await;

    let upload_registry = web::Data::new(Mutex::new(UploadRegistry::new()));

    info!(%bind_addr, "starting sitetrack server");
    HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .wrap(UserAuthenticationMiddlewareFactory)
            .app_data(upload_registry.clone())
            .service(routes::get_file)
            .service(routes::user::get_users)
            .service(routes::user::get_user)
            .service(routes::user::create_user)
            .service(routes::user::login)
            .service(routes::user::refresh)
            .service(routes::report::create_report)
            .service(routes::report::get_reports)
            .service(routes::report::get_report)
            .service(routes::report::update_report)
            .service(routes::report::submit_report)
            .service(routes::report::assign_report)
            .service(routes::report::start_review)
            .service(routes::report::record_decision)
            .service(routes::report::archive_report)
            .service(routes::report::add_comment)
            .service(routes::report::upload_photo)
            .service(routes::report::upload_attachment)
            .service(routes::report::get_photo_groups)
            .service(routes::report::get_uploads)
            .service(routes::report::retry_uploads)
            .service(routes::report::clear_uploads)
            .service(routes::site_visit::get_report_site_visits)
            .service(routes::site_visit::get_my_site_visits)
            .service(routes::site_visit::update_site_visit)
    })
    .bind(bind_addr)?
    .run()
    .await
}
