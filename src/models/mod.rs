pub mod geotag;
pub mod report;
pub mod report_status;
pub mod review;
pub mod site_visit;
pub mod upload;
pub mod user;
