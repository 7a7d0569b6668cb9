//! HTTP surface of the archive
//!
//! Every route lives under `/archive`. Fixed paths are registered ahead of
//! `/archive/{id}` so that, for example, `count` is never read as an id.

mod handlers;
pub mod streaming;

use actix_web::web;

pub use handlers::{
    count, delete, download, exists, exists_by_hash, exists_by_id, exists_by_name, get_info, list,
    upload,
};

/// MDC key correlating every log line of one request
pub const REQUEST_ID_KEY: &str = "request_id";

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(count)
        .service(exists_by_hash)
        .service(exists_by_id)
        .service(exists_by_name)
        .service(exists)
        .service(download)
        .service(list)
        .service(upload)
        .service(get_info)
        .service(delete);
}
