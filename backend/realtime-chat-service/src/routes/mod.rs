pub mod keys;
pub mod presence;
pub mod wsroute;

use crate::metrics::metrics_handler;
use actix_web::web;

/// HTTP surface: key directory, presence lookup and operational endpoints.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(keys::get_bundle)
        .service(keys::publish_keys)
        .service(keys::one_time_key_count)
        .service(presence::get_presence)
        .route("/health", web::get().to(|| async { "OK" }))
        .route("/metrics", web::get().to(metrics_handler));
}
