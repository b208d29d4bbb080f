pub mod transcribe;

pub use transcribe::*;

use crate::health;
use actix_web::web;

/// Route table shared by the server and the handler tests.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/healthz", web::get().to(health::healthz))
        .route("/transcribe", web::post().to(transcribe::transcribe))
        .service(
            web::scope("/api/v1")
                .route("/metrics", web::get().to(health::detailed_metrics))
                .route("/model", web::get().to(health::model_status)),
        );
}
