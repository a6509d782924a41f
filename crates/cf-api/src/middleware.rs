//! Middleware for logging and cross-origin access.

use actix_cors::Cors;
use actix_web::http::header;
use actix_web::middleware::Logger;

/// Access log: remote-ip "request-line" status-code response-size duration.
pub fn standard_middleware() -> Logger {
    Logger::new("%a \"%r\" %s %b %Dms")
}

/// CORS for the browser client. An empty origin list allows any origin.
pub fn cors_policy(allowed_origins: &[String]) -> Cors {
    let cors = Cors::default()
        .allowed_methods(vec!["GET", "POST", "PATCH", "DELETE"])
        .allowed_headers(vec![header::AUTHORIZATION, header::CONTENT_TYPE])
        .max_age(3600);
    if allowed_origins.is_empty() {
        return cors.allow_any_origin();
    }
    allowed_origins
        .iter()
        .fold(cors, |cors, origin| cors.allowed_origin(origin))
}
