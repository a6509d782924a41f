//! # cf-api
//!
//! The JSON routing layer for Civic-Fix. Handlers resolve the caller from
//! the bearer token, delegate to the engine and map its errors to HTTP.

pub mod error;
pub mod extract;
pub mod handlers;
pub mod middleware;

use actix_web::web;
use cf_services::Engine;

/// State shared across all Actix-web workers.
pub struct AppState {
    pub engine: Engine,
}

/// Configures the routes under `/api`.
///
/// Fixed segments (`/issues/mine`) are registered ahead of `/issues/{id}`.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/me", web::get().to(handlers::me))
            .route("/issues", web::get().to(handlers::list_issues))
            .route("/issues", web::post().to(handlers::create_issue))
            .route("/issues/mine", web::get().to(handlers::my_issues))
            .route("/issues/assigned", web::get().to(handlers::assigned_issues))
            .route("/issues/{id}", web::get().to(handlers::issue_details))
            .route("/issues/{id}", web::patch().to(handlers::edit_issue))
            .route("/issues/{id}", web::delete().to(handlers::delete_issue))
            .route("/issues/{id}/upvote", web::post().to(handlers::upvote))
            .route("/issues/{id}/status", web::post().to(handlers::change_status))
            .route("/issues/{id}/assign", web::post().to(handlers::assign_staff))
            .route("/issues/{id}/boost", web::post().to(handlers::boost_checkout))
            .route("/payments", web::get().to(handlers::list_payments))
            .route("/payments/premium", web::post().to(handlers::premium_checkout))
            .route("/payments/confirm", web::post().to(handlers::confirm_payment))
            .route("/payments/success", web::get().to(handlers::payment_return))
            .route("/payments/cancelled", web::get().to(handlers::payment_cancelled))
            .route("/admin/users", web::get().to(handlers::list_users))
            .route("/admin/users/{id}/block", web::post().to(handlers::set_blocked))
            .route("/admin/staff", web::post().to(handlers::provision_staff))
            .route("/admin/staff/{id}", web::delete().to(handlers::remove_staff)),
    );
}
