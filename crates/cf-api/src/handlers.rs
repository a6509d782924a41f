//! # cf-api Handlers
//!
//! This module coordinates the flow between HTTP requests and the engine.
//! Handlers stay thin: extract, call one engine operation, serialize.

use actix_web::{web, HttpResponse};
use cf_core::models::{IdentityClaims, IssueFilter, IssuePatch, IssuePayload, IssueStatus, Role};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::extract::Authenticated;
use crate::AppState;

// ─── Request bodies ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct StatusChange {
    pub status: IssueStatus,
    pub note: String,
}

#[derive(Debug, Deserialize)]
pub struct Assignment {
    pub staff_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct Confirmation {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct BlockFlag {
    pub blocked: bool,
}

#[derive(Debug, Deserialize)]
pub struct RoleQuery {
    pub role: Option<Role>,
}

#[derive(Debug, Serialize)]
struct Me<'a> {
    user: &'a cf_core::models::User,
    can_create_issue: bool,
}

// ─── Identity ────────────────────────────────────────────────────────

pub async fn me(data: web::Data<AppState>, auth: Authenticated) -> ApiResult<HttpResponse> {
    let can_create_issue = data.engine.can_create_issue(&auth.0).await?;
    Ok(HttpResponse::Ok().json(Me {
        user: auth.0.user(),
        can_create_issue,
    }))
}

// ─── Issues ──────────────────────────────────────────────────────────

/// Public issue list. Query parameters mirror `IssueFilter`.
pub async fn list_issues(
    data: web::Data<AppState>,
    filter: web::Query<IssueFilter>,
) -> ApiResult<HttpResponse> {
    let issues = data.engine.list_issues(&filter).await?;
    Ok(HttpResponse::Ok().json(issues))
}

pub async fn create_issue(
    data: web::Data<AppState>,
    auth: Authenticated,
    payload: web::Json<IssuePayload>,
) -> ApiResult<HttpResponse> {
    let issue = data.engine.create_issue(&auth.0, payload.into_inner()).await?;
    Ok(HttpResponse::Created()
        .insert_header(("Location", format!("/api/issues/{}", issue.id)))
        .json(issue))
}

pub async fn my_issues(data: web::Data<AppState>, auth: Authenticated) -> ApiResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(data.engine.my_issues(&auth.0).await?))
}

pub async fn assigned_issues(
    data: web::Data<AppState>,
    auth: Authenticated,
) -> ApiResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(data.engine.assigned_issues(&auth.0).await?))
}

pub async fn issue_details(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let (issue, timeline) = data.engine.issue_details(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({ "issue": issue, "timeline": timeline })))
}

pub async fn edit_issue(
    data: web::Data<AppState>,
    auth: Authenticated,
    path: web::Path<Uuid>,
    patch: web::Json<IssuePatch>,
) -> ApiResult<HttpResponse> {
    let issue = data
        .engine
        .edit_issue(&auth.0, path.into_inner(), patch.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(issue))
}

pub async fn delete_issue(
    data: web::Data<AppState>,
    auth: Authenticated,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    data.engine.delete_issue(&auth.0, path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

pub async fn upvote(
    data: web::Data<AppState>,
    auth: Authenticated,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let issue = data.engine.upvote(&auth.0, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(issue))
}

pub async fn change_status(
    data: web::Data<AppState>,
    auth: Authenticated,
    path: web::Path<Uuid>,
    body: web::Json<StatusChange>,
) -> ApiResult<HttpResponse> {
    let issue = data
        .engine
        .change_status(&auth.0, path.into_inner(), body.status, &body.note)
        .await?;
    Ok(HttpResponse::Ok().json(issue))
}

pub async fn assign_staff(
    data: web::Data<AppState>,
    auth: Authenticated,
    path: web::Path<Uuid>,
    body: web::Json<Assignment>,
) -> ApiResult<HttpResponse> {
    let issue = data
        .engine
        .assign_staff(&auth.0, path.into_inner(), body.staff_id)
        .await?;
    Ok(HttpResponse::Ok().json(issue))
}

// ─── Payments ────────────────────────────────────────────────────────

pub async fn boost_checkout(
    data: web::Data<AppState>,
    auth: Authenticated,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let checkout = data
        .engine
        .initiate_boost_checkout(&auth.0, path.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(checkout))
}

pub async fn premium_checkout(
    data: web::Data<AppState>,
    auth: Authenticated,
) -> ApiResult<HttpResponse> {
    let checkout = data.engine.initiate_premium_checkout(&auth.0).await?;
    Ok(HttpResponse::Ok().json(checkout))
}

/// Confirmation is keyed by the gateway session alone; the buyer may come
/// back without a live session of ours.
pub async fn confirm_payment(
    data: web::Data<AppState>,
    body: web::Json<Confirmation>,
) -> ApiResult<HttpResponse> {
    let confirmation = data.engine.confirm_payment(&body.session_id).await?;
    Ok(HttpResponse::Ok().json(confirmation))
}

/// Gateway redirect target (`?session_id=...`).
pub async fn payment_return(
    data: web::Data<AppState>,
    query: web::Query<Confirmation>,
) -> ApiResult<HttpResponse> {
    let confirmation = data.engine.confirm_payment(&query.session_id).await?;
    Ok(HttpResponse::Ok().json(confirmation))
}

/// Gateway redirect target when the buyer abandons checkout. Nothing to
/// reconcile; the pending row simply never settles.
pub async fn payment_cancelled() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "cancelled" }))
}

pub async fn list_payments(
    data: web::Data<AppState>,
    auth: Authenticated,
) -> ApiResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(data.engine.list_payments(&auth.0).await?))
}

// ─── Administration ──────────────────────────────────────────────────

pub async fn list_users(
    data: web::Data<AppState>,
    auth: Authenticated,
    query: web::Query<RoleQuery>,
) -> ApiResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(data.engine.list_users(&auth.0, query.role).await?))
}

pub async fn set_blocked(
    data: web::Data<AppState>,
    auth: Authenticated,
    path: web::Path<Uuid>,
    body: web::Json<BlockFlag>,
) -> ApiResult<HttpResponse> {
    let user = data
        .engine
        .set_blocked(&auth.0, path.into_inner(), body.blocked)
        .await?;
    Ok(HttpResponse::Ok().json(user))
}

pub async fn provision_staff(
    data: web::Data<AppState>,
    auth: Authenticated,
    body: web::Json<IdentityClaims>,
) -> ApiResult<HttpResponse> {
    let staff = data.engine.provision_staff(&auth.0, body.into_inner()).await?;
    Ok(HttpResponse::Created().json(staff))
}

pub async fn remove_staff(
    data: web::Data<AppState>,
    auth: Authenticated,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    data.engine.remove_staff(&auth.0, path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}
