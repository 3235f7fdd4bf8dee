//! Handlers driving the deployment orchestrator.

use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use super::error::ApiError;
use super::AppContext;
use crate::deployment::notification::UpdateNotification;
use crate::deployment::rollback::RollbackRequest;
use crate::tracker::ImageKind;

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    deployment_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionRequest {
    deployment_id: String,
    #[serde(default)]
    reason: Option<String>,
}

pub async fn notify(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
    body: web::Json<UpdateNotification>,
) -> Result<HttpResponse, ApiError> {
    let scope = ctx.auth.require_cd_scope(&req)?;
    let notification = body.into_inner();
    let receipt = web::block(move || ctx.orchestrator.notify(notification, scope)).await??;
    Ok(HttpResponse::Ok().json(receipt))
}

pub async fn status(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
    query: web::Query<StatusQuery>,
) -> Result<HttpResponse, ApiError> {
    ctx.auth.require_operator(&req)?;
    match ctx.orchestrator.status(query.deployment_id.as_deref()) {
        Some(status) => Ok(HttpResponse::Ok().json(status)),
        None => match &query.deployment_id {
            Some(id) => Err(ApiError::NotFound(format!("deployment '{id}' not found"))),
            None => Ok(HttpResponse::Ok().json(serde_json::Value::Null)),
        },
    }
}

pub async fn pending(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    ctx.auth.require_operator(&req)?;
    let pending = ctx.orchestrator.pending_deployments();
    Ok(match pending.first() {
        Some(deployment) => HttpResponse::Ok().json(json!({
            "pending": true,
            "deployment": deployment,
        })),
        None => HttpResponse::Ok().json(json!({ "pending": false })),
    })
}

pub async fn pending_all(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    ctx.auth.require_operator(&req)?;
    let deployments = ctx.orchestrator.pending_deployments();
    Ok(HttpResponse::Ok().json(json!({
        "total_pending": deployments.len(),
        "deployments": deployments,
    })))
}

pub async fn preview(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    ctx.auth.require_operator(&req)?;
    let deployment_id = path.into_inner();
    let preview = web::block(move || ctx.orchestrator.preview(&deployment_id)).await??;
    Ok(HttpResponse::Ok().json(preview))
}

pub async fn shutdown_reasons(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    ctx.auth.require_operator(&req)?;
    let deployment_id = path.into_inner();
    let reasons = web::block(move || ctx.orchestrator.shutdown_reasons(&deployment_id)).await??;
    Ok(HttpResponse::Ok().json(reasons))
}

pub async fn events(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    ctx.auth.require_operator(&req)?;
    let events = ctx.orchestrator.events(&path.into_inner())?;
    Ok(HttpResponse::Ok().json(events))
}

pub async fn history(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, ApiError> {
    ctx.auth.require_operator(&req)?;
    let deployments = ctx.orchestrator.history(query.limit.unwrap_or(10));
    Ok(HttpResponse::Ok().json(json!({ "deployments": deployments })))
}

pub async fn current_images(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    ctx.auth.require_operator(&req)?;
    let mut images = serde_json::Map::new();
    for kind in ImageKind::ALL {
        let current = ctx.tracker.current(kind)?;
        images.insert(
            kind.as_str().to_string(),
            serde_json::to_value(current).map_err(ApiError::internal)?,
        );
    }
    Ok(HttpResponse::Ok().json(images))
}

pub async fn launch(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
    body: web::Json<ActionRequest>,
) -> Result<HttpResponse, ApiError> {
    ctx.auth.require_operator(&req)?;
    let action = body.into_inner();
    let deployment_id = action.deployment_id.clone();
    web::block(move || ctx.orchestrator.launch(&action.deployment_id)).await??;
    Ok(HttpResponse::Ok().json(json!({ "status": "launched", "deployment_id": deployment_id })))
}

pub async fn cancel(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
    body: web::Json<ActionRequest>,
) -> Result<HttpResponse, ApiError> {
    ctx.auth.require_operator(&req)?;
    let action = body.into_inner();
    let reason = action.reason.unwrap_or_else(|| "cancelled by operator".to_string());
    ctx.orchestrator.cancel(&action.deployment_id, &reason)?;
    Ok(HttpResponse::Ok().json(json!({
        "status": "cancelled",
        "deployment_id": action.deployment_id,
    })))
}

pub async fn reject(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
    body: web::Json<ActionRequest>,
) -> Result<HttpResponse, ApiError> {
    ctx.auth.require_operator(&req)?;
    let action = body.into_inner();
    let reason = action.reason.unwrap_or_else(|| "rejected by operator".to_string());
    ctx.orchestrator.reject(&action.deployment_id, &reason)?;
    Ok(HttpResponse::Ok().json(json!({
        "status": "rejected",
        "deployment_id": action.deployment_id,
    })))
}

pub async fn pause(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
    body: web::Json<ActionRequest>,
) -> Result<HttpResponse, ApiError> {
    ctx.auth.require_operator(&req)?;
    let action = body.into_inner();
    ctx.orchestrator.pause(&action.deployment_id)?;
    Ok(HttpResponse::Ok().json(json!({
        "status": "paused",
        "deployment_id": action.deployment_id,
    })))
}

pub async fn rollback(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
    body: web::Json<RollbackRequest>,
) -> Result<HttpResponse, ApiError> {
    ctx.auth.require_operator(&req)?;
    let request = body.into_inner();
    let deployment_id = request.deployment_id.clone();
    web::block(move || ctx.orchestrator.rollback(&request)).await??;
    Ok(HttpResponse::Ok().json(json!({
        "status": "rolling_back",
        "deployment_id": deployment_id,
    })))
}

pub async fn rollback_options(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    ctx.auth.require_operator(&req)?;
    let options = ctx.tracker.rollback_options()?;
    Ok(HttpResponse::Ok().json(options))
}

pub async fn rollback_proposals(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    ctx.auth.require_operator(&req)?;
    let proposals = ctx.orchestrator.rollback_proposals();
    Ok(HttpResponse::Ok().json(json!({
        "count": proposals.len(),
        "proposals": proposals,
    })))
}

pub async fn approve_rollback(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
    body: web::Json<ActionRequest>,
) -> Result<HttpResponse, ApiError> {
    ctx.auth.require_operator(&req)?;
    let action = body.into_inner();
    let deployment_id = action.deployment_id.clone();
    web::block(move || ctx.orchestrator.approve_rollback(&action.deployment_id)).await??;
    Ok(HttpResponse::Ok().json(json!({
        "status": "rollback_started",
        "deployment_id": deployment_id,
    })))
}
